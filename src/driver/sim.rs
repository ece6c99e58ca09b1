//! Simulated camera driver.
//!
//! `SimulatedDriver` stands in for a vendor SDK in tests, demos and headless
//! setups. Each simulated camera:
//! - produces synthetic frames in a configurable raw pixel format
//! - keeps a JSON feature set that serves as its configuration blob
//! - can fail every n-th grab, or refuse to open
//! - can be unplugged and replugged, firing the device-removed callback
//!
//! Driver clones share the same simulated bus, so a test can keep a clone to
//! unplug a camera that a session has open.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};

use super::{
    ConfigBlob, Device, DeviceDriver, DeviceInfo, FeatureValue, GrabSender, LoadMode,
    RemovalCallback,
};
use crate::error::SessionError;
use crate::frame::{PixelFormat, RawFrame, RawGrab};

const MAX_DIMENSION: u64 = 8192;
const READ_ONLY_FEATURES: &[&str] = &["DeviceModelName", "DeviceSerialNumber"];
const COMMAND_FEATURES: &[&str] = &["UserSetLoad", "TriggerSoftware"];

/// Description of one simulated camera.
#[derive(Clone, Debug)]
pub struct SimCameraSpec {
    pub info: DeviceInfo,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Time between frames; also the latency of a bounded retrieve.
    pub frame_interval: Duration,
    /// Every n-th grab is delivered as unsuccessful (0 = never).
    pub fail_every: u64,
    /// When set, `open` fails with this message.
    pub open_error: Option<String>,
}

impl SimCameraSpec {
    pub fn new(serial: &str, address: &str, model: &str) -> Self {
        Self {
            info: DeviceInfo {
                address: address.to_string(),
                serial: serial.to_string(),
                model: model.to_string(),
                name: format!("sim-{}", serial),
            },
            width: 64,
            height: 48,
            pixel_format: PixelFormat::BayerRg8,
            frame_interval: Duration::from_millis(2),
            fail_every: 0,
            open_error: None,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.info.name = name.to_string();
        self
    }

    pub fn with_geometry(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_pixel_format(mut self, pixel_format: PixelFormat) -> Self {
        self.pixel_format = pixel_format;
        self
    }

    pub fn with_frame_interval(mut self, frame_interval: Duration) -> Self {
        self.frame_interval = frame_interval;
        self
    }

    pub fn with_fail_every(mut self, fail_every: u64) -> Self {
        self.fail_every = fail_every;
        self
    }

    pub fn with_open_error(mut self, message: &str) -> Self {
        self.open_error = Some(message.to_string());
        self
    }

    fn default_features(&self) -> BTreeMap<String, Value> {
        let mut features = BTreeMap::new();
        features.insert("DeviceModelName".into(), json!(self.info.model));
        features.insert("DeviceSerialNumber".into(), json!(self.info.serial));
        features.insert("DeviceUserID".into(), json!(self.info.name));
        features.insert("Width".into(), json!(self.width));
        features.insert("Height".into(), json!(self.height));
        features.insert("PixelFormat".into(), json!(self.pixel_format.name()));
        features.insert("ExposureTime".into(), json!(10_000.0));
        features.insert("Gain".into(), json!(0.0));
        features.insert("TriggerMode".into(), json!("Off"));
        features.insert("TriggerSource".into(), json!("Line1"));
        features.insert("LineSelector".into(), json!("Line2"));
        features.insert("LineSource".into(), json!("Off"));
        features.insert("UserOutputValue".into(), json!(false));
        features.insert("UserSetSelector".into(), json!("Default"));
        features
    }
}

/// Shared simulated bus.
#[derive(Clone, Default)]
pub struct SimulatedDriver {
    bus: Arc<Mutex<Vec<SimSlot>>>,
}

struct SimSlot {
    spec: SimCameraSpec,
    present: bool,
    features: Arc<Mutex<BTreeMap<String, Value>>>,
    links: Vec<Weak<Link>>,
}

/// Connection between a slot and one device handle; carries the removal hook.
struct Link {
    removed: AtomicBool,
    callback: Mutex<Option<RemovalCallback>>,
}

impl Link {
    fn new() -> Self {
        Self {
            removed: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn fire(&self) {
        if self.removed.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = match self.callback.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl SimulatedDriver {
    pub fn new(specs: Vec<SimCameraSpec>) -> Self {
        let driver = Self::default();
        for spec in specs {
            driver.add_device(spec);
        }
        driver
    }

    pub fn add_device(&self, spec: SimCameraSpec) {
        let features = Arc::new(Mutex::new(spec.default_features()));
        if let Ok(mut bus) = self.bus.lock() {
            bus.push(SimSlot {
                spec,
                present: true,
                features,
                links: Vec::new(),
            });
        }
    }

    /// Remove a camera from the bus, notifying every open handle.
    ///
    /// Returns false when no present camera has this serial.
    pub fn unplug(&self, serial: &str) -> bool {
        let links: Vec<Arc<Link>> = {
            let Ok(mut bus) = self.bus.lock() else {
                return false;
            };
            let Some(slot) = bus.iter_mut().find(|s| s.spec.info.serial == serial && s.present)
            else {
                return false;
            };
            slot.present = false;
            let links = slot.links.iter().filter_map(Weak::upgrade).collect();
            slot.links.clear();
            links
        };
        log::info!("SimulatedDriver: camera {} unplugged", serial);
        for link in links {
            link.fire();
        }
        true
    }

    /// Put an unplugged camera back on the bus. Its feature state survives.
    pub fn replug(&self, serial: &str) -> bool {
        let Ok(mut bus) = self.bus.lock() else {
            return false;
        };
        match bus.iter_mut().find(|s| s.spec.info.serial == serial) {
            Some(slot) => {
                slot.present = true;
                log::info!("SimulatedDriver: camera {} replugged", serial);
                true
            }
            None => false,
        }
    }

    /// Current value of a feature, for inspection.
    pub fn feature(&self, serial: &str, name: &str) -> Option<Value> {
        let bus = self.bus.lock().ok()?;
        let slot = bus.iter().find(|s| s.spec.info.serial == serial)?;
        let features = slot.features.lock().ok()?;
        features.get(name).cloned()
    }

    fn lock_bus(&self) -> Result<MutexGuard<'_, Vec<SimSlot>>> {
        self.bus
            .lock()
            .map_err(|_| anyhow!("simulated bus lock poisoned"))
    }
}

impl DeviceDriver for SimulatedDriver {
    fn name(&self) -> &'static str {
        "sim"
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let bus = self.lock_bus()?;
        Ok(bus
            .iter()
            .filter(|slot| slot.present)
            .map(|slot| slot.spec.info.clone())
            .collect())
    }

    fn connect(&self, info: &DeviceInfo) -> Result<Box<dyn Device>> {
        let mut bus = self.lock_bus()?;
        let slot = bus
            .iter_mut()
            .find(|s| s.spec.info.serial == info.serial && s.present)
            .ok_or_else(|| SessionError::NotFound(format!("serial={}", info.serial)))?;

        let link = Arc::new(Link::new());
        slot.links.retain(|l| l.strong_count() > 0);
        slot.links.push(Arc::downgrade(&link));

        Ok(Box::new(SimDevice {
            info: slot.spec.info.clone(),
            spec: slot.spec.clone(),
            features: slot.features.clone(),
            link,
            is_open: false,
            bounded_remaining: None,
            grab_counter: Arc::new(AtomicU64::new(0)),
            continuous: None,
        }))
    }
}

struct ContinuousRun {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

struct SimDevice {
    info: DeviceInfo,
    spec: SimCameraSpec,
    features: Arc<Mutex<BTreeMap<String, Value>>>,
    link: Arc<Link>,
    is_open: bool,
    bounded_remaining: Option<u32>,
    grab_counter: Arc<AtomicU64>,
    continuous: Option<ContinuousRun>,
}

impl SimDevice {
    fn ensure_usable(&self) -> Result<()> {
        if self.link.is_removed() {
            bail!("device {} removed", self.info.serial);
        }
        if !self.is_open {
            bail!("device {} not open", self.info.serial);
        }
        Ok(())
    }

    fn lock_features(&self) -> Result<MutexGuard<'_, BTreeMap<String, Value>>> {
        self.features
            .lock()
            .map_err(|_| anyhow!("feature map lock poisoned"))
    }

    fn write_feature(&mut self, name: &str, value: Value) -> Result<()> {
        validate_feature(name, &value)?;
        if self.is_grabbing() && matches!(name, "Width" | "Height" | "PixelFormat") {
            bail!("{} is not writable while grabbing", name);
        }
        let mut features = self.lock_features()?;
        features.insert(name.to_string(), value);
        Ok(())
    }
}

impl Device for SimDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> Result<()> {
        if self.link.is_removed() {
            bail!("device {} removed", self.info.serial);
        }
        if let Some(message) = &self.spec.open_error {
            bail!("{}", message);
        }
        self.is_open = true;
        log::debug!("SimulatedDriver: opened {}", self.info.serial);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        self.is_open = false;
        log::debug!("SimulatedDriver: closed {}", self.info.serial);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.is_open && !self.link.is_removed()
    }

    fn start_continuous(&mut self, sender: GrabSender) -> Result<()> {
        self.ensure_usable()?;
        if self.is_grabbing() {
            bail!("device {} already grabbing", self.info.serial);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let producer = Producer {
            spec: self.spec.clone(),
            features: self.features.clone(),
            counter: self.grab_counter.clone(),
        };
        let link = self.link.clone();
        let stop_thread = stop.clone();
        let interval = self.spec.frame_interval;
        let join = thread::Builder::new()
            .name(format!("sim-grab-{}", self.info.serial))
            .spawn(move || {
                while !stop_thread.load(Ordering::SeqCst) && !link.is_removed() {
                    thread::sleep(interval);
                    let grab = match producer.next_grab() {
                        Ok(grab) => grab,
                        Err(err) => RawGrab::failed(err.to_string()),
                    };
                    if sender.send(grab).is_err() {
                        break;
                    }
                }
            })
            .context("spawn simulated grab thread")?;

        self.continuous = Some(ContinuousRun { stop, join });
        Ok(())
    }

    fn start_bounded(&mut self, count: u32) -> Result<()> {
        self.ensure_usable()?;
        if count == 0 {
            bail!("bounded grab needs at least one frame");
        }
        if self.is_grabbing() {
            bail!("device {} already grabbing", self.info.serial);
        }
        self.bounded_remaining = Some(count);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.bounded_remaining = None;
        if let Some(run) = self.continuous.take() {
            run.stop.store(true, Ordering::SeqCst);
            run.join
                .join()
                .map_err(|_| anyhow!("simulated grab thread panicked"))?;
        }
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        !self.link.is_removed()
            && (self.bounded_remaining.is_some() || self.continuous.is_some())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<RawGrab> {
        self.ensure_usable()?;
        let Some(remaining) = self.bounded_remaining else {
            bail!("device {} has no bounded grab in progress", self.info.serial);
        };
        if self.spec.frame_interval > timeout {
            thread::sleep(timeout);
            return Ok(RawGrab::timed_out());
        }
        thread::sleep(self.spec.frame_interval);

        self.bounded_remaining = if remaining > 1 {
            Some(remaining - 1)
        } else {
            None
        };
        let producer = Producer {
            spec: self.spec.clone(),
            features: self.features.clone(),
            counter: self.grab_counter.clone(),
        };
        producer.next_grab()
    }

    fn save_config(&self) -> Result<ConfigBlob> {
        if self.link.is_removed() {
            bail!("device {} removed", self.info.serial);
        }
        let all = self.lock_features()?;
        let features: BTreeMap<&String, &Value> = all
            .iter()
            .filter(|(name, _)| !READ_ONLY_FEATURES.contains(&name.as_str()))
            .collect();
        let bytes = serde_json::to_vec_pretty(&features).context("serialize feature set")?;
        Ok(ConfigBlob::new(bytes))
    }

    fn load_config(&mut self, blob: &ConfigBlob, mode: LoadMode) -> Result<()> {
        self.ensure_usable()?;
        let parsed: BTreeMap<String, Value> = serde_json::from_slice(blob.as_bytes())
            .map_err(|e| anyhow!("invalid configuration blob: {}", e))?;

        for (name, value) in parsed {
            let current = self.lock_features()?.get(&name).cloned();
            if current.as_ref() == Some(&value) {
                continue;
            }
            let result = if READ_ONLY_FEATURES.contains(&name.as_str()) {
                Err(anyhow!("{} is read-only", name))
            } else {
                self.write_feature(&name, value)
            };
            match (result, mode) {
                (Ok(()), _) => {}
                (Err(err), LoadMode::Strict) => return Err(err.context("load configuration")),
                (Err(err), LoadMode::Lenient) => {
                    log::warn!("SimulatedDriver: skipping feature {}: {}", name, err);
                }
            }
        }
        Ok(())
    }

    fn on_removed(&mut self, callback: RemovalCallback) {
        if let Ok(mut slot) = self.link.callback.lock() {
            *slot = Some(callback);
        }
    }

    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<()> {
        self.ensure_usable()?;
        if READ_ONLY_FEATURES.contains(&name) {
            bail!("{} is read-only", name);
        }
        let json_value = match value {
            FeatureValue::Bool(v) => json!(v),
            FeatureValue::Int(v) => json!(v),
            FeatureValue::Float(v) => json!(v),
            FeatureValue::Enum(v) => json!(v),
            FeatureValue::Command => return self.execute(name),
        };
        self.write_feature(name, json_value)
    }
}

impl SimDevice {
    fn execute(&mut self, command: &str) -> Result<()> {
        if !COMMAND_FEATURES.contains(&command) {
            bail!("unknown command feature {}", command);
        }
        if command == "UserSetLoad" {
            let selector = self
                .lock_features()?
                .get("UserSetSelector")
                .and_then(Value::as_str)
                .unwrap_or("Default")
                .to_string();
            if selector == "Default" {
                if self.is_grabbing() {
                    bail!("UserSetLoad is not executable while grabbing");
                }
                let defaults = self.spec.default_features();
                *self.lock_features()? = defaults;
            }
            log::info!(
                "SimulatedDriver: {} loaded user set {}",
                self.info.serial,
                selector
            );
        }
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("SimulatedDriver: stop on drop failed: {}", err);
        }
    }
}

fn validate_feature(name: &str, value: &Value) -> Result<()> {
    let valid = match name {
        "Width" | "Height" => value
            .as_u64()
            .is_some_and(|v| v > 0 && v <= MAX_DIMENSION),
        "PixelFormat" => value
            .as_str()
            .is_some_and(|v| v.parse::<PixelFormat>().is_ok()),
        "ExposureTime" | "Gain" => value.as_f64().is_some_and(|v| v >= 0.0),
        "TriggerMode" => matches!(value.as_str(), Some("On") | Some("Off")),
        "UserOutputValue" => value.is_boolean(),
        "TriggerSource" | "LineSelector" | "LineSource" | "UserSetSelector"
        | "DeviceUserID" => value.is_string(),
        other => bail!("unknown feature {}", other),
    };
    if !valid {
        bail!("invalid value {} for feature {}", value, name);
    }
    Ok(())
}

/// Builds synthetic grabs from the current feature state.
struct Producer {
    spec: SimCameraSpec,
    features: Arc<Mutex<BTreeMap<String, Value>>>,
    counter: Arc<AtomicU64>,
}

impl Producer {
    fn next_grab(&self) -> Result<RawGrab> {
        let block_id = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        if self.spec.fail_every > 0 && block_id % self.spec.fail_every == 0 {
            return Ok(RawGrab::failed(format!(
                "block {}: buffer incompletely grabbed",
                block_id
            )));
        }

        let (width, height, pixel_format) = {
            let features = self
                .features
                .lock()
                .map_err(|_| anyhow!("feature map lock poisoned"))?;
            let width = features.get("Width").and_then(Value::as_u64).unwrap_or(0) as u32;
            let height = features.get("Height").and_then(Value::as_u64).unwrap_or(0) as u32;
            let pixel_format = features
                .get("PixelFormat")
                .and_then(Value::as_str)
                .map(str::parse::<PixelFormat>)
                .transpose()?
                .unwrap_or(self.spec.pixel_format);
            (width, height, pixel_format)
        };

        Ok(RawGrab::success(synthetic_frame(
            width,
            height,
            pixel_format,
            block_id,
        )))
    }
}

/// Moving gradient in the requested layout.
fn synthetic_frame(width: u32, height: u32, pixel_format: PixelFormat, block_id: u64) -> RawFrame {
    let stride = pixel_format.min_stride(width);
    let len = pixel_format.buffer_len(stride, height);
    let mut data = vec![0u8; len];
    let w = width as usize;
    let h = height as usize;
    let shade = |x: usize, y: usize| ((x + y + block_id as usize) % 256) as u8;

    match pixel_format {
        PixelFormat::Mono16 => {
            for y in 0..h {
                for x in 0..w {
                    let v = (shade(x, y) as u16) << 8;
                    let o = y * stride + x * 2;
                    data[o..o + 2].copy_from_slice(&v.to_le_bytes());
                }
            }
        }
        PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
            for y in 0..h {
                for x in 0..w {
                    let o = y * stride + x * 3;
                    data[o] = shade(x, y);
                    data[o + 1] = shade(x * 2, y);
                    data[o + 2] = shade(x, y * 2);
                }
            }
        }
        PixelFormat::Yuyv => {
            for y in 0..h {
                for x in 0..w {
                    let pair = y * stride + (x / 2) * 4;
                    data[pair + if x % 2 == 0 { 0 } else { 2 }] = shade(x, y);
                    data[pair + 1] = 128;
                    if pair + 3 < data.len() {
                        data[pair + 3] = 128;
                    }
                }
            }
        }
        PixelFormat::Nv12 => {
            for y in 0..h {
                for x in 0..w {
                    data[y * stride + x] = shade(x, y);
                }
            }
            for v in &mut data[stride * h..] {
                *v = 128;
            }
        }
        PixelFormat::Mono8
        | PixelFormat::BayerRg8
        | PixelFormat::BayerBg8
        | PixelFormat::BayerGr8
        | PixelFormat::BayerGb8 => {
            for y in 0..h {
                for x in 0..w {
                    data[y * stride + x] = shade(x, y);
                }
            }
        }
    }

    RawFrame {
        width,
        height,
        stride,
        pixel_format,
        block_id,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert;
    use std::sync::mpsc;

    fn driver() -> SimulatedDriver {
        SimulatedDriver::new(vec![
            SimCameraSpec::new("A", "10.0.0.1", "acA640-90gc"),
            SimCameraSpec::new("B", "10.0.0.2", "acA1300-30gm")
                .with_pixel_format(PixelFormat::Mono8)
                .with_geometry(32, 16),
        ])
    }

    fn open(driver: &SimulatedDriver, serial: &str) -> Result<Box<dyn Device>> {
        let info = driver
            .enumerate()?
            .into_iter()
            .find(|d| d.serial == serial)
            .context("enumerated")?;
        let mut device = driver.connect(&info)?;
        device.open()?;
        Ok(device)
    }

    #[test]
    fn bounded_sequence_exhausts() -> Result<()> {
        let driver = driver();
        let mut device = open(&driver, "B")?;
        device.start_bounded(2)?;
        let first = device.retrieve(Duration::from_secs(1))?;
        assert!(first.succeeded);
        assert!(device.is_grabbing());
        let second = device.retrieve(Duration::from_secs(1))?;
        assert!(second.succeeded);
        assert!(!device.is_grabbing());
        assert!(device.retrieve(Duration::from_secs(1)).is_err());
        Ok(())
    }

    #[test]
    fn synthetic_frames_convert() -> Result<()> {
        for format in [
            PixelFormat::Mono16,
            PixelFormat::Rgb8,
            PixelFormat::Yuyv,
            PixelFormat::Nv12,
            PixelFormat::BayerGb8,
        ] {
            let raw = synthetic_frame(6, 5, format, 1);
            let rgb = convert::to_rgb(&raw)?;
            assert_eq!(rgb.size(), (6, 5));
            assert!(rgb.is_valid());
        }
        Ok(())
    }

    #[test]
    fn fail_every_marks_grabs_unsuccessful() -> Result<()> {
        let driver = SimulatedDriver::new(vec![
            SimCameraSpec::new("F", "10.0.0.9", "flaky").with_fail_every(2)
        ]);
        let mut device = open(&driver, "F")?;
        device.start_bounded(4)?;
        let results: Vec<bool> = (0..4)
            .map(|_| device.retrieve(Duration::from_secs(1)).map(|g| g.succeeded))
            .collect::<Result<_>>()?;
        assert_eq!(results, vec![true, false, true, false]);
        Ok(())
    }

    #[test]
    fn config_round_trip_preserves_geometry() -> Result<()> {
        let driver = driver();
        let mut device = open(&driver, "A")?;
        let saved = device.save_config()?;
        device.set_feature("Width", FeatureValue::Int(16))?;
        device.load_config(&saved, LoadMode::Strict)?;
        assert_eq!(driver.feature("A", "Width"), Some(json!(64)));
        Ok(())
    }

    #[test]
    fn snapshot_leaves_out_identity_and_loads_onto_another_camera() -> Result<()> {
        let driver = driver();
        let saved = open(&driver, "A")?.save_config()?;
        let features: BTreeMap<String, Value> = serde_json::from_slice(saved.as_bytes())?;
        assert!(!features.contains_key("DeviceModelName"));
        assert!(!features.contains_key("DeviceSerialNumber"));

        let mut other = open(&driver, "B")?;
        other.load_config(&saved, LoadMode::Strict)?;
        assert_eq!(driver.feature("B", "DeviceSerialNumber"), Some(json!("B")));
        Ok(())
    }

    #[test]
    fn strict_load_rejects_unknown_features() -> Result<()> {
        let driver = driver();
        let mut device = open(&driver, "A")?;
        let blob = ConfigBlob::from(r#"{"Width": 32, "Sharpness": 3}"#);
        assert!(device.load_config(&blob, LoadMode::Strict).is_err());
        device.load_config(&blob, LoadMode::Lenient)?;
        assert_eq!(driver.feature("A", "Width"), Some(json!(32)));
        Ok(())
    }

    #[test]
    fn geometry_is_locked_while_grabbing() -> Result<()> {
        let driver = driver();
        let mut device = open(&driver, "A")?;
        device.start_bounded(3)?;
        assert!(device.set_feature("Height", FeatureValue::Int(8)).is_err());
        device.set_feature("Gain", FeatureValue::Float(2.5))?;
        device.stop()?;
        device.set_feature("Height", FeatureValue::Int(8))?;
        Ok(())
    }

    #[test]
    fn continuous_delivery_stops_on_request() -> Result<()> {
        let driver = driver();
        let mut device = open(&driver, "B")?;
        let (tx, rx) = mpsc::sync_channel(2);
        device.start_continuous(tx)?;
        let grab = rx.recv_timeout(Duration::from_secs(2))?;
        assert!(grab.succeeded);
        device.stop()?;
        assert!(!device.is_grabbing());
        // producer dropped its sender
        while rx.recv_timeout(Duration::from_secs(2)).is_ok() {}
        Ok(())
    }

    #[test]
    fn unplug_fires_removal_once() -> Result<()> {
        let driver = driver();
        let mut device = open(&driver, "A")?;
        let (tx, rx) = mpsc::channel();
        device.on_removed(Box::new(move || {
            let _ = tx.send(());
        }));

        assert!(driver.unplug("A"));
        assert!(!driver.unplug("A"));
        rx.recv_timeout(Duration::from_secs(1))?;
        assert!(rx.try_recv().is_err());
        assert!(!device.is_open());
        assert!(driver.enumerate()?.iter().all(|d| d.serial != "A"));

        assert!(driver.replug("A"));
        assert!(open(&driver, "A").is_ok());
        Ok(())
    }
}
