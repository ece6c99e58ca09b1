//! V4L2 driver.
//!
//! Maps local `/dev/video*` capture nodes onto the driver traits:
//! - enumeration queries each node's capabilities (card → model, bus → serial)
//! - the configuration blob is the negotiated format and frame rate as JSON
//! - bounded and continuous acquisition use a memory-mapped buffer stream
//!
//! Retrieval blocks until the kernel delivers a buffer; the retrieve timeout
//! is not enforced by this driver. Device removal is detected when a capture
//! fails and the node has disappeared.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use ouroboros::self_referencing;
use serde::{Deserialize, Serialize};

use super::{
    ConfigBlob, Device, DeviceDriver, DeviceInfo, FeatureValue, GrabSender, LoadMode,
    RemovalCallback,
};
use crate::error::SessionError;
use crate::frame::{PixelFormat, RawFrame, RawGrab};

const DEFAULT_DEV_DIR: &str = "/dev";
const STREAM_BUFFERS: u32 = 4;

/// Driver over the V4L2 nodes of a device directory.
#[derive(Clone, Debug)]
pub struct V4l2Driver {
    dev_dir: PathBuf,
}

impl Default for V4l2Driver {
    fn default() -> Self {
        Self::new()
    }
}

impl V4l2Driver {
    pub fn new() -> Self {
        Self::with_dev_dir(DEFAULT_DEV_DIR)
    }

    pub fn with_dev_dir(dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            dev_dir: dev_dir.into(),
        }
    }

    fn probe(path: &Path) -> Result<Option<DeviceInfo>> {
        let device = v4l::Device::with_path(path)
            .with_context(|| format!("open v4l2 node {}", path.display()))?;
        let caps = device.query_caps().context("query v4l2 capabilities")?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Ok(None);
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Some(DeviceInfo {
            address: path.display().to_string(),
            serial: caps.bus,
            model: caps.card,
            name,
        }))
    }
}

impl DeviceDriver for V4l2Driver {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let entries = std::fs::read_dir(&self.dev_dir)
            .with_context(|| format!("list {}", self.dev_dir.display()))?;
        let mut nodes: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("video"))
            })
            .collect();
        nodes.sort();

        let mut devices = Vec::new();
        for node in nodes {
            match Self::probe(&node) {
                Ok(Some(info)) => devices.push(info),
                Ok(None) => {}
                Err(err) => log::debug!("V4l2Driver: skipping {}: {:#}", node.display(), err),
            }
        }
        Ok(devices)
    }

    fn connect(&self, info: &DeviceInfo) -> Result<Box<dyn Device>> {
        let path = PathBuf::from(&info.address);
        if !path.exists() {
            return Err(SessionError::NotFound(info.address.clone()).into());
        }
        Ok(Box::new(V4l2Device {
            info: info.clone(),
            path,
            handle: Handle::Closed,
            active: ActiveFormat::default(),
            removed: Arc::new(RemovalHook::default()),
        }))
    }
}

/// Format and frame rate, the contents of a V4L2 configuration blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct V4l2Settings {
    width: u32,
    height: u32,
    fourcc: String,
    fps: Option<u32>,
}

#[derive(Clone, Copy, Debug, Default)]
struct ActiveFormat {
    width: u32,
    height: u32,
    stride: usize,
    pixel_format: Option<PixelFormat>,
}

impl ActiveFormat {
    fn from_format(format: &v4l::Format) -> Self {
        Self {
            width: format.width,
            height: format.height,
            stride: format.stride as usize,
            pixel_format: format.fourcc.str().ok().and_then(pixel_format_of),
        }
    }

    fn frame(&self, data: &[u8], block_id: u64) -> Result<RawFrame> {
        let pixel_format = self
            .pixel_format
            .ok_or_else(|| SessionError::ConversionFailure("unsupported v4l2 fourcc".into()))?;
        let stride = self.stride.max(pixel_format.min_stride(self.width));
        Ok(RawFrame {
            width: self.width,
            height: self.height,
            stride,
            pixel_format,
            block_id,
            data: data.to_vec(),
        })
    }
}

fn pixel_format_of(fourcc: &str) -> Option<PixelFormat> {
    match fourcc {
        "GREY" => Some(PixelFormat::Mono8),
        "Y16 " => Some(PixelFormat::Mono16),
        "RGB3" => Some(PixelFormat::Rgb8),
        "BGR3" => Some(PixelFormat::Bgr8),
        "YUYV" => Some(PixelFormat::Yuyv),
        "NV12" => Some(PixelFormat::Nv12),
        "RGGB" => Some(PixelFormat::BayerRg8),
        "BA81" => Some(PixelFormat::BayerBg8),
        "GRBG" => Some(PixelFormat::BayerGr8),
        "GBRG" => Some(PixelFormat::BayerGb8),
        _ => None,
    }
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl DeviceV4l2State {
    /// Start streaming on `device`. On failure the device is handed back.
    fn start(device: v4l::Device) -> std::result::Result<Self, (anyhow::Error, v4l::Device)> {
        use v4l::buffer::Type;

        DeviceV4l2StateTryBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, STREAM_BUFFERS)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build_or_recover()
        .map_err(|(err, heads)| (err, heads.device))
    }

    fn next(&mut self, active: &ActiveFormat) -> Result<RawFrame> {
        use v4l::io::traits::CaptureStream;

        self.with_mut(|fields| {
            let (buf, meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let data = if used == 0 { buf } else { &buf[..used] };
            active.frame(data, u64::from(meta.sequence) + 1)
        })
    }

    fn finish(self) -> v4l::Device {
        self.into_heads().device
    }
}

struct ContinuousRun {
    stop: Arc<AtomicBool>,
    join: JoinHandle<Option<v4l::Device>>,
}

enum Handle {
    Closed,
    Idle(v4l::Device),
    Bounded {
        state: DeviceV4l2State,
        remaining: u32,
    },
    Continuous(ContinuousRun),
}

#[derive(Default)]
struct RemovalHook {
    fired: AtomicBool,
    callback: Mutex<Option<RemovalCallback>>,
}

impl RemovalHook {
    fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = self.callback.lock().ok().and_then(|mut c| c.take());
        if let Some(callback) = callback {
            callback();
        }
    }

    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

struct V4l2Device {
    info: DeviceInfo,
    path: PathBuf,
    handle: Handle,
    active: ActiveFormat,
    removed: Arc<RemovalHook>,
}

impl V4l2Device {
    fn idle_device(&self) -> Result<&v4l::Device> {
        match &self.handle {
            Handle::Idle(device) => Ok(device),
            Handle::Closed => Err(SessionError::NotOpen.into()),
            _ => bail!("{} is streaming", self.path.display()),
        }
    }

    fn read_settings(device: &v4l::Device) -> Result<V4l2Settings> {
        use v4l::video::Capture;

        let format = device.format().context("read v4l2 format")?;
        let fps = device
            .params()
            .ok()
            .filter(|p| p.interval.numerator > 0)
            .map(|p| p.interval.denominator / p.interval.numerator);
        Ok(V4l2Settings {
            width: format.width,
            height: format.height,
            fourcc: format
                .fourcc
                .str()
                .map(str::to_string)
                .map_err(|e| anyhow!("fourcc is not text: {}", e))?,
            fps,
        })
    }

    fn check_removed(&self, err: anyhow::Error) -> anyhow::Error {
        if !self.path.exists() {
            log::warn!("V4l2Driver: {} disappeared", self.path.display());
            self.removed.fire();
        }
        err
    }
}

impl Device for V4l2Device {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn open(&mut self) -> Result<()> {
        use v4l::video::Capture;

        if !matches!(self.handle, Handle::Closed) {
            return Ok(());
        }
        let device = v4l::Device::with_path(&self.path)
            .with_context(|| format!("open v4l2 device {}", self.path.display()))?;
        let format = device.format().context("read v4l2 format")?;
        self.active = ActiveFormat::from_format(&format);
        self.handle = Handle::Idle(device);
        log::info!(
            "V4l2Driver: opened {} ({}x{})",
            self.path.display(),
            self.active.width,
            self.active.height
        );
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        self.handle = Handle::Closed;
        Ok(())
    }

    fn is_open(&self) -> bool {
        !matches!(self.handle, Handle::Closed) && !self.removed.has_fired()
    }

    fn start_continuous(&mut self, sender: GrabSender) -> Result<()> {
        let device = match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Idle(device) => device,
            other => {
                self.handle = other;
                bail!("{} is not idle", self.path.display());
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_thread = stop.clone();
        let active = self.active;
        let removed = self.removed.clone();
        let path = self.path.clone();
        let join = thread::Builder::new()
            .name("v4l2-grab".to_string())
            .spawn(move || {
                let mut state = match DeviceV4l2State::start(device) {
                    Ok(state) => state,
                    Err((err, device)) => {
                        let _ = sender.send(RawGrab::failed(format!("{:#}", err)));
                        return Some(device);
                    }
                };
                while !stop_thread.load(Ordering::SeqCst) {
                    let grab = match state.next(&active) {
                        Ok(frame) => RawGrab::success(frame),
                        Err(err) => {
                            if !path.exists() {
                                removed.fire();
                                return None;
                            }
                            RawGrab::failed(format!("{:#}", err))
                        }
                    };
                    if sender.send(grab).is_err() {
                        break;
                    }
                }
                Some(state.finish())
            })
            .context("spawn v4l2 grab thread")?;

        self.handle = Handle::Continuous(ContinuousRun { stop, join });
        Ok(())
    }

    fn start_bounded(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            bail!("bounded grab needs at least one frame");
        }
        let device = match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Idle(device) => device,
            other => {
                self.handle = other;
                bail!("{} is not idle", self.path.display());
            }
        };
        match DeviceV4l2State::start(device) {
            Ok(state) => {
                self.handle = Handle::Bounded {
                    state,
                    remaining: count,
                };
                Ok(())
            }
            Err((err, device)) => {
                self.handle = Handle::Idle(device);
                Err(err)
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.handle, Handle::Closed) {
            Handle::Bounded { state, .. } => {
                self.handle = Handle::Idle(state.finish());
            }
            Handle::Continuous(run) => {
                run.stop.store(true, Ordering::SeqCst);
                let device = run
                    .join
                    .join()
                    .map_err(|_| anyhow!("v4l2 grab thread panicked"))?;
                if let Some(device) = device {
                    self.handle = Handle::Idle(device);
                }
            }
            other => self.handle = other,
        }
        Ok(())
    }

    fn is_grabbing(&self) -> bool {
        !self.removed.has_fired()
            && matches!(self.handle, Handle::Bounded { .. } | Handle::Continuous(_))
    }

    fn retrieve(&mut self, _timeout: Duration) -> Result<RawGrab> {
        let Handle::Bounded { state, remaining } = &mut self.handle else {
            bail!("{} has no bounded grab in progress", self.path.display());
        };
        let result = state.next(&self.active);
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.stop()?;
        }
        match result {
            Ok(frame) => Ok(RawGrab::success(frame)),
            Err(err) => {
                let err = self.check_removed(err);
                if self.removed.has_fired() {
                    return Err(err);
                }
                Ok(RawGrab::failed(format!("{:#}", err)))
            }
        }
    }

    fn save_config(&self) -> Result<ConfigBlob> {
        let settings = Self::read_settings(self.idle_device()?)?;
        let bytes = serde_json::to_vec_pretty(&settings).context("serialize v4l2 settings")?;
        Ok(ConfigBlob::new(bytes))
    }

    fn load_config(&mut self, blob: &ConfigBlob, mode: LoadMode) -> Result<()> {
        use v4l::video::Capture;

        let wanted: V4l2Settings = serde_json::from_slice(blob.as_bytes())
            .map_err(|e| anyhow!("invalid v4l2 configuration blob: {}", e))?;
        let fourcc: [u8; 4] = wanted
            .fourcc
            .as_bytes()
            .try_into()
            .map_err(|_| anyhow!("fourcc '{}' is not four bytes", wanted.fourcc))?;

        let device = self.idle_device()?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = wanted.width;
        format.height = wanted.height;
        format.fourcc = v4l::FourCC::new(&fourcc);
        let applied = device.set_format(&format).context("set v4l2 format")?;

        let mut mismatches = Vec::new();
        if (applied.width, applied.height) != (wanted.width, wanted.height) {
            mismatches.push(format!(
                "size {}x{} became {}x{}",
                wanted.width, wanted.height, applied.width, applied.height
            ));
        }
        if applied.fourcc != format.fourcc {
            mismatches.push(format!("fourcc {} rejected", wanted.fourcc));
        }
        if let Some(fps) = wanted.fps.filter(|fps| *fps > 0) {
            let params = v4l::video::capture::Parameters::with_fps(fps);
            if let Err(err) = device.set_params(&params) {
                mismatches.push(format!("fps {}: {}", fps, err));
            }
        }
        self.active = ActiveFormat::from_format(&applied);

        if mismatches.is_empty() {
            return Ok(());
        }
        match mode {
            LoadMode::Strict => bail!("load v4l2 configuration: {}", mismatches.join(", ")),
            LoadMode::Lenient => {
                for mismatch in mismatches {
                    log::warn!("V4l2Driver: {}: {}", self.path.display(), mismatch);
                }
                Ok(())
            }
        }
    }

    fn on_removed(&mut self, callback: RemovalCallback) {
        if let Ok(mut slot) = self.removed.callback.lock() {
            *slot = Some(callback);
        }
    }

    fn set_feature(&mut self, name: &str, _value: FeatureValue) -> Result<()> {
        Err(SessionError::DriverError(format!("v4l2 driver has no feature {}", name)).into())
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("V4l2Driver: stop on drop failed: {:#}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_mapping_covers_supported_formats() {
        assert_eq!(pixel_format_of("YUYV"), Some(PixelFormat::Yuyv));
        assert_eq!(pixel_format_of("RGGB"), Some(PixelFormat::BayerRg8));
        assert_eq!(pixel_format_of("MJPG"), None);
    }

    #[test]
    fn missing_dev_dir_is_an_enumeration_error() {
        let driver = V4l2Driver::with_dev_dir("/nonexistent/camera-session-dev");
        assert!(driver.enumerate().is_err());
    }

    #[test]
    fn settings_blob_round_trips() -> Result<()> {
        let settings = V4l2Settings {
            width: 640,
            height: 480,
            fourcc: "YUYV".into(),
            fps: Some(30),
        };
        let parsed: V4l2Settings = serde_json::from_slice(&serde_json::to_vec(&settings)?)?;
        assert_eq!(parsed, settings);
        Ok(())
    }
}
