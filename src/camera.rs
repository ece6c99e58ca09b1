//! Camera session controller.
//!
//! `Camera` owns the device handle and every piece of mutable session state
//! behind one mutex. Acquisition goes through the `AcquisitionPump`, frames
//! reach the sink through the shared `RenderDispatcher`, and observers follow
//! state changes through the `Notifier`.
//!
//! Threads:
//! - control: callers of `Camera`, holding the session lock per operation
//! - supervisor: consumes device-removal events and tears the session down
//! - capture worker: one per background capture, locks the session per burst
//!
//! Lock order is session, then dispatcher, then notifier.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::driver::{
    ConfigBlob, Device, DeviceDriver, DeviceInfo, FeatureValue, LoadMode, RemovalCallback,
};
use crate::error::SessionError;
use crate::frame::{Frame, SurfaceFormat};
use crate::notify::{Notification, NotificationKind, Notifier};
use crate::pump::{AcquisitionPump, PumpStats, DEFAULT_RETRIEVE_TIMEOUT};
use crate::render::{RenderDispatcher, RenderStats};
use crate::sink::FrameSink;

/// Bursts in a row that may come back empty before a capture gives up.
pub const MAX_EMPTY_BURSTS: u32 = 5;

/// Runtime settings of a session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcquisitionSettings {
    /// Wait per retrieval in synchronous grabs.
    pub retrieve_timeout: Duration,
    /// Pixel format negotiated with the sink.
    pub surface_format: SurfaceFormat,
    pub max_empty_bursts: u32,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            retrieve_timeout: DEFAULT_RETRIEVE_TIMEOUT,
            surface_format: SurfaceFormat::default(),
            max_empty_bursts: MAX_EMPTY_BURSTS,
        }
    }
}

/// Which enumerated device a session binds to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selector {
    IpAddress(String),
    Serial(String),
}

impl Selector {
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        match self {
            Selector::IpAddress(address) => info.address == *address,
            Selector::Serial(serial) => info.serial == *serial,
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::IpAddress(address) => write!(f, "ip={}", address),
            Selector::Serial(serial) => write!(f, "serial={}", serial),
        }
    }
}

/// Parameters of one `Camera::capture` call.
#[derive(Clone, Debug, Default)]
pub struct CaptureRequest {
    /// 0 grabs one frame synchronously; N > 0 runs in the background.
    pub frame_count: u32,
    /// Applied (strict) instead of the live config for this capture.
    pub config: Option<ConfigBlob>,
    /// When false every burst ends after its first successful frame.
    pub keep_grabbing: bool,
}

impl CaptureRequest {
    pub fn single() -> Self {
        Self::default()
    }

    pub fn frames(frame_count: u32) -> Self {
        Self {
            frame_count,
            config: None,
            keep_grabbing: true,
        }
    }

    pub fn with_config(mut self, config: ConfigBlob) -> Self {
        self.config = Some(config);
        self
    }

    pub fn keep_grabbing(mut self, keep_grabbing: bool) -> Self {
        self.keep_grabbing = keep_grabbing;
        self
    }
}

/// Outcome of `Camera::capture`.
#[derive(Debug)]
pub enum Capture {
    /// Synchronous shot; `None` when the grab timed out.
    Single(Option<Frame>),
    Background(CaptureJob),
}

/// Handle to a background capture.
#[derive(Debug)]
pub struct CaptureJob {
    requested: u32,
    join: JoinHandle<Result<Vec<Frame>>>,
}

impl CaptureJob {
    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Block until the worker is done and return every frame in arrival
    /// order. Fewer than requested when the capture gave up early.
    pub fn wait(self) -> Result<Vec<Frame>> {
        self.join
            .join()
            .map_err(|_| anyhow!("capture worker panicked"))?
    }
}

/// Counters of the current session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CameraStats {
    pub pump: PumpStats,
    pub render: RenderStats,
}

enum SessionEvent {
    DeviceRemoved { generation: u64 },
    Shutdown,
}

struct Session {
    selector: Option<Selector>,
    device: Option<Box<dyn Device>>,
    pump: AcquisitionPump,
    start_requested: bool,
    /// `save_config` of the pending start, reused when a sink promotes it.
    start_save_config: bool,
    name: String,
    device_type: String,
    serial: String,
    last_error: Option<SessionError>,
    /// Set through `Camera::set_config`; applies to whichever device is open.
    live_config: Option<ConfigBlob>,
    /// Snapshots taken by `open(true)`, by serial.
    saved_configs: HashMap<String, ConfigBlob>,
    /// First snapshot of each device seen, by serial.
    originals: HashMap<String, ConfigBlob>,
    /// Bumped on every successful open; removal events carry the value they
    /// were registered with.
    generation: u64,
}

impl Session {
    fn is_open(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.is_open())
    }

    fn is_grabbing(&self) -> bool {
        self.is_open() && self.device.as_ref().is_some_and(|d| d.is_grabbing())
    }

    fn effective_live_config(&self) -> Option<&ConfigBlob> {
        self.live_config
            .as_ref()
            .or_else(|| self.saved_configs.get(&self.serial))
    }
}

struct Shared {
    driver: Box<dyn DeviceDriver>,
    settings: AcquisitionSettings,
    session: Mutex<Session>,
    dispatcher: Arc<RenderDispatcher>,
    notifier: Notifier,
    events: Mutex<Sender<SessionEvent>>,
}

pub struct Camera {
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl Camera {
    pub fn new(driver: Box<dyn DeviceDriver>, settings: AcquisitionSettings) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            driver,
            session: Mutex::new(Session {
                selector: None,
                device: None,
                pump: AcquisitionPump::new(settings.retrieve_timeout),
                start_requested: false,
                start_save_config: false,
                name: String::new(),
                device_type: String::new(),
                serial: String::new(),
                last_error: None,
                live_config: None,
                saved_configs: HashMap::new(),
                originals: HashMap::new(),
                generation: 0,
            }),
            dispatcher: Arc::new(RenderDispatcher::new(settings.surface_format)),
            notifier: Notifier::new(),
            events: Mutex::new(tx),
            settings,
        });

        let weak = Arc::downgrade(&shared);
        let supervisor = thread::Builder::new()
            .name("camera-supervisor".to_string())
            .spawn(move || supervise(weak, rx))
            .context("spawn camera supervisor")?;

        Ok(Self {
            shared,
            supervisor: Some(supervisor),
        })
    }

    pub fn set_ip_address(&self, address: &str) {
        self.set_selector(Selector::IpAddress(address.to_string()));
    }

    pub fn set_serial_number(&self, serial: &str) {
        self.set_selector(Selector::Serial(serial.to_string()));
    }

    /// Takes effect on the next `open`.
    pub fn set_selector(&self, selector: Selector) {
        if let Ok(mut session) = self.shared.lock_session() {
            session.selector = Some(selector);
        }
    }

    pub fn ip_address(&self) -> Option<String> {
        match self.shared.lock_session().ok()?.selector.as_ref()? {
            Selector::IpAddress(address) => Some(address.clone()),
            Selector::Serial(_) => None,
        }
    }

    pub fn serial_number(&self) -> Option<String> {
        match self.shared.lock_session().ok()?.selector.as_ref()? {
            Selector::Serial(serial) => Some(serial.clone()),
            Selector::IpAddress(_) => None,
        }
    }

    /// Open the selected device. Returns false on failure; see `error_string`.
    pub fn open(&self, save_config: bool) -> bool {
        match self.shared.lock_session() {
            Ok(mut session) => self.shared.open_locked(&mut session, save_config),
            Err(err) => {
                log::warn!("Camera: {:#}", err);
                false
            }
        }
    }

    /// Close the device and cancel a pending start.
    pub fn close(&self) {
        match self.shared.lock_session() {
            Ok(mut session) => {
                session.start_requested = false;
                self.shared.close_locked(&mut session);
            }
            Err(err) => log::warn!("Camera: {:#}", err),
        }
    }

    /// Open if needed and start continuous grabbing.
    ///
    /// Without a sink the start stays pending and this still returns true;
    /// attaching a sink later promotes the session to grabbing.
    pub fn start(&self, save_config: bool) -> bool {
        match self.shared.lock_session() {
            Ok(mut session) => self.shared.start_locked(&mut session, save_config),
            Err(err) => {
                log::warn!("Camera: {:#}", err);
                false
            }
        }
    }

    /// Stop grabbing and cancel a pending start. The device stays open.
    pub fn stop(&self) {
        match self.shared.lock_session() {
            Ok(mut session) => {
                session.start_requested = false;
                self.shared.stop_grabbing(&mut session);
            }
            Err(err) => log::warn!("Camera: {:#}", err),
        }
    }

    /// Attach, replace or remove the presentation sink.
    pub fn set_sink(&self, sink: Option<Box<dyn FrameSink>>) {
        let attached = self.shared.dispatcher.set_sink(sink);
        self.shared
            .notifier
            .emit(Notification::SinkChanged { attached });

        let Ok(mut session) = self.shared.lock_session() else {
            log::warn!("Camera: session lock poisoned after sink change");
            return;
        };
        if session.start_requested {
            let save_config = session.start_save_config;
            self.shared.start_locked(&mut session, save_config);
        } else {
            self.shared.stop_grabbing(&mut session);
        }
    }

    pub fn has_sink(&self) -> bool {
        self.shared.dispatcher.has_sink()
    }

    /// Grab frames outside continuous mode.
    ///
    /// Continuous grabbing is stopped first and not resumed afterwards.
    pub fn capture(&self, request: CaptureRequest) -> Result<Capture> {
        let mut session = self.shared.lock_session()?;
        if !session.is_open() {
            return Err(SessionError::NotOpen.into());
        }
        self.shared.stop_grabbing(&mut session);
        self.shared
            .apply_capture_config(&mut session, request.config.as_ref())?;

        if request.frame_count == 0 {
            let Session { device, pump, .. } = &mut *session;
            let device = device.as_mut().ok_or(SessionError::NotOpen)?;
            let frame = pump
                .grab(device.as_mut(), 0, request.keep_grabbing)?
                .into_iter()
                .next();
            if let Some(frame) = &frame {
                self.shared.publish_batch(vec![frame.clone()]);
            }
            return Ok(Capture::Single(frame));
        }
        drop(session);

        let shared = self.shared.clone();
        let requested = request.frame_count;
        let keep_grabbing = request.keep_grabbing;
        let join = thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || shared.run_capture(requested, keep_grabbing))
            .context("spawn capture worker")?;
        log::info!(
            "Camera: background capture of {} frames started (keep_grabbing={})",
            requested,
            keep_grabbing
        );
        Ok(Capture::Background(CaptureJob { requested, join }))
    }

    pub fn subscribe(&self) -> Receiver<Notification> {
        self.shared.notifier.subscribe()
    }

    pub fn subscribe_to(&self, kinds: &[NotificationKind]) -> Receiver<Notification> {
        self.shared.notifier.subscribe_to(kinds)
    }

    /// Use `config` as the live configuration applied before captures.
    pub fn set_config(&self, config: ConfigBlob) {
        if let Ok(mut session) = self.shared.lock_session() {
            log::info!("Camera: live config set ({})", config.fingerprint());
            session.live_config = Some(config);
        }
    }

    /// Forget the stored original of the current device; the next open takes
    /// a fresh one.
    pub fn clear_original_config(&self) {
        if let Ok(mut session) = self.shared.lock_session() {
            let serial = session.serial.clone();
            if session.originals.remove(&serial).is_some() {
                log::info!("Camera: original config of {} cleared", serial);
            }
        }
    }

    /// Snapshot the device's current configuration.
    pub fn save_config(&self) -> Result<ConfigBlob> {
        let session = self.shared.lock_session()?;
        match session.device.as_ref().filter(|d| d.is_open()) {
            Some(device) => device
                .save_config()
                .map_err(|e| driver_failure("save configuration", e)),
            None => Err(SessionError::NotOpen.into()),
        }
    }

    pub fn original_config(&self) -> Option<ConfigBlob> {
        let session = self.shared.lock_session().ok()?;
        session.originals.get(&session.serial).cloned()
    }

    /// Config applied before captures: the one set with `set_config`, else
    /// the snapshot `open(true)` took of the current device.
    pub fn live_config(&self) -> Option<ConfigBlob> {
        self.shared
            .lock_session()
            .ok()?
            .effective_live_config()
            .cloned()
    }

    /// Drive the user output line.
    pub fn set_output_line(&self, high: bool) -> Result<()> {
        self.with_device(|device| {
            device.set_feature("LineSelector", FeatureValue::Enum("Line2".into()))?;
            device.set_feature("LineSource", FeatureValue::Enum("UserOutput1".into()))?;
            device.set_feature("UserOutputValue", FeatureValue::Bool(high))
        })
    }

    /// Switch between free-running and line-triggered acquisition.
    pub fn set_hardware_trigger_enabled(&self, enabled: bool) -> Result<()> {
        self.with_device(|device| {
            if enabled {
                device.set_feature("TriggerSource", FeatureValue::Enum("Line1".into()))?;
            }
            let mode = if enabled { "On" } else { "Off" };
            device.set_feature("TriggerMode", FeatureValue::Enum(mode.into()))
        })
    }

    /// Load a stored user set. Grabbing is paused while the set loads.
    pub fn load_user_set(&self, name: &str) -> Result<()> {
        let mut session = self.shared.lock_session()?;
        if !session.is_open() {
            return Err(SessionError::NotOpen.into());
        }
        let was_grabbing = self.shared.stop_grabbing(&mut session);
        let loaded = session
            .device
            .as_mut()
            .ok_or(SessionError::NotOpen)
            .map_err(anyhow::Error::from)
            .and_then(|device| {
                device.set_feature("UserSetSelector", FeatureValue::Enum(name.to_string()))?;
                device.set_feature("UserSetLoad", FeatureValue::Command)
            })
            .map_err(|e| driver_failure("load user set", e));
        if was_grabbing {
            let save_config = session.start_save_config;
            self.shared.start_locked(&mut session, save_config);
        }
        loaded
    }

    pub fn is_open(&self) -> bool {
        self.shared
            .lock_session()
            .map(|s| s.is_open())
            .unwrap_or(false)
    }

    pub fn is_grabbing(&self) -> bool {
        self.shared
            .lock_session()
            .map(|s| s.is_grabbing())
            .unwrap_or(false)
    }

    /// User-defined name of the last opened device.
    pub fn name(&self) -> String {
        self.shared
            .lock_session()
            .map(|s| s.name.clone())
            .unwrap_or_default()
    }

    /// Model of the last opened device.
    pub fn device_type(&self) -> String {
        self.shared
            .lock_session()
            .map(|s| s.device_type.clone())
            .unwrap_or_default()
    }

    /// Message of the last failed operation, empty after a success.
    pub fn error_string(&self) -> String {
        self.last_error().map(|e| e.to_string()).unwrap_or_default()
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.lock_session().ok()?.last_error.clone()
    }

    pub fn settings(&self) -> &AcquisitionSettings {
        &self.shared.settings
    }

    pub fn stats(&self) -> CameraStats {
        let pump = self
            .shared
            .lock_session()
            .map(|s| s.pump.stats())
            .unwrap_or_default();
        CameraStats {
            pump,
            render: self.shared.dispatcher.stats(),
        }
    }

    fn with_device<T>(&self, f: impl FnOnce(&mut dyn Device) -> Result<T>) -> Result<T> {
        let mut session = self.shared.lock_session()?;
        let device = session
            .device
            .as_mut()
            .filter(|d| d.is_open())
            .ok_or(SessionError::NotOpen)?;
        f(device.as_mut()).map_err(|e| driver_failure("set feature", e))
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.close();
        if let Ok(tx) = self.shared.events.lock() {
            let _ = tx.send(SessionEvent::Shutdown);
        }
        if let Some(join) = self.supervisor.take() {
            if join.join().is_err() {
                log::warn!("Camera: supervisor thread panicked");
            }
        }
    }
}

impl Shared {
    fn lock_session(&self) -> Result<MutexGuard<'_, Session>> {
        self.session
            .lock()
            .map_err(|_| SessionError::DriverError("session lock poisoned".into()).into())
    }

    fn open_locked(&self, session: &mut Session, save_config: bool) -> bool {
        if session.is_open() {
            return true;
        }
        match self.try_open(session, save_config) {
            Ok(()) => {
                session.last_error = None;
                true
            }
            Err(err) => {
                self.record_failure(session, "open", &err);
                false
            }
        }
    }

    fn try_open(&self, session: &mut Session, save_config: bool) -> Result<()> {
        // A handle that is present but no longer open belongs to a removed
        // device whose event has not been processed yet.
        self.close_locked(session);

        let selector = session
            .selector
            .clone()
            .ok_or_else(|| SessionError::NotFound("no selector set".into()))?;
        let devices = self
            .driver
            .enumerate()
            .map_err(|e| driver_failure("enumerate", e))?;
        if devices.is_empty() {
            let message = format!("no {} devices found", self.driver.name());
            return Err(SessionError::NotFound(message).into());
        }
        let info = devices
            .iter()
            .find(|d| selector.matches(d))
            .ok_or_else(|| SessionError::NotFound(selector.to_string()))?;

        let mut device = self
            .driver
            .connect(info)
            .map_err(|e| driver_failure("connect", e))?;
        device.open().map_err(|e| driver_failure("open", e))?;

        if let Err(err) = self.snapshot_configs(session, device.as_ref(), save_config) {
            if let Err(close_err) = device.close() {
                log::warn!("Camera: close after failed open: {:#}", close_err);
            }
            return Err(err);
        }

        session.generation += 1;
        device.on_removed(self.removal_callback(session.generation));
        session.pump.reset_counters();

        let info = device.info().clone();
        let name_changed = session.name != info.name;
        session.name = info.name.clone();
        session.device_type = info.model.clone();
        session.serial = info.serial.clone();
        session.device = Some(device);

        log::info!(
            "Camera: opened {} ({}, serial {}, {})",
            info.name,
            info.model,
            info.serial,
            info.address
        );
        if name_changed {
            self.notifier.emit(Notification::NameChanged(info.name));
        }
        self.notifier
            .emit(Notification::OpenStateChanged { is_open: true });
        Ok(())
    }

    /// Store the original of a device seen for the first time, and the live
    /// config when requested and none exists yet.
    fn snapshot_configs(
        &self,
        session: &mut Session,
        device: &dyn Device,
        save_config: bool,
    ) -> Result<()> {
        let serial = &device.info().serial;
        let need_original = !session.originals.contains_key(serial);
        let need_live = save_config
            && session.live_config.is_none()
            && !session.saved_configs.contains_key(serial);
        if !need_original && !need_live {
            return Ok(());
        }

        let snapshot = device
            .save_config()
            .map_err(|e| driver_failure("snapshot configuration", e))?;
        if need_original {
            log::info!(
                "Camera: stored original config of {} ({})",
                serial,
                snapshot.fingerprint()
            );
            session.originals.insert(serial.clone(), snapshot.clone());
        }
        if need_live {
            session.saved_configs.insert(serial.clone(), snapshot);
        }
        Ok(())
    }

    fn close_locked(&self, session: &mut Session) {
        let Some(mut device) = session.device.take() else {
            return;
        };
        let was_grabbing = session.pump.is_running() || device.is_grabbing();
        if let Err(err) = session.pump.stop_continuous(device.as_mut()) {
            log::warn!("Camera: stop grabbing on close: {:#}", err);
        }
        if was_grabbing {
            self.notifier.emit(Notification::GrabbingStopped);
        }
        if device.is_open() {
            if let Err(err) = device.close() {
                log::warn!("Camera: close {}: {:#}", device.info().serial, err);
            }
        }
        log::info!("Camera: closed {}", device.info().serial);
        drop(device);
        self.notifier
            .emit(Notification::OpenStateChanged { is_open: false });
    }

    fn start_locked(&self, session: &mut Session, save_config: bool) -> bool {
        session.start_requested = true;
        session.start_save_config = save_config;
        if !self.open_locked(session, save_config) {
            return false;
        }
        if session.pump.is_running() && session.is_grabbing() {
            return true;
        }
        if !self.dispatcher.has_sink() {
            log::info!("Camera: start pending until a sink is attached");
            return true;
        }
        match self.begin_grabbing(session) {
            Ok(()) => {
                session.last_error = None;
                log::info!("Camera: grabbing started on {}", session.serial);
                self.notifier.emit(Notification::GrabbingStarted);
                true
            }
            Err(err) => {
                self.record_failure(session, "start", &err);
                false
            }
        }
    }

    /// Restore the original, negotiate from a calibration frame, then switch
    /// to continuous delivery.
    fn begin_grabbing(&self, session: &mut Session) -> Result<()> {
        let Session {
            device,
            pump,
            originals,
            serial,
            ..
        } = session;
        let device = device.as_mut().ok_or(SessionError::NotOpen)?;
        if let Some(original) = originals.get(serial.as_str()) {
            device
                .load_config(original, LoadMode::Lenient)
                .map_err(|e| driver_failure("restore original configuration", e))?;
        }

        self.dispatcher.reset();
        let calibration = pump
            .grab(device.as_mut(), 0, false)?
            .into_iter()
            .next()
            .ok_or_else(|| {
                SessionError::DriverError("no calibration frame before timeout".into())
            })?;
        self.dispatcher
            .negotiate(calibration.width, calibration.height)?;
        self.dispatcher.present(&calibration);
        pump.start_continuous(device.as_mut(), self.dispatcher.clone())
    }

    /// Returns whether anything was grabbing.
    fn stop_grabbing(&self, session: &mut Session) -> bool {
        let Session { device, pump, .. } = session;
        let Some(device) = device.as_mut() else {
            return false;
        };
        if !pump.is_running() && !device.is_grabbing() {
            return false;
        }
        if let Err(err) = pump.stop_continuous(device.as_mut()) {
            log::warn!("Camera: stop grabbing: {:#}", err);
        }
        log::info!("Camera: grabbing stopped");
        self.notifier.emit(Notification::GrabbingStopped);
        true
    }

    fn apply_capture_config(
        &self,
        session: &mut Session,
        override_config: Option<&ConfigBlob>,
    ) -> Result<()> {
        let Some(config) = override_config
            .or(session.effective_live_config())
            .cloned()
        else {
            return Ok(());
        };
        let Session {
            device,
            originals,
            serial,
            last_error,
            ..
        } = session;
        let device = device.as_mut().ok_or(SessionError::NotOpen)?;
        let Err(err) = device.load_config(&config, LoadMode::Strict) else {
            return Ok(());
        };

        if let Some(original) = originals.get(serial.as_str()) {
            if let Err(restore_err) = device.load_config(original, LoadMode::Lenient) {
                log::warn!("Camera: restore original config: {:#}", restore_err);
            }
        }
        let failure = SessionError::DriverError(format!(
            "load configuration {}: {:#}",
            config.fingerprint(),
            err
        ));
        log::warn!("Camera: {}", failure);
        *last_error = Some(failure.clone());
        Err(failure.into())
    }

    /// Background capture: bursts until `requested` frames are gathered.
    fn run_capture(&self, requested: u32, keep_grabbing: bool) -> Result<Vec<Frame>> {
        let target = requested as usize;
        let mut frames = Vec::with_capacity(target);
        let mut empty_bursts = 0;

        while frames.len() < target {
            let remaining = (target - frames.len()) as u32;
            let burst = {
                let mut session = self.lock_session()?;
                let Session { device, pump, .. } = &mut *session;
                let Some(device) = device.as_mut().filter(|d| d.is_open()) else {
                    log::info!(
                        "Camera: session closed, capture ends with {} of {} frames",
                        frames.len(),
                        requested
                    );
                    break;
                };
                match pump.grab(device.as_mut(), remaining, keep_grabbing) {
                    Ok(burst) => burst,
                    Err(err) if !device.is_open() || pump.is_running() => {
                        log::info!(
                            "Camera: capture interrupted with {} of {} frames: {:#}",
                            frames.len(),
                            requested,
                            err
                        );
                        break;
                    }
                    Err(err) => return Err(err),
                }
            };

            if burst.is_empty() {
                empty_bursts += 1;
                if empty_bursts >= self.settings.max_empty_bursts {
                    log::warn!(
                        "Camera: {} empty bursts, capture gives up with {} of {} frames",
                        empty_bursts,
                        frames.len(),
                        requested
                    );
                    break;
                }
                continue;
            }
            empty_bursts = 0;
            frames.extend(burst.iter().cloned());
            self.publish_batch(burst);
        }

        log::info!("Camera: capture finished with {} frames", frames.len());
        Ok(frames)
    }

    /// Emit a batch and its latest frame, then present that frame.
    fn publish_batch(&self, batch: Vec<Frame>) {
        let Some(latest) = batch.last().cloned() else {
            return;
        };
        self.notifier
            .emit(Notification::FramesCaptured(Arc::from(batch)));
        self.notifier
            .emit(Notification::FrameGrabbed(Arc::new(latest.clone())));
        self.dispatcher.present(&latest);
    }

    fn removal_callback(&self, generation: u64) -> RemovalCallback {
        let tx = match self.events.lock() {
            Ok(tx) => Mutex::new(tx.clone()),
            Err(_) => {
                log::warn!("Camera: event channel poisoned, removal will go unnoticed");
                return Box::new(|| {});
            }
        };
        Box::new(move || {
            let sent = tx
                .lock()
                .map(|tx| tx.send(SessionEvent::DeviceRemoved { generation }).is_ok())
                .unwrap_or(false);
            if !sent {
                log::debug!("Camera: removal of generation {} not delivered", generation);
            }
        })
    }

    fn handle_removal(&self, generation: u64) {
        let mut session = match self.lock_session() {
            Ok(session) => session,
            Err(err) => {
                log::warn!("Camera: {:#}", err);
                return;
            }
        };
        if session.generation != generation || session.device.is_none() {
            log::debug!("Camera: ignoring stale removal of generation {}", generation);
            return;
        }
        log::warn!("Camera: device {} removed", session.serial);
        session.start_requested = false;
        self.close_locked(&mut session);
    }

    fn record_failure(&self, session: &mut Session, operation: &str, err: &anyhow::Error) {
        let failure = SessionError::classify(err);
        log::warn!("Camera: {} failed: {}", operation, failure);
        session.last_error = Some(failure);
    }
}

fn supervise(shared: Weak<Shared>, events: Receiver<SessionEvent>) {
    for event in events {
        match event {
            SessionEvent::Shutdown => break,
            SessionEvent::DeviceRemoved { generation } => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_removal(generation);
            }
        }
    }
}

/// Tag a driver failure as `DriverError` unless it already carries a class.
fn driver_failure(operation: &str, err: anyhow::Error) -> anyhow::Error {
    if err.chain().any(|c| c.downcast_ref::<SessionError>().is_some()) {
        return err.context(operation.to_string());
    }
    SessionError::DriverError(format!("{}: {:#}", operation, err)).into()
}
