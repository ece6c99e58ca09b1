//! Device driver seam.
//!
//! A driver enumerates physical devices and connects to one of them. The
//! connected `Device` owns everything vendor-specific: opening, configuration
//! persistence, bounded and continuous acquisition, and removal detection.
//!
//! Drivers:
//! - `sim`: synthetic cameras with hot-unplug support (always built)
//! - `v4l2`: local V4L2 nodes (feature: driver-v4l2)
//!
//! Continuous delivery is a producer/consumer hand-off: the device pushes
//! `RawGrab`s into the `GrabSender` from its own thread, and the acquisition
//! pump is the single consumer. Removal is reported through one callback
//! registered by the session controller.

pub mod sim;
#[cfg(feature = "driver-v4l2")]
pub mod v4l2;

use std::fmt;
use std::sync::mpsc::SyncSender;
use std::time::Duration;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::frame::RawGrab;

pub use sim::{SimCameraSpec, SimulatedDriver};
#[cfg(feature = "driver-v4l2")]
pub use v4l2::V4l2Driver;

/// One enumerated device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Network address for GigE devices, node path for local devices.
    pub address: String,
    pub serial: String,
    pub model: String,
    /// User-defined name.
    pub name: String,
}

/// Opaque serialized feature set.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigBlob(Vec<u8>);

impl ConfigBlob {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Short digest for log lines. Not a stable identifier.
    pub fn fingerprint(&self) -> String {
        let digest: [u8; 32] = Sha256::digest(&self.0).into();
        hex::encode(&digest[..6])
    }
}

impl From<Vec<u8>> for ConfigBlob {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&str> for ConfigBlob {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl fmt::Debug for ConfigBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigBlob(size={}, {})", self.len(), self.fingerprint())
    }
}

/// How strictly a configuration blob is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadMode {
    /// Unknown or rejected features fail the load.
    Strict,
    /// Unknown or rejected features are skipped with a warning.
    Lenient,
}

/// Value for a single feature pass-through.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Enum(String),
    /// Execute a command feature.
    Command,
}

pub type GrabSender = SyncSender<RawGrab>;
pub type RemovalCallback = Box<dyn Fn() + Send + Sync>;

/// Driver entry point.
pub trait DeviceDriver: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Create a handle for an enumerated device. The handle is not yet open.
    fn connect(&self, info: &DeviceInfo) -> Result<Box<dyn Device>>;
}

/// A connected device handle.
pub trait Device: Send {
    fn info(&self) -> &DeviceInfo;

    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Start delivering grabs into `sender` from a driver-owned thread until
    /// `stop` is called. The sender is dropped when delivery ends.
    fn start_continuous(&mut self, sender: GrabSender) -> Result<()>;

    /// Start a bounded sequence of `count` grabs consumed through `retrieve`.
    /// `is_grabbing` turns false once the sequence is exhausted.
    fn start_bounded(&mut self, count: u32) -> Result<()>;

    /// Stop any acquisition. Safe to call when idle.
    fn stop(&mut self) -> Result<()>;

    fn is_grabbing(&self) -> bool;

    /// Retrieve the next grab of a bounded sequence, waiting up to `timeout`.
    /// A timeout is a non-successful `RawGrab`, not an error.
    fn retrieve(&mut self, timeout: Duration) -> Result<RawGrab>;

    fn save_config(&self) -> Result<ConfigBlob>;

    fn load_config(&mut self, blob: &ConfigBlob, mode: LoadMode) -> Result<()>;

    /// Register the device-removed callback, replacing any previous one.
    fn on_removed(&mut self, callback: RemovalCallback);

    /// Write a single named feature.
    fn set_feature(&mut self, name: &str, value: FeatureValue) -> Result<()>;
}
