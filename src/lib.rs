//! Camera session controller and frame pump.
//!
//! This crate opens a machine-vision camera selected by network address or
//! serial number, keeps its configuration snapshots, grabs frames either in
//! bounded bursts or continuously, converts raw sensor data to RGB and hands
//! the result to an optional presentation sink.
//!
//! # Architecture
//!
//! ```text
//! Camera ──open/start──▶ Device (driver)
//!   │                       │ RawGrab (driver thread)
//!   │                       ▼
//!   └──────────────▶ AcquisitionPump ──convert──▶ RenderDispatcher ──▶ FrameSink
//! ```
//!
//! Device removal travels the other way: the driver's removal callback posts
//! an event that the session's supervisor thread turns into a teardown.
//!
//! # Module Structure
//!
//! - `camera`: session controller (`Camera`), capture requests
//! - `pump`: bounded bursts and continuous delivery
//! - `render`: serialized delivery to the sink, format negotiation
//! - `convert`: raw sensor formats to RGB24 and presentation formats
//! - `driver`: driver traits, simulated and V4L2 drivers
//! - `sink`: sink trait and the bundled sinks
//! - `notify`: change notifications
//! - `config`: file and environment configuration for the binaries
//! - `error`: failure taxonomy

pub mod camera;
pub mod config;
pub mod convert;
pub mod driver;
pub mod error;
pub mod frame;
pub mod notify;
pub mod pump;
pub mod render;
pub mod sink;

pub use camera::{
    AcquisitionSettings, Camera, CameraStats, Capture, CaptureJob, CaptureRequest, Selector,
};
pub use driver::{
    ConfigBlob, Device, DeviceDriver, DeviceInfo, LoadMode, SimCameraSpec, SimulatedDriver,
};
pub use error::{ErrorKind, SessionError};
pub use frame::{Frame, PixelFormat, RawFrame, RawGrab, SurfaceFormat};
pub use notify::{Notification, NotificationKind};
pub use pump::PumpStats;
pub use sink::{ChannelSink, FrameSink, SinkEvent, StatsSink};
