use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::camera::{AcquisitionSettings, Selector, MAX_EMPTY_BURSTS};
use crate::driver::{ConfigBlob, DeviceDriver, SimCameraSpec, SimulatedDriver};
use crate::frame::{PixelFormat, SurfaceFormat};

const DEFAULT_RETRIEVE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_SIM_SERIAL: &str = "SIM0001";
const DEFAULT_SIM_ADDRESS: &str = "127.0.0.1";
const DEFAULT_SIM_MODEL: &str = "SimCam-640";
const DEFAULT_SIM_WIDTH: u32 = 640;
const DEFAULT_SIM_HEIGHT: u32 = 480;
const DEFAULT_SIM_FRAME_INTERVAL_MS: u64 = 33;
const MAX_SIM_DIMENSION: u32 = 8192;

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    selector: Option<SelectorConfigFile>,
    acquisition: Option<AcquisitionConfigFile>,
    driver: Option<DriverConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct SelectorConfigFile {
    ip_address: Option<String>,
    serial: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AcquisitionConfigFile {
    retrieve_timeout_ms: Option<u64>,
    surface_format: Option<String>,
    save_config: Option<bool>,
    live_config_path: Option<PathBuf>,
    max_empty_bursts: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DriverConfigFile {
    kind: Option<String>,
    simulated: Option<Vec<SimulatedCameraFile>>,
}

#[derive(Debug, Deserialize)]
struct SimulatedCameraFile {
    serial: String,
    address: String,
    model: Option<String>,
    name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pixel_format: Option<String>,
    frame_interval_ms: Option<u64>,
    fail_every: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Simulated,
    V4l2,
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sim" | "simulated" => Ok(DriverKind::Simulated),
            "v4l2" => Ok(DriverKind::V4l2),
            other => Err(anyhow!("unknown camera driver '{}' (expected sim or v4l2)", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub selector: Option<Selector>,
    pub acquisition: AcquisitionConfig,
    pub driver: DriverConfig,
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub retrieve_timeout: Duration,
    pub surface_format: SurfaceFormat,
    /// Snapshot the device as live config on first open.
    pub save_config: bool,
    /// Configuration blob applied before captures.
    pub live_config_path: Option<PathBuf>,
    pub max_empty_bursts: u32,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub kind: DriverKind,
    /// Cameras on the simulated bus.
    pub simulated: Vec<SimCameraSpec>,
}

impl CameraConfig {
    /// Load from the file named by `CAMERA_CONFIG` (if any), then apply
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CAMERA_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CameraConfigFile) -> Result<Self> {
        let selector = match file.selector {
            Some(SelectorConfigFile {
                ip_address: Some(_),
                serial: Some(_),
            }) => {
                return Err(anyhow!(
                    "selector must name either ip_address or serial, not both"
                ))
            }
            Some(SelectorConfigFile {
                ip_address: Some(address),
                ..
            }) => Some(Selector::IpAddress(address)),
            Some(SelectorConfigFile {
                serial: Some(serial),
                ..
            }) => Some(Selector::Serial(serial)),
            _ => None,
        };

        let acquisition_file = file.acquisition.unwrap_or_default();
        let acquisition = AcquisitionConfig {
            retrieve_timeout: Duration::from_millis(
                acquisition_file
                    .retrieve_timeout_ms
                    .unwrap_or(DEFAULT_RETRIEVE_TIMEOUT_MS),
            ),
            surface_format: match acquisition_file.surface_format.as_deref() {
                Some(format) => format.parse()?,
                None => SurfaceFormat::default(),
            },
            save_config: acquisition_file.save_config.unwrap_or(true),
            live_config_path: acquisition_file.live_config_path,
            max_empty_bursts: acquisition_file.max_empty_bursts.unwrap_or(MAX_EMPTY_BURSTS),
        };

        let driver_file = file.driver.unwrap_or_default();
        let kind = match driver_file.kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => DriverKind::Simulated,
        };
        let simulated = match driver_file.simulated {
            Some(cameras) => cameras
                .into_iter()
                .map(simulated_camera)
                .collect::<Result<Vec<_>>>()?,
            None => vec![default_simulated_camera()],
        };

        Ok(Self {
            selector,
            acquisition,
            driver: DriverConfig { kind, simulated },
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        let address = non_empty_env("CAMERA_IP_ADDRESS");
        let serial = non_empty_env("CAMERA_SERIAL");
        match (address, serial) {
            (Some(_), Some(_)) => {
                return Err(anyhow!(
                    "set only one of CAMERA_IP_ADDRESS and CAMERA_SERIAL"
                ))
            }
            (Some(address), None) => self.selector = Some(Selector::IpAddress(address)),
            (None, Some(serial)) => self.selector = Some(Selector::Serial(serial)),
            (None, None) => {}
        }
        if let Some(kind) = non_empty_env("CAMERA_DRIVER") {
            self.driver.kind = kind.parse()?;
        }
        if let Some(timeout) = non_empty_env("CAMERA_RETRIEVE_TIMEOUT_MS") {
            let millis: u64 = timeout.parse().map_err(|_| {
                anyhow!("CAMERA_RETRIEVE_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.acquisition.retrieve_timeout = Duration::from_millis(millis);
        }
        if let Some(format) = non_empty_env("CAMERA_SURFACE_FORMAT") {
            self.acquisition.surface_format = format.parse()?;
        }
        if let Some(path) = non_empty_env("CAMERA_LIVE_CONFIG") {
            self.acquisition.live_config_path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.acquisition.retrieve_timeout.is_zero() {
            return Err(anyhow!("retrieve timeout must be greater than zero"));
        }
        if self.acquisition.max_empty_bursts == 0 {
            return Err(anyhow!("max_empty_bursts must be greater than zero"));
        }
        if self.driver.kind == DriverKind::V4l2 && !cfg!(feature = "driver-v4l2") {
            return Err(anyhow!(
                "driver v4l2 requested but this build lacks the driver-v4l2 feature"
            ));
        }
        let mut serials: Vec<&str> = self
            .driver
            .simulated
            .iter()
            .map(|spec| spec.info.serial.as_str())
            .collect();
        serials.sort_unstable();
        if serials.windows(2).any(|pair| pair[0] == pair[1]) {
            return Err(anyhow!("simulated cameras must have unique serials"));
        }
        Ok(())
    }

    /// Selector the session opens; an error when none is configured.
    pub fn require_selector(&self) -> Result<Selector> {
        self.selector
            .clone()
            .ok_or_else(|| anyhow!("no camera selected (set CAMERA_SERIAL or CAMERA_IP_ADDRESS)"))
    }

    pub fn settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            retrieve_timeout: self.acquisition.retrieve_timeout,
            surface_format: self.acquisition.surface_format,
            max_empty_bursts: self.acquisition.max_empty_bursts,
        }
    }

    pub fn build_driver(&self) -> Result<Box<dyn DeviceDriver>> {
        match self.driver.kind {
            DriverKind::Simulated => Ok(Box::new(SimulatedDriver::new(
                self.driver.simulated.clone(),
            ))),
            #[cfg(feature = "driver-v4l2")]
            DriverKind::V4l2 => Ok(Box::new(crate::driver::V4l2Driver::new())),
            #[cfg(not(feature = "driver-v4l2"))]
            DriverKind::V4l2 => Err(anyhow!("built without the driver-v4l2 feature")),
        }
    }

    /// Contents of `live_config_path`, if configured.
    pub fn read_live_config(&self) -> Result<Option<ConfigBlob>> {
        let Some(path) = &self.acquisition.live_config_path else {
            return Ok(None);
        };
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow!("failed to read live config {}: {}", path.display(), e))?;
        Ok(Some(ConfigBlob::new(bytes)))
    }
}

fn read_config_file(path: &Path) -> Result<CameraConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn simulated_camera(file: SimulatedCameraFile) -> Result<SimCameraSpec> {
    let model = file.model.as_deref().unwrap_or(DEFAULT_SIM_MODEL);
    let width = file.width.unwrap_or(DEFAULT_SIM_WIDTH);
    let height = file.height.unwrap_or(DEFAULT_SIM_HEIGHT);
    if width == 0 || height == 0 || width > MAX_SIM_DIMENSION || height > MAX_SIM_DIMENSION {
        return Err(anyhow!(
            "simulated camera {}: geometry {}x{} must be within 1..={} per side",
            file.serial,
            width,
            height,
            MAX_SIM_DIMENSION
        ));
    }
    let mut spec =
        SimCameraSpec::new(&file.serial, &file.address, model).with_geometry(width, height);
    if let Some(name) = &file.name {
        spec = spec.with_name(name);
    }
    if let Some(format) = &file.pixel_format {
        spec = spec.with_pixel_format(format.parse::<PixelFormat>()?);
    }
    if let Some(fail_every) = file.fail_every {
        spec = spec.with_fail_every(fail_every);
    }
    Ok(spec.with_frame_interval(Duration::from_millis(
        file.frame_interval_ms
            .unwrap_or(DEFAULT_SIM_FRAME_INTERVAL_MS),
    )))
}

fn default_simulated_camera() -> SimCameraSpec {
    SimCameraSpec::new(DEFAULT_SIM_SERIAL, DEFAULT_SIM_ADDRESS, DEFAULT_SIM_MODEL)
        .with_geometry(DEFAULT_SIM_WIDTH, DEFAULT_SIM_HEIGHT)
        .with_frame_interval(Duration::from_millis(DEFAULT_SIM_FRAME_INTERVAL_MS))
}
