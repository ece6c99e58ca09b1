use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camera_session::config::{CameraConfig, DriverKind};
use camera_session::{DeviceDriver, Selector, SurfaceFormat};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMERA_CONFIG",
        "CAMERA_IP_ADDRESS",
        "CAMERA_SERIAL",
        "CAMERA_DRIVER",
        "CAMERA_RETRIEVE_TIMEOUT_MS",
        "CAMERA_SURFACE_FORMAT",
        "CAMERA_LIVE_CONFIG",
    ] {
        std::env::remove_var(key);
    }
}

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = toml_file(
        r#"
        [selector]
        serial = "22013344"

        [acquisition]
        retrieve_timeout_ms = 250
        surface_format = "rgb24"
        save_config = false
        max_empty_bursts = 2

        [driver]
        kind = "sim"

        [[driver.simulated]]
        serial = "22013344"
        address = "192.168.1.20"
        model = "a2A1920-51gc"
        width = 320
        height = 240
        pixel_format = "YUV422_YUYV"
        fail_every = 4

        [[driver.simulated]]
        serial = "22013345"
        address = "192.168.1.21"
        "#,
    );
    std::env::set_var("CAMERA_CONFIG", file.path());
    std::env::set_var("CAMERA_IP_ADDRESS", "192.168.1.21");
    std::env::set_var("CAMERA_SURFACE_FORMAT", "rgb32");

    let cfg = CameraConfig::load().expect("load config");

    assert_eq!(
        cfg.selector,
        Some(Selector::IpAddress("192.168.1.21".to_string()))
    );
    assert_eq!(cfg.acquisition.retrieve_timeout, Duration::from_millis(250));
    assert_eq!(cfg.acquisition.surface_format, SurfaceFormat::Rgb32);
    assert!(!cfg.acquisition.save_config);
    assert_eq!(cfg.driver.kind, DriverKind::Simulated);
    assert_eq!(cfg.driver.simulated.len(), 2);
    assert_eq!(cfg.driver.simulated[0].width, 320);
    assert_eq!(cfg.driver.simulated[0].fail_every, 4);
    assert_eq!(cfg.settings().max_empty_bursts, 2);

    let devices = cfg.build_driver().unwrap().enumerate().unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].model, "a2A1920-51gc");

    clear_env();
}

#[test]
fn defaults_to_one_simulated_camera() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CameraConfig::load().expect("load defaults");
    assert!(cfg.selector.is_none());
    assert!(cfg.require_selector().is_err());
    assert_eq!(cfg.acquisition.surface_format, SurfaceFormat::Rgb32);
    assert!(cfg.acquisition.save_config);
    assert_eq!(cfg.driver.simulated.len(), 1);

    clear_env();
}

#[test]
fn rejects_conflicting_selectors_and_bad_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_IP_ADDRESS", "10.0.0.1");
    std::env::set_var("CAMERA_SERIAL", "A");
    assert!(CameraConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMERA_RETRIEVE_TIMEOUT_MS", "soon");
    assert!(CameraConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMERA_RETRIEVE_TIMEOUT_MS", "0");
    assert!(CameraConfig::load().is_err());
    clear_env();

    std::env::set_var("CAMERA_DRIVER", "gige-vision");
    assert!(CameraConfig::load().is_err());
    clear_env();

    let file = toml_file(
        r#"
        [selector]
        serial = "A"
        ip_address = "10.0.0.1"
        "#,
    );
    assert!(CameraConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn reads_live_config_blob_from_path() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut blob = NamedTempFile::new().expect("temp blob");
    blob.write_all(br#"{"Gain": 6.0}"#).expect("write blob");
    std::env::set_var("CAMERA_LIVE_CONFIG", blob.path());

    let cfg = CameraConfig::load().expect("load config");
    let live = cfg.read_live_config().unwrap().expect("live config");
    assert_eq!(live.as_bytes(), br#"{"Gain": 6.0}"#);

    clear_env();
}

#[test]
fn rejects_simulated_camera_without_pixels() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = toml_file(
        r#"
        [[driver.simulated]]
        serial = "Z"
        address = "10.0.0.9"
        width = 0
        "#,
    );
    let err = CameraConfig::load_from(Some(file.path())).unwrap_err();
    assert!(format!("{:#}", err).contains("geometry 0x480"));

    clear_env();
}
