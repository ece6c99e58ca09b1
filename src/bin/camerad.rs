//! camerad - long-running camera session
//!
//! This daemon:
//! 1. Loads configuration from CAMERA_CONFIG and CAMERA_* overrides
//! 2. Opens the selected camera and starts continuous grabbing
//! 3. Presents frames to a statistics sink and logs health every few seconds
//! 4. Reopens the camera after it was removed and rediscovered
//! 5. Stops cleanly on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::time::Duration;

use camera_session::config::CameraConfig;
use camera_session::{Camera, DeviceDriver, Notification, NotificationKind, StatsSink};

const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = CameraConfig::load()?;
    let selector = config.require_selector()?;
    let driver = config.build_driver()?;
    log::info!("camerad: {} driver, camera {}", driver.name(), selector);

    let camera = Camera::new(driver, config.settings())?;
    camera.set_selector(selector);
    if let Some(live) = config.read_live_config()? {
        camera.set_config(live);
    }

    let state_changes = camera.subscribe_to(&[
        NotificationKind::OpenStateChanged,
        NotificationKind::GrabbingStarted,
        NotificationKind::GrabbingStopped,
    ]);

    let sink = StatsSink::new("camerad");
    let sink_stats = sink.stats_handle();
    camera.set_sink(Some(Box::new(sink)));
    if !camera.start(config.acquisition.save_config) {
        log::warn!(
            "camerad: start failed ({}), retrying every {:?}",
            camera.error_string(),
            HEALTH_INTERVAL
        );
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("camerad running, waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(HEALTH_INTERVAL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            Err(mpsc::RecvTimeoutError::Timeout) => {}
        }

        for change in state_changes.try_iter() {
            match change {
                Notification::OpenStateChanged { is_open: false } => {
                    log::warn!("camerad: camera closed")
                }
                Notification::OpenStateChanged { is_open: true } => {
                    log::info!("camerad: camera {} open", camera.name())
                }
                other => log::debug!("camerad: {:?}", other.kind()),
            }
        }

        if !camera.is_grabbing() {
            if camera.start(config.acquisition.save_config) && camera.is_grabbing() {
                log::info!("camerad: grabbing resumed on {}", camera.name());
            } else {
                log::warn!("camerad: camera unavailable: {}", camera.error_string());
            }
            continue;
        }

        let stats = camera.stats();
        let presented = sink_stats
            .lock()
            .map(|s| s.clone())
            .map_err(|_| anyhow!("sink stats lock poisoned"))?;
        log::info!(
            "camerad: {} {}x{} {:.1} fps, delivered={} dropped={} conversion_failures={} presented={} last_block={:?}",
            camera.name(),
            presented.width,
            presented.height,
            presented.fps,
            stats.pump.frames_delivered,
            stats.pump.frames_dropped,
            stats.pump.conversion_failures,
            presented.frames,
            presented.last_block_id
        );
    }

    log::info!("shutdown signal received, stopping camera...");
    camera.stop();
    camera.close();
    Ok(())
}
