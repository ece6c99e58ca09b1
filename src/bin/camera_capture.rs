//! camera_capture - one-shot capture from a camera session.
//!
//! Lists devices, grabs a single frame or a burst of frames, optionally writes
//! them as JPEG files and dumps the device configuration blob.

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camera_session::config::CameraConfig;
use camera_session::{
    Camera, Capture, CaptureRequest, DeviceDriver, Frame, Notification, NotificationKind,
    Selector,
};

#[path = "../ui.rs"]
mod ui;

#[derive(Parser, Debug)]
#[command(
    name = "camera_capture",
    about = "Capture frames from a machine-vision camera"
)]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(long, env = "CAMERA_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Select the camera by serial number
    #[arg(long, conflicts_with = "ip")]
    serial: Option<String>,

    /// Select the camera by network address
    #[arg(long)]
    ip: Option<String>,

    /// List enumerated devices and exit
    #[arg(long)]
    list: bool,

    /// Frames to capture (0 grabs a single frame synchronously)
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Keep grabbing within a burst instead of stopping after its first frame
    #[arg(long)]
    keep_grabbing: bool,

    /// Directory for captured frames as JPEG (requires the snapshot feature)
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Write the device configuration blob to this file
    #[arg(long, value_name = "FILE")]
    dump_config: Option<PathBuf>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    if args.out.is_some() && !cfg!(feature = "snapshot") {
        bail!("--out requires a build with the snapshot feature");
    }

    let config = CameraConfig::load_from(args.config.as_deref())?;
    let driver = config.build_driver()?;

    if args.list {
        let devices = {
            let _stage = ui.stage("Enumerate devices");
            driver.enumerate()?
        };
        for device in devices {
            println!(
                "{}\t{}\t{}\t{}",
                device.address, device.serial, device.model, device.name
            );
        }
        return Ok(());
    }

    let selector = match (&args.serial, &args.ip) {
        (Some(serial), _) => Selector::Serial(serial.clone()),
        (None, Some(ip)) => Selector::IpAddress(ip.clone()),
        (None, None) => config.require_selector()?,
    };

    let camera = Camera::new(driver, config.settings())?;
    camera.set_selector(selector.clone());
    if let Some(live) = config.read_live_config()? {
        camera.set_config(live);
    }

    {
        let _stage = ui.stage(&format!("Open camera {}", selector));
        if !camera.open(config.acquisition.save_config) {
            bail!("open failed: {}", camera.error_string());
        }
    }

    if let Some(path) = &args.dump_config {
        let _stage = ui.stage("Save device configuration");
        let blob = camera.save_config()?;
        std::fs::write(path, blob.as_bytes())
            .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
        log::info!("wrote {} ({} bytes, {})", path.display(), blob.len(), blob.fingerprint());
    }

    let frames = capture(&camera, &ui, args.count, args.keep_grabbing)?;
    if let Some(dir) = &args.out {
        let _stage = ui.stage(&format!("Write {} frames", frames.len()));
        std::fs::create_dir_all(dir)
            .map_err(|e| anyhow!("failed to create {}: {}", dir.display(), e))?;
        for frame in &frames {
            write_frame(dir, frame)?;
        }
    }

    for frame in &frames {
        println!(
            "block={} {}x{} {} bytes",
            frame.block_id,
            frame.width,
            frame.height,
            frame.pixels().len()
        );
    }
    if frames.len() < args.count.max(1) as usize {
        bail!(
            "captured {} of {} frames: {}",
            frames.len(),
            args.count.max(1),
            camera.error_string()
        );
    }
    camera.close();
    Ok(())
}

fn capture(camera: &Camera, ui: &ui::Ui, count: u32, keep_grabbing: bool) -> Result<Vec<Frame>> {
    let batches = camera.subscribe_to(&[NotificationKind::FramesCaptured]);
    let request = if count == 0 {
        CaptureRequest::single()
    } else {
        CaptureRequest::frames(count).keep_grabbing(keep_grabbing)
    };

    let _stage = ui.stage(&format!("Capture {} frames", count.max(1)));
    match camera.capture(request)? {
        Capture::Single(frame) => Ok(frame.into_iter().collect()),
        Capture::Background(job) => {
            let progress = ui.frames(u64::from(job.requested()));
            let mut received = 0u64;
            while !job.is_finished() {
                if let Ok(Notification::FramesCaptured(batch)) =
                    batches.recv_timeout(Duration::from_millis(100))
                {
                    received += batch.len() as u64;
                    let latest = batch.last().map(|f| f.block_id).unwrap_or_default();
                    progress.set(received, latest);
                }
            }
            progress.finish();
            job.wait()
        }
    }
}

#[cfg(feature = "snapshot")]
fn write_frame(dir: &Path, frame: &Frame) -> Result<()> {
    let path = dir.join(format!("frame_{:06}.jpg", frame.block_id));
    let image = image::RgbImage::from_raw(frame.width, frame.height, frame.pixels().to_vec())
        .ok_or_else(|| anyhow!("frame {} has an incomplete buffer", frame.block_id))?;
    image
        .save_with_format(&path, image::ImageFormat::Jpeg)
        .map_err(|e| anyhow!("failed to write {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(not(feature = "snapshot"))]
fn write_frame(_dir: &Path, _frame: &Frame) -> Result<()> {
    bail!("built without the snapshot feature")
}
