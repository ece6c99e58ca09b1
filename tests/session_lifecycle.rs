use std::sync::mpsc::Receiver;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use camera_session::{
    AcquisitionSettings, Camera, Capture, CaptureRequest, ChannelSink, ConfigBlob, ErrorKind,
    Frame, Notification, NotificationKind, SimCameraSpec, SimulatedDriver, SinkEvent,
};

fn two_camera_bus() -> SimulatedDriver {
    SimulatedDriver::new(vec![
        SimCameraSpec::new("A", "192.168.10.11", "acA1300-60gm"),
        SimCameraSpec::new("B", "192.168.10.12", "acA2440-20gc"),
    ])
}

fn session(driver: &SimulatedDriver, serial: &str) -> Result<Camera> {
    let camera = Camera::new(Box::new(driver.clone()), AcquisitionSettings::default())?;
    camera.set_serial_number(serial);
    Ok(camera)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn next_presented(rx: &Receiver<SinkEvent>) -> Result<Frame> {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let SinkEvent::Presented(frame) = rx.recv_timeout(Duration::from_secs(2))? {
            return Ok(frame);
        }
    }
    Err(anyhow!("no frame presented"))
}

fn assert_grabbing_implies_open(camera: &Camera) {
    assert!(!camera.is_grabbing() || camera.is_open());
}

#[test]
fn selecting_b_opens_b() -> Result<()> {
    let camera = session(&two_camera_bus(), "B")?;
    assert!(camera.open(false));
    assert!(camera.open(false));
    assert_eq!(camera.device_type(), "acA2440-20gc");
    assert_eq!(camera.serial_number().as_deref(), Some("B"));
    assert!(camera.error_string().is_empty());
    Ok(())
}

#[test]
fn absent_selector_leaves_session_closed() -> Result<()> {
    let camera = session(&two_camera_bus(), "Z")?;
    assert!(!camera.open(false));
    assert!(!camera.is_open());
    assert!(!camera.is_grabbing());
    assert_eq!(
        camera.last_error().map(|e| e.kind()),
        Some(ErrorKind::NotFound)
    );
    Ok(())
}

#[test]
fn stop_then_start_resumes_delivery_without_reopening() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    let opened = camera.subscribe_to(&[NotificationKind::OpenStateChanged]);
    let (sink, rx) = ChannelSink::new();
    camera.set_sink(Some(Box::new(sink)));

    assert!(camera.start(false));
    assert_grabbing_implies_open(&camera);
    assert!(camera.is_grabbing());
    let first = next_presented(&rx)?;

    camera.stop();
    assert_grabbing_implies_open(&camera);
    assert!(camera.is_open());
    assert!(!camera.is_grabbing());
    while rx.try_recv().is_ok() {}

    assert!(camera.start(false));
    assert!(camera.is_grabbing());
    let resumed = next_presented(&rx)?;
    assert!(resumed.block_id > first.block_id);
    assert_eq!(opened.try_iter().count(), 1);

    camera.close();
    assert_grabbing_implies_open(&camera);
    assert!(!camera.is_open());
    Ok(())
}

#[test]
fn single_capture_without_sink_presents_nothing() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    let batches = camera.subscribe_to(&[NotificationKind::FramesCaptured]);
    assert!(camera.open(false));

    let frame = match camera.capture(CaptureRequest::single())? {
        Capture::Single(frame) => frame.ok_or_else(|| anyhow!("grab timed out"))?,
        Capture::Background(_) => return Err(anyhow!("single capture ran in the background")),
    };
    assert!(frame.is_valid());
    assert_eq!(frame.size(), (64, 48));

    assert!(camera.is_open());
    assert!(!camera.is_grabbing());
    assert_eq!(camera.stats().render.presented, 0);
    assert_eq!(batches.try_iter().count(), 1);
    Ok(())
}

#[test]
fn burst_capture_delivers_exactly_the_requested_frames() -> Result<()> {
    let driver = SimulatedDriver::new(vec![
        SimCameraSpec::new("A", "192.168.10.11", "acA1300-60gm").with_fail_every(3)
    ]);
    let camera = session(&driver, "A")?;
    let notifications = camera.subscribe_to(&[
        NotificationKind::FramesCaptured,
        NotificationKind::FrameGrabbed,
    ]);
    assert!(camera.open(false));

    let job = match camera.capture(CaptureRequest::frames(5).keep_grabbing(true))? {
        Capture::Background(job) => job,
        Capture::Single(_) => return Err(anyhow!("expected a background capture")),
    };
    let frames = job.wait()?;

    let ids: Vec<u64> = frames.iter().map(|f| f.block_id).collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(ids.iter().all(|id| id % 3 != 0));

    let mut batched = 0;
    let mut latest = Vec::new();
    for notification in notifications.try_iter() {
        match notification {
            Notification::FramesCaptured(batch) => batched += batch.len(),
            Notification::FrameGrabbed(frame) => latest.push(frame.block_id),
            _ => {}
        }
    }
    assert_eq!(batched, 5);
    assert_eq!(latest.last(), ids.last());
    assert!(!camera.is_grabbing());
    Ok(())
}

#[test]
fn single_shot_bursts_take_one_frame_each() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    let batches = camera.subscribe_to(&[NotificationKind::FramesCaptured]);
    assert!(camera.open(false));

    let Capture::Background(job) = camera.capture(CaptureRequest::frames(3).keep_grabbing(false))?
    else {
        return Err(anyhow!("expected a background capture"));
    };
    assert_eq!(job.wait()?.len(), 3);

    let sizes: Vec<usize> = batches
        .try_iter()
        .filter_map(|n| match n {
            Notification::FramesCaptured(batch) => Some(batch.len()),
            _ => None,
        })
        .collect();
    assert_eq!(sizes, vec![1, 1, 1]);
    Ok(())
}

#[test]
fn capture_stops_continuous_grabbing() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    let (sink, _rx) = ChannelSink::new();
    camera.set_sink(Some(Box::new(sink)));
    assert!(camera.start(false));
    assert!(camera.is_grabbing());

    let Capture::Single(frame) = camera.capture(CaptureRequest::single())? else {
        return Err(anyhow!("expected a single capture"));
    };
    assert!(frame.is_some());
    assert!(camera.is_open());
    assert!(!camera.is_grabbing());
    Ok(())
}

#[test]
fn saved_config_restores_geometry() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    assert!(camera.open(false));
    let saved = camera.save_config()?;

    let shrunk = {
        let mut features: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(saved.as_bytes())?;
        features.insert("Width".into(), serde_json::json!(32));
        ConfigBlob::new(serde_json::to_vec(&features)?)
    };
    let grab = |config: ConfigBlob| -> Result<(u32, u32)> {
        match camera.capture(CaptureRequest::single().with_config(config))? {
            Capture::Single(Some(frame)) => Ok(frame.size()),
            _ => Err(anyhow!("no frame")),
        }
    };

    assert_eq!(grab(shrunk)?, (32, 48));
    assert_eq!(grab(saved.clone())?, (64, 48));
    assert_eq!(grab(saved)?, (64, 48));
    Ok(())
}

#[test]
fn device_removal_tears_down_once_and_reopens_after_replug() -> Result<()> {
    let driver = two_camera_bus();
    let camera = session(&driver, "A")?;
    let (sink, _rx) = ChannelSink::new();
    camera.set_sink(Some(Box::new(sink)));
    assert!(camera.start(false));
    assert!(camera.is_grabbing());

    let open_changes = camera.subscribe_to(&[NotificationKind::OpenStateChanged]);
    assert!(driver.unplug("A"));
    let change = open_changes.recv_timeout(Duration::from_secs(2))?;
    assert!(matches!(
        change,
        Notification::OpenStateChanged { is_open: false }
    ));
    assert!(!camera.is_open());
    assert!(!camera.is_grabbing());
    thread::sleep(Duration::from_millis(50));
    assert_eq!(open_changes.try_iter().count(), 0);

    assert!(!camera.open(false));
    assert_eq!(
        camera.last_error().map(|e| e.kind()),
        Some(ErrorKind::NotFound)
    );

    assert!(driver.replug("A"));
    assert!(camera.open(false));
    assert!(camera.is_open());
    Ok(())
}

#[test]
fn swapping_the_sink_while_grabbing_renegotiates() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    let (first, first_rx) = ChannelSink::new();
    camera.set_sink(Some(Box::new(first)));
    assert!(camera.start(false));
    next_presented(&first_rx)?;

    let (second, second_rx) = ChannelSink::new();
    camera.set_sink(Some(Box::new(second)));
    assert!(camera.is_grabbing());
    match second_rx.recv_timeout(Duration::from_secs(2))? {
        SinkEvent::Negotiated { width, height, .. } => assert_eq!((width, height), (64, 48)),
        other => return Err(anyhow!("expected negotiation, got {:?}", other)),
    }
    next_presented(&second_rx)?;
    Ok(())
}

#[test]
fn detaching_the_sink_keeps_grabbing_and_drops_frames() -> Result<()> {
    let camera = session(&two_camera_bus(), "A")?;
    let (sink, _rx) = ChannelSink::new();
    camera.set_sink(Some(Box::new(sink)));
    assert!(camera.start(false));

    camera.set_sink(None);
    assert!(!camera.has_sink());
    assert!(camera.is_grabbing());
    assert!(wait_until(Duration::from_secs(2), || camera
        .stats()
        .render
        .dropped
        > 0));
    Ok(())
}
