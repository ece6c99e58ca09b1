//! Acquisition pump.
//!
//! Two ways of pulling frames out of a device:
//! - `grab`: a bounded burst retrieved synchronously on the caller's thread
//! - `start_continuous`: the device produces `RawGrab`s on its own thread and
//!   a consumer thread converts each one and hands it to the render dispatcher
//!
//! The pump never touches session state; it only sees the device it is given
//! and the dispatcher. Counters are per pump and reset on every open.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::convert;
use crate::driver::Device;
use crate::error::SessionError;
use crate::frame::{Frame, RawGrab};
use crate::render::RenderDispatcher;

pub const DEFAULT_RETRIEVE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Retrievals in a row that may time out before a burst is abandoned. A
/// single shot (`n == 0`) retrieves exactly once.
pub const MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Raw grabs queued between the driver thread and the consumer.
const GRAB_QUEUE_DEPTH: usize = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Frames handed to the dispatcher in continuous mode.
    pub frames_delivered: u64,
    /// Frames returned by bursts.
    pub frames_captured: u64,
    /// Unsuccessful grabs.
    pub frames_dropped: u64,
    pub conversion_failures: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    captured: AtomicU64,
    dropped: AtomicU64,
    conversion_failures: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct AcquisitionPump {
    retrieve_timeout: Duration,
    counters: Arc<Counters>,
    consumer: Option<JoinHandle<()>>,
}

impl AcquisitionPump {
    pub fn new(retrieve_timeout: Duration) -> Self {
        Self {
            retrieve_timeout,
            counters: Arc::new(Counters::default()),
            consumer: None,
        }
    }

    pub fn retrieve_timeout(&self) -> Duration {
        self.retrieve_timeout
    }

    pub fn reset_counters(&self) {
        for counter in [
            &self.counters.delivered,
            &self.counters.captured,
            &self.counters.dropped,
            &self.counters.conversion_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn stats(&self) -> PumpStats {
        PumpStats {
            frames_delivered: self.counters.delivered.load(Ordering::Relaxed),
            frames_captured: self.counters.captured.load(Ordering::Relaxed),
            frames_dropped: self.counters.dropped.load(Ordering::Relaxed),
            conversion_failures: self.counters.conversion_failures.load(Ordering::Relaxed),
        }
    }

    /// Whether the continuous consumer is running.
    pub fn is_running(&self) -> bool {
        self.consumer.is_some()
    }

    /// Grab a bounded burst.
    ///
    /// `n == 0` is a single synchronous shot: zero or one frame comes back, a
    /// timeout is simply an empty result. For `n > 0` up to `n` successfully
    /// decoded frames are returned; unsuccessful grabs are skipped and not
    /// counted. With `keep_grabbing == false` the burst ends after the first
    /// successful frame. Acquisition is stopped before returning.
    pub fn grab(
        &self,
        device: &mut dyn Device,
        n: u32,
        keep_grabbing: bool,
    ) -> Result<Vec<Frame>> {
        if !device.is_open() {
            return Err(SessionError::NotOpen.into());
        }
        let target = n.max(1);
        let single = n == 0 || !keep_grabbing;

        device
            .start_bounded(target)
            .map_err(|e| SessionError::DriverError(format!("start bounded grab: {:#}", e)))?;
        let timeout_limit = if n == 0 { 1 } else { MAX_CONSECUTIVE_TIMEOUTS };
        let burst = self.drain_burst(device, target as usize, single, timeout_limit);
        let stopped = device.stop();

        let frames = burst?;
        stopped.context("stop bounded grab")?;
        log::debug!(
            "Pump: burst of {} requested, {} frames returned",
            n,
            frames.len()
        );
        Ok(frames)
    }

    fn drain_burst(
        &self,
        device: &mut dyn Device,
        target: usize,
        single: bool,
        timeout_limit: u32,
    ) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        let mut timeouts = 0;
        while device.is_grabbing() && frames.len() < target {
            let grab = device
                .retrieve(self.retrieve_timeout)
                .map_err(|e| SessionError::DriverError(format!("retrieve: {:#}", e)))?;
            if grab.is_timeout() {
                timeouts += 1;
                if timeouts >= timeout_limit {
                    log::warn!(
                        "Pump: {} retrievals timed out after {:?}, ending burst",
                        timeouts,
                        self.retrieve_timeout
                    );
                    break;
                }
                continue;
            }
            timeouts = 0;

            let Some(frame) = self.decode(grab) else {
                continue;
            };
            Counters::bump(&self.counters.captured);
            frames.push(frame);
            if single {
                break;
            }
        }
        Ok(frames)
    }

    fn decode(&self, grab: RawGrab) -> Option<Frame> {
        if !grab.succeeded {
            let dropped = Counters::bump(&self.counters.dropped);
            log::debug!(
                "Pump: grab unsuccessful ({}), {} dropped so far",
                grab.error.as_deref().unwrap_or("no payload"),
                dropped
            );
            return None;
        }
        let raw = grab.payload?;
        match convert::to_rgb(&raw) {
            Ok(frame) => Some(frame),
            Err(err) => {
                Counters::bump(&self.counters.conversion_failures);
                log::warn!("Pump: failed to convert frame {}: {:#}", raw.block_id, err);
                None
            }
        }
    }

    /// Start continuous delivery into `dispatcher`. No-op when already running.
    pub fn start_continuous(
        &mut self,
        device: &mut dyn Device,
        dispatcher: Arc<RenderDispatcher>,
    ) -> Result<()> {
        if self.consumer.is_some() {
            return Ok(());
        }
        if !device.is_open() {
            return Err(SessionError::NotOpen.into());
        }

        let (tx, rx) = mpsc::sync_channel(GRAB_QUEUE_DEPTH);
        device
            .start_continuous(tx)
            .map_err(|e| SessionError::DriverError(format!("start grabbing: {:#}", e)))?;

        let counters = self.counters.clone();
        let spawned = thread::Builder::new()
            .name("camera-pump".to_string())
            .spawn(move || consume(rx, dispatcher, counters));
        match spawned {
            Ok(join) => {
                self.consumer = Some(join);
                log::debug!("Pump: continuous delivery started");
                Ok(())
            }
            Err(err) => {
                if let Err(stop_err) = device.stop() {
                    log::warn!("Pump: stop after failed spawn: {:#}", stop_err);
                }
                Err(anyhow::Error::new(err).context("spawn pump consumer"))
            }
        }
    }

    /// Stop continuous delivery. Safe to call when not grabbing.
    ///
    /// The driver is stopped first; a frame already being presented is allowed
    /// to finish before the consumer is joined.
    pub fn stop_continuous(&mut self, device: &mut dyn Device) -> Result<()> {
        if self.consumer.is_none() && !device.is_grabbing() {
            return Ok(());
        }
        if let Err(err) = device.stop() {
            // The producer may still hold the sender; joining would hang.
            self.consumer = None;
            return Err(err.context("stop grabbing"));
        }
        if let Some(join) = self.consumer.take() {
            join.join().map_err(|_| anyhow!("pump consumer panicked"))?;
            log::debug!("Pump: continuous delivery stopped");
        }
        Ok(())
    }
}

fn consume(rx: Receiver<RawGrab>, dispatcher: Arc<RenderDispatcher>, counters: Arc<Counters>) {
    let format = dispatcher.surface_format();
    for grab in rx {
        if !grab.succeeded {
            let dropped = Counters::bump(&counters.dropped);
            log::debug!(
                "Pump: grab unsuccessful ({}), {} dropped so far",
                grab.error.as_deref().unwrap_or("timeout"),
                dropped
            );
            continue;
        }
        let Some(raw) = grab.payload else {
            continue;
        };
        match convert::to_presentation(&raw, format) {
            Ok(frame) => {
                let delivered = Counters::bump(&counters.delivered);
                log::trace!("Pump: frame {} (#{}) delivered", frame.block_id, delivered);
                dispatcher.present(&frame);
            }
            Err(err) => {
                let failures = Counters::bump(&counters.conversion_failures);
                log::warn!(
                    "Pump: failed to convert frame {} ({} failures): {:#}",
                    raw.block_id,
                    failures,
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DeviceDriver, SimCameraSpec, SimulatedDriver};
    use crate::error::ErrorKind;
    use crate::frame::SurfaceFormat;
    use crate::sink::{ChannelSink, SinkEvent};
    use std::time::Instant;

    fn open_device(spec: SimCameraSpec) -> Result<Box<dyn Device>> {
        let driver = SimulatedDriver::new(vec![spec]);
        let info = driver.enumerate()?.remove(0);
        let mut device = driver.connect(&info)?;
        device.open()?;
        Ok(device)
    }

    #[test]
    fn single_shot_returns_one_frame_and_stops() -> Result<()> {
        let mut device = open_device(SimCameraSpec::new("S", "10.0.0.5", "sim"))?;
        let pump = AcquisitionPump::new(DEFAULT_RETRIEVE_TIMEOUT);
        let frames = pump.grab(device.as_mut(), 0, false)?;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].format, SurfaceFormat::Rgb24);
        assert!(!device.is_grabbing());
        Ok(())
    }

    #[test]
    fn failed_grabs_do_not_count() -> Result<()> {
        let spec = SimCameraSpec::new("S", "10.0.0.5", "sim").with_fail_every(3);
        let mut device = open_device(spec)?;
        let pump = AcquisitionPump::new(DEFAULT_RETRIEVE_TIMEOUT);
        // bounded sequence of 5 yields blocks 1,2,4,5 (3 fails)
        let frames = pump.grab(device.as_mut(), 5, true)?;
        let ids: Vec<u64> = frames.iter().map(|f| f.block_id).collect();
        assert_eq!(ids, vec![1, 2, 4, 5]);
        assert_eq!(pump.stats().frames_dropped, 1);
        Ok(())
    }

    #[test]
    fn keep_grabbing_false_stops_after_first_success() -> Result<()> {
        let mut device = open_device(SimCameraSpec::new("S", "10.0.0.5", "sim"))?;
        let pump = AcquisitionPump::new(DEFAULT_RETRIEVE_TIMEOUT);
        let frames = pump.grab(device.as_mut(), 4, false)?;
        assert_eq!(frames.len(), 1);
        assert!(!device.is_grabbing());
        Ok(())
    }

    #[test]
    fn timeouts_end_the_burst_without_error() -> Result<()> {
        let spec = SimCameraSpec::new("S", "10.0.0.5", "sim")
            .with_frame_interval(Duration::from_millis(50));
        let mut device = open_device(spec)?;
        let pump = AcquisitionPump::new(Duration::from_millis(5));
        let frames = pump.grab(device.as_mut(), 0, false)?;
        assert!(frames.is_empty());
        Ok(())
    }

    #[test]
    fn single_shot_retrieves_once_before_giving_up() -> Result<()> {
        let spec = SimCameraSpec::new("S", "10.0.0.5", "sim")
            .with_frame_interval(Duration::from_secs(5));
        let mut device = open_device(spec)?;
        let pump = AcquisitionPump::new(Duration::from_millis(100));

        let started = Instant::now();
        assert!(pump.grab(device.as_mut(), 0, true)?.is_empty());
        assert!(started.elapsed() < Duration::from_millis(250));

        let started = Instant::now();
        assert!(pump.grab(device.as_mut(), 2, true)?.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(300));
        Ok(())
    }

    #[test]
    fn closed_device_is_not_open_error() -> Result<()> {
        let mut device = open_device(SimCameraSpec::new("S", "10.0.0.5", "sim"))?;
        device.close()?;
        let pump = AcquisitionPump::new(DEFAULT_RETRIEVE_TIMEOUT);
        let err = pump.grab(device.as_mut(), 0, false).unwrap_err();
        assert_eq!(SessionError::kind_of(&err), ErrorKind::NotOpen);
        Ok(())
    }

    #[test]
    fn continuous_frames_reach_the_sink_in_order() -> Result<()> {
        let mut device = open_device(SimCameraSpec::new("S", "10.0.0.5", "sim"))?;
        let dispatcher = Arc::new(RenderDispatcher::new(SurfaceFormat::Rgb32));
        let (sink, rx) = ChannelSink::new();
        dispatcher.set_sink(Some(Box::new(sink)));

        let mut pump = AcquisitionPump::new(DEFAULT_RETRIEVE_TIMEOUT);
        pump.start_continuous(device.as_mut(), dispatcher.clone())?;
        let mut ids = Vec::new();
        while ids.len() < 5 {
            match rx.recv_timeout(Duration::from_secs(2))? {
                SinkEvent::Presented(frame) => {
                    assert_eq!(frame.format, SurfaceFormat::Rgb32);
                    ids.push(frame.block_id);
                }
                SinkEvent::Negotiated { .. } => {}
            }
        }
        pump.stop_continuous(device.as_mut())?;
        pump.stop_continuous(device.as_mut())?;

        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert!(!pump.is_running());
        assert!(pump.stats().frames_delivered >= 5);
        Ok(())
    }
}
