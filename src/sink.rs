//! Frame presentation sinks.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

use crate::frame::{Frame, SurfaceFormat};

/// Presentation target for decoded frames.
///
/// Calls are serialized by the render dispatcher; an implementation never sees
/// two frames at once.
pub trait FrameSink: Send {
    /// Prepare for frames of the given geometry and format.
    fn negotiate_format(&mut self, width: u32, height: u32, format: SurfaceFormat) -> Result<()>;

    fn present(&mut self, frame: &Frame) -> Result<()>;

    /// False until a format has been negotiated, or after the sink shut down.
    fn is_active(&self) -> bool;
}

/// Snapshot of a `StatsSink`'s counters.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SinkStats {
    pub frames: u64,
    pub width: u32,
    pub height: u32,
    pub last_block_id: Option<u64>,
    pub fps: f64,
}

/// Counts presented frames and reports throughput. Pixels are discarded.
pub struct StatsSink {
    label: String,
    format: Option<(u32, u32, SurfaceFormat)>,
    stats: Arc<Mutex<SinkStats>>,
    window_start: Instant,
    window_frames: u64,
}

impl StatsSink {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            format: None,
            stats: Arc::new(Mutex::new(SinkStats::default())),
            window_start: Instant::now(),
            window_frames: 0,
        }
    }

    /// Shared handle to the counters, readable after the sink moved into a
    /// session.
    pub fn stats_handle(&self) -> Arc<Mutex<SinkStats>> {
        self.stats.clone()
    }
}

impl FrameSink for StatsSink {
    fn negotiate_format(&mut self, width: u32, height: u32, format: SurfaceFormat) -> Result<()> {
        log::info!(
            "{}: presenting {}x{} {}",
            self.label,
            width,
            height,
            format
        );
        self.format = Some((width, height, format));
        self.window_start = Instant::now();
        self.window_frames = 0;
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| anyhow!("sink stats lock poisoned"))?;
        stats.width = width;
        stats.height = height;
        Ok(())
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        let Some((width, height, format)) = self.format else {
            return Err(anyhow!("{}: no format negotiated", self.label));
        };
        if frame.size() != (width, height) || frame.format != format {
            return Err(anyhow!(
                "{}: frame {}x{} {} does not match {}x{} {}",
                self.label,
                frame.width,
                frame.height,
                frame.format,
                width,
                height,
                format
            ));
        }

        self.window_frames += 1;
        let elapsed = self.window_start.elapsed();
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| anyhow!("sink stats lock poisoned"))?;
        stats.frames += 1;
        stats.last_block_id = Some(frame.block_id);
        if elapsed >= Duration::from_secs(1) {
            stats.fps = self.window_frames as f64 / elapsed.as_secs_f64();
            self.window_start = Instant::now();
            self.window_frames = 0;
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.format.is_some()
    }
}

/// Messages emitted by a `ChannelSink`.
#[derive(Clone, Debug, PartialEq)]
pub enum SinkEvent {
    Negotiated {
        width: u32,
        height: u32,
        format: SurfaceFormat,
    },
    Presented(Frame),
}

/// Forwards negotiations and presented frames over a channel.
///
/// `reject_sizes` makes negotiation fail for the listed geometries.
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
    active: bool,
    reject_sizes: Vec<(u32, u32)>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                tx,
                active: false,
                reject_sizes: Vec::new(),
            },
            rx,
        )
    }

    pub fn rejecting(mut self, width: u32, height: u32) -> Self {
        self.reject_sizes.push((width, height));
        self
    }
}

impl FrameSink for ChannelSink {
    fn negotiate_format(&mut self, width: u32, height: u32, format: SurfaceFormat) -> Result<()> {
        if self.reject_sizes.contains(&(width, height)) {
            self.active = false;
            return Err(anyhow!("unsupported surface size {}x{}", width, height));
        }
        self.active = true;
        self.tx
            .send(SinkEvent::Negotiated {
                width,
                height,
                format,
            })
            .map_err(|_| anyhow!("sink receiver dropped"))
    }

    fn present(&mut self, frame: &Frame) -> Result<()> {
        self.tx
            .send(SinkEvent::Presented(frame.clone()))
            .map_err(|_| anyhow!("sink receiver dropped"))
    }

    fn is_active(&self) -> bool {
        self.active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_sink_counts_matching_frames() -> Result<()> {
        let mut sink = StatsSink::new("test");
        let stats = sink.stats_handle();
        assert!(!sink.is_active());

        sink.negotiate_format(1, 1, SurfaceFormat::Rgb32)?;
        sink.present(&Frame::new(1, 1, SurfaceFormat::Rgb32, 4, vec![0; 4]))?;
        assert!(sink
            .present(&Frame::new(2, 1, SurfaceFormat::Rgb32, 5, vec![0; 8]))
            .is_err());

        let snapshot = stats.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        assert_eq!(snapshot.frames, 1);
        assert_eq!(snapshot.last_block_id, Some(4));
        Ok(())
    }

    #[test]
    fn channel_sink_rejects_configured_sizes() {
        let (sink, _rx) = ChannelSink::new();
        let mut sink = sink.rejecting(640, 480);
        assert!(sink
            .negotiate_format(640, 480, SurfaceFormat::Rgb32)
            .is_err());
        assert!(!sink.is_active());
    }
}
