//! Render dispatch.
//!
//! `RenderDispatcher` owns the optional sink and serializes every delivery to
//! it behind one mutex: frames are presented one at a time in arrival order,
//! with nothing buffered beyond the frame in flight. Presentation failures are
//! logged and never stop the caller.

use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};

use crate::convert;
use crate::error::SessionError;
use crate::frame::{Frame, SurfaceFormat};
use crate::sink::FrameSink;

/// Delivery counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub presented: u64,
    /// Frames dropped because no sink was attached or it was inactive.
    pub dropped: u64,
    /// Negotiation or presentation failures.
    pub failures: u64,
}

struct DispatchState {
    sink: Option<Box<dyn FrameSink>>,
    negotiated: Option<(u32, u32)>,
    stats: RenderStats,
}

pub struct RenderDispatcher {
    format: SurfaceFormat,
    state: Mutex<DispatchState>,
}

impl RenderDispatcher {
    pub fn new(format: SurfaceFormat) -> Self {
        Self {
            format,
            state: Mutex::new(DispatchState {
                sink: None,
                negotiated: None,
                stats: RenderStats::default(),
            }),
        }
    }

    /// Presentation format frames are converted to before delivery.
    pub fn surface_format(&self) -> SurfaceFormat {
        self.format
    }

    /// Replace the sink. Returns whether a sink is now attached.
    pub fn set_sink(&self, sink: Option<Box<dyn FrameSink>>) -> bool {
        let Ok(mut state) = self.lock() else {
            return false;
        };
        state.sink = sink;
        state.negotiated = None;
        state.sink.is_some()
    }

    pub fn has_sink(&self) -> bool {
        self.lock().map(|s| s.sink.is_some()).unwrap_or(false)
    }

    /// Forget the negotiated geometry so the next frame renegotiates.
    pub fn reset(&self) {
        if let Ok(mut state) = self.lock() {
            state.negotiated = None;
        }
    }

    /// Negotiate the presentation format for `width` x `height`.
    ///
    /// Without a sink there is nothing to negotiate and this succeeds.
    pub fn negotiate(&self, width: u32, height: u32) -> Result<()> {
        let mut state = self.lock()?;
        Self::negotiate_locked(&mut state, self.format, width, height)
    }

    /// Present one frame. Never fails; problems are logged and counted.
    pub fn present(&self, frame: &Frame) {
        let Ok(mut state) = self.lock() else {
            log::warn!("Render: dispatcher lock poisoned, frame {} dropped", frame.block_id);
            return;
        };
        if state.sink.is_none() {
            state.stats.dropped += 1;
            return;
        }

        let converted;
        let frame = if frame.format == self.format {
            frame
        } else {
            match convert::to_surface(frame, self.format) {
                Ok(f) => {
                    converted = f;
                    &converted
                }
                Err(err) => {
                    log::warn!("Render: frame {} not presentable: {:#}", frame.block_id, err);
                    state.stats.failures += 1;
                    return;
                }
            }
        };

        if state.negotiated != Some(frame.size()) {
            if let Err(err) =
                Self::negotiate_locked(&mut state, self.format, frame.width, frame.height)
            {
                log::warn!("Render: {:#}", err);
                state.stats.failures += 1;
                return;
            }
        }

        let DispatchState { sink, stats, .. } = &mut *state;
        let Some(sink) = sink.as_mut() else {
            return;
        };
        if !sink.is_active() {
            log::debug!("Render: sink inactive, frame {} dropped", frame.block_id);
            stats.dropped += 1;
            return;
        }
        match sink.present(frame) {
            Ok(()) => stats.presented += 1,
            Err(err) => {
                log::warn!("Render: present frame {} failed: {:#}", frame.block_id, err);
                stats.failures += 1;
            }
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.lock().map(|s| s.stats).unwrap_or_default()
    }

    fn negotiate_locked(
        state: &mut DispatchState,
        format: SurfaceFormat,
        width: u32,
        height: u32,
    ) -> Result<()> {
        let Some(sink) = state.sink.as_mut() else {
            return Ok(());
        };
        match sink.negotiate_format(width, height, format) {
            Ok(()) => {
                state.negotiated = Some((width, height));
                log::debug!("Render: negotiated {}x{} {}", width, height, format);
                Ok(())
            }
            Err(err) => {
                state.negotiated = None;
                Err(SessionError::SinkNegotiationFailure(format!(
                    "{}x{} {}: {:#}",
                    width, height, format, err
                ))
                .into())
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, DispatchState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("render dispatcher lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::{ChannelSink, SinkEvent};

    fn rgb32(width: u32, height: u32, block_id: u64) -> Frame {
        Frame::new(
            width,
            height,
            SurfaceFormat::Rgb32,
            block_id,
            vec![0; (width * height * 4) as usize],
        )
    }

    #[test]
    fn no_sink_drops_silently() {
        let dispatcher = RenderDispatcher::new(SurfaceFormat::Rgb32);
        dispatcher.present(&rgb32(2, 2, 1));
        assert_eq!(dispatcher.stats().dropped, 1);
        assert!(dispatcher.negotiate(2, 2).is_ok());
    }

    #[test]
    fn first_frame_negotiates_then_presents_in_order() {
        let dispatcher = RenderDispatcher::new(SurfaceFormat::Rgb32);
        let (sink, rx) = ChannelSink::new();
        assert!(dispatcher.set_sink(Some(Box::new(sink))));

        for id in 1..=3 {
            dispatcher.present(&rgb32(4, 2, id));
        }

        let events: Vec<SinkEvent> = rx.try_iter().collect();
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events[0],
            SinkEvent::Negotiated {
                width: 4,
                height: 2,
                ..
            }
        ));
        let ids: Vec<u64> = events[1..]
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Presented(f) => Some(f.block_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(dispatcher.stats().presented, 3);
    }

    #[test]
    fn rejected_negotiation_is_reported_and_frames_dropped() {
        let dispatcher = RenderDispatcher::new(SurfaceFormat::Rgb32);
        let (sink, rx) = ChannelSink::new();
        dispatcher.set_sink(Some(Box::new(sink.rejecting(8, 8))));

        let err = dispatcher.negotiate(8, 8).unwrap_err();
        assert_eq!(SessionError::kind_of(&err), ErrorKind::SinkNegotiationFailure);

        dispatcher.present(&rgb32(8, 8, 1));
        assert_eq!(dispatcher.stats().failures, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rgb24_frames_are_converted_for_the_sink() {
        let dispatcher = RenderDispatcher::new(SurfaceFormat::Rgb32);
        let (sink, rx) = ChannelSink::new();
        dispatcher.set_sink(Some(Box::new(sink)));
        dispatcher.present(&Frame::new(1, 1, SurfaceFormat::Rgb24, 9, vec![1, 2, 3]));

        let presented = rx.try_iter().find_map(|e| match e {
            SinkEvent::Presented(f) => Some(f),
            _ => None,
        });
        let frame = presented.expect("presented frame");
        assert_eq!(frame.format, SurfaceFormat::Rgb32);
        assert_eq!(frame.pixels(), &[3, 2, 1, 0xff]);
    }
}
