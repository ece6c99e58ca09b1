//! Session notifications.
//!
//! Subscribers get their own `mpsc::Receiver`; emitting never blocks and is
//! safe from any thread. Receivers that were dropped are pruned on the next
//! emit.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::frame::Frame;

#[derive(Clone, Debug)]
pub enum Notification {
    OpenStateChanged { is_open: bool },
    NameChanged(String),
    SinkChanged { attached: bool },
    /// One completed capture batch, in arrival order.
    FramesCaptured(Arc<[Frame]>),
    /// Latest captured frame, for live preview.
    FrameGrabbed(Arc<Frame>),
    GrabbingStarted,
    GrabbingStopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    OpenStateChanged,
    NameChanged,
    SinkChanged,
    FramesCaptured,
    FrameGrabbed,
    GrabbingStarted,
    GrabbingStopped,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::OpenStateChanged { .. } => NotificationKind::OpenStateChanged,
            Notification::NameChanged(_) => NotificationKind::NameChanged,
            Notification::SinkChanged { .. } => NotificationKind::SinkChanged,
            Notification::FramesCaptured(_) => NotificationKind::FramesCaptured,
            Notification::FrameGrabbed(_) => NotificationKind::FrameGrabbed,
            Notification::GrabbingStarted => NotificationKind::GrabbingStarted,
            Notification::GrabbingStopped => NotificationKind::GrabbingStopped,
        }
    }
}

struct Subscriber {
    kinds: Option<Vec<NotificationKind>>,
    tx: Sender<Notification>,
}

#[derive(Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every notification.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.add(None)
    }

    /// Receive only the listed kinds.
    pub fn subscribe_to(&self, kinds: &[NotificationKind]) -> Receiver<Notification> {
        self.add(Some(kinds.to_vec()))
    }

    pub fn emit(&self, notification: Notification) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            log::warn!("Notifier: subscriber list poisoned, dropping {:?}", notification.kind());
            return;
        };
        let kind = notification.kind();
        subscribers.retain(|sub| {
            let wanted = sub.kinds.as_ref().map_or(true, |kinds| kinds.contains(&kind));
            !wanted || sub.tx.send(notification.clone()).is_ok()
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn add(&self, kinds: Option<Vec<NotificationKind>>) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscriber { kinds, tx });
        }
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_subscribers_see_only_their_kinds() {
        let notifier = Notifier::new();
        let all = notifier.subscribe();
        let open_only = notifier.subscribe_to(&[NotificationKind::OpenStateChanged]);

        notifier.emit(Notification::NameChanged("cam".into()));
        notifier.emit(Notification::OpenStateChanged { is_open: true });

        assert_eq!(all.try_iter().count(), 2);
        let seen: Vec<NotificationKind> = open_only.try_iter().map(|n| n.kind()).collect();
        assert_eq!(seen, vec![NotificationKind::OpenStateChanged]);
    }

    #[test]
    fn dropped_receivers_are_pruned() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe();
        let _kept = notifier.subscribe();
        drop(rx);
        notifier.emit(Notification::GrabbingStarted);
        assert_eq!(notifier.subscriber_count(), 1);
    }
}
