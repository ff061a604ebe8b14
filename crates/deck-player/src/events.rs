//! Outgoing event queue.
//!
//! The core pushes [`PlayerEvent`]s and never looks at who consumes them. Any number of
//! clones can push; receivers are cloned from [`EventQueue::receiver`].

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use deck_types::PlayerEvent;

#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<PlayerEvent>,
    rx: Receiver<PlayerEvent>,
}

impl EventQueue {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, event: PlayerEvent) {
        tracing::debug!(?event, "player event");
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.tx.send(event);
    }

    pub fn try_pop(&self) -> Option<PlayerEvent> {
        self.rx.try_recv().ok()
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<PlayerEvent> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Raw receiver for `select!`-style consumers.
    pub fn receiver(&self) -> Receiver<PlayerEvent> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_types::ErrorKind;

    #[test]
    fn events_arrive_in_order() {
        let q = EventQueue::new();
        let producer = q.clone();
        producer.push(PlayerEvent::BufferingStarted);
        producer.push(PlayerEvent::Error(ErrorKind::Stream));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop(), Some(PlayerEvent::BufferingStarted));
        assert_eq!(
            q.pop_timeout(Duration::from_millis(10)),
            Some(PlayerEvent::Error(ErrorKind::Stream))
        );
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn pop_timeout_returns_none_when_idle() {
        let q = EventQueue::new();
        assert!(q.pop_timeout(Duration::from_millis(5)).is_none());
    }
}
