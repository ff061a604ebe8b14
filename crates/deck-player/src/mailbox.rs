//! Single-slot handoff between controllers and the decode thread.
//!
//! `put` overwrites a value that has not been taken yet. Requesting several tracks in
//! quick succession therefore only plays the last one.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

struct Slot<T> {
    value: Option<T>,
    closed: bool,
}

pub struct Mailbox<T> {
    slot: Mutex<Slot<T>>,
    cv: Condvar,
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                value: None,
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` and wake the taker. Returns the value it replaced, if any.
    ///
    /// Ignored (value handed back) once the mailbox is closed.
    pub fn put(&self, value: T) -> Option<T> {
        let mut slot = self.lock();
        if slot.closed {
            return Some(value);
        }
        let previous = slot.value.replace(value);
        drop(slot);
        self.cv.notify_all();
        previous
    }

    /// Block until a value is available. `None` once closed.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if slot.closed {
                return None;
            }
            if let Some(value) = slot.value.take() {
                return Some(value);
            }
            slot = self.cv.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Mailbox::take`] but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self.lock();
        let (mut slot, _) = self
            .cv
            .wait_timeout_while(slot, timeout, |s| s.value.is_none() && !s.closed)
            .unwrap_or_else(PoisonError::into_inner);
        if slot.closed {
            return None;
        }
        slot.value.take()
    }

    /// Drop any pending value.
    pub fn clear(&self) -> Option<T> {
        self.lock().value.take()
    }

    pub fn is_pending(&self) -> bool {
        self.lock().value.is_some()
    }

    /// Close for good: pending and future values are discarded and takers return `None`.
    pub fn close(&self) {
        let mut slot = self.lock();
        slot.closed = true;
        slot.value = None;
        drop(slot);
        self.cv.notify_all();
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn put_overwrites_pending_value() {
        let mb = Mailbox::new();
        assert_eq!(mb.put("a.flac"), None);
        assert_eq!(mb.put("b.flac"), Some("a.flac"));
        assert!(mb.is_pending());
        assert_eq!(mb.take(), Some("b.flac"));
        assert!(!mb.is_pending());
    }

    #[test]
    fn take_blocks_until_put() {
        let mb = Arc::new(Mailbox::new());
        let taker = {
            let mb = mb.clone();
            thread::spawn(move || mb.take())
        };
        thread::sleep(Duration::from_millis(20));
        mb.put(7);
        assert_eq!(taker.join().unwrap(), Some(7));
    }

    #[test]
    fn close_wakes_taker() {
        let mb: Arc<Mailbox<u8>> = Arc::new(Mailbox::new());
        let taker = {
            let mb = mb.clone();
            thread::spawn(move || mb.take())
        };
        thread::sleep(Duration::from_millis(20));
        mb.close();
        assert_eq!(taker.join().unwrap(), None);
        assert_eq!(mb.put(1), Some(1));
    }

    #[test]
    fn take_timeout_expires() {
        let mb: Mailbox<u8> = Mailbox::new();
        assert_eq!(mb.take_timeout(Duration::from_millis(5)), None);
        mb.put(3);
        assert_eq!(mb.take_timeout(Duration::from_millis(5)), Some(3));
    }
}
