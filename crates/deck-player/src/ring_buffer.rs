//! Fixed-capacity circular byte store.
//!
//! Used for both the playback staging buffer (inside [`crate::sink::AudioSink`]) and the
//! network read-ahead cache (inside [`crate::reader::StreamReader`]).
//!
//! Writes and reads are all-or-nothing: a request that cannot be satisfied completely
//! leaves the buffer untouched. The type has no internal lock; owners wrap it in their
//! own mutex.

use crate::error::PlayerError;

/// Circular byte buffer with single-level rollback.
pub struct RingBuffer {
    data: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    fill: usize,
    rollback: Option<Snapshot>,
}

#[derive(Clone, Copy, Debug)]
struct Snapshot {
    read_pos: usize,
    /// Bytes read since the mark. Writes never overwrite them while the mark exists.
    consumed: usize,
}

impl RingBuffer {
    /// Allocate a ring buffer of `capacity` bytes.
    ///
    /// Panics only if the allocator aborts; use [`RingBuffer::try_new`] where the
    /// capacity comes from configuration.
    pub fn new(capacity: usize) -> Self {
        Self::from_storage(vec![0u8; capacity].into_boxed_slice())
    }

    /// Allocate a ring buffer, reporting allocation failure instead of aborting.
    pub fn try_new(capacity: usize) -> Result<Self, PlayerError> {
        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| PlayerError::OutOfMemory(capacity))?;
        storage.resize(capacity, 0);
        Ok(Self::from_storage(storage.into_boxed_slice()))
    }

    fn from_storage(data: Box<[u8]>) -> Self {
        Self {
            data,
            read_pos: 0,
            write_pos: 0,
            fill: 0,
            rollback: None,
        }
    }

    /// Total capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently stored.
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Bytes that can still be written.
    pub fn free(&self) -> usize {
        self.capacity() - self.fill
    }

    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// Reset cursors and fill without reallocating. Drops any rollback point.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.fill = 0;
        self.rollback = None;
    }

    /// Append `bytes`. Returns `false` (and changes nothing) if they do not fit.
    pub fn write(&mut self, bytes: &[u8]) -> bool {
        let protected = self.rollback.map_or(0, |snap| snap.consumed);
        if bytes.len() + protected > self.free() {
            return false;
        }
        if bytes.is_empty() {
            return true;
        }
        let cap = self.capacity();
        let first = bytes.len().min(cap - self.write_pos);
        self.data[self.write_pos..self.write_pos + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.data[..rest].copy_from_slice(&bytes[first..]);
        }
        self.write_pos = (self.write_pos + bytes.len()) % cap;
        self.fill += bytes.len();
        true
    }

    /// Read exactly `count` bytes into a new vector, or `None` if fewer are stored.
    pub fn read(&mut self, count: usize) -> Option<Vec<u8>> {
        let mut out = vec![0u8; count];
        if self.read_into(&mut out) {
            Some(out)
        } else {
            None
        }
    }

    /// Fill `target` completely from the buffer. Returns `false` (and changes nothing)
    /// if fewer than `target.len()` bytes are stored.
    ///
    /// Does not allocate, so it is safe to call from the audio callback.
    pub fn read_into(&mut self, target: &mut [u8]) -> bool {
        let count = target.len();
        if count > self.fill {
            return false;
        }
        if count == 0 {
            return true;
        }
        let cap = self.capacity();
        let first = count.min(cap - self.read_pos);
        target[..first].copy_from_slice(&self.data[self.read_pos..self.read_pos + first]);
        let rest = count - first;
        if rest > 0 {
            target[first..].copy_from_slice(&self.data[..rest]);
        }
        self.read_pos = (self.read_pos + count) % cap;
        self.fill -= count;
        if let Some(snap) = self.rollback.as_mut() {
            snap.consumed += count;
        }
        true
    }

    /// Remember the current read state so that a tentative read can be undone.
    ///
    /// Only one rollback point exists; marking again replaces the previous one.
    pub fn mark_rollback_point(&mut self) {
        self.rollback = Some(Snapshot {
            read_pos: self.read_pos,
            consumed: 0,
        });
    }

    /// Forget the rollback point, releasing the bytes it protected.
    pub fn commit(&mut self) {
        self.rollback = None;
    }

    /// Restore the read state saved by [`RingBuffer::mark_rollback_point`].
    ///
    /// Bytes written since the mark are kept. Returns `false` if no point was marked.
    /// Discarding the mark without restoring is done with [`RingBuffer::commit`].
    pub fn rollback(&mut self) -> bool {
        let Some(snap) = self.rollback.take() else {
            return false;
        };
        self.read_pos = snap.read_pos;
        self.fill += snap.consumed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_write_reject_read_write() {
        let mut rb = RingBuffer::new(16);
        assert!(rb.write(&[1; 10]));
        assert_eq!(rb.fill(), 10);
        assert!(!rb.write(&[2; 10]));
        assert_eq!(rb.fill(), 10);
        assert_eq!(rb.read(5).unwrap(), vec![1; 5]);
        assert_eq!(rb.fill(), 5);
        assert!(rb.write(&[3; 10]));
        assert_eq!(rb.fill(), 15);
    }

    #[test]
    fn roundtrip_preserves_bytes_across_wrap() {
        let mut rb = RingBuffer::new(8);
        assert!(rb.write(&[0, 1, 2, 3, 4, 5]));
        assert_eq!(rb.read(4).unwrap(), vec![0, 1, 2, 3]);
        let payload = [10, 11, 12, 13, 14, 15];
        assert!(rb.write(&payload));
        assert_eq!(rb.read(2).unwrap(), vec![4, 5]);
        assert_eq!(rb.read(6).unwrap(), payload.to_vec());
        assert!(rb.is_empty());
    }

    #[test]
    fn fill_plus_free_is_capacity_at_every_step() {
        let mut rb = RingBuffer::new(13);
        let mut seed = 7usize;
        for step in 0..200 {
            seed = seed.wrapping_mul(31).wrapping_add(step) % 97;
            let n = seed % 9;
            if step % 2 == 0 {
                let _ = rb.write(&vec![step as u8; n]);
            } else {
                let _ = rb.read(n);
            }
            assert_eq!(rb.fill() + rb.free(), rb.capacity());
        }
    }

    #[test]
    fn rejected_write_leaves_contents_unchanged() {
        let mut rb = RingBuffer::new(6);
        assert!(rb.write(b"abcd"));
        assert!(!rb.write(b"xyz"));
        assert_eq!(rb.fill(), 4);
        assert_eq!(rb.free(), 2);
        assert_eq!(rb.read(4).unwrap(), b"abcd".to_vec());
    }

    #[test]
    fn rejected_read_leaves_contents_unchanged() {
        let mut rb = RingBuffer::new(6);
        assert!(rb.write(b"ab"));
        assert!(rb.read(3).is_none());
        let mut target = [0u8; 3];
        assert!(!rb.read_into(&mut target));
        assert_eq!(rb.read(2).unwrap(), b"ab".to_vec());
    }

    #[test]
    fn rollback_restores_fill_and_data() {
        let mut rb = RingBuffer::new(8);
        assert!(rb.write(b"HTTP/1."));
        rb.mark_rollback_point();
        assert_eq!(rb.read(5).unwrap(), b"HTTP/".to_vec());
        assert_eq!(rb.fill(), 2);
        assert!(rb.rollback());
        assert_eq!(rb.fill(), 7);
        assert_eq!(rb.read(7).unwrap(), b"HTTP/1.".to_vec());
    }

    #[test]
    fn rollback_keeps_bytes_written_after_mark() {
        let mut rb = RingBuffer::new(8);
        assert!(rb.write(b"abcdef"));
        assert_eq!(rb.read(4).unwrap(), b"abcd".to_vec());
        rb.mark_rollback_point();
        assert_eq!(rb.read(2).unwrap(), b"ef".to_vec());
        assert!(rb.write(b"ghij"));
        assert!(rb.rollback());
        assert_eq!(rb.fill(), 6);
        assert_eq!(rb.read(6).unwrap(), b"efghij".to_vec());
    }

    #[test]
    fn write_does_not_clobber_bytes_protected_by_mark() {
        let mut rb = RingBuffer::new(4);
        assert!(rb.write(b"abcd"));
        rb.mark_rollback_point();
        assert_eq!(rb.read(2).unwrap(), b"ab".to_vec());
        assert!(!rb.write(b"xy"));
        rb.commit();
        assert!(rb.write(b"xy"));
        assert_eq!(rb.read(4).unwrap(), b"cdxy".to_vec());
    }

    #[test]
    fn rollback_is_single_level() {
        let mut rb = RingBuffer::new(4);
        assert!(rb.write(b"ab"));
        assert!(!rb.rollback());
        rb.mark_rollback_point();
        assert!(rb.rollback());
        assert!(!rb.rollback());
    }

    #[test]
    fn clear_resets_without_reallocating() {
        let mut rb = RingBuffer::new(4);
        assert!(rb.write(b"abc"));
        rb.clear();
        assert_eq!(rb.fill(), 0);
        assert_eq!(rb.capacity(), 4);
        assert!(rb.write(b"wxyz"));
    }

    #[test]
    fn try_new_allocates_requested_capacity() {
        let rb = RingBuffer::try_new(1024).unwrap();
        assert_eq!(rb.capacity(), 1024);
        assert_eq!(rb.free(), 1024);
    }
}
