//! Output backend seam.
//!
//! [`crate::sink::AudioSink`] opens its device through an [`OutputBackend`]; the backend
//! drives a [`SinkConsumer`] from its own real-time context. [`crate::device::CpalOutput`]
//! talks to a real device, [`NullOutput`] simulates a device clock for headless runs and tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use crate::sink::SinkConsumer;

/// PCM format requested from an output device. Samples are always interleaved i16.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl OutputFormat {
    /// Bytes per second of interleaved i16 audio in this format.
    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * 2
    }
}

/// Factory for open output streams.
pub trait OutputBackend: Send + Sync {
    /// Open a stream in `format` that pulls audio from `consumer`.
    ///
    /// The stream starts paused.
    fn open(&self, format: OutputFormat, consumer: SinkConsumer) -> Result<Box<dyn OutputStream>>;
}

/// An open device stream. Dropping it closes the device.
pub trait OutputStream: Send {
    fn play(&mut self);
    fn pause(&mut self);
}

/// Headless output: a thread pulls one period of audio every `period`.
#[derive(Clone)]
pub struct NullOutput {
    period: Duration,
    pulled: Arc<AtomicU64>,
    capture: Option<Arc<Mutex<Vec<u8>>>>,
}

impl NullOutput {
    pub fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            pulled: Arc::new(AtomicU64::new(0)),
            capture: None,
        }
    }

    /// Keep a copy of every byte delivered to the simulated device.
    pub fn with_capture(mut self) -> Self {
        self.capture = Some(Arc::new(Mutex::new(Vec::new())));
        self
    }

    /// Total bytes pulled from the sink, silence included.
    pub fn pulled_bytes(&self) -> u64 {
        self.pulled.load(Ordering::Relaxed)
    }

    /// Bytes delivered so far, when capture is enabled.
    pub fn captured(&self) -> Option<Vec<u8>> {
        self.capture
            .as_ref()
            .and_then(|c| c.lock().ok().map(|g| g.clone()))
    }
}

impl Default for NullOutput {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl OutputBackend for NullOutput {
    fn open(&self, format: OutputFormat, consumer: SinkConsumer) -> Result<Box<dyn OutputStream>> {
        let frames = (format.sample_rate as u128 * self.period.as_micros() / 1_000_000).max(1);
        let block_bytes = frames as usize * format.channels.max(1) as usize * 2;
        let playing = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let playing_thread = playing.clone();
        let stop_thread = stop.clone();
        let pulled = self.pulled.clone();
        let capture = self.capture.clone();
        let period = self.period;
        let handle = thread::Builder::new()
            .name("null-output".to_string())
            .spawn(move || {
                let mut block = vec![0u8; block_bytes];
                while !stop_thread.load(Ordering::Acquire) {
                    if playing_thread.load(Ordering::Acquire) {
                        let n = consumer.pull(&mut block);
                        pulled.fetch_add(n as u64, Ordering::Relaxed);
                        if let Some(capture) = &capture {
                            if let Ok(mut g) = capture.lock() {
                                g.extend_from_slice(&block[..n]);
                            }
                        }
                    }
                    thread::sleep(period);
                }
            })?;
        tracing::debug!(
            rate_hz = format.sample_rate,
            channels = format.channels,
            block_bytes,
            "null output opened"
        );
        Ok(Box::new(NullStream {
            playing,
            stop,
            handle: Some(handle),
        }))
    }
}

struct NullStream {
    playing: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OutputStream for NullStream {
    fn play(&mut self) {
        self.playing.store(true, Ordering::Release);
    }

    fn pause(&mut self) {
        self.playing.store(false, Ordering::Release);
    }
}

impl Drop for NullStream {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_second_counts_i16_frames() {
        let fmt = OutputFormat {
            sample_rate: 44_100,
            channels: 2,
        };
        assert_eq!(fmt.bytes_per_second(), 176_400);
    }
}
