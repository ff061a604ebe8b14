//! Playback sink: staging ring buffer between the decode thread and the output callback.
//!
//! One producer (the orchestrator's decode thread) pushes interleaved i16 PCM with
//! [`AudioSink::push`]; the output backend drains it through a [`SinkConsumer`].
//!
//! ## Real-time rules
//! [`SinkConsumer::pull`] never waits on the condition variable. On a shortfall it
//! zero-fills, bumps the underrun counter and sets *hold*, which keeps the callback
//! producing silence (without draining) until the producer has refilled at least half
//! the buffer and calls [`AudioSink::resume_if_buffered`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::PlayerError;
use crate::output::{OutputBackend, OutputFormat, OutputStream};
use crate::ring_buffer::RingBuffer;
use crate::spectrum::{Spectrum, SPECTRUM_BINS};

/// Playback ring buffer capacity in bytes.
pub const SINK_BUFFER_BYTES: usize = 131_072;

/// Volume index → raw gain (128 = unity).
pub const VOLUME_TABLE: [u16; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 16, 24, 32, 48, 64, 96, 128];

/// Highest index accepted by [`AudioSink::set_volume`]. Index 15 is only the power-on value.
pub const MAX_VOLUME_INDEX: u8 = 14;

const UNITY_GAIN: i32 = 128;
const UNDERRUN_LOG_INTERVAL_MS: u64 = 1000;

struct SinkState {
    ring: RingBuffer,
    format: Option<OutputFormat>,
    /// User pause.
    paused: bool,
    /// Device-level pause after open or an underrun; released by the producer.
    hold: bool,
    /// No more data will arrive for this session.
    done: bool,
    shutting_down: bool,
    volume_index: u8,
    volume_raw: u16,
    fade_percent: u8,
    fading: bool,
    /// Bytes delivered to the device since the last counter reset.
    byte_counter: u64,
}

impl SinkState {
    fn bytes_per_sample_frame(&self) -> u64 {
        self.format.map(|f| f.channels.max(1) as u64 * 2).unwrap_or(2)
    }
}

struct SinkShared {
    state: Mutex<SinkState>,
    cv: Condvar,
    spectrum: Spectrum,
    underruns: AtomicU64,
    last_underrun_log_ms: AtomicU64,
}

impl SinkShared {
    fn lock(&self) -> MutexGuard<'_, SinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_underrun(&self, fill: usize, wanted: usize) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_millis(0))
            .as_millis() as u64;
        let last = self.last_underrun_log_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > UNDERRUN_LOG_INTERVAL_MS {
            self.last_underrun_log_ms.store(now, Ordering::Relaxed);
            tracing::warn!(
                buffered_bytes = fill,
                wanted_bytes = wanted,
                events = self.underruns.load(Ordering::Relaxed),
                "playback buffer underrun"
            );
        }
    }
}

/// Consumer handle given to the output backend. Cheap to clone.
#[derive(Clone)]
pub struct SinkConsumer {
    shared: Arc<SinkShared>,
}

impl SinkConsumer {
    /// Fill `out` with attenuated PCM. Always fills the whole slice and returns its length.
    ///
    /// Never blocks on the condition variable; see the module docs.
    pub fn pull(&self, out: &mut [u8]) -> usize {
        let shared = &self.shared;
        let mut st = shared.lock();
        let capacity = st.ring.capacity();

        if st.paused || (st.hold && !st.done) {
            out.fill(0);
            let starving = st.ring.fill() < capacity / 8;
            drop(st);
            if starving {
                shared.cv.notify_all();
            }
            return out.len();
        }

        // Whole samples only.
        let available = st.ring.fill().min(out.len()) & !1;
        st.ring.read_into(&mut out[..available]);
        out[available..].fill(0);
        st.byte_counter += available as u64;

        let underrun = available < out.len() && !st.done;
        if underrun {
            st.hold = true;
            shared.underruns.fetch_add(1, Ordering::Relaxed);
        }
        let fill = st.ring.fill();
        let gain = st.volume_raw as i32 * st.fade_percent as i32;
        drop(st);

        shared.cv.notify_all();
        if underrun {
            shared.log_underrun(fill, out.len());
        }

        attenuate(&mut out[..available], gain);
        shared.spectrum.update(out);
        out.len()
    }
}

/// Scale native-endian i16 samples by `gain / (100 * 128)`.
fn attenuate(pcm: &mut [u8], gain: i32) {
    if gain == UNITY_GAIN * 100 {
        return;
    }
    for chunk in pcm.chunks_exact_mut(2) {
        let raw = i16::from_ne_bytes([chunk[0], chunk[1]]) as i32;
        let scaled = (raw * gain / 100 / UNITY_GAIN) as i16;
        chunk.copy_from_slice(&scaled.to_ne_bytes());
    }
}

/// Playback sink owned by the orchestrator.
pub struct AudioSink {
    shared: Arc<SinkShared>,
    backend: Box<dyn OutputBackend>,
    stream: Mutex<Option<Box<dyn OutputStream>>>,
    generation: AtomicU64,
}

impl AudioSink {
    pub fn new(backend: Box<dyn OutputBackend>) -> Self {
        Self::with_capacity(backend, SINK_BUFFER_BYTES)
    }

    pub fn with_capacity(backend: Box<dyn OutputBackend>, capacity: usize) -> Self {
        let state = SinkState {
            ring: RingBuffer::new(capacity),
            format: None,
            paused: false,
            hold: true,
            done: false,
            shutting_down: false,
            volume_index: 15,
            volume_raw: VOLUME_TABLE[15],
            fade_percent: 100,
            fading: false,
            byte_counter: 0,
        };
        Self {
            shared: Arc::new(SinkShared {
                state: Mutex::new(state),
                cv: Condvar::new(),
                spectrum: Spectrum::new(),
                underruns: AtomicU64::new(0),
                last_underrun_log_ms: AtomicU64::new(0),
            }),
            backend,
            stream: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Consumer handle for an output backend.
    pub fn consumer(&self) -> SinkConsumer {
        SinkConsumer {
            shared: self.shared.clone(),
        }
    }

    fn stream_slot(&self) -> MutexGuard<'_, Option<Box<dyn OutputStream>>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open the device for `sample_rate`/`channels`, or keep it if already open in that format.
    ///
    /// Either way the buffer is emptied, hold is set and the byte counter restarts.
    pub fn open_device(&self, sample_rate: u32, channels: u16) -> Result<(), PlayerError> {
        let format = OutputFormat {
            sample_rate,
            channels,
        };
        if sample_rate == 0 || channels == 0 {
            return Err(PlayerError::Device(format!(
                "invalid format {sample_rate} Hz / {channels} ch"
            )));
        }
        let mut slot = self.stream_slot();
        let current = self.shared.lock().format;
        if slot.is_some() && current == Some(format) {
            tracing::debug!(rate_hz = sample_rate, channels, "reusing open output device");
        } else {
            if let Some(mut old) = slot.take() {
                old.pause();
                drop(old);
                tracing::info!("output device closed for format change");
            }
            self.shared.lock().format = None;
            let mut stream = self
                .backend
                .open(format, self.consumer())
                .map_err(|e| PlayerError::Device(format!("{e:#}")))?;
            stream.play();
            *slot = Some(stream);
            self.shared.lock().format = Some(format);
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::info!(rate_hz = sample_rate, channels, generation, "output device opened");
        }
        drop(slot);

        let mut st = self.shared.lock();
        st.ring.clear();
        st.hold = true;
        st.done = false;
        st.shutting_down = false;
        st.byte_counter = 0;
        Ok(())
    }

    /// Release the output stream. Safe to call when already closed.
    pub fn close_device(&self) {
        {
            let mut st = self.shared.lock();
            st.paused = true;
        }
        let mut slot = self.stream_slot();
        if let Some(mut stream) = slot.take() {
            stream.pause();
            drop(stream);
            self.shared.lock().format = None;
            tracing::info!("output device closed");
        }
    }

    pub fn is_device_open(&self) -> bool {
        self.stream_slot().is_some()
    }

    /// Incremented every time a device is actually (re)opened.
    pub fn open_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn format(&self) -> Option<OutputFormat> {
        self.shared.lock().format
    }

    /// Append PCM. Returns `false` (nothing written) when there is not enough room.
    pub fn push(&self, pcm: &[u8]) -> bool {
        self.shared.lock().ring.write(pcm)
    }

    /// Release hold once more than half the buffer is filled (or the session is done).
    ///
    /// Returns whether the callback is now draining the buffer.
    pub fn resume_if_buffered(&self) -> bool {
        let mut st = self.shared.lock();
        if st.paused {
            return false;
        }
        if st.hold && (st.ring.fill() > st.ring.capacity() / 2 || st.done) {
            st.hold = false;
            tracing::debug!(buffered_bytes = st.ring.fill(), "playback buffer released");
        }
        !st.hold
    }

    pub fn is_holding(&self) -> bool {
        self.shared.lock().hold
    }

    /// Wait up to `timeout` until `bytes` can be pushed.
    pub fn wait_for_space(&self, bytes: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        loop {
            if st.ring.free() >= bytes {
                return true;
            }
            if st.shutting_down {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = self
                .shared
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wait up to `timeout` until the callback has drained the buffer.
    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.lock();
        loop {
            if st.ring.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || st.shutting_down {
                return false;
            }
            st = self
                .shared
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Set the user pause flag. Returns the resulting state.
    pub fn set_pause(&self, paused: bool) -> bool {
        let mut st = self.shared.lock();
        if st.paused != paused {
            st.paused = paused;
            tracing::debug!(paused, "sink pause changed");
        }
        st.paused
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    /// No more data will arrive: the callback may drain to empty without holding.
    pub fn mark_done(&self) {
        self.shared.lock().done = true;
        self.shared.cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.shared.lock().done
    }

    /// Wake every waiter and make pending waits return early. Cleared by the next open.
    pub fn begin_shutdown(&self) {
        let mut st = self.shared.lock();
        st.shutting_down = true;
        st.done = true;
        drop(st);
        self.shared.cv.notify_all();
    }

    /// Pause and discard everything buffered.
    pub fn clear_buffer(&self) {
        let mut st = self.shared.lock();
        st.paused = true;
        st.ring.clear();
        drop(st);
        self.shared.cv.notify_all();
    }

    pub fn buffer_fill(&self) -> usize {
        self.shared.lock().ring.fill()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.shared.lock().ring.capacity()
    }

    pub fn underrun_events(&self) -> u64 {
        self.shared.underruns.load(Ordering::Relaxed)
    }

    /// Set the volume index; values above 14 clamp to 14.
    pub fn set_volume(&self, index: u8) {
        let index = index.min(MAX_VOLUME_INDEX);
        let mut st = self.shared.lock();
        st.volume_index = index;
        st.volume_raw = VOLUME_TABLE[index as usize];
        tracing::debug!(index, raw = st.volume_raw, "volume set");
    }

    pub fn get_volume(&self) -> u8 {
        self.shared.lock().volume_index
    }

    pub fn volume_raw(&self) -> u16 {
        self.shared.lock().volume_raw
    }

    /// Start a fade-out from `percent` (clamped to 100).
    pub fn set_fade_target(&self, percent: u8) {
        let mut st = self.shared.lock();
        st.fade_percent = percent.min(100);
        st.fading = true;
    }

    /// Lower the fade by `step` percent. Returns `true` exactly once, when it reaches zero.
    pub fn fade_step(&self, step: u8) -> bool {
        let mut st = self.shared.lock();
        if !st.fading {
            return false;
        }
        st.fade_percent = st.fade_percent.saturating_sub(step.max(1));
        if st.fade_percent == 0 {
            st.fading = false;
            return true;
        }
        false
    }

    pub fn fade_in_progress(&self) -> bool {
        self.shared.lock().fading
    }

    pub fn fade_percent(&self) -> u8 {
        self.shared.lock().fade_percent
    }

    /// Back to full level, no fade running.
    pub fn reset_fade(&self) {
        let mut st = self.shared.lock();
        st.fade_percent = 100;
        st.fading = false;
    }

    /// Set the playtime counter to `samples` per channel.
    pub fn set_sample_count(&self, samples: u64) {
        let mut st = self.shared.lock();
        st.byte_counter = samples * st.bytes_per_sample_frame();
    }

    /// Move the playtime counter by `delta` samples per channel, never below zero.
    pub fn advance_sample_count(&self, delta: i64) {
        let mut st = self.shared.lock();
        let step = delta.unsigned_abs() * st.bytes_per_sample_frame();
        st.byte_counter = if delta >= 0 {
            st.byte_counter.saturating_add(step)
        } else {
            st.byte_counter.saturating_sub(step)
        };
    }

    /// Samples per channel delivered since the last reset.
    pub fn get_sample_count(&self) -> u64 {
        let st = self.shared.lock();
        st.byte_counter / st.bytes_per_sample_frame()
    }

    pub fn get_playtime_ms(&self) -> u64 {
        let st = self.shared.lock();
        match st.format {
            Some(f) if f.sample_rate > 0 => st.byte_counter * 1000 / f.bytes_per_second(),
            _ => 0,
        }
    }

    pub fn register_consumer(&self) {
        self.shared.spectrum.register_consumer();
    }

    pub fn unregister_consumer(&self) {
        self.shared.spectrum.unregister_consumer();
    }

    pub fn try_lock_amplitudes(&self) -> Option<MutexGuard<'_, [i16; SPECTRUM_BINS]>> {
        self.shared.spectrum.try_lock_amplitudes()
    }

    pub fn current_amplitudes(&self) -> [i16; SPECTRUM_BINS] {
        self.shared.spectrum.current_amplitudes()
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.begin_shutdown();
        self.close_device();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::NullOutput;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Backend that never starts a clock; tests drive `pull` by hand.
    #[derive(Clone, Default)]
    struct ManualOutput {
        opened: Arc<AtomicUsize>,
        fail: bool,
    }

    struct ManualStream;

    impl OutputStream for ManualStream {
        fn play(&mut self) {}
        fn pause(&mut self) {}
    }

    impl OutputBackend for ManualOutput {
        fn open(
            &self,
            _format: OutputFormat,
            _consumer: SinkConsumer,
        ) -> anyhow::Result<Box<dyn OutputStream>> {
            if self.fail {
                anyhow::bail!("no such device");
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ManualStream))
        }
    }

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    fn samples(bytes: &[u8]) -> Vec<i16> {
        bytes
            .chunks_exact(2)
            .map(|c| i16::from_ne_bytes([c[0], c[1]]))
            .collect()
    }

    fn open_sink(capacity: usize) -> AudioSink {
        let sink = AudioSink::with_capacity(Box::new(ManualOutput::default()), capacity);
        sink.open_device(44_100, 2).unwrap();
        sink
    }

    #[test]
    fn identical_open_keeps_generation() {
        let backend = ManualOutput::default();
        let opened = backend.opened.clone();
        let sink = AudioSink::new(Box::new(backend));
        sink.open_device(44_100, 2).unwrap();
        let generation = sink.open_generation();
        sink.open_device(44_100, 2).unwrap();
        assert_eq!(sink.open_generation(), generation);
        assert!(sink.is_device_open());
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        sink.open_device(48_000, 2).unwrap();
        assert_eq!(sink.open_generation(), generation + 1);
    }

    #[test]
    fn failed_open_leaves_sink_closed() {
        let sink = AudioSink::new(Box::new(ManualOutput {
            fail: true,
            ..ManualOutput::default()
        }));
        let err = sink.open_device(44_100, 2).unwrap_err();
        assert!(matches!(err, PlayerError::Device(_)));
        assert!(!sink.is_device_open());
        assert_eq!(sink.open_generation(), 0);
    }

    #[test]
    fn open_resets_buffer_counter_and_hold() {
        let sink = open_sink(64);
        assert!(sink.push(&[1; 40]));
        sink.set_sample_count(100);
        sink.open_device(44_100, 2).unwrap();
        assert_eq!(sink.buffer_fill(), 0);
        assert_eq!(sink.get_sample_count(), 0);
        assert!(sink.is_holding());
    }

    #[test]
    fn close_device_is_idempotent_and_pauses() {
        let sink = open_sink(64);
        sink.close_device();
        sink.close_device();
        assert!(!sink.is_device_open());
        assert!(sink.is_paused());
    }

    #[test]
    fn volume_table_is_monotonic_and_clamps() {
        let sink = open_sink(64);
        let mut last = 0;
        for i in 0..15u8 {
            sink.set_volume(i);
            let raw = sink.volume_raw();
            assert!(raw >= last);
            last = raw;
        }
        sink.set_volume(14);
        let fourteen = (sink.get_volume(), sink.volume_raw());
        sink.set_volume(15);
        assert_eq!((sink.get_volume(), sink.volume_raw()), fourteen);
        sink.set_volume(20);
        assert_eq!(sink.get_volume(), 14);
        assert_eq!(sink.volume_raw(), 96);
    }

    #[test]
    fn initial_volume_is_full_scale() {
        let sink = AudioSink::new(Box::new(ManualOutput::default()));
        assert_eq!(sink.get_volume(), 15);
        assert_eq!(sink.volume_raw(), 128);
    }

    #[test]
    fn fade_decreases_and_completes_once() {
        let sink = open_sink(64);
        sink.set_fade_target(100);
        let mut last = sink.fade_percent();
        let mut completions = 0;
        for _ in 0..15 {
            if sink.fade_step(10) {
                completions += 1;
            }
            let now = sink.fade_percent();
            if completions == 0 {
                assert!(now < last);
            }
            last = now;
        }
        assert_eq!(completions, 1);
        assert_eq!(sink.fade_percent(), 0);
        assert!(!sink.fade_in_progress());
        sink.reset_fade();
        assert_eq!(sink.fade_percent(), 100);
    }

    #[test]
    fn pull_outputs_silence_while_holding() {
        let sink = open_sink(64);
        assert!(sink.push(&pcm(&[1000; 8])));
        let mut out = [0xAAu8; 8];
        assert_eq!(sink.consumer().pull(&mut out), 8);
        assert_eq!(out, [0; 8]);
        assert_eq!(sink.buffer_fill(), 16);
    }

    #[test]
    fn pull_drains_after_release_and_attenuates() {
        let sink = open_sink(64);
        sink.set_volume(13);
        assert!(sink.push(&pcm(&[1000; 20])));
        assert!(sink.resume_if_buffered());
        let mut out = [0u8; 8];
        sink.consumer().pull(&mut out);
        assert_eq!(samples(&out), vec![500; 4]);
        assert_eq!(sink.get_sample_count(), 2);
    }

    #[test]
    fn fade_scales_output() {
        let sink = open_sink(64);
        assert!(sink.push(&pcm(&[1000; 20])));
        sink.resume_if_buffered();
        sink.set_fade_target(50);
        let mut out = [0u8; 4];
        sink.consumer().pull(&mut out);
        assert_eq!(samples(&out), vec![500, 500]);
    }

    #[test]
    fn underrun_zero_fills_and_sets_hold() {
        let sink = open_sink(64);
        assert!(sink.push(&pcm(&[7; 20])));
        assert!(sink.resume_if_buffered());
        let mut out = [0xFFu8; 48];
        assert_eq!(sink.consumer().pull(&mut out), 48);
        assert_eq!(samples(&out[..40]), vec![7; 20]);
        assert_eq!(&out[40..], &[0; 8]);
        assert_eq!(sink.underrun_events(), 1);
        assert!(sink.is_holding());
    }

    #[test]
    fn done_session_drains_without_underrun() {
        let sink = open_sink(64);
        assert!(sink.push(&pcm(&[3; 4])));
        sink.mark_done();
        assert!(sink.resume_if_buffered());
        let mut out = [0u8; 16];
        sink.consumer().pull(&mut out);
        assert_eq!(samples(&out[..8]), vec![3; 4]);
        assert_eq!(sink.underrun_events(), 0);
        assert!(sink.wait_until_drained(Duration::from_millis(10)));
    }

    #[test]
    fn paused_pull_does_not_consume() {
        let sink = open_sink(64);
        assert!(sink.push(&pcm(&[9; 20])));
        sink.resume_if_buffered();
        assert!(sink.set_pause(true));
        let mut out = [0u8; 8];
        sink.consumer().pull(&mut out);
        assert_eq!(out, [0; 8]);
        assert_eq!(sink.buffer_fill(), 40);
        assert!(!sink.resume_if_buffered());
    }

    #[test]
    fn clear_buffer_pauses_and_empties() {
        let sink = open_sink(64);
        assert!(sink.push(&[1; 32]));
        sink.clear_buffer();
        assert_eq!(sink.buffer_fill(), 0);
        assert!(sink.is_paused());
    }

    #[test]
    fn sample_counter_clamps_and_reports_playtime() {
        let sink = open_sink(64);
        sink.set_sample_count(44_100);
        assert_eq!(sink.get_sample_count(), 44_100);
        assert_eq!(sink.get_playtime_ms(), 1000);
        sink.advance_sample_count(22_050);
        assert_eq!(sink.get_playtime_ms(), 1500);
        sink.advance_sample_count(-1_000_000);
        assert_eq!(sink.get_sample_count(), 0);
    }

    #[test]
    fn wait_for_space_wakes_when_callback_drains() {
        let sink = Arc::new(open_sink(64));
        assert!(sink.push(&[0; 64]));
        assert!(sink.resume_if_buffered());
        assert!(!sink.wait_for_space(8, Duration::from_millis(5)));

        let consumer = sink.consumer();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut out = [0u8; 32];
            consumer.pull(&mut out);
        });
        assert!(sink.wait_for_space(32, Duration::from_secs(1)));
        t.join().unwrap();
    }

    #[test]
    fn spectrum_updates_only_with_consumer() {
        let sink = open_sink(256);
        let block = pcm(&[i16::MAX, i16::MIN].repeat(40));
        assert!(sink.push(&block));
        sink.resume_if_buffered();
        let mut out = [0u8; 32];
        sink.consumer().pull(&mut out);
        assert_eq!(sink.current_amplitudes(), [0; SPECTRUM_BINS]);

        sink.register_consumer();
        sink.consumer().pull(&mut out);
        assert_ne!(sink.current_amplitudes(), [0; SPECTRUM_BINS]);
        sink.unregister_consumer();
    }

    #[test]
    fn null_output_drains_pushed_audio() {
        let output = NullOutput::new(Duration::from_millis(2));
        let sink = AudioSink::with_capacity(Box::new(output.clone()), 4096);
        sink.open_device(8_000, 1).unwrap();
        assert!(sink.push(&pcm(&[5; 1500])));
        sink.mark_done();
        assert!(sink.resume_if_buffered());
        assert!(sink.wait_until_drained(Duration::from_secs(2)));
        assert!(output.pulled_bytes() >= 3000);
    }

    #[test]
    fn attenuated_audio_reaches_the_device() {
        let output = NullOutput::new(Duration::from_millis(2)).with_capture();
        let sink = AudioSink::with_capacity(Box::new(output.clone()), 4096);
        sink.open_device(8_000, 1).unwrap();
        sink.set_volume(11);
        assert!(sink.push(&pcm(&[4000; 1000])));
        sink.mark_done();
        assert!(sink.resume_if_buffered());
        assert!(sink.wait_until_drained(Duration::from_secs(2)));

        // The last block may still be on its way into the capture.
        let deadline = Instant::now() + Duration::from_secs(2);
        let delivered = loop {
            let delivered: Vec<i16> = samples(&output.captured().unwrap())
                .into_iter()
                .filter(|s| *s != 0)
                .collect();
            if delivered.len() >= 1000 || Instant::now() > deadline {
                break delivered;
            }
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(delivered, vec![1000; 1000]);
        assert!(NullOutput::default().captured().is_none());
    }
}
