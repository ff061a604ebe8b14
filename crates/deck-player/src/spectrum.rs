//! Cheap magnitude estimator for the visualizer.
//!
//! Eight bins computed from the first 16 interleaved samples of every block the output
//! callback pulls. This is a visual effect, not a spectral analysis: there is no window, no
//! channel separation and only 16 input points.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

pub const SPECTRUM_BINS: usize = 8;
pub const SPECTRUM_POINTS: usize = 16;

/// Spectrum magnitudes shared between the output callback and visualizer consumers.
///
/// Uses its own lock, separate from the sink state. The callback only ever `try_lock`s
/// it so a slow reader can never stall audio.
pub struct Spectrum {
    table: [[(f32, f32); SPECTRUM_POINTS]; SPECTRUM_BINS],
    amplitudes: Mutex<[i16; SPECTRUM_BINS]>,
    consumers: AtomicUsize,
}

impl Spectrum {
    pub fn new() -> Self {
        let mut table = [[(0.0f32, 0.0f32); SPECTRUM_POINTS]; SPECTRUM_BINS];
        for (bin, row) in table.iter_mut().enumerate() {
            // Bin 0 would be DC; start at the first harmonic.
            let k = (bin + 1) as f32;
            for (n, slot) in row.iter_mut().enumerate() {
                let phase = 2.0 * std::f32::consts::PI * k * n as f32 / SPECTRUM_POINTS as f32;
                *slot = (phase.cos(), phase.sin());
            }
        }
        Self {
            table,
            amplitudes: Mutex::new([0; SPECTRUM_BINS]),
            consumers: AtomicUsize::new(0),
        }
    }

    pub fn register_consumer(&self) {
        self.consumers.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one consumer reference. Extra calls are ignored.
    pub fn unregister_consumer(&self) {
        let _ = self
            .consumers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    pub fn has_consumers(&self) -> bool {
        self.consumers.load(Ordering::Acquire) > 0
    }

    /// Lock the amplitudes without blocking. The guard unlocks on drop.
    pub fn try_lock_amplitudes(&self) -> Option<MutexGuard<'_, [i16; SPECTRUM_BINS]>> {
        self.amplitudes.try_lock().ok()
    }

    /// Copy of the latest magnitudes (blocking lock).
    pub fn current_amplitudes(&self) -> [i16; SPECTRUM_BINS] {
        match self.amplitudes.lock() {
            Ok(g) => *g,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Recompute the magnitudes from the start of `block` (native-endian i16 PCM).
    ///
    /// Skipped silently when nobody is registered or the lock is held by a reader.
    pub fn update(&self, block: &[u8]) {
        if !self.has_consumers() {
            return;
        }
        let Some(mut amps) = self.try_lock_amplitudes() else {
            return;
        };
        *amps = self.compute(block);
    }

    fn compute(&self, block: &[u8]) -> [i16; SPECTRUM_BINS] {
        let mut samples = [0.0f32; SPECTRUM_POINTS];
        for (slot, chunk) in samples.iter_mut().zip(block.chunks_exact(2)) {
            *slot = i16::from_ne_bytes([chunk[0], chunk[1]]) as f32;
        }
        let mut out = [0i16; SPECTRUM_BINS];
        for (bin, row) in self.table.iter().enumerate() {
            let (mut re, mut im) = (0.0f32, 0.0f32);
            for (x, (c, s)) in samples.iter().zip(row.iter()) {
                re += x * c;
                im -= x * s;
            }
            let mag = (re * re + im * im).sqrt() / (SPECTRUM_POINTS as f32 / 2.0);
            out[bin] = mag.min(i16::MAX as f32) as i16;
        }
        out
    }
}

impl Default for Spectrum {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_ne_bytes()).collect()
    }

    #[test]
    fn silence_yields_zero_bins() {
        let spectrum = Spectrum::new();
        spectrum.register_consumer();
        spectrum.update(&pcm(&[0; 16]));
        assert_eq!(spectrum.current_amplitudes(), [0; SPECTRUM_BINS]);
    }

    #[test]
    fn pure_tone_peaks_in_its_bin() {
        let spectrum = Spectrum::new();
        spectrum.register_consumer();
        // Two cycles over 16 points lands in the second bin.
        let tone: Vec<i16> = (0..16)
            .map(|n| {
                let phase = 2.0 * std::f32::consts::PI * 2.0 * n as f32 / 16.0;
                (phase.sin() * 10_000.0) as i16
            })
            .collect();
        spectrum.update(&pcm(&tone));
        let amps = spectrum.current_amplitudes();
        let peak = amps
            .iter()
            .enumerate()
            .max_by_key(|(_, v)| **v)
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 1);
        assert!(amps[1] > 9_000);
    }

    #[test]
    fn update_is_skipped_without_consumers() {
        let spectrum = Spectrum::new();
        spectrum.update(&pcm(&[i16::MAX; 16]));
        assert_eq!(spectrum.current_amplitudes(), [0; SPECTRUM_BINS]);
    }

    #[test]
    fn update_is_skipped_while_locked() {
        let spectrum = Spectrum::new();
        spectrum.register_consumer();
        let guard = spectrum.try_lock_amplitudes().unwrap();
        spectrum.update(&pcm(&[i16::MAX; 16]));
        drop(guard);
        assert_eq!(spectrum.current_amplitudes(), [0; SPECTRUM_BINS]);
    }

    #[test]
    fn unregister_never_underflows() {
        let spectrum = Spectrum::new();
        spectrum.unregister_consumer();
        assert!(!spectrum.has_consumers());
        spectrum.register_consumer();
        spectrum.register_consumer();
        spectrum.unregister_consumer();
        assert!(spectrum.has_consumers());
    }
}
