//! Frequency-domain amplitude estimation for the orb
//!
//! One analyzer exists per direction. The audio thread pushes samples, the UI
//! thread reads a smoothed 0..1 amplitude once per frame.

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// FFT window length (128 frequency bins)
pub const FFT_SIZE: usize = 256;

/// Decibel range mapped onto 0..1
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Per-bin smoothing between successive reads
const SMOOTHING_TIME_CONSTANT: f32 = 0.8;

/// Shared amplitude analyzer - thread-safe
#[derive(Clone)]
pub struct Analyzer {
    inner: Arc<Mutex<AnalyzerInner>>,
}

struct AnalyzerInner {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Most recent FFT_SIZE samples, oldest first
    history: Vec<f32>,
    /// Smoothed linear magnitude per bin
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl Analyzer {
    pub fn new() -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);

        // Hann window
        let window = (0..FFT_SIZE)
            .map(|i| {
                0.5 * (1.0
                    - (2.0 * std::f32::consts::PI * i as f32 / (FFT_SIZE - 1) as f32).cos())
            })
            .collect();

        Self {
            inner: Arc::new(Mutex::new(AnalyzerInner {
                fft,
                window,
                history: vec![0.0; FFT_SIZE],
                smoothed: vec![0.0; FFT_SIZE / 2],
                scratch: vec![Complex::new(0.0, 0.0); FFT_SIZE],
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AnalyzerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append samples from the audio thread
    pub fn push(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if samples.len() >= FFT_SIZE {
            inner
                .history
                .copy_from_slice(&samples[samples.len() - FFT_SIZE..]);
        } else {
            inner.history.drain(..samples.len());
            inner.history.extend_from_slice(samples);
        }
    }

    /// Current amplitude in 0.0..=1.0
    pub fn amplitude(&self) -> f32 {
        let mut guard = self.lock();
        let inner = &mut *guard;

        for (slot, (&sample, &w)) in inner
            .scratch
            .iter_mut()
            .zip(inner.history.iter().zip(inner.window.iter()))
        {
            *slot = Complex::new(sample * w, 0.0);
        }
        inner.fft.process(&mut inner.scratch);

        let mut total = 0.0f32;
        for (bin, value) in inner.smoothed.iter_mut().zip(inner.scratch.iter()) {
            let magnitude = value.norm() / FFT_SIZE as f32;
            *bin = SMOOTHING_TIME_CONSTANT * *bin + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            total += normalize_decibels(*bin);
        }

        (total / inner.smoothed.len() as f32).clamp(0.0, 1.0)
    }

    /// Forget all history (new session)
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.history.iter_mut().for_each(|s| *s = 0.0);
        inner.smoothed.iter_mut().for_each(|s| *s = 0.0);
    }
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Map a linear magnitude onto 0..1 through the decibel window
fn normalize_decibels(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noise(len: usize) -> Vec<f32> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
            })
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let analyzer = Analyzer::new();
        analyzer.push(&[0.0; 512]);
        assert_eq!(analyzer.amplitude(), 0.0);
    }

    #[test]
    fn test_noise_raises_amplitude() {
        let analyzer = Analyzer::new();
        let samples = noise(FFT_SIZE);
        let mut level = 0.0;
        for _ in 0..10 {
            analyzer.push(&samples);
            level = analyzer.amplitude();
        }
        assert!(level > 0.3, "level was {level}");
        assert!(level <= 1.0);
    }

    #[test]
    fn test_reset_clears_history() {
        let analyzer = Analyzer::new();
        analyzer.push(&noise(FFT_SIZE));
        analyzer.amplitude();
        analyzer.reset();
        assert_eq!(analyzer.amplitude(), 0.0);
    }

    #[test]
    fn test_short_push_keeps_window_length() {
        let analyzer = Analyzer::new();
        analyzer.push(&[0.25; 10]);
        let inner = analyzer.lock();
        assert_eq!(inner.history.len(), FFT_SIZE);
        assert_eq!(inner.history[FFT_SIZE - 1], 0.25);
        assert_eq!(inner.history[0], 0.0);
    }
}
