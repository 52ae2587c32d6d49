//! # Amplitude Envelope
//!
//! Analytic-signal envelope of the conditioned audio, scaled into `[0, 1]`.
//!
//! ## Steps:
//! 1. FFT the signal, zero the negative frequencies and double the positive ones
//!    (DC and Nyquist bins untouched), inverse FFT. The magnitude of that analytic
//!    signal is the envelope.
//! 2. Divide by the 99th percentile so a handful of clicks cannot squash the
//!    interesting part of the range. If the percentile is zero, use the maximum.
//! 3. Clip to `[0, 1]`.
//!
//! A silent (all-zero) signal has no meaningful envelope and yields an empty vector.

use rustfft::{num_complex::Complex, FftPlanner};

/// Percentile used as the normalization reference.
const NORMALIZATION_PERCENTILE: f64 = 99.0;

#[derive(Debug, Default, Clone)]
pub struct EnvelopeExtractor;

impl EnvelopeExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Normalized envelope, or an empty vector for empty or silent input.
    pub fn extract(&self, signal: &[f64]) -> Vec<f64> {
        let envelope = hilbert_magnitude(signal);
        if envelope.is_empty() {
            return envelope;
        }

        let mut scale = percentile(&envelope, NORMALIZATION_PERCENTILE);
        if !(scale > 0.0) {
            scale = envelope.iter().cloned().fold(0.0, f64::max);
        }
        if !(scale > 0.0) {
            return Vec::new();
        }

        envelope.iter().map(|&e| (e / scale).clamp(0.0, 1.0)).collect()
    }
}

/// Magnitude of the analytic signal.
pub fn hilbert_magnitude(signal: &[f64]) -> Vec<f64> {
    let n = signal.len();
    if n == 0 {
        return Vec::new();
    }

    let mut planner = FftPlanner::<f64>::new();
    let forward = planner.plan_fft_forward(n);
    let inverse = planner.plan_fft_inverse(n);

    let mut buffer: Vec<Complex<f64>> = signal.iter().map(|&x| Complex::new(x, 0.0)).collect();
    forward.process(&mut buffer);

    // Positive frequencies doubled, negative zeroed; bin 0 (and n/2 when n is even) kept
    let half = n / 2;
    let positive_end = if n % 2 == 0 { half } else { half + 1 };
    for bin in buffer.iter_mut().take(positive_end).skip(1) {
        *bin *= 2.0;
    }
    for bin in buffer.iter_mut().skip(half + 1) {
        *bin = Complex::new(0.0, 0.0);
    }

    inverse.process(&mut buffer);
    let scale = 1.0 / n as f64;
    buffer.iter().map(|c| c.norm() * scale).collect()
}

/// Percentile with linear interpolation between closest ranks.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = (pct / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let frac = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}
