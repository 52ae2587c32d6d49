//! # Signal Conditioning
//!
//! Zero-phase Butterworth low-pass applied to decoded audio before envelope
//! extraction. High-frequency hiss above the cutoff otherwise leaks into the
//! envelope and creates shallow false minima.
//!
//! ## Design:
//! - An order-`n` Butterworth is built as `n/2` cascaded biquad sections, each
//!   designed with the bilinear transform (RBJ cookbook form) and the Butterworth
//!   pole quality factors `Q_k = 1 / (2 cos((2k + 1) π / 2n))`.
//! - Zero phase comes from running the cascade forward, then backward over the
//!   reversed output, after padding both ends with an odd reflection of the signal.
//! - Each pass starts every section in the steady state for its first input sample,
//!   so a DC offset does not ring into the samples we keep.
//!
//! ## Policy:
//! Filtering never fails. Signals no longer than `3 × order` samples and cutoffs at or
//! above Nyquist are returned unchanged.

use std::f64::consts::PI;
use tracing::debug;

/// One second-order IIR section, normalized so `a0 == 1`.
#[derive(Debug, Clone, Copy)]
struct Biquad {
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
}

impl Biquad {
    fn lowpass(cutoff_hz: f64, sample_rate: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff_hz / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);
        let a0 = 1.0 + alpha;

        Self {
            b0: (1.0 - cos_w0) / 2.0 / a0,
            b1: (1.0 - cos_w0) / a0,
            b2: (1.0 - cos_w0) / 2.0 / a0,
            a1: -2.0 * cos_w0 / a0,
            a2: (1.0 - alpha) / a0,
        }
    }

    /// State the section settles into under a constant unit input.
    fn step_state(&self) -> (f64, f64) {
        let gain = (self.b0 + self.b1 + self.b2) / (1.0 + self.a1 + self.a2);
        let z2 = self.b2 - self.a2 * gain;
        let z1 = self.b1 + self.b2 - (self.a1 + self.a2) * gain;
        (z1, z2)
    }

    /// Run the section over `signal` in place (transposed direct form II), starting from
    /// the steady state for a signal that has always been `signal[0]`.
    fn run(&self, signal: &mut [f64]) {
        let Some(&first) = signal.first() else {
            return;
        };
        let (z1_unit, z2_unit) = self.step_state();
        let (mut z1, mut z2) = (z1_unit * first, z2_unit * first);
        for x in signal.iter_mut() {
            let input = *x;
            let output = self.b0 * input + z1;
            z1 = self.b1 * input - self.a1 * output + z2;
            z2 = self.b2 * input - self.a2 * output;
            *x = output;
        }
    }
}

/// Butterworth low-pass conditioner.
#[derive(Debug, Clone)]
pub struct SignalConditioner {
    cutoff_hz: f64,
    order: usize,
}

impl SignalConditioner {
    pub fn new(cutoff_hz: f64, order: usize) -> Self {
        Self { cutoff_hz, order }
    }

    /// Shortest signal the zero-phase filter will touch.
    pub fn min_length(&self) -> usize {
        3 * self.order
    }

    /// Low-pass `samples`, or hand them back unchanged when the filter can't apply.
    pub fn apply(&self, samples: &[f32], sample_rate: u32) -> Vec<f64> {
        let signal: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
        let nyquist = sample_rate as f64 / 2.0;

        if signal.len() <= self.min_length() {
            debug!(len = signal.len(), "Signal too short for zero-phase filtering, skipping");
            return signal;
        }
        if self.order == 0 || !(self.cutoff_hz > 0.0) || self.cutoff_hz >= nyquist {
            debug!(cutoff_hz = self.cutoff_hz, nyquist, "Cutoff at or above Nyquist, skipping filter");
            return signal;
        }

        let sections = self.sections(sample_rate as f64);
        let pad = self.min_length().min(signal.len() - 1);
        let mut work = odd_extend(&signal, pad);

        for section in &sections {
            section.run(&mut work);
        }
        work.reverse();
        for section in &sections {
            section.run(&mut work);
        }
        work.reverse();

        work[pad..pad + signal.len()].to_vec()
    }

    fn sections(&self, sample_rate: f64) -> Vec<Biquad> {
        let n = self.order as f64;
        (0..self.order / 2)
            .map(|k| {
                let q = 1.0 / (2.0 * ((2.0 * k as f64 + 1.0) * PI / (2.0 * n)).cos());
                Biquad::lowpass(self.cutoff_hz, sample_rate, q)
            })
            .collect()
    }
}

/// Pad both ends with `2·edge - mirrored` samples so the signal continues smoothly.
fn odd_extend(signal: &[f64], pad: usize) -> Vec<f64> {
    let n = signal.len();
    let first = signal[0];
    let last = signal[n - 1];

    let mut out = Vec::with_capacity(n + 2 * pad);
    out.extend((1..=pad).rev().map(|i| 2.0 * first - signal[i]));
    out.extend_from_slice(signal);
    out.extend((1..=pad).map(|i| 2.0 * last - signal[n - 1 - i]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, sample_rate: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f64 / sample_rate as f64).sin() as f32)
            .collect()
    }

    fn rms(signal: &[f64]) -> f64 {
        (signal.iter().map(|x| x * x).sum::<f64>() / signal.len() as f64).sqrt()
    }

    #[test]
    fn test_short_signal_returned_unchanged() {
        let conditioner = SignalConditioner::new(10_000.0, 4);
        let input = vec![0.1f32, -0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 0.0, 0.5];
        let output = conditioner.apply(&input, 44_100);
        let expected: Vec<f64> = input.iter().map(|&s| s as f64).collect();
        assert_eq!(output, expected);
    }

    #[test]
    fn test_cutoff_above_nyquist_returned_unchanged() {
        let conditioner = SignalConditioner::new(10_000.0, 4);
        let input = sine(1000.0, 16_000, 400);
        let output = conditioner.apply(&input, 16_000);
        assert_eq!(output.len(), input.len());
        assert!(output.iter().zip(&input).all(|(a, &b)| *a == b as f64));
    }

    #[test]
    fn test_passband_preserved() {
        let conditioner = SignalConditioner::new(10_000.0, 4);
        let input = sine(2000.0, 44_100, 4410);
        let output = conditioner.apply(&input, 44_100);
        let input64: Vec<f64> = input.iter().map(|&s| s as f64).collect();
        // Compare away from the edges
        let ratio = rms(&output[500..3900]) / rms(&input64[500..3900]);
        assert!((ratio - 1.0).abs() < 0.02, "passband gain {}", ratio);
    }

    #[test]
    fn test_stopband_attenuated() {
        let conditioner = SignalConditioner::new(10_000.0, 4);
        let input = sine(18_000.0, 44_100, 4410);
        let output = conditioner.apply(&input, 44_100);
        // Forward-backward doubles the attenuation; 4th order at ~1.8x cutoff is well below 0.1
        assert!(rms(&output[500..3900]) < 0.1);
    }

    #[test]
    fn test_dc_offset_has_no_startup_transient() {
        let conditioner = SignalConditioner::new(10_000.0, 4);
        let output = conditioner.apply(&[0.5; 1000], 44_100);
        assert!(output.iter().all(|y| (y - 0.5).abs() < 1e-9), "first samples {:?}", &output[..5]);

        let input: Vec<f32> = (0..4410)
            .map(|i| (0.5 + 0.2 * (2.0 * PI * 100.0 * i as f64 / 44_100.0).sin()) as f32)
            .collect();
        let output = conditioner.apply(&input, 44_100);
        for (y, &x) in output.iter().zip(&input).take(50) {
            assert!((y - x as f64).abs() < 1e-3, "{} vs {}", y, x);
        }
    }

    #[test]
    fn test_step_state_is_fixed_point() {
        let section = Biquad::lowpass(10_000.0, 44_100.0, 0.7071);
        let mut constant = vec![2.0; 64];
        section.run(&mut constant);
        assert!(constant.iter().all(|y| (y - 2.0).abs() < 1e-12));
    }

    #[test]
    fn test_odd_extension() {
        let padded = odd_extend(&[1.0, 2.0, 4.0, 7.0], 2);
        assert_eq!(padded, vec![-2.0, 0.0, 1.0, 2.0, 4.0, 7.0, 10.0, 12.0]);
    }
}
