//! # Time Alignment
//!
//! Maps the sparse distance-sensor trace onto the audio timeline. The audio axis is
//! `N` evenly spaced points from `0` to `N / sample_rate` inclusive, and the envelope is
//! linearly interpolated at every usable sensor timestamp.

use std::fmt;

/// Why a trace could not be aligned. All of these send the caller to the audio-only path.
#[derive(Debug, Clone, PartialEq)]
pub enum AlignmentGap {
    NoDistanceData,
    LengthMismatch { distances: usize, timestamps: usize },
    EmptyEnvelope,
    TooFewPoints(usize),
}

impl fmt::Display for AlignmentGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlignmentGap::NoDistanceData => write!(f, "no distance data"),
            AlignmentGap::LengthMismatch { distances, timestamps } => write!(
                f,
                "{} distance samples but {} timestamps",
                distances, timestamps
            ),
            AlignmentGap::EmptyEnvelope => write!(f, "audio envelope is empty"),
            AlignmentGap::TooFewPoints(n) => {
                write!(f, "only {} distance samples inside the recording", n)
            }
        }
    }
}

/// Distance samples with the envelope value at each of their timestamps, time-ordered.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AlignedSeries {
    pub times: Vec<f64>,
    pub distances: Vec<f64>,
    pub amplitudes: Vec<f64>,
}

impl AlignedSeries {
    pub fn len(&self) -> usize {
        self.times.len()
    }
}

/// Uniform audio time axis description.
#[derive(Debug, Clone, Copy)]
pub struct TimeAxis {
    pub len: usize,
    pub duration: f64,
}

impl TimeAxis {
    pub fn new(len: usize, sample_rate: u32) -> Self {
        let duration = if sample_rate == 0 { 0.0 } else { len as f64 / sample_rate as f64 };
        Self { len, duration }
    }

    /// Spacing between neighbouring axis points.
    pub fn step(&self) -> f64 {
        if self.len < 2 {
            0.0
        } else {
            self.duration / (self.len - 1) as f64
        }
    }

    /// Time of axis point `index`.
    pub fn time_at(&self, index: usize) -> f64 {
        index as f64 * self.step()
    }

    pub fn contains(&self, t: f64) -> bool {
        t.is_finite() && t >= 0.0 && t <= self.duration
    }

    /// Linear interpolation of `values` (one per axis point) at `t`, holding the ends.
    pub fn interpolate(&self, values: &[f64], t: f64) -> f64 {
        let step = self.step();
        if values.is_empty() {
            return 0.0;
        }
        if step <= 0.0 || t <= 0.0 {
            return values[0];
        }
        let last = values.len() - 1;
        let pos = t / step;
        if pos >= last as f64 {
            return values[last];
        }
        let lower = pos.floor() as usize;
        let frac = pos - lower as f64;
        values[lower] + (values[lower + 1] - values[lower]) * frac
    }
}

#[derive(Debug, Default, Clone)]
pub struct TimeAligner;

impl TimeAligner {
    pub fn new() -> Self {
        Self
    }

    /// Sample `envelope` at the sensor timestamps.
    ///
    /// Timestamps outside `[0, duration]`, non-finite timestamps and non-finite distances
    /// are dropped; at least two points must remain.
    pub fn align(
        &self,
        envelope: &[f64],
        sample_rate: u32,
        distances: &[f64],
        timestamps: &[f64],
    ) -> Result<AlignedSeries, AlignmentGap> {
        if distances.is_empty() && timestamps.is_empty() {
            return Err(AlignmentGap::NoDistanceData);
        }
        if distances.len() != timestamps.len() {
            return Err(AlignmentGap::LengthMismatch {
                distances: distances.len(),
                timestamps: timestamps.len(),
            });
        }
        if envelope.is_empty() {
            return Err(AlignmentGap::EmptyEnvelope);
        }

        let axis = TimeAxis::new(envelope.len(), sample_rate);
        let mut points: Vec<(f64, f64)> = timestamps
            .iter()
            .zip(distances)
            .filter(|(t, d)| axis.contains(**t) && d.is_finite())
            .map(|(&t, &d)| (t, d))
            .collect();
        if points.len() < 2 {
            return Err(AlignmentGap::TooFewPoints(points.len()));
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut series = AlignedSeries::default();
        for (t, d) in points {
            series.times.push(t);
            series.distances.push(d);
            series.amplitudes.push(axis.interpolate(envelope, t));
        }
        Ok(series)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_axis_spans_full_duration() {
        let axis = TimeAxis::new(11, 10);
        assert_abs_diff_eq!(axis.duration, 1.1);
        assert_abs_diff_eq!(axis.time_at(10), 1.1, epsilon = 1e-12);
        assert!(axis.contains(1.1));
        assert!(!axis.contains(1.2));
        assert!(!axis.contains(-0.01));
        assert!(!axis.contains(f64::NAN));
    }

    #[test]
    fn test_interpolation_holds_boundaries() {
        let axis = TimeAxis::new(3, 2); // points at 0.0, 0.75, 1.5
        let values = [0.0, 1.0, 0.5];
        assert_abs_diff_eq!(axis.interpolate(&values, 0.375), 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(axis.interpolate(&values, 1.125), 0.75, epsilon = 1e-12);
        assert_eq!(axis.interpolate(&values, -1.0), 0.0);
        assert_eq!(axis.interpolate(&values, 10.0), 0.5);
    }

    #[test]
    fn test_align_sorts_and_filters() {
        let envelope: Vec<f64> = (0..101).map(|i| i as f64 / 100.0).collect();
        // 101 samples at 100 Hz: axis runs 0..=1.01 s
        let series = TimeAligner::new()
            .align(
                &envelope,
                100,
                &[30.0, 10.0, 99.0, 20.0, f64::NAN],
                &[0.5, 0.1, 2.0, 0.3, 0.4],
            )
            .unwrap();
        assert_eq!(series.distances, vec![10.0, 20.0, 30.0]);
        assert_eq!(series.times, vec![0.1, 0.3, 0.5]);
        assert_eq!(series.len(), 3);
        for (t, a) in series.times.iter().zip(&series.amplitudes) {
            // Envelope is a ramp over axis points, so amplitude = t / duration
            assert_abs_diff_eq!(*a, t / 1.01, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_align_rejects_missing_or_sparse_traces() {
        let aligner = TimeAligner::new();
        let envelope = vec![0.5; 100];
        assert_eq!(aligner.align(&envelope, 100, &[], &[]), Err(AlignmentGap::NoDistanceData));
        assert_eq!(
            aligner.align(&envelope, 100, &[1.0, 2.0], &[0.1]),
            Err(AlignmentGap::LengthMismatch { distances: 2, timestamps: 1 })
        );
        assert_eq!(
            aligner.align(&envelope, 100, &[1.0, 2.0], &[0.1, 5.0]),
            Err(AlignmentGap::TooFewPoints(1))
        );
        assert_eq!(aligner.align(&[], 100, &[1.0], &[0.1]), Err(AlignmentGap::EmptyEnvelope));
    }
}
