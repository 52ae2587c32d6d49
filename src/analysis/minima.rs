//! # Minima Detection
//!
//! Interference minima are peaks of the inverted envelope (`1 - a`).
//!
//! ## Detectors:
//! - **Primary** ([`MinimaDetector`]): searches the envelope sampled at the
//!   distance-sensor timestamps, so each minimum comes with a tube position. Separation
//!   and width scale with the number of aligned samples `K`.
//! - **Fallback** ([`FallbackMinimaDetector`]): searches the envelope on the full audio
//!   timeline and attaches a distance reading only when one was taken close enough in
//!   time.
//!
//! The primary detector reports an explicit [`DetectionOutcome`]; the pipeline in
//! `analysis::pipeline` falls back on anything but `Detected`.

use crate::analysis::alignment::{AlignedSeries, TimeAxis};
use crate::analysis::peaks::{find_peaks, PeakCriteria};
use crate::config::ProcessingConfig;
use crate::experiment::model::Minimum;
use tracing::{debug, warn};

/// Result of the primary detector.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    Detected(Vec<Minimum>),
    InsufficientData,
    Error(String),
}

/// Peak-search thresholds shared by both detectors.
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub min_peak_height: f64,
    pub separation_ratio: f64,
    pub min_prominence: f64,
    pub width_ratio: f64,
    pub fallback_min_separation_s: f64,
    pub fallback_min_samples: usize,
}

impl From<&ProcessingConfig> for DetectorSettings {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            min_peak_height: config.min_peak_height,
            separation_ratio: config.separation_ratio,
            min_prominence: config.min_prominence,
            width_ratio: config.width_ratio,
            fallback_min_separation_s: config.fallback_min_separation_s,
            fallback_min_samples: config.fallback_min_samples,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        DetectorSettings::from(&ProcessingConfig::default())
    }
}

impl DetectorSettings {
    fn min_width(&self, samples: usize) -> f64 {
        (self.width_ratio * samples as f64).max(1.0)
    }
}

fn invert(amplitudes: &[f64]) -> Vec<f64> {
    amplitudes.iter().map(|a| 1.0 - a).collect()
}

/// Primary detector over an aligned series.
#[derive(Debug, Clone, Default)]
pub struct MinimaDetector {
    settings: DetectorSettings,
}

impl MinimaDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    /// Minima sorted by `distance_cm`.
    pub fn detect(&self, series: &AlignedSeries) -> DetectionOutcome {
        let k = series.len();
        if k < 3 {
            return DetectionOutcome::InsufficientData;
        }
        if series.amplitudes.iter().any(|a| !a.is_finite()) {
            return DetectionOutcome::Error("aligned envelope contains non-finite values".to_string());
        }

        let inverted = invert(&series.amplitudes);
        let criteria = PeakCriteria {
            height: Some(self.settings.min_peak_height),
            distance: Some(((self.settings.separation_ratio * k as f64).floor() as usize).max(1)),
            prominence: Some(self.settings.min_prominence),
            width: Some(self.settings.min_width(k)),
        };

        let mut minima: Vec<Minimum> = find_peaks(&inverted, &criteria)
            .into_iter()
            .map(|peak| Minimum {
                time_sec: series.times[peak.index],
                distance_cm: Some(series.distances[peak.index]),
                amplitude: 1.0 - peak.height,
            })
            .collect();
        minima.sort_by(|a, b| {
            a.distance_cm
                .unwrap_or(f64::INFINITY)
                .total_cmp(&b.distance_cm.unwrap_or(f64::INFINITY))
        });

        debug!(aligned = k, found = minima.len(), "Primary minima search finished");
        DetectionOutcome::Detected(minima)
    }
}

/// Audio-only detector. Never fails: anything unusable yields an empty list.
#[derive(Debug, Clone, Default)]
pub struct FallbackMinimaDetector {
    settings: DetectorSettings,
}

impl FallbackMinimaDetector {
    pub fn new(settings: DetectorSettings) -> Self {
        Self { settings }
    }

    /// Minima sorted by `time_sec`.
    ///
    /// `distances`/`timestamps` are optional context; a reading is attached to a minimum
    /// only when it lies within one mean sensor interval of it.
    pub fn detect(
        &self,
        envelope: &[f64],
        sample_rate: u32,
        distances: &[f64],
        timestamps: &[f64],
    ) -> Vec<Minimum> {
        let k = envelope.len();
        if k < self.settings.fallback_min_samples.max(3) || sample_rate == 0 {
            debug!(samples = k, "Too little audio for the fallback search");
            return Vec::new();
        }
        if envelope.iter().any(|a| !a.is_finite()) {
            warn!("Envelope contains non-finite values, fallback search skipped");
            return Vec::new();
        }

        let axis = TimeAxis::new(k, sample_rate);
        let separation = (self.settings.fallback_min_separation_s * sample_rate as f64).round() as usize;
        let criteria = PeakCriteria {
            height: Some(self.settings.min_peak_height),
            distance: Some(separation.max(1)),
            prominence: Some(self.settings.min_prominence),
            width: Some(self.settings.min_width(k)),
        };
        let trace = SensorTrace::new(distances, timestamps);

        let mut minima: Vec<Minimum> = find_peaks(&invert(envelope), &criteria)
            .into_iter()
            .map(|peak| {
                let time_sec = axis.time_at(peak.index);
                Minimum {
                    time_sec,
                    distance_cm: trace.as_ref().and_then(|t| t.nearest_within_interval(time_sec)),
                    amplitude: 1.0 - peak.height,
                }
            })
            .collect();
        minima.sort_by(|a, b| a.time_sec.total_cmp(&b.time_sec));

        debug!(samples = k, found = minima.len(), "Fallback minima search finished");
        minima
    }
}

/// Time-sorted distance readings with their mean sampling interval.
struct SensorTrace {
    points: Vec<(f64, f64)>,
    mean_interval: f64,
}

impl SensorTrace {
    fn new(distances: &[f64], timestamps: &[f64]) -> Option<Self> {
        if distances.len() != timestamps.len() {
            return None;
        }
        let mut points: Vec<(f64, f64)> = timestamps
            .iter()
            .zip(distances)
            .filter(|(t, d)| t.is_finite() && d.is_finite())
            .map(|(&t, &d)| (t, d))
            .collect();
        if points.len() < 2 {
            return None;
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));

        let span = points[points.len() - 1].0 - points[0].0;
        let mean_interval = span / (points.len() - 1) as f64;
        Some(Self { points, mean_interval })
    }

    fn nearest_within_interval(&self, t: f64) -> Option<f64> {
        let (time, distance) = self
            .points
            .iter()
            .min_by(|a, b| (a.0 - t).abs().total_cmp(&(b.0 - t).abs()))?;
        ((time - t).abs() <= self.mean_interval).then_some(*distance)
    }
}
