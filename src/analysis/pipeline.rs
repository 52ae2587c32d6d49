//! # Stage Analysis Pipeline
//!
//! decoded audio → low-pass → envelope → alignment → primary detector, dropping to the
//! audio-only detector when alignment or the primary search does not produce minima.
//!
//! This is pure CPU work. The WebSocket layer runs it on the blocking thread pool.

use crate::analysis::alignment::TimeAligner;
use crate::analysis::minima::{DetectionOutcome, DetectorSettings, FallbackMinimaDetector, MinimaDetector};
use crate::audio::{DecodedAudio, EnvelopeExtractor, SignalConditioner};
use crate::config::ProcessingConfig;
use crate::experiment::model::{DetectionMethod, Minimum};
use tracing::{debug, info};

/// Minima for one stage and how they were found.
#[derive(Debug, Clone, PartialEq)]
pub struct StageAnalysis {
    pub minima: Vec<Minimum>,
    pub detection: DetectionMethod,
}

#[derive(Debug, Clone)]
pub struct StageAnalyzer {
    conditioner: SignalConditioner,
    extractor: EnvelopeExtractor,
    aligner: TimeAligner,
    primary: MinimaDetector,
    fallback: FallbackMinimaDetector,
}

impl StageAnalyzer {
    pub fn new(config: &ProcessingConfig) -> Self {
        let settings = DetectorSettings::from(config);
        Self {
            conditioner: SignalConditioner::new(config.lowpass_cutoff_hz, config.filter_order),
            extractor: EnvelopeExtractor::new(),
            aligner: TimeAligner::new(),
            primary: MinimaDetector::new(settings.clone()),
            fallback: FallbackMinimaDetector::new(settings),
        }
    }

    pub fn analyze(&self, audio: &DecodedAudio, distances: &[f64], timestamps: &[f64]) -> StageAnalysis {
        let filtered = self.conditioner.apply(&audio.samples, audio.sample_rate);
        let envelope = self.extractor.extract(&filtered);
        debug!(samples = envelope.len(), sample_rate = audio.sample_rate, "Envelope extracted");

        let outcome = match self.aligner.align(&envelope, audio.sample_rate, distances, timestamps) {
            Ok(series) => self.primary.detect(&series),
            Err(gap) => {
                debug!(reason = %gap, "Distance trace not usable");
                DetectionOutcome::InsufficientData
            }
        };

        match outcome {
            DetectionOutcome::Detected(minima) => StageAnalysis {
                minima,
                detection: DetectionMethod::Primary,
            },
            DetectionOutcome::InsufficientData => {
                info!("Insufficient distance data, using audio-only minima search");
                self.fallback_analysis(&envelope, audio.sample_rate, distances, timestamps)
            }
            DetectionOutcome::Error(reason) => {
                info!(%reason, "Primary minima search failed, using audio-only search");
                self.fallback_analysis(&envelope, audio.sample_rate, distances, timestamps)
            }
        }
    }

    fn fallback_analysis(
        &self,
        envelope: &[f64],
        sample_rate: u32,
        distances: &[f64],
        timestamps: &[f64],
    ) -> StageAnalysis {
        StageAnalysis {
            minima: self.fallback.detect(envelope, sample_rate, distances, timestamps),
            detection: DetectionMethod::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::physics::PhysicsCalculator;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use std::f64::consts::PI;

    /// One second of a 2000 Hz tone whose loudness dips twice (t = 0.25 s and 0.75 s).
    fn standing_wave_recording() -> DecodedAudio {
        let sample_rate = 44_100;
        let samples = (0..sample_rate as usize)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                let loudness = 0.55 + 0.45 * (2.0 * PI * 2.0 * t).cos();
                (0.8 * loudness * (2.0 * PI * 2000.0 * t).sin()) as f32
            })
            .collect();
        DecodedAudio { samples, sample_rate }
    }

    #[test]
    fn test_primary_path_recovers_speed_of_sound() {
        let audio = standing_wave_recording();
        // Carriage moves 0.8575 cm every 0.05 s, so the dips sit half a wavelength apart
        let timestamps: Vec<f64> = (0..=20).map(|k| k as f64 * 0.05).collect();
        let distances: Vec<f64> = (0..=20).map(|k| k as f64 * 0.8575).collect();

        let analysis = StageAnalyzer::new(&ProcessingConfig::default()).analyze(&audio, &distances, &timestamps);
        assert_eq!(analysis.detection, DetectionMethod::Primary);
        assert_eq!(analysis.minima.len(), 2);

        let speed = PhysicsCalculator::new(0.01).speed(&analysis.minima, 2000.0);
        assert_relative_eq!(speed.value().unwrap(), 343.0, max_relative = 1e-6);
    }

    #[test]
    fn test_empty_trace_routes_to_fallback() {
        let audio = standing_wave_recording();
        let analysis = StageAnalyzer::new(&ProcessingConfig::default()).analyze(&audio, &[], &[]);
        assert_eq!(analysis.detection, DetectionMethod::Fallback);
        assert_eq!(analysis.minima.len(), 2);
        assert_abs_diff_eq!(analysis.minima[0].time_sec, 0.25, epsilon = 0.01);
        assert_abs_diff_eq!(analysis.minima[1].time_sec, 0.75, epsilon = 0.01);
        assert!(analysis.minima.iter().all(|m| m.distance_cm.is_none()));
        assert!(analysis.minima.windows(2).all(|w| w[0].time_sec <= w[1].time_sec));
    }

    #[test]
    fn test_mismatched_trace_routes_to_fallback() {
        let audio = standing_wave_recording();
        let analysis =
            StageAnalyzer::new(&ProcessingConfig::default()).analyze(&audio, &[1.0, 2.0, 3.0], &[0.1, 0.2]);
        assert_eq!(analysis.detection, DetectionMethod::Fallback);
    }

    #[test]
    fn test_silence_yields_no_minima() {
        let audio = DecodedAudio { samples: vec![0.0; 4410], sample_rate: 44_100 };
        let analysis = StageAnalyzer::new(&ProcessingConfig::default()).analyze(&audio, &[], &[]);
        assert!(analysis.minima.is_empty());
    }
}
