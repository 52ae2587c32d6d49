//! # Experiment Data Model
//!
//! The records the state machine mutates and the store persists, together with their
//! single wire schema.
//!
//! ## Invalid values
//! Physically implausible or uncomputable numbers (too few minima, γ outside
//! `[1.0, 2.0]`, a zero spacing) are data, not failures. They are carried as
//! [`Measurement::Invalid`] and serialize as `null`. Nothing in this module can put a
//! `NaN` or `Infinity` token on the wire: every float that might be non-finite goes
//! through [`Measurement::from_f64`] first.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Number of stages in every experiment session.
pub const STAGE_COUNT: usize = 3;

/// A derived real number, or the explicit invalid marker.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Measurement {
    Valid(f64),
    #[default]
    Invalid,
}

impl Measurement {
    /// Wrap a float, mapping `NaN` and `±Infinity` to `Invalid`.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() {
            Measurement::Valid(value)
        } else {
            Measurement::Invalid
        }
    }

    pub fn value(&self) -> Option<f64> {
        match self {
            Measurement::Valid(v) => Some(*v),
            Measurement::Invalid => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Measurement::Valid(_))
    }

    /// Round a valid value to `decimals` places, leaving `Invalid` alone.
    pub fn rounded(&self, decimals: i32) -> Self {
        match self {
            Measurement::Valid(v) => Measurement::from_f64(round_to(*v, decimals)),
            Measurement::Invalid => Measurement::Invalid,
        }
    }
}

impl Serialize for Measurement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Measurement::Valid(v) if v.is_finite() => serializer.serialize_f64(*v),
            _ => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Measurement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<f64>::deserialize(deserializer)?;
        Ok(value.map(Measurement::from_f64).unwrap_or(Measurement::Invalid))
    }
}

/// Round half away from zero to `decimals` places.
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Mean of all valid measurements, `Invalid` when there are none.
pub fn mean_of_valid<'a>(values: impl IntoIterator<Item = &'a Measurement>) -> Measurement {
    let (sum, count) = values
        .into_iter()
        .filter_map(Measurement::value)
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        Measurement::Invalid
    } else {
        Measurement::from_f64(sum / count as f64)
    }
}

/// A detected point of destructive interference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minimum {
    /// Position on the audio timeline, seconds
    pub time_sec: f64,
    /// Aligned distance-sensor reading; absent when the fallback found no close sample
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_cm: Option<f64>,
    /// Normalized envelope value at the minimum, in [0, 1]
    pub amplitude: f64,
}

/// Which detector produced a stage's minima.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    /// Envelope sampled at the distance-sensor timestamps
    Primary,
    /// Audio-only search on the raw timeline
    Fallback,
}

/// Per-stage lifecycle. Ordering follows the lifecycle so `max` never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    ParamsReceived,
    AudioProcessed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::ParamsReceived => "params_received",
            StageStatus::AudioProcessed => "audio_processed",
        }
    }
}

/// Session-level lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Completed,
    ErrorInCalculation,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::ErrorInCalculation => "error_in_calculation",
        }
    }
}

/// One frequency/temperature trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub frequency: Option<f64>,
    pub temperature: Option<f64>,
    pub status: StageStatus,
    pub minima: Option<Vec<Minimum>>,
    pub detection: Option<DetectionMethod>,
    /// Decoded mono samples, only kept when `processing.retain_audio_samples` is on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_samples: Option<Vec<f32>>,
    pub sample_rate: Option<u32>,
    pub distance_samples: Vec<f64>,
    pub distance_timestamps: Vec<f64>,
    pub speed: Measurement,
    pub gamma: Measurement,
}

impl Default for Stage {
    fn default() -> Self {
        Self {
            frequency: None,
            temperature: None,
            status: StageStatus::Pending,
            minima: None,
            detection: None,
            audio_samples: None,
            sample_rate: None,
            distance_samples: Vec::new(),
            distance_timestamps: Vec::new(),
            speed: Measurement::Invalid,
            gamma: Measurement::Invalid,
        }
    }
}

/// One experiment instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub stages: [Stage; STAGE_COUNT],
    /// 1-based, as the client sees it
    pub current_step: usize,
    pub status: SessionStatus,
    /// Ambient temperature, °C
    pub temperature: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: Uuid, temperature: f64) -> Self {
        let now = Utc::now();
        Self {
            id,
            stages: Default::default(),
            current_step: 1,
            status: SessionStatus::InProgress,
            temperature,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of checking a student's submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    Success,
    Fail,
}

/// Per-stage line of the session result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub step: usize,
    pub frequency: Option<f64>,
    pub temperature: Option<f64>,
    pub status: StageStatus,
    pub detection: Option<DetectionMethod>,
    pub minima_count: usize,
    pub speed: Measurement,
    pub gamma: Measurement,
}

/// Session-level aggregate handed to the validation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub session_id: Uuid,
    pub detailed: Vec<StageSummary>,
    pub average_gamma: Measurement,
    pub average_speed: Measurement,
    pub gamma_reference: f64,
    pub student_speed: Option<f64>,
    pub student_gamma: Option<f64>,
    /// Student γ error against the reference value, percent
    pub error_percent: Option<f64>,
    pub validation: ValidationStatus,
    pub updated_at: DateTime<Utc>,
}

/// The fields a calculation or validation pass writes into the result record.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultFields {
    /// Finalization output; keeps any earlier student submission
    Calculated {
        detailed: Vec<StageSummary>,
        average_gamma: Measurement,
        average_speed: Measurement,
        gamma_reference: f64,
    },
    /// Student submission outcome
    Submission {
        student_speed: f64,
        student_gamma: f64,
        error_percent: f64,
        validation: ValidationStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_measurement_never_serializes_nan() {
        let values = vec![
            Measurement::from_f64(f64::NAN),
            Measurement::from_f64(f64::INFINITY),
            Measurement::Valid(f64::NAN),
            Measurement::Valid(1.4),
        ];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, "[null,null,null,1.4]");
    }

    #[test]
    fn test_measurement_deserializes_null_as_invalid() {
        let values: Vec<Measurement> = serde_json::from_str("[null, 343.2]").unwrap();
        assert_eq!(values, vec![Measurement::Invalid, Measurement::Valid(343.2)]);
    }

    #[test]
    fn test_mean_of_valid_skips_invalid() {
        let values = [Measurement::Valid(1.3), Measurement::Invalid, Measurement::Valid(1.5)];
        let mean = mean_of_valid(&values).value().unwrap();
        assert!((mean - 1.4).abs() < 1e-12);
        assert_eq!(mean_of_valid(&[Measurement::Invalid]), Measurement::Invalid);
        assert_eq!(mean_of_valid(&[]), Measurement::Invalid);
    }

    #[test]
    fn test_stage_status_ordering() {
        assert!(StageStatus::Pending < StageStatus::ParamsReceived);
        assert!(StageStatus::ParamsReceived < StageStatus::AudioProcessed);
        assert_eq!(
            serde_json::to_string(&StageStatus::ParamsReceived).unwrap(),
            "\"params_received\""
        );
    }

    #[test]
    fn test_fallback_minimum_omits_distance() {
        let minimum = Minimum { time_sec: 0.25, distance_cm: None, amplitude: 0.1 };
        let json = serde_json::to_value(&minimum).unwrap();
        assert!(json.get("distance_cm").is_none());
    }

    #[test]
    fn test_new_session_has_pending_stages() {
        let session = Session::new(Uuid::new_v4(), 21.5);
        assert_eq!(session.current_step, 1);
        assert_eq!(session.status, SessionStatus::InProgress);
        assert!(session.stages.iter().all(|s| s.status == StageStatus::Pending));
    }
}
