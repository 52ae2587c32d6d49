//! # Experiment WebSocket Protocol
//!
//! JSON text frames in both directions, discriminated by a `type` field.
//!
//! ## Client → server
//! | type | fields |
//! |---|---|
//! | `experiment_params` | `step`, `frequency`, `temperature` |
//! | `complete_audio` | `step`, `data` (base64), `format`, `distances[]`, `timestamps[]`, optional `frequency`, `temperature`, `sample_rate` |
//! | `start_recording` / `stop_recording` | `step` |
//! | `finalize_experiment` | none |
//! | `update_all_params` | `temperature`, `stages: [{step, frequency}]` |
//! | `final_results` | `studentSpeed`, `studentGamma` |
//!
//! Numeric fields accept either JSON numbers or numeric strings (`"2000"`), since
//! browser form inputs tend to send the latter.
//!
//! ## Server → client
//! See [`OutboundMessage`]. Invalid measurements appear as `null`.

use crate::error::{AppError, AppResult};
use crate::experiment::model::{DetectionMethod, Measurement, Minimum, SessionStatus, StageSummary};
use crate::experiment::results::Verification;
use serde::{Deserialize, Deserializer, Serialize};

/// A number that may arrive as a JSON string.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Numeric(pub f64);

impl<'de> Deserialize<'de> for Numeric {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(value) => Ok(Numeric(value)),
            Raw::Text(text) => text
                .trim()
                .parse::<f64>()
                .map(Numeric)
                .map_err(|_| serde::de::Error::custom(format!("expected a number, got \"{}\"", text))),
        }
    }
}

/// One `update_all_params` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct StageFrequency {
    pub step: Numeric,
    pub frequency: Numeric,
}

/// Every message a client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    ExperimentParams {
        step: Numeric,
        frequency: Numeric,
        temperature: Numeric,
    },
    CompleteAudio {
        step: Numeric,
        data: String,
        #[serde(default = "default_audio_format")]
        format: String,
        #[serde(default)]
        distances: Vec<f64>,
        #[serde(default)]
        timestamps: Vec<f64>,
        frequency: Option<Numeric>,
        temperature: Option<Numeric>,
        sample_rate: Option<u32>,
    },
    StartRecording {
        step: Numeric,
    },
    StopRecording {
        step: Numeric,
    },
    FinalizeExperiment,
    UpdateAllParams {
        temperature: Numeric,
        stages: Vec<StageFrequency>,
    },
    FinalResults {
        #[serde(rename = "studentSpeed")]
        student_speed: Numeric,
        #[serde(rename = "studentGamma")]
        student_gamma: Numeric,
    },
    #[serde(other)]
    Unknown,
}

fn default_audio_format() -> String {
    "wav".to_string()
}

impl InboundMessage {
    /// Parse a text frame.
    ///
    /// Malformed JSON, a missing `type`, an unknown `type` and missing or mistyped
    /// fields all come back as validation errors naming the problem.
    pub fn parse(text: &str) -> AppResult<Self> {
        let value: serde_json::Value = serde_json::from_str(text)
            .map_err(|e| AppError::ValidationError(format!("Invalid JSON format: {}", e)))?;
        let Some(object) = value.as_object() else {
            return Err(AppError::ValidationError("Message must be a JSON object".to_string()));
        };
        let message_type = match object.get("type") {
            Some(serde_json::Value::String(t)) => t.clone(),
            _ => return Err(AppError::ValidationError("Message type is required".to_string())),
        };

        match serde_json::from_value::<InboundMessage>(value) {
            Ok(InboundMessage::Unknown) => Err(AppError::ValidationError(format!(
                "Unknown message type: {}",
                message_type
            ))),
            Ok(message) => Ok(message),
            Err(e) => Err(AppError::ValidationError(format!(
                "Invalid {} message: {}",
                message_type, e
            ))),
        }
    }

    /// Wire name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::ExperimentParams { .. } => "experiment_params",
            InboundMessage::CompleteAudio { .. } => "complete_audio",
            InboundMessage::StartRecording { .. } => "start_recording",
            InboundMessage::StopRecording { .. } => "stop_recording",
            InboundMessage::FinalizeExperiment => "finalize_experiment",
            InboundMessage::UpdateAllParams { .. } => "update_all_params",
            InboundMessage::FinalResults { .. } => "final_results",
            InboundMessage::Unknown => "unknown",
        }
    }
}

/// A stage's confirmed frequency, echoed in `parameters_updated_ack`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageParamsAck {
    pub step: usize,
    pub frequency: f64,
}

/// Every message the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    StepConfirmation {
        step: usize,
        status: &'static str,
        frequency: f64,
        temperature: f64,
    },
    MinimaData {
        step: usize,
        minima: Vec<Minimum>,
        frequency: f64,
        temperature: f64,
        speed: Measurement,
        gamma: Measurement,
        detection: DetectionMethod,
    },
    ExperimentComplete {
        message: String,
        steps: Vec<StageSummary>,
        average_gamma: Measurement,
        average_speed: Measurement,
        status: SessionStatus,
    },
    RecordingStarted {
        step: usize,
    },
    RecordingStopped {
        step: usize,
    },
    ParametersUpdatedAck {
        temperature: f64,
        stages: Vec<StageParamsAck>,
    },
    VerificationResult(Verification),
    Error {
        code: &'static str,
        message: String,
        step: usize,
    },
}

impl OutboundMessage {
    pub fn error(err: &AppError, step: usize) -> Self {
        OutboundMessage::Error {
            code: err.code(),
            message: err.message().to_string(),
            step,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                r#"{{"type":"error","code":"internal_error","message":"Failed to serialize response: {}","step":0}}"#,
                e
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_params_with_string_numbers() {
        let msg = InboundMessage::parse(
            r#"{"type":"experiment_params","step":"2","frequency":"2000","temperature":21.5}"#,
        )
        .unwrap();
        match msg {
            InboundMessage::ExperimentParams { step, frequency, temperature } => {
                assert_eq!(step, Numeric(2.0));
                assert_eq!(frequency, Numeric(2000.0));
                assert_eq!(temperature, Numeric(21.5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_complete_audio_defaults() {
        let msg = InboundMessage::parse(r#"{"type":"complete_audio","step":1,"data":"AAAA"}"#).unwrap();
        match msg {
            InboundMessage::CompleteAudio { format, distances, timestamps, frequency, sample_rate, .. } => {
                assert_eq!(format, "wav");
                assert!(distances.is_empty() && timestamps.is_empty());
                assert_eq!(frequency, None);
                assert_eq!(sample_rate, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_final_results_camel_case() {
        let msg = InboundMessage::parse(r#"{"type":"final_results","studentSpeed":"343.1","studentGamma":1.4}"#)
            .unwrap();
        assert!(matches!(
            msg,
            InboundMessage::FinalResults { student_speed: Numeric(s), student_gamma: Numeric(g) }
                if s == 343.1 && g == 1.4
        ));
    }

    #[test]
    fn test_parse_errors_are_validation_errors() {
        let cases = [
            ("{oops", "Invalid JSON format"),
            ("[1,2]", "Message must be a JSON object"),
            (r#"{"step":1}"#, "Message type is required"),
            (r#"{"type":"self_destruct"}"#, "Unknown message type: self_destruct"),
            (r#"{"type":"experiment_params","step":1}"#, "Invalid experiment_params message"),
            (r#"{"type":"experiment_params","step":1,"frequency":"fast","temperature":20}"#, "expected a number"),
        ];
        for (text, expected) in cases {
            let err = InboundMessage::parse(text).unwrap_err();
            assert_eq!(err.code(), "validation_error", "{}", text);
            assert!(err.message().contains(expected), "{} -> {}", text, err.message());
        }
    }

    #[test]
    fn test_outbound_shapes() {
        let msg = OutboundMessage::MinimaData {
            step: 1,
            minima: vec![],
            frequency: 2000.0,
            temperature: 20.0,
            speed: Measurement::Invalid,
            gamma: Measurement::Invalid,
            detection: DetectionMethod::Fallback,
        };
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value["type"], "minima_data");
        assert_eq!(value["speed"], serde_json::Value::Null);
        assert_eq!(value["detection"], "fallback");

        let err = OutboundMessage::error(&AppError::NotFound("gone".into()), 3);
        assert_eq!(
            serde_json::to_value(&err).unwrap(),
            json!({"type": "error", "code": "not_found", "message": "gone", "step": 3})
        );
    }

    #[test]
    fn test_verification_result_is_flattened() {
        let verification = Verification {
            is_valid: true,
            student_speed: 343.0,
            student_gamma: 1.4,
            computed_speed: Measurement::Valid(343.0),
            computed_gamma: Measurement::Valid(1.4),
            reference_gamma: 1.4,
            speed_error: Measurement::Invalid,
            gamma_error_computed: 0.0,
            gamma_error_reference: 0.0,
        };
        let value = serde_json::to_value(OutboundMessage::VerificationResult(verification)).unwrap();
        assert_eq!(value["type"], "verification_result");
        assert_eq!(value["is_valid"], true);
        assert_eq!(value["speed_error"], serde_json::Value::Null);
    }
}
