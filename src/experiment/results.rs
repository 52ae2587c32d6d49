//! # Result Aggregation and Validation
//!
//! ## Finalization
//! Recomputes speed and γ for every stage from its stored minima, averages the valid
//! values and decides the session status. The computation only reads stored minima and
//! parameters, so running it twice on unchanged data gives identical numbers.
//!
//! ## Student validation
//! A submission passes when the student's γ is within
//! [`ACCEPTANCE_THRESHOLD_PERCENT`] of both the reference γ (1.4) and the computed
//! average γ. The speed error is reported but does not gate the outcome.

use crate::analysis::physics::{error_percent, PhysicsCalculator, ACCEPTANCE_THRESHOLD_PERCENT, REFERENCE_GAMMA};
use crate::error::{AppError, AppResult};
use crate::experiment::model::{
    mean_of_valid, Measurement, ResultFields, ResultRecord, Session, SessionStatus, StageSummary,
    ValidationStatus,
};
use serde::Serialize;
use tracing::{info, warn};

/// Session-level numbers produced by finalization.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub detailed: Vec<StageSummary>,
    pub average_gamma: Measurement,
    pub average_speed: Measurement,
    pub status: SessionStatus,
}

impl Finalization {
    pub fn into_fields(self) -> ResultFields {
        ResultFields::Calculated {
            detailed: self.detailed,
            average_gamma: self.average_gamma,
            average_speed: self.average_speed,
            gamma_reference: REFERENCE_GAMMA,
        }
    }
}

/// Outcome of checking a student's numbers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verification {
    pub is_valid: bool,
    pub student_speed: f64,
    pub student_gamma: f64,
    pub computed_speed: Measurement,
    pub computed_gamma: Measurement,
    pub reference_gamma: f64,
    pub speed_error: Measurement,
    pub gamma_error_computed: f64,
    pub gamma_error_reference: f64,
}

impl Verification {
    pub fn to_fields(&self) -> ResultFields {
        ResultFields::Submission {
            student_speed: self.student_speed,
            student_gamma: self.student_gamma,
            error_percent: self.gamma_error_reference,
            validation: if self.is_valid {
                ValidationStatus::Success
            } else {
                ValidationStatus::Fail
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResultAggregator {
    physics: PhysicsCalculator,
}

impl ResultAggregator {
    pub fn new(physics: PhysicsCalculator) -> Self {
        Self { physics }
    }

    /// Recompute every stage and set the session status.
    ///
    /// Stages without minima or frequency get invalid markers instead of failing the pass.
    pub fn finalize(&self, session: &mut Session) -> Finalization {
        let ambient = session.temperature;
        let mut detailed = Vec::with_capacity(session.stages.len());

        for (index, stage) in session.stages.iter_mut().enumerate() {
            let (speed, gamma) = match (&stage.minima, stage.frequency) {
                (Some(minima), Some(frequency)) => {
                    let speed = self.physics.speed(minima, frequency);
                    let gamma = self.physics.gamma(speed, stage.temperature.unwrap_or(ambient));
                    (speed, gamma)
                }
                _ => {
                    warn!(session_id = %session.id, step = index + 1, "No minima for step, excluded from averages");
                    (Measurement::Invalid, Measurement::Invalid)
                }
            };
            stage.speed = speed;
            stage.gamma = gamma;

            detailed.push(StageSummary {
                step: index + 1,
                frequency: stage.frequency,
                temperature: stage.temperature,
                status: stage.status,
                detection: stage.detection,
                minima_count: stage.minima.as_ref().map_or(0, Vec::len),
                speed,
                gamma,
            });
        }

        let average_gamma = mean_of_valid(detailed.iter().map(|s| &s.gamma));
        let average_speed = mean_of_valid(detailed.iter().map(|s| &s.speed));
        let status = if average_gamma.is_valid() {
            SessionStatus::Completed
        } else {
            SessionStatus::ErrorInCalculation
        };
        session.status = status;
        session.updated_at = chrono::Utc::now();

        info!(
            session_id = %session.id,
            average_gamma = ?average_gamma.value(),
            average_speed = ?average_speed.value(),
            status = status.as_str(),
            "Experiment finalized"
        );

        Finalization {
            detailed,
            average_gamma,
            average_speed,
            status,
        }
    }

    /// Compare a student's submission against the stored result.
    pub fn validate_submission(
        &self,
        record: &ResultRecord,
        student_speed: f64,
        student_gamma: f64,
    ) -> AppResult<Verification> {
        if !student_speed.is_finite() || !student_gamma.is_finite() {
            return Err(AppError::ValidationError(
                "studentSpeed and studentGamma must be finite numbers".to_string(),
            ));
        }
        let Some(average_gamma) = record.average_gamma.value() else {
            return Err(AppError::ValidationError(
                "No valid computed gamma to validate against".to_string(),
            ));
        };

        let gamma_error_reference = error_percent(student_gamma, REFERENCE_GAMMA)
            .value()
            .unwrap_or(f64::INFINITY);
        let gamma_error_computed = error_percent(student_gamma, average_gamma)
            .value()
            .unwrap_or(f64::INFINITY);
        let speed_error = match record.average_speed.value() {
            Some(speed) => error_percent(student_speed, speed),
            None => Measurement::Invalid,
        };

        let is_valid = gamma_error_reference <= ACCEPTANCE_THRESHOLD_PERCENT
            && gamma_error_computed <= ACCEPTANCE_THRESHOLD_PERCENT;

        Ok(Verification {
            is_valid,
            student_speed,
            student_gamma,
            computed_speed: record.average_speed.rounded(4),
            computed_gamma: record.average_gamma.rounded(4),
            reference_gamma: REFERENCE_GAMMA,
            speed_error,
            gamma_error_computed,
            gamma_error_reference,
        })
    }
}
