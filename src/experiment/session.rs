//! # Stage State Machine
//!
//! All mutations of a [`Session`] go through the methods in this module.
//!
//! ## Stage lifecycle:
//! `pending → params_received → audio_processed`. A stage never moves backwards: new
//! parameters for an already processed stage update the numbers but keep the status.
//!
//! ## Steps:
//! Clients address stages with 1-based `step` numbers; [`stage_index`] converts and
//! range-checks them. Everything inside this module works on 0-based indices.

use crate::analysis::StageAnalysis;
use crate::error::{AppError, AppResult};
use crate::experiment::model::{Measurement, Session, SessionStatus, StageStatus, STAGE_COUNT};
use chrono::Utc;
use tracing::{debug, warn};

/// Convert a client step number into a stage index.
pub fn stage_index(step: f64) -> AppResult<usize> {
    if !step.is_finite() || step.fract() != 0.0 || step < 1.0 || step > STAGE_COUNT as f64 {
        return Err(AppError::ValidationError(format!(
            "Step must be an integer between 1 and {}, got {}",
            STAGE_COUNT, step
        )));
    }
    Ok(step as usize - 1)
}

fn validate_frequency(frequency: f64) -> AppResult<f64> {
    if frequency.is_finite() && frequency > 0.0 {
        Ok(frequency)
    } else {
        Err(AppError::ValidationError(format!(
            "Frequency must be a positive number, got {}",
            frequency
        )))
    }
}

fn validate_temperature(temperature: f64) -> AppResult<f64> {
    if temperature.is_finite() && temperature > -273.15 {
        Ok(temperature)
    } else {
        Err(AppError::ValidationError(format!(
            "Temperature must be a finite value above absolute zero, got {}",
            temperature
        )))
    }
}

/// Frequency and temperature a stage recording is processed with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageParams {
    pub frequency: f64,
    pub temperature: f64,
    /// Supplied with the audio instead of in a prior `experiment_params`
    pub late: bool,
}

/// Everything a successful audio pass writes into a stage.
#[derive(Debug, Clone)]
pub struct ProcessedAudio {
    pub params: StageParams,
    pub analysis: StageAnalysis,
    pub speed: Measurement,
    pub gamma: Measurement,
    pub sample_rate: u32,
    /// Only present when sample retention is switched on
    pub samples: Option<Vec<f32>>,
    pub distances: Vec<f64>,
    pub timestamps: Vec<f64>,
}

impl Session {
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record frequency and temperature for a stage and make it the current step.
    pub fn set_params(&mut self, index: usize, frequency: f64, temperature: f64) -> AppResult<()> {
        let frequency = validate_frequency(frequency)?;
        let temperature = validate_temperature(temperature)?;
        self.write_params(index, frequency, temperature)?;
        self.current_step = index + 1;
        self.touch();
        debug!(
            session_id = %self.id,
            step = index + 1,
            frequency,
            temperature,
            status = self.stages[index].status.as_str(),
            "Stage parameters set"
        );
        Ok(())
    }

    fn write_params(&mut self, index: usize, frequency: f64, temperature: f64) -> AppResult<()> {
        let stage = self
            .stages
            .get_mut(index)
            .ok_or_else(|| AppError::ValidationError(format!("No stage with index {}", index)))?;
        stage.frequency = Some(frequency);
        stage.temperature = Some(temperature);
        stage.status = stage.status.max(StageStatus::ParamsReceived);
        Ok(())
    }

    /// Parameters to process `index`'s audio with.
    ///
    /// Stored parameters win. Without them, values embedded in the audio message are
    /// accepted as a degraded path; a missing late temperature falls back to the
    /// session's ambient temperature.
    pub fn audio_params(
        &self,
        index: usize,
        late_frequency: Option<f64>,
        late_temperature: Option<f64>,
    ) -> AppResult<StageParams> {
        let stage = self
            .stages
            .get(index)
            .ok_or_else(|| AppError::ValidationError(format!("No stage with index {}", index)))?;

        if stage.status >= StageStatus::ParamsReceived {
            if let Some(frequency) = stage.frequency {
                return Ok(StageParams {
                    frequency,
                    temperature: stage.temperature.unwrap_or(self.temperature),
                    late: false,
                });
            }
        }

        match late_frequency {
            Some(frequency) => {
                let frequency = validate_frequency(frequency)?;
                let temperature = validate_temperature(late_temperature.unwrap_or(self.temperature))?;
                warn!(
                    session_id = %self.id,
                    step = index + 1,
                    "Audio arrived before experiment_params, using parameters embedded in the audio message"
                );
                Ok(StageParams { frequency, temperature, late: true })
            }
            None => Err(AppError::ValidationError(format!(
                "Parameters for step {} have not been received",
                index + 1
            ))),
        }
    }

    /// Store a processed recording and mark the stage `audio_processed`.
    pub fn record_audio(&mut self, index: usize, processed: ProcessedAudio) -> AppResult<()> {
        if index >= STAGE_COUNT {
            return Err(AppError::ValidationError(format!("No stage with index {}", index)));
        }
        if processed.params.late {
            self.write_params(index, processed.params.frequency, processed.params.temperature)?;
        }

        let (distances, timestamps) = if processed.distances.len() == processed.timestamps.len() {
            (processed.distances, processed.timestamps)
        } else {
            (Vec::new(), Vec::new())
        };

        let stage = &mut self.stages[index];
        stage.minima = Some(processed.analysis.minima);
        stage.detection = Some(processed.analysis.detection);
        stage.speed = processed.speed;
        stage.gamma = processed.gamma;
        stage.sample_rate = Some(processed.sample_rate);
        stage.audio_samples = processed.samples;
        stage.distance_samples = distances;
        stage.distance_timestamps = timestamps;
        stage.status = StageStatus::AudioProcessed;

        self.current_step = index + 1;
        self.touch();
        Ok(())
    }

    /// Set one temperature and per-stage frequencies in one go.
    ///
    /// Every entry is validated before anything is written, so a bad entry leaves the
    /// session untouched.
    pub fn update_all_params(&mut self, temperature: f64, entries: &[(f64, f64)]) -> AppResult<Vec<(usize, f64)>> {
        let temperature = validate_temperature(temperature)?;
        let validated = entries
            .iter()
            .map(|&(step, frequency)| Ok((stage_index(step)?, validate_frequency(frequency)?)))
            .collect::<AppResult<Vec<_>>>()?;

        for &(index, frequency) in &validated {
            self.write_params(index, frequency, temperature)?;
        }
        for stage in self.stages.iter_mut() {
            stage.temperature = Some(temperature);
        }
        self.temperature = temperature;
        self.touch();
        Ok(validated)
    }

    pub fn all_stages_processed(&self) -> bool {
        self.stages.iter().all(|s| s.status == StageStatus::AudioProcessed)
    }

    /// Whether processing `index` should trigger finalization on its own.
    ///
    /// Only the last stage triggers it, and only while the session is still running, so a
    /// finalized session is never finalized again by reprocessed audio.
    pub fn completes_experiment(&self, index: usize) -> bool {
        index == STAGE_COUNT - 1 && self.status == SessionStatus::InProgress && self.all_stages_processed()
    }
}
