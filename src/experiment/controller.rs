//! # Experiment Controller
//!
//! Executes one inbound protocol message against one session:
//! load → validate → compute → mutate → save → reply.
//!
//! ## Failure policy:
//! A handler that fails returns before the save, so the stored session keeps its last
//! committed state and the client gets a single `error` frame. Other stages are never
//! touched by a failing message.
//!
//! The controller is synchronous and CPU-bound. Callers serialize access per session
//! and run it on a blocking thread.

use crate::analysis::{PhysicsCalculator, StageAnalyzer};
use crate::audio::AudioDecoder;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::experiment::model::{Session, STAGE_COUNT};
use crate::experiment::results::{Finalization, ResultAggregator};
use crate::experiment::session::{stage_index, ProcessedAudio};
use crate::experiment::store::SessionStore;
use crate::protocol::{InboundMessage, OutboundMessage, StageParamsAck};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Counters reported back to the caller for metrics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HandleStats {
    pub stages_processed: u32,
    pub finalizations: u32,
}

pub struct ExperimentController {
    store: Arc<dyn SessionStore>,
    decoder: AudioDecoder,
    analyzer: StageAnalyzer,
    physics: PhysicsCalculator,
    aggregator: ResultAggregator,
    retain_audio_samples: bool,
}

impl ExperimentController {
    /// Build a controller from a configuration snapshot.
    pub fn new(store: Arc<dyn SessionStore>, config: &AppConfig) -> Self {
        let physics = PhysicsCalculator::new(config.physics.carriage_speed_m_per_s);
        Self {
            store,
            decoder: AudioDecoder::new(
                config.performance.max_audio_bytes,
                config.processing.default_sample_rate,
            ),
            analyzer: StageAnalyzer::new(&config.processing),
            physics,
            aggregator: ResultAggregator::new(physics),
            retain_audio_samples: config.processing.retain_audio_samples,
        }
    }

    /// Handle one message, turning any failure into an `error` frame.
    pub fn handle(&self, session_id: Uuid, message: InboundMessage) -> (Vec<OutboundMessage>, HandleStats) {
        let kind = message.kind();
        let mut session = match self.store.load_session(session_id) {
            Ok(session) => session,
            Err(e) => {
                warn!(%session_id, message_type = kind, error = %e, "Session unavailable");
                return (vec![OutboundMessage::error(&e, 0)], HandleStats::default());
            }
        };
        let committed_step = session.current_step;
        let mut stats = HandleStats::default();

        match self.dispatch(&mut session, message, &mut stats) {
            Ok(replies) => (replies, stats),
            Err(e) => {
                warn!(%session_id, message_type = kind, error = %e, "Message rejected");
                (vec![OutboundMessage::error(&e, committed_step)], HandleStats::default())
            }
        }
    }

    fn dispatch(
        &self,
        session: &mut Session,
        message: InboundMessage,
        stats: &mut HandleStats,
    ) -> AppResult<Vec<OutboundMessage>> {
        match message {
            InboundMessage::ExperimentParams { step, frequency, temperature } => {
                let index = stage_index(step.0)?;
                session.set_params(index, frequency.0, temperature.0)?;
                self.store.save_session(session)?;
                info!(session_id = %session.id, step = index + 1, frequency = frequency.0, "Parameters received");
                Ok(vec![OutboundMessage::StepConfirmation {
                    step: index + 1,
                    status: "ready_for_recording",
                    frequency: frequency.0,
                    temperature: temperature.0,
                }])
            }

            InboundMessage::CompleteAudio {
                step,
                data,
                format,
                distances,
                timestamps,
                frequency,
                temperature,
                sample_rate,
            } => {
                let index = stage_index(step.0)?;
                let params = session.audio_params(index, frequency.map(|f| f.0), temperature.map(|t| t.0))?;

                let started = Instant::now();
                let audio = self.decoder.decode(&data, &format, sample_rate)?;
                let analysis = self.analyzer.analyze(&audio, &distances, &timestamps);
                let speed = self.physics.speed(&analysis.minima, params.frequency);
                let gamma = self.physics.gamma(speed, params.temperature);
                info!(
                    session_id = %session.id,
                    step = index + 1,
                    audio_seconds = audio.duration_seconds(),
                    minima = analysis.minima.len(),
                    detection = ?analysis.detection,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Stage audio processed"
                );

                let reply = OutboundMessage::MinimaData {
                    step: index + 1,
                    minima: analysis.minima.clone(),
                    frequency: params.frequency,
                    temperature: params.temperature,
                    speed,
                    gamma,
                    detection: analysis.detection,
                };
                session.record_audio(
                    index,
                    ProcessedAudio {
                        params,
                        analysis,
                        speed,
                        gamma,
                        sample_rate: audio.sample_rate,
                        samples: self.retain_audio_samples.then_some(audio.samples),
                        distances,
                        timestamps,
                    },
                )?;
                stats.stages_processed += 1;

                let mut replies = vec![reply];
                if session.completes_experiment(index) {
                    info!(session_id = %session.id, "All {} stages processed, finalizing", STAGE_COUNT);
                    replies.push(self.finalize(session, stats)?);
                } else {
                    self.store.save_session(session)?;
                }
                Ok(replies)
            }

            InboundMessage::StartRecording { step } => {
                let step = stage_index(step.0)? + 1;
                Ok(vec![OutboundMessage::RecordingStarted { step }])
            }

            InboundMessage::StopRecording { step } => {
                let step = stage_index(step.0)? + 1;
                Ok(vec![OutboundMessage::RecordingStopped { step }])
            }

            InboundMessage::FinalizeExperiment => Ok(vec![self.finalize(session, stats)?]),

            InboundMessage::UpdateAllParams { temperature, stages } => {
                let entries: Vec<(f64, f64)> = stages.iter().map(|s| (s.step.0, s.frequency.0)).collect();
                let applied = session.update_all_params(temperature.0, &entries)?;
                self.store.save_session(session)?;
                Ok(vec![OutboundMessage::ParametersUpdatedAck {
                    temperature: temperature.0,
                    stages: applied
                        .into_iter()
                        .map(|(index, frequency)| StageParamsAck { step: index + 1, frequency })
                        .collect(),
                }])
            }

            InboundMessage::FinalResults { student_speed, student_gamma } => {
                let record = self.store.get_result(session.id)?;
                let verification = self
                    .aggregator
                    .validate_submission(&record, student_speed.0, student_gamma.0)?;
                self.store.upsert_result(session.id, verification.to_fields())?;
                info!(
                    session_id = %session.id,
                    is_valid = verification.is_valid,
                    gamma_error_reference = verification.gamma_error_reference,
                    "Student submission validated"
                );
                Ok(vec![OutboundMessage::VerificationResult(verification)])
            }

            InboundMessage::Unknown => Err(AppError::ValidationError("Unknown message type".to_string())),
        }
    }

    /// Run finalization, persist session and result, and build the reply.
    fn finalize(&self, session: &mut Session, stats: &mut HandleStats) -> AppResult<OutboundMessage> {
        let finalization = self.aggregator.finalize(session);
        self.store.save_session(session)?;
        self.store.upsert_result(session.id, finalization.clone().into_fields())?;
        stats.finalizations += 1;

        let Finalization {
            detailed,
            average_gamma,
            average_speed,
            status,
        } = finalization;
        Ok(OutboundMessage::ExperimentComplete {
            message: match average_gamma.is_valid() {
                true => "Experiment completed successfully".to_string(),
                false => "Experiment finished without a valid gamma value".to_string(),
            },
            steps: detailed,
            average_gamma,
            average_speed,
            status,
        })
    }
}
