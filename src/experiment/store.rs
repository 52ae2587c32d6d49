//! # Session Persistence
//!
//! The experiment logic only talks to storage through [`SessionStore`]. The service
//! ships [`InMemoryStore`]; a database-backed store can implement the same trait.
//!
//! ## Consistency:
//! Sessions and results are replaced as whole records under a write lock, so a reader
//! never observes a half-updated stage array.

use crate::analysis::physics::REFERENCE_GAMMA;
use crate::error::{AppError, AppResult};
use crate::experiment::model::{Measurement, ResultFields, ResultRecord, Session, ValidationStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Storage collaborator for sessions and their results.
pub trait SessionStore: Send + Sync {
    /// Open a new session at the given ambient temperature.
    fn create_session(&self, temperature: f64) -> AppResult<Session>;

    fn load_session(&self, id: Uuid) -> AppResult<Session>;

    fn save_session(&self, session: &Session) -> AppResult<()>;

    /// Write `fields` into the session's result, creating the record on first use.
    fn upsert_result(&self, session_id: Uuid, fields: ResultFields) -> AppResult<ResultRecord>;

    fn get_result(&self, session_id: Uuid) -> AppResult<ResultRecord>;

    fn session_count(&self) -> usize;
}

fn poisoned(what: &str) -> AppError {
    AppError::Internal(format!("{} lock poisoned", what))
}

/// Process-local store backed by two hash maps.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<Uuid, Session>>,
    results: RwLock<HashMap<Uuid, ResultRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemoryStore {
    fn create_session(&self, temperature: f64) -> AppResult<Session> {
        if !temperature.is_finite() || temperature <= -273.15 {
            return Err(AppError::ValidationError(format!(
                "Temperature must be a finite value above absolute zero, got {}",
                temperature
            )));
        }
        let session = Session::new(Uuid::new_v4(), temperature);
        let mut sessions = self.sessions.write().map_err(|_| poisoned("session"))?;
        sessions.insert(session.id, session.clone());
        debug!(session_id = %session.id, temperature, "Session created");
        Ok(session)
    }

    fn load_session(&self, id: Uuid) -> AppResult<Session> {
        let sessions = self.sessions.read().map_err(|_| poisoned("session"))?;
        sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Session {} does not exist", id)))
    }

    fn save_session(&self, session: &Session) -> AppResult<()> {
        let mut sessions = self.sessions.write().map_err(|_| poisoned("session"))?;
        match sessions.get_mut(&session.id) {
            Some(existing) => {
                *existing = session.clone();
                Ok(())
            }
            None => Err(AppError::NotFound(format!("Session {} does not exist", session.id))),
        }
    }

    fn upsert_result(&self, session_id: Uuid, fields: ResultFields) -> AppResult<ResultRecord> {
        if !self
            .sessions
            .read()
            .map_err(|_| poisoned("session"))?
            .contains_key(&session_id)
        {
            return Err(AppError::NotFound(format!("Session {} does not exist", session_id)));
        }

        let mut results = self.results.write().map_err(|_| poisoned("result"))?;
        let mut record = results.get(&session_id).cloned().unwrap_or_else(|| ResultRecord {
            session_id,
            detailed: Vec::new(),
            average_gamma: Measurement::Invalid,
            average_speed: Measurement::Invalid,
            gamma_reference: REFERENCE_GAMMA,
            student_speed: None,
            student_gamma: None,
            error_percent: None,
            validation: ValidationStatus::Pending,
            updated_at: Utc::now(),
        });

        match fields {
            ResultFields::Calculated {
                detailed,
                average_gamma,
                average_speed,
                gamma_reference,
            } => {
                record.detailed = detailed;
                record.average_gamma = average_gamma;
                record.average_speed = average_speed;
                record.gamma_reference = gamma_reference;
            }
            ResultFields::Submission {
                student_speed,
                student_gamma,
                error_percent,
                validation,
            } => {
                record.student_speed = Some(student_speed);
                record.student_gamma = Some(student_gamma);
                record.error_percent = Some(error_percent);
                record.validation = validation;
            }
        }
        record.updated_at = Utc::now();

        results.insert(session_id, record.clone());
        Ok(record)
    }

    fn get_result(&self, session_id: Uuid) -> AppResult<ResultRecord> {
        let results = self.results.read().map_err(|_| poisoned("result"))?;
        results
            .get(&session_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("No result for session {}", session_id)))
    }

    fn session_count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::model::StageStatus;

    #[test]
    fn test_create_load_save() {
        let store = InMemoryStore::new();
        let mut session = store.create_session(21.0).unwrap();
        assert_eq!(store.session_count(), 1);

        session.stages[0].status = StageStatus::ParamsReceived;
        store.save_session(&session).unwrap();
        let loaded = store.load_session(session.id).unwrap();
        assert_eq!(loaded.stages[0].status, StageStatus::ParamsReceived);
    }

    #[test]
    fn test_unknown_session_is_not_found() {
        let store = InMemoryStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.load_session(id).unwrap_err().code(), "not_found");
        assert_eq!(store.get_result(id).unwrap_err().code(), "not_found");
        assert!(store.save_session(&Session::new(id, 20.0)).is_err());
        assert!(store
            .upsert_result(id, ResultFields::Submission {
                student_speed: 1.0,
                student_gamma: 1.0,
                error_percent: 0.0,
                validation: ValidationStatus::Success,
            })
            .is_err());
    }

    #[test]
    fn test_rejects_impossible_temperature() {
        let store = InMemoryStore::new();
        assert!(store.create_session(f64::NAN).is_err());
        assert!(store.create_session(-300.0).is_err());
    }

    #[test]
    fn test_recalculation_keeps_submission() {
        let store = InMemoryStore::new();
        let session = store.create_session(20.0).unwrap();
        let calculated = || ResultFields::Calculated {
            detailed: vec![],
            average_gamma: Measurement::Valid(1.39),
            average_speed: Measurement::Valid(342.0),
            gamma_reference: REFERENCE_GAMMA,
        };

        store.upsert_result(session.id, calculated()).unwrap();
        store
            .upsert_result(session.id, ResultFields::Submission {
                student_speed: 340.0,
                student_gamma: 1.41,
                error_percent: 0.71,
                validation: ValidationStatus::Success,
            })
            .unwrap();
        let record = store.upsert_result(session.id, calculated()).unwrap();

        assert_eq!(record.student_gamma, Some(1.41));
        assert_eq!(record.validation, ValidationStatus::Success);
        assert_eq!(record.average_gamma, Measurement::Valid(1.39));
        assert_eq!(store.get_result(session.id).unwrap(), record);
    }
}
