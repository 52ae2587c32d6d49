//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## What lives here:
//! - **config**: runtime-updatable configuration (`Arc<RwLock<AppConfig>>`)
//! - **metrics**: request, error and experiment counters
//! - **store**: the session persistence collaborator
//! - **session_locks**: one async mutex per experiment session
//!
//! ## Lock discipline:
//! The std `RwLock`s guard plain data and are never held across an `.await`. The
//! per-session locks are `tokio::sync::Mutex`es because they are held for the whole
//! duration of a message, including the blocking computation, even when the caller
//! stops waiting for it.
//!
//! A poisoned std lock only means another thread panicked mid-update of a counter or a
//! config snapshot, so readers recover the inner value instead of propagating the panic.

use crate::config::AppConfig;
use crate::experiment::{ExperimentController, HandleStats, InMemoryStore, SessionStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use uuid::Uuid;

/// The main application state shared across all handlers and actors.
///
/// Cloning is cheap: every field is an `Arc` or `Copy`.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime via `PUT /api/v1/config`)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by middleware and by the WebSocket actors
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Session and result persistence
    pub store: Arc<dyn SessionStore>,

    /// Serializes message handling per session across connections
    pub session_locks: Arc<SessionLocks>,

    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Counters collected since server start.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Total number of failed HTTP requests
    pub error_count: u64,

    /// Currently connected experiment WebSockets
    pub active_sessions: u32,

    /// Protocol messages handled over WebSocket
    pub messages_handled: u64,

    /// Stage recordings that made it through the pipeline
    pub stages_processed: u64,

    /// Finalization passes, automatic or requested
    pub finalizations: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Per-endpoint request statistics.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative processing time (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

/// Registry of per-session async mutexes.
///
/// Entries are created on first use and dropped by [`SessionLocks::release`] once no
/// connection holds them.
#[derive(Debug, Default)]
pub struct SessionLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    /// The mutex guarding `session_id`, shared by every caller.
    pub fn lock_for(&self, session_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(session_id).or_default().clone()
    }

    /// Forget the mutex for `session_id` if nobody else holds a handle to it.
    pub fn release(&self, session_id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(&session_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&session_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Run `job` on the blocking pool while holding the lock for `session_id`.
    ///
    /// The guard travels into the blocking closure: dropping the returned future (a
    /// client disconnecting mid-message) leaves the session locked until `job` returns.
    pub async fn run_exclusive<T, F>(&self, session_id: Uuid, job: F) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let guard = self.lock_for(session_id).lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            job()
        })
        .await
    }
}

impl AppState {
    /// State backed by the in-memory store.
    pub fn new(config: AppConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(config: AppConfig, store: Arc<dyn SessionStore>) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            store,
            session_locks: Arc::new(SessionLocks::default()),
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so a long computation never blocks a
    /// config update.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    /// A controller over the current configuration snapshot.
    ///
    /// Built per message so that runtime config updates reach the next message.
    pub fn controller(&self) -> ExperimentController {
        ExperimentController::new(self.store.clone(), &self.get_config())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a connection slot. Returns `false` when the session cap is reached.
    pub fn try_acquire_session_slot(&self) -> bool {
        let limit = self.get_config().performance.max_concurrent_sessions;
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= limit {
            return false;
        }
        metrics.active_sessions += 1;
        true
    }

    /// Give back a connection slot (underflow-safe).
    pub fn release_session_slot(&self) {
        let mut metrics = self.write_metrics();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);
    }

    /// Fold one handled message into the experiment counters.
    pub fn record_message(&self, stats: HandleStats) {
        let mut metrics = self.write_metrics();
        metrics.messages_handled += 1;
        metrics.stages_processed += stats.stages_processed as u64;
        metrics.finalizations += stats.finalizations as u64;
    }

    /// Consistent copy of all counters.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[actix_web::test]
    async fn test_exclusive_job_outlives_dropped_caller() {
        let locks = SessionLocks::default();
        let id = Uuid::new_v4();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (finish_tx, finish_rx) = std::sync::mpsc::channel::<()>();

        let mut job = Box::pin(locks.run_exclusive(id, move || {
            let _ = started_tx.send(());
            let _ = finish_rx.recv();
        }));
        tokio::select! {
            _ = &mut job => panic!("job finished before it was released"),
            started = started_rx => started.unwrap(),
        }
        drop(job);

        // Caller is gone but the computation is still running
        assert!(locks.lock_for(id).try_lock().is_err());
        locks.release(id);
        assert_eq!(locks.len(), 1);

        finish_tx.send(()).unwrap();
        let mut freed = false;
        for _ in 0..200 {
            if locks.lock_for(id).try_lock().is_ok() {
                freed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(freed);
        locks.release(id);
        assert_eq!(locks.len(), 0);
    }

    #[actix_web::test]
    async fn test_exclusive_jobs_run_in_turn() {
        let locks = Arc::new(SessionLocks::default());
        let id = Uuid::new_v4();
        let log = Arc::new(Mutex::new(Vec::new()));

        let jobs = (0..4).map(|n| {
            let log = log.clone();
            let locks = locks.clone();
            async move {
                locks
                    .run_exclusive(id, move || {
                        log.lock().unwrap().push(("start", n));
                        std::thread::sleep(Duration::from_millis(5));
                        log.lock().unwrap().push(("end", n));
                    })
                    .await
                    .unwrap()
            }
        });
        futures_util::future::join_all(jobs).await;

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        for pair in log.chunks(2) {
            assert_eq!(pair[0].0, "start");
            assert_eq!(pair[1], ("end", pair[0].1));
        }
    }

    #[test]
    fn test_session_slots_respect_limit() {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = 2;
        let state = AppState::new(config);

        assert!(state.try_acquire_session_slot());
        assert!(state.try_acquire_session_slot());
        assert!(!state.try_acquire_session_slot());
        state.release_session_slot();
        assert!(state.try_acquire_session_slot());

        state.release_session_slot();
        state.release_session_slot();
        state.release_session_slot();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_session_locks_are_shared_and_released() {
        let locks = SessionLocks::default();
        let id = Uuid::new_v4();
        let a = locks.lock_for(id);
        let b = locks.lock_for(id);
        assert!(Arc::ptr_eq(&a, &b));

        locks.release(id);
        assert_eq!(locks.len(), 1);
        drop(a);
        drop(b);
        locks.release(id);
        assert_eq!(locks.len(), 0);
    }

    #[test]
    fn test_update_config_validates() {
        let state = AppState::new(AppConfig::default());
        let mut bad = AppConfig::default();
        bad.physics.carriage_speed_m_per_s = 0.0;
        assert!(state.update_config(bad).is_err());
        assert_eq!(state.get_config().physics.carriage_speed_m_per_s, 0.01);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);
        state.record_message(HandleStats { stages_processed: 1, finalizations: 1 });

        let snapshot = state.get_metrics_snapshot();
        let health = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
        assert_eq!(snapshot.stages_processed, 1);
        assert_eq!(snapshot.messages_handled, 1);
    }
}
