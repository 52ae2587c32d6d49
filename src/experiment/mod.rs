//! Experiment sessions: the data model, the per-stage state machine, result
//! aggregation, storage and the message controller tying them together.

pub mod controller;
pub mod model;
pub mod results;
pub mod session;
pub mod store;

pub use controller::{ExperimentController, HandleStats};
pub use store::{InMemoryStore, SessionStore};
