//! # Analysis Module
//!
//! Turns a conditioned recording (plus the optional distance trace) into interference
//! minima, and minima into physical quantities.
//!
//! ## Key Components:
//! - **Alignment**: distance trace → audio timeline
//! - **Peaks**: generic peak search with height/distance/prominence/width filters
//! - **Minima**: primary (distance-aligned) and fallback (audio-only) detectors
//! - **Pipeline**: chains the audio stages and the detectors for one stage recording
//! - **Physics**: speed of sound, γ, percentage errors

pub mod alignment;
pub mod minima;
pub mod peaks;
pub mod physics;
pub mod pipeline;

pub use physics::PhysicsCalculator;
pub use pipeline::{StageAnalysis, StageAnalyzer};
