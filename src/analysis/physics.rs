//! # Physics
//!
//! Speed of sound from minima spacing, and the heat-capacity ratio γ of air from the
//! speed and temperature.
//!
//! ## Formulas:
//! - Adjacent minima are half a wavelength apart: `λ = 2·L`, so `v = 2·L·f`
//! - Ideal gas: `γ = v²·M / (R·T)` with `M = 0.029 kg/mol`, `R = 8.314 J/(mol·K)`
//!
//! Anything that cannot produce a physically meaningful number returns
//! `Measurement::Invalid` instead of an error.

use crate::experiment::model::{round_to, Measurement, Minimum};
use tracing::warn;

/// Universal gas constant, J/(mol·K)
pub const GAS_CONSTANT: f64 = 8.314;
/// Molar mass of dry air, kg/mol
pub const AIR_MOLAR_MASS: f64 = 0.029;
/// Accepted γ for diatomic air
pub const REFERENCE_GAMMA: f64 = 1.4;
/// Largest relative error, percent, a student result may have and still pass
pub const ACCEPTANCE_THRESHOLD_PERCENT: f64 = 10.0;
/// Plausible γ range; values outside are treated as measurement failures
pub const GAMMA_RANGE: std::ops::RangeInclusive<f64> = 1.0..=2.0;

const ZERO_CELSIUS_IN_KELVIN: f64 = 273.15;
/// Distances closer than this (cm) count as the same carriage position
const DISTANCE_TOLERANCE_CM: f64 = 1e-9;

/// Speed and γ derivation with the rig's carriage calibration.
#[derive(Debug, Clone, Copy)]
pub struct PhysicsCalculator {
    carriage_speed_m_per_s: f64,
}

impl PhysicsCalculator {
    pub fn new(carriage_speed_m_per_s: f64) -> Self {
        Self { carriage_speed_m_per_s }
    }

    /// Speed of sound, m/s.
    ///
    /// Uses distinct `distance_cm` values when at least two exist. Otherwise the mean time
    /// between minima is turned into travel with the configured carriage speed, which is
    /// only as good as that calibration.
    pub fn speed(&self, minima: &[Minimum], frequency: f64) -> Measurement {
        if !(frequency > 0.0) || !frequency.is_finite() {
            return Measurement::Invalid;
        }
        let mut times: Vec<f64> = minima.iter().map(|m| m.time_sec).filter(|t| t.is_finite()).collect();
        if times.len() < 2 {
            return Measurement::Invalid;
        }

        let mut distances: Vec<f64> = minima
            .iter()
            .filter_map(|m| m.distance_cm)
            .filter(|d| d.is_finite())
            .collect();
        distances.sort_by(|a, b| a.total_cmp(b));
        distances.dedup_by(|a, b| (*a - *b).abs() < DISTANCE_TOLERANCE_CM);

        let spacing_m = if distances.len() >= 2 {
            mean_step(&distances) / 100.0
        } else {
            times.sort_by(|a, b| a.total_cmp(b));
            warn!(
                carriage_speed_m_per_s = self.carriage_speed_m_per_s,
                "No usable distance readings, estimating spacing from time; result depends on carriage calibration"
            );
            mean_step(&times) * self.carriage_speed_m_per_s
        };

        let speed = 2.0 * spacing_m * frequency;
        if speed > 0.0 {
            Measurement::from_f64(speed)
        } else {
            Measurement::Invalid
        }
    }

    /// γ of air at `temperature_c`, valid only inside [`GAMMA_RANGE`].
    pub fn gamma(&self, speed: Measurement, temperature_c: f64) -> Measurement {
        let Some(v) = speed.value() else {
            return Measurement::Invalid;
        };
        let kelvin = temperature_c + ZERO_CELSIUS_IN_KELVIN;
        if !(v > 0.0) || !(kelvin > 0.0) {
            return Measurement::Invalid;
        }

        let gamma = v * v * AIR_MOLAR_MASS / (GAS_CONSTANT * kelvin);
        if GAMMA_RANGE.contains(&gamma) {
            Measurement::from_f64(gamma)
        } else {
            Measurement::Invalid
        }
    }
}

/// Mean difference between consecutive sorted values.
fn mean_step(sorted: &[f64]) -> f64 {
    (sorted[sorted.len() - 1] - sorted[0]) / (sorted.len() - 1) as f64
}

/// Absolute relative error in percent, rounded to two decimals.
pub fn error_percent(value: f64, reference: f64) -> Measurement {
    if reference == 0.0 {
        return Measurement::Invalid;
    }
    Measurement::from_f64(round_to(((value - reference) / reference).abs() * 100.0, 2))
}
