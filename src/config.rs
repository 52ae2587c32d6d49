//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - Default values (built into the code)
//! - TOML configuration file (`config.toml`, optional)
//! - Environment variables (with `APP__` prefix, `__` between nesting levels)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP__SERVER__PORT`, `APP__PROCESSING__LOWPASS_CUTOFF_HZ`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where to listen
//! - **processing**: signal conditioning and minima detector thresholds
//! - **physics**: site calibration for the time-based speed estimate
//! - **performance**: connection and payload limits

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub processing: ProcessingConfig,
    pub physics: PhysicsConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (lab deployment)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Signal processing and minima detection settings.
///
/// ## Fields:
/// - `lowpass_cutoff_hz` / `filter_order`: Butterworth low-pass applied before envelope extraction
/// - `min_peak_height`: minimum height of an inverted-envelope peak (0..1)
/// - `separation_ratio`: primary path minimum peak separation, as a fraction of aligned samples
/// - `min_prominence`: how much a minimum must stand out from its surroundings (0..1)
/// - `width_ratio`: minimum peak width, as a fraction of the samples searched
/// - `fallback_min_separation_s`: audio-only path minimum time between minima
/// - `fallback_min_samples`: audio shorter than this is not searched at all
/// - `default_sample_rate`: sample rate assumed for raw PCM payloads without one
/// - `retain_audio_samples`: keep decoded samples on the stage for diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub lowpass_cutoff_hz: f64,
    pub filter_order: usize,
    pub min_peak_height: f64,
    pub separation_ratio: f64,
    pub min_prominence: f64,
    pub width_ratio: f64,
    pub fallback_min_separation_s: f64,
    pub fallback_min_samples: usize,
    pub default_sample_rate: u32,
    pub retain_audio_samples: bool,
}

/// Physics calibration.
///
/// `carriage_speed_m_per_s` converts time between minima into tube travel when the
/// distance sensor produced nothing usable. It depends on the rig and must be
/// calibrated per site; the default matches the reference bench rig.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhysicsConfig {
    pub carriage_speed_m_per_s: f64,
}

/// Performance tuning configuration.
///
/// ## Fields:
/// - `max_concurrent_sessions`: experiment WebSocket connections allowed at once
/// - `max_audio_bytes`: largest decoded audio payload accepted per stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub max_audio_bytes: usize,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            lowpass_cutoff_hz: 10_000.0,
            filter_order: 4,
            min_peak_height: 0.2,
            separation_ratio: 0.03,
            min_prominence: 0.15,
            width_ratio: 0.01,
            fallback_min_separation_s: 0.015,
            fallback_min_samples: 100,
            default_sample_rate: 44_100,
            retain_audio_samples: false,
        }
    }
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            carriage_speed_m_per_s: 0.01,
        }
    }
}

/// Provides default configuration values.
///
/// Default values ensure the application can start even if no configuration file exists.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            processing: ProcessingConfig::default(),
            physics: PhysicsConfig::default(),
            performance: PerformanceConfig {
                max_concurrent_sessions: 32,
                max_audio_bytes: 64 * 1024 * 1024,  // 64 MiB decoded audio per stage
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP__PROCESSING__MIN_PROMINENCE=0.1`: Loosen the prominence threshold
    /// - `APP__PHYSICS__CARRIAGE_SPEED_M_PER_S=0.012`: Site calibration
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Environment variables; double underscore keeps snake_case keys intact
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures deep inside the
    /// detection pipeline, where they would only show up as "no minima found".
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let p = &self.processing;
        if !(p.lowpass_cutoff_hz > 0.0) {
            return Err(anyhow::anyhow!("Low-pass cutoff must be greater than 0"));
        }
        if p.filter_order == 0 || p.filter_order % 2 != 0 {
            return Err(anyhow::anyhow!("Filter order must be a positive even number"));
        }
        for (name, value) in [
            ("min_peak_height", p.min_peak_height),
            ("min_prominence", p.min_prominence),
            ("separation_ratio", p.separation_ratio),
            ("width_ratio", p.width_ratio),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow::anyhow!("{} must be within [0, 1], got {}", name, value));
            }
        }
        if !(p.fallback_min_separation_s > 0.0) {
            return Err(anyhow::anyhow!("Fallback minimum separation must be greater than 0"));
        }
        if p.default_sample_rate == 0 {
            return Err(anyhow::anyhow!("Default sample rate must be greater than 0"));
        }

        if !(self.physics.carriage_speed_m_per_s > 0.0) {
            return Err(anyhow::anyhow!("Carriage speed must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.max_audio_bytes == 0 {
            return Err(anyhow::anyhow!("Max audio bytes must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are touched, e.g.
    /// `{"processing": {"min_prominence": 0.1}}` changes one detector threshold.
    /// The server section is read-only at runtime since the socket is already bound.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(processing) = partial_config.get("processing") {
            let p = &mut self.processing;
            let float = |key: &str| processing.get(key).and_then(|v| v.as_f64());
            if let Some(v) = float("lowpass_cutoff_hz") {
                p.lowpass_cutoff_hz = v;
            }
            if let Some(v) = processing.get("filter_order").and_then(|v| v.as_u64()) {
                p.filter_order = v as usize;
            }
            if let Some(v) = float("min_peak_height") {
                p.min_peak_height = v;
            }
            if let Some(v) = float("separation_ratio") {
                p.separation_ratio = v;
            }
            if let Some(v) = float("min_prominence") {
                p.min_prominence = v;
            }
            if let Some(v) = float("width_ratio") {
                p.width_ratio = v;
            }
            if let Some(v) = float("fallback_min_separation_s") {
                p.fallback_min_separation_s = v;
            }
            if let Some(v) = processing.get("fallback_min_samples").and_then(|v| v.as_u64()) {
                p.fallback_min_samples = v as usize;
            }
            if let Some(v) = processing.get("default_sample_rate").and_then(|v| v.as_u64()) {
                p.default_sample_rate = v as u32;
            }
            if let Some(v) = processing.get("retain_audio_samples").and_then(|v| v.as_bool()) {
                p.retain_audio_samples = v;
            }
        }

        if let Some(physics) = partial_config.get("physics") {
            if let Some(v) = physics.get("carriage_speed_m_per_s").and_then(|v| v.as_f64()) {
                self.physics.carriage_speed_m_per_s = v;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(bytes) = performance.get("max_audio_bytes").and_then(|v| v.as_u64()) {
                self.performance.max_audio_bytes = bytes as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.processing.lowpass_cutoff_hz, 10_000.0);
        assert_eq!(config.processing.filter_order, 4);
        assert_eq!(config.processing.fallback_min_samples, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.filter_order = 3;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.processing.min_prominence = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.physics.carriage_speed_m_per_s = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"processing": {"min_prominence": 0.1}, "physics": {"carriage_speed_m_per_s": 0.02}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.processing.min_prominence, 0.1);
        assert_eq!(config.physics.carriage_speed_m_per_s, 0.02);
        // Untouched fields keep their values
        assert_eq!(config.processing.min_peak_height, 0.2);
    }

    #[test]
    fn test_config_update_rejects_invalid() {
        let mut config = AppConfig::default();
        let json = r#"{"performance": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
