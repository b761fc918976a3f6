use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::autorange::{WINDOW_CEILING_FRACTION, WINDOW_FLOOR_FRACTION};
use crate::error::LockinError;
use crate::types::{FilterSlope, ReferenceImpedance};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub instrument: InstrumentConfig,
    /// Second lock-in for dual-instrument grids; `None` for plain sweeps.
    pub follower: Option<InstrumentConfig>,
    pub sweep: SweepConfig,
    pub settle: SettleConfig,
    pub ranging: RangingConfig,
    pub averaging: AveragingConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentModel {
    Sr830,
    Sr860,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstrumentConfig {
    pub model: InstrumentModel,
    /// Serial number to disambiguate when several units are attached.
    pub serial: Option<String>,
    /// Direct VISA resource string; skips bus discovery entirely.
    pub resource: Option<String>,
    pub timeout_ms: u64,
    /// SR860 only, ignored by the SR830 profile.
    pub advanced_filter: bool,
    /// SR860 only.
    pub reference_impedance: Option<ReferenceImpedance>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SweepConfig {
    pub amplitude_min: f64,
    pub amplitude_max: f64,
    pub amplitude_points: usize,
    pub amplitude_repeats: usize,
    pub frequency_min: f64,
    pub frequency_max: f64,
    pub frequency_points: usize,
    pub frequency_repeats: usize,
    /// Logarithmic grid spacing on both axes; linear when false.
    pub log_spacing: bool,
    /// Point counts for the two passes of a dual-instrument grid.
    pub dual: DualGridConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DualGridConfig {
    pub first_pass_amplitudes: usize,
    pub first_pass_frequencies: usize,
    pub second_pass_amplitudes: usize,
    pub second_pass_frequencies: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SettleConfig {
    /// Pick time constants from the excitation instead of a fixed wait.
    pub auto_time_constant: bool,
    /// Harmonic attenuation at the smallest sweep amplitude, positive dB.
    pub attenuation_min_db: f64,
    /// Attenuation ceiling reached at large amplitudes, positive dB.
    pub attenuation_max_db: f64,
    pub slope: FilterSlope,
    /// Settle multiplier override; `None` uses the slope's own factor.
    pub wait_factor: Option<f64>,
    /// Signal-to-dc separation for dc-coupled inputs, positive dB. `None`
    /// means ac coupling, where only the 2f corner matters.
    pub signal_to_dc_db: Option<f64>,
    /// Wait per point when `auto_time_constant` is off.
    pub fixed_wait_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RangingConfig {
    pub auto_sensitivity: bool,
    pub max_adjustments: usize,
    pub window_floor: f64,
    pub window_ceiling: f64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AveragingConfig {
    /// Readings averaged per grid point; 1 records single shots.
    pub samples: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    pub directory: String,
    /// File stem; `None` derives one from the start time.
    pub stem: Option<String>,
    pub write_settings: bool,
    pub point_log: bool,
    pub log_buffer_size: usize,
    pub finalize_log_as_json: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            instrument: InstrumentConfig::default(),
            follower: None,
            sweep: SweepConfig::default(),
            settle: SettleConfig::default(),
            ranging: RangingConfig::default(),
            averaging: AveragingConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            model: InstrumentModel::Sr830,
            serial: None,
            resource: None,
            timeout_ms: 5000,
            advanced_filter: false,
            reference_impedance: None,
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            amplitude_min: 0.02,
            amplitude_max: 2.0,
            amplitude_points: 3,
            amplitude_repeats: 1,
            frequency_min: 10.0,
            frequency_max: 1000.0,
            frequency_points: 201,
            frequency_repeats: 1,
            log_spacing: true,
            dual: DualGridConfig::default(),
        }
    }
}

impl Default for DualGridConfig {
    fn default() -> Self {
        Self {
            first_pass_amplitudes: 3,
            first_pass_frequencies: 201,
            second_pass_amplitudes: 31,
            second_pass_frequencies: 9,
        }
    }
}

impl Default for SettleConfig {
    fn default() -> Self {
        Self {
            auto_time_constant: true,
            attenuation_min_db: 80.0,
            attenuation_max_db: 160.0,
            slope: FilterSlope::Db24,
            wait_factor: None,
            signal_to_dc_db: None,
            fixed_wait_ms: 1000,
        }
    }
}

impl Default for RangingConfig {
    fn default() -> Self {
        Self {
            auto_sensitivity: true,
            max_adjustments: 32,
            window_floor: WINDOW_FLOOR_FRACTION,
            window_ceiling: WINDOW_CEILING_FRACTION,
        }
    }
}

impl Default for AveragingConfig {
    fn default() -> Self {
        Self { samples: 1 }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: "./data".to_string(),
            stem: None,
            write_settings: true,
            point_log: true,
            log_buffer_size: 64,
            finalize_log_as_json: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Reject settings no sweep can run with.
    pub fn validate(&self) -> Result<(), LockinError> {
        let sweep = &self.sweep;
        if !(sweep.amplitude_min > 0.0) || !(sweep.amplitude_max >= sweep.amplitude_min) {
            return Err(LockinError::Config(format!(
                "amplitude range [{}, {}] is not a positive interval",
                sweep.amplitude_min, sweep.amplitude_max
            )));
        }
        if !(sweep.frequency_min > 0.0) || !(sweep.frequency_max >= sweep.frequency_min) {
            return Err(LockinError::Config(format!(
                "frequency range [{}, {}] is not a positive interval",
                sweep.frequency_min, sweep.frequency_max
            )));
        }
        if sweep.amplitude_points == 0 || sweep.frequency_points == 0 {
            return Err(LockinError::Config(
                "sweep needs at least one point on each axis".to_string(),
            ));
        }
        if sweep.amplitude_repeats == 0 || sweep.frequency_repeats == 0 {
            return Err(LockinError::Config(
                "repeat counts must be at least 1".to_string(),
            ));
        }
        let settle = &self.settle;
        if settle.attenuation_min_db > settle.attenuation_max_db {
            return Err(LockinError::Config(format!(
                "attenuation floor {} dB exceeds ceiling {} dB",
                settle.attenuation_min_db, settle.attenuation_max_db
            )));
        }
        if let Some(factor) = settle.wait_factor {
            if !(factor > 0.0) || !factor.is_finite() {
                return Err(LockinError::Config(format!(
                    "wait factor {} must be positive and finite",
                    factor
                )));
            }
        }
        let ranging = &self.ranging;
        if !(ranging.window_floor > 0.0) || !(ranging.window_ceiling > ranging.window_floor) {
            return Err(LockinError::Config(format!(
                "range window [{}, {}] is not an increasing positive pair",
                ranging.window_floor, ranging.window_ceiling
            )));
        }
        if self.averaging.samples == 0 {
            return Err(LockinError::Config(
                "averaging needs at least one sample per point".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        // Try common config file locations
        let possible_paths = ["config.toml", "sweep_config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Add environment variable overrides with prefix "RUSTY_LOCKIN_"
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_LOCKIN")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize::<AppConfig>()
}

/// Load configuration with better error handling and defaults
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
