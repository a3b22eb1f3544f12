//! # Firmware Configuration
//!
//! Every tunable of the firmware lives in one TOML file. Every section is optional and
//! falls back to the defaults of a small single-extruder printer.
//!
//! ## Example: TOML Configuration
//!
//! ```toml
//! [protocol]
//! queue_capacity = 10
//! host_commands = true
//!
//! [motion.backlash]
//! enabled = true
//! x = 0.33
//! y = 0.69
//!
//! [motion.current]
//! medium_height = 40.0
//! high_height = 80.0
//! ```
//!
//! Load with [`load_config`], which also runs [`Config::validate`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct for the firmware and its collaborators.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub printer: PrinterConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub homing: HomingConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub heater: HeaterConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulator: SimulatorConfig,
}

/// Identity reported by `M115`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrinterConfig {
    #[serde(default = "default_firmware_name")]
    pub firmware_name: String,
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
    #[serde(default = "default_machine_type")]
    pub machine_type: String,
    /// Written into blank storage on first boot.
    #[serde(default = "default_serial_number")]
    pub serial_number: String,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            firmware_name: default_firmware_name(),
            firmware_version: default_firmware_version(),
            machine_type: default_machine_type(),
            serial_number: default_serial_number(),
        }
    }
}

/// Command queue and wire protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProtocolConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_line_buffer")]
    pub line_buffer: usize,
    #[serde(default = "default_true")]
    pub host_commands: bool,
    #[serde(default = "default_host_escape")]
    pub host_escape: char,
    #[serde(default = "default_wait_interval_ms")]
    pub wait_interval_ms: u64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            line_buffer: default_line_buffer(),
            host_commands: true,
            host_escape: default_host_escape(),
            wait_interval_ms: default_wait_interval_ms(),
        }
    }
}

impl ProtocolConfig {
    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }
}

/// Motion envelope, step conversion and compensation features.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MotionConfig {
    /// `[min, max]` in millimeters for X, Y and Z.
    #[serde(default = "default_envelope")]
    pub envelope: [[f32; 2]; 3],
    /// Steps per millimeter for X, Y, Z and E.
    #[serde(default = "default_steps_per_mm")]
    pub steps_per_mm: [f32; 4],
    #[serde(default)]
    pub invert_direction: [bool; 4],
    /// Longest sub-segment a move is split into, in millimeters.
    #[serde(default = "default_segment_length")]
    pub segment_length: f32,
    /// mm/min
    #[serde(default = "default_feedrate")]
    pub default_feedrate: f32,
    #[serde(default)]
    pub backlash: BacklashConfig,
    #[serde(default)]
    pub bed_leveling: FeatureToggle,
    #[serde(default)]
    pub skew: FeatureToggle,
    #[serde(default)]
    pub current: CurrentTierConfig,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            envelope: default_envelope(),
            steps_per_mm: default_steps_per_mm(),
            invert_direction: [false; 4],
            segment_length: default_segment_length(),
            default_feedrate: default_feedrate(),
            backlash: BacklashConfig::default(),
            bed_leveling: FeatureToggle::default(),
            skew: FeatureToggle::default(),
            current: CurrentTierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BacklashConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backlash_x")]
    pub x: f32,
    #[serde(default = "default_backlash_y")]
    pub y: f32,
    /// mm/min used for the pre-travel itself.
    #[serde(default = "default_backlash_feedrate")]
    pub feedrate: f32,
}

impl Default for BacklashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            x: default_backlash_x(),
            y: default_backlash_y(),
            feedrate: default_backlash_feedrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeatureToggle {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for FeatureToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Height bands selecting the motor drive current.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CurrentTierConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_medium_height")]
    pub medium_height: f32,
    #[serde(default = "default_high_height")]
    pub high_height: f32,
}

impl Default for CurrentTierConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            medium_height: default_medium_height(),
            high_height: default_high_height(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HomingConfig {
    /// Travel per polling iteration, in millimeters.
    #[serde(default = "default_homing_step")]
    pub step: f32,
    #[serde(default = "default_homing_max_travel")]
    pub max_travel: f32,
    #[serde(default = "default_homing_feedrate")]
    pub feedrate: f32,
    /// Y-axis acceleration (g) above which the head is considered in contact.
    #[serde(default = "default_tilt_threshold")]
    pub tilt_threshold: f32,
}

impl Default for HomingConfig {
    fn default() -> Self {
        Self {
            step: default_homing_step(),
            max_travel: default_homing_max_travel(),
            feedrate: default_homing_feedrate(),
            tilt_threshold: default_tilt_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_bed_size")]
    pub bed_width: f32,
    #[serde(default = "default_bed_size")]
    pub bed_depth: f32,
    /// Distance of the corner probe points from the bed edges.
    #[serde(default = "default_probe_inset")]
    pub probe_inset: f32,
    #[serde(default = "default_probe_step")]
    pub probe_step: f32,
    #[serde(default = "default_max_descent")]
    pub max_descent: f32,
    /// Lift after each contact before travelling to the next point.
    #[serde(default = "default_clearance")]
    pub clearance: f32,
    #[serde(default = "default_probe_feedrate")]
    pub feedrate: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            bed_width: default_bed_size(),
            bed_depth: default_bed_size(),
            probe_inset: default_probe_inset(),
            probe_step: default_probe_step(),
            max_descent: default_max_descent(),
            clearance: default_clearance(),
            feedrate: default_probe_feedrate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeaterConfig {
    #[serde(default = "default_min_temp")]
    pub min_temp: f32,
    #[serde(default = "default_max_temp")]
    pub max_temp: f32,
    /// Band around the target that counts as reached.
    #[serde(default = "default_temp_tolerance")]
    pub tolerance: f32,
    #[serde(default = "default_heater_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for HeaterConfig {
    fn default() -> Self {
        Self {
            min_temp: default_min_temp(),
            max_temp: default_max_temp(),
            tolerance: default_temp_tolerance(),
            timeout_ms: default_heater_timeout_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backing file for the non-volatile image. In-memory when absent.
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_storage_size")]
    pub size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            size: default_storage_size(),
        }
    }
}

/// Simulated machine used by the `printer-firmware` binary.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimulatorConfig {
    /// Sleep for the duration of every executed segment.
    #[serde(default)]
    pub realtime: bool,
    #[serde(default = "default_sim_start")]
    pub start_position: [f32; 3],
    /// Bed surface height at front-left, front-right, back-left and back-right.
    #[serde(default)]
    pub bed_corners: [f32; 4],
    /// Degrees per poll the simulated heater moves toward its target.
    #[serde(default = "default_heat_rate")]
    pub heat_rate: f32,
    #[serde(default = "default_ambient")]
    pub ambient: f32,
    #[serde(default = "default_sensor_noise")]
    pub sensor_noise: f32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            realtime: false,
            start_position: default_sim_start(),
            bed_corners: [0.0; 4],
            heat_rate: default_heat_rate(),
            ambient: default_ambient(),
            sensor_noise: default_sensor_noise(),
        }
    }
}

impl Config {
    /// Reject values the motion and protocol code cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol.queue_capacity == 0 {
            return Err(ConfigError::Invalid("protocol.queue_capacity must be > 0".to_string()));
        }
        if self.protocol.line_buffer < 8 {
            return Err(ConfigError::Invalid("protocol.line_buffer must be at least 8 bytes".to_string()));
        }
        for (axis, [min, max]) in ["x", "y", "z"].iter().zip(self.motion.envelope) {
            if min >= max {
                return Err(ConfigError::Invalid(format!("motion.envelope for axis '{}' must have min < max", axis)));
            }
        }
        if self.motion.steps_per_mm.iter().any(|s| *s <= 0.0) {
            return Err(ConfigError::Invalid("motion.steps_per_mm must be > 0".to_string()));
        }
        if self.motion.segment_length <= 0.0 || self.motion.default_feedrate <= 0.0 {
            return Err(ConfigError::Invalid("motion.segment_length and default_feedrate must be > 0".to_string()));
        }
        if self.motion.backlash.x < 0.0 || self.motion.backlash.y < 0.0 {
            return Err(ConfigError::Invalid("motion.backlash amounts must be >= 0".to_string()));
        }
        if self.motion.current.medium_height > self.motion.current.high_height {
            return Err(ConfigError::Invalid("motion.current.medium_height must not exceed high_height".to_string()));
        }
        if self.homing.step <= 0.0 || self.homing.max_travel <= 0.0 {
            return Err(ConfigError::Invalid("homing.step and homing.max_travel must be > 0".to_string()));
        }
        if self.calibration.probe_step <= 0.0 || self.calibration.max_descent <= 0.0 {
            return Err(ConfigError::Invalid("calibration.probe_step and max_descent must be > 0".to_string()));
        }
        if 2.0 * self.calibration.probe_inset >= self.calibration.bed_width.min(self.calibration.bed_depth) {
            return Err(ConfigError::Invalid("calibration.probe_inset leaves no room between probe points".to_string()));
        }
        if self.heater.min_temp >= self.heater.max_temp {
            return Err(ConfigError::Invalid("heater.min_temp must be below heater.max_temp".to_string()));
        }
        if self.storage.size < crate::hardware::storage::layout::IMAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "storage.size must be at least {} bytes",
                crate::hardware::storage::layout::IMAGE_SIZE
            )));
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_firmware_name() -> String { "micro-firmware".to_string() }
fn default_firmware_version() -> String { env!("CARGO_PKG_VERSION").to_string() }
fn default_machine_type() -> String { "Micro 3D".to_string() }
fn default_serial_number() -> String { "0000000000000000".to_string() }
fn default_queue_capacity() -> usize { 10 }
fn default_line_buffer() -> usize { 96 }
fn default_host_escape() -> char { '@' }
fn default_wait_interval_ms() -> u64 { 1000 }
fn default_envelope() -> [[f32; 2]; 3] { [[-2.0, 109.0], [-2.0, 97.0], [0.0, 112.0]] }
fn default_steps_per_mm() -> [f32; 4] { [19.3067, 18.0, 646.0, 128.451] }
fn default_segment_length() -> f32 { 2.0 }
fn default_feedrate() -> f32 { 1500.0 }
fn default_backlash_x() -> f32 { 0.33 }
fn default_backlash_y() -> f32 { 0.69 }
fn default_backlash_feedrate() -> f32 { 1500.0 }
fn default_medium_height() -> f32 { 40.0 }
fn default_high_height() -> f32 { 80.0 }
fn default_homing_step() -> f32 { 0.5 }
fn default_homing_max_travel() -> f32 { 140.0 }
fn default_homing_feedrate() -> f32 { 3000.0 }
fn default_tilt_threshold() -> f32 { 0.35 }
fn default_bed_size() -> f32 { 100.0 }
fn default_probe_inset() -> f32 { 9.0 }
fn default_probe_step() -> f32 { 0.05 }
fn default_max_descent() -> f32 { 15.0 }
fn default_clearance() -> f32 { 3.0 }
fn default_probe_feedrate() -> f32 { 900.0 }
fn default_min_temp() -> f32 { 150.0 }
fn default_max_temp() -> f32 { 285.0 }
fn default_temp_tolerance() -> f32 { 2.0 }
fn default_heater_timeout_ms() -> u64 { 600_000 }
fn default_poll_ms() -> u64 { 100 }
fn default_storage_size() -> usize { 128 }
fn default_sim_start() -> [f32; 3] { [50.0, 50.0, 8.0] }
fn default_heat_rate() -> f32 { 5.0 }
fn default_ambient() -> f32 { 25.0 }
fn default_sensor_noise() -> f32 { 0.02 }

/// Load configuration from a TOML file at the given path.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|e| {
        tracing::error!("Failed to read config file '{}': {}", path.display(), e);
        ConfigError::Io(e)
    })?;
    let config: Config = toml::from_str(&contents).map_err(|e| {
        tracing::error!("Failed to parse config TOML: {}", e);
        ConfigError::Toml(e)
    })?;
    config.validate()?;
    Ok(config)
}
