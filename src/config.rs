//! Runtime configuration, read from a TOML file. Every field has a default so a missing file or a
//! partial one both work.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::madgwick::Gains;
use crate::samples::Thresholds;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub calibration: CalibrationConfig,
    pub filter: FilterConfig,
    pub sensor: SensorConfig,
}

/// Acceptance thresholds for calibration samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Minimum field separation between samples, in gauss.
    pub min_mag_distance: f32,
    /// Minimum 4D distance between sample orientation quaternions.
    pub min_quat_distance: f32,
}

impl CalibrationConfig {
    pub fn thresholds(&self) -> Thresholds {
        Thresholds::new(self.min_mag_distance, self.min_quat_distance)
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            min_mag_distance: Thresholds::DEFAULT_MIN_MAG_DISTANCE,
            min_quat_distance: Thresholds::DEFAULT_MIN_QUAT_DISTANCE,
        }
    }
}

/// Madgwick filter tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Gyroscope measurement error in deg/s.
    pub gyro_meas_error_deg: f32,
    /// Gyroscope measurement drift in deg/s/s.
    pub gyro_meas_drift_deg: f32,
}

impl FilterConfig {
    pub fn gains(&self) -> Gains {
        Gains::from_gyro_error(
            self.gyro_meas_error_deg.to_radians(),
            self.gyro_meas_drift_deg.to_radians(),
        )
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            gyro_meas_error_deg: 5.0,
            gyro_meas_drift_deg: 0.2,
        }
    }
}

/// Where the MPU-9250 is wired and how often to read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub spi_device: String,
    /// sysfs GPIO number of the chip select line.
    pub ncs_pin: u64,
    pub sample_period_ms: u32,
    /// Factor taking the driver's magnetometer output to gauss. The mpu9250 crate reports mG.
    pub mag_to_gauss: f32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            spi_device: "/dev/spidev0.0".to_string(),
            ncs_pin: 25,
            sample_period_ms: 10,
            mag_to_gauss: 0.001,
        }
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    toml::from_str(contents).context("invalid config")
}

/// Load config from `path`, or return the defaults if there is no file there.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        info!(?path, "No config found, using defaults");
        return Ok(AppConfig::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let config = parse_config(&contents).with_context(|| format!("parsing {}", path.display()))?;
    info!(?path, "Loaded config");
    Ok(config)
}
