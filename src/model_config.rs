//! Per-model configuration: EC register semantics and temperature
//! thresholds for one notebook model, loaded from
//! `<configs_dir>/<SelectedConfigId>.json`.
//!
//! The struct is immutable after [`ModelConfig::validate`], which also
//! fills defaulted fields (display names, threshold tables). Schema
//! violations are fatal at startup and carry the offending path, e.g.
//! `FanConfigurations[1]: TemperatureThresholds[3]: UpThreshold cannot
//! be less than DownThreshold`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Context, Error, Result};

fn default_poll_interval() -> u64 {
    3000
}

fn default_critical_temperature() -> f32 {
    75.0
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ModelConfig {
    pub notebook_model: String,
    #[serde(default)]
    pub author: Option<String>,
    /// Milliseconds between control ticks.
    #[serde(default = "default_poll_interval")]
    pub ec_poll_interval: u64,
    /// Celsius above which the fan is forced to 100%.
    #[serde(default = "default_critical_temperature")]
    pub critical_temperature: f32,
    /// When set, fan speed register I/O is little-endian 16-bit.
    #[serde(default)]
    pub read_write_words: bool,
    #[serde(default)]
    pub legacy_temperature_thresholds_behaviour: bool,
    pub fan_configurations: Vec<FanConfiguration>,
    /// Executed in declared order; see the register-write program.
    #[serde(default)]
    pub register_write_configurations: Vec<RegisterWriteConfiguration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct FanConfiguration {
    #[serde(default)]
    pub fan_display_name: Option<String>,
    pub read_register: u8,
    pub write_register: u8,
    /// Raw EC value corresponding to 0% on writes.
    pub min_speed_value: i32,
    /// Raw EC value corresponding to 100% on writes.
    pub max_speed_value: i32,
    #[serde(default)]
    pub independent_read_min_max_values: bool,
    #[serde(default)]
    pub min_speed_value_read: i32,
    #[serde(default)]
    pub max_speed_value_read: i32,
    #[serde(default)]
    pub reset_required: bool,
    #[serde(default)]
    pub fan_speed_reset_value: u16,
    /// Filled from the default table when empty.
    #[serde(default)]
    pub temperature_thresholds: Vec<TemperatureThreshold>,
    #[serde(default)]
    pub fan_speed_percentage_overrides: Vec<FanSpeedPercentageOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TemperatureThreshold {
    pub up_threshold: f32,
    pub down_threshold: f32,
    pub fan_speed: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct FanSpeedPercentageOverride {
    pub fan_speed_percentage: f32,
    pub fan_speed_value: u16,
    #[serde(default)]
    pub target_operation: OverrideTargetOperation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum OverrideTargetOperation {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl OverrideTargetOperation {
    pub fn applies_to_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn applies_to_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RegisterWriteConfiguration {
    pub register: u8,
    pub value: u8,
    #[serde(default)]
    pub write_mode: RegisterWriteMode,
    #[serde(default)]
    pub write_occasion: RegisterWriteOccasion,
    #[serde(default)]
    pub reset_required: bool,
    #[serde(default)]
    pub reset_value: u8,
    #[serde(default)]
    pub reset_write_mode: RegisterWriteMode,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum RegisterWriteMode {
    #[default]
    Set,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum RegisterWriteOccasion {
    #[default]
    OnInitialization,
    OnWriteFanSpeed,
}

/// How a fan's sensor readings collapse to one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
pub enum TemperatureAlgorithm {
    #[default]
    Average,
    Min,
    Max,
}

const DEFAULT_THRESHOLDS: [(f32, f32, f32); 6] = [
    (60.0, 0.0, 0.0),
    (63.0, 48.0, 10.0),
    (66.0, 55.0, 20.0),
    (68.0, 59.0, 50.0),
    (71.0, 63.0, 70.0),
    (75.0, 67.0, 100.0),
];

const LEGACY_DEFAULT_THRESHOLDS: [(f32, f32, f32); 6] = [
    (0.0, 0.0, 0.0),
    (60.0, 48.0, 10.0),
    (63.0, 55.0, 20.0),
    (66.0, 59.0, 50.0),
    (68.0, 63.0, 70.0),
    (71.0, 67.0, 100.0),
];

/// Table used when a fan defines no thresholds of its own.
pub fn default_thresholds(legacy: bool) -> Vec<TemperatureThreshold> {
    let table = if legacy {
        &LEGACY_DEFAULT_THRESHOLDS
    } else {
        &DEFAULT_THRESHOLDS
    };
    table
        .iter()
        .map(|&(up_threshold, down_threshold, fan_speed)| TemperatureThreshold {
            up_threshold,
            down_threshold,
            fan_speed,
        })
        .collect()
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).context(path.display().to_string())?;
        let mut config: ModelConfig =
            serde_json::from_str(&raw).context(path.display().to_string())?;
        config.validate().context(path.display().to_string())?;
        Ok(config)
    }

    /// Check invariants and fill defaulted fields. Must run exactly once
    /// before the config is used.
    pub fn validate(&mut self) -> Result<()> {
        if self.ec_poll_interval == 0 {
            return Err(Error::Config("EcPollInterval must be positive".to_string()));
        }
        if self.fan_configurations.is_empty() {
            return Err(Error::Config(
                "FanConfigurations must not be empty".to_string(),
            ));
        }
        let critical = self.critical_temperature;
        let legacy = self.legacy_temperature_thresholds_behaviour;
        for (i, fan) in self.fan_configurations.iter_mut().enumerate() {
            fan.validate(critical, legacy)
                .context(format!("FanConfigurations[{i}]"))?;
            if fan.fan_display_name.is_none() {
                fan.fan_display_name = Some(format!("Fan #{i}"));
            }
        }
        Ok(())
    }
}

impl FanConfiguration {
    fn validate(&mut self, critical_temperature: f32, legacy: bool) -> Result<()> {
        if self.min_speed_value == self.max_speed_value {
            return Err(Error::Config(
                "MinSpeedValue and MaxSpeedValue cannot be the same".to_string(),
            ));
        }
        if self.independent_read_min_max_values
            && self.min_speed_value_read == self.max_speed_value_read
        {
            return Err(Error::Config(
                "MinSpeedValueRead and MaxSpeedValueRead cannot be the same".to_string(),
            ));
        }
        if self.temperature_thresholds.is_empty() {
            self.temperature_thresholds = default_thresholds(legacy);
        }
        self.temperature_thresholds
            .sort_by(|a, b| a.up_threshold.total_cmp(&b.up_threshold));

        let mut has_zero = false;
        let mut has_full = false;
        for (i, t) in self.temperature_thresholds.iter().enumerate() {
            if t.up_threshold < t.down_threshold {
                return Err(Error::Config(format!(
                    "TemperatureThresholds[{i}]: UpThreshold cannot be less than DownThreshold"
                )));
            }
            if !(0.0..=100.0).contains(&t.fan_speed) {
                return Err(Error::Config(format!(
                    "TemperatureThresholds[{i}]: FanSpeed must be between 0 and 100"
                )));
            }
            if i > 0 && t.up_threshold == self.temperature_thresholds[i - 1].up_threshold {
                return Err(Error::Config(format!(
                    "TemperatureThresholds[{i}]: UpThreshold must be unique"
                )));
            }
            if t.up_threshold > critical_temperature {
                warn!(
                    up_threshold = t.up_threshold,
                    critical_temperature, "threshold lies above the critical temperature"
                );
            }
            has_zero |= t.fan_speed == 0.0;
            has_full |= t.fan_speed == 100.0;
        }
        if !has_zero {
            warn!("threshold table has no 0% row, the fan will never stop");
        }
        if !has_full {
            warn!("threshold table has no 100% row, the fan will never reach full speed");
        }
        Ok(())
    }
}
