//! hwmon temperature sensor discovery and reads.
//!
//! Sensors are enumerated once at startup from
//! `/sys/class/hwmon/hwmon*/temp*_input` and addressed by chip name,
//! label, or exact file path. Readings are millidegrees Celsius on
//! disk; a missing or unreadable sensor is a recoverable error that
//! surfaces per tick.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Context, Error, Result};

pub const HWMON_GLOB: &str = "/sys/class/hwmon/hwmon*/temp*_input";

/// Chips preferred for a fan with no configured temperature sources.
const DEFAULT_CHIPS: [&str; 4] = ["coretemp", "k10temp", "zenpower", "acpitz"];

#[derive(Debug, Clone)]
pub struct Sensor {
    /// Contents of the sibling `name` file.
    pub chip: String,
    /// Contents of the sibling `tempN_label` file, if present.
    pub label: Option<String>,
    /// The `tempN_input` file itself.
    pub path: PathBuf,
}

#[derive(Debug, Default)]
pub struct SensorRegistry {
    sensors: Vec<Sensor>,
}

impl SensorRegistry {
    /// Enumerate every `temp*_input` under `/sys/class/hwmon`.
    pub fn discover() -> Result<Self> {
        let pattern = glob::glob(HWMON_GLOB)
            .map_err(|e| Error::Sensor(format!("bad hwmon pattern: {e}")))?;
        let mut sensors = Vec::new();
        for path in pattern.filter_map(std::result::Result::ok) {
            let Some(parent) = path.parent() else {
                continue;
            };
            let chip = fs::read_to_string(parent.join("name"))
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            let label_path = path
                .to_string_lossy()
                .replace("_input", "_label");
            let label = fs::read_to_string(&label_path)
                .ok()
                .map(|s| s.trim().to_string());
            debug!(chip, ?label, path = %path.display(), "discovered temperature sensor");
            sensors.push(Sensor { chip, label, path });
        }
        if sensors.is_empty() {
            warn!("no hwmon temperature sensors found");
        }
        Ok(Self { sensors })
    }

    /// Registry over a fixed sensor set. Used by tests.
    pub fn with_sensors(sensors: Vec<Sensor>) -> Self {
        Self { sensors }
    }

    pub fn sensors(&self) -> &[Sensor] {
        &self.sensors
    }

    /// Match a requested name against chip name, label, or exact path.
    pub fn resolve(&self, name: &str) -> Option<&Sensor> {
        self.sensors.iter().find(|s| {
            s.chip == name || s.label.as_deref() == Some(name) || s.path == Path::new(name)
        })
    }

    /// Read one sensor in Celsius.
    pub fn read(&self, name: &str) -> Result<f32> {
        let sensor = self
            .resolve(name)
            .ok_or_else(|| Error::Sensor(format!("{name}: no such sensor")))?;
        let raw = fs::read_to_string(&sensor.path).context(sensor.path.display().to_string())?;
        let millidegrees: f32 = raw
            .trim()
            .parse()
            .map_err(|_| Error::Sensor(format!("{}: invalid reading", sensor.path.display())))?;
        Ok(millidegrees / 1000.0)
    }

    /// Sensor names used when a fan has no configured sources: every
    /// sensor of a preferred CPU chip, or all sensors if none match.
    pub fn default_names(&self) -> Vec<String> {
        let preferred: Vec<String> = self
            .sensors
            .iter()
            .filter(|s| DEFAULT_CHIPS.contains(&s.chip.as_str()))
            .map(|s| s.path.display().to_string())
            .collect();
        if !preferred.is_empty() {
            return preferred;
        }
        self.sensors
            .iter()
            .map(|s| s.path.display().to_string())
            .collect()
    }
}
