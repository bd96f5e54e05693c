//! Mutable service state, persisted as JSON.
//!
//! Unlike the model config this file is rewritten at runtime: every IPC
//! mutation that changes target speeds is persisted so the daemon comes
//! back up with the same targets.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ec::EcKind;
use crate::error::{Context, Result};
use crate::model_config::TemperatureAlgorithm;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct ServiceConfig {
    /// Model config filename stem under the configs directory.
    pub selected_config_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedded_controller_type: Option<EcKind>,
    /// One entry per fan; `-1` selects auto mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_fan_speeds: Vec<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fan_temperature_sources: Vec<FanTemperatureSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct FanTemperatureSource {
    pub fan_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_algorithm_type: Option<TemperatureAlgorithm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensors: Vec<String>,
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).context(path.display().to_string())?;
        let mut config: ServiceConfig =
            serde_json::from_str(&raw).context(path.display().to_string())?;
        config.sanitize();
        Ok(config)
    }

    /// Clamp out-of-range target speeds instead of failing; the rest of
    /// the file may still be good.
    fn sanitize(&mut self) {
        for speed in &mut self.target_fan_speeds {
            if *speed > 100.0 {
                warn!("TargetFanSpeeds: value cannot be greater than 100.0, clamping");
                *speed = 100.0;
            } else if *speed < 0.0 && *speed != -1.0 {
                warn!("TargetFanSpeeds: use -1 to select auto mode, assuming auto");
                *speed = -1.0;
            }
        }
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).context(tmp.display().to_string())?;
            file.write_all(content.as_bytes())
                .context(tmp.display().to_string())?;
            file.set_permissions(fs::Permissions::from_mode(0o664))
                .context(tmp.display().to_string())?;
        }
        fs::rename(&tmp, path).context(path.display().to_string())?;
        info!(path = %path.display(), "service config saved");
        Ok(())
    }
}
