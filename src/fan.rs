//! Per-fan speed control: auto/manual mode, percent to raw value
//! quantization, percentage overrides, EC flush and readback.

use tracing::debug;

use crate::ec::EmbeddedController;
use crate::error::Result;
use crate::model_config::FanConfiguration;
use crate::thresholds::ThresholdManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMode {
    Auto,
    Manual,
}

pub struct Fan {
    config: FanConfiguration,
    mode: FanMode,
    requested_speed: f32,
    current_speed: f32,
    temperature: f32,
    is_critical: bool,
    critical_temperature: f32,
    read_write_words: bool,
    thresholds: ThresholdManager,
    last_written: Option<u16>,
}

impl Fan {
    pub fn new(config: FanConfiguration, critical_temperature: f32, read_write_words: bool) -> Self {
        let thresholds = ThresholdManager::new(config.temperature_thresholds.clone());
        Self {
            mode: FanMode::Auto,
            requested_speed: 0.0,
            current_speed: 0.0,
            temperature: 0.0,
            is_critical: false,
            critical_temperature,
            read_write_words,
            thresholds,
            last_written: None,
            config,
        }
    }

    pub fn name(&self) -> &str {
        self.config.fan_display_name.as_deref().unwrap_or("")
    }

    pub fn mode(&self) -> FanMode {
        self.mode
    }

    pub fn is_critical(&self) -> bool {
        self.is_critical
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn current_speed(&self) -> f32 {
        self.current_speed
    }

    pub fn requested_speed(&self) -> f32 {
        self.requested_speed
    }

    /// Number of distinct raw values the speed register can hold.
    pub fn speed_steps(&self) -> u32 {
        (self.config.max_speed_value - self.config.min_speed_value).unsigned_abs() + 1
    }

    pub fn set_auto(&mut self) {
        self.mode = FanMode::Auto;
    }

    pub fn set_fixed(&mut self, percent: f32) {
        self.mode = FanMode::Manual;
        self.requested_speed = percent.clamp(0.0, 100.0);
    }

    /// Update the fan's temperature. In auto mode this drives the
    /// requested speed through the threshold table; at or above the
    /// critical temperature the table is bypassed with 100%.
    pub fn set_temperature(&mut self, temperature: f32) {
        self.temperature = temperature;
        let table_speed = self.thresholds.update(temperature);
        if temperature >= self.critical_temperature {
            self.is_critical = true;
        } else if self.is_critical && table_speed < 100.0 {
            // The table dropped below full speed again.
            self.is_critical = false;
        }
        if self.mode == FanMode::Auto {
            self.requested_speed = if self.is_critical { 100.0 } else { table_speed };
        }
    }

    fn percent_to_raw(&self, percent: f32) -> u16 {
        let min = self.config.min_speed_value as f32;
        let max = self.config.max_speed_value as f32;
        (min + (max - min) * percent / 100.0).round() as u16
    }

    fn raw_to_percent(&self, raw: u16, min: i32, max: i32) -> f32 {
        let percent = (f32::from(raw) - min as f32) / (max as f32 - min as f32) * 100.0;
        percent.clamp(0.0, 100.0)
    }

    /// Overrides are matched by exact float equality; configured
    /// percentages are taken verbatim, never computed.
    fn write_override(&self, percent: f32) -> Option<u16> {
        self.config
            .fan_speed_percentage_overrides
            .iter()
            .find(|o| o.target_operation.applies_to_write() && o.fan_speed_percentage == percent)
            .map(|o| o.fan_speed_value)
    }

    fn read_override(&self, raw: u16) -> Option<f32> {
        self.config
            .fan_speed_percentage_overrides
            .iter()
            .find(|o| o.target_operation.applies_to_read() && o.fan_speed_value == raw)
            .map(|o| o.fan_speed_percentage)
    }

    /// Raw value to be written for the current requested speed.
    fn write_value(&self) -> u16 {
        self.write_override(self.requested_speed)
            .unwrap_or_else(|| self.percent_to_raw(self.requested_speed))
    }

    /// The requested speed quantized to what the EC can represent.
    pub fn target_speed(&self) -> f32 {
        let raw = self.write_value();
        self.read_override(raw).unwrap_or_else(|| {
            self.raw_to_percent(raw, self.config.min_speed_value, self.config.max_speed_value)
        })
    }

    /// Write the speed register if the raw value changed since the last
    /// write, as byte or little-endian word per the model config.
    pub fn ec_flush(&mut self, ec: &mut dyn EmbeddedController) -> Result<()> {
        let raw = self.write_value();
        if self.last_written == Some(raw) {
            return Ok(());
        }
        if self.read_write_words {
            ec.write_word(self.config.write_register, raw)?;
        } else {
            ec.write_byte(self.config.write_register, raw as u8)?;
        }
        debug!(fan = self.name(), raw, "fan speed written");
        self.last_written = Some(raw);
        Ok(())
    }

    /// Read back the raw register and translate it to a percentage,
    /// using the read-side min/max when configured independently.
    pub fn update_current_speed(&mut self, ec: &mut dyn EmbeddedController) -> Result<()> {
        let raw = if self.read_write_words {
            ec.read_word(self.config.read_register)?
        } else {
            u16::from(ec.read_byte(self.config.read_register)?)
        };
        let (min, max) = if self.config.independent_read_min_max_values {
            (
                self.config.min_speed_value_read,
                self.config.max_speed_value_read,
            )
        } else {
            (self.config.min_speed_value, self.config.max_speed_value)
        };
        self.current_speed = self
            .read_override(raw)
            .unwrap_or_else(|| self.raw_to_percent(raw, min, max));
        Ok(())
    }

    /// Write the configured shutdown value, if any.
    pub fn ec_reset(&mut self, ec: &mut dyn EmbeddedController) -> Result<()> {
        if !self.config.reset_required {
            return Ok(());
        }
        if self.read_write_words {
            ec.write_word(self.config.write_register, self.config.fan_speed_reset_value)
        } else {
            ec.write_byte(
                self.config.write_register,
                self.config.fan_speed_reset_value as u8,
            )
        }
    }
}
