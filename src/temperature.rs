//! Binds one fan to its temperature sources.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{Error, Result};
use crate::fan::Fan;
use crate::filter::TemperatureFilter;
use crate::model_config::TemperatureAlgorithm;
use crate::sensors::SensorRegistry;

/// One fan plus the sensors feeding it and the smoothing filter.
pub struct FanTemperatureControl {
    pub fan: Fan,
    filter: TemperatureFilter,
    algorithm: TemperatureAlgorithm,
    sensors: Vec<String>,
    temperature: f32,
}

impl FanTemperatureControl {
    pub fn new(fan: Fan, poll_interval: Duration) -> Self {
        Self {
            fan,
            filter: TemperatureFilter::new(poll_interval),
            algorithm: TemperatureAlgorithm::Average,
            sensors: Vec::new(),
            temperature: 0.0,
        }
    }

    pub fn set_sources(&mut self, sensors: Vec<String>, algorithm: TemperatureAlgorithm) {
        self.sensors = sensors;
        self.algorithm = algorithm;
        self.filter.reset();
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn algorithm(&self) -> TemperatureAlgorithm {
        self.algorithm
    }

    pub fn sensor_names(&self) -> &[String] {
        &self.sensors
    }

    /// Sample every bound sensor, aggregate the successful readings and
    /// push the result through the filter. Fails only when no sensor
    /// could be read at all; partial failures aggregate over the rest.
    pub fn update_temperature(&mut self, registry: &SensorRegistry, at: Instant) -> Result<()> {
        let mut readings = Vec::with_capacity(self.sensors.len());
        let mut last_error = None;
        for name in &self.sensors {
            match registry.read(name) {
                Ok(celsius) => readings.push(celsius),
                Err(e) => {
                    warn!(sensor = name.as_str(), error = %e.chain(), "sensor read failed");
                    last_error = Some(e);
                }
            }
        }
        if readings.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| Error::Sensor("no temperature sources bound".to_string())));
        }
        let aggregate = match self.algorithm {
            TemperatureAlgorithm::Average => {
                readings.iter().sum::<f32>() / readings.len() as f32
            }
            TemperatureAlgorithm::Min => readings.iter().copied().fold(f32::INFINITY, f32::min),
            TemperatureAlgorithm::Max => {
                readings.iter().copied().fold(f32::NEG_INFINITY, f32::max)
            }
        };
        self.temperature = self.filter.push(at, aggregate);
        Ok(())
    }
}
