//! Service state and the periodic control loop.
//!
//! One [`Service`] value owns everything mutable at runtime: the model
//! config, the service config, the fan array, the sensor registry and
//! the EC backend. It is shared behind a single `Arc<Mutex>` between
//! the control loop and the IPC handlers; while the lock is held no EC
//! I/O can be in progress from another thread.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::ec::EmbeddedController;
use crate::error::{Error, Result};
use crate::fan::{Fan, FanMode};
use crate::model_config::{ModelConfig, RegisterWriteMode, RegisterWriteOccasion};
use crate::sensors::SensorRegistry;
use crate::service_config::ServiceConfig;
use crate::temperature::FanTemperatureControl;

/// Give up after this many consecutive failed ticks.
const MAX_TICK_FAILURES: u32 = 100;
/// Divergence between measured and target speed that triggers a replay
/// of the full register-write program.
const RE_INIT_DIVERGENCE: f32 = 15.0;

pub struct Service {
    pub model_config: ModelConfig,
    pub service_config: ServiceConfig,
    pub fans: Vec<FanTemperatureControl>,
    pub sensors: SensorRegistry,
    pub ec: Box<dyn EmbeddedController>,
    pub read_only: bool,
    service_config_path: PathBuf,
}

impl Service {
    /// Assemble a service from already-loaded parts. The EC must be
    /// open; the register-write program runs here unless read-only.
    pub fn new(
        model_config: ModelConfig,
        service_config: ServiceConfig,
        ec: Box<dyn EmbeddedController>,
        sensors: SensorRegistry,
        read_only: bool,
        service_config_path: PathBuf,
    ) -> Result<Self> {
        let poll_interval = Duration::from_millis(model_config.ec_poll_interval);
        let mut fans = Vec::with_capacity(model_config.fan_configurations.len());
        for (i, fan_config) in model_config.fan_configurations.iter().enumerate() {
            let mut fan = Fan::new(
                fan_config.clone(),
                model_config.critical_temperature,
                model_config.read_write_words,
            );
            match service_config.target_fan_speeds.get(i) {
                Some(&speed) if speed >= 0.0 => fan.set_fixed(speed),
                _ => fan.set_auto(),
            }
            fans.push(FanTemperatureControl::new(fan, poll_interval));
        }

        let mut service = Self {
            model_config,
            service_config,
            fans,
            sensors,
            ec,
            read_only,
            service_config_path,
        };
        service.bind_temperature_sources()?;
        if !service.read_only {
            service.apply_register_writes(true)?;
        }
        Ok(service)
    }

    /// Wire each fan to its sensors: configured sources where present,
    /// the registry's default set otherwise.
    fn bind_temperature_sources(&mut self) -> Result<()> {
        let defaults = self.sensors.default_names();
        for ftc in &mut self.fans {
            ftc.set_sources(defaults.clone(), Default::default());
        }
        for (i, source) in self.service_config.fan_temperature_sources.iter().enumerate() {
            let Some(ftc) = self.fans.get_mut(source.fan_index) else {
                return Err(Error::Config(format!(
                    "FanTemperatureSources[{i}]: FanIndex: no such fan"
                )));
            };
            let sensors = if source.sensors.is_empty() {
                defaults.clone()
            } else {
                source.sensors.clone()
            };
            ftc.set_sources(sensors, source.temperature_algorithm_type.unwrap_or_default());
        }
        for ftc in &self.fans {
            info!(
                fan = ftc.fan.name(),
                algorithm = ?ftc.algorithm(),
                sensors = ?ftc.sensor_names(),
                "temperature sources bound"
            );
        }
        Ok(())
    }

    /// One control iteration: readback, divergence check, register-write
    /// program, temperature update, flush.
    pub fn tick(&mut self) -> Result<()> {
        let now = Instant::now();

        let mut re_init = false;
        for ftc in &mut self.fans {
            ftc.fan.update_current_speed(self.ec.as_mut())?;
            // Some ECs lose their register-write program after
            // suspend/resume or firmware events; a large divergence
            // between measured and target speed is the tell.
            if (ftc.fan.current_speed() - ftc.fan.target_speed()).abs() > RE_INIT_DIVERGENCE {
                debug!(fan = ftc.fan.name(), "speed divergence, full re-initialization");
                re_init = true;
            }
        }

        if !self.read_only {
            self.apply_register_writes(re_init)?;
        }

        for ftc in &mut self.fans {
            ftc.update_temperature(&self.sensors, now)?;
            let temperature = ftc.temperature();
            ftc.fan.set_temperature(temperature);
            if !self.read_only {
                ftc.fan.ec_flush(self.ec.as_mut())?;
            }
        }
        Ok(())
    }

    /// Execute the register-write program. `initializing` replays every
    /// entry instead of only the OnWriteFanSpeed ones.
    pub fn apply_register_writes(&mut self, initializing: bool) -> Result<()> {
        for cfg in &self.model_config.register_write_configurations {
            if initializing || cfg.write_occasion == RegisterWriteOccasion::OnWriteFanSpeed {
                apply_register_write(self.ec.as_mut(), cfg.register, cfg.value, cfg.write_mode)?;
            }
        }
        Ok(())
    }

    /// Reset the EC for shutdown. The whole pass runs three times and
    /// keeps only the last error; ECs are flaky during teardown.
    pub fn reset_ec(&mut self) -> Result<()> {
        let mut result = Ok(());
        for _ in 0..3 {
            for cfg in &self.model_config.register_write_configurations {
                if cfg.reset_required {
                    if let Err(e) = apply_register_write(
                        self.ec.as_mut(),
                        cfg.register,
                        cfg.reset_value,
                        cfg.reset_write_mode,
                    ) {
                        warn!(error = %e.chain(), "register reset failed");
                        result = Err(e);
                    }
                }
            }
            for ftc in &mut self.fans {
                if let Err(e) = ftc.fan.ec_reset(self.ec.as_mut()) {
                    warn!(fan = ftc.fan.name(), error = %e.chain(), "fan reset failed");
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Persist the per-fan targets to the service config file: `-1` for
    /// auto fans, the requested speed otherwise.
    pub fn write_target_speeds_to_config(&mut self) -> Result<()> {
        self.service_config.target_fan_speeds = self
            .fans
            .iter()
            .map(|ftc| match ftc.fan.mode() {
                FanMode::Auto => -1.0,
                FanMode::Manual => ftc.fan.requested_speed(),
            })
            .collect();
        self.service_config.save(&self.service_config_path)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.model_config.ec_poll_interval)
    }

    /// Reset the EC (unless read-only) and close the backend.
    pub fn shutdown(&mut self) {
        if !self.read_only {
            if let Err(e) = self.reset_ec() {
                error!(error = %e.chain(), "EC reset on shutdown failed");
            }
        }
        self.ec.close();
    }
}

fn apply_register_write(
    ec: &mut dyn EmbeddedController,
    register: u8,
    value: u8,
    mode: RegisterWriteMode,
) -> Result<()> {
    let value = match mode {
        RegisterWriteMode::Set => value,
        RegisterWriteMode::And => value & ec.read_byte(register)?,
        RegisterWriteMode::Or => value | ec.read_byte(register)?,
    };
    ec.write_byte(register, value)
}

/// Tick until `quit` is set. Failed ticks retry after 10ms; after 100
/// consecutive failures the loop gives up and returns the last error.
pub fn run(service: &Arc<Mutex<Service>>, quit: &AtomicBool) -> Result<()> {
    let poll_interval = service.lock().unwrap().poll_interval();
    let mut failures: u32 = 0;
    while !quit.load(Ordering::SeqCst) {
        let result = service.lock().unwrap().tick();
        match result {
            Ok(()) => {
                failures = 0;
                sleep_interruptible(quit, poll_interval);
            }
            Err(e) => {
                failures += 1;
                warn!(failures, error = %e.chain(), "control tick failed");
                if failures >= MAX_TICK_FAILURES {
                    error!("giving up after {failures} consecutive tick failures");
                    return Err(e);
                }
                sleep_interruptible(quit, Duration::from_millis(10));
            }
        }
    }
    Ok(())
}

/// Sleep in short slices so a signal-triggered quit is observed promptly.
fn sleep_interruptible(quit: &AtomicBool, duration: Duration) {
    let mut remaining = duration;
    while !quit.load(Ordering::SeqCst) && remaining > Duration::ZERO {
        let slice = remaining.min(Duration::from_millis(100));
        thread::sleep(slice);
        remaining -= slice;
    }
}
