//! End-to-end scenarios against the in-memory EC backend with mocked
//! hwmon sensor files.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use ecfand::ec::EmbeddedController;
use ecfand::error::Result;
use ecfand::fan::FanMode;
use ecfand::model_config::ModelConfig;
use ecfand::sensors::{Sensor, SensorRegistry};
use ecfand::server::dispatch;
use ecfand::service::Service;
use ecfand::service_config::ServiceConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Op {
    Read(u8),
    Write(u8, u8),
}

/// EC backend over shared memory so tests can poke registers and
/// inspect every operation the service performed.
#[derive(Clone)]
struct SharedEc {
    memory: Arc<Mutex<[u8; 256]>>,
    ops: Arc<Mutex<Vec<Op>>>,
}

impl SharedEc {
    fn new() -> Self {
        Self {
            memory: Arc::new(Mutex::new([0u8; 256])),
            ops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn set(&self, register: u8, value: u8) {
        self.memory.lock().unwrap()[usize::from(register)] = value;
    }

    fn get(&self, register: u8) -> u8 {
        self.memory.lock().unwrap()[usize::from(register)]
    }

    fn take_ops(&self) -> Vec<Op> {
        std::mem::take(&mut self.ops.lock().unwrap())
    }

    fn writes(&self) -> Vec<(u8, u8)> {
        self.ops
            .lock()
            .unwrap()
            .iter()
            .filter_map(|op| match op {
                Op::Write(r, v) => Some((*r, *v)),
                Op::Read(_) => None,
            })
            .collect()
    }
}

impl EmbeddedController for SharedEc {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {}

    fn read_byte(&mut self, register: u8) -> Result<u8> {
        self.ops.lock().unwrap().push(Op::Read(register));
        Ok(self.memory.lock().unwrap()[usize::from(register)])
    }

    fn write_byte(&mut self, register: u8, value: u8) -> Result<()> {
        self.ops.lock().unwrap().push(Op::Write(register, value));
        self.memory.lock().unwrap()[usize::from(register)] = value;
        Ok(())
    }
}

struct Fixture {
    service: Arc<Mutex<Service>>,
    ec: SharedEc,
    sensor_path: PathBuf,
    config_path: PathBuf,
    _dir: TempDir,
}

impl Fixture {
    fn set_celsius(&self, celsius: i64) {
        fs::write(&self.sensor_path, format!("{}\n", celsius * 1000)).unwrap();
    }

    fn tick(&self) {
        self.service.lock().unwrap().tick().unwrap();
    }

    /// Tick after letting the 1ms filter window drain, so each tick
    /// sees only its own sample.
    fn tick_at(&self, celsius: i64) {
        self.set_celsius(celsius);
        thread::sleep(Duration::from_millis(3));
        self.tick();
    }
}

fn model_config(fan_count: usize, register_writes: serde_json::Value) -> ModelConfig {
    let fans: Vec<_> = (0..fan_count)
        .map(|i| {
            json!({
                "ReadRegister": 2 * i,
                "WriteRegister": 2 * i + 1,
                "MinSpeedValue": 0,
                "MaxSpeedValue": 255
            })
        })
        .collect();
    let mut config: ModelConfig = serde_json::from_value(json!({
        "NotebookModel": "Test Model",
        "EcPollInterval": 1,
        "CriticalTemperature": 80,
        "FanConfigurations": fans,
        "RegisterWriteConfigurations": register_writes,
    }))
    .unwrap();
    config.validate().unwrap();
    config
}

fn fixture(config: ModelConfig, read_only: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let sensor_path = dir.path().join("temp1_input");
    fs::write(&sensor_path, "40000\n").unwrap();
    let sensors = SensorRegistry::with_sensors(vec![Sensor {
        chip: "coretemp".to_string(),
        label: None,
        path: sensor_path.clone(),
    }]);
    let config_path = dir.path().join("ecfand.json");
    let service_config = ServiceConfig {
        selected_config_id: "Test Model".to_string(),
        ..Default::default()
    };
    let ec = SharedEc::new();
    let service = Service::new(
        config,
        service_config,
        Box::new(ec.clone()),
        sensors,
        read_only,
        config_path.clone(),
    )
    .unwrap();
    Fixture {
        service: Arc::new(Mutex::new(service)),
        ec,
        sensor_path,
        config_path,
        _dir: dir,
    }
}

#[test]
fn s1_temperature_sweep_hits_table_and_critical() {
    let fx = fixture(model_config(1, json!([])), false);
    let temps = [50, 55, 60, 65, 70, 75, 80, 85];
    let expected = [0.0, 0.0, 10.0, 20.0, 50.0, 100.0, 100.0, 100.0];
    for (t, want) in temps.iter().zip(expected) {
        fx.tick_at(*t);
        let service = fx.service.lock().unwrap();
        let fan = &service.fans[0].fan;
        assert_eq!(fan.requested_speed(), want, "at {t}");
        assert_eq!(fan.is_critical(), *t >= 80, "critical at {t}");
    }
}

#[test]
fn s2_oscillation_inside_a_band_holds_the_speed() {
    let fx = fixture(model_config(1, json!([])), false);
    fx.tick_at(68);
    for t in [62, 66, 60, 64, 59] {
        fx.tick_at(t);
        let service = fx.service.lock().unwrap();
        assert_eq!(service.fans[0].fan.requested_speed(), 50.0, "at {t}");
    }
    fx.tick_at(58);
    let service = fx.service.lock().unwrap();
    assert_eq!(service.fans[0].fan.requested_speed(), 20.0);
}

#[test]
fn s3_set_fan_speed_without_fan_targets_all_fans() {
    let fx = fixture(model_config(2, json!([])), false);
    let reply = dispatch(
        &fx.service,
        &json!({ "Command": "set-fan-speed", "Speed": 42.5 }),
    )
    .unwrap();
    assert_eq!(reply, json!({ "Status": "OK" }));

    let service = fx.service.lock().unwrap();
    for ftc in &service.fans {
        assert_eq!(ftc.fan.mode(), FanMode::Manual);
        assert_eq!(ftc.fan.requested_speed(), 42.5);
        // round(255 * 0.425) = 108, quantized back to percent.
        assert_eq!(ftc.fan.target_speed(), 108.0 / 255.0 * 100.0);
    }
    drop(service);

    // The targets were persisted.
    let saved = ServiceConfig::load(&fx.config_path).unwrap();
    assert_eq!(saved.target_fan_speeds, vec![42.5, 42.5]);
    // And the raw value reached the EC.
    assert_eq!(fx.ec.get(1), 108);
    assert_eq!(fx.ec.get(3), 108);
}

#[test]
fn s4_set_fan_speed_rejects_unknown_fan_index() {
    let fx = fixture(model_config(2, json!([])), false);
    let err = dispatch(
        &fx.service,
        &json!({ "Command": "set-fan-speed", "Fan": 5, "Speed": 10 }),
    )
    .unwrap_err();
    assert_eq!(err.chain(), "Fan: No such fan available");

    let service = fx.service.lock().unwrap();
    for ftc in &service.fans {
        assert_eq!(ftc.fan.mode(), FanMode::Auto);
    }
    assert!(!fx.config_path.exists());
}

#[test]
fn s5_equal_min_max_values_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Broken.json");
    fs::write(
        &path,
        serde_json::to_string(&json!({
            "NotebookModel": "Broken",
            "FanConfigurations": [{
                "ReadRegister": 0,
                "WriteRegister": 1,
                "MinSpeedValue": 50,
                "MaxSpeedValue": 50
            }]
        }))
        .unwrap(),
    )
    .unwrap();
    let err = ModelConfig::from_file(&path).unwrap_err();
    assert!(
        err.chain()
            .ends_with("FanConfigurations[0]: MinSpeedValue and MaxSpeedValue cannot be the same"),
        "unexpected chain: {}",
        err.chain()
    );
}

#[test]
fn s6_speed_divergence_replays_the_full_program() {
    let register_writes = json!([
        { "Register": 0x10, "Value": 1, "WriteOccasion": "OnInitialization" },
        { "Register": 0x11, "Value": 2, "WriteOccasion": "OnWriteFanSpeed" }
    ]);
    let fx = fixture(model_config(1, register_writes), false);
    // Initialization ran the whole program.
    assert!(fx.ec.writes().contains(&(0x10, 1)));
    assert!(fx.ec.writes().contains(&(0x11, 2)));
    fx.ec.take_ops();

    // Measured speed matches the target: a plain tick only reapplies
    // the OnWriteFanSpeed entry.
    fx.tick_at(40);
    let writes = fx.ec.writes();
    assert!(!writes.contains(&(0x10, 1)));
    assert!(writes.contains(&(0x11, 2)));
    fx.ec.take_ops();

    // Fake a controller that forgot its programming: readback says 50%
    // while the target is 0%.
    fx.ec.set(0, 128);
    fx.tick_at(40);
    let writes = fx.ec.writes();
    assert!(writes.contains(&(0x10, 1)), "full program was not replayed");
    assert!(writes.contains(&(0x11, 2)));
}

#[test]
fn read_only_mode_never_writes_to_the_ec() {
    let register_writes = json!([
        { "Register": 0x10, "Value": 1, "WriteOccasion": "OnWriteFanSpeed" }
    ]);
    let fx = fixture(model_config(1, register_writes), true);
    for t in [40, 60, 75, 85] {
        fx.tick_at(t);
    }
    dispatch(
        &fx.service,
        &json!({ "Command": "set-fan-speed", "Speed": 100 }),
    )
    .unwrap();
    fx.service.lock().unwrap().shutdown();
    assert_eq!(fx.ec.writes(), Vec::new());
}

#[test]
fn shutdown_reset_runs_each_entry_three_times() {
    let register_writes = json!([
        { "Register": 0x10, "Value": 1, "ResetRequired": true, "ResetValue": 7 }
    ]);
    let mut config = model_config(1, register_writes);
    config.fan_configurations[0].reset_required = true;
    config.fan_configurations[0].fan_speed_reset_value = 5;
    let fx = fixture(config, false);
    fx.ec.take_ops();

    fx.service.lock().unwrap().shutdown();
    let writes = fx.ec.writes();
    let register_resets = writes.iter().filter(|w| **w == (0x10, 7)).count();
    let fan_resets = writes.iter().filter(|w| **w == (1, 5)).count();
    assert_eq!(register_resets, 3);
    assert_eq!(fan_resets, 3);
}

#[test]
fn status_reports_every_fan() {
    let fx = fixture(model_config(2, json!([])), false);
    fx.tick_at(65);
    let reply = dispatch(&fx.service, &json!({ "Command": "status" })).unwrap();
    assert_eq!(reply["SelectedConfigId"], "Test Model");
    assert_eq!(reply["ReadOnly"], false);
    assert_eq!(reply["PID"], std::process::id());
    let fans = reply["Fans"].as_array().unwrap();
    assert_eq!(fans.len(), 2);
    assert_eq!(fans[0]["Name"], "Fan #0");
    assert_eq!(fans[0]["AutoMode"], true);
    assert_eq!(fans[0]["Critical"], false);
    assert_eq!(fans[0]["SpeedSteps"], 256);
    assert_eq!(fans[0]["Temperature"], 65.0);
}

#[test]
fn protocol_errors_carry_precise_messages() {
    let fx = fixture(model_config(1, json!([])), false);
    let cases = [
        (json!([1, 2]), "Not a JSON object"),
        (json!({}), "Missing 'Command' field"),
        (json!({ "Command": 3 }), "Command: not a string"),
        (json!({ "Command": "reboot" }), "Invalid command"),
        (
            json!({ "Command": "set-fan-speed" }),
            "Missing argument: Speed",
        ),
        (
            json!({ "Command": "set-fan-speed", "Speed": "fast" }),
            "Speed: Invalid type. Either float or 'auto'",
        ),
        (
            json!({ "Command": "set-fan-speed", "Speed": 140 }),
            "Speed: Invalid value",
        ),
        (
            json!({ "Command": "set-fan-speed", "Fan": -1, "Speed": 10 }),
            "Fan: Cannot be negative",
        ),
        (
            json!({ "Command": "set-fan-speed", "Fan": "zero", "Speed": 10 }),
            "Fan: Not an integer",
        ),
        (
            json!({ "Command": "set-fan-speed", "Speed": 10, "Turbo": true }),
            "Unknown arguments",
        ),
        (json!({ "Command": "status", "Extra": 1 }), "Unknown arguments"),
    ];
    for (request, want) in cases {
        let err = dispatch(&fx.service, &request).unwrap_err();
        assert_eq!(err.chain(), want, "for {request}");
    }
}

#[test]
fn set_fan_speed_targets_a_single_fan() {
    let fx = fixture(model_config(2, json!([])), false);
    dispatch(
        &fx.service,
        &json!({ "Command": "set-fan-speed", "Fan": 1, "Speed": 50 }),
    )
    .unwrap();
    {
        let service = fx.service.lock().unwrap();
        assert_eq!(service.fans[0].fan.mode(), FanMode::Auto);
        assert_eq!(service.fans[1].fan.mode(), FanMode::Manual);
    }
    let saved = ServiceConfig::load(&fx.config_path).unwrap();
    assert_eq!(saved.target_fan_speeds, vec![-1.0, 50.0]);

    // Back to auto over the wire.
    dispatch(
        &fx.service,
        &json!({ "Command": "set-fan-speed", "Fan": 1, "Speed": "auto" }),
    )
    .unwrap();
    let saved = ServiceConfig::load(&fx.config_path).unwrap();
    assert_eq!(saved.target_fan_speeds, vec![-1.0, -1.0]);
}

#[test]
fn manual_targets_from_the_service_config_apply_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let sensor_path = dir.path().join("temp1_input");
    fs::write(&sensor_path, "40000\n").unwrap();
    let sensors = SensorRegistry::with_sensors(vec![Sensor {
        chip: "coretemp".to_string(),
        label: None,
        path: sensor_path,
    }]);
    let service_config = ServiceConfig {
        selected_config_id: "Test Model".to_string(),
        target_fan_speeds: vec![30.0, -1.0],
        ..Default::default()
    };
    let service = Service::new(
        model_config(2, json!([])),
        service_config,
        Box::new(SharedEc::new()),
        sensors,
        false,
        dir.path().join("ecfand.json"),
    )
    .unwrap();
    assert_eq!(service.fans[0].fan.mode(), FanMode::Manual);
    assert_eq!(service.fans[0].fan.requested_speed(), 30.0);
    assert_eq!(service.fans[1].fan.mode(), FanMode::Auto);
}
