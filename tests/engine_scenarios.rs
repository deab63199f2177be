//! End-to-end engine scenarios.
//!
//! Drives the full stack — dispatcher, engine, loops — against the
//! simulation backends with a manual clock, covering the brew-day
//! paths: ramp compilation, overtime stretching, duty distribution,
//! sensor recovery, session export and boost cycling.

#![cfg(not(target_os = "espidf"))]

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use brewengine::clock::ManualClock;
use brewengine::command;
use brewengine::engine::control_loop::ControlRunner;
use brewengine::engine::gpio::{SharedOutputs, SimOutputs};
use brewengine::engine::pid_loop::PidRunner;
use brewengine::engine::read_loop::ReadRunner;
use brewengine::engine::{BoostPhase, BrewEngine, BusHandles};
use brewengine::heaters::Heater;
use brewengine::probes::sim::{SimAdc, SimOneWire, SimRtdBus};
use brewengine::probes::{rtd_identity, SharedAnalog, SharedOneWire, SharedRtdBus};
use brewengine::settings::SettingsStore;

const ROM: u64 = 0x28FF_0000_0000_0042;
const T0: i64 = 1_700_000_000;

struct Rig {
    engine: Arc<BrewEngine>,
    clock: Arc<ManualClock>,
    onewire: Arc<Mutex<SimOneWire>>,
    rtd: Arc<Mutex<SimRtdBus>>,
    outputs: Arc<Mutex<SimOutputs>>,
}

fn rig() -> Rig {
    let clock = Arc::new(ManualClock::new(T0));
    let onewire = SimOneWire::shared();
    let rtd = SimRtdBus::shared();
    let adc = SimAdc::shared();
    let outputs = Arc::new(Mutex::new(SimOutputs::new()));
    let engine = Arc::new(BrewEngine::new(
        SettingsStore::open_in_memory(),
        clock.clone(),
        BusHandles {
            onewire: Some(onewire.clone() as SharedOneWire),
            rtd: Some(rtd.clone() as SharedRtdBus),
            adc: Some(adc as SharedAnalog),
        },
        outputs.clone() as SharedOutputs,
        "brewtest",
        false,
    ));
    Rig {
        engine,
        clock,
        onewire,
        rtd,
        outputs,
    }
}

fn call(engine: &Arc<BrewEngine>, cmd: &str, data: Value) -> Value {
    let payload = json!({ "command": cmd, "data": data }).to_string();
    let response: Value = serde_json::from_str(&command::process(engine, &payload)).unwrap();
    assert_eq!(response["success"], true, "{cmd} failed: {response}");
    response
}

fn set_kettle_temp(r: &Rig, celsius: f32) {
    r.onewire.lock().unwrap().set_device(ROM, Ok(celsius));
}

/// Default mash compiled from 20 C: ramp sub-steps a minute apart, the
/// ramp end flagged to extend, the hold point after ramp + 45 min, and
/// the stock notifications at 5 and 85 minutes.
#[test]
fn default_mash_ramp_layout() {
    let r = rig();
    set_kettle_temp(&r, 20.0);
    r.engine.detect_sensors().unwrap();
    ReadRunner::new(r.engine.clone()).tick();

    call(&r.engine, "Start", json!({ "selectedMashSchedule": "Default" }));
    let schedule = call(&r.engine, "GetRunningSchedule", json!({}));
    let steps = schedule["data"]["steps"].as_array().unwrap();

    assert_eq!(steps[0]["time"].as_i64().unwrap(), T0);
    assert_eq!(steps[0]["temperature"].as_f64().unwrap(), 20.0);
    assert_eq!(steps[1]["time"].as_i64().unwrap(), T0 + 60);

    let ramp_end = steps
        .iter()
        .find(|s| s["extendIfNeeded"] == true)
        .expect("extend step");
    assert!((ramp_end["temperature"].as_f64().unwrap() - 64.0).abs() < 0.11);

    let hold = T0 + (15 + 45) * 60;
    assert!(steps.iter().any(|s| s["time"].as_i64() == Some(hold)));

    let notifications = schedule["data"]["notifications"].as_array().unwrap();
    assert_eq!(notifications[0]["name"], "Add Grains");
    assert_eq!(notifications[0]["timePoint"].as_i64().unwrap(), T0 + 5 * 60);
    assert_eq!(notifications[1]["timePoint"].as_i64().unwrap(), T0 + 85 * 60);
}

/// Overtime: the ramp end is due but the kettle sits at 62 of 64 C.
/// The runner stretches the step, then slides the whole plan once the
/// temperature closes to within the margin.
#[test]
fn overtime_stretch_slides_later_steps() {
    let r = rig();
    set_kettle_temp(&r, 20.0);
    r.engine.detect_sensors().unwrap();
    let mut read = ReadRunner::new(r.engine.clone());
    read.tick();

    call(&r.engine, "Start", json!({ "selectedMashSchedule": "Default" }));
    let mut control = ControlRunner::new(r.engine.clone());

    // Jump to the final ramp sub-step with the kettle short of target.
    // Every earlier sub-step is already due, so the runner walks
    // through them one tick at a time before hitting the extend flag.
    set_kettle_temp(&r, 62.0);
    r.clock.set(T0 + 14 * 60);
    read.tick();
    for _ in 0..20 {
        control.tick();
    }
    assert!(r.engine.state.in_overtime.load(Ordering::Relaxed));

    let hold_before = {
        let plan = r.engine.plan.lock().unwrap();
        plan.as_ref().unwrap().steps.last().unwrap().time
    };

    // Five minutes later the mash finally reaches 63 C (within margin).
    r.clock.advance(5 * 60);
    set_kettle_temp(&r, 63.0);
    read.tick();
    control.tick();
    assert!(!r.engine.state.in_overtime.load(Ordering::Relaxed));

    let plan = r.engine.plan.lock().unwrap();
    let hold_after = plan.as_ref().unwrap().steps.last().unwrap().time;
    assert_eq!(hold_after, hold_before + 5 * 60);
}

/// Duty distribution: 2000 W + 1000 W at 65 % duty puts 1950 W on the
/// first heater (58 s of a 60 s cycle) and nothing on the second, and
/// the output loop mirrors exactly that to the pins.
#[test]
fn duty_distribution_reaches_the_pins() {
    let r = rig();
    {
        let mut bank = r.engine.heaters.write().unwrap();
        *bank = vec![
            Heater {
                id: 1,
                name: "Big".into(),
                pin: 25,
                preference: 1,
                watt: 2000,
                use_for_mash: true,
                use_for_boil: true,
                enabled: false,
                burn_percent: 0,
            },
            Heater {
                id: 2,
                name: "Small".into(),
                pin: 26,
                preference: 2,
                watt: 1000,
                use_for_mash: true,
                use_for_boil: true,
                enabled: false,
                burn_percent: 0,
            },
        ];
    }
    call(&r.engine, "Start", json!({}));
    call(&r.engine, "SetOverrideOutput", json!({ "output": 65 }));

    let mut pid = PidRunner::new(r.engine.clone());
    let burn = pid.begin_cycle();
    assert_eq!(burn, vec![58, 0]);

    let output = brewengine::engine::output_loop::OutputRunner::new(r.engine.clone());
    let mut big_on = 0;
    for second in 0..60 {
        pid.cycle_tick(second, &burn);
        output.tick();
        let outputs = r.outputs.lock().unwrap();
        if outputs.level(25) {
            big_on += 1;
        }
        assert!(!outputs.level(26), "small heater must stay off");
    }
    assert_eq!(big_on, 58);
}

/// A PT100 that has dropped off the bus reads as disconnected for five
/// ticks, is reinitialised, and comes back clean on the next good read.
#[test]
fn rtd_disconnect_recovery_through_the_read_loop() {
    let r = rig();
    call(&r.engine, "AddRtdSensor", json!({ "csPin": 5 }));
    r.rtd.lock().unwrap().set_celsius(5, 64.0, 100.0, 430.0);

    let mut read = ReadRunner::new(r.engine.clone());
    read.tick();
    assert_eq!(r.engine.state.temperature.load(), 64.0);

    for _ in 0..5 {
        r.rtd
            .lock()
            .unwrap()
            .set_fault(5, brewengine::probes::max31865::FAULT_RTD_IN_LOW);
        read.tick();
    }
    {
        let registry = r.engine.registry.read().unwrap();
        let sensor = registry.get(rtd_identity(5)).unwrap();
        assert!(!sensor.connected);
        assert_eq!(sensor.consecutive_failures, 0, "reinit resets the counter");
    }

    // Probe plugged back in.
    r.rtd.lock().unwrap().set_celsius(5, 65.0, 100.0, 430.0);
    read.tick();
    let registry = r.engine.registry.read().unwrap();
    let sensor = registry.get(rtd_identity(5)).unwrap();
    assert!(sensor.connected);
    assert_eq!(sensor.consecutive_failures, 0);
}

/// Session export after three samples: stats and both export formats
/// match the recorded series.
#[test]
fn session_export_matches_recorded_series() {
    let r = rig();
    call(&r.engine, "Start", json!({ "selectedMashSchedule": "Default" }));
    {
        let mut recorder = r.engine.recorder.lock().unwrap();
        recorder.add_sample(1000, 60.0, 64.0, 50);
        recorder.add_sample(1060, 62.0, 64.0, 60);
        recorder.add_sample(1120, 64.0, 64.0, 40);
    }
    call(&r.engine, "Stop", json!({}));

    let stats = call(&r.engine, "GetStatistics", json!({}));
    let session = &stats["data"]["sessions"][0];
    let id = session["sessionId"].as_u64().unwrap();
    assert_eq!(session["minTemperature"], 60);
    assert_eq!(session["maxTemperature"], 64);
    assert_eq!(session["avgTemperature"], 62.0);
    assert_eq!(session["completed"], true);

    let exported = call(
        &r.engine,
        "ExportSession",
        json!({ "sessionId": id, "format": "json" }),
    );
    let parsed: Value =
        serde_json::from_str(exported["data"]["content"].as_str().unwrap()).unwrap();
    let points = parsed["data"].as_array().unwrap();
    assert_eq!(points.len(), 3);
    assert_eq!(points[0]["avgTemp"], 60);
    assert_eq!(points[1]["pidOutput"], 60);
    assert_eq!(points[2]["targetTemp"], 64);

    let exported = call(
        &r.engine,
        "ExportSession",
        json!({ "sessionId": id, "format": "csv" }),
    );
    let csv = exported["data"]["content"].as_str().unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines[0], "sessionId,scheduleName,timestamp,avgTemp,targetTemp,pidOutput");
    assert_eq!(lines.len(), 4);
    assert!(lines[1].ends_with("1000,60,64,50"));
}

/// Boost cycle: boosting to 90 % of a 64 C target forces full duty
/// until 57.6 C, rests at zero until the temperature peaks, then hands
/// control back to the PID.
#[test]
fn boost_cycle_through_dispatcher_and_loops() {
    let r = rig();
    set_kettle_temp(&r, 50.0);
    r.engine.detect_sensors().unwrap();
    call(&r.engine, "SavePIDSettings", json!({ "boostModeUntil": 90 }));

    let mut read = ReadRunner::new(r.engine.clone());
    read.tick();
    call(&r.engine, "Start", json!({ "selectedMashSchedule": "Default" }));

    let mut control = ControlRunner::new(r.engine.clone());
    let mut pid = PidRunner::new(r.engine.clone());

    control.tick(); // past the anchor step
    control.tick(); // boosted ramp step engages boost
    assert_eq!(r.engine.state.boost(), BoostPhase::Boost);
    pid.begin_cycle();
    assert_eq!(r.engine.state.pid_output.load(), 100.0);

    set_kettle_temp(&r, 57.6);
    read.tick();
    control.tick();
    assert_eq!(r.engine.state.boost(), BoostPhase::Rest);
    pid.begin_cycle();
    assert_eq!(r.engine.state.pid_output.load(), 0.0);

    // Coast up, then the first decline ends the boost cycle.
    set_kettle_temp(&r, 58.4);
    read.tick();
    control.tick();
    assert_eq!(r.engine.state.boost(), BoostPhase::Rest);

    r.engine.state.reset_pid.store(false, Ordering::Relaxed);
    set_kettle_temp(&r, 58.2);
    read.tick();
    control.tick();
    assert_eq!(r.engine.state.boost(), BoostPhase::Off);
    assert!(r.engine.state.reset_pid.load(Ordering::Relaxed));

    pid.begin_cycle();
    let duty = r.engine.state.pid_output.load();
    assert!(duty < 100.0, "PID back in charge, got {duty}");
}

/// Factory reset wipes every persisted value back to its default.
#[test]
fn factory_reset_restores_every_default() {
    let r = rig();
    call(&r.engine, "SavePIDSettings", json!({ "kP": 42.0 }));
    call(&r.engine, "SaveSystemSettings", json!({ "stirPin": 27 }));
    call(&r.engine, "FactoryReset", json!({}));

    let store = r.engine.settings.lock().unwrap();
    assert_eq!(store.read_u16("kP", 100), 100);
    assert_eq!(store.read_u16("stirPin", 0), 0);
}

/// Start while running and stop while idle are both no-ops.
#[test]
fn start_stop_idempotence() {
    let r = rig();
    call(&r.engine, "Stop", json!({}));
    call(&r.engine, "Start", json!({ "selectedMashSchedule": "Default" }));
    let version = r.engine.state.running_version.load(Ordering::Relaxed);
    call(&r.engine, "Start", json!({ "selectedMashSchedule": "Rye Mash" }));
    assert_eq!(
        r.engine.state.running_version.load(Ordering::Relaxed),
        version
    );
    assert_eq!(
        r.engine.selected_schedule.lock().unwrap().as_deref(),
        Some("Default")
    );
    call(&r.engine, "Stop", json!({}));
    call(&r.engine, "Stop", json!({}));
    let store = r.engine.settings.lock().unwrap();
    let sessions = r.engine.recorder.lock().unwrap().session_list(&store);
    assert_eq!(sessions.len(), 1);
}
