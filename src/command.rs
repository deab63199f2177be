//! Command dispatcher.
//!
//! The request/response protocol spoken by the web UI and external
//! tools. Requests are `{command, data}`; responses are
//! `{success, data, message?}`. The command set is closed: anything
//! else answers `success=false` with "Unknown command". Ill-typed
//! fields reject the request without touching engine state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::engine::{lock, rlock, wlock, BrewEngine};
use crate::error::Error;
use crate::heaters::{self, Heater};
use crate::registry::{ProbeBinding, Sensor, SensorUpdate};
use crate::schedule::{self, MashSchedule};

/// Outcome of a handled command.
struct Outcome {
    data: Value,
    message: Option<String>,
}

impl Outcome {
    fn data(data: Value) -> Self {
        Self {
            data,
            message: None,
        }
    }

    fn empty() -> Self {
        Self::data(Value::Object(Default::default()))
    }

    fn message(message: impl Into<String>) -> Self {
        Self {
            data: Value::Object(Default::default()),
            message: Some(message.into()),
        }
    }
}

/// Parse and execute one command payload, producing the response JSON.
pub fn process(engine: &Arc<BrewEngine>, payload: &str) -> String {
    debug!("command payload: {payload}");

    let parsed: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => return envelope(Err(Error::Protocol(format!("invalid JSON: {e}")))),
    };
    let Some(command) = parsed["command"].as_str() else {
        return envelope(Err(Error::Protocol("missing command field".into())));
    };
    let data = &parsed["data"];

    info!("command: {command}");
    envelope(dispatch(engine, command, data))
}

fn envelope(result: Result<Outcome, Error>) -> String {
    let response = match result {
        Ok(outcome) => {
            let mut response = json!({
                "success": true,
                "data": outcome.data,
            });
            if let Some(message) = outcome.message {
                response["message"] = Value::String(message);
            }
            response
        }
        Err(e) => json!({
            "success": false,
            "data": {},
            "message": e.to_string_short(),
        }),
    };
    response.to_string()
}

impl Error {
    /// The human-readable message for the response envelope.
    fn to_string_short(&self) -> String {
        match self {
            Error::Protocol(msg) => msg.clone(),
            other => other.to_string(),
        }
    }
}

fn dispatch(engine: &Arc<BrewEngine>, command: &str, data: &Value) -> Result<Outcome, Error> {
    match command {
        "Data" => data_snapshot(engine, data),
        "GetRunningSchedule" => running_schedule(engine),
        "SetTemp" => set_temp(engine, data),
        "SetOverrideOutput" => set_override_output(engine, data),
        "Start" => start(engine, data),
        "Stop" => {
            engine.stop();
            Ok(Outcome::empty())
        }
        "StartStir" => start_stir(engine, data),
        "StopStir" => {
            engine.stop_stir();
            Ok(Outcome::empty())
        }

        "GetMashSchedules" => get_schedules(engine),
        "SaveMashSchedules" => save_schedules(engine, data),
        "SetMashSchedule" => set_schedule(engine, data),
        "DeleteMashSchedule" => delete_schedule(engine, data),

        "GetPIDSettings" => get_pid_settings(engine),
        "SavePIDSettings" => save_pid_settings(engine, data),

        "GetTempSettings" => get_temp_settings(engine),
        "SaveTempSettings" => save_temp_settings(engine, data),
        "DetectTempSensors" => {
            let bound = engine.detect_sensors()?;
            Ok(Outcome::data(json!({ "found": bound })))
        }
        "AddRtdSensor" => add_rtd_sensor(engine, data),
        "AddNtcSensor" => add_ntc_sensor(engine, data),

        "GetHeaterSettings" => get_heater_settings(engine),
        "SaveHeaterSettings" => save_heater_settings(engine, data),

        "GetSystemSettings" => get_system_settings(engine),
        "SaveSystemSettings" => save_system_settings(engine, data),

        "GetStatistics" => get_statistics(engine),
        "GetSessionData" => get_session_data(engine, data),
        "ExportSession" => export_session(engine, data),
        "SetStatisticsConfig" => set_statistics_config(engine, data),

        "GetWifiSettings" => Ok(Outcome::data(
            engine.wifi.get.as_ref().map(|f| f()).unwrap_or(Value::Null),
        )),
        "SaveWifiSettings" => {
            if let Some(save) = engine.wifi.save.as_ref() {
                save(data);
            }
            Ok(Outcome::message(
                "Please restart device for changes to have effect!",
            ))
        }
        "ScanWifi" => Ok(Outcome::data(
            engine.wifi.scan.as_ref().map(|f| f()).unwrap_or(Value::Null),
        )),

        "Reboot" => {
            schedule_reboot();
            Ok(Outcome::message("Rebooting"))
        }
        "FactoryReset" => {
            engine.factory_reset()?;
            schedule_reboot();
            Ok(Outcome::message("Factory reset, rebooting"))
        }
        "BootIntoRecovery" => boot_into_recovery(),

        _ => Err(Error::Protocol("Unknown command".into())),
    }
}

// ---------------------------------------------------------------------------
// Live data
// ---------------------------------------------------------------------------

/// One decimal, truncated the way the UI has always shown it.
fn round1(v: f32) -> f64 {
    f64::from((v * 10.0) as i32) / 10.0
}

fn data_snapshot(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let state = &engine.state;

    let stir_status = if rlock(&engine.config).stir_pin == 0 {
        "Disabled"
    } else {
        state.stir_status_text()
    };

    let temps: Vec<Value> = {
        let registry = rlock(&engine.registry);
        registry
            .current_temperatures()
            .iter()
            .map(|(id, temp)| json!({ "sensor": id.to_string(), "temp": round1(*temp) }))
            .collect()
    };

    let (temp_log, last_log_time) = {
        let history = lock(&engine.temp_log);
        let last = history
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(|| engine.clock.now());
        let since = data["lastDate"].as_i64();
        let entries: Vec<Value> = history
            .iter()
            .filter(|(time, _)| since.map_or(true, |s| **time > s))
            .map(|(time, temp)| json!({ "time": time, "temp": temp }))
            .collect();
        (entries, last)
    };

    let mut snapshot = json!({
        "temp": round1(state.temperature.load()),
        "temps": temps,
        "targetTemp": round1(state.target_temperature.load()),
        "output": state.pid_output.load() as u8,
        "manualOverrideOutput": Value::Null,
        "status": state.status_text(),
        "stirStatus": stir_status,
        "lastLogDateTime": last_log_time,
        "tempLog": temp_log,
        "runningVersion": state.running_version.load(Ordering::Relaxed),
        "inOverTime": state.in_overtime.load(Ordering::Relaxed),
        "boostStatus": state.boost().as_str(),
        "systemInfo": system_info(engine),
    });
    if let Some(duty) = state.override_output() {
        snapshot["manualOverrideOutput"] = json!(duty);
    }
    Ok(Outcome::data(snapshot))
}

fn system_info(engine: &Arc<BrewEngine>) -> Value {
    #[cfg(target_os = "espidf")]
    let free_heap = unsafe { esp_idf_svc::sys::esp_get_free_heap_size() };
    #[cfg(not(target_os = "espidf"))]
    let free_heap = 0u32;

    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "hostname": engine.hostname,
        "freeHeap": free_heap,
    })
}

fn running_schedule(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let plan_guard = lock(&engine.plan);
    let steps: Vec<Value> = plan_guard
        .as_ref()
        .map(|plan| {
            plan.steps
                .iter()
                .map(|s| {
                    json!({
                        "time": s.time,
                        "temperature": round1(s.temperature),
                        "extendIfNeeded": s.extend_if_needed,
                        "allowBoost": s.allow_boost,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let notifications: Vec<Value> = plan_guard
        .as_ref()
        .map(|plan| {
            plan.notifications
                .iter()
                .map(|n| {
                    json!({
                        "name": n.name,
                        "message": n.message,
                        "timeFromStart": n.time_from_start,
                        "timePoint": n.time_point,
                        "buzzer": n.buzzer,
                        "done": n.done,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Outcome::data(json!({
        "version": engine.state.running_version.load(Ordering::Relaxed),
        "steps": steps,
        "notifications": notifications,
    })))
}

// ---------------------------------------------------------------------------
// Overrides and run control
// ---------------------------------------------------------------------------

fn set_temp(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    match &data["targetTemp"] {
        Value::Number(n) => {
            let target = n.as_f64().ok_or_else(bad_number)? as f32;
            engine.set_target_override(Some(target));
        }
        Value::Null => engine.set_target_override(None),
        _ => return Err(Error::Protocol("targetTemp must be a number".into())),
    }
    Ok(Outcome::empty())
}

fn set_override_output(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    match &data["output"] {
        Value::Number(n) => {
            let duty = n.as_f64().ok_or_else(bad_number)?.clamp(0.0, 100.0) as u8;
            engine.set_output_override(Some(duty));
        }
        Value::Null => engine.set_output_override(None),
        _ => return Err(Error::Protocol("output must be a number".into())),
    }
    Ok(Outcome::empty())
}

fn start(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let name = match &data["selectedMashSchedule"] {
        Value::String(s) => Some(s.as_str()),
        Value::Null => None,
        _ => {
            return Err(Error::Protocol(
                "selectedMashSchedule must be a string".into(),
            ))
        }
    };
    engine.start(name)?;
    Ok(Outcome::empty())
}

fn start_stir(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let span = data["max"]
        .as_u64()
        .ok_or_else(|| Error::Protocol("max (minutes) is required".into()))? as u16;
    let interval_start = data["intervalStart"].as_u64().unwrap_or(0) as u16;
    let interval_stop = data["intervalStop"].as_u64().unwrap_or(u64::from(span)) as u16;
    engine.start_stir(span, interval_start, interval_stop)?;
    Ok(Outcome::empty())
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

fn get_schedules(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let schedules = rlock(&engine.schedules);
    let list: Vec<&MashSchedule> = schedules.values().collect();
    Ok(Outcome::data(
        serde_json::to_value(list).map_err(|e| Error::Protocol(e.to_string()))?,
    ))
}

fn parse_schedule(value: &Value) -> Result<MashSchedule, Error> {
    let mut schedule: MashSchedule = serde_json::from_value(value.clone())
        .map_err(|e| Error::Protocol(format!("malformed schedule: {e}")))?;
    schedule.validate().map_err(|e| Error::Protocol(e.into()))?;
    schedule.sort();
    Ok(schedule)
}

fn save_schedules(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let Some(entries) = data.as_array() else {
        return Err(Error::Protocol("expected an array of schedules".into()));
    };
    let mut parsed = Vec::with_capacity(entries.len());
    for entry in entries {
        parsed.push(parse_schedule(entry)?);
    }

    let mut schedules = wlock(&engine.schedules);
    schedules.clear();
    for schedule in parsed {
        schedules.insert(schedule.name.clone(), schedule);
    }
    let mut store = lock(&engine.settings);
    schedule::save_schedules(&mut store, &schedules);
    Ok(Outcome::empty())
}

fn set_schedule(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let mut schedule = parse_schedule(data)?;
    schedule.temporary = true;
    let name = schedule.name.clone();
    wlock(&engine.schedules).insert(name.clone(), schedule);
    engine.recompile_running(&name);
    Ok(Outcome::empty())
}

fn delete_schedule(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let Some(name) = data["name"].as_str() else {
        return Err(Error::Protocol("name is required".into()));
    };
    let mut schedules = wlock(&engine.schedules);
    if schedules.remove(name).is_none() {
        return Err(Error::Protocol(format!(
            "Schedule with name: {name} not found"
        )));
    }
    let mut store = lock(&engine.settings);
    schedule::save_schedules(&mut store, &schedules);
    Ok(Outcome::empty())
}

// ---------------------------------------------------------------------------
// PID settings
// ---------------------------------------------------------------------------

fn get_pid_settings(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let pid = rlock(&engine.pid_settings);
    let config = rlock(&engine.config);
    Ok(Outcome::data(json!({
        "kP": pid.mash.kp,
        "kI": pid.mash.ki,
        "kD": pid.mash.kd,
        "boilkP": pid.boil.kp,
        "boilkI": pid.boil.ki,
        "boilkD": pid.boil.kd,
        "pidLoopTime": config.pid_loop_secs,
        "stepInterval": config.step_interval_secs,
        "boostModeUntil": config.boost_until_percent,
    })))
}

fn save_pid_settings(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let number = |key: &str, current: f64| -> Result<f64, Error> {
        match &data[key] {
            Value::Number(n) => n.as_f64().ok_or_else(bad_number),
            Value::Null => Ok(current),
            _ => Err(Error::Protocol(format!("{key} must be a number"))),
        }
    };

    {
        let mut pid = wlock(&engine.pid_settings);
        pid.mash.kp = number("kP", pid.mash.kp)?;
        pid.mash.ki = number("kI", pid.mash.ki)?;
        pid.mash.kd = number("kD", pid.mash.kd)?;
        pid.boil.kp = number("boilkP", pid.boil.kp)?;
        pid.boil.ki = number("boilkI", pid.boil.ki)?;
        pid.boil.kd = number("boilkD", pid.boil.kd)?;
        let mut store = lock(&engine.settings);
        pid.save(&mut store);
    }

    let mut config = wlock(&engine.config);
    let mut updated = config.clone();
    if let Some(v) = data["pidLoopTime"].as_u64() {
        updated.pid_loop_secs = v as u16;
    }
    if let Some(v) = data["stepInterval"].as_u64() {
        updated.step_interval_secs = v as u16;
    }
    if let Some(v) = data["boostModeUntil"].as_u64() {
        updated.boost_until_percent = v as u8;
    }
    updated.validate().map_err(|e| Error::Protocol(e.into()))?;
    let mut store = lock(&engine.settings);
    updated.save(&mut store);
    *config = updated;
    Ok(Outcome::empty())
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

fn sensor_to_json(sensor: &Sensor) -> Value {
    let mut v = json!({
        // u64 does not survive JSON number precision; ids travel as strings.
        "id": sensor.id.to_string(),
        "name": sensor.name,
        "color": sensor.color,
        "show": sensor.show,
        "useForControl": sensor.use_for_control,
        "offset": sensor.offset,
        "multiplier": sensor.multiplier,
        "connected": sensor.connected,
        "lastTemp": round1(sensor.last_temp),
    });
    match &sensor.binding {
        ProbeBinding::OneWire => {
            v["kind"] = json!("onewire");
        }
        ProbeBinding::Rtd {
            cs_pin,
            nominal_ohms,
            ref_ohms,
        } => {
            v["kind"] = json!("rtd");
            v["csPin"] = json!(cs_pin);
            v["nominalOhms"] = json!(nominal_ohms);
            v["refOhms"] = json!(ref_ohms);
        }
        ProbeBinding::Ntc {
            analog_pin,
            beta,
            r0_ohms,
            divider_ohms,
        } => {
            v["kind"] = json!("ntc");
            v["analogPin"] = json!(analog_pin);
            v["beta"] = json!(beta);
            v["r0Ohms"] = json!(r0_ohms);
            v["dividerOhms"] = json!(divider_ohms);
        }
    }
    v
}

fn get_temp_settings(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let registry = rlock(&engine.registry);
    let sensors: Vec<Value> = registry.sensors().map(sensor_to_json).collect();
    Ok(Outcome::data(Value::Array(sensors)))
}

fn save_temp_settings(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let Some(entries) = data.as_array() else {
        return Err(Error::Protocol("expected an array of sensors".into()));
    };

    let mut updates = Vec::with_capacity(entries.len());
    let mut keep = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(id) = entry["id"].as_str().and_then(|s| s.parse::<u64>().ok()) else {
            return Err(Error::Protocol("sensor id missing or malformed".into()));
        };
        keep.push(id);
        updates.push(SensorUpdate {
            id,
            name: entry["name"].as_str().map(str::to_string),
            color: entry["color"].as_str().map(str::to_string),
            show: entry["show"].as_bool(),
            use_for_control: entry["useForControl"].as_bool(),
            offset: entry["offset"].as_f64().map(|v| v as f32),
            multiplier: entry["multiplier"].as_f64().map(|v| v as f32),
            cs_pin: entry["csPin"].as_i64().map(|v| v as i32),
            analog_pin: entry["analogPin"].as_i64().map(|v| v as i32),
        });
    }
    engine.mutate_sensors(&updates, &keep)?;
    Ok(Outcome::empty())
}

fn add_rtd_sensor(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let default_cs = rlock(&engine.config).spi_cs_pin;
    let cs_pin = data["csPin"].as_i64().map(|v| v as i32).unwrap_or(default_cs);
    let nominal = data["nominalOhms"].as_f64().unwrap_or(100.0) as f32;
    let reference = data["refOhms"].as_f64().unwrap_or(430.0) as f32;
    let id = engine.add_rtd_sensor(cs_pin, nominal, reference)?;
    Ok(Outcome::data(json!({ "id": id.to_string() })))
}

fn add_ntc_sensor(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let Some(analog_pin) = data["analogPin"].as_i64().map(|v| v as i32) else {
        return Err(Error::Protocol("analogPin is required".into()));
    };
    let beta = data["beta"].as_f64().unwrap_or(3950.0) as f32;
    let r0 = data["r0Ohms"].as_f64().unwrap_or(10_000.0) as f32;
    let divider = data["dividerOhms"].as_f64().unwrap_or(10_000.0) as f32;
    let id = engine.add_ntc_sensor(analog_pin, beta, r0, divider)?;
    Ok(Outcome::data(json!({ "id": id.to_string() })))
}

// ---------------------------------------------------------------------------
// Heaters
// ---------------------------------------------------------------------------

fn get_heater_settings(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let bank = rlock(&engine.heaters);
    Ok(Outcome::data(
        serde_json::to_value(&*bank).map_err(|e| Error::Protocol(e.to_string()))?,
    ))
}

fn save_heater_settings(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    if engine.state.control_run.load(Ordering::Relaxed) {
        return Err(Error::Protocol(
            "Heater settings cannot be changed while running".into(),
        ));
    }
    let mut bank: Vec<Heater> = serde_json::from_value(data.clone())
        .map_err(|e| Error::Protocol(format!("malformed heater list: {e}")))?;
    for heater in &bank {
        heater.validate().map_err(|e| Error::Protocol(e.into()))?;
    }
    heaters::sort_heaters(&mut bank);

    {
        let mut store = lock(&engine.settings);
        heaters::save_heaters(&mut store, &bank);
    }
    *wlock(&engine.heaters) = bank;
    Ok(Outcome::empty())
}

// ---------------------------------------------------------------------------
// System settings
// ---------------------------------------------------------------------------

fn get_system_settings(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let config = rlock(&engine.config);
    Ok(Outcome::data(json!({
        "onewirePin": config.onewire_pin,
        "stirPin": config.stir_pin,
        "buzzerPin": config.buzzer_pin,
        "buzzerTime": config.buzzer_seconds,
        "invertOutputs": config.invert_outputs,
        "mqttUri": config.mqtt_uri,
        "tempScale": config.temp_scale,
        "rtdEnabled": config.rtd_enabled,
        "spiMosi": config.spi_mosi_pin,
        "spiMiso": config.spi_miso_pin,
        "spiClk": config.spi_clk_pin,
        "spiCs": config.spi_cs_pin,
        "cloudInterval": config.cloud_interval_secs,
    })))
}

fn save_system_settings(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let mut config = wlock(&engine.config);
    let mut updated = config.clone();

    let pin = |key: &str, current: i32| -> Result<i32, Error> {
        match &data[key] {
            Value::Number(n) => Ok(n.as_i64().ok_or_else(bad_number)? as i32),
            Value::Null => Ok(current),
            _ => Err(Error::Protocol(format!("{key} must be a number"))),
        }
    };

    updated.onewire_pin = pin("onewirePin", updated.onewire_pin)?;
    updated.stir_pin = pin("stirPin", updated.stir_pin)?;
    updated.buzzer_pin = pin("buzzerPin", updated.buzzer_pin)?;
    updated.spi_mosi_pin = pin("spiMosi", updated.spi_mosi_pin)?;
    updated.spi_miso_pin = pin("spiMiso", updated.spi_miso_pin)?;
    updated.spi_clk_pin = pin("spiClk", updated.spi_clk_pin)?;
    updated.spi_cs_pin = pin("spiCs", updated.spi_cs_pin)?;
    if let Some(v) = data["buzzerTime"].as_u64() {
        updated.buzzer_seconds = v as u8;
    }
    if let Some(v) = data["invertOutputs"].as_bool() {
        updated.invert_outputs = v;
    }
    if let Some(v) = data["rtdEnabled"].as_bool() {
        updated.rtd_enabled = v;
    }
    if let Some(v) = data["mqttUri"].as_str() {
        updated.mqtt_uri = v.to_string();
    }
    if let Some(v) = data["cloudInterval"].as_u64() {
        updated.cloud_interval_secs = v as u16;
    }
    if !data["tempScale"].is_null() {
        updated.temp_scale = serde_json::from_value(data["tempScale"].clone())
            .map_err(|_| Error::Protocol("tempScale must be Celsius or Fahrenheit".into()))?;
    }
    updated.validate().map_err(|e| Error::Protocol(e.into()))?;

    {
        let mut store = lock(&engine.settings);
        updated.save(&mut store);
    }
    let scale = updated.temp_scale;
    *config = updated;
    drop(config);
    wlock(&engine.registry).set_scale(scale);

    Ok(Outcome::message(
        "Please restart device for changes to have effect!",
    ))
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

fn get_statistics(engine: &Arc<BrewEngine>) -> Result<Outcome, Error> {
    let store = lock(&engine.settings);
    let recorder = lock(&engine.recorder);
    let sessions = recorder.session_list(&store);
    let list: Vec<Value> = sessions
        .iter()
        .map(|s| {
            json!({
                "sessionId": s.session_id,
                "scheduleName": s.schedule_name,
                "startTime": s.start_time,
                "endTime": s.end_time,
                "duration": s.end_time - s.start_time,
                "dataPoints": s.data_points,
                "avgTemperature": s.avg_temperature,
                "minTemperature": s.min_temperature,
                "maxTemperature": s.max_temperature,
                "completed": s.completed,
            })
        })
        .collect();
    Ok(Outcome::data(json!({
        "sessions": list,
        "maxSessions": recorder.max_sessions(&store),
    })))
}

fn session_id_of(data: &Value) -> Result<u32, Error> {
    data["sessionId"]
        .as_u64()
        .map(|v| v as u32)
        .ok_or_else(|| Error::Protocol("sessionId is required".into()))
}

fn get_session_data(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let id = session_id_of(data)?;
    let store = lock(&engine.settings);
    let recorder = lock(&engine.recorder);
    let Some(session) = recorder.session_by_id(&store, id) else {
        return Err(Error::Protocol(format!("session {id} not found")));
    };
    let samples: Vec<Value> = recorder
        .session_data(&store, id)
        .iter()
        .map(|s| {
            json!({
                "timestamp": s.timestamp,
                "avgTemp": s.avg_temp,
                "targetTemp": s.target_temp,
                "pidOutput": s.pid_output,
            })
        })
        .collect();
    Ok(Outcome::data(json!({
        "sessionId": session.session_id,
        "scheduleName": session.schedule_name,
        "completed": session.completed,
        "data": samples,
    })))
}

fn export_session(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let id = session_id_of(data)?;
    let format = data["format"].as_str().unwrap_or("json");
    let store = lock(&engine.settings);
    let recorder = lock(&engine.recorder);
    let content = match format {
        "json" => recorder.export_json(&store, id),
        "csv" => recorder.export_csv(&store, id),
        other => {
            return Err(Error::Protocol(format!(
                "unknown export format '{other}'"
            )))
        }
    };
    Ok(Outcome::data(json!({
        "format": format,
        "content": content,
    })))
}

fn set_statistics_config(engine: &Arc<BrewEngine>, data: &Value) -> Result<Outcome, Error> {
    let Some(max) = data["maxSessions"].as_u64() else {
        return Err(Error::Protocol("maxSessions is required".into()));
    };
    let mut store = lock(&engine.settings);
    lock(&engine.recorder).set_max_sessions(&mut store, max.min(255) as u8);
    Ok(Outcome::empty())
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

fn bad_number() -> Error {
    Error::Protocol("value is not a representable number".into())
}

/// Reboot after a grace period so the response still reaches the client.
fn schedule_reboot() {
    warn!("reboot scheduled");
    #[cfg(target_os = "espidf")]
    crate::engine::spawn_task("reboot", 2, || {
        std::thread::sleep(std::time::Duration::from_secs(2));
        unsafe { esp_idf_svc::sys::esp_restart() };
    });
}

fn boot_into_recovery() -> Result<Outcome, Error> {
    #[cfg(target_os = "espidf")]
    {
        use esp_idf_svc::sys::*;
        // Recovery lives in the factory app partition.
        let partition = unsafe {
            esp_partition_find_first(
                esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY,
                core::ptr::null(),
            )
        };
        if partition.is_null() {
            return Err(Error::Protocol("Error: Factory Partition not found!".into()));
        }
        if unsafe { esp_ota_set_boot_partition(partition) } != ESP_OK {
            return Err(Error::Protocol(
                "Error: Unable to change boot Partition!".into(),
            ));
        }
        schedule_reboot();
        Ok(Outcome::message("Device is booting into recovery hold on!"))
    }

    #[cfg(not(target_os = "espidf"))]
    Err(Error::Protocol(
        "Error: Factory Partition not found!".into(),
    ))
}
