//! The brewing engine.
//!
//! [`BrewEngine`] owns every collection (sensors, heaters, schedules,
//! sessions) and the shared runtime state the loops communicate
//! through. Four cooperating tasks run against it: the read loop for
//! the lifetime of the engine, and the pid/output/control loops for the
//! lifetime of a brew. The command dispatcher is the only other writer.
//!
//! ```text
//!  probes ──▶ read loop ──▶ temperature ──▶ pid loop ──▶ burn flags ──▶ output loop ──▶ GPIO
//!                               ▲                ▲
//!  schedule ──▶ compiler ──▶ control loop ── targetTemperature
//! ```

pub mod control_loop;
pub mod gpio;
pub mod output_loop;
pub mod pid_loop;
pub mod read_loop;
pub mod state;
pub mod stir;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{info, warn};

use crate::clock::Clock;
use crate::compiler::{compile, CompileParams, CompiledPlan};
use crate::config::SystemConfig;
use crate::error::Error;
use crate::heaters::{self, Heater};
use crate::pid::PidSettings;
use crate::probes::{SharedAnalog, SharedOneWire, SharedRtdBus};
use crate::registry::SensorRegistry;
use crate::schedule::{self, MashSchedule};
use crate::session::SessionRecorder;
use crate::settings::SettingsStore;
use crate::transport::cloud::CloudUploader;
use crate::transport::mqtt::MqttSink;

pub use state::{BoostPhase, EngineState};

// ── Poison-tolerant lock helpers ──────────────────────────────────────
//
// A poisoned lock means another task panicked; the engine keeps driving
// outputs rather than cascading the failure.

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn rlock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wlock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

/// Spawn a named task with an explicit stack size. On ESP-IDF,
/// `std::thread` maps onto FreeRTOS tasks via pthreads.
pub fn spawn_task(
    name: &'static str,
    stack_kb: usize,
    f: impl FnOnce() + Send + 'static,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.into())
        .stack_size(stack_kb * 1024)
        .spawn(f)
        .expect("task spawn failed")
}

/// Bus handles handed to the engine at construction.
#[derive(Default, Clone)]
pub struct BusHandles {
    pub onewire: Option<SharedOneWire>,
    pub rtd: Option<SharedRtdBus>,
    pub adc: Option<SharedAnalog>,
}

/// Narrow callbacks into the Wi-Fi collaborator. The collaborator never
/// references the engine back.
#[derive(Default)]
pub struct WifiCallbacks {
    pub get: Option<Box<dyn Fn() -> serde_json::Value + Send + Sync>>,
    pub save: Option<Box<dyn Fn(&serde_json::Value) + Send + Sync>>,
    pub scan: Option<Box<dyn Fn() -> serde_json::Value + Send + Sync>>,
}

/// Stir interval window, minutes within a repeating cycle span.
#[derive(Debug, Clone, Copy, Default)]
pub struct StirWindow {
    pub span_minutes: u16,
    pub interval_start: u16,
    pub interval_stop: u16,
    pub cycle_start: i64,
}

pub struct BrewEngine {
    pub state: EngineState,
    pub clock: Arc<dyn Clock>,
    pub settings: Mutex<SettingsStore>,
    pub config: RwLock<SystemConfig>,
    pub pid_settings: RwLock<PidSettings>,
    pub registry: RwLock<SensorRegistry>,
    pub heaters: RwLock<Vec<Heater>>,
    pub schedules: RwLock<BTreeMap<String, MashSchedule>>,
    pub plan: Mutex<Option<CompiledPlan>>,
    pub recorder: Mutex<SessionRecorder>,
    /// Downsampled in-run history served to the UI (epoch → whole degrees).
    pub temp_log: Mutex<BTreeMap<i64, i32>>,
    pub selected_schedule: Mutex<Option<String>>,
    pub outputs: gpio::SharedOutputs,
    pub mqtt: Mutex<Option<MqttSink>>,
    pub cloud: Mutex<Option<CloudUploader>>,
    pub wifi: WifiCallbacks,
    pub stir: Mutex<StirWindow>,
    pub hostname: String,
    /// Spawn real tasks on start/stir/buzzer. Tests drive ticks directly.
    spawn_tasks: bool,
}

impl BrewEngine {
    /// Build the engine from persisted state. Reads settings, binds
    /// probes, configures output pins and connects MQTT when enabled.
    pub fn new(
        store: SettingsStore,
        clock: Arc<dyn Clock>,
        buses: BusHandles,
        outputs: gpio::SharedOutputs,
        hostname: &str,
        spawn_tasks: bool,
    ) -> Self {
        let config = SystemConfig::load(&store);
        let pid_settings = PidSettings::load(&store);

        let mut registry = SensorRegistry::new(config.temp_scale, buses.onewire, buses.rtd, buses.adc);
        registry.load(&store);

        let heaters = heaters::load_heaters(&store);
        let schedules = schedule::load_schedules(&store, config.temp_scale);

        let recorder = SessionRecorder::new();
        recorder.init(&store);

        let mqtt = MqttSink::connect(&config.mqtt_uri, hostname);

        let engine = Self {
            state: EngineState::new(),
            clock,
            settings: Mutex::new(store),
            config: RwLock::new(config),
            pid_settings: RwLock::new(pid_settings),
            registry: RwLock::new(registry),
            heaters: RwLock::new(heaters),
            schedules: RwLock::new(schedules),
            plan: Mutex::new(None),
            recorder: Mutex::new(recorder),
            temp_log: Mutex::new(BTreeMap::new()),
            selected_schedule: Mutex::new(None),
            outputs,
            mqtt: Mutex::new(mqtt),
            cloud: Mutex::new(None),
            wifi: WifiCallbacks::default(),
            stir: Mutex::new(StirWindow::default()),
            hostname: hostname.to_string(),
            spawn_tasks,
        };
        engine.configure_output_pins();
        engine.state.run.store(true, Ordering::Relaxed);
        engine
    }

    /// Drive every configured output pin to its inactive level.
    fn configure_output_pins(&self) {
        let config = rlock(&self.config);
        let invert = config.invert_outputs;
        let mut outputs = lock(&self.outputs);
        for heater in rlock(&self.heaters).iter() {
            if heater.pin != 0 {
                outputs.configure_output(heater.pin, invert);
            }
        }
        if config.stir_pin != 0 {
            outputs.configure_output(config.stir_pin, invert);
        }
        if config.buzzer_pin != 0 {
            outputs.configure_output(config.buzzer_pin, invert);
        }
    }

    /// Physical level for a logical on/off under the configured polarity.
    pub fn level_for(&self, active: bool) -> bool {
        active ^ rlock(&self.config).invert_outputs
    }

    // ── Run lifecycle ────────────────────────────────────────────────

    /// Start a brew. A run already in progress makes this a no-op.
    /// With a schedule name the plan is compiled from the current
    /// temperature; without one the engine runs on manual targets only.
    pub fn start(self: &Arc<Self>, schedule_name: Option<&str>) -> Result<(), Error> {
        if self.state.control_run.load(Ordering::Relaxed) {
            info!("start ignored: already running");
            return Ok(());
        }
        let now = self.clock.now();
        let (step_interval, boost_percent) = {
            let config = rlock(&self.config);
            (config.step_interval_secs, config.boost_until_percent)
        };

        let selected = schedule_name
            .filter(|n| !n.is_empty())
            .map(str::to_string);

        let mut boil = false;
        let plan = match &selected {
            Some(name) => {
                let schedules = rlock(&self.schedules);
                let schedule = schedules
                    .get(name)
                    .ok_or_else(|| Error::Protocol(format!("schedule '{name}' not found")))?;
                boil = schedule.boil;
                Some(compile(
                    schedule,
                    &CompileParams {
                        start: now,
                        current_temperature: self.state.temperature.load(),
                        step_interval_secs: u32::from(step_interval),
                        boost_until_percent: boost_percent,
                    },
                ))
            }
            None => None,
        };

        heaters::arm_for_run(&mut wlock(&self.heaters), boil);
        for flag in &self.state.burn {
            flag.store(false, Ordering::Relaxed);
        }

        self.state.boil_run.store(boil, Ordering::Relaxed);
        self.state.clear_overrides();
        self.state.set_boost(BoostPhase::Off);
        self.state.in_overtime.store(false, Ordering::Relaxed);
        self.state.current_step.store(0, Ordering::Relaxed);
        self.state.reset_pid.store(false, Ordering::Relaxed);
        lock(&self.temp_log).clear();

        let has_plan = plan.is_some();
        if let Some(plan) = plan {
            if let Some(first) = plan.steps.first() {
                self.state.target_temperature.store(first.temperature);
            }
            self.state.running_version.fetch_add(1, Ordering::Relaxed);
            *lock(&self.plan) = Some(plan);
        } else {
            *lock(&self.plan) = None;
        }
        *lock(&self.selected_schedule) = selected.clone();

        {
            let mut store = lock(&self.settings);
            lock(&self.recorder).start(&mut store, selected.as_deref().unwrap_or("Manual"), now);
        }

        self.state.control_run.store(true, Ordering::Relaxed);
        info!(
            "run started ({})",
            selected.as_deref().unwrap_or("manual control")
        );

        if self.spawn_tasks {
            let engine = self.clone();
            spawn_task("pidloop", 8, move || pid_loop::PidRunner::new(engine).run());
            let engine = self.clone();
            spawn_task("outputloop", 4, move || {
                output_loop::OutputRunner::new(engine).run()
            });
            if has_plan {
                let engine = self.clone();
                spawn_task("controlloop", 4, move || {
                    control_loop::ControlRunner::new(engine).run()
                });
            }
        }
        Ok(())
    }

    /// Stop the brew and close the session. A no-op when idle.
    pub fn stop(&self) {
        if !self.state.control_run.swap(false, Ordering::Relaxed) {
            return;
        }
        let now = self.clock.now();
        for flag in &self.state.burn {
            flag.store(false, Ordering::Relaxed);
        }
        {
            let mut store = lock(&self.settings);
            lock(&self.recorder).stop(&mut store, now, true);
        }
        info!("run stopped");
    }

    // ── Stirring ─────────────────────────────────────────────────────

    pub fn start_stir(
        self: &Arc<Self>,
        span_minutes: u16,
        interval_start: u16,
        interval_stop: u16,
    ) -> Result<(), Error> {
        let stir_pin = rlock(&self.config).stir_pin;
        if stir_pin == 0 {
            warn!("stir pin not configured, ignoring start");
            return Err(Error::Init("stir pin not configured"));
        }
        {
            let mut window = lock(&self.stir);
            window.span_minutes = span_minutes;
            window.interval_start = interval_start;
            window.interval_stop = interval_stop;
            window.cycle_start = self.clock.now();
        }
        if self.state.stir_run.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        if self.spawn_tasks {
            let engine = self.clone();
            spawn_task("stirloop", 4, move || stir::StirRunner::new(engine).run());
        }
        Ok(())
    }

    pub fn stop_stir(&self) {
        let stir_pin = rlock(&self.config).stir_pin;
        if stir_pin == 0 {
            warn!("stir pin not configured, ignoring stop");
            return;
        }
        self.state.stir_run.store(false, Ordering::Relaxed);
        let level = self.level_for(false);
        lock(&self.outputs).set_level(stir_pin, level);
    }

    // ── Buzzer ───────────────────────────────────────────────────────

    /// Schedule a buzzer pulse of the configured length.
    pub fn pulse_buzzer(self: &Arc<Self>) {
        let (pin, secs) = {
            let config = rlock(&self.config);
            (config.buzzer_pin, config.buzzer_seconds)
        };
        if secs == 0 {
            return;
        }
        self.state
            .buzzer_until
            .store(self.clock.now() + i64::from(secs), Ordering::Relaxed);
        if pin == 0 || !self.spawn_tasks {
            return;
        }
        let engine = self.clone();
        spawn_task("buzzer", 2, move || {
            let on = engine.level_for(true);
            lock(&engine.outputs).set_level(pin, on);
            std::thread::sleep(std::time::Duration::from_secs(u64::from(secs)));
            let off = engine.level_for(false);
            lock(&engine.outputs).set_level(pin, off);
        });
    }

    // ── Sensor management ────────────────────────────────────────────

    /// Walk the one-wire bus under the pause latch and persist the
    /// resulting sensor list.
    pub fn detect_sensors(&self) -> Result<usize, Error> {
        self.state.pause_reads.store(true, Ordering::Relaxed);
        let result = wlock(&self.registry).detect_onewire();
        self.state.pause_reads.store(false, Ordering::Relaxed);

        let mut store = lock(&self.settings);
        rlock(&self.registry).save(&mut store);
        result
    }

    /// Apply partial sensor updates and drop sensors missing from
    /// `keep`, all under the pause latch, then persist the list.
    pub fn mutate_sensors(
        &self,
        updates: &[crate::registry::SensorUpdate],
        keep: &[u64],
    ) -> Result<(), Error> {
        self.state.pause_reads.store(true, Ordering::Relaxed);
        let result = (|| {
            let mut registry = wlock(&self.registry);
            for update in updates {
                registry.apply_update(update)?;
            }
            registry.retain(keep);
            Ok(())
        })();
        self.state.pause_reads.store(false, Ordering::Relaxed);

        let mut store = lock(&self.settings);
        rlock(&self.registry).save(&mut store);
        result
    }

    pub fn add_rtd_sensor(&self, cs_pin: i32, nominal_ohms: f32, ref_ohms: f32) -> Result<u64, Error> {
        self.state.pause_reads.store(true, Ordering::Relaxed);
        let result = wlock(&self.registry).add_rtd(cs_pin, nominal_ohms, ref_ohms);
        self.state.pause_reads.store(false, Ordering::Relaxed);

        let mut store = lock(&self.settings);
        rlock(&self.registry).save(&mut store);
        result
    }

    pub fn add_ntc_sensor(
        &self,
        analog_pin: i32,
        beta: f32,
        r0_ohms: f32,
        divider_ohms: f32,
    ) -> Result<u64, Error> {
        self.state.pause_reads.store(true, Ordering::Relaxed);
        let result = wlock(&self.registry).add_ntc(analog_pin, beta, r0_ohms, divider_ohms);
        self.state.pause_reads.store(false, Ordering::Relaxed);

        let mut store = lock(&self.settings);
        rlock(&self.registry).save(&mut store);
        result
    }

    /// Recompile the plan when the currently-running schedule was
    /// edited. Restarts the runner from the current temperature.
    pub fn recompile_running(&self, name: &str) {
        if !self.state.control_run.load(Ordering::Relaxed) {
            return;
        }
        if lock(&self.selected_schedule).as_deref() != Some(name) {
            return;
        }
        let (step_interval, boost_percent) = {
            let config = rlock(&self.config);
            (config.step_interval_secs, config.boost_until_percent)
        };
        let plan = {
            let schedules = rlock(&self.schedules);
            let Some(schedule) = schedules.get(name) else {
                return;
            };
            compile(
                schedule,
                &CompileParams {
                    start: self.clock.now(),
                    current_temperature: self.state.temperature.load(),
                    step_interval_secs: u32::from(step_interval),
                    boost_until_percent: boost_percent,
                },
            )
        };
        self.state.current_step.store(0, Ordering::Relaxed);
        self.state.in_overtime.store(false, Ordering::Relaxed);
        self.state.reset_pid.store(true, Ordering::Relaxed);
        self.state.running_version.fetch_add(1, Ordering::Relaxed);
        *lock(&self.plan) = Some(plan);
        info!("running schedule '{name}' recompiled");
    }

    // ── Overrides ────────────────────────────────────────────────────

    pub fn set_target_override(&self, target: Option<f32>) {
        self.state.set_override_target(target);
        if let Some(t) = target {
            self.state.target_temperature.store(t);
        }
        self.state.reset_pid.store(true, Ordering::Relaxed);
    }

    pub fn set_output_override(&self, duty: Option<u8>) {
        self.state.set_override_output(duty);
        // Take effect immediately rather than at the next cycle.
        self.state.reset_pid.store(true, Ordering::Relaxed);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Engine-wide shutdown: every task exits at its next sleep boundary.
    pub fn shutdown(&self) {
        self.stop();
        self.state.run.store(false, Ordering::Relaxed);
    }

    pub fn factory_reset(&self) -> Result<(), Error> {
        lock(&self.settings).factory_reset()?;
        Ok(())
    }

    /// Spawn the lifetime tasks (read loop). Brew tasks are spawned by
    /// [`start`](Self::start).
    pub fn spawn_core_tasks(self: &Arc<Self>) {
        if !self.spawn_tasks {
            return;
        }
        let engine = self.clone();
        spawn_task("readloop", 4, move || read_loop::ReadRunner::new(engine).run());
    }
}
