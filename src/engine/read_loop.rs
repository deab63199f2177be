//! Temperature acquisition loop.
//!
//! Runs for the lifetime of the engine. Every tick reads all probes
//! through the registry, updates the shared control temperature, and —
//! while a brew is running — records a statistics sample and publishes
//! telemetry every sixth tick. Honours the pause latch during
//! configuration mutation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{lock, wlock, BrewEngine};

/// Production acquisition period.
const READ_PERIOD_MS: u64 = 500;
/// Fallback when no probe is bound (nothing to read fast for).
const IDLE_PERIOD_MS: u64 = 1000;
/// Statistics/telemetry downsampling factor.
const SAMPLE_EVERY_TICKS: u32 = 6;

pub struct ReadRunner {
    engine: Arc<BrewEngine>,
    ticks: u32,
}

impl ReadRunner {
    pub fn new(engine: Arc<BrewEngine>) -> Self {
        Self { engine, ticks: 0 }
    }

    /// One acquisition pass. Returns the period until the next one.
    pub fn tick(&mut self) -> Duration {
        let engine = &self.engine;

        if engine.state.pause_reads.load(Ordering::Relaxed) {
            return Duration::from_millis(READ_PERIOD_MS);
        }

        let (outcome, any_bound) = {
            let mut registry = wlock(&engine.registry);
            let outcome = registry.read_all();
            let any_bound = registry.sensors().any(|s| registry.is_polled(s.id));
            (outcome, any_bound)
        };

        if let Some(average) = outcome.control_average {
            engine.state.temperature.store(average);
        }
        // No contributors: keep the previous temperature so the PID is
        // not fed NaN.

        if engine.state.control_run.load(Ordering::Relaxed) {
            self.ticks = self.ticks.wrapping_add(1);
            if self.ticks % SAMPLE_EVERY_TICKS == 0 {
                self.record_sample();
            }
        }

        if any_bound {
            Duration::from_millis(READ_PERIOD_MS)
        } else {
            Duration::from_millis(IDLE_PERIOD_MS)
        }
    }

    fn record_sample(&self) {
        let engine = &self.engine;
        let now = engine.clock.now();
        let temperature = engine.state.temperature.load();
        let target = engine.state.target_temperature.load();
        let duty = engine.state.pid_output.load().clamp(0.0, 100.0) as u8;

        lock(&engine.recorder).add_sample(now, temperature, target, duty);

        // UI history, deduplicated on whole degrees.
        {
            let mut history = lock(&engine.temp_log);
            let whole = temperature as i32;
            if history.values().next_back() != Some(&whole) {
                history.insert(now, whole);
            }
        }

        if let Some(mqtt) = lock(&engine.mqtt).as_mut() {
            mqtt.publish_history(now, temperature, target, duty);
        }

        if let Some(cloud) = lock(&engine.cloud).as_mut() {
            let session_id = lock(&engine.recorder).active_session_id();
            cloud.offer(
                now,
                temperature,
                target,
                duty,
                engine.state.status_text(),
                session_id,
            );
        }
    }

    /// Thread body: tick until the engine shuts down.
    pub fn run(mut self) {
        while self.engine.state.run.load(Ordering::Relaxed) {
            let period = self.tick();
            std::thread::sleep(period);
        }
        log::info!("read loop exiting");
    }
}
