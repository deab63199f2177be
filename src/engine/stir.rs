//! Stirrer interval task.
//!
//! Drives the stir pin inside a repeating cycle: within each
//! `span_minutes` cycle the stirrer runs from `interval_start` to
//! `interval_stop` minutes. A window covering the whole span means
//! continuous stirring.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{lock, rlock, BrewEngine};

pub struct StirRunner {
    engine: Arc<BrewEngine>,
}

impl StirRunner {
    pub fn new(engine: Arc<BrewEngine>) -> Self {
        Self { engine }
    }

    pub fn tick(&self) {
        let engine = &self.engine;
        let stir_pin = rlock(&engine.config).stir_pin;
        if stir_pin == 0 {
            return;
        }
        let now = engine.clock.now();

        let (active, rollover) = {
            let window = lock(&engine.stir);
            if window.interval_start == 0 && window.interval_stop == window.span_minutes {
                (true, None)
            } else {
                let start = window.cycle_start + i64::from(window.interval_start) * 60;
                let stop = window.cycle_start + i64::from(window.interval_stop) * 60;
                let cycle_end = window.cycle_start + i64::from(window.span_minutes) * 60;
                let active = now >= start && now <= stop;
                (active, (now >= cycle_end).then_some(cycle_end))
            }
        };

        let level = engine.level_for(active);
        lock(&engine.outputs).set_level(stir_pin, level);

        if let Some(cycle_end) = rollover {
            lock(&engine.stir).cycle_start = cycle_end;
        }
    }

    pub fn run(self) {
        let engine = self.engine.clone();
        while engine.state.run.load(Ordering::Relaxed)
            && engine.state.stir_run.load(Ordering::Relaxed)
        {
            self.tick();
            std::thread::sleep(Duration::from_secs(1));
        }
        log::info!("stir loop exiting");
    }
}
