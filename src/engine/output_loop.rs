//! Heater output loop.
//!
//! The single writer for the heater pins: every second it mirrors each
//! heater's burn flag to its GPIO using the configured polarity, and
//! forces everything low on exit.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{lock, rlock, BrewEngine};
use crate::heaters::MAX_HEATERS;

pub struct OutputRunner {
    engine: Arc<BrewEngine>,
}

impl OutputRunner {
    pub fn new(engine: Arc<BrewEngine>) -> Self {
        Self { engine }
    }

    /// Mirror burn flags to the pins.
    pub fn tick(&self) {
        let engine = &self.engine;
        let invert = rlock(&engine.config).invert_outputs;
        let bank = rlock(&engine.heaters);
        let mut outputs = lock(&engine.outputs);
        for (i, heater) in bank.iter().enumerate().take(MAX_HEATERS) {
            if heater.pin == 0 {
                continue;
            }
            let on = heater.enabled && engine.state.burn[i].load(Ordering::Relaxed);
            outputs.set_level(heater.pin, on ^ invert);
        }
    }

    /// Force every heater pin to its inactive level.
    pub fn all_off(&self) {
        let engine = &self.engine;
        let invert = rlock(&engine.config).invert_outputs;
        let bank = rlock(&engine.heaters);
        let mut outputs = lock(&engine.outputs);
        for heater in bank.iter() {
            if heater.pin != 0 {
                outputs.set_level(heater.pin, invert);
            }
        }
    }

    /// Thread body for the duration of a brew.
    pub fn run(self) {
        let engine = self.engine.clone();
        while engine.state.run.load(Ordering::Relaxed)
            && engine.state.control_run.load(Ordering::Relaxed)
        {
            std::thread::sleep(Duration::from_secs(1));
            self.tick();
        }
        self.all_off();
        log::info!("output loop exiting");
    }
}
