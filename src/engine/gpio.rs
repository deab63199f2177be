//! Output pin capability.
//!
//! The output loop, stir task and buzzer pulses each own their pins by
//! role; there is no locking below this interface. Polarity inversion
//! is applied by the callers so the levels written here are physical.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Write-side GPIO contract the platform must provide.
pub trait OutputPins: Send {
    /// Claim `pin` as an output and drive it to the inactive level.
    fn configure_output(&mut self, pin: i32, initial_high: bool);

    /// Drive `pin` to the given physical level.
    fn set_level(&mut self, pin: i32, high: bool);
}

pub type SharedOutputs = Arc<Mutex<dyn OutputPins>>;

// ---------------------------------------------------------------------------
// ESP-IDF implementation
// ---------------------------------------------------------------------------

#[cfg(target_os = "espidf")]
pub struct EspOutputs;

#[cfg(target_os = "espidf")]
impl OutputPins for EspOutputs {
    fn configure_output(&mut self, pin: i32, initial_high: bool) {
        use esp_idf_svc::sys::*;
        unsafe {
            gpio_reset_pin(pin);
            gpio_set_direction(pin, gpio_mode_t_GPIO_MODE_OUTPUT);
            gpio_set_level(pin, initial_high as u32);
        }
    }

    fn set_level(&mut self, pin: i32, high: bool) {
        unsafe {
            esp_idf_svc::sys::gpio_set_level(pin, high as u32);
        }
    }
}

// ---------------------------------------------------------------------------
// Host simulation (records levels for assertions)
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SimOutputs {
    levels: BTreeMap<i32, bool>,
    history: Vec<(i32, bool)>,
}

impl SimOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self, pin: i32) -> bool {
        self.levels.get(&pin).copied().unwrap_or(false)
    }

    pub fn history(&self) -> &[(i32, bool)] {
        &self.history
    }
}

impl OutputPins for SimOutputs {
    fn configure_output(&mut self, pin: i32, initial_high: bool) {
        self.levels.insert(pin, initial_high);
    }

    fn set_level(&mut self, pin: i32, high: bool) {
        self.levels.insert(pin, high);
        self.history.push((pin, high));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_records_levels() {
        let mut outputs = SimOutputs::new();
        outputs.configure_output(25, false);
        outputs.set_level(25, true);
        assert!(outputs.level(25));
        outputs.set_level(25, false);
        assert!(!outputs.level(25));
        assert_eq!(outputs.history().len(), 2);
    }
}
