//! System configuration.
//!
//! All tunable parameters of the brewing controller: I/O pins, the
//! temperature scale, loop timing, boost mode and transport URIs.
//! Values live in the settings store under the short keys listed in the
//! persisted layout and are seeded with these defaults on first boot.

use serde::{Deserialize, Serialize};

use crate::settings::SettingsStore;

/// Unit the engine reports temperatures in. Probes always measure in
/// Celsius; conversion happens at the registry boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemperatureScale {
    Celsius,
    Fahrenheit,
}

impl TemperatureScale {
    pub fn from_celsius(self, celsius: f32) -> f32 {
        match self {
            Self::Celsius => celsius,
            Self::Fahrenheit => celsius * 1.8 + 32.0,
        }
    }

    pub fn to_celsius(self, degrees: f32) -> f32 {
        match self {
            Self::Celsius => degrees,
            Self::Fahrenheit => (degrees - 32.0) / 1.8,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Celsius => 0,
            Self::Fahrenheit => 1,
        }
    }

    fn from_u8(v: u8) -> Self {
        if v == 1 {
            Self::Fahrenheit
        } else {
            Self::Celsius
        }
    }
}

/// Core system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    // --- I/O pins ---
    /// One-wire bus data pin.
    pub onewire_pin: i32,
    /// Stirrer output pin (0 = not fitted).
    pub stir_pin: i32,
    /// Buzzer output pin (0 = not fitted).
    pub buzzer_pin: i32,
    /// Buzzer pulse length per notification (seconds).
    pub buzzer_seconds: u8,
    /// Invert output polarity (relay boards with active-low inputs).
    pub invert_outputs: bool,

    // --- SPI bus for RTD probes ---
    pub rtd_enabled: bool,
    pub spi_mosi_pin: i32,
    pub spi_miso_pin: i32,
    pub spi_clk_pin: i32,
    /// Suggested chip-select for the next RTD probe added from the UI.
    pub spi_cs_pin: i32,

    // --- Control timing ---
    /// Seconds per PID/PWM cycle.
    pub pid_loop_secs: u16,
    /// Spacing of compiled ramp sub-steps (seconds).
    pub step_interval_secs: u16,
    /// Boost mode: force full output until this percentage of the step
    /// target is reached (0 disables boost).
    pub boost_until_percent: u8,
    /// Degrees below target still counted as "reached" by the runner.
    pub temp_margin: f32,

    // --- Reporting ---
    pub temp_scale: TemperatureScale,
    /// MQTT broker URI; publishing is enabled only for `mqtt://` URIs.
    pub mqtt_uri: String,
    /// Minimum seconds between cloud telemetry uploads.
    pub cloud_interval_secs: u16,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            onewire_pin: 4,
            stir_pin: 0,
            buzzer_pin: 0,
            buzzer_seconds: 2,
            invert_outputs: false,

            rtd_enabled: false,
            spi_mosi_pin: 23,
            spi_miso_pin: 19,
            spi_clk_pin: 18,
            spi_cs_pin: 5,

            pid_loop_secs: 60,
            step_interval_secs: 60,
            boost_until_percent: 0,
            temp_margin: 1.0,

            temp_scale: TemperatureScale::Celsius,
            mqtt_uri: String::new(),
            cloud_interval_secs: 60,
        }
    }
}

impl SystemConfig {
    /// Read every key from the store, seeding defaults for absent ones.
    pub fn load(store: &SettingsStore) -> Self {
        let d = Self::default();
        Self {
            onewire_pin: store.read_u16("onewirePin", d.onewire_pin as u16) as i32,
            stir_pin: store.read_u16("stirPin", d.stir_pin as u16) as i32,
            buzzer_pin: store.read_u16("buzzerPin", d.buzzer_pin as u16) as i32,
            buzzer_seconds: store.read_u8("buzzerTime", d.buzzer_seconds),
            invert_outputs: store.read_bool("invertOutputs", d.invert_outputs),

            rtd_enabled: store.read_bool("rtdEnabled", d.rtd_enabled),
            spi_mosi_pin: store.read_u16("spiMosi", d.spi_mosi_pin as u16) as i32,
            spi_miso_pin: store.read_u16("spiMiso", d.spi_miso_pin as u16) as i32,
            spi_clk_pin: store.read_u16("spiClk", d.spi_clk_pin as u16) as i32,
            spi_cs_pin: store.read_u16("spiCs", d.spi_cs_pin as u16) as i32,

            pid_loop_secs: store.read_u16("pidLoopTime", d.pid_loop_secs),
            step_interval_secs: store.read_u16("stepInterval", d.step_interval_secs),
            boost_until_percent: store.read_u8("boostModeUntil", d.boost_until_percent),
            temp_margin: store.read_u8("tempMargin", d.temp_margin as u8) as f32,

            temp_scale: TemperatureScale::from_u8(store.read_u8("tempScale", d.temp_scale.to_u8())),
            mqtt_uri: store.read_string("mqttUri", &d.mqtt_uri),
            cloud_interval_secs: store.read_u16("cloudInterval", d.cloud_interval_secs),
        }
    }

    /// Persist every key. Individual write failures are logged by the
    /// store and do not abort the rest.
    pub fn save(&self, store: &mut SettingsStore) {
        store.write_u16("onewirePin", self.onewire_pin as u16);
        store.write_u16("stirPin", self.stir_pin as u16);
        store.write_u16("buzzerPin", self.buzzer_pin as u16);
        store.write_u8("buzzerTime", self.buzzer_seconds);
        store.write_bool("invertOutputs", self.invert_outputs);

        store.write_bool("rtdEnabled", self.rtd_enabled);
        store.write_u16("spiMosi", self.spi_mosi_pin as u16);
        store.write_u16("spiMiso", self.spi_miso_pin as u16);
        store.write_u16("spiClk", self.spi_clk_pin as u16);
        store.write_u16("spiCs", self.spi_cs_pin as u16);

        store.write_u16("pidLoopTime", self.pid_loop_secs);
        store.write_u16("stepInterval", self.step_interval_secs);
        store.write_u8("boostModeUntil", self.boost_until_percent);
        store.write_u8("tempMargin", self.temp_margin as u8);

        store.write_u8("tempScale", self.temp_scale.to_u8());
        store.write_string("mqttUri", &self.mqtt_uri);
        store.write_u16("cloudInterval", self.cloud_interval_secs);
    }

    /// Range-check before persisting anything from the dispatcher.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.pid_loop_secs == 0 || self.pid_loop_secs > 600 {
            return Err("pidLoopTime must be 1-600 seconds");
        }
        if self.step_interval_secs < 10 || self.step_interval_secs > 600 {
            return Err("stepInterval must be 10-600 seconds");
        }
        if self.boost_until_percent > 100 {
            return Err("boostModeUntil must be 0-100");
        }
        if !(0.0..=20.0).contains(&self.temp_margin) {
            return Err("tempMargin must be 0-20 degrees");
        }
        if self.buzzer_seconds > 60 {
            return Err("buzzerTime must be 0-60 seconds");
        }
        Ok(())
    }
}
