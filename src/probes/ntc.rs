//! Analog NTC thermistor probe.
//!
//! The thermistor sits in a voltage divider against a fixed resistor;
//! a one-shot ADC read yields millivolts, the divider equation yields
//! resistance, and the simplified Beta (Steinhart-Hart) equation yields
//! temperature.

use super::{Probe, ProbeError, SharedAnalog};

/// 25 C in Kelvin, the Beta equation's reference point.
const T0_KELVIN: f32 = 298.15;

/// Accepted temperature band for an NTC in a brewing rig.
const TEMP_MIN_C: f32 = -40.0;
const TEMP_MAX_C: f32 = 150.0;

/// Below this the input is shorted; reading is meaningless.
const SHORT_CIRCUIT_MV: f32 = 10.0;

/// Raw 12-bit counts to millivolts when no hardware calibration is
/// available (`counts * 3300 / 4095`).
pub fn counts_to_millivolts(counts: u16) -> f32 {
    f32::from(counts) * 3300.0 / 4095.0
}

/// Thermistor resistance from the divider:
/// `R = (Vsupply - Vadc) * Rdivider / Vadc`.
pub fn divider_resistance(v_mv: f32, supply_mv: f32, divider_ohms: f32) -> f32 {
    (supply_mv - v_mv) * divider_ohms / v_mv
}

/// Beta equation: `1/T = 1/T0 + ln(R/R0)/beta`, answer in Celsius.
pub fn resistance_to_celsius(resistance: f32, r0_ohms: f32, beta: f32) -> f32 {
    let inv_t = 1.0 / T0_KELVIN + (resistance / r0_ohms).ln() / beta;
    1.0 / inv_t - 273.15
}

pub struct NtcProbe {
    analog_pin: i32,
    /// Beta coefficient, kelvin.
    beta: f32,
    /// Element resistance at 25 C.
    r0_ohms: f32,
    /// Fixed divider resistor.
    divider_ohms: f32,
    adc: SharedAnalog,
    configured: bool,
}

impl NtcProbe {
    pub fn new(
        analog_pin: i32,
        beta: f32,
        r0_ohms: f32,
        divider_ohms: f32,
        adc: SharedAnalog,
    ) -> Result<Self, ProbeError> {
        let configured = match adc.lock() {
            Ok(mut a) => a.configure(analog_pin).is_ok(),
            Err(_) => false,
        };
        Ok(Self {
            analog_pin,
            beta,
            r0_ohms,
            divider_ohms,
            adc,
            configured,
        })
    }

    pub fn analog_pin(&self) -> i32 {
        self.analog_pin
    }

    pub fn beta(&self) -> f32 {
        self.beta
    }

    pub fn r0_ohms(&self) -> f32 {
        self.r0_ohms
    }

    pub fn divider_ohms(&self) -> f32 {
        self.divider_ohms
    }
}

impl Probe for NtcProbe {
    fn measure(&mut self) -> Result<f32, ProbeError> {
        if !self.configured {
            return Err(ProbeError::Uninitialized);
        }
        let mut adc = self.adc.lock().map_err(|_| ProbeError::HardwareFault)?;
        let supply = adc.supply_millivolts();
        let v = adc.read_millivolts(self.analog_pin)?;

        if v < SHORT_CIRCUIT_MV {
            return Err(ProbeError::Disconnected);
        }
        if v >= supply * 0.95 {
            // Open circuit pulls the divider to the rail.
            return Err(ProbeError::Disconnected);
        }

        let resistance = divider_resistance(v, supply, self.divider_ohms);
        let celsius = resistance_to_celsius(resistance, self.r0_ohms, self.beta);
        if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&celsius) {
            return Err(ProbeError::OutOfRange);
        }
        Ok(celsius)
    }

    fn identity(&self) -> u64 {
        super::ntc_identity(self.analog_pin)
    }

    fn reinit(&mut self) -> Result<(), ProbeError> {
        let mut adc = self.adc.lock().map_err(|_| ProbeError::HardwareFault)?;
        adc.configure(self.analog_pin)?;
        self.configured = true;
        Ok(())
    }
}

#[cfg(test)]
mod conversion_tests {
    use super::*;

    #[test]
    fn counts_scale_linearly() {
        assert_eq!(counts_to_millivolts(0), 0.0);
        assert!((counts_to_millivolts(4095) - 3300.0).abs() < 1e-3);
        assert!((counts_to_millivolts(2048) - 1650.4).abs() < 0.5);
    }

    #[test]
    fn divider_midpoint_equals_divider_resistor() {
        // Equal voltages across both halves means equal resistances.
        let r = divider_resistance(1650.0, 3300.0, 10_000.0);
        assert!((r - 10_000.0).abs() < 1.0);
    }

    #[test]
    fn beta_at_reference_is_25c() {
        let t = resistance_to_celsius(10_000.0, 10_000.0, 3950.0);
        assert!((t - 25.0).abs() < 0.01);
    }

    #[test]
    fn beta_decreasing_resistance_means_hotter() {
        let warm = resistance_to_celsius(5_000.0, 10_000.0, 3950.0);
        let cool = resistance_to_celsius(20_000.0, 10_000.0, 3950.0);
        assert!(warm > 25.0);
        assert!(cool < 25.0);
    }
}
