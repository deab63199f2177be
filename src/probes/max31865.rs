//! SPI RTD probe (MAX31865 resistance-to-digital converter).
//!
//! All converters share one SPI bus with per-device chip-select. The
//! converter is configured for bias-on, automatic conversion and the
//! 50 Hz notch filter. A measurement reads the 15-bit RTD code,
//! converts it to resistance against the reference resistor, then to
//! temperature with the linearised Callendar-Van Dusen approximation.

use super::{Probe, ProbeError, SharedRtdBus};

// MAX31865 register map.
pub const REG_CONFIG: u8 = 0x00;
pub const REG_RTD_MSB: u8 = 0x01;
pub const REG_FAULT_STATUS: u8 = 0x07;

// Configuration register bits.
pub const CONFIG_BIAS: u8 = 0x80;
pub const CONFIG_MODE_AUTO: u8 = 0x40;
pub const CONFIG_FAULT_CLEAR: u8 = 0x02;
pub const CONFIG_FILTER_50HZ: u8 = 0x01;

// Fault status bits.
pub const FAULT_HIGH_THRESH: u8 = 0x80;
pub const FAULT_LOW_THRESH: u8 = 0x40;
pub const FAULT_REF_IN_LOW: u8 = 0x20;
pub const FAULT_REF_IN_HIGH: u8 = 0x10;
pub const FAULT_RTD_IN_LOW: u8 = 0x08;
pub const FAULT_OVUV: u8 = 0x04;

/// Linearised Callendar-Van Dusen alpha for standard platinum elements.
const RTD_ALPHA: f32 = 0.003_85;

/// Accepted temperature band for brewing use.
const TEMP_MIN_C: f32 = -40.0;
const TEMP_MAX_C: f32 = 200.0;

/// Convert a 15-bit RTD code to ohms.
pub fn code_to_resistance(code: u16, ref_ohms: f32) -> f32 {
    f32::from(code) * ref_ohms / 32768.0
}

/// Linearised Callendar-Van Dusen: `T = (R - R0) / (R0 * alpha)`.
pub fn resistance_to_celsius(resistance: f32, nominal_ohms: f32) -> f32 {
    (resistance - nominal_ohms) / (nominal_ohms * RTD_ALPHA)
}

/// Map a latched fault status register to a probe error.
pub fn map_fault(status: u8) -> ProbeError {
    if status & FAULT_RTD_IN_LOW != 0 {
        // Element lead open: the probe was unplugged.
        ProbeError::Disconnected
    } else {
        // Reference out of spec or over/under-voltage: wiring fault.
        ProbeError::HardwareFault
    }
}

pub struct RtdProbe {
    cs_pin: i32,
    /// Element resistance at 0 C: 100 (PT100) or 1000 (PT1000).
    nominal_ohms: f32,
    /// Reference resistor: 430 for PT100 boards, 4300 for PT1000.
    ref_ohms: f32,
    bus: SharedRtdBus,
    attached: bool,
}

impl RtdProbe {
    pub fn new(
        cs_pin: i32,
        nominal_ohms: f32,
        ref_ohms: f32,
        bus: SharedRtdBus,
    ) -> Result<Self, ProbeError> {
        let attached = match bus.lock() {
            Ok(mut b) => b.attach(cs_pin).is_ok(),
            Err(_) => false,
        };
        // An attach failure leaves the probe constructed but
        // uninitialised; the registry's failure counter drives reinit.
        Ok(Self {
            cs_pin,
            nominal_ohms,
            ref_ohms,
            bus,
            attached,
        })
    }

    pub fn cs_pin(&self) -> i32 {
        self.cs_pin
    }

    pub fn nominal_ohms(&self) -> f32 {
        self.nominal_ohms
    }

    pub fn ref_ohms(&self) -> f32 {
        self.ref_ohms
    }
}

impl Probe for RtdProbe {
    fn measure(&mut self) -> Result<f32, ProbeError> {
        if !self.attached {
            return Err(ProbeError::Uninitialized);
        }
        let mut bus = self.bus.lock().map_err(|_| ProbeError::HardwareFault)?;

        let raw = bus.read_rtd(self.cs_pin)?;
        if raw & 0x01 != 0 {
            let status = bus.read_fault(self.cs_pin).unwrap_or(0);
            let _ = bus.clear_fault(self.cs_pin);
            return Err(map_fault(status));
        }

        let code = raw >> 1;
        let resistance = code_to_resistance(code, self.ref_ohms);
        if resistance < self.nominal_ohms * 0.6 || resistance > self.nominal_ohms * 2.0 {
            return Err(ProbeError::OutOfRange);
        }

        let celsius = resistance_to_celsius(resistance, self.nominal_ohms);
        if !(TEMP_MIN_C..=TEMP_MAX_C).contains(&celsius) {
            return Err(ProbeError::OutOfRange);
        }
        Ok(celsius)
    }

    fn identity(&self) -> u64 {
        super::rtd_identity(self.cs_pin)
    }

    fn reinit(&mut self) -> Result<(), ProbeError> {
        let mut bus = self.bus.lock().map_err(|_| ProbeError::HardwareFault)?;
        if self.attached {
            bus.detach(self.cs_pin);
            self.attached = false;
        }
        bus.attach(self.cs_pin)?;
        self.attached = true;
        Ok(())
    }
}

impl Drop for RtdProbe {
    fn drop(&mut self) {
        if self.attached {
            if let Ok(mut bus) = self.bus.lock() {
                bus.detach(self.cs_pin);
            }
            self.attached = false;
        }
    }
}

#[cfg(test)]
mod conversion_tests {
    use super::*;

    #[test]
    fn code_to_resistance_full_scale() {
        // Full-scale code maps to (almost) the reference resistor.
        let r = code_to_resistance(0x7FFF, 430.0);
        assert!((r - 430.0).abs() < 0.05);
    }

    #[test]
    fn pt100_at_zero_celsius() {
        // 100 ohm element reads 0 C.
        assert!((resistance_to_celsius(100.0, 100.0)).abs() < 1e-6);
    }

    #[test]
    fn pt100_at_mash_temperature() {
        // R = R0 * (1 + alpha * T): 64 C -> 124.64 ohm.
        let t = resistance_to_celsius(124.64, 100.0);
        assert!((t - 64.0).abs() < 0.01);
    }

    #[test]
    fn pt1000_scales_with_nominal() {
        let t = resistance_to_celsius(1246.4, 1000.0);
        assert!((t - 64.0).abs() < 0.01);
    }

    #[test]
    fn fault_mapping() {
        assert_eq!(map_fault(FAULT_RTD_IN_LOW), ProbeError::Disconnected);
        assert_eq!(map_fault(FAULT_REF_IN_HIGH), ProbeError::HardwareFault);
        assert_eq!(map_fault(FAULT_REF_IN_LOW), ProbeError::HardwareFault);
        assert_eq!(map_fault(FAULT_OVUV), ProbeError::HardwareFault);
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod probe_tests {
    use super::*;
    use crate::probes::sim::SimRtdBus;
    use crate::probes::{rtd_identity, Probe, SharedRtdBus};

    fn sim_bus() -> (std::sync::Arc<std::sync::Mutex<SimRtdBus>>, SharedRtdBus) {
        let sim = SimRtdBus::shared();
        let bus: SharedRtdBus = sim.clone();
        (sim, bus)
    }

    #[test]
    fn measure_converts_code() {
        let (sim, bus) = sim_bus();
        sim.lock().unwrap().set_celsius(5, 64.0, 100.0, 430.0);
        let mut probe = RtdProbe::new(5, 100.0, 430.0, bus).unwrap();
        let t = probe.measure().unwrap();
        assert!((t - 64.0).abs() < 0.1, "got {t}");
        assert_eq!(probe.identity(), rtd_identity(5));
    }

    #[test]
    fn rtd_in_low_fault_reads_disconnected_and_clears() {
        let (sim, bus) = sim_bus();
        sim.lock().unwrap().set_fault(5, FAULT_RTD_IN_LOW);
        let mut probe = RtdProbe::new(5, 100.0, 430.0, bus).unwrap();
        assert_eq!(probe.measure(), Err(ProbeError::Disconnected));
        assert!(sim.lock().unwrap().fault_cleared(5));
    }

    #[test]
    fn ovuv_fault_reads_hardware_fault() {
        let (sim, bus) = sim_bus();
        sim.lock().unwrap().set_fault(3, FAULT_OVUV);
        let mut probe = RtdProbe::new(3, 100.0, 430.0, bus).unwrap();
        assert_eq!(probe.measure(), Err(ProbeError::HardwareFault));
    }

    #[test]
    fn implausible_resistance_is_out_of_range() {
        let (sim, bus) = sim_bus();
        // 2.5x nominal resistance: outside the sanity window.
        sim.lock()
            .unwrap()
            .set_code(5, ((250.0f32 * 32768.0 / 430.0) as u16) << 1);
        let mut probe = RtdProbe::new(5, 100.0, 430.0, bus).unwrap();
        assert_eq!(probe.measure(), Err(ProbeError::OutOfRange));
    }

    #[test]
    fn failed_attach_reports_uninitialized_until_reinit() {
        let (sim, bus) = sim_bus();
        sim.lock().unwrap().fail_attach(7, true);
        let mut probe = RtdProbe::new(7, 100.0, 430.0, bus).unwrap();
        assert_eq!(probe.measure(), Err(ProbeError::Uninitialized));

        {
            let mut b = sim.lock().unwrap();
            b.fail_attach(7, false);
            b.set_celsius(7, 20.0, 100.0, 430.0);
        }
        probe.reinit().unwrap();
        assert!(probe.measure().is_ok());
    }

    #[test]
    fn drop_detaches_device() {
        let (sim, bus) = sim_bus();
        sim.lock().unwrap().set_celsius(5, 20.0, 100.0, 430.0);
        {
            let _probe = RtdProbe::new(5, 100.0, 430.0, bus).unwrap();
            assert!(sim.lock().unwrap().is_attached(5));
        }
        assert!(!sim.lock().unwrap().is_attached(5));
    }
}
