//! Host-side simulated buses.
//!
//! Tests (and the host binary) program readings per identity and the
//! probes read them back through the same capability traits the ESP
//! drivers implement. Attach/release bookkeeping is recorded so
//! ownership invariants can be asserted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use super::{max31865, AnalogInput, OneWireBus, ProbeError, RtdBus};

// ---------------------------------------------------------------------------
// One-wire
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SimOneWire {
    devices: BTreeMap<u64, Result<f32, ProbeError>>,
    attached: BTreeMap<u64, u32>,
    releases: BTreeMap<u64, u32>,
    search_fails: bool,
}

impl SimOneWire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Present a device on the bus with a programmed reading.
    pub fn set_device(&mut self, rom: u64, reading: Result<f32, ProbeError>) {
        self.devices.insert(rom, reading);
    }

    /// Physically unplug a device.
    pub fn remove_device(&mut self, rom: u64) {
        self.devices.remove(&rom);
    }

    pub fn set_search_fails(&mut self, fails: bool) {
        self.search_fails = fails;
    }

    pub fn attached_count(&self, rom: u64) -> u32 {
        self.attached.get(&rom).copied().unwrap_or(0)
    }

    pub fn release_count(&self, rom: u64) -> u32 {
        self.releases.get(&rom).copied().unwrap_or(0)
    }
}

impl OneWireBus for SimOneWire {
    fn search(&mut self) -> Result<Vec<u64>, ProbeError> {
        if self.search_fails {
            return Err(ProbeError::HardwareFault);
        }
        Ok(self.devices.keys().copied().collect())
    }

    fn attach(&mut self, rom: u64) -> Result<(), ProbeError> {
        if !self.devices.contains_key(&rom) {
            return Err(ProbeError::Disconnected);
        }
        *self.attached.entry(rom).or_insert(0) += 1;
        Ok(())
    }

    fn release(&mut self, rom: u64) {
        let n = self.attached.entry(rom).or_insert(0);
        *n = n.saturating_sub(1);
        *self.releases.entry(rom).or_insert(0) += 1;
    }

    fn measure(&mut self, rom: u64) -> Result<f32, ProbeError> {
        match self.devices.get(&rom) {
            Some(reading) => *reading,
            None => Err(ProbeError::Disconnected),
        }
    }
}

// ---------------------------------------------------------------------------
// SPI RTD
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SimRtdBus {
    /// Raw 16-bit RTD register per chip-select (fault flag in bit 0).
    codes: BTreeMap<i32, u16>,
    faults: BTreeMap<i32, u8>,
    cleared: BTreeSet<i32>,
    attach_fails: BTreeSet<i32>,
    attached: BTreeSet<i32>,
}

impl SimRtdBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Program the raw RTD register directly.
    pub fn set_code(&mut self, cs_pin: i32, raw: u16) {
        self.codes.insert(cs_pin, raw);
        self.faults.remove(&cs_pin);
    }

    /// Program a temperature via the inverse transfer function.
    pub fn set_celsius(&mut self, cs_pin: i32, celsius: f32, nominal_ohms: f32, ref_ohms: f32) {
        let resistance = nominal_ohms * (1.0 + 0.003_85 * celsius);
        let code = (resistance * 32768.0 / ref_ohms) as u16;
        self.set_code(cs_pin, code << 1);
    }

    /// Latch a fault; reads return the fault flag until cleared or
    /// reprogrammed.
    pub fn set_fault(&mut self, cs_pin: i32, status: u8) {
        self.faults.insert(cs_pin, status);
        self.codes.insert(cs_pin, 0x0001);
        self.cleared.remove(&cs_pin);
    }

    pub fn fault_cleared(&self, cs_pin: i32) -> bool {
        self.cleared.contains(&cs_pin)
    }

    pub fn fail_attach(&mut self, cs_pin: i32, fail: bool) {
        if fail {
            self.attach_fails.insert(cs_pin);
        } else {
            self.attach_fails.remove(&cs_pin);
        }
    }

    pub fn is_attached(&self, cs_pin: i32) -> bool {
        self.attached.contains(&cs_pin)
    }
}

impl RtdBus for SimRtdBus {
    fn attach(&mut self, cs_pin: i32) -> Result<(), ProbeError> {
        if self.attach_fails.contains(&cs_pin) {
            return Err(ProbeError::Uninitialized);
        }
        self.attached.insert(cs_pin);
        Ok(())
    }

    fn detach(&mut self, cs_pin: i32) {
        self.attached.remove(&cs_pin);
    }

    fn read_rtd(&mut self, cs_pin: i32) -> Result<u16, ProbeError> {
        if !self.attached.contains(&cs_pin) {
            return Err(ProbeError::Uninitialized);
        }
        Ok(self.codes.get(&cs_pin).copied().unwrap_or(0x0001))
    }

    fn read_fault(&mut self, cs_pin: i32) -> Result<u8, ProbeError> {
        Ok(self
            .faults
            .get(&cs_pin)
            .copied()
            .unwrap_or(max31865::FAULT_RTD_IN_LOW))
    }

    fn clear_fault(&mut self, cs_pin: i32) -> Result<(), ProbeError> {
        self.cleared.insert(cs_pin);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ADC
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SimAdc {
    millivolts: BTreeMap<i32, f32>,
    configure_fails: BTreeSet<i32>,
    configured: BTreeSet<i32>,
}

impl SimAdc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn set_millivolts(&mut self, pin: i32, mv: f32) {
        self.millivolts.insert(pin, mv);
    }

    pub fn fail_configure(&mut self, pin: i32, fail: bool) {
        if fail {
            self.configure_fails.insert(pin);
        } else {
            self.configure_fails.remove(&pin);
        }
    }
}

impl AnalogInput for SimAdc {
    fn configure(&mut self, pin: i32) -> Result<(), ProbeError> {
        if self.configure_fails.contains(&pin) {
            return Err(ProbeError::Uninitialized);
        }
        self.configured.insert(pin);
        Ok(())
    }

    fn read_millivolts(&mut self, pin: i32) -> Result<f32, ProbeError> {
        if !self.configured.contains(&pin) {
            return Err(ProbeError::Uninitialized);
        }
        match self.millivolts.get(&pin) {
            Some(mv) => Ok(*mv),
            None => Err(ProbeError::HardwareFault),
        }
    }
}
