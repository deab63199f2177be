//! One-wire digital probe (DS18B20).
//!
//! The bus owns the device slot; the probe references it by its 64-bit
//! ROM code and releases it exactly once on drop. Any driver error
//! during a measurement reports the probe disconnected — the registry
//! then stops polling it until the next explicit detect.

use std::sync::Arc;

use super::{OneWireBus, Probe, ProbeError, SharedOneWire};

pub struct Ds18b20Probe {
    rom: u64,
    bus: SharedOneWire,
    bound: bool,
}

impl Ds18b20Probe {
    /// Bind a device slot for `rom` on the shared bus.
    pub fn new(rom: u64, bus: SharedOneWire) -> Result<Self, ProbeError> {
        bus.lock()
            .map_err(|_| ProbeError::HardwareFault)?
            .attach(rom)?;
        Ok(Self {
            rom,
            bus,
            bound: true,
        })
    }

    pub fn rom(&self) -> u64 {
        self.rom
    }

    /// Walk the bus for present devices; used by sensor detection.
    pub fn enumerate(bus: &SharedOneWire) -> Result<Vec<u64>, ProbeError> {
        bus.lock().map_err(|_| ProbeError::HardwareFault)?.search()
    }
}

impl Probe for Ds18b20Probe {
    fn measure(&mut self) -> Result<f32, ProbeError> {
        if !self.bound {
            return Err(ProbeError::Uninitialized);
        }
        let mut bus = self.bus.lock().map_err(|_| ProbeError::HardwareFault)?;
        // Conversion trigger or scratchpad read failing both mean the
        // sensor fell off the bus.
        bus.measure(self.rom).map_err(|_| ProbeError::Disconnected)
    }

    fn identity(&self) -> u64 {
        self.rom
    }

    fn reinit(&mut self) -> Result<(), ProbeError> {
        let mut bus = self.bus.lock().map_err(|_| ProbeError::HardwareFault)?;
        if self.bound {
            bus.release(self.rom);
            self.bound = false;
        }
        bus.attach(self.rom)?;
        self.bound = true;
        Ok(())
    }
}

impl Drop for Ds18b20Probe {
    fn drop(&mut self) {
        if self.bound {
            if let Ok(mut bus) = self.bus.lock() {
                bus.release(self.rom);
            }
            self.bound = false;
        }
    }
}

/// Make a shared handle from a concrete bus implementation.
pub fn share_bus(bus: impl OneWireBus + 'static) -> SharedOneWire {
    Arc::new(std::sync::Mutex::new(bus))
}
