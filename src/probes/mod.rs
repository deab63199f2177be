//! Temperature probe capability.
//!
//! Three probe families sit behind one contract: one-wire digital
//! sensors (DS18B20), SPI resistance-to-digital converters (MAX31865
//! with PT100/PT1000 elements) and analog NTC thermistors on a voltage
//! divider. Every probe exposes
//!
//! - `measure()` — a Celsius reading or a typed error,
//! - `identity()` — a 64-bit id stable across reboots that encodes the
//!   probe kind and its address or pin,
//! - `reinit()` — reconstruction of the underlying bus device.
//!
//! The peripheral drivers themselves are collaborators: each family
//! defines the capability trait its driver must expose ([`OneWireBus`],
//! [`RtdBus`], [`AnalogInput`]). The target binds ESP-IDF
//! implementations; the host binds the [`sim`] backends used by tests.

use core::fmt;
use std::sync::{Arc, Mutex};

pub mod ds18b20;
pub mod max31865;
pub mod ntc;

#[cfg(not(target_os = "espidf"))]
pub mod sim;

#[cfg(target_os = "espidf")]
pub mod hal;

pub use ds18b20::Ds18b20Probe;
pub use max31865::RtdProbe;
pub use ntc::NtcProbe;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Probe measurement failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeError {
    /// Open or short circuit; the element is not answering.
    Disconnected,
    /// The converter or bus reported a fault.
    HardwareFault,
    /// The reading is outside the physically plausible range.
    OutOfRange,
    /// The bus device has not been (re)constructed yet.
    Uninitialized,
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "probe disconnected"),
            Self::HardwareFault => write!(f, "hardware fault"),
            Self::OutOfRange => write!(f, "reading out of range"),
            Self::Uninitialized => write!(f, "probe not initialised"),
        }
    }
}

// ---------------------------------------------------------------------------
// The capability contract
// ---------------------------------------------------------------------------

/// Contract every probe satisfies.
pub trait Probe {
    /// Take a measurement in degrees Celsius.
    fn measure(&mut self) -> Result<f32, ProbeError>;

    /// Stable 64-bit identity encoding kind and address/pin.
    fn identity(&self) -> u64;

    /// Reconstruct the underlying bus device.
    fn reinit(&mut self) -> Result<(), ProbeError>;
}

/// Probe family, recoverable from an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    OneWireDigital,
    SpiRtd,
    AnalogNtc,
}

/// Identity base for RTD probes: `0x31865000 + chip-select pin`.
pub const RTD_IDENTITY_BASE: u64 = 0x3186_5000;
/// Identity base for NTC probes: `0x4E544300 + analog pin`.
pub const NTC_IDENTITY_BASE: u64 = 0x4E54_4300;

pub fn rtd_identity(cs_pin: i32) -> u64 {
    RTD_IDENTITY_BASE + cs_pin as u64
}

pub fn ntc_identity(analog_pin: i32) -> u64 {
    NTC_IDENTITY_BASE + analog_pin as u64
}

/// Classify an identity. One-wire ROM codes are full 64-bit values with
/// a family byte in the low bits and never collide with the synthetic
/// 32-bit bases.
pub fn kind_of_identity(id: u64) -> ProbeKind {
    if (RTD_IDENTITY_BASE..RTD_IDENTITY_BASE + 0x100).contains(&id) {
        ProbeKind::SpiRtd
    } else if (NTC_IDENTITY_BASE..NTC_IDENTITY_BASE + 0x100).contains(&id) {
        ProbeKind::AnalogNtc
    } else {
        ProbeKind::OneWireDigital
    }
}

// ---------------------------------------------------------------------------
// Bus capability traits (implemented by drivers / sim)
// ---------------------------------------------------------------------------

/// One-wire bus with per-ROM device slots.
pub trait OneWireBus: Send {
    /// Walk the bus and return the ROM codes of all present devices.
    fn search(&mut self) -> Result<Vec<u64>, ProbeError>;

    /// Bind a device slot for `rom`.
    fn attach(&mut self, rom: u64) -> Result<(), ProbeError>;

    /// Release the device slot for `rom`.
    fn release(&mut self, rom: u64);

    /// Trigger a conversion on `rom` and read the result.
    fn measure(&mut self, rom: u64) -> Result<f32, ProbeError>;
}

/// Shared SPI bus of MAX31865 converters, one chip-select each.
pub trait RtdBus: Send {
    /// Add the device on `cs_pin` to the bus and write its
    /// configuration register (bias on, auto conversion, 50 Hz filter).
    fn attach(&mut self, cs_pin: i32) -> Result<(), ProbeError>;

    /// Remove the device on `cs_pin` from the bus.
    fn detach(&mut self, cs_pin: i32);

    /// Read the raw 16-bit RTD register (fault flag in bit 0).
    fn read_rtd(&mut self, cs_pin: i32) -> Result<u16, ProbeError>;

    /// Read the fault status register.
    fn read_fault(&mut self, cs_pin: i32) -> Result<u8, ProbeError>;

    /// Clear a latched fault.
    fn clear_fault(&mut self, cs_pin: i32) -> Result<(), ProbeError>;
}

/// One-shot ADC reads on GPIO-mapped channels.
pub trait AnalogInput: Send {
    /// Configure the channel mapped to `pin` for one-shot reads.
    fn configure(&mut self, pin: i32) -> Result<(), ProbeError>;

    /// Read the channel, in millivolts (hardware-calibrated when the
    /// target supports it).
    fn read_millivolts(&mut self, pin: i32) -> Result<f32, ProbeError>;

    /// Nominal supply rail in millivolts.
    fn supply_millivolts(&self) -> f32 {
        3300.0
    }
}

pub type SharedOneWire = Arc<Mutex<dyn OneWireBus>>;
pub type SharedRtdBus = Arc<Mutex<dyn RtdBus>>;
pub type SharedAnalog = Arc<Mutex<dyn AnalogInput>>;

// ---------------------------------------------------------------------------
// Tagged sum over the three families
// ---------------------------------------------------------------------------

/// A probe of any family. The registry stores these; dispatch is static
/// per variant.
pub enum ProbeDevice {
    OneWire(Ds18b20Probe),
    Rtd(RtdProbe),
    Ntc(NtcProbe),
}

impl ProbeDevice {
    pub fn kind(&self) -> ProbeKind {
        match self {
            Self::OneWire(_) => ProbeKind::OneWireDigital,
            Self::Rtd(_) => ProbeKind::SpiRtd,
            Self::Ntc(_) => ProbeKind::AnalogNtc,
        }
    }
}

impl Probe for ProbeDevice {
    fn measure(&mut self) -> Result<f32, ProbeError> {
        match self {
            Self::OneWire(p) => p.measure(),
            Self::Rtd(p) => p.measure(),
            Self::Ntc(p) => p.measure(),
        }
    }

    fn identity(&self) -> u64 {
        match self {
            Self::OneWire(p) => p.identity(),
            Self::Rtd(p) => p.identity(),
            Self::Ntc(p) => p.identity(),
        }
    }

    fn reinit(&mut self) -> Result<(), ProbeError> {
        match self {
            Self::OneWire(p) => p.reinit(),
            Self::Rtd(p) => p.reinit(),
            Self::Ntc(p) => p.reinit(),
        }
    }
}
