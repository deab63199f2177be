//! Sensor registry.
//!
//! Owns the sensor metadata and the probe instances behind them. The
//! read loop calls [`SensorRegistry::read_all`] every tick; the
//! dispatcher mutates the registry under the engine's writer lock.
//!
//! Fault policy: every probe error publishes the −999 sentinel to the
//! UI, marks the sensor disconnected and counts toward reinitialisation
//! (5 consecutive failures, 3 when the device handle itself is
//! invalid). A failing one-wire sensor is instead dropped from polling
//! until the next explicit detect; RTD and NTC probes keep being polled
//! since they can recover physically.

use std::collections::BTreeMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::TemperatureScale;
use crate::error::Error;
use crate::probes::{
    ntc_identity, rtd_identity, Ds18b20Probe, NtcProbe, Probe, ProbeDevice, ProbeError, ProbeKind,
    RtdProbe, SharedAnalog, SharedOneWire, SharedRtdBus,
};
use crate::settings::SettingsStore;

pub const SENSORS_KEY: &str = "tempsensors";

/// Temperature published for a faulted sensor.
pub const DISCONNECTED_SENTINEL: f32 = -999.0;

/// Reinit threshold for transient errors.
const REINIT_AFTER_FAILURES: u8 = 5;
/// Reinit threshold when the device handle itself is invalid.
const REINIT_AFTER_INVALID_HANDLE: u8 = 3;

/// Persisted probe parameters. One-wire identity is the ROM code
/// itself; RTD and NTC identities are derived from their pins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProbeBinding {
    OneWire,
    Rtd {
        cs_pin: i32,
        nominal_ohms: f32,
        ref_ohms: f32,
    },
    Ntc {
        analog_pin: i32,
        beta: f32,
        r0_ohms: f32,
        divider_ohms: f32,
    },
}

impl ProbeBinding {
    pub fn kind(&self) -> ProbeKind {
        match self {
            Self::OneWire => ProbeKind::OneWireDigital,
            Self::Rtd { .. } => ProbeKind::SpiRtd,
            Self::Ntc { .. } => ProbeKind::AnalogNtc,
        }
    }
}

/// Sensor metadata. Probes live in a parallel map keyed by identity, so
/// the record stays plain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sensor {
    pub id: u64,
    pub name: String,
    pub color: String,
    /// Publish to the live temperature map.
    pub show: bool,
    /// Contribute to the control average.
    pub use_for_control: bool,
    /// Absolute calibration offset, degrees in the configured scale.
    pub offset: f32,
    /// Relative calibration multiplier.
    pub multiplier: f32,
    pub binding: ProbeBinding,
    #[serde(skip)]
    pub last_temp: f32,
    #[serde(skip)]
    pub connected: bool,
    #[serde(skip)]
    pub consecutive_failures: u8,
}

impl Sensor {
    fn with_defaults(id: u64, binding: ProbeBinding) -> Self {
        Self {
            id,
            name: id.to_string(),
            color: "#ffffff".into(),
            show: true,
            use_for_control: true,
            offset: 0.0,
            multiplier: 1.0,
            binding,
            last_temp: 0.0,
            connected: false,
            consecutive_failures: 0,
        }
    }
}

/// Partial update from the UI; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct SensorUpdate {
    pub id: u64,
    pub name: Option<String>,
    pub color: Option<String>,
    pub show: Option<bool>,
    pub use_for_control: Option<bool>,
    pub offset: Option<f32>,
    pub multiplier: Option<f32>,
    /// Reassign an RTD probe to a different chip-select.
    pub cs_pin: Option<i32>,
    /// Reassign an NTC probe to a different analog pin.
    pub analog_pin: Option<i32>,
}

/// Result of one acquisition pass.
#[derive(Debug, Clone, Default)]
pub struct ReadOutcome {
    /// Mean of the successfully-read control sensors; `None` when no
    /// sensor contributed (the engine keeps its previous value).
    pub control_average: Option<f32>,
}

pub struct SensorRegistry {
    scale: TemperatureScale,
    sensors: BTreeMap<u64, Sensor>,
    probes: BTreeMap<u64, ProbeDevice>,
    onewire: Option<SharedOneWire>,
    rtd: Option<SharedRtdBus>,
    adc: Option<SharedAnalog>,
    /// Live per-sensor temperatures shown in the UI.
    current: BTreeMap<u64, f32>,
}

impl SensorRegistry {
    pub fn new(
        scale: TemperatureScale,
        onewire: Option<SharedOneWire>,
        rtd: Option<SharedRtdBus>,
        adc: Option<SharedAnalog>,
    ) -> Self {
        Self {
            scale,
            sensors: BTreeMap::new(),
            probes: BTreeMap::new(),
            onewire,
            rtd,
            adc,
            current: BTreeMap::new(),
        }
    }

    pub fn set_scale(&mut self, scale: TemperatureScale) {
        self.scale = scale;
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Load sensor records and bind probes for the pin-addressed kinds.
    /// One-wire sensors stay unbound until the next detect.
    pub fn load(&mut self, store: &SettingsStore) {
        let records: Vec<Sensor> = store.read_record(SENSORS_KEY, Vec::new());
        for mut sensor in records {
            sensor.connected = false;
            sensor.consecutive_failures = 0;
            let id = sensor.id;
            info!("sensor from settings: {:#018X}", id);
            self.bind_probe(&sensor);
            self.sensors.insert(id, sensor);
        }
    }

    pub fn save(&self, store: &mut SettingsStore) {
        let records: Vec<&Sensor> = self.sensors.values().collect();
        if let Err(e) = store.write_record(SENSORS_KEY, &records) {
            warn!("saving sensors failed ({e})");
        }
    }

    // ── Introspection ────────────────────────────────────────────────

    pub fn sensors(&self) -> impl Iterator<Item = &Sensor> {
        self.sensors.values()
    }

    pub fn get(&self, id: u64) -> Option<&Sensor> {
        self.sensors.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Live displayed temperatures (sentinels included).
    pub fn current_temperatures(&self) -> &BTreeMap<u64, f32> {
        &self.current
    }

    pub fn is_polled(&self, id: u64) -> bool {
        self.probes.contains_key(&id)
    }

    // ── Detection and creation ───────────────────────────────────────

    /// Walk the one-wire bus. New ROMs are added with defaults; known
    /// ROMs re-bind their device handle and come back as connected.
    pub fn detect_onewire(&mut self) -> Result<usize, Error> {
        let bus = self
            .onewire
            .as_ref()
            .ok_or(Error::Init("one-wire bus not available"))?
            .clone();

        let roms = Ds18b20Probe::enumerate(&bus).map_err(Error::Probe)?;
        let mut bound = 0;
        for rom in roms {
            match Ds18b20Probe::new(rom, bus.clone()) {
                Ok(probe) => {
                    let sensor = self
                        .sensors
                        .entry(rom)
                        .or_insert_with(|| Sensor::with_defaults(rom, ProbeBinding::OneWire));
                    sensor.connected = true;
                    sensor.consecutive_failures = 0;
                    self.probes.insert(rom, ProbeDevice::OneWire(probe));
                    bound += 1;
                }
                Err(e) => warn!("binding one-wire device {rom:#018X} failed ({e})"),
            }
        }
        info!("one-wire detect bound {bound} sensor(s)");
        Ok(bound)
    }

    /// Add an RTD sensor on `cs_pin`. Fails when the pin is in use.
    pub fn add_rtd(&mut self, cs_pin: i32, nominal_ohms: f32, ref_ohms: f32) -> Result<u64, Error> {
        let id = rtd_identity(cs_pin);
        if self.sensors.contains_key(&id) {
            return Err(Error::Protocol(format!("CS pin {cs_pin} already in use")));
        }
        let binding = ProbeBinding::Rtd {
            cs_pin,
            nominal_ohms,
            ref_ohms,
        };
        let sensor = Sensor::with_defaults(id, binding);
        self.bind_probe(&sensor);
        self.sensors.insert(id, sensor);
        Ok(id)
    }

    /// Add an NTC sensor on `analog_pin`. Fails when the pin is in use.
    pub fn add_ntc(
        &mut self,
        analog_pin: i32,
        beta: f32,
        r0_ohms: f32,
        divider_ohms: f32,
    ) -> Result<u64, Error> {
        let id = ntc_identity(analog_pin);
        if self.sensors.contains_key(&id) {
            return Err(Error::Protocol(format!(
                "analog pin {analog_pin} already in use"
            )));
        }
        let binding = ProbeBinding::Ntc {
            analog_pin,
            beta,
            r0_ohms,
            divider_ohms,
        };
        let sensor = Sensor::with_defaults(id, binding);
        self.bind_probe(&sensor);
        self.sensors.insert(id, sensor);
        Ok(id)
    }

    /// Remove every sensor whose id is not in `keep`. Dropping the
    /// probe releases the underlying bus device exactly once.
    pub fn retain(&mut self, keep: &[u64]) {
        let stale: Vec<u64> = self
            .sensors
            .keys()
            .filter(|id| !keep.contains(id))
            .copied()
            .collect();
        for id in stale {
            info!("erasing sensor {id:#018X}");
            self.sensors.remove(&id);
            self.probes.remove(&id);
            self.current.remove(&id);
        }
    }

    // ── Mutation ─────────────────────────────────────────────────────

    /// Apply a partial update. Pin reassignment re-keys the identity
    /// and rebinds the hardware; binding a pin already in use is
    /// rejected before anything changes.
    pub fn apply_update(&mut self, update: &SensorUpdate) -> Result<(), Error> {
        let Some(mut sensor) = self.sensors.remove(&update.id) else {
            return Err(Error::Protocol(format!("unknown sensor id {}", update.id)));
        };

        // Work out the target identity first so conflicts reject cleanly.
        let new_binding = match (&sensor.binding, update.cs_pin, update.analog_pin) {
            (ProbeBinding::Rtd { nominal_ohms, ref_ohms, cs_pin }, Some(new_cs), _)
                if *cs_pin != new_cs =>
            {
                Some((
                    rtd_identity(new_cs),
                    ProbeBinding::Rtd {
                        cs_pin: new_cs,
                        nominal_ohms: *nominal_ohms,
                        ref_ohms: *ref_ohms,
                    },
                ))
            }
            (
                ProbeBinding::Ntc {
                    beta,
                    r0_ohms,
                    divider_ohms,
                    analog_pin,
                },
                _,
                Some(new_pin),
            ) if *analog_pin != new_pin => Some((
                ntc_identity(new_pin),
                ProbeBinding::Ntc {
                    analog_pin: new_pin,
                    beta: *beta,
                    r0_ohms: *r0_ohms,
                    divider_ohms: *divider_ohms,
                },
            )),
            _ => None,
        };

        if let Some((new_id, _)) = &new_binding {
            if self.sensors.contains_key(new_id) {
                let err = Error::Protocol(format!("pin already in use (id {new_id})"));
                self.sensors.insert(sensor.id, sensor);
                return Err(err);
            }
        }

        if let Some(name) = &update.name {
            sensor.name = name.clone();
        }
        if let Some(color) = &update.color {
            sensor.color = color.clone();
        }
        if let Some(show) = update.show {
            sensor.show = show;
            if !show {
                self.current.remove(&sensor.id);
            }
        }
        if let Some(ufc) = update.use_for_control {
            sensor.use_for_control = ufc;
        }
        if let Some(offset) = update.offset {
            sensor.offset = offset;
        }
        if let Some(multiplier) = update.multiplier {
            sensor.multiplier = multiplier;
        }

        if let Some((new_id, binding)) = new_binding {
            // Drop the old device before claiming the new pin.
            self.probes.remove(&sensor.id);
            self.current.remove(&sensor.id);
            sensor.id = new_id;
            sensor.binding = binding;
            sensor.connected = false;
            sensor.consecutive_failures = 0;
            self.bind_probe(&sensor);
        }

        self.sensors.insert(sensor.id, sensor);
        Ok(())
    }

    // ── Acquisition ──────────────────────────────────────────────────

    /// Read every polled probe, converting and calibrating into the
    /// configured scale, publishing shown sensors and averaging the
    /// control contributors.
    pub fn read_all(&mut self) -> ReadOutcome {
        let mut sum = 0.0f32;
        let mut contributors = 0u32;

        let ids: Vec<u64> = self.sensors.keys().copied().collect();
        for id in ids {
            let result = match self.probes.get_mut(&id) {
                Some(probe) => probe.measure(),
                // Not bound: dropped one-wire device or failed bus init.
                None => continue,
            };
            let scale = self.scale;
            let Some(sensor) = self.sensors.get_mut(&id) else {
                continue;
            };

            match result {
                Ok(celsius) => {
                    let converted = scale.from_celsius(celsius);
                    let calibrated = (converted + sensor.offset) * sensor.multiplier;
                    sensor.last_temp = calibrated;
                    sensor.connected = true;
                    sensor.consecutive_failures = 0;
                    if sensor.show {
                        self.current.insert(id, calibrated);
                    }
                    if sensor.use_for_control {
                        sum += calibrated;
                        contributors += 1;
                    }
                }
                Err(e) => {
                    warn!("sensor {id:#018X} read failed ({e})");
                    sensor.connected = false;
                    sensor.last_temp = 0.0;
                    if sensor.show {
                        self.current.insert(id, DISCONNECTED_SENTINEL);
                    }

                    if sensor.binding.kind() == ProbeKind::OneWireDigital {
                        // Conversion failures are persistent; stop
                        // polling until an explicit detect rediscovers it.
                        self.probes.remove(&id);
                        continue;
                    }

                    sensor.consecutive_failures = sensor.consecutive_failures.saturating_add(1);
                    let threshold = if e == ProbeError::Uninitialized {
                        REINIT_AFTER_INVALID_HANDLE
                    } else {
                        REINIT_AFTER_FAILURES
                    };
                    if sensor.consecutive_failures >= threshold {
                        info!("sensor {id:#018X} reinit after {threshold} failures");
                        sensor.consecutive_failures = 0;
                        // Reset before attempting: one reinit per
                        // threshold crossing regardless of outcome.
                        if let Some(probe) = self.probes.get_mut(&id) {
                            if let Err(e) = probe.reinit() {
                                warn!("sensor {id:#018X} reinit failed ({e})");
                            }
                        }
                    }
                }
            }
        }

        ReadOutcome {
            control_average: (contributors > 0).then(|| sum / contributors as f32),
        }
    }

    // ── Internal ─────────────────────────────────────────────────────

    fn bind_probe(&mut self, sensor: &Sensor) {
        match &sensor.binding {
            ProbeBinding::OneWire => {
                // Bound by detect_onewire once the device answers.
            }
            ProbeBinding::Rtd {
                cs_pin,
                nominal_ohms,
                ref_ohms,
            } => {
                let Some(bus) = self.rtd.as_ref() else {
                    warn!("RTD sensor {:#018X} configured but SPI bus unavailable", sensor.id);
                    return;
                };
                match RtdProbe::new(*cs_pin, *nominal_ohms, *ref_ohms, bus.clone()) {
                    Ok(probe) => {
                        self.probes.insert(sensor.id, ProbeDevice::Rtd(probe));
                    }
                    Err(e) => warn!("binding RTD on CS{cs_pin} failed ({e})"),
                }
            }
            ProbeBinding::Ntc {
                analog_pin,
                beta,
                r0_ohms,
                divider_ohms,
            } => {
                let Some(adc) = self.adc.as_ref() else {
                    warn!("NTC sensor {:#018X} configured but ADC unavailable", sensor.id);
                    return;
                };
                match NtcProbe::new(*analog_pin, *beta, *r0_ohms, *divider_ohms, adc.clone()) {
                    Ok(probe) => {
                        self.probes.insert(sensor.id, ProbeDevice::Ntc(probe));
                    }
                    Err(e) => warn!("binding NTC on pin {analog_pin} failed ({e})"),
                }
            }
        }
    }
}
