//! Shared runtime state of the engine.
//!
//! The four loops communicate only through these fields. Everything is
//! a flag or scalar cheap enough to read at loop frequency; floats ride
//! in bit-cast `AtomicU32`s. Collections (sensors, heaters, schedules)
//! live behind locks on the engine itself, not here.

use std::sync::atomic::{AtomicBool, AtomicI16, AtomicI64, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use crate::heaters::MAX_HEATERS;

/// `f32` with relaxed atomic load/store via its bit pattern.
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

/// Boost ladder phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BoostPhase {
    Off = 0,
    /// Full output until the boost threshold is reached.
    Boost = 1,
    /// Zero output until the temperature starts falling.
    Rest = 2,
}

impl BoostPhase {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Boost,
            2 => Self::Rest,
            _ => Self::Off,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "Off",
            Self::Boost => "Boost",
            Self::Rest => "Rest",
        }
    }
}

/// Sentinel meaning "no manual duty override".
const NO_OVERRIDE: i16 = -1;

pub struct EngineState {
    /// Engine-wide kill switch; every task exits when cleared.
    pub run: AtomicBool,
    /// Gates the per-brew tasks (pid, output, control).
    pub control_run: AtomicBool,
    /// Read loop skips acquisition while configuration is mutated.
    pub pause_reads: AtomicBool,
    /// Abandons the current PID sub-cycle at the next second boundary.
    pub reset_pid: AtomicBool,
    /// Runner is stretching a step whose target was not reached.
    pub in_overtime: AtomicBool,
    /// Current run follows a boil schedule (selects the boil gain set).
    pub boil_run: AtomicBool,

    /// Latest control average, configured scale.
    pub temperature: AtomicF32,
    /// Current setpoint, configured scale.
    pub target_temperature: AtomicF32,
    /// Effective duty percentage driving the heaters.
    pub pid_output: AtomicF32,

    /// Manual duty override percent; negative means none.
    manual_override_output: AtomicI16,
    /// Manual target override; NaN bit pattern means none.
    manual_override_target: AtomicF32,

    /// Boost ladder phase, `BoostPhase as u8`.
    pub boost_phase: AtomicU8,
    /// Bumped whenever the compiled plan changes shape.
    pub running_version: AtomicU32,
    /// Index into the compiled plan.
    pub current_step: AtomicUsize,

    /// Stir task gate.
    pub stir_run: AtomicBool,
    /// Buzzer pulse deadline, epoch seconds (0 = idle).
    pub buzzer_until: AtomicI64,

    /// Per-heater burn flags, indexed by preference position.
    pub burn: [AtomicBool; MAX_HEATERS],
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            run: AtomicBool::new(false),
            control_run: AtomicBool::new(false),
            pause_reads: AtomicBool::new(false),
            reset_pid: AtomicBool::new(false),
            in_overtime: AtomicBool::new(false),
            boil_run: AtomicBool::new(false),
            temperature: AtomicF32::new(0.0),
            target_temperature: AtomicF32::new(0.0),
            pid_output: AtomicF32::new(0.0),
            manual_override_output: AtomicI16::new(NO_OVERRIDE),
            manual_override_target: AtomicF32::new(f32::NAN),
            boost_phase: AtomicU8::new(BoostPhase::Off as u8),
            running_version: AtomicU32::new(0),
            current_step: AtomicUsize::new(0),
            stir_run: AtomicBool::new(false),
            buzzer_until: AtomicI64::new(0),
            burn: Default::default(),
        }
    }

    pub fn boost(&self) -> BoostPhase {
        BoostPhase::from_u8(self.boost_phase.load(Ordering::Relaxed))
    }

    pub fn set_boost(&self, phase: BoostPhase) {
        self.boost_phase.store(phase as u8, Ordering::Relaxed);
    }

    pub fn status_text(&self) -> &'static str {
        if self.control_run.load(Ordering::Relaxed) {
            "Running"
        } else {
            "Idle"
        }
    }

    pub fn stir_status_text(&self) -> &'static str {
        if self.stir_run.load(Ordering::Relaxed) {
            "Running"
        } else {
            "Idle"
        }
    }

    // ── Manual overrides ─────────────────────────────────────────────

    pub fn override_output(&self) -> Option<u8> {
        let v = self.manual_override_output.load(Ordering::Relaxed);
        (v >= 0).then_some(v as u8)
    }

    pub fn set_override_output(&self, duty: Option<u8>) {
        let v = duty.map_or(NO_OVERRIDE, |d| i16::from(d.min(100)));
        self.manual_override_output.store(v, Ordering::Relaxed);
    }

    pub fn override_target(&self) -> Option<f32> {
        let v = self.manual_override_target.load();
        (!v.is_nan()).then_some(v)
    }

    pub fn set_override_target(&self, target: Option<f32>) {
        self.manual_override_target.store(target.unwrap_or(f32::NAN));
    }

    pub fn clear_overrides(&self) {
        self.set_override_output(None);
        self.set_override_target(None);
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
