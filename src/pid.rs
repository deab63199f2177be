//! Discrete PID controller for heater duty.
//!
//! Clamped to [0, 100] percent output. Two gain sets exist — one for
//! mash runs, one for boil runs — selected when a run starts. Because
//! the settings store is integer-only, gains persist as fixed-point
//! tenths; runtime arithmetic is double precision.

use serde::{Deserialize, Serialize};

use crate::settings::SettingsStore;

/// One gain set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    /// Fixed-point encoding used at the persistence boundary.
    pub fn to_tenths(self) -> (u16, u16, u16) {
        (
            (self.kp * 10.0) as u16,
            (self.ki * 10.0) as u16,
            (self.kd * 10.0) as u16,
        )
    }

    pub fn from_tenths(p: u16, i: u16, d: u16) -> Self {
        Self {
            kp: p as f64 / 10.0,
            ki: i as f64 / 10.0,
            kd: d as f64 / 10.0,
        }
    }
}

/// Persisted PID parameters for both run kinds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidSettings {
    pub mash: PidGains,
    pub boil: PidGains,
}

impl Default for PidSettings {
    fn default() -> Self {
        Self {
            mash: PidGains {
                kp: 10.0,
                ki: 0.5,
                kd: 15.0,
            },
            boil: PidGains {
                kp: 20.0,
                ki: 1.0,
                kd: 10.0,
            },
        }
    }
}

impl PidSettings {
    pub fn load(store: &SettingsStore) -> Self {
        let d = Self::default();
        let (mp, mi, md) = d.mash.to_tenths();
        let (bp, bi, bd) = d.boil.to_tenths();
        Self {
            mash: PidGains::from_tenths(
                store.read_u16("kP", mp),
                store.read_u16("kI", mi),
                store.read_u16("kD", md),
            ),
            boil: PidGains::from_tenths(
                store.read_u16("boilkP", bp),
                store.read_u16("boilkI", bi),
                store.read_u16("boilkD", bd),
            ),
        }
    }

    pub fn save(&self, store: &mut SettingsStore) {
        let (mp, mi, md) = self.mash.to_tenths();
        let (bp, bi, bd) = self.boil.to_tenths();
        store.write_u16("kP", mp);
        store.write_u16("kI", mi);
        store.write_u16("kD", md);
        store.write_u16("boilkP", bp);
        store.write_u16("boilkI", bi);
        store.write_u16("boilkD", bd);
    }
}

/// The controller itself. One instance lives for the duration of a run.
pub struct PidController {
    gains: PidGains,
    integral: f64,
    prev_error: f64,
    output_min: f64,
    output_max: f64,
    first_run: bool,
}

impl PidController {
    pub fn new(gains: PidGains) -> Self {
        Self {
            gains,
            integral: 0.0,
            prev_error: 0.0,
            output_min: 0.0,
            output_max: 100.0,
            first_run: true,
        }
    }

    pub fn set_limits(&mut self, min: f64, max: f64) {
        self.output_min = min;
        self.output_max = max;
    }

    /// Compute the output for one cycle given the measured process
    /// value and the setpoint.
    pub fn compute(&mut self, process: f64, setpoint: f64) -> f64 {
        let error = setpoint - process;

        let p = self.gains.kp * error;

        // Derivative on error over one sample; suppressed on the first
        // cycle so a fresh start does not kick the output.
        let d = if self.first_run {
            0.0
        } else {
            self.gains.kd * (error - self.prev_error)
        };

        // Anti-windup: hold the integrator while the output is pinned
        // against a limit and the error would push it further out.
        let provisional = p + self.gains.ki * self.integral + d;
        let pushing_high = provisional >= self.output_max && error > 0.0;
        let pushing_low = provisional <= self.output_min && error < 0.0;
        if !self.first_run && !pushing_high && !pushing_low {
            self.integral += error;
        }

        self.prev_error = error;
        self.first_run = false;

        (p + self.gains.ki * self.integral + d).clamp(self.output_min, self.output_max)
    }

    /// Clear accumulated state; the next compute behaves like a fresh start.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.first_run = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(kp: f64, ki: f64, kd: f64) -> PidController {
        PidController::new(PidGains { kp, ki, kd })
    }

    #[test]
    fn zero_error_zero_output() {
        let mut c = pid(1.0, 0.0, 0.0);
        assert!((c.compute(64.0, 64.0)).abs() < 1e-9);
    }

    #[test]
    fn proportional_response() {
        let mut c = pid(2.0, 0.0, 0.0);
        assert!((c.compute(54.0, 64.0) - 20.0).abs() < 1e-9);
    }

    #[test]
    fn integral_accumulates() {
        let mut c = pid(0.0, 1.0, 0.0);
        let o1 = c.compute(62.0, 64.0);
        let o2 = c.compute(62.0, 64.0);
        assert!(o2 > o1, "integral should accumulate: {o2} > {o1}");
    }

    #[test]
    fn derivative_damps_on_approach() {
        let mut c = pid(0.0, 0.0, 10.0);
        c.set_limits(-100.0, 100.0);
        let _ = c.compute(50.0, 64.0);
        let o = c.compute(55.0, 64.0);
        assert!(o < 0.0, "derivative should oppose a shrinking error");
    }

    #[test]
    fn output_clamped_high() {
        let mut c = pid(100.0, 0.0, 0.0);
        assert_eq!(c.compute(0.0, 100.0), 100.0);
    }

    #[test]
    fn output_clamped_low() {
        let mut c = pid(100.0, 0.0, 0.0);
        assert_eq!(c.compute(100.0, 0.0), 0.0);
    }

    #[test]
    fn integrator_holds_while_saturated() {
        let mut c = pid(50.0, 1.0, 0.0);
        // Large error keeps the output pinned at 100 for several cycles.
        for _ in 0..10 {
            assert_eq!(c.compute(20.0, 64.0), 100.0);
        }
        // Once the error flips, recovery is immediate rather than
        // delayed by a wound-up integrator.
        let out = c.compute(80.0, 64.0);
        assert_eq!(out, 0.0);
        let out = c.compute(63.9, 64.0);
        assert!(out < 100.0);
    }

    #[test]
    fn reset_clears_state() {
        let mut c = pid(1.0, 1.0, 1.0);
        c.compute(10.0, 64.0);
        c.compute(20.0, 64.0);
        c.reset();
        let mut fresh = pid(1.0, 1.0, 1.0);
        assert_eq!(c.compute(30.0, 64.0), fresh.compute(30.0, 64.0));
    }

    #[test]
    fn gains_tenths_round_trip() {
        let g = PidGains {
            kp: 12.3,
            ki: 0.5,
            kd: 150.0,
        };
        let (p, i, d) = g.to_tenths();
        assert_eq!((p, i, d), (123, 5, 1500));
        assert_eq!(PidGains::from_tenths(p, i, d), g);
    }

    #[test]
    fn settings_persist_as_tenths() {
        let mut store = SettingsStore::open_in_memory();
        let s = PidSettings {
            mash: PidGains {
                kp: 9.9,
                ki: 0.4,
                kd: 12.0,
            },
            boil: PidGains {
                kp: 25.0,
                ki: 1.5,
                kd: 0.0,
            },
        };
        s.save(&mut store);
        assert_eq!(store.read_u16("kP", 0), 99);
        assert_eq!(store.read_u16("boilkI", 0), 15);
        assert_eq!(PidSettings::load(&store), s);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn output_always_clamped(
            setpoint in 0.0f64..110.0,
            runs in proptest::collection::vec(0.0f64..120.0, 1..50),
        ) {
            let mut c = PidController::new(PidGains { kp: 10.0, ki: 0.5, kd: 15.0 });
            for process in runs {
                let out = c.compute(process, setpoint);
                prop_assert!((0.0..=100.0).contains(&out), "output {out} out of range");
            }
        }

        #[test]
        fn output_is_finite(
            kp in 0.0f64..100.0,
            ki in 0.0f64..100.0,
            kd in 0.0f64..100.0,
            sp in -200.0f64..200.0,
            meas in -200.0f64..200.0,
        ) {
            let mut c = PidController::new(PidGains { kp, ki, kd });
            prop_assert!(c.compute(meas, sp).is_finite());
        }
    }
}
