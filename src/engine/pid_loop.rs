//! PID / PWM cycle loop.
//!
//! Each cycle computes a duty percentage, distributes it across the
//! heater bank as wattage, and then subdivides the cycle into one
//! second PWM slots that set the per-heater burn flags. The `resetPid`
//! flag abandons the rest of a cycle so target changes take effect at
//! once.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use super::{rlock, wlock, BoostPhase, BrewEngine};
use crate::heaters::{self, MAX_HEATERS};
use crate::pid::PidController;

pub struct PidRunner {
    engine: Arc<BrewEngine>,
    pid: PidController,
    loop_secs: u16,
}

impl PidRunner {
    /// Select the gain set for the run kind at construction time.
    pub fn new(engine: Arc<BrewEngine>) -> Self {
        let gains = {
            let settings = rlock(&engine.pid_settings);
            if engine.state.boil_run.load(Ordering::Relaxed) {
                settings.boil
            } else {
                settings.mash
            }
        };
        let loop_secs = rlock(&engine.config).pid_loop_secs.max(1);
        Self {
            engine,
            pid: PidController::new(gains),
            loop_secs,
        }
    }

    pub fn loop_secs(&self) -> u16 {
        self.loop_secs
    }

    /// Start a cycle: run the controller, apply overrides, allocate
    /// wattage. Returns each heater's burn window in whole seconds,
    /// aligned with the heater bank order.
    pub fn begin_cycle(&mut self) -> Vec<u32> {
        let engine = &self.engine;
        let process = f64::from(engine.state.temperature.load());
        let setpoint = f64::from(engine.state.target_temperature.load());
        let pid_out = self.pid.compute(process, setpoint);

        // Precedence: manual override, then boost forcing, then PID.
        let duty = match engine.state.override_output() {
            Some(manual) => f64::from(manual),
            None => match engine.state.boost() {
                BoostPhase::Boost => 100.0,
                BoostPhase::Rest => 0.0,
                BoostPhase::Off => pid_out,
            },
        };
        engine.state.pid_output.store(duty as f32);
        log::debug!("pid cycle: process {process:.1} setpoint {setpoint:.1} duty {duty:.0}%");

        let mut bank = wlock(&engine.heaters);
        heaters::allocate(&mut bank, duty);
        bank.iter()
            .map(|h| {
                if h.enabled {
                    heaters::burn_seconds(h.burn_percent, self.loop_secs)
                } else {
                    0
                }
            })
            .collect()
    }

    /// Apply the PWM slot for second `second` of the cycle.
    pub fn cycle_tick(&self, second: u32, burn: &[u32]) {
        for (i, burn_secs) in burn.iter().enumerate().take(MAX_HEATERS) {
            self.engine.state.burn[i].store(second < *burn_secs, Ordering::Relaxed);
        }
    }

    /// Ask the pid controller to start fresh (used by tests that reuse
    /// a runner across simulated runs).
    pub fn reset(&mut self) {
        self.pid.reset();
    }

    /// Thread body: cycles until the brew ends.
    pub fn run(mut self) {
        let engine = self.engine.clone();
        while engine.state.run.load(Ordering::Relaxed)
            && engine.state.control_run.load(Ordering::Relaxed)
        {
            let burn = self.begin_cycle();
            for second in 0..u32::from(self.loop_secs) {
                if !engine.state.run.load(Ordering::Relaxed)
                    || !engine.state.control_run.load(Ordering::Relaxed)
                {
                    break;
                }
                std::thread::sleep(Duration::from_secs(1));
                self.cycle_tick(second, &burn);
                if engine.state.reset_pid.swap(false, Ordering::Relaxed) {
                    break;
                }
            }
        }
        for flag in &engine.state.burn {
            flag.store(false, Ordering::Relaxed);
        }
        log::info!("pid loop exiting");
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::engine::testutil::rig;
    use crate::heaters::Heater;

    fn two_heaters() -> Vec<Heater> {
        vec![
            Heater {
                id: 1,
                name: "Heater 1".into(),
                pin: 25,
                preference: 1,
                watt: 2000,
                use_for_mash: true,
                use_for_boil: true,
                enabled: true,
                burn_percent: 0,
            },
            Heater {
                id: 2,
                name: "Heater 2".into(),
                pin: 26,
                preference: 2,
                watt: 1000,
                use_for_mash: true,
                use_for_boil: true,
                enabled: true,
                burn_percent: 0,
            },
        ]
    }

    #[test]
    fn manual_override_wins_over_pid() {
        let r = rig();
        *wlock(&r.engine.heaters) = two_heaters();
        r.engine.start(None).unwrap();
        r.engine.state.set_override_output(Some(65));
        r.engine.state.temperature.store(20.0);
        r.engine.state.target_temperature.store(64.0);

        let mut runner = PidRunner::new(r.engine.clone());
        let burn = runner.begin_cycle();
        assert_eq!(r.engine.state.pid_output.load(), 65.0);
        // 65 % of 3000 W: heater 1 at 97 % (58 s of 60), heater 2 off.
        assert_eq!(burn, vec![58, 0]);
    }

    #[test]
    fn boost_forces_full_duty_and_rest_forces_zero() {
        let r = rig();
        *wlock(&r.engine.heaters) = two_heaters();
        r.engine.start(None).unwrap();
        r.engine.state.temperature.store(50.0);
        r.engine.state.target_temperature.store(64.0);

        let mut runner = PidRunner::new(r.engine.clone());
        r.engine.state.set_boost(BoostPhase::Boost);
        let burn = runner.begin_cycle();
        assert_eq!(r.engine.state.pid_output.load(), 100.0);
        assert_eq!(burn, vec![60, 60]);

        r.engine.state.set_boost(BoostPhase::Rest);
        let burn = runner.begin_cycle();
        assert_eq!(r.engine.state.pid_output.load(), 0.0);
        assert_eq!(burn, vec![0, 0]);
    }

    #[test]
    fn burn_flags_follow_pwm_schedule() {
        let r = rig();
        *wlock(&r.engine.heaters) = two_heaters();
        r.engine.start(None).unwrap();
        r.engine.state.set_override_output(Some(65));

        let mut runner = PidRunner::new(r.engine.clone());
        let burn = runner.begin_cycle();

        // Count seconds each flag stays on across the full cycle.
        let mut on_secs = [0u32; 2];
        for second in 0..60 {
            runner.cycle_tick(second, &burn);
            for (i, counter) in on_secs.iter_mut().enumerate() {
                if r.engine.state.burn[i].load(Ordering::Relaxed) {
                    *counter += 1;
                }
            }
        }
        assert_eq!(on_secs, [58, 0]);
    }

    #[test]
    fn disabled_heater_never_burns() {
        let r = rig();
        let mut bank = two_heaters();
        bank[0].use_for_mash = false;
        *wlock(&r.engine.heaters) = bank;
        r.engine.start(None).unwrap(); // mash run arms use_for_mash only

        let mut runner = PidRunner::new(r.engine.clone());
        r.engine.state.set_override_output(Some(100));
        let burn = runner.begin_cycle();
        assert_eq!(burn[0], 0);
        assert_eq!(burn[1], 60);
    }

    #[test]
    fn boil_run_selects_boil_gains() {
        let r = rig();
        {
            let mut settings = wlock(&r.engine.pid_settings);
            settings.mash.kp = 1.0;
            settings.mash.ki = 0.0;
            settings.mash.kd = 0.0;
            settings.boil.kp = 2.0;
            settings.boil.ki = 0.0;
            settings.boil.kd = 0.0;
        }
        r.engine.state.boil_run.store(true, Ordering::Relaxed);
        r.engine.state.temperature.store(90.0);
        r.engine.state.target_temperature.store(100.0);
        *wlock(&r.engine.heaters) = two_heaters();
        heaters::arm_for_run(&mut wlock(&r.engine.heaters), true);

        let mut runner = PidRunner::new(r.engine.clone());
        runner.begin_cycle();
        // Boil kp=2 over a 10 degree error: 20 % duty.
        assert_eq!(r.engine.state.pid_output.load(), 20.0);
    }
}
