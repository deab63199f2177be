//! Schedule runner.
//!
//! A once-per-second state machine that walks the compiled plan:
//! publishes the current target, advances past due steps, stretches
//! steps marked extend-if-unreached into overtime (sliding the rest of
//! the plan when the target is finally met), drives the boost ladder,
//! and fires notifications.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::info;

use super::{lock, rlock, BoostPhase, BrewEngine};
use crate::compiler::CompiledPlan;

pub struct ControlRunner {
    engine: Arc<BrewEngine>,
    /// Temperature at the previous tick, for the Rest→Off transition.
    prev_sample_temp: f32,
    /// One boost cycle per step.
    boost_spent: bool,
}

impl ControlRunner {
    pub fn new(engine: Arc<BrewEngine>) -> Self {
        Self {
            engine,
            prev_sample_temp: f32::NAN,
            boost_spent: false,
        }
    }

    pub fn tick(&mut self) {
        let engine = self.engine.clone();
        if !engine.state.control_run.load(Ordering::Relaxed) {
            return;
        }
        let now = engine.clock.now();
        let current = engine.state.temperature.load();
        let (margin, boost_percent) = {
            let config = rlock(&engine.config);
            (config.temp_margin, config.boost_until_percent)
        };

        let mut plan_guard = lock(&engine.plan);
        let Some(plan) = plan_guard.as_mut() else {
            return;
        };

        let idx = engine.state.current_step.load(Ordering::Relaxed);
        if idx >= plan.steps.len() {
            drop(plan_guard);
            info!("schedule finished");
            engine.stop();
            return;
        }
        let step = plan.steps[idx].clone();

        // The scheduled target, unless a manual override replaces it.
        let target = engine.state.override_target().unwrap_or(step.temperature);
        engine.state.target_temperature.store(target);

        // ── Boost ladder ─────────────────────────────────────────
        if boost_percent > 0 && step.allow_boost {
            let threshold = step.temperature * f32::from(boost_percent) / 100.0;
            match engine.state.boost() {
                BoostPhase::Off => {
                    if !self.boost_spent && current < threshold {
                        info!("boost engaged below {threshold:.1}");
                        engine.state.set_boost(BoostPhase::Boost);
                    }
                }
                BoostPhase::Boost => {
                    if current >= threshold {
                        info!("boost threshold reached, resting");
                        engine.state.set_boost(BoostPhase::Rest);
                        self.boost_spent = true;
                    }
                }
                BoostPhase::Rest => {
                    if !self.prev_sample_temp.is_nan() && current < self.prev_sample_temp {
                        info!("temperature peaked, boost off");
                        engine.state.set_boost(BoostPhase::Off);
                        engine.state.reset_pid.store(true, Ordering::Relaxed);
                    }
                }
            }
        } else if engine.state.boost() != BoostPhase::Off {
            engine.state.set_boost(BoostPhase::Off);
        }
        self.prev_sample_temp = current;

        // ── Step advance / overtime ──────────────────────────────
        let mut advance = false;
        if now >= step.time {
            let in_overtime = engine.state.in_overtime.load(Ordering::Relaxed);
            if step.extend_if_needed && !in_overtime && (target - current) >= margin {
                info!("overtime start: {current:.1} of {target:.1}");
                engine.state.in_overtime.store(true, Ordering::Relaxed);
            } else if in_overtime && (target - current) <= margin {
                info!("overtime done");
                engine.state.in_overtime.store(false, Ordering::Relaxed);
                recalculate_after_overtime(plan, idx, now);
                engine.state.running_version.fetch_add(1, Ordering::Relaxed);
                advance = true;
            } else if !in_overtime {
                advance = true;
            }
            // Still in overtime: hold the target until the gap closes.
        }

        if advance {
            engine.state.current_step.store(idx + 1, Ordering::Relaxed);
            engine.state.clear_overrides();
            engine.state.reset_pid.store(true, Ordering::Relaxed);
            self.boost_spent = false;
        }

        // ── Notifications ────────────────────────────────────────
        if !engine.state.in_overtime.load(Ordering::Relaxed) {
            let mut fire_buzzer = false;
            for notification in plan.notifications.iter_mut() {
                if !notification.done && now > notification.time_point {
                    notification.done = true;
                    info!("notification fired: {}", notification.name);
                    if notification.buzzer {
                        fire_buzzer = true;
                    }
                }
            }
            drop(plan_guard);
            if fire_buzzer {
                engine.pulse_buzzer();
            }
        }
    }

    /// Thread body for the duration of a brew.
    pub fn run(mut self) {
        let engine = self.engine.clone();
        while engine.state.run.load(Ordering::Relaxed)
            && engine.state.control_run.load(Ordering::Relaxed)
        {
            std::thread::sleep(Duration::from_secs(1));
            self.tick();
        }
        info!("control loop exiting");
    }
}

/// Slide every remaining step and pending notification forward by the
/// time spent past the stretched step's planned end.
fn recalculate_after_overtime(plan: &mut CompiledPlan, current_idx: usize, now: i64) {
    let planned_end = plan.steps[current_idx].time;
    let excess = now - planned_end;
    if excess <= 0 {
        return;
    }
    info!("sliding schedule by {excess} s after overtime");
    for step in plan.steps[current_idx..].iter_mut() {
        step.time += excess;
    }
    for notification in plan.notifications.iter_mut() {
        if !notification.done {
            notification.time_point += excess;
            notification.time_from_start += (excess / 60) as u16;
        }
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::compiler::ExecutionStep;
    use crate::engine::testutil::{rig, EngineRig};
    use crate::engine::wlock;
    use crate::schedule::Notification;

    /// Install a hand-built plan and mark the engine running.
    fn install_plan(r: &EngineRig, steps: Vec<ExecutionStep>, notifications: Vec<Notification>) {
        r.engine.start(None).unwrap();
        *lock(&r.engine.plan) = Some(CompiledPlan {
            steps,
            notifications,
        });
    }

    fn step(time: i64, temperature: f32, extend: bool, boost: bool) -> ExecutionStep {
        ExecutionStep {
            time,
            temperature,
            extend_if_needed: extend,
            allow_boost: boost,
        }
    }

    #[test]
    fn publishes_target_and_advances_on_time() {
        let r = rig();
        let t0 = r.clock.now();
        install_plan(
            &r,
            vec![step(t0, 20.0, false, false), step(t0 + 60, 30.0, false, false)],
            vec![],
        );
        let mut runner = ControlRunner::new(r.engine.clone());

        runner.tick();
        // Anchor step is due immediately: target published, advanced.
        assert_eq!(r.engine.state.target_temperature.load(), 20.0);
        assert_eq!(r.engine.state.current_step.load(Ordering::Relaxed), 1);
        assert!(r.engine.state.reset_pid.load(Ordering::Relaxed));

        r.engine.state.reset_pid.store(false, Ordering::Relaxed);
        runner.tick();
        // Next step not yet due: target tracks it, no advance.
        assert_eq!(r.engine.state.target_temperature.load(), 30.0);
        assert_eq!(r.engine.state.current_step.load(Ordering::Relaxed), 1);

        r.clock.advance(60);
        runner.tick();
        assert_eq!(r.engine.state.current_step.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn overtime_stretches_and_slides_schedule() {
        // Scenario: margin 1 C, ramp end at 64 C reached only to 62 C.
        let r = rig();
        let t0 = r.clock.now();
        install_plan(
            &r,
            vec![
                step(t0 + 10, 64.0, true, false),
                step(t0 + 100, 64.0, false, false),
                step(t0 + 200, 72.0, false, false),
            ],
            vec![Notification {
                name: "Sparge".into(),
                message: String::new(),
                time_from_start: 5,
                buzzer: false,
                done: false,
                time_point: t0 + 300,
            }],
        );
        r.engine.state.temperature.store(62.0);
        let mut runner = ControlRunner::new(r.engine.clone());

        r.clock.advance(10);
        runner.tick();
        assert!(r.engine.state.in_overtime.load(Ordering::Relaxed));
        assert_eq!(r.engine.state.current_step.load(Ordering::Relaxed), 0);

        // Still short of target - margin: stays in overtime.
        r.clock.advance(30);
        r.engine.state.temperature.store(62.5);
        runner.tick();
        assert!(r.engine.state.in_overtime.load(Ordering::Relaxed));

        // Reaches target - margin: exits, slides everything by the excess.
        r.clock.advance(20);
        r.engine.state.temperature.store(63.0);
        let version_before = r.engine.state.running_version.load(Ordering::Relaxed);
        runner.tick();
        assert!(!r.engine.state.in_overtime.load(Ordering::Relaxed));
        assert_eq!(r.engine.state.current_step.load(Ordering::Relaxed), 1);
        assert!(r.engine.state.running_version.load(Ordering::Relaxed) > version_before);

        let excess = (t0 + 60) - (t0 + 10); // 50 s past the planned end
        let plan_guard = lock(&r.engine.plan);
        let plan = plan_guard.as_ref().unwrap();
        assert_eq!(plan.steps[1].time, t0 + 100 + excess);
        assert_eq!(plan.steps[2].time, t0 + 200 + excess);
        assert_eq!(plan.notifications[0].time_point, t0 + 300 + excess);
    }

    #[test]
    fn extend_step_with_target_reached_advances_directly() {
        let r = rig();
        let t0 = r.clock.now();
        install_plan(&r, vec![step(t0, 64.0, true, false)], vec![]);
        r.engine.state.temperature.store(63.5); // within the 1 C margin
        let mut runner = ControlRunner::new(r.engine.clone());
        runner.tick();
        assert!(!r.engine.state.in_overtime.load(Ordering::Relaxed));
        assert_eq!(r.engine.state.current_step.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn boost_ladder_full_cycle() {
        // Scenario: target 64, boost until 90 % -> threshold 57.6.
        let r = rig();
        wlock(&r.engine.config).boost_until_percent = 90;
        let t0 = r.clock.now();
        install_plan(&r, vec![step(t0 + 600, 64.0, true, true)], vec![]);
        let mut runner = ControlRunner::new(r.engine.clone());

        r.engine.state.temperature.store(50.0);
        runner.tick();
        assert_eq!(r.engine.state.boost(), BoostPhase::Boost);

        // Rising but below threshold: stays in boost.
        r.engine.state.temperature.store(57.5);
        runner.tick();
        assert_eq!(r.engine.state.boost(), BoostPhase::Boost);

        r.engine.state.temperature.store(57.6);
        runner.tick();
        assert_eq!(r.engine.state.boost(), BoostPhase::Rest);

        // Coasting upward: still resting.
        r.engine.state.temperature.store(59.0);
        runner.tick();
        assert_eq!(r.engine.state.boost(), BoostPhase::Rest);

        // First decline: boost cycle over, PID takes it from here.
        r.engine.state.reset_pid.store(false, Ordering::Relaxed);
        r.engine.state.temperature.store(58.8);
        runner.tick();
        assert_eq!(r.engine.state.boost(), BoostPhase::Off);
        assert!(r.engine.state.reset_pid.load(Ordering::Relaxed));

        // Spent: does not re-engage below threshold within the step.
        r.engine.state.temperature.store(56.0);
        runner.tick();
        assert_eq!(r.engine.state.boost(), BoostPhase::Off);
    }

    #[test]
    fn notifications_fire_once_with_buzzer() {
        let r = rig();
        wlock(&r.engine.config).buzzer_pin = 26;
        let t0 = r.clock.now();
        install_plan(
            &r,
            vec![step(t0 + 600, 64.0, false, false)],
            vec![Notification {
                name: "Add Grains".into(),
                message: "Dough-in".into(),
                time_from_start: 1,
                buzzer: true,
                done: false,
                time_point: t0 + 60,
            }],
        );
        let mut runner = ControlRunner::new(r.engine.clone());

        runner.tick();
        assert_eq!(r.engine.state.buzzer_until.load(Ordering::Relaxed), 0);

        r.clock.advance(61);
        runner.tick();
        {
            let plan_guard = lock(&r.engine.plan);
            assert!(plan_guard.as_ref().unwrap().notifications[0].done);
        }
        let until = r.engine.state.buzzer_until.load(Ordering::Relaxed);
        assert!(until > 0);

        // Second tick: already done, no re-fire.
        r.engine.state.buzzer_until.store(0, Ordering::Relaxed);
        runner.tick();
        assert_eq!(r.engine.state.buzzer_until.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn notifications_wait_during_overtime() {
        let r = rig();
        let t0 = r.clock.now();
        install_plan(
            &r,
            vec![step(t0 + 10, 64.0, true, false)],
            vec![Notification {
                name: "Check".into(),
                message: String::new(),
                time_from_start: 1,
                buzzer: false,
                done: false,
                time_point: t0 + 30,
            }],
        );
        r.engine.state.temperature.store(50.0);
        let mut runner = ControlRunner::new(r.engine.clone());

        r.clock.advance(40);
        runner.tick(); // enters overtime at t0+40, notification due but held
        assert!(r.engine.state.in_overtime.load(Ordering::Relaxed));
        {
            let plan_guard = lock(&r.engine.plan);
            assert!(!plan_guard.as_ref().unwrap().notifications[0].done);
        }

        // Target reached: overtime exits and slides the notification
        // beyond now, so it fires later rather than immediately.
        r.engine.state.temperature.store(64.0);
        runner.tick();
        let plan_time = {
            let plan_guard = lock(&r.engine.plan);
            plan_guard.as_ref().unwrap().notifications[0].time_point
        };
        assert!(plan_time > r.clock.now());
    }

    #[test]
    fn manual_overrides_clear_on_step_advance() {
        let r = rig();
        let t0 = r.clock.now();
        install_plan(
            &r,
            vec![step(t0 + 30, 64.0, false, false), step(t0 + 600, 72.0, false, false)],
            vec![],
        );
        let mut runner = ControlRunner::new(r.engine.clone());
        r.engine.state.set_override_target(Some(70.0));
        r.engine.state.set_override_output(Some(55));

        runner.tick();
        // Override target wins while the step is pending.
        assert_eq!(r.engine.state.target_temperature.load(), 70.0);

        r.clock.advance(31);
        runner.tick();
        assert_eq!(r.engine.state.override_target(), None);
        assert_eq!(r.engine.state.override_output(), None);
    }

    #[test]
    fn exhausted_plan_stops_the_run() {
        let r = rig();
        let t0 = r.clock.now();
        install_plan(&r, vec![step(t0, 64.0, false, false)], vec![]);
        let mut runner = ControlRunner::new(r.engine.clone());

        runner.tick(); // advances past the only step
        runner.tick(); // notices exhaustion and stops
        assert_eq!(r.engine.state.status_text(), "Idle");

        let store = lock(&r.engine.settings);
        let sessions = lock(&r.engine.recorder).session_list(&store);
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].completed);
    }
}
