//! Schedule compiler.
//!
//! Expands a mash schedule into a dense, timestamped sequence of
//! execution points the runner consumes. Ramps are interpolated into
//! sub-steps one step interval apart; holds become a single point; a
//! zero-ramp step that must reach temperature is promoted to a one
//! minute ramp and pushes every notification back by that minute.

use crate::schedule::{MashSchedule, Notification};

/// One compiled (time, target) point.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionStep {
    /// Absolute epoch seconds.
    pub time: i64,
    /// Target temperature in the configured scale.
    pub temperature: f32,
    /// Runner must not advance past this point until the target is reached.
    pub extend_if_needed: bool,
    /// Boost mode may engage while working toward this point.
    pub allow_boost: bool,
}

/// Compiler inputs besides the schedule itself.
#[derive(Debug, Clone, Copy)]
pub struct CompileParams {
    /// Run start (epoch seconds); the anchor step is emitted here.
    pub start: i64,
    /// Temperature at run start, used as the anchor and first ramp origin.
    pub current_temperature: f32,
    /// Spacing of interpolated ramp sub-steps, seconds.
    pub step_interval_secs: u32,
    /// Boost threshold percentage; non-zero collapses boosted ramps.
    pub boost_until_percent: u8,
}

/// Compiler output: execution points plus absolutely-timed notifications.
#[derive(Debug, Clone, Default)]
pub struct CompiledPlan {
    pub steps: Vec<ExecutionStep>,
    pub notifications: Vec<Notification>,
}

/// Expand `schedule` into execution points. Emitted step times are
/// strictly increasing; notification times are non-decreasing.
pub fn compile(schedule: &MashSchedule, params: &CompileParams) -> CompiledPlan {
    let interval = i64::from(params.step_interval_secs.max(1));

    let mut steps: Vec<ExecutionStep> = Vec::new();
    let mut prev_time = params.start;
    let mut prev_temp = params.current_temperature;

    // Seconds added to every notification by zero-ramp step promotion.
    let mut notification_shift: i64 = 0;

    steps.push(ExecutionStep {
        time: prev_time,
        temperature: prev_temp,
        extend_if_needed: false,
        allow_boost: false,
    });

    let push = |steps: &mut Vec<ExecutionStep>, step: ExecutionStep| {
        // Collapsed points (zero-length holds) would violate the
        // strictly-increasing invariant; drop them.
        if steps.last().map_or(true, |last| step.time > last.time) {
            steps.push(step);
        }
    };

    for mash_step in &schedule.steps {
        let boost = mash_step.allow_boost && params.boost_until_percent > 0;

        let ramp_secs = if mash_step.step_time == 0 && mash_step.extend_if_needed {
            // The target must still be reached; give the runner a
            // minute-long ramp to hang the overtime logic on and slide
            // the notifications accordingly.
            notification_shift += 60;
            60
        } else {
            i64::from(mash_step.step_time) * 60
        };

        if ramp_secs > 0 {
            let mut k = (ramp_secs / interval - 1).max(1);
            if boost {
                // Boost drives flat-out to the target; intermediate
                // setpoints would only fight it.
                k = 1;
            }
            let delta = (mash_step.temperature - prev_temp) / k as f32;

            let mut last_emitted = prev_temp;
            for j in 1..=k {
                let temperature = prev_temp + delta * j as f32;
                let is_last = j == k;
                if !is_last && (temperature - last_emitted).abs() <= 1.0 {
                    continue;
                }
                push(
                    &mut steps,
                    ExecutionStep {
                        time: prev_time + j * interval,
                        temperature,
                        extend_if_needed: is_last && mash_step.extend_if_needed,
                        allow_boost: mash_step.allow_boost,
                    },
                );
                last_emitted = temperature;
            }

            prev_time += ramp_secs;
        } else {
            // Instant step: head for the target ten seconds from now.
            push(
                &mut steps,
                ExecutionStep {
                    time: prev_time + 10,
                    temperature: mash_step.temperature,
                    extend_if_needed: false,
                    allow_boost: mash_step.allow_boost,
                },
            );
            prev_time += 10;
        }
        prev_temp = mash_step.temperature;

        // Hold point.
        prev_time += i64::from(mash_step.time) * 60;
        push(
            &mut steps,
            ExecutionStep {
                time: prev_time,
                temperature: mash_step.temperature,
                extend_if_needed: false,
                allow_boost: mash_step.allow_boost,
            },
        );
    }

    let mut notifications = schedule.notifications.clone();
    for n in &mut notifications {
        n.done = false;
        n.time_point = params.start + i64::from(n.time_from_start) * 60 + notification_shift;
        n.time_from_start += (notification_shift / 60) as u16;
    }
    notifications.sort_by_key(|n| n.time_point);

    CompiledPlan {
        steps,
        notifications,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::schedule::{MashSchedule, MashStep};
    use proptest::prelude::*;

    fn arb_step(index: u16) -> impl Strategy<Value = MashStep> {
        (20.0f32..105.0, 0u16..40, 0u16..90, any::<bool>(), any::<bool>()).prop_map(
            move |(temperature, step_time, time, extend, boost)| MashStep {
                index,
                name: format!("step {index}"),
                temperature,
                step_time,
                time,
                extend_if_needed: extend,
                allow_boost: boost,
            },
        )
    }

    proptest! {
        #[test]
        fn compiled_times_always_strictly_increase(
            steps in proptest::collection::vec(arb_step(0), 1..6),
            start in 0i64..2_000_000_000,
            current in 0.0f32..40.0,
            interval in 10u32..240,
            boost in 0u8..=100,
        ) {
            let mut schedule = MashSchedule {
                name: "prop".into(),
                boil: false,
                steps: steps
                    .into_iter()
                    .enumerate()
                    .map(|(i, mut s)| {
                        s.index = i as u16;
                        s
                    })
                    .collect(),
                notifications: vec![],
                temporary: false,
            };
            schedule.sort();
            let plan = compile(
                &schedule,
                &CompileParams {
                    start,
                    current_temperature: current,
                    step_interval_secs: interval,
                    boost_until_percent: boost,
                },
            );
            prop_assert!(!plan.steps.is_empty());
            for pair in plan.steps.windows(2) {
                prop_assert!(pair[1].time > pair[0].time);
            }
        }
    }
}
