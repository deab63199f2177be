//! Mash and boil schedules.
//!
//! A schedule is a named, ordered list of steps (ramp + hold) plus
//! time-anchored notifications. Schedules are edited as JSON by the UI
//! and persisted as one postcard blob under `mashschedules`; schedules
//! marked temporary exist only for the current run and are never
//! persisted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::TemperatureScale;
use crate::settings::SettingsStore;

pub const SCHEDULES_KEY: &str = "mashschedules";

/// One mash step: ramp to `temperature` over `step_time` minutes, then
/// hold for `time` minutes. Field names match the UI wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MashStep {
    pub index: u16,
    pub name: String,
    /// Target temperature in the configured scale.
    pub temperature: f32,
    /// Ramp duration in minutes.
    #[serde(rename = "stepTime")]
    pub step_time: u16,
    /// Hold duration in minutes.
    #[serde(rename = "time")]
    pub time: u16,
    /// Stretch the step until the target is actually reached.
    #[serde(rename = "extendStepTimeIfNeeded")]
    pub extend_if_needed: bool,
    /// Allow full-power boost while far below target.
    #[serde(default)]
    pub allow_boost: bool,
}

/// A reminder anchored to minutes from run start ("Add Grains").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub name: String,
    #[serde(default)]
    pub message: String,
    /// Minutes from the start of the run.
    #[serde(rename = "timeFromStart")]
    pub time_from_start: u16,
    /// Pulse the buzzer when fired.
    #[serde(default)]
    pub buzzer: bool,
    /// Set once fired during the current run.
    #[serde(skip)]
    pub done: bool,
    /// Absolute epoch seconds, filled in by the compiler.
    #[serde(skip)]
    pub time_point: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MashSchedule {
    pub name: String,
    #[serde(default, rename = "isBoil")]
    pub boil: bool,
    pub steps: Vec<MashStep>,
    #[serde(default)]
    pub notifications: Vec<Notification>,
    /// Run-only schedule, never persisted.
    #[serde(default)]
    pub temporary: bool,
}

impl MashSchedule {
    /// Steps sorted by index, notifications by time from start. Called
    /// after any mutation so the compiler can rely on ordering.
    pub fn sort(&mut self) {
        self.steps.sort_by_key(|s| s.index);
        self.notifications.sort_by_key(|n| n.time_from_start);
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name.is_empty() {
            return Err("schedule name must not be empty");
        }
        if self.steps.is_empty() {
            return Err("schedule must have at least one step");
        }
        Ok(())
    }
}

/// All schedules by name. Only non-temporary entries are persisted.
pub fn load_schedules(store: &SettingsStore, scale: TemperatureScale) -> BTreeMap<String, MashSchedule> {
    let stored: Vec<MashSchedule> = store.read_record(SCHEDULES_KEY, Vec::new());
    let mut map = BTreeMap::new();
    if stored.is_empty() {
        log::info!("no stored schedules, seeding defaults");
        for schedule in default_schedules(scale) {
            map.insert(schedule.name.clone(), schedule);
        }
    } else {
        for mut schedule in stored {
            schedule.sort();
            map.insert(schedule.name.clone(), schedule);
        }
    }
    map
}

pub fn save_schedules(store: &mut SettingsStore, schedules: &BTreeMap<String, MashSchedule>) {
    let persistable: Vec<&MashSchedule> = schedules.values().filter(|s| !s.temporary).collect();
    if let Err(e) = store.write_record(SCHEDULES_KEY, &persistable) {
        log::warn!("saving schedules failed ({e})");
    }
}

/// The factory schedule set. Step targets are authored in Celsius and
/// converted when the controller runs in Fahrenheit.
pub fn default_schedules(scale: TemperatureScale) -> Vec<MashSchedule> {
    let t = |celsius: f32| scale.from_celsius(celsius);

    let step = |index: u16, name: &str, temp: f32, ramp: u16, hold: u16| MashStep {
        index,
        name: name.to_string(),
        temperature: t(temp),
        step_time: ramp,
        time: hold,
        extend_if_needed: true,
        allow_boost: index == 0,
    };

    let note = |name: &str, message: &str, minutes: u16, buzzer: bool| Notification {
        name: name.to_string(),
        message: message.to_string(),
        time_from_start: minutes,
        buzzer,
        done: false,
        time_point: 0,
    };

    let mut default_mash = MashSchedule {
        name: "Default".into(),
        boil: false,
        steps: vec![
            step(0, "Beta Amylase", 64.0, 15, 45),
            step(1, "Alpha Amylase", 72.0, 5, 20),
            step(2, "Mash Out", 78.0, 5, 5),
        ],
        notifications: vec![
            note("Add Grains", "Dough-in now", 5, true),
            note("Start Sparge", "Prepare sparge water", 85, true),
        ],
        temporary: false,
    };
    default_mash.sort();

    let mut rye_mash = MashSchedule {
        name: "Rye Mash".into(),
        boil: false,
        steps: vec![
            step(0, "Beta Glucanase", 43.0, 0, 20),
            step(1, "Beta Amylase", 64.0, 5, 45),
            step(2, "Alpha Amylase", 72.0, 5, 20),
            step(3, "Mash Out", 78.0, 5, 5),
        ],
        notifications: vec![note("Add Grains", "Dough-in now", 5, true)],
        temporary: false,
    };
    rye_mash.sort();

    let mut boil = MashSchedule {
        name: "Boil 60".into(),
        boil: true,
        steps: vec![MashStep {
            index: 0,
            name: "Boil".into(),
            temperature: t(100.0),
            step_time: 20,
            time: 60,
            extend_if_needed: true,
            allow_boost: true,
        }],
        notifications: vec![
            note("Bittering Hops", "Add bittering hops", 20, true),
            note("Aroma Hops", "Add aroma hops", 65, true),
            note("Flameout", "Boil complete", 80, true),
        ],
        temporary: false,
    };
    boil.sort();

    vec![default_mash, rye_mash, boil]
}
