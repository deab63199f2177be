//! Heater set and duty allocation.
//!
//! Heaters form an ordered preference list. Each PID cycle the duty
//! percentage is converted to watts and poured into the heaters in
//! preference order, saturating each before spilling into the next;
//! the per-heater allocation becomes a burn percentage that the PWM
//! subdivision turns into whole seconds of on-time.

use serde::{Deserialize, Serialize};

use crate::settings::SettingsStore;

pub const HEATERS_KEY: &str = "heaters";
pub const MAX_HEATERS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heater {
    /// 1-based heater id.
    pub id: u8,
    pub name: String,
    #[serde(rename = "pinNr")]
    pub pin: i32,
    /// Allocation order; lower fills first.
    pub preference: u8,
    pub watt: u16,
    #[serde(default = "default_true")]
    pub use_for_mash: bool,
    #[serde(default = "default_true")]
    pub use_for_boil: bool,
    /// Participates in the current run (derived from mash/boil mode).
    #[serde(skip)]
    pub enabled: bool,
    /// Burn window for the current PID cycle, percent of the cycle.
    #[serde(skip)]
    pub burn_percent: u8,
}

fn default_true() -> bool {
    true
}

impl Heater {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.id == 0 || self.id as usize > MAX_HEATERS {
            return Err("heater id must be 1-10");
        }
        if self.watt == 0 {
            return Err("heater wattage must be non-zero");
        }
        Ok(())
    }
}

/// Load the heater list; kept sorted by preference at all times.
pub fn load_heaters(store: &SettingsStore) -> Vec<Heater> {
    let mut heaters: Vec<Heater> = store.read_record(HEATERS_KEY, default_heaters());
    sort_heaters(&mut heaters);
    heaters
}

pub fn save_heaters(store: &mut SettingsStore, heaters: &[Heater]) {
    if let Err(e) = store.write_record(HEATERS_KEY, &heaters) {
        log::warn!("saving heaters failed ({e})");
    }
}

pub fn sort_heaters(heaters: &mut [Heater]) {
    heaters.sort_by_key(|h| h.preference);
}

fn default_heaters() -> Vec<Heater> {
    vec![Heater {
        id: 1,
        name: "Heater 1".into(),
        pin: 25,
        preference: 1,
        watt: 2000,
        use_for_mash: true,
        use_for_boil: true,
        enabled: false,
        burn_percent: 0,
    }]
}

/// Mark heaters enabled for the run kind and clear burn windows.
pub fn arm_for_run(heaters: &mut [Heater], boil: bool) {
    for h in heaters.iter_mut() {
        h.enabled = if boil { h.use_for_boil } else { h.use_for_mash };
        h.burn_percent = 0;
    }
}

/// Total wattage of the heaters armed for this run.
pub fn total_wattage(heaters: &[Heater]) -> u32 {
    heaters
        .iter()
        .filter(|h| h.enabled)
        .map(|h| u32::from(h.watt))
        .sum()
}

/// Distribute `duty_percent` of the total wattage across the enabled
/// heaters in preference order, saturating each in turn. Writes each
/// heater's `burn_percent`; returns the wattage actually allocated.
pub fn allocate(heaters: &mut [Heater], duty_percent: f64) -> f64 {
    let total = total_wattage(heaters) as f64;
    let mut remaining = total * duty_percent.clamp(0.0, 100.0) / 100.0;
    let mut allocated = 0.0;

    for h in heaters.iter_mut() {
        if !h.enabled {
            h.burn_percent = 0;
            continue;
        }
        if remaining <= 0.0 {
            h.burn_percent = 0;
            continue;
        }
        let take = remaining.min(f64::from(h.watt));
        h.burn_percent = (take * 100.0 / f64::from(h.watt)) as u8;
        allocated += take;
        remaining -= take;
    }
    allocated
}

/// Seconds of on-time within a cycle for a given burn percentage.
pub fn burn_seconds(burn_percent: u8, pid_loop_secs: u16) -> u32 {
    (u32::from(burn_percent) * u32::from(pid_loop_secs) + 50) / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heater(id: u8, preference: u8, watt: u16) -> Heater {
        Heater {
            id,
            name: format!("Heater {id}"),
            pin: 20 + i32::from(id),
            preference,
            watt,
            use_for_mash: true,
            use_for_boil: true,
            enabled: true,
            burn_percent: 0,
        }
    }

    #[test]
    fn duty_distribution_two_heaters() {
        // Scenario: 2000 W + 1000 W, duty 65 %, 60 s cycle.
        let mut heaters = vec![heater(1, 1, 2000), heater(2, 2, 1000)];
        let allocated = allocate(&mut heaters, 65.0);
        assert_eq!(allocated, 1950.0);
        assert_eq!(heaters[0].burn_percent, 97);
        assert_eq!(heaters[1].burn_percent, 0);
        assert_eq!(burn_seconds(heaters[0].burn_percent, 60), 58);
        assert_eq!(burn_seconds(heaters[1].burn_percent, 60), 0);
    }

    #[test]
    fn full_duty_saturates_every_heater() {
        let mut heaters = vec![heater(1, 1, 2000), heater(2, 2, 1000)];
        let allocated = allocate(&mut heaters, 100.0);
        assert_eq!(allocated, 3000.0);
        assert_eq!(heaters[0].burn_percent, 100);
        assert_eq!(heaters[1].burn_percent, 100);
    }

    #[test]
    fn zero_duty_burns_nothing() {
        let mut heaters = vec![heater(1, 1, 2000), heater(2, 2, 1000)];
        assert_eq!(allocate(&mut heaters, 0.0), 0.0);
        assert!(heaters.iter().all(|h| h.burn_percent == 0));
    }

    #[test]
    fn spill_over_fills_second_heater() {
        let mut heaters = vec![heater(1, 1, 1000), heater(2, 2, 2000)];
        // 80 % of 3000 W = 2400 W: first takes 1000, second 1400 (70 %).
        allocate(&mut heaters, 80.0);
        assert_eq!(heaters[0].burn_percent, 100);
        assert_eq!(heaters[1].burn_percent, 70);
    }

    #[test]
    fn disabled_heaters_are_skipped() {
        let mut heaters = vec![heater(1, 1, 2000), heater(2, 2, 1000)];
        heaters[0].use_for_boil = false;
        arm_for_run(&mut heaters, true);
        assert!(!heaters[0].enabled);
        // Total is now just the 1000 W unit; half duty = 500 W = 50 %.
        allocate(&mut heaters, 50.0);
        assert_eq!(heaters[0].burn_percent, 0);
        assert_eq!(heaters[1].burn_percent, 50);
    }

    #[test]
    fn preference_order_wins_over_id() {
        let mut heaters = vec![heater(1, 2, 1000), heater(2, 1, 1000)];
        sort_heaters(&mut heaters);
        assert_eq!(heaters[0].id, 2);
        // 25 % of 2000 W = 500 W goes entirely to the preferred heater.
        allocate(&mut heaters, 25.0);
        assert_eq!(heaters[0].burn_percent, 50);
        assert_eq!(heaters[1].burn_percent, 0);
    }

    #[test]
    fn burn_seconds_rounds_to_nearest() {
        assert_eq!(burn_seconds(97, 60), 58); // 58.2
        assert_eq!(burn_seconds(50, 60), 30);
        assert_eq!(burn_seconds(99, 60), 59); // 59.4
        assert_eq!(burn_seconds(1, 60), 1); // 0.6 rounds up
        assert_eq!(burn_seconds(100, 60), 60);
        assert_eq!(burn_seconds(0, 60), 0);
    }

    #[test]
    fn list_round_trips_through_store() {
        let mut store = SettingsStore::open_in_memory();
        let mut heaters = vec![heater(2, 2, 1500), heater(1, 1, 2000)];
        sort_heaters(&mut heaters);
        save_heaters(&mut store, &heaters);
        let loaded = load_heaters(&store);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, 1);
        assert_eq!(loaded[1].watt, 1500);
    }

    #[test]
    fn validate_rejects_bad_ids() {
        let mut h = heater(0, 1, 2000);
        assert!(h.validate().is_err());
        h.id = 11;
        assert!(h.validate().is_err());
        h.id = 10;
        assert!(h.validate().is_ok());
    }
}
