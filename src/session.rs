//! Brew session recorder.
//!
//! Records one downsampled time series per brew run: each sample is a
//! timestamp, the average and target temperature squeezed into 8 bits,
//! and the PID duty. Stopping a session computes min/avg/max, persists
//! a fixed-layout record plus a sample blob keyed by session id, and
//! evicts the oldest sessions beyond the configured cap.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::settings::SettingsStore;

const SESSION_COUNT_KEY: &str = "stat_count";
const SESSION_NEXT_ID_KEY: &str = "stat_next_id";
const MAX_SESSIONS_KEY: &str = "stat_max";

pub const DEFAULT_MAX_SESSIONS: u8 = 10;

/// One recorded point. Temperatures are whole degrees in the
/// configured scale; resolution is traded for flash footprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSample {
    pub timestamp: i64,
    pub avg_temp: i8,
    pub target_temp: i8,
    pub pid_output: u8,
}

/// Fixed-layout per-session record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BrewSessionRecord {
    pub session_id: u32,
    pub schedule_name: String,
    pub start_time: i64,
    pub end_time: i64,
    pub data_points: u32,
    pub avg_temperature: f32,
    pub min_temperature: i8,
    pub max_temperature: i8,
    pub completed: bool,
}

struct ActiveSession {
    id: u32,
    schedule_name: String,
    start_time: i64,
    samples: Vec<SessionSample>,
}

pub struct SessionRecorder {
    active: Option<ActiveSession>,
}

fn session_key(id: u32) -> String {
    format!("session_{id}")
}

fn data_key(id: u32) -> String {
    format!("data_{id}")
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self { active: None }
    }

    /// Seed the max-sessions setting on first boot.
    pub fn init(&self, store: &SettingsStore) {
        let max = store.read_u8(MAX_SESSIONS_KEY, DEFAULT_MAX_SESSIONS);
        info!("session recorder: max {max} sessions");
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_session_id(&self) -> Option<u32> {
        self.active.as_ref().map(|a| a.id)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Begin a session. An already-active session is ended first so
    /// ids stay monotonic and nothing is lost.
    pub fn start(&mut self, store: &mut SettingsStore, schedule_name: &str, now: i64) -> u32 {
        if self.active.is_some() {
            warn!("session already active, ending it first");
            self.stop(store, now, false);
        }
        let id = next_session_id(store);
        self.active = Some(ActiveSession {
            id,
            schedule_name: schedule_name.to_string(),
            start_time: now,
            samples: Vec::new(),
        });
        info!("session {id} started for '{schedule_name}'");
        id
    }

    /// Append a sample to the running session; no-op when idle.
    pub fn add_sample(&mut self, timestamp: i64, avg_temp: f32, target_temp: f32, pid_output: u8) {
        if let Some(active) = self.active.as_mut() {
            active.samples.push(SessionSample {
                timestamp,
                avg_temp: clamp_i8(avg_temp),
                target_temp: clamp_i8(target_temp),
                pid_output: pid_output.min(100),
            });
        }
    }

    /// End the running session, persist it, and evict beyond the cap.
    pub fn stop(&mut self, store: &mut SettingsStore, now: i64, completed: bool) {
        let Some(active) = self.active.take() else {
            return;
        };

        let mut record = BrewSessionRecord {
            session_id: active.id,
            schedule_name: active.schedule_name,
            start_time: active.start_time,
            end_time: now,
            data_points: active.samples.len() as u32,
            avg_temperature: 0.0,
            min_temperature: 0,
            max_temperature: 0,
            completed,
        };
        compute_stats(&mut record, &active.samples);

        if let Err(e) = store.write_record(&session_key(record.session_id), &record) {
            warn!("persisting session {} failed ({e})", record.session_id);
        }
        if !active.samples.is_empty() {
            if let Err(e) = store.write_record(&data_key(record.session_id), &active.samples) {
                warn!("persisting session {} data failed ({e})", record.session_id);
            }
        }

        let count = store.read_u16(SESSION_COUNT_KEY, 0) + 1;
        store.write_u16(SESSION_COUNT_KEY, count);
        info!(
            "session {} ended: {} points over {} s",
            record.session_id,
            record.data_points,
            record.end_time - record.start_time
        );

        cleanup_old_sessions(store);
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn session_list(&self, store: &SettingsStore) -> Vec<BrewSessionRecord> {
        let next_id = store.read_u16(SESSION_NEXT_ID_KEY, 1) as u32;
        let mut sessions = Vec::new();
        for id in 1..next_id {
            if let Ok(bytes) = store.try_read_blob(&session_key(id)) {
                match postcard::from_bytes::<BrewSessionRecord>(&bytes) {
                    Ok(record) => sessions.push(record),
                    Err(_) => warn!("session {id} record corrupted, skipping"),
                }
            }
        }
        // Newest first for the UI.
        sessions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        sessions
    }

    pub fn session_by_id(&self, store: &SettingsStore, id: u32) -> Option<BrewSessionRecord> {
        let bytes = store.try_read_blob(&session_key(id)).ok()?;
        postcard::from_bytes(&bytes).ok()
    }

    pub fn session_data(&self, store: &SettingsStore, id: u32) -> Vec<SessionSample> {
        let Ok(bytes) = store.try_read_blob(&data_key(id)) else {
            return Vec::new();
        };
        postcard::from_bytes(&bytes).unwrap_or_default()
    }

    pub fn max_sessions(&self, store: &SettingsStore) -> u8 {
        store.read_u8(MAX_SESSIONS_KEY, DEFAULT_MAX_SESSIONS)
    }

    pub fn set_max_sessions(&self, store: &mut SettingsStore, max: u8) {
        let max = if max == 0 { DEFAULT_MAX_SESSIONS } else { max };
        store.write_u8(MAX_SESSIONS_KEY, max);
        cleanup_old_sessions(store);
    }

    // ── Exports ──────────────────────────────────────────────────────

    /// JSON export: session envelope plus per-sample objects.
    pub fn export_json(&self, store: &SettingsStore, id: u32) -> String {
        let Some(record) = self.session_by_id(store, id) else {
            return "{}".to_string();
        };
        let samples = self.session_data(store, id);

        let data: Vec<serde_json::Value> = samples
            .iter()
            .map(|s| {
                serde_json::json!({
                    "timestamp": s.timestamp,
                    "avgTemp": s.avg_temp,
                    "targetTemp": s.target_temp,
                    "pidOutput": s.pid_output,
                })
            })
            .collect();

        serde_json::json!({
            "sessionId": record.session_id,
            "scheduleName": record.schedule_name,
            "startTime": record.start_time,
            "endTime": record.end_time,
            "duration": record.end_time - record.start_time,
            "dataPoints": record.data_points,
            "avgTemperature": record.avg_temperature,
            "minTemperature": record.min_temperature,
            "maxTemperature": record.max_temperature,
            "completed": record.completed,
            "data": data,
        })
        .to_string()
    }

    /// CSV export with a header row.
    pub fn export_csv(&self, store: &SettingsStore, id: u32) -> String {
        let Some(record) = self.session_by_id(store, id) else {
            return String::new();
        };
        let samples = self.session_data(store, id);
        if samples.is_empty() {
            return String::new();
        }

        let mut csv = String::from("sessionId,scheduleName,timestamp,avgTemp,targetTemp,pidOutput\n");
        for s in &samples {
            csv.push_str(&format!(
                "{},\"{}\",{},{},{},{}\n",
                record.session_id,
                record.schedule_name,
                s.timestamp,
                s.avg_temp,
                s.target_temp,
                s.pid_output
            ));
        }
        csv
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

fn next_session_id(store: &mut SettingsStore) -> u32 {
    let id = store.read_u16(SESSION_NEXT_ID_KEY, 1);
    store.write_u16(SESSION_NEXT_ID_KEY, id.wrapping_add(1));
    id as u32
}

fn clamp_i8(v: f32) -> i8 {
    v.round().clamp(i8::MIN as f32, i8::MAX as f32) as i8
}

fn compute_stats(record: &mut BrewSessionRecord, samples: &[SessionSample]) {
    if samples.is_empty() {
        return;
    }
    let mut min = samples[0].avg_temp;
    let mut max = samples[0].avg_temp;
    let mut sum = 0.0f32;
    for s in samples {
        sum += f32::from(s.avg_temp);
        min = min.min(s.avg_temp);
        max = max.max(s.avg_temp);
    }
    record.avg_temperature = sum / samples.len() as f32;
    record.min_temperature = min;
    record.max_temperature = max;
}

/// Evict the oldest sessions beyond the cap.
fn cleanup_old_sessions(store: &mut SettingsStore) {
    let max = store.read_u8(MAX_SESSIONS_KEY, DEFAULT_MAX_SESSIONS) as u16;
    let count = store.read_u16(SESSION_COUNT_KEY, 0);
    if count <= max {
        return;
    }
    info!("session cleanup: {count} stored, cap {max}");

    let next_id = store.read_u16(SESSION_NEXT_ID_KEY, 1) as u32;
    let mut stored: Vec<(i64, u32)> = Vec::new();
    for id in 1..next_id {
        if let Ok(bytes) = store.try_read_blob(&session_key(id)) {
            if let Ok(record) = postcard::from_bytes::<BrewSessionRecord>(&bytes) {
                stored.push((record.start_time, id));
            }
        }
    }
    stored.sort();

    let excess = stored.len().saturating_sub(max as usize);
    for (_, id) in stored.into_iter().take(excess) {
        store.delete(&session_key(id));
        store.delete(&data_key(id));
        info!("evicted session {id}");
    }
    store.write_u16(SESSION_COUNT_KEY, max.min(count));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SettingsStore {
        SettingsStore::open_in_memory()
    }

    #[test]
    fn ids_are_monotonic() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        let a = rec.start(&mut s, "Default", 1000);
        rec.stop(&mut s, 1100, true);
        let b = rec.start(&mut s, "Default", 2000);
        rec.stop(&mut s, 2100, true);
        assert!(b > a);
    }

    #[test]
    fn samples_only_recorded_while_active() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        rec.add_sample(999, 60.0, 64.0, 50);
        let id = rec.start(&mut s, "Default", 1000);
        rec.add_sample(1000, 60.0, 64.0, 50);
        rec.stop(&mut s, 1100, true);
        assert_eq!(rec.session_data(&s, id).len(), 1);
    }

    #[test]
    fn stop_computes_stats_and_persists() {
        // Scenario: three samples, min 60, max 64, avg 62.
        let mut s = store();
        let mut rec = SessionRecorder::new();
        let id = rec.start(&mut s, "Default", 1000);
        rec.add_sample(1000, 60.0, 64.0, 50);
        rec.add_sample(1060, 62.0, 64.0, 60);
        rec.add_sample(1120, 64.0, 64.0, 40);
        rec.stop(&mut s, 1180, true);

        let record = rec.session_by_id(&s, id).unwrap();
        assert_eq!(record.min_temperature, 60);
        assert_eq!(record.max_temperature, 64);
        assert!((record.avg_temperature - 62.0).abs() < 1e-6);
        assert_eq!(record.data_points, 3);
        assert!(record.completed);
        assert_eq!(record.schedule_name, "Default");
    }

    #[test]
    fn json_export_matches_layout() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        let id = rec.start(&mut s, "Default", 1000);
        rec.add_sample(1000, 60.0, 64.0, 50);
        rec.add_sample(1060, 62.0, 64.0, 60);
        rec.add_sample(1120, 64.0, 64.0, 40);
        rec.stop(&mut s, 1180, true);

        let json: serde_json::Value =
            serde_json::from_str(&rec.export_json(&s, id)).unwrap();
        assert_eq!(json["minTemperature"], 60);
        assert_eq!(json["maxTemperature"], 64);
        assert_eq!(json["avgTemperature"], 62.0);
        assert_eq!(json["completed"], true);
        let data = json["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data[0]["timestamp"], 1000);
        assert_eq!(data[0]["pidOutput"], 50);
        assert_eq!(data[1]["avgTemp"], 62);
        assert_eq!(data[2]["targetTemp"], 64);
    }

    #[test]
    fn csv_export_has_header_and_rows() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        let id = rec.start(&mut s, "Default", 1000);
        rec.add_sample(1000, 60.0, 64.0, 50);
        rec.add_sample(1060, 62.0, 64.0, 60);
        rec.add_sample(1120, 64.0, 64.0, 40);
        rec.stop(&mut s, 1180, true);

        let csv = rec.export_csv(&s, id);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "sessionId,scheduleName,timestamp,avgTemp,targetTemp,pidOutput"
        );
        assert_eq!(lines[1], format!("{id},\"Default\",1000,60,64,50"));
        assert_eq!(lines[3], format!("{id},\"Default\",1120,64,64,40"));
    }

    #[test]
    fn export_of_unknown_session_is_empty() {
        let s = store();
        let rec = SessionRecorder::new();
        assert_eq!(rec.export_json(&s, 42), "{}");
        assert_eq!(rec.export_csv(&s, 42), "");
    }

    #[test]
    fn cap_evicts_oldest_sessions() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        rec.set_max_sessions(&mut s, 3);

        let mut ids = Vec::new();
        for i in 0..5 {
            let id = rec.start(&mut s, "Default", 1000 + i * 100);
            rec.add_sample(1000 + i * 100, 60.0, 64.0, 50);
            rec.stop(&mut s, 1050 + i * 100, true);
            ids.push(id);
        }

        let list = rec.session_list(&s);
        assert_eq!(list.len(), 3);
        // The two oldest are gone, data blobs included.
        assert!(rec.session_by_id(&s, ids[0]).is_none());
        assert!(rec.session_by_id(&s, ids[1]).is_none());
        assert!(rec.session_data(&s, ids[0]).is_empty());
        assert!(rec.session_by_id(&s, ids[4]).is_some());
    }

    #[test]
    fn list_is_newest_first() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        for i in 0..3 {
            rec.start(&mut s, "Default", 1000 + i * 100);
            rec.stop(&mut s, 1050 + i * 100, true);
        }
        let list = rec.session_list(&s);
        assert!(list[0].start_time > list[1].start_time);
        assert!(list[1].start_time > list[2].start_time);
    }

    #[test]
    fn starting_over_an_active_session_closes_it() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        let first = rec.start(&mut s, "Default", 1000);
        rec.add_sample(1000, 60.0, 64.0, 50);
        let second = rec.start(&mut s, "Rye Mash", 2000);
        assert_ne!(first, second);
        // First session was persisted as incomplete.
        let record = rec.session_by_id(&s, first).unwrap();
        assert!(!record.completed);
        assert_eq!(record.data_points, 1);
        rec.stop(&mut s, 2100, true);
    }

    #[test]
    fn temperatures_clamp_into_i8() {
        let mut s = store();
        let mut rec = SessionRecorder::new();
        let id = rec.start(&mut s, "Boil", 1000);
        rec.add_sample(1000, 212.0, 212.0, 100); // Fahrenheit boil
        rec.stop(&mut s, 1100, true);
        let data = rec.session_data(&s, id);
        assert_eq!(data[0].avg_temp, 127);
    }
}
