//! Session recorder (spec.md §4.8): owns the idle/active lifecycle,
//! accumulates per-rep metrics, and writes an append-only raw log plus an
//! atomically-written summary on stop.

use crate::config::Thresholds;
use crate::error::PipelineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const SUMMARY_SCHEMA_VERSION: u32 = 9;
const TUT_TICK_CAP_SECS: f64 = 0.5;
const MAX_TEMPO_SECS: f64 = 20.0;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RepBreakdownEntry {
    pub rep: u32,
    pub t: f64,
    pub tempo_sec: Option<f64>,
    pub peak_gyro: f64,
    pub peak_speed_proxy: f64,
    pub peak_velocity_ms: f64,
    pub rom_m: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSummary {
    pub version: u32,
    pub session_id: String,
    pub start_time: String,
    pub end_time: String,
    pub duration_sec: f64,
    pub total_reps: u32,
    pub tut_sec: f64,
    pub avg_tempo_sec: Option<f64>,
    pub rep_times_sec: Vec<f64>,
    pub rep_breakdown: Vec<RepBreakdownEntry>,
    pub peak_gyro_per_rep: Vec<f64>,
    pub output_loss_pct: Option<f64>,
    pub speed_proxy_per_rep: Vec<f64>,
    pub avg_peak_speed_proxy: Option<f64>,
    pub speed_loss_pct: Option<f64>,
    pub velocity_per_rep_ms: Vec<f64>,
    pub avg_velocity_ms: Option<f64>,
    pub velocity_loss_pct: Option<f64>,
    pub rom_per_rep_m: Vec<f64>,
    pub avg_rom_m: Option<f64>,
    pub rom_loss_pct: Option<f64>,
    pub device_info: Value,
    pub thresholds: Thresholds,
}

/// The per-rep metric inputs the pipeline loop hands the recorder at
/// rep-completion time; decouples the recorder from the velocity/ROM
/// estimators' concrete types (spec.md §9's cycle-breaking guidance).
#[derive(Clone, Copy, Debug, Default)]
pub struct RepCompletionInputs {
    pub peak_velocity_ms: f64,
    pub rom_m: f64,
}

struct ActiveSession {
    id: String,
    start: DateTime<Utc>,
    dir: PathBuf,
    raw_log: File,
    rep_count: u32,
    tut_sec: f64,
    inter_rep_intervals: Vec<f64>,
    peak_gyro_per_rep: Vec<f64>,
    speed_proxy_per_rep: Vec<f64>,
    velocity_per_rep: Vec<f64>,
    rom_per_rep: Vec<f64>,
    rep_breakdown: Vec<RepBreakdownEntry>,
    current_peak_gyro: f64,
    current_peak_speed: f64,
    last_rep_event_t: f64,
}

pub enum RecorderState {
    Idle,
    Active,
}

pub struct SessionRecorder {
    active: Option<ActiveSession>,
}

pub struct StartInfo {
    pub session_id: String,
    pub dir: String,
    pub file: String,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub fn state(&self) -> RecorderState {
        if self.active.is_some() {
            RecorderState::Active
        } else {
            RecorderState::Idle
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// idle -> active. Returns `Err(SessionAlreadyActive)` per the
    /// at-most-one-active-session invariant; callers map that to the
    /// `note: already_active` ack without allocating anything.
    pub fn start(&mut self, sessions_dir: &str) -> Result<StartInfo, PipelineError> {
        if self.active.is_some() {
            return Err(PipelineError::SessionAlreadyActive);
        }

        let start = Utc::now();
        let id = start.format("%Y-%m-%dT%H-%M-%SZ").to_string();
        let dir = Path::new(sessions_dir).join(format!("session_{id}"));
        fs::create_dir_all(&dir)?;

        let raw_path = dir.join("raw.jsonl");
        let raw_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&raw_path)?;

        let info = StartInfo {
            session_id: id.clone(),
            dir: dir.to_string_lossy().to_string(),
            file: raw_path.to_string_lossy().to_string(),
        };

        self.active = Some(ActiveSession {
            id,
            start,
            dir,
            raw_log,
            rep_count: 0,
            tut_sec: 0.0,
            inter_rep_intervals: Vec::new(),
            peak_gyro_per_rep: Vec::new(),
            speed_proxy_per_rep: Vec::new(),
            velocity_per_rep: Vec::new(),
            rom_per_rep: Vec::new(),
            rep_breakdown: Vec::new(),
            current_peak_gyro: 0.0,
            current_peak_speed: 0.0,
            last_rep_event_t: f64::NEG_INFINITY,
        });

        Ok(info)
    }

    /// Appends one JSON line to the raw log (tick snapshots and per-event
    /// messages alike), per spec.md §4.8's "Raw log" contract.
    pub fn append_raw(&mut self, value: &Value) -> Result<(), PipelineError> {
        if let Some(session) = self.active.as_mut() {
            let line = serde_json::to_string(value)?;
            writeln!(session.raw_log, "{line}")?;
        }
        Ok(())
    }

    /// Accrues TUT and tracks running per-rep maxima; call once per tick
    /// while active. `moving` reflects the rep detector's MOVING state.
    pub fn on_tick(&mut self, moving: bool, dt: f64, filtered_gyro: f64) {
        if let Some(session) = self.active.as_mut() {
            if moving {
                session.tut_sec += dt.min(TUT_TICK_CAP_SECS);
            }
            let abs_gyro = filtered_gyro.abs();
            session.current_peak_gyro = session.current_peak_gyro.max(abs_gyro);
            session.current_peak_speed = session.current_peak_speed.max(abs_gyro);
        }
    }

    /// Live TUT accumulator for the current session, for `rep_update`'s
    /// `tut_sec` field; `0.0` while idle.
    pub fn tut_sec(&self) -> f64 {
        self.active.as_ref().map_or(0.0, |s| s.tut_sec)
    }

    /// Live average inter-rep tempo so far, for `rep_update`'s
    /// `avg_tempo_sec` field.
    pub fn avg_tempo_sec(&self) -> Option<f64> {
        self.active.as_ref().and_then(|s| average(&s.inter_rep_intervals))
    }

    /// Live peak-gyro loss % across reps completed so far in the current
    /// session, for `rep_update`'s `output_loss_pct` field.
    pub fn output_loss_pct(&self) -> Option<f64> {
        self.active.as_ref().and_then(|s| loss_pct(&s.peak_gyro_per_rep))
    }

    /// Live average speed-proxy across reps completed so far.
    pub fn avg_peak_speed_proxy(&self) -> Option<f64> {
        self.active.as_ref().and_then(|s| average(&s.speed_proxy_per_rep))
    }

    /// Live speed-proxy loss % across reps completed so far.
    pub fn speed_loss_pct(&self) -> Option<f64> {
        self.active.as_ref().and_then(|s| loss_pct(&s.speed_proxy_per_rep))
    }

    /// Call when the rep detector reports a completed rep this tick.
    pub fn on_rep_complete(&mut self, t: f64, inputs: RepCompletionInputs) -> Option<f64> {
        let session = self.active.as_mut()?;

        let tempo = if session.last_rep_event_t.is_finite() {
            let delta = t - session.last_rep_event_t;
            if delta > 0.0 && delta < MAX_TEMPO_SECS {
                Some(delta)
            } else {
                None
            }
        } else {
            None
        };
        if let Some(tempo) = tempo {
            session.inter_rep_intervals.push(tempo);
        }
        session.last_rep_event_t = t;

        session.rep_count += 1;
        session.peak_gyro_per_rep.push(session.current_peak_gyro);
        session.speed_proxy_per_rep.push(session.current_peak_speed);
        session.velocity_per_rep.push(inputs.peak_velocity_ms);
        session.rom_per_rep.push(inputs.rom_m);

        session.rep_breakdown.push(RepBreakdownEntry {
            rep: session.rep_count,
            t,
            tempo_sec: tempo,
            peak_gyro: session.current_peak_gyro,
            peak_speed_proxy: session.current_peak_speed,
            peak_velocity_ms: inputs.peak_velocity_ms,
            rom_m: inputs.rom_m,
        });

        session.current_peak_gyro = 0.0;
        session.current_peak_speed = 0.0;

        tempo
    }

    /// active -> idle: closes the raw log and writes `summary.json`
    /// atomically (write-temp-then-rename).
    pub fn stop(
        &mut self,
        device_info: Value,
        thresholds: Thresholds,
    ) -> Result<SessionSummary, PipelineError> {
        let session = self.active.take().ok_or(PipelineError::NoActiveSession)?;
        let end = Utc::now();
        let duration_sec = (end - session.start).num_milliseconds() as f64 / 1000.0;

        let summary = SessionSummary {
            version: SUMMARY_SCHEMA_VERSION,
            session_id: session.id.clone(),
            start_time: session.start.to_rfc3339(),
            end_time: end.to_rfc3339(),
            duration_sec,
            total_reps: session.rep_count,
            tut_sec: session.tut_sec,
            avg_tempo_sec: average(&session.inter_rep_intervals),
            rep_times_sec: session.inter_rep_intervals.clone(),
            rep_breakdown: session.rep_breakdown.clone(),
            peak_gyro_per_rep: session.peak_gyro_per_rep.clone(),
            output_loss_pct: loss_pct(&session.peak_gyro_per_rep),
            speed_proxy_per_rep: session.speed_proxy_per_rep.clone(),
            avg_peak_speed_proxy: average(&session.speed_proxy_per_rep),
            speed_loss_pct: loss_pct(&session.speed_proxy_per_rep),
            velocity_per_rep_ms: session.velocity_per_rep.clone(),
            avg_velocity_ms: average(&session.velocity_per_rep),
            velocity_loss_pct: loss_pct(&session.velocity_per_rep),
            rom_per_rep_m: session.rom_per_rep.clone(),
            avg_rom_m: average(&session.rom_per_rep),
            rom_loss_pct: loss_pct(&session.rom_per_rep),
            device_info,
            thresholds,
        };

        write_summary_atomic(&session.dir, &summary)?;
        drop(session.raw_log);

        Ok(summary)
    }
}

impl Default for SessionRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn loss_pct(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let first = values[0];
    if first <= 0.0 {
        return None;
    }
    let last = *values.last().unwrap();
    Some(((1.0 - last / first) * 100.0).clamp(0.0, 100.0))
}

fn write_summary_atomic(dir: &Path, summary: &SessionSummary) -> Result<(), PipelineError> {
    let final_path = dir.join("summary.json");
    let tmp_path = dir.join("summary.json.tmp");
    let json = serde_json::to_string_pretty(summary)?;
    fs::write(&tmp_path, json)?;
    fs::rename(&tmp_path, &final_path)?;
    Ok(())
}

/// Reads a previously-written summary back, for `get_session` and for the
/// round-trip property in spec.md §8.
pub fn read_summary(dir: &Path) -> Result<SessionSummary, PipelineError> {
    let path = dir.join("summary.json");
    let content = fs::read_to_string(&path)
        .map_err(|_| PipelineError::SessionNotFound(dir.display().to_string()))?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_dir::TempDir;

    mod tempfile_dir {
        use std::path::{Path, PathBuf};

        pub struct TempDir(PathBuf);

        impl TempDir {
            pub fn new(label: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "rep_tracker_test_{label}_{}",
                    std::process::id()
                ));
                let _ = std::fs::remove_dir_all(&path);
                std::fs::create_dir_all(&path).unwrap();
                TempDir(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for TempDir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    #[test]
    fn start_twice_is_rejected_without_allocating() {
        let dir = TempDir::new("double_start");
        let mut recorder = SessionRecorder::new();
        recorder.start(dir.path().to_str().unwrap()).unwrap();
        let second = recorder.start(dir.path().to_str().unwrap());
        assert!(matches!(second, Err(PipelineError::SessionAlreadyActive)));
    }

    #[test]
    fn summary_requires_a_started_session() {
        let mut recorder = SessionRecorder::new();
        let result = recorder.stop(Value::Null, Thresholds::default());
        assert!(matches!(result, Err(PipelineError::NoActiveSession)));
    }

    #[test]
    fn full_lifecycle_produces_consistent_summary() {
        let dir = TempDir::new("lifecycle");
        let mut recorder = SessionRecorder::new();
        recorder.start(dir.path().to_str().unwrap()).unwrap();

        for i in 0..3u32 {
            let t = 1.0 + i as f64 * 1.5;
            recorder.on_tick(true, 0.02, 1500.0);
            recorder.on_rep_complete(
                t,
                RepCompletionInputs {
                    peak_velocity_ms: 1.0 - i as f64 * 0.1,
                    rom_m: 0.4,
                },
            );
        }

        let summary = recorder
            .stop(serde_json::json!({"mock": true}), Thresholds::default())
            .unwrap();

        assert_eq!(summary.total_reps, 3);
        assert_eq!(summary.rep_times_sec.len(), 2);
        assert_eq!(summary.peak_gyro_per_rep.len(), 3);
        assert_eq!(summary.velocity_per_rep_ms.len(), 3);
        assert_eq!(summary.rom_per_rep_m.len(), 3);

        let on_disk = read_summary(&dir.path().join(format!("session_{}", summary.session_id)))
            .unwrap();
        assert_eq!(on_disk.total_reps, summary.total_reps);
        assert_eq!(on_disk.session_id, summary.session_id);
    }
}
