//! Integration-level coverage exercised above the per-module unit tests:
//! session lifecycle with multiple reps, constant-acceleration velocity
//! integration, velocity loss across two reps, and the classifier session
//! vote.

use rep_tracker_rs::classifier::{ClassifierAdapter, UnavailableEngine, VoteTally};
use rep_tracker_rs::config::Thresholds;
use rep_tracker_rs::pipeline::Pipeline;
use rep_tracker_rs::session::SessionRecorder;
use rep_tracker_rs::types::ImuSample;
use std::path::{Path, PathBuf};

struct TempDir(PathBuf);

impl TempDir {
    fn new(label: &str) -> Self {
        let path = std::env::temp_dir().join(format!("rep_tracker_e2e_{label}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Drives a rep burst (high gyro for `burst_secs`, low gyro for `rest_secs`)
/// through the pipeline, feeding every completed rep into the recorder.
fn drive_rep(pipeline: &mut Pipeline, recorder: &mut SessionRecorder, t: &mut f64, burst_secs: f64, rest_secs: f64) {
    let dt = 0.02;
    let burst_end = *t + burst_secs;
    while *t < burst_end {
        let tick = pipeline.process_sample(ImuSample::new(*t, 0.0, 0.0, 9.81, 2000.0, 0.0, 0.0), dt);
        if recorder.is_active() {
            recorder.on_tick(tick.mode == rep_tracker_rs::rep_detector::RepMode::Moving, dt, tick.filtered_gyro);
        }
        if let Some(rep) = &tick.rep_result {
            if recorder.is_active() {
                recorder.on_rep_complete(tick.t, rep.recorder_inputs());
            }
        }
        *t += dt;
    }
    let rest_end = *t + rest_secs;
    while *t < rest_end {
        let tick = pipeline.process_sample(ImuSample::new(*t, 0.0, 0.0, 9.81, 200.0, 0.0, 0.0), dt);
        if recorder.is_active() {
            recorder.on_tick(tick.mode == rep_tracker_rs::rep_detector::RepMode::Moving, dt, tick.filtered_gyro);
        }
        if let Some(rep) = &tick.rep_result {
            if recorder.is_active() {
                recorder.on_rep_complete(tick.t, rep.recorder_inputs());
            }
        }
        *t += dt;
    }
}

#[test]
fn scenario_3_session_lifecycle_with_three_reps() {
    let dir = TempDir::new("lifecycle");
    let mut pipeline = Pipeline::new(Thresholds::default(), None);
    let mut recorder = SessionRecorder::new();

    let start_info = recorder.start(dir.path().to_str().unwrap()).expect("start should succeed");
    assert!(!start_info.session_id.is_empty());

    let mut t = 0.0;
    for _ in 0..3 {
        drive_rep(&mut pipeline, &mut recorder, &mut t, 0.5, 1.0);
    }
    let summary = recorder
        .stop(serde_json::json!({"mock": true}), Thresholds::default())
        .expect("stop should succeed while a session is active");

    assert_eq!(summary.total_reps, 3);
    assert_eq!(summary.rep_times_sec.len(), 2);
    assert_eq!(summary.peak_gyro_per_rep.len(), 3);
    assert_eq!(summary.velocity_per_rep_ms.len(), 3);
    assert_eq!(summary.rom_per_rep_m.len(), 3);
    assert!(dir.path().join(format!("session_{}", summary.session_id)).join("summary.json").exists());
}

#[test]
fn scenario_4_constant_vertical_acceleration_integrates_to_one_meter_per_second() {
    use rep_tracker_rs::velocity::VelocityEstimator;

    let mut estimator = VelocityEstimator::new(0.01, 0.001);
    let dt = 1.0 / 50.0;
    let mut t = 0.0;
    for _ in 0..25 {
        estimator.step(2.0, dt, t);
        t += dt;
    }
    assert!((estimator.velocity() - 1.0).abs() < 0.05, "velocity={}", estimator.velocity());
}

#[test]
fn scenario_5_velocity_loss_across_two_reps_is_twenty_percent() {
    use rep_tracker_rs::velocity::VelocityEstimator;

    let mut estimator = VelocityEstimator::new(0.01, 0.1);
    let dt = 1.0 / 50.0;

    // Rep A: ramp to peak velocity ~1.0 m/s
    estimator.rep_start();
    let mut t = 0.0;
    for _ in 0..25 {
        estimator.step(2.0, dt, t);
        t += dt;
    }
    let rep_a = estimator.rep_complete();

    // Zero the running velocity via a ZUPT between reps (as the pipeline
    // would at a stable top/bottom) rather than `reset()`, which would wipe
    // `rep_peaks` and lose rep A's history needed for the loss-% below.
    estimator.zupt(dt);
    t += dt;

    // Rep B: ramp to peak velocity ~0.8 m/s.
    estimator.rep_start();
    for _ in 0..20 {
        estimator.step(2.0, dt, t);
        t += dt;
    }
    let rep_b = estimator.rep_complete();

    assert!(rep_a.peak_velocity > rep_b.peak_velocity);
    let loss = estimator.velocity_loss_pct().expect("two completed reps should produce a loss percentage");
    assert!((loss - 20.0).abs() < 5.0, "loss={loss}");
}

#[test]
fn scenario_6_classifier_session_vote_picks_the_summed_confidence_winner() {
    let mut tally = VoteTally::default();
    for (label, confidence) in [
        ("A", 0.7), ("A", 0.8), ("B", 0.9), ("A", 0.75), ("B", 0.6),
        ("A", 0.65), ("B", 0.7), ("A", 0.8), ("A", 0.72), ("B", 0.65),
    ] {
        tally.record(label, confidence);
    }
    let (label, best) = tally.session_prediction().expect("ten recorded votes should yield a prediction");
    assert_eq!(label, "A");
    assert!((best - 0.8).abs() < 1e-9);
}

#[test]
fn unavailable_classifier_reports_degraded_reason_through_a_full_pipeline_run() {
    let classifier = ClassifierAdapter::new(Box::new(UnavailableEngine::new()), 25);
    let mut pipeline = Pipeline::new(Thresholds::default(), Some(classifier));
    for i in 0..300 {
        pipeline.process_sample(ImuSample::new(i as f64 * 0.02, 0.0, 0.0, 9.81, 0.0, 0.0, 0.0), 0.02);
    }
    assert!(pipeline.classifier_session_prediction().is_none());
}
