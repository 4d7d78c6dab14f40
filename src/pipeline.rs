//! The `Pipeline` aggregate (spec.md §9 design note): owns every stateful
//! filter by value and exposes one per-sample entry point. The loop is the
//! only caller; the rep detector and the recorder share no direct
//! reference, breaking the cycle spec.md §9 calls out.

use crate::classifier::ClassifierAdapter;
use crate::config::Thresholds;
use crate::gravity::{self, DEFAULT_GRAVITY_MS2};
use crate::kalman;
use crate::orientation::{EulerAngles, MadgwickFilter, Quaternion};
use crate::rep_detector::{RepDetector, RepMode};
use crate::rom::RomEstimator;
use crate::session::RepCompletionInputs;
use crate::types::ImuSample;
use crate::velocity::{RepVelocityMetrics, VelocityEstimator};
use std::collections::VecDeque;

const STABILITY_WINDOW: usize = 10;
const STABILITY_VARIANCE_THRESHOLD: f64 = 0.05;
const VELOCITY_PROCESS_VARIANCE: f64 = 0.01;
const VELOCITY_MEASUREMENT_VARIANCE: f64 = 0.1;

pub struct RepResult {
    pub rep_count: u32,
    pub velocity: RepVelocityMetrics,
    pub rom_m: f64,
    pub rom_partial: bool,
    pub peak_gyro: f64,
    pub peak_speed_proxy: f64,
}

impl RepResult {
    pub fn recorder_inputs(&self) -> RepCompletionInputs {
        RepCompletionInputs {
            peak_velocity_ms: self.velocity.peak_velocity,
            rom_m: self.rom_m,
        }
    }
}

pub struct PipelineTick {
    pub t: f64,
    pub euler: EulerAngles,
    pub quaternion: Quaternion,
    pub gyro_only: bool,
    pub velocity: f64,
    pub displacement: f64,
    pub filtered_gyro: f64,
    pub mode: RepMode,
    pub rep_count: u32,
    pub rep_result: Option<RepResult>,
    pub classifier_update: Option<(String, f64)>,
}

pub struct Pipeline {
    orientation: MadgwickFilter,
    velocity: VelocityEstimator,
    rom: RomEstimator,
    rep_detector: RepDetector,
    classifier: Option<ClassifierAdapter>,
    thresholds: Thresholds,
    accel_mag_window: VecDeque<f64>,
    last_zupt_t: f64,
    prev_mode: RepMode,
    current_rep_peak_gyro: f64,
}

impl Pipeline {
    pub fn new(thresholds: Thresholds, classifier: Option<ClassifierAdapter>) -> Self {
        Self {
            orientation: MadgwickFilter::default(),
            velocity: VelocityEstimator::new(VELOCITY_PROCESS_VARIANCE, VELOCITY_MEASUREMENT_VARIANCE),
            rom: RomEstimator::new(thresholds.partial_rom_ratio),
            rep_detector: RepDetector::new(
                thresholds.rep_threshold,
                thresholds.rep_filter_alpha,
                thresholds.min_rep_interval_secs,
            ),
            classifier,
            thresholds,
            accel_mag_window: VecDeque::with_capacity(STABILITY_WINDOW),
            last_zupt_t: 0.0,
            prev_mode: RepMode::Waiting,
            current_rep_peak_gyro: 0.0,
        }
    }

    /// Full pipeline reset (spec.md §9's canonical RESET semantics): every
    /// filter reinitializes, not just the rep counter.
    pub fn reset(&mut self) {
        self.orientation.reset();
        self.velocity.reset();
        self.rom.reset();
        self.rep_detector.reset();
        self.accel_mag_window.clear();
        self.last_zupt_t = 0.0;
        self.prev_mode = RepMode::Waiting;
        self.current_rep_peak_gyro = 0.0;
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    /// True until the stability-detection window has filled, i.e. before
    /// the pipeline has seen enough samples to judge ZUPT eligibility.
    /// Surfaced to consumers as the `CALIBRATING` state (spec.md §6).
    pub fn is_calibrating(&self) -> bool {
        self.accel_mag_window.len() < STABILITY_WINDOW
    }

    pub fn classifier_session_prediction(&self) -> Option<(String, f64)> {
        self.classifier.as_ref().and_then(|c| c.session_prediction())
    }

    pub fn reset_classifier_votes(&mut self) {
        if let Some(c) = self.classifier.as_mut() {
            c.reset_votes();
        }
    }

    fn is_stable(&mut self, accel_magnitude: f64) -> bool {
        self.accel_mag_window.push_back(accel_magnitude);
        while self.accel_mag_window.len() > STABILITY_WINDOW {
            self.accel_mag_window.pop_front();
        }
        if self.accel_mag_window.len() < STABILITY_WINDOW {
            return false;
        }
        let mean = self.accel_mag_window.iter().sum::<f64>() / self.accel_mag_window.len() as f64;
        let variance = self
            .accel_mag_window
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / self.accel_mag_window.len() as f64;
        variance < STABILITY_VARIANCE_THRESHOLD
    }

    /// Advances the whole filter chain by one sample. `dt` is the elapsed
    /// time since the previous sample.
    pub fn process_sample(&mut self, raw: ImuSample, dt: f64) -> PipelineTick {
        let sample = raw.sanitized();

        self.orientation
            .update(sample.ax, sample.ay, sample.az, sample.gx, sample.gy, sample.gz, dt);
        let euler = self.orientation.euler();
        let quaternion = self.orientation.quaternion();

        let gravity_vec = gravity::gravity_from_quaternion(&quaternion, DEFAULT_GRAVITY_MS2);
        let linear = gravity::decompose(sample.ax, sample.ay, sample.az, gravity_vec);

        if self.is_stable(sample.accel_magnitude()) {
            let elapsed = sample.timestamp - self.last_zupt_t;
            self.velocity.zupt(elapsed);
            self.last_zupt_t = sample.timestamp;
        } else {
            self.velocity.step(linear.az_lin, dt, sample.timestamp);
        }
        self.rom.step(self.velocity.velocity(), dt);

        let rep_tick = self.rep_detector.update(sample.gyro_magnitude(), sample.timestamp);
        self.current_rep_peak_gyro = self.current_rep_peak_gyro.max(rep_tick.filtered_signal.abs());

        if self.prev_mode == RepMode::Waiting && rep_tick.mode == RepMode::Moving {
            self.velocity.rep_start();
            self.rom.rep_start();
        }

        let rep_result = if rep_tick.rep_completed {
            let velocity_metrics = self.velocity.rep_complete();
            let (rom_m, rom_partial) = self.rom.rep_complete();
            let peak_gyro = self.current_rep_peak_gyro;
            self.current_rep_peak_gyro = 0.0;
            Some(RepResult {
                rep_count: rep_tick.rep_count,
                velocity: velocity_metrics,
                rom_m,
                rom_partial,
                // kept as two independently-tracked accumulators over the
                // same signal per the preserved telemetry shape (DESIGN.md)
                peak_gyro,
                peak_speed_proxy: peak_gyro,
            })
        } else {
            None
        };
        self.prev_mode = rep_tick.mode;

        let classifier_update = self.classifier.as_mut().and_then(|c| c.on_sample(sample));

        PipelineTick {
            t: sample.timestamp,
            euler,
            quaternion,
            gyro_only: self.orientation.is_gyro_only(),
            velocity: self.velocity.velocity(),
            displacement: self.rom.position(),
            filtered_gyro: rep_tick.filtered_signal,
            mode: rep_tick.mode,
            rep_count: rep_tick.rep_count,
            rep_result,
            classifier_update,
        }
    }

    pub fn avg_peak_velocity(&self) -> Option<f64> {
        self.velocity.avg_peak_velocity()
    }

    pub fn velocity_loss_pct(&self) -> Option<f64> {
        self.velocity.velocity_loss_pct()
    }

    pub fn avg_rom(&self) -> Option<f64> {
        self.rom.avg_rom()
    }

    pub fn rom_loss_pct(&self) -> Option<f64> {
        self.rom.rom_loss_pct()
    }
}

/// Re-exported so callers building a Kalman-backed custom velocity channel
/// (e.g. the `kalman_demo` binary) share the same variance defaults as the
/// pipeline's own velocity smoother.
pub fn default_velocity_kalman() -> kalman::Kalman1D {
    kalman::Kalman1D::new(0.0, 1.0, VELOCITY_PROCESS_VARIANCE, VELOCITY_MEASUREMENT_VARIANCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierAdapter, UnavailableEngine};

    #[test]
    fn flat_sensor_stream_yields_zero_reps_and_level_orientation() {
        let mut pipeline = Pipeline::new(Thresholds::default(), None);
        let mut last_tick = None;
        for i in 0..200 {
            let t = i as f64 * 0.02;
            let tick = pipeline.process_sample(
                ImuSample::new(t, 0.0, 0.0, 9.81, 0.0, 0.0, 0.0),
                0.02,
            );
            last_tick = Some(tick);
        }
        let tick = last_tick.unwrap();
        assert_eq!(tick.rep_count, 0);
        assert!(tick.euler.roll.abs() < 0.1);
        assert!(tick.euler.pitch.abs() < 0.1);
    }

    #[test]
    fn session_scale_synthetic_reps_produce_matching_metric_lengths() {
        let classifier = ClassifierAdapter::new(Box::new(UnavailableEngine::new()), 25);
        let mut pipeline = Pipeline::new(Thresholds::default(), Some(classifier));
        let mut rep_events = Vec::new();
        let dt = 0.02;
        let mut t = 0.0;
        // three reps, each a 0.5s burst above threshold then 0.3s below, spaced to clear debounce
        for rep in 0..3 {
            let burst_start = t;
            while t < burst_start + 0.5 {
                let tick = pipeline.process_sample(
                    ImuSample::new(t, 0.0, 0.0, 9.81, 2000.0, 0.0, 0.0),
                    dt,
                );
                if let Some(r) = tick.rep_result {
                    rep_events.push(r.rep_count);
                }
                t += dt;
            }
            let low_start = t;
            while t < low_start + 0.7 {
                let tick = pipeline.process_sample(
                    ImuSample::new(t, 0.0, 0.0, 9.81, 200.0, 0.0, 0.0),
                    dt,
                );
                if let Some(r) = tick.rep_result {
                    rep_events.push(r.rep_count);
                }
                t += dt;
            }
            let _ = rep;
        }
        assert_eq!(rep_events, vec![1, 2, 3]);
    }
}
