//! Vertical velocity estimator (spec.md §4.4): integrates linear
//! acceleration, smooths through the 1-D Kalman filter, applies ZUPT
//! corrections, and derives per-rep / per-set velocity metrics.

use crate::kalman::Kalman1D;

const DRIFT_EMA_RATE: f64 = 0.001;
const ROUND_DECIMALS: f64 = 1000.0;

fn round3(v: f64) -> f64 {
    (v * ROUND_DECIMALS).round() / ROUND_DECIMALS
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RepVelocityMetrics {
    pub peak_velocity: f64,
    pub mean_concentric_velocity: f64,
    pub mean_eccentric_velocity: f64,
    pub time_to_peak: f64,
}

struct RepSample {
    t: f64,
    v: f64,
}

pub struct VelocityEstimator {
    v: f64,
    v_raw: f64,
    drift: f64,
    smoother: Kalman1D,
    in_rep: bool,
    rep_samples: Vec<RepSample>,
    rep_peaks: Vec<f64>,
}

impl VelocityEstimator {
    pub fn new(q: f64, r: f64) -> Self {
        Self {
            v: 0.0,
            v_raw: 0.0,
            drift: 0.0,
            smoother: Kalman1D::new(0.0, 1.0, q, r),
            in_rep: false,
            rep_samples: Vec::new(),
            rep_peaks: Vec::new(),
        }
    }

    pub fn velocity(&self) -> f64 {
        self.v
    }

    pub fn raw_velocity(&self) -> f64 {
        self.v_raw
    }

    pub fn reset(&mut self) {
        self.v = 0.0;
        self.v_raw = 0.0;
        self.drift = 0.0;
        self.smoother.reset(0.0, 1.0);
        self.in_rep = false;
        self.rep_samples.clear();
        self.rep_peaks.clear();
    }

    /// Normal integration step: `v_raw += a*dt - drift*dt`, smoothed.
    pub fn step(&mut self, vertical_linear_accel: f64, dt: f64, t: f64) {
        self.v_raw += vertical_linear_accel * dt - self.drift * dt;
        self.v = self.smoother.update(self.v_raw);

        if self.in_rep {
            self.rep_samples.push(RepSample { t, v: self.v });
        }
    }

    /// Zero-velocity update: re-estimate drift from the raw velocity
    /// accumulated since the last ZUPT, then zero the state.
    pub fn zupt(&mut self, elapsed_since_last_zupt: f64) {
        if elapsed_since_last_zupt > 0.0 {
            let instantaneous_drift = self.v_raw / elapsed_since_last_zupt;
            self.drift = (1.0 - DRIFT_EMA_RATE) * self.drift + DRIFT_EMA_RATE * instantaneous_drift;
        }
        self.v = 0.0;
        self.v_raw = 0.0;
        self.smoother.reset(0.0, self.smoother.state().p);
    }

    pub fn rep_start(&mut self) {
        self.in_rep = true;
        self.rep_samples.clear();
    }

    pub fn rep_complete(&mut self) -> RepVelocityMetrics {
        self.in_rep = false;
        if self.rep_samples.is_empty() {
            self.rep_peaks.push(0.0);
            return RepVelocityMetrics::default();
        }

        let first_t = self.rep_samples[0].t;
        let (peak_idx, peak_sample) = self
            .rep_samples
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.v.partial_cmp(&b.v).unwrap())
            .unwrap();
        let peak_velocity = round3(peak_sample.v);
        let time_to_peak = self.rep_samples[peak_idx].t - first_t;

        let positives: Vec<f64> = self.rep_samples.iter().map(|s| s.v).filter(|v| *v > 0.0).collect();
        let negatives: Vec<f64> = self.rep_samples.iter().map(|s| s.v).filter(|v| *v < 0.0).collect();

        let mean_concentric = if positives.is_empty() {
            0.0
        } else {
            positives.iter().sum::<f64>() / positives.len() as f64
        };
        let mean_eccentric = if negatives.is_empty() {
            0.0
        } else {
            negatives.iter().map(|v| v.abs()).sum::<f64>() / negatives.len() as f64
        };

        self.rep_peaks.push(peak_velocity);

        RepVelocityMetrics {
            peak_velocity,
            mean_concentric_velocity: round3(mean_concentric),
            mean_eccentric_velocity: round3(mean_eccentric),
            time_to_peak,
        }
    }

    pub fn completed_peaks(&self) -> &[f64] {
        &self.rep_peaks
    }

    pub fn avg_peak_velocity(&self) -> Option<f64> {
        if self.rep_peaks.is_empty() {
            None
        } else {
            Some(self.rep_peaks.iter().sum::<f64>() / self.rep_peaks.len() as f64)
        }
    }

    /// `clamp((1 - last_peak/first_peak) * 100, 0, 100)`, or `None` if fewer
    /// than 2 completed reps or the first peak is <= 0.
    pub fn velocity_loss_pct(&self) -> Option<f64> {
        if self.rep_peaks.len() < 2 {
            return None;
        }
        let first = self.rep_peaks[0];
        if first <= 0.0 {
            return None;
        }
        let last = *self.rep_peaks.last().unwrap();
        Some(((1.0 - last / first) * 100.0).clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zupt_zeroes_velocity_exactly() {
        let mut v = VelocityEstimator::new(0.01, 0.1);
        for _ in 0..20 {
            v.step(3.0, 1.0 / 50.0, 0.0);
        }
        v.zupt(0.4);
        assert_eq!(v.velocity(), 0.0);
        assert_eq!(v.raw_velocity(), 0.0);
    }

    #[test]
    fn constant_acceleration_integrates_to_expected_velocity() {
        let mut v = VelocityEstimator::new(0.01, 0.001);
        let dt = 1.0 / 50.0;
        for i in 0..25 {
            v.step(2.0, dt, i as f64 * dt);
        }
        assert!((v.velocity() - 1.0).abs() < 0.05, "v={}", v.velocity());
    }

    #[test]
    fn velocity_loss_absent_below_two_reps() {
        let mut v = VelocityEstimator::new(0.01, 0.1);
        v.rep_start();
        v.step(1.0, 0.02, 0.0);
        v.rep_complete();
        assert_eq!(v.velocity_loss_pct(), None);
    }

    #[test]
    fn velocity_loss_between_two_reps() {
        let mut v = VelocityEstimator::new(0.0001, 100.0);
        v.rep_start();
        v.step(50.0, 0.02, 0.0);
        v.rep_complete();
        v.rep_start();
        v.step(40.0, 0.02, 0.0);
        v.rep_complete();
        let loss = v.velocity_loss_pct();
        assert!(loss.is_some());
        assert!(loss.unwrap() >= 0.0 && loss.unwrap() <= 100.0);
    }
}
