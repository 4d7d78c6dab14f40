//! Rep detector (spec.md §4.6): a hysteresis state machine on
//! exponentially-smoothed angular-rate magnitude.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum RepMode {
    Waiting,
    Moving,
}

pub struct RepDetector {
    filtered: f64,
    mode: RepMode,
    last_rep_t: f64,
    rep_count: u32,
    alpha: f64,
    threshold: f64,
    hysteresis_ratio: f64,
    min_rep_interval: f64,
}

#[derive(Clone, Copy, Debug)]
pub struct RepTick {
    pub rep_count: u32,
    pub filtered_signal: f64,
    pub mode: RepMode,
    pub rep_completed: bool,
}

impl RepDetector {
    pub fn new(threshold: f64, alpha: f64, min_rep_interval: f64) -> Self {
        Self {
            filtered: 0.0,
            mode: RepMode::Waiting,
            last_rep_t: f64::NEG_INFINITY,
            rep_count: 0,
            alpha,
            threshold,
            hysteresis_ratio: 0.6,
            min_rep_interval,
        }
    }

    pub fn reset(&mut self) {
        self.filtered = 0.0;
        self.mode = RepMode::Waiting;
        self.last_rep_t = f64::NEG_INFINITY;
        self.rep_count = 0;
    }

    pub fn rep_count(&self) -> u32 {
        self.rep_count
    }

    pub fn mode(&self) -> RepMode {
        self.mode
    }

    /// Feeds one raw gyro magnitude and timestamp, returns the tick outcome.
    pub fn update(&mut self, raw_magnitude: f64, t: f64) -> RepTick {
        self.filtered = self.alpha * raw_magnitude + (1.0 - self.alpha) * self.filtered;

        let mut rep_completed = false;
        match self.mode {
            RepMode::Waiting => {
                if self.filtered > self.threshold {
                    self.mode = RepMode::Moving;
                }
            }
            RepMode::Moving => {
                if self.filtered < self.hysteresis_ratio * self.threshold {
                    if (t - self.last_rep_t) >= self.min_rep_interval {
                        self.rep_count += 1;
                        self.last_rep_t = t;
                        rep_completed = true;
                    }
                    self.mode = RepMode::Waiting;
                }
            }
        }

        RepTick {
            rep_count: self.rep_count,
            filtered_signal: self.filtered,
            mode: self.mode,
            rep_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_hysteresis_cycle_increments_rep_count() {
        let mut d = RepDetector::new(1200.0, 1.0, 0.6);
        // alpha=1.0 makes filtered track raw exactly, for a crisp test
        let mut t = 0.0;
        let mut last_tick = d.update(2000.0, t);
        assert_eq!(last_tick.mode, RepMode::Moving);
        t += 0.6;
        last_tick = d.update(200.0, t);
        assert!(last_tick.rep_completed);
        assert_eq!(last_tick.rep_count, 1);
    }

    #[test]
    fn debounce_rejects_rep_completion_inside_min_interval() {
        let mut d = RepDetector::new(1200.0, 1.0, 0.6);
        // establish last_rep_t with one full cycle (NEG_INFINITY start means
        // this first completion is never itself gated by min_rep_interval)
        d.update(2000.0, 0.0);
        let first = d.update(200.0, 0.6);
        assert!(first.rep_completed);
        assert_eq!(first.rep_count, 1);

        // second cycle completes only 0.1s later — inside the 0.6s window
        d.update(2000.0, 0.65);
        let tick = d.update(200.0, 0.7); // too soon since last_rep_t=0.6
        assert!(!tick.rep_completed);
        assert_eq!(tick.rep_count, 1);
        // still transitions back to WAITING even without incrementing
        assert_eq!(tick.mode, RepMode::Waiting);
    }

    #[test]
    fn synthetic_rep_scenario_from_spec() {
        let mut d = RepDetector::new(1200.0, 1.0, 0.6);
        let mut rep_event_t = None;
        let dt = 0.02;
        let mut t = 0.0;
        while t < 1.0 {
            let mag = if t < 0.5 { 2000.0 } else { 200.0 };
            let tick = d.update(mag, t);
            if tick.rep_completed {
                rep_event_t = Some(t);
            }
            t += dt;
        }
        let rep_t = rep_event_t.expect("exactly one rep_event expected");
        assert!(rep_t >= 0.5 && rep_t <= 0.62);
    }
}
