//! 1-D Kalman smoother (spec.md §4.3), plus an adaptive-process-noise
//! variant that tracks innovation magnitude.

const ADAPTIVE_EMA_RATE: f64 = 0.05;

#[derive(Clone, Copy, Debug)]
pub struct KalmanState1D {
    pub x: f64,
    pub p: f64,
    pub q: f64,
    pub r: f64,
    pub k: f64,
}

pub struct Kalman1D {
    state: KalmanState1D,
}

impl Kalman1D {
    pub fn new(initial: f64, initial_error: f64, q: f64, r: f64) -> Self {
        assert!(q > 0.0 && r > 0.0, "process/measurement variance must be strictly positive");
        Self {
            state: KalmanState1D {
                x: initial,
                p: initial_error.max(0.0),
                q,
                r,
                k: 0.0,
            },
        }
    }

    pub fn reset(&mut self, value: f64, error: f64) {
        self.state.x = value;
        self.state.p = error.max(0.0);
        self.state.k = 0.0;
    }

    pub fn state(&self) -> KalmanState1D {
        self.state
    }

    /// Predict-then-update step; returns the new estimate.
    pub fn update(&mut self, measurement: f64) -> f64 {
        // predict
        let x_pred = self.state.x;
        let p_pred = self.state.p + self.state.q;

        // update
        let k = p_pred / (p_pred + self.state.r);
        let x = x_pred + k * (measurement - x_pred);
        let p = (1.0 - k) * p_pred;

        self.state.x = x;
        self.state.p = p.max(0.0);
        self.state.k = k;
        x
    }
}

/// Adaptive variant (spec.md §4.3): widens/narrows process noise based on
/// an EMA of squared innovation relative to the expected (p + r) variance.
pub struct AdaptiveKalman1D {
    inner: Kalman1D,
    base_q: f64,
    q_min: f64,
    q_max: f64,
    innovation_ema: f64,
}

impl AdaptiveKalman1D {
    pub fn new(initial: f64, initial_error: f64, q: f64, r: f64, q_min: f64, q_max: f64) -> Self {
        Self {
            inner: Kalman1D::new(initial, initial_error, q, r),
            base_q: q,
            q_min,
            q_max,
            innovation_ema: 0.0,
        }
    }

    pub fn state(&self) -> KalmanState1D {
        self.inner.state()
    }

    pub fn reset(&mut self, value: f64, error: f64) {
        self.inner.reset(value, error);
        self.innovation_ema = 0.0;
    }

    pub fn update(&mut self, measurement: f64) -> f64 {
        let pre = self.inner.state();
        let innovation = measurement - pre.x;
        self.innovation_ema = 0.9 * self.innovation_ema + 0.1 * innovation * innovation;

        let expected_variance = pre.p + pre.r;
        if expected_variance > 0.0 {
            if self.innovation_ema > 1.5 * expected_variance {
                self.inner.state.q = (self.inner.state.q * 1.5).min(self.q_max);
            } else if self.innovation_ema < 0.5 * expected_variance {
                self.inner.state.q = (self.inner.state.q * 0.8).max(self.q_min);
            } else {
                self.inner.state.q += (self.base_q - self.inner.state.q) * ADAPTIVE_EMA_RATE;
            }
        }

        self.inner.update(measurement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gain_bounded_and_converges_toward_q_over_q_plus_r() {
        let q = 0.5;
        let r = 2.0;
        let mut kf = Kalman1D::new(0.0, 10.0, q, r);
        let mut last_k = 1.0;
        for _ in 0..500 {
            let k = kf.update(1.0);
            assert!((0.0..=1.0).contains(&k));
            last_k = k;
        }
        let steady_state = q / (q + r);
        assert!((last_k - steady_state).abs() < 1e-3, "k={} expected={}", last_k, steady_state);
    }

    #[test]
    fn reset_overrides_estimate_and_error() {
        let mut kf = Kalman1D::new(0.0, 1.0, 0.1, 0.1);
        kf.update(5.0);
        kf.reset(2.0, 3.0);
        let s = kf.state();
        assert_eq!(s.x, 2.0);
        assert_eq!(s.p, 3.0);
    }

    #[test]
    fn covariance_never_negative() {
        let mut kf = Kalman1D::new(0.0, 0.001, 0.0001, 0.0001);
        for i in 0..100 {
            kf.update(if i % 2 == 0 { 1.0 } else { -1.0 });
            assert!(kf.state().p >= 0.0);
        }
    }

    #[test]
    fn adaptive_widens_q_under_large_innovation() {
        let mut kf = AdaptiveKalman1D::new(0.0, 1.0, 0.1, 1.0, 0.01, 5.0);
        let base_q = kf.state().q;
        for _ in 0..5 {
            kf.update(100.0);
        }
        assert!(kf.state().q >= base_q);
    }
}
