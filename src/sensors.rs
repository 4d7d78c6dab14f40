//! The sensor-bus collaborator boundary (spec.md §6). The real driver is out
//! of scope; this module only defines the trait the pipeline loop drives
//! and a deterministic mock generator for tests, demos, and `--mock-imu`.

use crate::types::ImuSample;
use async_trait::async_trait;

#[async_trait]
pub trait ImuSource: Send {
    async fn read(&mut self) -> anyhow::Result<ImuSample>;
    fn close(&mut self);
}

/// Deterministic synthetic generator. Produces a flat, gravity-only signal
/// by default; `scripted_reps` overlays rep-shaped gyro bursts for demos and
/// tests that need a realistic movement signal without hardware.
pub struct MockImuSource {
    t: f64,
    dt: f64,
    scripted_reps: Vec<(f64, f64, f64)>, // (start, end, gyro_magnitude)
}

impl MockImuSource {
    pub fn new(dt: f64) -> Self {
        Self {
            t: 0.0,
            dt,
            scripted_reps: Vec::new(),
        }
    }

    pub fn with_scripted_reps(mut self, reps: Vec<(f64, f64, f64)>) -> Self {
        self.scripted_reps = reps;
        self
    }

    fn gyro_magnitude_at(&self, t: f64) -> f64 {
        for (start, end, mag) in &self.scripted_reps {
            if t >= *start && t < *end {
                return *mag;
            }
        }
        0.0
    }
}

#[async_trait]
impl ImuSource for MockImuSource {
    async fn read(&mut self) -> anyhow::Result<ImuSample> {
        let t = self.t;
        self.t += self.dt;
        let gyro_mag = self.gyro_magnitude_at(t);
        Ok(ImuSample::new(t, 0.0, 0.0, 9.81, gyro_mag, 0.0, 0.0))
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_source_advances_monotonic_timestamp() {
        let mut src = MockImuSource::new(0.02);
        let a = src.read().await.unwrap();
        let b = src.read().await.unwrap();
        assert!(b.timestamp > a.timestamp);
    }
}
