//! Shared plain-data types that cross module boundaries.

use serde::{Deserialize, Serialize};

/// One 6-channel reading off the sensor bus.
///
/// `timestamp` is a monotonic seconds counter (not wall-clock); accelerations
/// are m/s^2, angular rates are deg/s, matching the sensor-bus collaborator
/// interface.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ImuSample {
    pub timestamp: f64,
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl ImuSample {
    pub fn new(timestamp: f64, ax: f64, ay: f64, az: f64, gx: f64, gy: f64, gz: f64) -> Self {
        Self {
            timestamp,
            ax,
            ay,
            az,
            gx,
            gy,
            gz,
        }
    }

    /// Raw accelerometer magnitude, m/s^2.
    pub fn accel_magnitude(&self) -> f64 {
        (self.ax * self.ax + self.ay * self.ay + self.az * self.az).sqrt()
    }

    /// Raw gyro magnitude, deg/s.
    pub fn gyro_magnitude(&self) -> f64 {
        (self.gx * self.gx + self.gy * self.gy + self.gz * self.gz).sqrt()
    }

    /// Replaces any non-finite channel with zero, per the "numerically
    /// non-finite inputs are replaced with zero" failure semantics.
    pub fn sanitized(&self) -> Self {
        let z = |v: f64| if v.is_finite() { v } else { 0.0 };
        Self {
            timestamp: self.timestamp,
            ax: z(self.ax),
            ay: z(self.ay),
            az: z(self.az),
            gx: z(self.gx),
            gy: z(self.gy),
            gz: z(self.gz),
        }
    }
}

/// The state machine phase reported to consumers, distinct from the rep
/// detector's internal WAITING/MOVING so a startup calibration window can be
/// surfaced without touching rep-detector semantics.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TickState {
    Calibrating,
    Waiting,
    Moving,
}

impl std::fmt::Display for TickState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TickState::Calibrating => "CALIBRATING",
            TickState::Waiting => "WAITING",
            TickState::Moving => "MOVING",
        };
        write!(f, "{s}")
    }
}
