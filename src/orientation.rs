//! Madgwick AHRS orientation filter (spec.md §4.1).
//!
//! Maintains a unit quaternion, gyro-integrated each tick and corrected
//! against gravity by a gradient-descent step whenever the accelerometer
//! reading is close enough to 1 g to trust.

use serde::{Deserialize, Serialize};

const DEG_TO_RAD: f64 = std::f64::consts::PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / std::f64::consts::PI;
const ACCEL_GATE_LOW_MS2: f64 = 4.9; // 0.5 g
const ACCEL_GATE_HIGH_MS2: f64 = 19.6; // 2.0 g
const QUAT_NORM_EPS: f64 = 1e-6;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Quaternion {
    pub w: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        w: 1.0,
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    fn norm(&self) -> f64 {
        (self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    fn is_finite(&self) -> bool {
        self.w.is_finite() && self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }

    fn normalized(&self) -> Quaternion {
        let n = self.norm();
        if n <= 0.0 {
            return Quaternion::IDENTITY;
        }
        Quaternion {
            w: self.w / n,
            x: self.x / n,
            y: self.y / n,
            z: self.z / n,
        }
    }
}

/// Roll/pitch/yaw in degrees, ZYX Euler sequence.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub struct EulerAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

pub struct MadgwickFilter {
    pub beta: f64,
    q: Quaternion,
    gyro_only: bool,
}

impl MadgwickFilter {
    pub fn new(beta: f64) -> Self {
        Self {
            beta,
            q: Quaternion::IDENTITY,
            gyro_only: false,
        }
    }

    pub fn quaternion(&self) -> Quaternion {
        self.q
    }

    /// True when the last update skipped the accelerometer correction
    /// because the input was outside the 0.5 g..2.0 g trust window.
    pub fn is_gyro_only(&self) -> bool {
        self.gyro_only
    }

    pub fn reset(&mut self) {
        self.q = Quaternion::IDENTITY;
        self.gyro_only = false;
    }

    /// Advances the filter by `dt` seconds given one gyro (deg/s) and one
    /// accel (m/s^2) reading.
    pub fn update(&mut self, ax: f64, ay: f64, az: f64, gx: f64, gy: f64, gz: f64, dt: f64) {
        let gx = gx * DEG_TO_RAD;
        let gy = gy * DEG_TO_RAD;
        let gz = gz * DEG_TO_RAD;

        let q = self.q;
        // gyro-driven quaternion rate: 0.5 * q (x) (0, gx, gy, gz)
        let mut qdot_w = 0.5 * (-q.x * gx - q.y * gy - q.z * gz);
        let mut qdot_x = 0.5 * (q.w * gx + q.y * gz - q.z * gy);
        let mut qdot_y = 0.5 * (q.w * gy - q.x * gz + q.z * gx);
        let mut qdot_z = 0.5 * (q.w * gz + q.x * gy - q.y * gx);

        let accel_mag = (ax * ax + ay * ay + az * az).sqrt();
        self.gyro_only = !(ACCEL_GATE_LOW_MS2 < accel_mag && accel_mag < ACCEL_GATE_HIGH_MS2);

        if !self.gyro_only && accel_mag > 0.0 {
            let (ax, ay, az) = (ax / accel_mag, ay / accel_mag, az / accel_mag);

            // Objective function f(q, a) = R(q)^T * g - a, g = (0,0,1)
            let f1 = 2.0 * (q.x * q.z - q.w * q.y) - ax;
            let f2 = 2.0 * (q.w * q.x + q.y * q.z) - ay;
            let f3 = 2.0 * (0.5 - q.x * q.x - q.y * q.y) - az;

            let j_11 = -2.0 * q.y;
            let j_12 = 2.0 * q.z;
            let j_13 = -2.0 * q.w;
            let j_14 = 2.0 * q.x;
            let j_21 = 2.0 * q.x;
            let j_22 = 2.0 * q.w;
            let j_23 = 2.0 * q.z;
            let j_24 = 2.0 * q.y;
            let j_32 = -4.0 * q.x;
            let j_33 = -4.0 * q.y;

            let mut s_w = j_11 * f1 + j_21 * f2;
            let mut s_x = j_12 * f1 + j_22 * f2 + j_32 * f3;
            let mut s_y = j_13 * f1 + j_23 * f2 + j_33 * f3;
            let mut s_z = j_14 * f1 + j_24 * f2;

            let s_norm = (s_w * s_w + s_x * s_x + s_y * s_y + s_z * s_z).sqrt();
            if s_norm > 0.0 {
                s_w /= s_norm;
                s_x /= s_norm;
                s_y /= s_norm;
                s_z /= s_norm;
            }

            qdot_w -= self.beta * s_w;
            qdot_x -= self.beta * s_x;
            qdot_y -= self.beta * s_y;
            qdot_z -= self.beta * s_z;
        }

        let integrated = Quaternion {
            w: q.w + qdot_w * dt,
            x: q.x + qdot_x * dt,
            y: q.y + qdot_y * dt,
            z: q.z + qdot_z * dt,
        };

        if !integrated.is_finite() {
            self.q = Quaternion::IDENTITY;
            return;
        }

        let norm = integrated.norm();
        self.q = if (norm - 1.0).abs() > QUAT_NORM_EPS || norm == 0.0 {
            integrated.normalized()
        } else {
            integrated
        };
    }

    /// Euler angles in degrees, ZYX sequence, pitch clamped at gimbal.
    pub fn euler(&self) -> EulerAngles {
        let q = self.q;
        let roll = (2.0 * (q.w * q.x + q.y * q.z))
            .atan2(1.0 - 2.0 * (q.x * q.x + q.y * q.y));

        let sin_pitch = 2.0 * (q.w * q.y - q.z * q.x);
        let pitch = if sin_pitch.abs() >= 1.0 {
            std::f64::consts::FRAC_PI_2.copysign(sin_pitch)
        } else {
            sin_pitch.asin()
        };

        let yaw = (2.0 * (q.w * q.z + q.x * q.y))
            .atan2(1.0 - 2.0 * (q.y * q.y + q.z * q.z));

        EulerAngles {
            roll: roll * RAD_TO_DEG,
            pitch: pitch * RAD_TO_DEG,
            yaw: yaw * RAD_TO_DEG,
        }
    }
}

impl Default for MadgwickFilter {
    fn default() -> Self {
        Self::new(0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quaternion_norm_stays_unit() {
        let mut f = MadgwickFilter::default();
        for _ in 0..200 {
            f.update(0.1, 0.2, 9.81, 1.0, -1.0, 0.5, 1.0 / 50.0);
        }
        let q = f.quaternion();
        let n = (q.w * q.w + q.x * q.x + q.y * q.y + q.z * q.z).sqrt();
        assert!((n - 1.0).abs() < 1e-6);
    }

    #[test]
    fn flat_gravity_converges_to_level() {
        let mut f = MadgwickFilter::new(0.1);
        for _ in 0..50 {
            f.update(0.0, 0.0, 9.81, 0.0, 0.0, 0.0, 1.0 / 50.0);
        }
        let e = f.euler();
        assert!(e.roll.abs() < 0.1, "roll={}", e.roll);
        assert!(e.pitch.abs() < 0.1, "pitch={}", e.pitch);
    }

    #[test]
    fn non_finite_input_resets_to_identity() {
        let mut f = MadgwickFilter::default();
        f.update(f64::NAN, 0.0, 9.81, 0.0, 0.0, 0.0, 1.0 / 50.0);
        let q = f.quaternion();
        assert_eq!(q.w, 1.0);
        assert_eq!(q.x, 0.0);
    }

    #[test]
    fn high_dynamic_accel_flags_gyro_only() {
        let mut f = MadgwickFilter::default();
        f.update(0.0, 0.0, 40.0, 0.0, 0.0, 0.0, 1.0 / 50.0);
        assert!(f.is_gyro_only());
    }

    #[test]
    fn constant_rate_integrates_with_correction_gate_closed() {
        let mut f = MadgwickFilter::default();
        let dt = 1.0 / 50.0;
        let n = 50;
        let gz_dps = 90.0; // deg/s about yaw
        for _ in 0..n {
            // az = 0.0 is outside the 0.5g..2.0g trust window, gate stays closed
            f.update(0.0, 0.0, 0.0, 0.0, 0.0, gz_dps, dt);
        }
        let expected = gz_dps * n as f64 * dt;
        let e = f.euler();
        assert!(
            (e.yaw - expected).abs() / expected < 0.01,
            "yaw={} expected={}",
            e.yaw,
            expected
        );
    }
}
