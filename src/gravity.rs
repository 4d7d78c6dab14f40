//! Gravity decomposition (spec.md §4.2): splits raw acceleration into the
//! gravity component and the motion-only linear component, either from
//! Euler angles or directly from the orientation quaternion.

use crate::orientation::{EulerAngles, Quaternion};
use serde::{Deserialize, Serialize};

pub const DEFAULT_GRAVITY_MS2: f64 = 9.81;
const STATIONARY_WINDOW: usize = 10;
const DEFAULT_ADAPT_RATE: f64 = 0.01;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LinearAccel {
    pub ax_lin: f64,
    pub ay_lin: f64,
    pub az_lin: f64,
    pub gravity: Vec3,
}

/// Gravity vector in sensor frame from ZYX Euler angles (degrees), per
/// spec.md §4.2's explicit formula.
pub fn gravity_from_euler(euler: &EulerAngles, g: f64) -> Vec3 {
    let roll = euler.roll.to_radians();
    let pitch = euler.pitch.to_radians();
    Vec3 {
        x: g * pitch.sin(),
        y: -g * roll.sin() * pitch.cos(),
        z: g * roll.cos() * pitch.cos(),
    }
}

/// Gravity vector in sensor frame from the orientation quaternion directly
/// (more accurate near gimbal lock than the Euler path).
pub fn gravity_from_quaternion(q: &Quaternion, g: f64) -> Vec3 {
    Vec3 {
        x: 2.0 * (q.x * q.z - q.w * q.y) * g,
        y: 2.0 * (q.w * q.x + q.y * q.z) * g,
        z: (q.w * q.w - q.x * q.x - q.y * q.y + q.z * q.z) * g,
    }
}

pub fn decompose(ax: f64, ay: f64, az: f64, gravity: Vec3) -> LinearAccel {
    LinearAccel {
        ax_lin: ax - gravity.x,
        ay_lin: ay - gravity.y,
        az_lin: az - gravity.z,
        gravity,
    }
}

/// Rotates a sensor-frame vector into the world frame using the orientation
/// quaternion (v' = q * v * q^-1), for callers that want acceleration
/// expressed in the world frame rather than sensor frame.
pub fn to_world_frame(q: &Quaternion, v: Vec3) -> Vec3 {
    let (w, x, y, z) = (q.w, q.x, q.y, q.z);
    // standard quaternion-vector rotation, expanded
    let ix = w * v.x + y * v.z - z * v.y;
    let iy = w * v.y + z * v.x - x * v.z;
    let iz = w * v.z + x * v.y - y * v.x;
    let iw = -x * v.x - y * v.y - z * v.z;

    Vec3 {
        x: ix * w + iw * -x + iy * -z - iz * -y,
        y: iy * w + iw * -y + iz * -x - ix * -z,
        z: iz * w + iw * -z + ix * -y - iy * -x,
    }
}

/// Adaptive variant (spec.md §4.2): tracks accel bias and gravity magnitude,
/// updated by EMA during detected stationary windows.
pub struct AdaptiveGravity {
    pub gravity_magnitude: f64,
    pub bias: Vec3,
    pub adapt_rate: f64,
    recent_mags: std::collections::VecDeque<f64>,
    stationary_variance_threshold: f64,
}

impl AdaptiveGravity {
    pub fn new() -> Self {
        Self {
            gravity_magnitude: DEFAULT_GRAVITY_MS2,
            bias: Vec3::default(),
            adapt_rate: DEFAULT_ADAPT_RATE,
            recent_mags: std::collections::VecDeque::with_capacity(STATIONARY_WINDOW),
            stationary_variance_threshold: 0.05,
        }
    }

    fn push_and_variance(&mut self, mag: f64) -> f64 {
        self.recent_mags.push_back(mag);
        while self.recent_mags.len() > STATIONARY_WINDOW {
            self.recent_mags.pop_front();
        }
        if self.recent_mags.len() < 2 {
            return f64::INFINITY;
        }
        let mean: f64 = self.recent_mags.iter().sum::<f64>() / self.recent_mags.len() as f64;
        self.recent_mags
            .iter()
            .map(|m| (m - mean).powi(2))
            .sum::<f64>()
            / self.recent_mags.len() as f64
    }

    /// Feed one raw accel reading plus the orientation-predicted gravity;
    /// updates gravity magnitude and bias only while stationary.
    ///
    /// NOTE: the bias_z EMA is updated from raw `az`, not the
    /// bias-corrected `az_corr`. This may double-count bias; kept as-is
    /// rather than silently "fixed".
    pub fn update(&mut self, ax: f64, ay: f64, az: f64, predicted_gravity: Vec3) {
        let mag = (ax * ax + ay * ay + az * az).sqrt();
        let variance = self.push_and_variance(mag);

        if variance < self.stationary_variance_threshold {
            let a = self.adapt_rate;
            self.gravity_magnitude = (1.0 - a) * self.gravity_magnitude + a * mag;
            self.bias.x = (1.0 - a) * self.bias.x + a * (ax - predicted_gravity.x);
            self.bias.y = (1.0 - a) * self.bias.y + a * (ay - predicted_gravity.y);
            self.bias.z = (1.0 - a) * self.bias.z + a * az;
        }
    }
}

impl Default for AdaptiveGravity {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_orientation_gravity_is_vertical() {
        let euler = EulerAngles {
            roll: 0.0,
            pitch: 0.0,
            yaw: 0.0,
        };
        let g = gravity_from_euler(&euler, DEFAULT_GRAVITY_MS2);
        assert!((g.z - DEFAULT_GRAVITY_MS2).abs() < 1e-9);
        assert!(g.x.abs() < 1e-9);
        assert!(g.y.abs() < 1e-9);
    }

    #[test]
    fn linear_accel_zero_when_only_gravity_present() {
        let gravity = Vec3 {
            x: 0.0,
            y: 0.0,
            z: DEFAULT_GRAVITY_MS2,
        };
        let lin = decompose(0.0, 0.0, DEFAULT_GRAVITY_MS2, gravity);
        assert!(lin.az_lin.abs() < 1e-9);
    }

    #[test]
    fn quaternion_path_matches_identity_euler_path() {
        let euler = EulerAngles::default();
        let q = Quaternion::IDENTITY;
        let from_euler = gravity_from_euler(&euler, DEFAULT_GRAVITY_MS2);
        let from_quat = gravity_from_quaternion(&q, DEFAULT_GRAVITY_MS2);
        assert!((from_euler.z - from_quat.z).abs() < 1e-9);
    }
}
