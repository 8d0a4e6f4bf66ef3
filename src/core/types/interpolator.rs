//! Within-sweep pose interpolation.

use nalgebra::{Isometry3, Translation3};

/// Linear interpolator between two timestamped SE(3) poses.
///
/// Translation is interpolated linearly, rotation by SLERP. Queries
/// outside `[t0, t1]` are clamped to the nearest endpoint, so the
/// interpolator never extrapolates.
///
/// Used for motion compensation: under the constant-velocity
/// hypothesis, the sensor pose at a point acquired at sweep-relative
/// time `t` is `interpolate(t)` between the begin-sweep and end-sweep
/// poses.
#[derive(Debug, Clone)]
pub struct MotionInterpolator {
    t0: f64,
    pose0: Isometry3<f64>,
    t1: f64,
    pose1: Isometry3<f64>,
}

impl MotionInterpolator {
    /// Create an interpolator between `(t0, pose0)` and `(t1, pose1)`.
    pub fn new(t0: f64, pose0: Isometry3<f64>, t1: f64, pose1: Isometry3<f64>) -> Self {
        Self {
            t0,
            pose0,
            t1,
            pose1,
        }
    }

    /// Interpolator that is constant at the given pose.
    pub fn constant(pose: Isometry3<f64>) -> Self {
        Self::new(0.0, pose, 0.0, pose)
    }

    /// Begin pose.
    #[inline]
    pub fn begin(&self) -> &Isometry3<f64> {
        &self.pose0
    }

    /// End pose.
    #[inline]
    pub fn end(&self) -> &Isometry3<f64> {
        &self.pose1
    }

    /// Normalized position of `t` in `[t0, t1]`, clamped to `[0, 1]`.
    ///
    /// A degenerate interval (`t1 <= t0`) maps everything to 1, i.e.
    /// the end pose.
    #[inline]
    pub fn ratio(&self, t: f64) -> f64 {
        if self.t1 <= self.t0 {
            return 1.0;
        }
        ((t - self.t0) / (self.t1 - self.t0)).clamp(0.0, 1.0)
    }

    /// Pose at time `t`: LERP on translation, SLERP on rotation.
    pub fn interpolate(&self, t: f64) -> Isometry3<f64> {
        let s = self.ratio(t);
        self.at_ratio(s)
    }

    /// Pose at a pre-computed ratio in `[0, 1]`.
    pub fn at_ratio(&self, s: f64) -> Isometry3<f64> {
        let translation = self.pose0.translation.vector
            + s * (self.pose1.translation.vector - self.pose0.translation.vector);
        let rotation = self
            .pose0
            .rotation
            .try_slerp(&self.pose1.rotation, s, 1e-9)
            .unwrap_or(if s < 0.5 { self.pose0.rotation } else { self.pose1.rotation });
        Isometry3::from_parts(Translation3::from(translation), rotation)
    }
}
