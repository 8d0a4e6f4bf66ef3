//! Timestamped rigid transforms.

use nalgebra::{Isometry3, Vector6};
use serde::{Deserialize, Serialize};

use crate::core::math::{isometry_from_pose6, pose6_from_isometry};

/// A rigid SE(3) pose with a UNIX timestamp and the name of the frame
/// it is expressed in.
///
/// The trajectory output of the engine is a sequence of `Transform`s
/// describing BASE origin in WORLD coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    /// The rigid transform.
    pub isometry: Isometry3<f64>,
    /// UNIX timestamp in seconds.
    pub time: f64,
    /// Reference frame name.
    pub frame_id: String,
}

impl Transform {
    /// Create a new timestamped transform.
    pub fn new(isometry: Isometry3<f64>, time: f64, frame_id: impl Into<String>) -> Self {
        Self {
            isometry,
            time,
            frame_id: frame_id.into(),
        }
    }

    /// Identity transform at time 0 in the given frame.
    pub fn identity(frame_id: impl Into<String>) -> Self {
        Self::new(Isometry3::identity(), 0.0, frame_id)
    }

    /// Build from a `(x, y, z, rx, ry, rz)` six-vector (XYZ Euler).
    pub fn from_pose6(pose: &Vector6<f64>, time: f64, frame_id: impl Into<String>) -> Self {
        Self::new(isometry_from_pose6(pose), time, frame_id)
    }

    /// Pack into a `(x, y, z, rx, ry, rz)` six-vector (XYZ Euler).
    #[inline]
    pub fn pose6(&self) -> Vector6<f64> {
        pose6_from_isometry(&self.isometry)
    }

    /// Translation component.
    #[inline]
    pub fn translation(&self) -> nalgebra::Vector3<f64> {
        self.isometry.translation.vector
    }
}
