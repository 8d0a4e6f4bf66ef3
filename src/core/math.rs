//! Mathematical primitives for rigid-body motion in 3D.
//!
//! Conversions between the SE(3) representation used internally
//! ([`nalgebra::Isometry3`]) and the compact `(x, y, z, rx, ry, rz)`
//! six-vector used at the optimizer boundary and in trajectory records.
//! Rotations in the six-vector are fixed-axis XYZ Euler angles (roll,
//! pitch, yaw); the optimizer itself perturbs in axis-angle, see
//! [`crate::registration`].

use nalgebra::{Isometry3, Matrix3, Rotation3, Translation3, UnitQuaternion, Vector3, Vector6};

/// Skew-symmetric (cross-product) matrix of a 3-vector.
///
/// `skew(a) * b == a × b` for any `b`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rotation matrix from an axis-angle vector (SO(3) exponential map).
#[inline]
pub fn so3_exp(omega: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::new(*omega)
}

/// Axis-angle vector of a rotation (SO(3) logarithm map).
#[inline]
pub fn so3_log(rotation: &Rotation3<f64>) -> Vector3<f64> {
    rotation.scaled_axis()
}

/// Pack an isometry into `(x, y, z, rx, ry, rz)` with XYZ Euler angles.
#[inline]
pub fn pose6_from_isometry(isometry: &Isometry3<f64>) -> Vector6<f64> {
    let t = isometry.translation.vector;
    let (roll, pitch, yaw) = isometry.rotation.euler_angles();
    Vector6::new(t.x, t.y, t.z, roll, pitch, yaw)
}

/// Rebuild an isometry from `(x, y, z, rx, ry, rz)` with XYZ Euler angles.
#[inline]
pub fn isometry_from_pose6(pose: &Vector6<f64>) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(pose[0], pose[1], pose[2]),
        UnitQuaternion::from_euler_angles(pose[3], pose[4], pose[5]),
    )
}

/// Angle of the relative rotation between two isometries, in radians.
#[inline]
pub fn rotation_between(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    a.rotation.angle_to(&b.rotation)
}

/// Euclidean distance between the translations of two isometries.
#[inline]
pub fn translation_between(a: &Isometry3<f64>, b: &Isometry3<f64>) -> f64 {
    (a.translation.vector - b.translation.vector).norm()
}
