//! LiDAR point and sweep cloud types.

use nalgebra::{Isometry3, Vector3};
use serde::{Deserialize, Serialize};

/// One LiDAR return from a spinning multi-beam sensor.
///
/// Coordinates are metres in the cloud's frame. `time` is seconds
/// relative to the start of the sweep; `laser_id` indexes the physical
/// scan line (remapped by vertical angle before extraction).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// X coordinate in meters
    pub x: f64,
    /// Y coordinate in meters
    pub y: f64,
    /// Z coordinate in meters
    pub z: f64,
    /// Acquisition time in seconds relative to the sweep start
    pub time: f64,
    /// Physical scan line index
    pub laser_id: u8,
    /// Return intensity
    pub intensity: f32,
}

impl Point {
    /// Create a new point.
    #[inline]
    pub fn new(x: f64, y: f64, z: f64, time: f64, laser_id: u8, intensity: f32) -> Self {
        Self {
            x,
            y,
            z,
            time,
            laser_id,
            intensity,
        }
    }

    /// Position as a 3-vector.
    #[inline]
    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    /// Distance from the sensor origin.
    #[inline]
    pub fn range(&self) -> f64 {
        self.position().norm()
    }

    /// Squared distance to another point (avoids sqrt).
    #[inline]
    pub fn distance_squared(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }

    /// Same point with its position mapped through a rigid transform.
    ///
    /// `time`, `laser_id` and `intensity` are preserved.
    #[inline]
    pub fn transformed(&self, isometry: &Isometry3<f64>) -> Point {
        let p = isometry * nalgebra::Point3::new(self.x, self.y, self.z);
        Point {
            x: p.x,
            y: p.y,
            z: p.z,
            ..*self
        }
    }
}

/// An ordered point cloud produced by one full sensor sweep.
///
/// `timestamp` is the sweep epoch in UNIX seconds; every point's `time`
/// is relative to it. Within a single scan line, `time` is
/// monotonically non-decreasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    /// Name of the coordinate system the points are expressed in.
    pub frame_id: String,
    /// Sweep epoch, UNIX seconds.
    pub timestamp: f64,
    /// Sweep sequence number, used to detect dropped frames.
    pub seq: u32,
    /// The points, in acquisition order.
    pub points: Vec<Point>,
}

impl PointCloud {
    /// Create an empty cloud for the given sweep.
    pub fn new(frame_id: impl Into<String>, timestamp: f64, seq: u32) -> Self {
        Self {
            frame_id: frame_id.into(),
            timestamp,
            seq,
            points: Vec::new(),
        }
    }

    /// Create an empty cloud with preallocated storage.
    pub fn with_capacity(frame_id: impl Into<String>, timestamp: f64, seq: u32, n: usize) -> Self {
        Self {
            frame_id: frame_id.into(),
            timestamp,
            seq,
            points: Vec::with_capacity(n),
        }
    }

    /// Number of points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the cloud has no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Append a point.
    #[inline]
    pub fn push(&mut self, point: Point) {
        self.points.push(point);
    }

    /// Append a raw sensor return.
    ///
    /// `adjusted_time_us` is microseconds since the UNIX epoch, as
    /// delivered by the sensor driver; it is converted to seconds
    /// relative to the sweep epoch.
    pub fn push_raw(
        &mut self,
        x: f64,
        y: f64,
        z: f64,
        intensity: f32,
        laser_id: u8,
        adjusted_time_us: u64,
    ) {
        let time = adjusted_time_us as f64 * 1e-6 - self.timestamp;
        self.points.push(Point::new(x, y, z, time, laser_id, intensity));
    }

    /// Sweep duration: largest relative point time, 0 for clouds
    /// without time information.
    pub fn duration(&self) -> f64 {
        self.points
            .iter()
            .map(|p| p.time)
            .fold(0.0_f64, f64::max)
    }

    /// Radius of the smallest origin-centred sphere containing all
    /// points.
    pub fn bounding_radius(&self) -> f64 {
        self.points.iter().map(|p| p.range()).fold(0.0_f64, f64::max)
    }

    /// Centroid of the cloud, or the origin if empty.
    pub fn centroid(&self) -> Vector3<f64> {
        if self.points.is_empty() {
            return Vector3::zeros();
        }
        let sum: Vector3<f64> = self.points.iter().map(|p| p.position()).sum();
        sum / self.points.len() as f64
    }

    /// Point-for-point copy with every position mapped through a rigid
    /// transform, re-labelled with the given frame id.
    pub fn transformed(&self, isometry: &Isometry3<f64>, frame_id: impl Into<String>) -> PointCloud {
        PointCloud {
            frame_id: frame_id.into(),
            timestamp: self.timestamp,
            seq: self.seq,
            points: self.points.iter().map(|p| p.transformed(isometry)).collect(),
        }
    }

    /// Map every position in place through a rigid transform.
    pub fn transform_in_place(&mut self, isometry: &Isometry3<f64>) {
        for p in &mut self.points {
            *p = p.transformed(isometry);
        }
    }
}
