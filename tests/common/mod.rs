//! Shared fixtures for the end-to-end scenarios: synthetic sweeps of
//! simple box environments, cast by exact ray-AABB intersection from
//! the per-point interpolated sensor pose.

use akasha_slam::{Calibration, ExtractionConfig, MapsConfig, Point, PointCloud, SlamConfig};
use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};

pub const NB_LINES: usize = 8;
pub const NB_AZIMUTHS: usize = 360;
pub const SWEEP_DURATION: f64 = 0.1;

/// A 10 m × 8 m × 4 m room around the world origin.
pub fn room() -> (Vector3<f64>, Vector3<f64>) {
    (Vector3::new(-5.0, -4.0, -1.5), Vector3::new(5.0, 4.0, 2.5))
}

/// A 5 m wide corridor running 30 m along +x.
pub fn corridor() -> (Vector3<f64>, Vector3<f64>) {
    (Vector3::new(-5.0, -2.5, -1.5), Vector3::new(25.0, 2.5, 1.5))
}

/// Vertical beam angle of one scan line, degrees.
fn vertical_angle(line: usize) -> f64 {
    -25.0 + 50.0 * line as f64 / (NB_LINES - 1) as f64
}

/// Calibration table matching [`vertical_angle`].
pub fn calibration() -> Calibration {
    Calibration::new((0..NB_LINES).map(vertical_angle).collect())
}

/// Engine configuration tuned for the synthetic environments.
pub fn config() -> SlamConfig {
    let mut config = SlamConfig {
        extraction: ExtractionConfig {
            edge_curvature_threshold: 2e-3,
            planar_curvature_threshold: 5e-4,
            // Narrow sectors so sparse but load-bearing structure
            // (e.g. a distant end wall) still wins planar picks.
            nb_sectors: 12,
            ..Default::default()
        },
        maps: MapsConfig {
            voxel_grid_size: 20,
            voxel_grid_resolution: 5.0,
            leaf_size_edges: 0.2,
            leaf_size_planes: 0.25,
            leaf_size_blobs: 0.2,
            max_points_per_cell: 10_000,
        },
        ..Default::default()
    };
    // Synthetic corner columns carry few edge points per frame.
    config.ego_motion.line_nbr_neighbors = 6;
    config.localization.line_nbr_neighbors = 6;
    config.localization.min_line_neighbors = 3;
    config
}

/// A pose translated by `(x, y, z)` and yawed by `yaw` radians.
pub fn pose(x: f64, y: f64, z: f64, yaw: f64) -> Isometry3<f64> {
    Isometry3::from_parts(
        Translation3::new(x, y, z),
        UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
    )
}

/// Cast one sweep of the axis-aligned box `room`, with the sensor
/// moving from `begin` to `end` over the sweep (LERP translation,
/// SLERP rotation). Points are returned in LIDAR coordinates with
/// their sweep-relative acquisition time.
pub fn sweep_between(
    begin: &Isometry3<f64>,
    end: &Isometry3<f64>,
    room: (Vector3<f64>, Vector3<f64>),
    timestamp: f64,
    seq: u32,
) -> PointCloud {
    let (room_min, room_max) = room;
    let mut cloud =
        PointCloud::with_capacity("lidar", timestamp, seq, NB_LINES * NB_AZIMUTHS);
    for line in 0..NB_LINES {
        let vertical = vertical_angle(line).to_radians();
        for step in 0..NB_AZIMUTHS {
            let time = SWEEP_DURATION * step as f64 / NB_AZIMUTHS as f64;
            let s = time / SWEEP_DURATION;
            let translation =
                begin.translation.vector + s * (end.translation.vector - begin.translation.vector);
            let rotation = begin
                .rotation
                .try_slerp(&end.rotation, s, 1e-12)
                .unwrap_or(end.rotation);
            let pose_t = Isometry3::from_parts(Translation3::from(translation), rotation);

            let azimuth = std::f64::consts::TAU * step as f64 / NB_AZIMUTHS as f64;
            let dir_lidar = Vector3::new(
                azimuth.cos() * vertical.cos(),
                azimuth.sin() * vertical.cos(),
                vertical.sin(),
            );
            let dir_world = pose_t.rotation * dir_lidar;
            let origin = pose_t.translation.vector;

            let mut t_exit = f64::INFINITY;
            for k in 0..3 {
                let d = dir_world[k];
                if d > 1e-12 {
                    t_exit = t_exit.min((room_max[k] - origin[k]) / d);
                } else if d < -1e-12 {
                    t_exit = t_exit.min((room_min[k] - origin[k]) / d);
                }
            }
            let hit_lidar = dir_lidar * t_exit;
            cloud.push(Point::new(
                hit_lidar.x,
                hit_lidar.y,
                hit_lidar.z,
                time,
                line as u8,
                0.0,
            ));
        }
    }
    cloud
}

/// A sweep from a stationary sensor.
pub fn static_sweep(
    pose: &Isometry3<f64>,
    room: (Vector3<f64>, Vector3<f64>),
    timestamp: f64,
    seq: u32,
) -> PointCloud {
    sweep_between(pose, pose, room, timestamp, seq)
}
