//! Benchmark the per-frame pipeline: extraction and full frame
//! processing on a synthetic room sweep.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use akasha_slam::{
    Calibration, ExtractionConfig, MapsConfig, Point, PointCloud, Slam, SlamConfig,
    SpinningSensorKeypointExtractor,
};
use nalgebra::{Isometry3, Vector3};

const NB_LINES: usize = 8;
const NB_AZIMUTHS: usize = 720;

/// Cast one stationary sweep of a 10 m × 8 m × 4 m room.
fn room_sweep(origin: Vector3<f64>, timestamp: f64, seq: u32) -> PointCloud {
    let room_min = Vector3::new(-5.0, -4.0, -1.5);
    let room_max = Vector3::new(5.0, 4.0, 2.5);
    let mut cloud = PointCloud::with_capacity("lidar", timestamp, seq, NB_LINES * NB_AZIMUTHS);
    for line in 0..NB_LINES {
        let vertical = (-25.0 + 50.0 * line as f64 / (NB_LINES - 1) as f64).to_radians();
        for step in 0..NB_AZIMUTHS {
            let azimuth = std::f64::consts::TAU * step as f64 / NB_AZIMUTHS as f64;
            let dir = Vector3::new(
                azimuth.cos() * vertical.cos(),
                azimuth.sin() * vertical.cos(),
                vertical.sin(),
            );
            let mut t_exit = f64::INFINITY;
            for k in 0..3 {
                if dir[k] > 1e-12 {
                    t_exit = t_exit.min((room_max[k] - origin[k]) / dir[k]);
                } else if dir[k] < -1e-12 {
                    t_exit = t_exit.min((room_min[k] - origin[k]) / dir[k]);
                }
            }
            let hit = dir * t_exit;
            let time = 0.1 * step as f64 / NB_AZIMUTHS as f64;
            cloud.push(Point::new(hit.x, hit.y, hit.z, time, line as u8, 0.0));
        }
    }
    cloud
}

fn bench_config() -> SlamConfig {
    SlamConfig {
        extraction: ExtractionConfig {
            edge_curvature_threshold: 2e-3,
            planar_curvature_threshold: 5e-4,
            nb_sectors: 12,
            ..Default::default()
        },
        maps: MapsConfig {
            voxel_grid_size: 20,
            voxel_grid_resolution: 5.0,
            leaf_size_edges: 0.2,
            leaf_size_planes: 0.3,
            leaf_size_blobs: 0.2,
            max_points_per_cell: 10_000,
        },
        ..Default::default()
    }
}

fn calibration() -> Calibration {
    Calibration::new(
        (0..NB_LINES)
            .map(|l| -25.0 + 50.0 * l as f64 / (NB_LINES - 1) as f64)
            .collect(),
    )
}

fn bench_extraction(c: &mut Criterion) {
    let config = bench_config();
    let sweep = room_sweep(Vector3::zeros(), 100.0, 1);
    let mapping = calibration().laser_id_mapping();
    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

    c.bench_function("keypoint_extraction", |b| {
        b.iter(|| {
            let mut extractor = SpinningSensorKeypointExtractor::new(config.extraction.clone());
            let keypoints = extractor.extract(
                black_box(&sweep),
                &mapping,
                &Isometry3::identity(),
                "base",
                &pool,
            );
            black_box(keypoints.planars.len())
        })
    });
}

fn bench_full_frame(c: &mut Criterion) {
    let frames: Vec<PointCloud> = (0..4u32)
        .map(|i| {
            room_sweep(
                Vector3::new(0.02 * i as f64, 0.0, 0.0),
                100.0 + 0.1 * i as f64,
                i + 1,
            )
        })
        .collect();

    c.bench_function("add_frame_sequence", |b| {
        b.iter(|| {
            let mut slam = Slam::new(bench_config()).unwrap();
            slam.set_calibration(&calibration()).unwrap();
            for frame in &frames {
                black_box(slam.add_frame(frame).unwrap());
            }
        })
    });
}

criterion_group!(benches, bench_extraction, bench_full_frame);
criterion_main!(benches);
