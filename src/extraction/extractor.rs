//! Keypoint extraction from structured multi-beam sweeps.
//!
//! Each scan line is processed independently:
//!
//! 1. Compute a smoothness score per point: the squared norm of the
//!    mean offset to the `2W` neighbours inside the curvature window.
//! 2. Invalidate points that cannot be scored (line ends), grazing
//!    returns, returns too close to the sensor, and the occluded side
//!    of depth discontinuities.
//! 3. Split the line into equal azimuth sectors and select, per
//!    sector, the highest-curvature points as edges and the
//!    lowest-curvature points as planars, suppressing the window
//!    around each pick so keypoints do not cluster.
//! 4. Optionally emit blob keypoints where the neighbourhood PCA shows
//!    three comparable eigenvalues.
//!
//! All keypoints are mapped from LIDAR to BASE coordinates before
//! being returned.

use std::cmp::Ordering;
use std::collections::HashMap;

use nalgebra::{Isometry3, Matrix3, Vector3};
use rayon::prelude::*;

use super::config::ExtractionConfig;
use crate::core::types::{Point, PointCloud};

/// Keypoint sets extracted from one sweep, in BASE coordinates.
#[derive(Debug, Clone)]
pub struct Keypoints {
    /// High-curvature points (depth discontinuities, poles, corners).
    pub edges: PointCloud,
    /// Low-curvature points lying on locally flat surfaces.
    pub planars: PointCloud,
    /// Points with an isotropic neighbourhood, empty unless enabled.
    pub blobs: PointCloud,
    /// Every point that survived the validity checks. Used as the
    /// planar candidate pool when the fast-slam switch is off.
    pub valid: PointCloud,
}

/// Per-point outcome of one processed scan line.
#[derive(Debug, Clone, Copy)]
struct LineEntry {
    /// Index of the point in the input sweep.
    orig: usize,
    curvature: f64,
    valid: bool,
    /// 0 = none, 1 = edge, 2 = planar, 3 = blob.
    label: u8,
}

/// Keypoint extractor for spinning multi-beam sensors.
///
/// Stateless between sweeps except for the debug arrays of the last
/// extraction.
pub struct SpinningSensorKeypointExtractor {
    config: ExtractionConfig,
    debug: HashMap<String, Vec<f64>>,
}

impl SpinningSensorKeypointExtractor {
    /// Create an extractor with the given configuration.
    pub fn new(config: ExtractionConfig) -> Self {
        Self {
            config,
            debug: HashMap::new(),
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Per-point debug arrays of the last extraction: `curvature`,
    /// `is_valid` and `keypoint_label`, aligned with the input sweep.
    pub fn debug_arrays(&self) -> &HashMap<String, Vec<f64>> {
        &self.debug
    }

    /// Extract keypoints from one sweep.
    ///
    /// `laser_id_mapping[k]` is the physical laser index with the
    /// `k`-th largest vertical angle; points whose `laser_id` is not
    /// covered by the mapping are ignored. Scan lines are processed in
    /// parallel on `pool`.
    pub fn extract(
        &mut self,
        cloud: &PointCloud,
        laser_id_mapping: &[usize],
        base_to_lidar_offset: &Isometry3<f64>,
        base_frame_id: &str,
        pool: &rayon::ThreadPool,
    ) -> Keypoints {
        // Invert the mapping: physical laser id -> vertical-angle rank.
        let mut rank_of_laser = vec![usize::MAX; laser_id_mapping.len()];
        for (rank, &laser) in laser_id_mapping.iter().enumerate() {
            if laser < rank_of_laser.len() {
                rank_of_laser[laser] = rank;
            }
        }

        // Group points by scan line, preserving acquisition order.
        let mut lines: Vec<Vec<(usize, Point)>> = vec![Vec::new(); laser_id_mapping.len()];
        for (i, p) in cloud.points.iter().enumerate() {
            let laser = p.laser_id as usize;
            if laser < rank_of_laser.len() && rank_of_laser[laser] != usize::MAX {
                lines[rank_of_laser[laser]].push((i, *p));
            }
        }

        let config = &self.config;
        let outputs: Vec<Vec<LineEntry>> = pool.install(|| {
            lines
                .par_iter()
                .map(|line| process_line(line, config))
                .collect()
        });

        // Merge line outputs into debug arrays and keypoint clouds.
        let n = cloud.len();
        let mut curvature = vec![f64::NAN; n];
        let mut is_valid = vec![0.0; n];
        let mut keypoint_label = vec![0.0; n];

        let mut edges = PointCloud::new(base_frame_id, cloud.timestamp, cloud.seq);
        let mut planars = PointCloud::new(base_frame_id, cloud.timestamp, cloud.seq);
        let mut blobs = PointCloud::new(base_frame_id, cloud.timestamp, cloud.seq);
        let mut valid = PointCloud::new(base_frame_id, cloud.timestamp, cloud.seq);

        for entry in outputs.iter().flatten() {
            curvature[entry.orig] = entry.curvature;
            is_valid[entry.orig] = if entry.valid { 1.0 } else { 0.0 };
            keypoint_label[entry.orig] = entry.label as f64;

            let point = cloud.points[entry.orig].transformed(base_to_lidar_offset);
            if entry.valid {
                valid.push(point);
            }
            match entry.label {
                1 => edges.push(point),
                2 => planars.push(point),
                3 => blobs.push(point),
                _ => {}
            }
        }

        self.debug.clear();
        self.debug.insert("curvature".into(), curvature);
        self.debug.insert("is_valid".into(), is_valid);
        self.debug.insert("keypoint_label".into(), keypoint_label);

        Keypoints {
            edges,
            planars,
            blobs,
            valid,
        }
    }
}

/// Classify the points of one scan line.
fn process_line(line: &[(usize, Point)], config: &ExtractionConfig) -> Vec<LineEntry> {
    let n = line.len();
    let w = config.curvature_window;
    if n < config.min_points_per_line || n <= 2 * w {
        // Line too short to score: every point is invalid.
        return line
            .iter()
            .map(|&(orig, _)| LineEntry {
                orig,
                curvature: f64::NAN,
                valid: false,
                label: 0,
            })
            .collect();
    }

    let positions: Vec<Vector3<f64>> = line.iter().map(|(_, p)| p.position()).collect();
    let ranges: Vec<f64> = positions.iter().map(|p| p.norm()).collect();

    let mut valid = vec![true; n];

    // Window ends cannot be scored.
    for i in 0..w {
        valid[i] = false;
        valid[n - 1 - i] = false;
    }

    // Returns too close to the sensor.
    for i in 0..n {
        if ranges[i] < config.min_distance_to_sensor {
            valid[i] = false;
        }
    }

    // Depth discontinuities: the far side of a range gap is occluded,
    // so the window adjacent to the gap is unreliable.
    for i in 0..n - 1 {
        let gap = ranges[i + 1] - ranges[i];
        if gap > config.depth_gap_threshold {
            for v in valid.iter_mut().skip(i + 1).take(w) {
                *v = false;
            }
        } else if gap < -config.depth_gap_threshold {
            for v in valid.iter_mut().take(i + 1).skip(i.saturating_sub(w - 1)) {
                *v = false;
            }
        }
    }

    // Grazing returns: local surface direction nearly parallel to the
    // beam.
    let cos_threshold = config.min_beam_surface_angle.cos();
    for i in 1..n - 1 {
        if !valid[i] {
            continue;
        }
        let surface = positions[i + 1] - positions[i - 1];
        let beam_norm = ranges[i];
        let surface_norm = surface.norm();
        if beam_norm <= 0.0 || surface_norm <= 0.0 {
            valid[i] = false;
            continue;
        }
        let cos_angle = (surface.dot(&positions[i]) / (surface_norm * beam_norm)).abs();
        if cos_angle > cos_threshold {
            valid[i] = false;
        }
    }

    // Smoothness score: squared norm of the mean neighbour offset.
    let mut curvature = vec![f64::NAN; n];
    for i in w..n - w {
        let mut mean = Vector3::zeros();
        for j in i - w..=i + w {
            if j != i {
                mean += positions[j] - positions[i];
            }
        }
        mean /= (2 * w) as f64;
        curvature[i] = mean.norm_squared();
    }

    // Sector-based selection with window suppression.
    let mut picked = vec![false; n];
    let mut label = vec![0u8; n];
    let sectors = config.nb_sectors.max(1);
    for s in 0..sectors {
        let start = s * n / sectors;
        let end = (s + 1) * n / sectors;
        let mut candidates: Vec<usize> = (start..end)
            .filter(|&i| valid[i] && curvature[i].is_finite())
            .collect();

        // Edges: highest curvature first.
        candidates.sort_by(|&a, &b| {
            curvature[b]
                .partial_cmp(&curvature[a])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        let mut nb_edges = 0;
        for &i in &candidates {
            if nb_edges >= config.max_edges_per_sector
                || curvature[i] <= config.edge_curvature_threshold
            {
                break;
            }
            if picked[i] {
                continue;
            }
            label[i] = 1;
            nb_edges += 1;
            suppress(&mut picked, i, w, n);
        }

        // Planars: lowest curvature first.
        candidates.sort_by(|&a, &b| {
            curvature[a]
                .partial_cmp(&curvature[b])
                .unwrap_or(Ordering::Equal)
                .then(a.cmp(&b))
        });
        let mut nb_planars = 0;
        for &i in &candidates {
            if nb_planars >= config.max_planars_per_sector
                || curvature[i] >= config.planar_curvature_threshold
            {
                break;
            }
            if picked[i] {
                continue;
            }
            label[i] = 2;
            nb_planars += 1;
            suppress(&mut picked, i, w, n);
        }
    }

    // Blobs: isotropic neighbourhoods, strided to bound the count.
    if config.enable_blobs {
        let stride = config.blob_stride.max(1);
        let mut i = w;
        while i + w < n {
            if valid[i] && label[i] == 0 {
                if let Some((lambda_min, lambda_max)) = window_eigen_extrema(&positions, i, w) {
                    if lambda_min > 0.0 && lambda_max <= config.blob_isotropy_factor * lambda_min {
                        label[i] = 3;
                    }
                }
            }
            i += stride;
        }
    }

    line.iter()
        .enumerate()
        .map(|(i, &(orig, _))| LineEntry {
            orig,
            curvature: curvature[i],
            valid: valid[i],
            label: label[i],
        })
        .collect()
}

/// Mark the `±w` window around a selected keypoint as used.
#[inline]
fn suppress(picked: &mut [bool], i: usize, w: usize, n: usize) {
    for p in picked.iter_mut().take((i + w + 1).min(n)).skip(i.saturating_sub(w)) {
        *p = true;
    }
}

/// Smallest and largest eigenvalues of the covariance of the window
/// around `i`. Returns `None` when the decomposition is not finite.
fn window_eigen_extrema(positions: &[Vector3<f64>], i: usize, w: usize) -> Option<(f64, f64)> {
    let nb = 2 * w + 1;
    let mut centroid = Vector3::zeros();
    for p in &positions[i - w..=i + w] {
        centroid += p;
    }
    centroid /= nb as f64;

    let mut cov = Matrix3::zeros();
    for p in &positions[i - w..=i + w] {
        let d = p - centroid;
        cov += d * d.transpose();
    }
    cov /= nb as f64;

    let eigenvalues = cov.symmetric_eigen().eigenvalues;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    for &v in eigenvalues.iter() {
        if !v.is_finite() {
            return None;
        }
        min = min.min(v);
        max = max.max(v);
    }
    Some((min, max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn test_pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap()
    }

    /// One horizontal scan line sweeping two walls that meet in a 90°
    /// corner: wall x = 5 for azimuth < 45°, wall y = 5 beyond.
    fn corner_line(nb_points: usize) -> (PointCloud, usize) {
        let mut cloud = PointCloud::new("lidar", 0.0, 0);
        let az_min = 10.0_f64.to_radians();
        let az_max = 80.0_f64.to_radians();
        let mut corner_idx = 0;
        for i in 0..nb_points {
            let az = az_min + (az_max - az_min) * i as f64 / (nb_points - 1) as f64;
            let range = if az <= 45.0_f64.to_radians() {
                corner_idx = i;
                5.0 / az.cos()
            } else {
                5.0 / az.sin()
            };
            let t = 0.1 * i as f64 / nb_points as f64;
            cloud.push(Point::new(range * az.cos(), range * az.sin(), 0.0, t, 0, 0.0));
        }
        (cloud, corner_idx)
    }

    fn extract_with(
        cloud: &PointCloud,
        config: ExtractionConfig,
    ) -> (Keypoints, HashMap<String, Vec<f64>>) {
        let mut extractor = SpinningSensorKeypointExtractor::new(config);
        let pool = test_pool();
        let kp = extractor.extract(cloud, &[0], &Isometry3::identity(), "base", &pool);
        (kp, extractor.debug_arrays().clone())
    }

    #[test]
    fn test_corner_produces_edge_near_corner() {
        let (cloud, corner_idx) = corner_line(200);
        let config = ExtractionConfig {
            edge_curvature_threshold: 1e-3,
            planar_curvature_threshold: 1e-5,
            nb_sectors: 4,
            ..Default::default()
        };
        let (kp, debug) = extract_with(&cloud, config);
        assert!(!kp.edges.is_empty(), "corner should yield an edge keypoint");

        // The strongest edge must sit within the curvature window of
        // the geometric corner.
        let labels = &debug["keypoint_label"];
        let edge_indices: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == 1.0)
            .map(|(i, _)| i)
            .collect();
        assert!(
            edge_indices.iter().any(|&i| i.abs_diff(corner_idx) <= 6),
            "no edge within the window of the corner at {corner_idx}, got {edge_indices:?}"
        );
    }

    #[test]
    fn test_flat_wall_produces_planars_not_edges() {
        // Pure wall segment, azimuths away from grazing angles.
        let mut cloud = PointCloud::new("lidar", 0.0, 0);
        for i in 0..120 {
            let az = (-25.0 + 50.0 * i as f64 / 119.0).to_radians();
            let range = 5.0 / az.cos();
            cloud.push(Point::new(range * az.cos(), range * az.sin(), 0.0, 0.0, 0, 0.0));
        }
        let config = ExtractionConfig {
            edge_curvature_threshold: 1e-3,
            planar_curvature_threshold: 1e-4,
            ..Default::default()
        };
        let (kp, _) = extract_with(&cloud, config);
        assert!(kp.edges.is_empty(), "flat wall must not yield edges");
        assert!(!kp.planars.is_empty(), "flat wall should yield planars");
    }

    #[test]
    fn test_short_line_discarded() {
        let mut cloud = PointCloud::new("lidar", 0.0, 0);
        for i in 0..10 {
            cloud.push(Point::new(5.0, i as f64 * 0.1, 0.0, 0.0, 0, 0.0));
        }
        let config = ExtractionConfig {
            min_points_per_line: 15,
            ..Default::default()
        };
        let (kp, debug) = extract_with(&cloud, config);
        assert!(kp.edges.is_empty());
        assert!(kp.planars.is_empty());
        assert!(kp.valid.is_empty());
        assert!(debug["is_valid"].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_depth_gap_invalidates_far_side() {
        // Near wall then a jump to a far wall: the far-side window
        // bordering the gap must be invalid.
        let mut cloud = PointCloud::new("lidar", 0.0, 0);
        for i in 0..60 {
            let az = (-15.0 + 15.0 * i as f64 / 59.0).to_radians();
            let range = 4.0 / az.cos();
            cloud.push(Point::new(range * az.cos(), range * az.sin(), 0.0, 0.0, 0, 0.0));
        }
        let gap_start = cloud.len();
        for i in 0..60 {
            let az = (0.3 + 15.0 * i as f64 / 59.0).to_radians();
            let range = 12.0 / az.cos();
            cloud.push(Point::new(range * az.cos(), range * az.sin(), 0.0, 0.0, 0, 0.0));
        }
        let (_, debug) = extract_with(&cloud, ExtractionConfig::default());
        let is_valid = &debug["is_valid"];
        for i in gap_start..gap_start + 5 {
            assert_eq!(is_valid[i], 0.0, "point {i} after the gap should be invalid");
        }
    }

    #[test]
    fn test_window_ends_invalid() {
        let (cloud, _) = corner_line(100);
        let (_, debug) = extract_with(&cloud, ExtractionConfig::default());
        let is_valid = &debug["is_valid"];
        for i in 0..5 {
            assert_eq!(is_valid[i], 0.0);
            assert_eq!(is_valid[99 - i], 0.0);
        }
    }

    #[test]
    fn test_blobs_from_isotropic_neighbourhood() {
        // A noisy cluster is isotropic; a clean wall segment is not.
        let mut rng = StdRng::seed_from_u64(7);
        let mut cloud = PointCloud::new("lidar", 0.0, 0);
        for _ in 0..40 {
            cloud.push(Point::new(
                5.0 + rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                rng.gen_range(-0.5..0.5),
                0.0,
                0,
                0.0,
            ));
        }
        let config = ExtractionConfig {
            enable_blobs: true,
            blob_stride: 1,
            blob_isotropy_factor: 10.0,
            // Disable the selection and validity filters that are not
            // under test: no edge/planar picks, no gap or grazing
            // rejection on the noisy cluster.
            edge_curvature_threshold: f64::INFINITY,
            planar_curvature_threshold: 0.0,
            depth_gap_threshold: f64::INFINITY,
            min_beam_surface_angle: 0.0,
            min_points_per_line: 15,
            ..Default::default()
        };
        let (kp, _) = extract_with(&cloud, config);
        assert!(!kp.blobs.is_empty(), "isotropic cluster should yield blobs");
    }

    #[test]
    fn test_base_to_lidar_offset_applied() {
        let (cloud, _) = corner_line(200);
        let offset = Isometry3::translation(0.0, 0.0, 1.5);
        let mut extractor = SpinningSensorKeypointExtractor::new(ExtractionConfig {
            edge_curvature_threshold: 1e-3,
            ..Default::default()
        });
        let pool = test_pool();
        let kp = extractor.extract(&cloud, &[0], &offset, "base", &pool);
        // The line lies at z = 0 in LIDAR, so z = 1.5 in BASE.
        assert!(!kp.valid.is_empty());
        for p in &kp.valid.points {
            assert!((p.z - 1.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_unmapped_laser_ignored() {
        let (mut cloud, _) = corner_line(200);
        for p in cloud.points.iter_mut().take(50) {
            p.laser_id = 9; // not covered by the mapping
        }
        let (kp, _) = extract_with(&cloud, ExtractionConfig::default());
        assert!(kp.valid.points.len() <= 150);
    }
}
