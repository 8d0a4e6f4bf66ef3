//! Keypoint extractor configuration.

use serde::{Deserialize, Serialize};

/// Configuration for [`super::SpinningSensorKeypointExtractor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Half-width `W` of the curvature window along a scan line.
    ///
    /// The smoothness score of a point is the squared norm of the mean
    /// offset to its `2W` window neighbours. Points within `W` of a
    /// line end cannot be scored and are invalid.
    pub curvature_window: usize,

    /// Scan lines with fewer points than this are discarded entirely.
    pub min_points_per_line: usize,

    /// Minimum number of usable scan lines for a sweep to be processed.
    ///
    /// Enforced upstream by frame checking: sweeps with fewer than
    /// `min_points_per_line * min_valid_lines` points are rejected.
    pub min_valid_lines: usize,

    /// Number of equal azimuth sectors per scan line.
    ///
    /// Keypoints are selected per sector to spread them over the whole
    /// sweep instead of clustering on the strongest structure.
    pub nb_sectors: usize,

    /// Maximum edge keypoints selected per sector.
    pub max_edges_per_sector: usize,

    /// Maximum planar keypoints selected per sector.
    pub max_planars_per_sector: usize,

    /// Curvature above which a valid point qualifies as an edge (m²).
    pub edge_curvature_threshold: f64,

    /// Curvature below which a valid point qualifies as planar (m²).
    pub planar_curvature_threshold: f64,

    /// Range difference between successive returns marking a depth
    /// discontinuity (meters). The far side of the gap is occluded and
    /// its `W` adjacent points are invalidated.
    pub depth_gap_threshold: f64,

    /// Minimum angle between the beam and the local surface direction
    /// (radians). Grazing returns below this angle are invalidated.
    pub min_beam_surface_angle: f64,

    /// Returns closer to the sensor than this are invalid (meters).
    pub min_distance_to_sensor: f64,

    /// Emit blob keypoints from isotropic neighbourhoods.
    pub enable_blobs: bool,

    /// Stride between blob candidate points along a line.
    pub blob_stride: usize,

    /// Maximum eigenvalue ratio `λ_max / λ_min` for a neighbourhood to
    /// count as isotropic.
    pub blob_isotropy_factor: f64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            curvature_window: 5,
            min_points_per_line: 15,
            min_valid_lines: 4,
            nb_sectors: 4,
            max_edges_per_sector: 4,
            max_planars_per_sector: 8,
            edge_curvature_threshold: 0.01,
            planar_curvature_threshold: 0.001,
            depth_gap_threshold: 0.15,
            min_beam_surface_angle: 0.175, // ~10°
            min_distance_to_sensor: 1.0,
            enable_blobs: false,
            blob_stride: 6,
            blob_isotropy_factor: 3.0,
        }
    }
}
