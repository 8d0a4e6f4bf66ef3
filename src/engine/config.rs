//! Engine configuration.

use std::path::Path;

use nalgebra::Isometry3;
use serde::{Deserialize, Serialize};

use crate::error::SlamError;
use crate::extraction::ExtractionConfig;
use crate::registration::{MatchingConfig, UndistortionMode};

/// How the ego-motion (approximate relative motion since the last
/// frame) is estimated before localization refines it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EgoMotionMode {
    /// No prior: localization starts from the previous pose.
    None,
    /// Register the current keypoints onto the previous frame's.
    Registration,
    /// Constant-velocity extrapolation from the two previous poses.
    MotionExtrapolation,
    /// Registration seeded by the constant-velocity extrapolation.
    MotionExtrapolationAndRegistration,
}

/// Rolling grid parameters, shared shape across the three maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapsConfig {
    /// Number of cells per grid side (`G`).
    pub voxel_grid_size: usize,
    /// Edge length of one cell, meters.
    pub voxel_grid_resolution: f64,
    /// Voxel-filter leaf size of the edges map, meters.
    pub leaf_size_edges: f64,
    /// Voxel-filter leaf size of the planes map, meters.
    pub leaf_size_planes: f64,
    /// Voxel-filter leaf size of the blobs map, meters.
    pub leaf_size_blobs: f64,
    /// Point cap per grid cell.
    pub max_points_per_cell: usize,
}

impl Default for MapsConfig {
    fn default() -> Self {
        Self {
            voxel_grid_size: 50,
            voxel_grid_resolution: 10.0,
            leaf_size_edges: 0.30,
            leaf_size_planes: 0.60,
            leaf_size_blobs: 0.30,
            max_points_per_cell: 10_000,
        }
    }
}

/// Full configuration of the SLAM engine.
///
/// Read-only after the first frame. Validated at engine construction;
/// a contradiction (zero grid size, non-positive resolution, ...) is
/// the only fatal error of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlamConfig {
    /// Worker threads for intra-frame parallelism.
    pub nb_threads: usize,

    /// Logging detail ladder:
    /// 0: errors, warnings and one-time info
    /// 1: 0 + frame number and total frame processing time
    /// 2: 1 + extracted features, used keypoints, localization variance
    /// 3: 2 + sub-problem processing durations
    /// 4: 3 + match-outcome histograms
    /// 5: 4 + logging and map memory usage
    pub verbosity: u8,

    /// When true, the localization step reuses the planar keypoints
    /// selected for ego-motion; when false, every valid point is a
    /// planar matching candidate.
    pub fast_slam: bool,

    /// Ego-motion estimation strategy.
    pub ego_motion_mode: EgoMotionMode,

    /// Within-sweep motion compensation mode.
    pub undistortion: UndistortionMode,

    /// Temporal depth of the trajectory/covariance/keypoint logs,
    /// seconds. 0 disables logging, a negative value keeps everything.
    pub logging_timeout: f64,

    /// Whether the rolling maps are fed after each localization.
    /// Disabled for localization-only runs in a fixed map.
    pub update_map: bool,

    /// Maximum distance between a keypoint and its neighbourhood for
    /// an ICP match to be built, meters. Shared by both phases.
    pub max_distance_for_icp_matching: f64,

    /// Minimum residual count below which a registration is flagged
    /// degenerate and the previous pose estimate is kept.
    pub min_nbr_matched_keypoints: usize,

    /// Ego-motion phase matching parameters.
    pub ego_motion: MatchingConfig,

    /// Localization phase matching parameters.
    pub localization: MatchingConfig,

    /// Keypoint extractor parameters.
    pub extraction: ExtractionConfig,

    /// Rolling map parameters.
    pub maps: MapsConfig,

    /// Pose of the LIDAR origin in BASE coordinates.
    pub base_to_lidar_offset: Isometry3<f64>,

    /// Frame id of the WORLD coordinate system.
    pub world_frame_id: String,

    /// Frame id of the BASE coordinate system. Empty means automatic:
    /// the input cloud's frame id when no LIDAR offset is set, "base"
    /// otherwise.
    pub base_frame_id: String,
}

impl Default for SlamConfig {
    fn default() -> Self {
        Self {
            nb_threads: 1,
            verbosity: 0,
            fast_slam: true,
            ego_motion_mode: EgoMotionMode::MotionExtrapolation,
            undistortion: UndistortionMode::Approximated,
            logging_timeout: 0.0,
            update_map: true,
            max_distance_for_icp_matching: 5.0,
            min_nbr_matched_keypoints: 20,
            ego_motion: MatchingConfig::ego_motion(),
            localization: MatchingConfig::localization(),
            extraction: ExtractionConfig::default(),
            maps: MapsConfig::default(),
            base_to_lidar_offset: Isometry3::identity(),
            world_frame_id: "world".to_string(),
            base_frame_id: String::new(),
        }
    }
}

impl SlamConfig {
    /// Check the configuration for contradictions.
    pub fn validate(&self) -> Result<(), SlamError> {
        let fail = |msg: &str| Err(SlamError::InvalidConfig(msg.to_string()));

        if self.nb_threads == 0 {
            return fail("nb_threads must be at least 1");
        }
        if self.maps.voxel_grid_size == 0 {
            return fail("voxel grid size must be at least 1");
        }
        if self.maps.voxel_grid_resolution <= 0.0 {
            return fail("voxel grid resolution must be positive");
        }
        if self.maps.leaf_size_edges <= 0.0
            || self.maps.leaf_size_planes <= 0.0
            || self.maps.leaf_size_blobs <= 0.0
        {
            return fail("voxel grid leaf sizes must be positive");
        }
        if self.maps.max_points_per_cell == 0 {
            return fail("max points per cell must be at least 1");
        }
        if self.max_distance_for_icp_matching <= 0.0 {
            return fail("ICP matching distance must be positive");
        }
        if self.min_nbr_matched_keypoints == 0 {
            return fail("minimum matched keypoints must be at least 1");
        }
        if self.extraction.curvature_window == 0 {
            return fail("curvature window must be at least 1");
        }
        if self.extraction.nb_sectors == 0 {
            return fail("sector count must be at least 1");
        }
        if self.extraction.min_points_per_line <= 2 * self.extraction.curvature_window {
            return fail("min points per line must exceed the curvature window span");
        }
        for (name, phase) in [("ego-motion", &self.ego_motion), ("localization", &self.localization)]
        {
            if phase.icp_max_iter == 0 || phase.lm_max_iter == 0 {
                return Err(SlamError::InvalidConfig(format!(
                    "{name} iteration counts must be at least 1"
                )));
            }
            if phase.init_loss_scale <= 0.0 || phase.final_loss_scale <= 0.0 {
                return Err(SlamError::InvalidConfig(format!(
                    "{name} loss scales must be positive"
                )));
            }
            if phase.line_nbr_neighbors < phase.min_line_neighbors {
                return Err(SlamError::InvalidConfig(format!(
                    "{name} line neighbour count below its minimum"
                )));
            }
            if phase.plane_nbr_neighbors < 3 || phase.blob_nbr_neighbors < 4 {
                return Err(SlamError::InvalidConfig(format!(
                    "{name} neighbour counts too small to fit a primitive"
                )));
            }
        }
        Ok(())
    }

    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SlamError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: SlamConfig = serde_json::from_str(&text)
            .map_err(|e| SlamError::InvalidConfig(format!("parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SlamConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_grid_size_is_fatal() {
        let config = SlamConfig {
            maps: MapsConfig {
                voxel_grid_size: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SlamError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_zero_threads_is_fatal() {
        let config = SlamConfig {
            nb_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_loss_scale_is_fatal() {
        let mut config = SlamConfig::default();
        config.localization.final_loss_scale = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let config = SlamConfig::default();
        let text = serde_json::to_string_pretty(&config).unwrap();
        let back: SlamConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let back: SlamConfig =
            serde_json::from_str(r#"{"nb_threads": 4, "fast_slam": false}"#).unwrap();
        assert_eq!(back.nb_threads, 4);
        assert!(!back.fast_slam);
        assert_eq!(back.maps.voxel_grid_size, 50);
    }
}
