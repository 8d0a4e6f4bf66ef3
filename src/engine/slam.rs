//! Per-frame SLAM orchestration.
//!
//! One `add_frame` call runs the whole pipeline for one sweep:
//!
//! ```text
//! CheckFrame → ExtractKeypoints → EgoMotion → Localization → UpdateMap
//! ```
//!
//! The first accepted frame bypasses both registrations; its keypoints
//! seed the rolling grids at the identity pose, which defines WORLD.
//! Bad frames are dropped with a counter and never break the pose
//! stream; the only fatal error is a contradictory configuration at
//! construction.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Instant;

use nalgebra::{Isometry3, Matrix6, Vector3};

use crate::core::types::{Calibration, MotionInterpolator, PointCloud, Transform};
use crate::error::SlamError;
use crate::extraction::{Keypoints, SpinningSensorKeypointExtractor};
use crate::io::PcdFormat;
use crate::map::{KdTreeCloud, RollingGrid};
use crate::registration::{
    BeginPosePolicy, MatchingResult, Registration, RegistrationInput, RegistrationSummary,
    RegistrationTargets, UndistortionMode,
};

use super::config::{EgoMotionMode, SlamConfig};

/// Per-frame output of the engine.
#[derive(Debug, Clone)]
pub struct FrameResult {
    /// BASE pose in WORLD at the end of the sweep.
    pub pose: Transform,
    /// Row-major 6×6 pose covariance, DoF order `(x, y, z, rx, ry, rz)`.
    pub covariance: [f64; 36],
    /// Ego-motion registration was skipped for lack of structure.
    pub ego_motion_degenerate: bool,
    /// Localization registration was skipped for lack of structure.
    pub localization_degenerate: bool,
    /// Keypoints extracted from this sweep (edges + planars + blobs).
    pub nb_keypoints: usize,
    /// Residuals used by the final localization pass.
    pub nb_matched_keypoints: usize,
    /// Wall-clock processing time of this frame, seconds.
    pub latency: f64,
}

/// Drop and anomaly counters, visible through the debug channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounters {
    /// Frames fully processed.
    pub processed: u32,
    /// Frames rejected by `CheckFrame`.
    pub dropped: u32,
    /// Frames flagged degenerate in either registration.
    pub degenerate: u32,
    /// Sequence-number skips observed (frames lost upstream).
    pub sequence_skips: u32,
}

/// A logged frame state: pose, covariance and raw BASE keypoints.
#[derive(Debug, Clone)]
struct LoggedFrame {
    pose: Transform,
    covariance: [f64; 36],
    edges: PointCloud,
    planars: PointCloud,
    blobs: PointCloud,
}

/// The LOAM-family SLAM engine.
pub struct Slam {
    config: SlamConfig,
    pool: rayon::ThreadPool,
    extractor: SpinningSensorKeypointExtractor,
    laser_id_mapping: Option<Vec<usize>>,

    // Frame bookkeeping
    nb_frames_processed: u32,
    previous_frame_seq: u32,
    current_timestamp: f64,
    frame_gap: f64,
    latency: f64,
    base_frame_id: String,

    // Poses
    t_world: Isometry3<f64>,
    t_relative: Isometry3<f64>,
    within_frame_motion: MotionInterpolator,
    covariance: Matrix6<f64>,

    // Keypoints
    current: Keypoints,
    previous: Keypoints,
    current_frame: PointCloud,
    current_world_edges: PointCloud,
    current_world_planars: PointCloud,
    current_world_blobs: PointCloud,

    // Rolling maps
    edges_map: RollingGrid,
    planars_map: RollingGrid,
    blobs_map: RollingGrid,

    // Results and diagnostics
    ego_summary: Option<RegistrationSummary>,
    localization_summary: Option<RegistrationSummary>,
    counters: FrameCounters,
    debug_info: HashMap<String, f64>,

    // Bounded logs
    log: VecDeque<LoggedFrame>,
}

impl Slam {
    /// Build an engine from a validated configuration.
    pub fn new(config: SlamConfig) -> Result<Self, SlamError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.nb_threads)
            .build()
            .map_err(|e| SlamError::InvalidConfig(format!("thread pool: {e}")))?;
        let extractor = SpinningSensorKeypointExtractor::new(config.extraction.clone());
        let maps = &config.maps;
        let empty = Keypoints {
            edges: PointCloud::default(),
            planars: PointCloud::default(),
            blobs: PointCloud::default(),
            valid: PointCloud::default(),
        };
        Ok(Self {
            extractor,
            pool,
            edges_map: RollingGrid::new(
                maps.voxel_grid_size,
                maps.voxel_grid_resolution,
                maps.leaf_size_edges,
                maps.max_points_per_cell,
            ),
            planars_map: RollingGrid::new(
                maps.voxel_grid_size,
                maps.voxel_grid_resolution,
                maps.leaf_size_planes,
                maps.max_points_per_cell,
            ),
            blobs_map: RollingGrid::new(
                maps.voxel_grid_size,
                maps.voxel_grid_resolution,
                maps.leaf_size_blobs,
                maps.max_points_per_cell,
            ),
            config,
            laser_id_mapping: None,
            nb_frames_processed: 0,
            previous_frame_seq: 0,
            current_timestamp: 0.0,
            frame_gap: 0.0,
            latency: 0.0,
            base_frame_id: String::new(),
            t_world: Isometry3::identity(),
            t_relative: Isometry3::identity(),
            within_frame_motion: MotionInterpolator::constant(Isometry3::identity()),
            covariance: Matrix6::zeros(),
            current: empty.clone(),
            previous: empty,
            current_frame: PointCloud::default(),
            current_world_edges: PointCloud::default(),
            current_world_planars: PointCloud::default(),
            current_world_blobs: PointCloud::default(),
            ego_summary: None,
            localization_summary: None,
            counters: FrameCounters::default(),
            debug_info: HashMap::new(),
            log: VecDeque::new(),
        })
    }

    /// Provide the sensor calibration table.
    ///
    /// Required before the first frame: the extractor orders scan
    /// lines by vertical angle through this mapping.
    pub fn set_calibration(&mut self, calibration: &Calibration) -> Result<(), SlamError> {
        if calibration.is_empty() {
            return Err(SlamError::MissingCalibration);
        }
        self.laser_id_mapping = Some(calibration.laser_id_mapping());
        Ok(())
    }

    /// Process one sweep and return the new pose estimate.
    pub fn add_frame(&mut self, frame: &PointCloud) -> Result<FrameResult, SlamError> {
        let start = Instant::now();

        let mapping = self
            .laser_id_mapping
            .clone()
            .ok_or(SlamError::MissingCalibration)?;

        if let Err(e) = self.check_frame(frame) {
            self.counters.dropped += 1;
            log::warn!("frame {} dropped: {e}", frame.seq);
            return Err(e);
        }
        if self.nb_frames_processed > 0 && frame.seq > self.previous_frame_seq + 1 {
            // A skipped sequence number means frames were lost
            // upstream; the frame itself is still accepted.
            self.counters.sequence_skips += 1;
            log::warn!(
                "frame dropped upstream: sequence jumped from {} to {}",
                self.previous_frame_seq,
                frame.seq
            );
        }

        // Resolved once, on the first accepted frame.
        if self.base_frame_id.is_empty() {
            self.base_frame_id = if !self.config.base_frame_id.is_empty() {
                self.config.base_frame_id.clone()
            } else if self.config.base_to_lidar_offset == Isometry3::identity() {
                frame.frame_id.clone()
            } else {
                "base".to_string()
            };
        }

        let sweep_duration = frame.duration();
        self.frame_gap = if self.nb_frames_processed > 0 {
            frame.timestamp - self.current_timestamp
        } else {
            0.0
        };

        // Keypoint extraction, LIDAR → BASE.
        let base_frame_id = self.base_frame_id.clone();
        let keypoints = {
            let offset = self.config.base_to_lidar_offset;
            self.extractor
                .extract(frame, &mapping, &offset, &base_frame_id, &self.pool)
        };
        let nb_keypoints =
            keypoints.edges.len() + keypoints.planars.len() + keypoints.blobs.len();

        if self.nb_frames_processed == 0 {
            self.initialize_from_first_frame(frame, keypoints);
            self.latency = start.elapsed().as_secs_f64();
            self.fill_debug_info();
            self.report_frame(frame.seq);
            return Ok(FrameResult {
                pose: self.world_transform(),
                covariance: self.transform_covariance(),
                ego_motion_degenerate: false,
                localization_degenerate: false,
                nb_keypoints,
                nb_matched_keypoints: 0,
                latency: self.latency,
            });
        }

        // Within-frame begin pose sits at `1 - duration/gap` between
        // the two sweep-end poses under constant velocity.
        let begin_ratio = if self.frame_gap > 0.0 {
            (1.0 - sweep_duration / self.frame_gap).clamp(0.0, 1.0)
        } else {
            0.0
        };

        // --- Ego-motion ---------------------------------------------------
        let ego_start = Instant::now();
        let t_world_previous = self.t_world;
        let mut ego_degenerate = false;
        self.ego_summary = None;
        let relative_guess = match self.config.ego_motion_mode {
            EgoMotionMode::None => Isometry3::identity(),
            EgoMotionMode::MotionExtrapolation => self.t_relative,
            EgoMotionMode::Registration
            | EgoMotionMode::MotionExtrapolationAndRegistration => {
                let seed = if self.config.ego_motion_mode == EgoMotionMode::Registration {
                    Isometry3::identity()
                } else {
                    self.t_relative
                };
                let summary = {
                    let edges_tree = KdTreeCloud::build(&self.previous.edges.points);
                    let planars_tree = KdTreeCloud::build(&self.previous.planars.points);
                    let registration = Registration::new(
                        &self.config.ego_motion,
                        self.config.max_distance_for_icp_matching,
                        self.config.min_nbr_matched_keypoints,
                    );
                    // In the relative frame the previous sweep ended at
                    // the identity.
                    let policy = match self.config.undistortion {
                        UndistortionMode::None => BeginPosePolicy::EndPose,
                        UndistortionMode::Approximated => BeginPosePolicy::Extrapolated {
                            previous_end: Isometry3::identity(),
                            ratio: begin_ratio,
                        },
                        UndistortionMode::Optimized => BeginPosePolicy::Optimized {
                            initial: MotionInterpolator::new(
                                0.0,
                                Isometry3::identity(),
                                1.0,
                                seed,
                            )
                            .at_ratio(begin_ratio),
                        },
                    };
                    registration.solve(
                        &RegistrationInput {
                            edges: &keypoints.edges.points,
                            planars: &keypoints.planars.points,
                            blobs: &[],
                        },
                        &RegistrationTargets {
                            edges: Some(&edges_tree),
                            planars: Some(&planars_tree),
                            blobs: None,
                        },
                        seed,
                        policy,
                        sweep_duration,
                        &self.pool,
                    )
                };
                ego_degenerate = summary.degenerate;
                let pose = summary.pose_end;
                self.ego_summary = Some(summary);
                pose
            }
        };
        let t_world_guess = t_world_previous * relative_guess;
        let ego_duration = ego_start.elapsed().as_secs_f64();

        // --- Localization -------------------------------------------------
        let localization_start = Instant::now();
        let planar_candidates = if self.config.fast_slam {
            &keypoints.planars.points
        } else {
            &keypoints.valid.points
        };
        let query_radius = self.config.max_distance_for_icp_matching
            + keypoints
                .valid
                .bounding_radius()
                .max(keypoints.edges.bounding_radius());
        let query_center = t_world_guess.translation.vector;

        let summary = {
            let edges_cloud = self.edges_map.query(&query_center, query_radius);
            let planars_cloud = self.planars_map.query(&query_center, query_radius);
            let blobs_cloud = self.blobs_map.query(&query_center, query_radius);
            let edges_tree = KdTreeCloud::build(&edges_cloud.points);
            let planars_tree = KdTreeCloud::build(&planars_cloud.points);
            let blobs_tree = KdTreeCloud::build(&blobs_cloud.points);

            let registration = Registration::new(
                &self.config.localization,
                self.config.max_distance_for_icp_matching,
                self.config.min_nbr_matched_keypoints,
            );
            let policy = match self.config.undistortion {
                UndistortionMode::None => BeginPosePolicy::EndPose,
                UndistortionMode::Approximated => BeginPosePolicy::Extrapolated {
                    previous_end: t_world_previous,
                    ratio: begin_ratio,
                },
                UndistortionMode::Optimized => BeginPosePolicy::Optimized {
                    initial: MotionInterpolator::new(0.0, t_world_previous, 1.0, t_world_guess)
                        .at_ratio(begin_ratio),
                },
            };
            registration.solve(
                &RegistrationInput {
                    edges: &keypoints.edges.points,
                    planars: planar_candidates,
                    blobs: &keypoints.blobs.points,
                },
                &RegistrationTargets {
                    edges: Some(&edges_tree),
                    planars: Some(&planars_tree),
                    blobs: Some(&blobs_tree),
                },
                t_world_guess,
                policy,
                sweep_duration,
                &self.pool,
            )
        };
        let localization_degenerate = summary.degenerate;
        let nb_matched = summary.nb_residuals;

        if localization_degenerate {
            // Keep the motion prior; do not trust a starved solve.
            self.t_world = t_world_guess;
            self.within_frame_motion = MotionInterpolator::constant(self.t_world);
        } else {
            self.t_world = summary.pose_end;
            self.covariance = summary.covariance;
            self.within_frame_motion = MotionInterpolator::new(
                0.0,
                summary.pose_begin,
                sweep_duration,
                self.t_world,
            );
        }
        self.localization_summary = Some(summary);
        let localization_duration = localization_start.elapsed().as_secs_f64();

        if ego_degenerate || localization_degenerate {
            self.counters.degenerate += 1;
        }

        // --- Undistorted WORLD keypoints and map update -------------------
        self.current_world_edges = self.undistort_to_world(&keypoints.edges);
        self.current_world_planars = self.undistort_to_world(&keypoints.planars);
        self.current_world_blobs = self.undistort_to_world(&keypoints.blobs);

        if self.config.update_map {
            let center = self.t_world.translation.vector;
            self.edges_map.roll(&center);
            self.planars_map.roll(&center);
            self.blobs_map.roll(&center);
            self.edges_map.add_points(&self.current_world_edges);
            self.planars_map.add_points(&self.current_world_planars);
            self.blobs_map.add_points(&self.current_world_blobs);
        }

        // --- Bookkeeping --------------------------------------------------
        self.t_relative = t_world_previous.inverse() * self.t_world;
        self.previous = keypoints.clone();
        self.current = keypoints;
        self.current_frame = frame.clone();
        self.current_timestamp = frame.timestamp;
        self.previous_frame_seq = frame.seq;
        self.nb_frames_processed += 1;
        self.counters.processed += 1;
        self.latency = start.elapsed().as_secs_f64();

        self.log_frame_state();
        self.fill_debug_info();
        self.debug_info
            .insert("EgoMotion: duration".into(), ego_duration);
        self.debug_info
            .insert("Localization: duration".into(), localization_duration);
        self.report_frame(frame.seq);

        Ok(FrameResult {
            pose: self.world_transform(),
            covariance: self.transform_covariance(),
            ego_motion_degenerate: ego_degenerate,
            localization_degenerate,
            nb_keypoints,
            nb_matched_keypoints: nb_matched,
            latency: self.latency,
        })
    }

    /// Validate one input sweep against the engine state.
    fn check_frame(&self, frame: &PointCloud) -> Result<(), SlamError> {
        let min_points =
            self.config.extraction.min_points_per_line * self.config.extraction.min_valid_lines;
        if frame.is_empty() || frame.len() < min_points {
            return Err(SlamError::EmptyFrame);
        }
        if self.nb_frames_processed > 0 {
            if frame.timestamp <= self.current_timestamp {
                return Err(SlamError::TimestampRegression {
                    previous: self.current_timestamp,
                    current: frame.timestamp,
                });
            }
            if frame.seq == self.previous_frame_seq {
                return Err(SlamError::DuplicateFrame { seq: frame.seq });
            }
        }
        Ok(())
    }

    /// Seed WORLD from the first accepted frame.
    fn initialize_from_first_frame(&mut self, frame: &PointCloud, keypoints: Keypoints) {
        self.t_world = Isometry3::identity();
        self.t_relative = Isometry3::identity();
        self.covariance = Matrix6::zeros();
        self.within_frame_motion = MotionInterpolator::constant(Isometry3::identity());

        // BASE coincides with WORLD here, so the raw keypoints seed
        // the maps directly.
        self.current_world_edges = keypoints.edges.clone();
        self.current_world_edges.frame_id = self.config.world_frame_id.clone();
        self.current_world_planars = keypoints.planars.clone();
        self.current_world_planars.frame_id = self.config.world_frame_id.clone();
        self.current_world_blobs = keypoints.blobs.clone();
        self.current_world_blobs.frame_id = self.config.world_frame_id.clone();

        if self.config.update_map {
            self.edges_map.add_points(&self.current_world_edges);
            self.planars_map.add_points(&self.current_world_planars);
            self.blobs_map.add_points(&self.current_world_blobs);
        }

        self.previous = keypoints.clone();
        self.current = keypoints;
        self.current_frame = frame.clone();
        self.current_timestamp = frame.timestamp;
        self.previous_frame_seq = frame.seq;
        self.nb_frames_processed = 1;
        self.counters.processed += 1;
        self.frame_gap = 0.0;
        self.log_frame_state();
    }

    /// Map BASE keypoints to WORLD through the per-point interpolated
    /// pose of the frame.
    fn undistort_to_world(&self, cloud: &PointCloud) -> PointCloud {
        let mut result = PointCloud::with_capacity(
            self.config.world_frame_id.clone(),
            cloud.timestamp,
            cloud.seq,
            cloud.len(),
        );
        for p in &cloud.points {
            let pose = self.within_frame_motion.interpolate(p.time);
            result.push(p.transformed(&pose));
        }
        result
    }

    /// Append the frame state to the bounded log.
    fn log_frame_state(&mut self) {
        if self.config.logging_timeout == 0.0 {
            return;
        }
        self.log.push_back(LoggedFrame {
            pose: self.world_transform(),
            covariance: self.transform_covariance(),
            edges: self.current.edges.clone(),
            planars: self.current.planars.clone(),
            blobs: self.current.blobs.clone(),
        });
        if self.config.logging_timeout > 0.0 {
            let horizon = self.current_timestamp - self.config.logging_timeout;
            while self
                .log
                .front()
                .is_some_and(|entry| entry.pose.time < horizon)
            {
                self.log.pop_front();
            }
        }
    }

    /// Rebuild the per-frame debug counter map.
    fn fill_debug_info(&mut self) {
        self.debug_info.clear();
        self.debug_info
            .insert("Keypoints: edges".into(), self.current.edges.len() as f64);
        self.debug_info
            .insert("Keypoints: planars".into(), self.current.planars.len() as f64);
        self.debug_info
            .insert("Keypoints: blobs".into(), self.current.blobs.len() as f64);
        self.debug_info
            .insert("Frame processing time".into(), self.latency);

        if let Some(summary) = &self.ego_summary {
            self.debug_info.insert(
                "EgoMotion: edges used".into(),
                summary.edges.successes() as f64,
            );
            self.debug_info.insert(
                "EgoMotion: planes used".into(),
                summary.planars.successes() as f64,
            );
            self.debug_info.insert(
                "EgoMotion: degenerate".into(),
                summary.degenerate as u8 as f64,
            );
        }
        if let Some(summary) = &self.localization_summary {
            self.debug_info.insert(
                "Localization: edges used".into(),
                summary.edges.successes() as f64,
            );
            self.debug_info.insert(
                "Localization: planes used".into(),
                summary.planars.successes() as f64,
            );
            self.debug_info.insert(
                "Localization: blobs used".into(),
                summary.blobs.successes() as f64,
            );
            self.debug_info.insert(
                "Localization: variance error".into(),
                summary.mean_squared_error,
            );
            self.debug_info.insert(
                "Localization: degenerate".into(),
                summary.degenerate as u8 as f64,
            );
        }
    }

    /// Verbosity-gated per-frame reporting.
    fn report_frame(&self, seq: u32) {
        let v = self.config.verbosity;
        if v >= 1 {
            log::info!(
                "frame {} (#{}) processed in {:.1} ms",
                seq,
                self.nb_frames_processed,
                self.latency * 1e3
            );
        }
        if v >= 2 {
            log::info!(
                "keypoints: {} edges, {} planars, {} blobs; localization matched {}",
                self.current.edges.len(),
                self.current.planars.len(),
                self.current.blobs.len(),
                self.localization_summary
                    .as_ref()
                    .map_or(0, |s| s.nb_residuals)
            );
        }
        if v >= 3 {
            log::debug!(
                "durations: ego {:.1} ms, localization {:.1} ms",
                self.debug_info
                    .get("EgoMotion: duration")
                    .copied()
                    .unwrap_or(0.0)
                    * 1e3,
                self.debug_info
                    .get("Localization: duration")
                    .copied()
                    .unwrap_or(0.0)
                    * 1e3,
            );
        }
        if v >= 4 {
            if let Some(summary) = &self.localization_summary {
                log::debug!(
                    "localization matches: edges {}/{}, planars {}/{}, blobs {}/{}",
                    summary.edges.successes(),
                    summary.edges.attempts(),
                    summary.planars.successes(),
                    summary.planars.attempts(),
                    summary.blobs.successes(),
                    summary.blobs.attempts(),
                );
            }
        }
        if v >= 5 {
            log::debug!(
                "maps: {} edge, {} planar, {} blob points; log depth {}",
                self.edges_map.nb_points(),
                self.planars_map.nb_points(),
                self.blobs_map.nb_points(),
                self.log.len(),
            );
        }
    }

    // ------------------------------------------------------------------
    //   Outputs
    // ------------------------------------------------------------------

    /// Current BASE pose in WORLD.
    pub fn world_transform(&self) -> Transform {
        Transform::new(
            self.t_world,
            self.current_timestamp,
            self.config.world_frame_id.clone(),
        )
    }

    /// Current pose pushed forward by the processing latency, under
    /// the constant-velocity hypothesis.
    pub fn latency_compensated_world_transform(&self) -> Transform {
        if self.frame_gap <= 0.0 {
            return self.world_transform();
        }
        let ratio = (self.latency / self.frame_gap).clamp(0.0, 1.0);
        let advance =
            MotionInterpolator::new(0.0, Isometry3::identity(), 1.0, self.t_relative)
                .at_ratio(ratio);
        Transform::new(
            self.t_world * advance,
            self.current_timestamp + self.latency,
            self.config.world_frame_id.clone(),
        )
    }

    /// Covariance of the last localization, row-major, DoF order
    /// `(x, y, z, rx, ry, rz)`.
    pub fn transform_covariance(&self) -> [f64; 36] {
        let mut out = [0.0; 36];
        for r in 0..6 {
            for c in 0..6 {
                out[r * 6 + c] = self.covariance[(r, c)];
            }
        }
        out
    }

    /// Logged trajectory, oldest first.
    pub fn trajectory(&self) -> Vec<Transform> {
        self.log.iter().map(|e| e.pose.clone()).collect()
    }

    /// Logged covariances, aligned with [`Slam::trajectory`].
    pub fn covariances(&self) -> Vec<[f64; 36]> {
        self.log.iter().map(|e| e.covariance).collect()
    }

    /// Snapshot of the edges map.
    pub fn edges_map(&self) -> PointCloud {
        self.edges_map.snapshot()
    }

    /// Snapshot of the planars map.
    pub fn planars_map(&self) -> PointCloud {
        self.planars_map.snapshot()
    }

    /// Snapshot of the blobs map.
    pub fn blobs_map(&self) -> PointCloud {
        self.blobs_map.snapshot()
    }

    /// Edge keypoints of the current frame: raw BASE coordinates, or
    /// undistorted WORLD coordinates.
    pub fn edges_keypoints(&self, world: bool) -> PointCloud {
        if world {
            self.current_world_edges.clone()
        } else {
            self.current.edges.clone()
        }
    }

    /// Planar keypoints of the current frame (see [`Slam::edges_keypoints`]).
    pub fn planars_keypoints(&self, world: bool) -> PointCloud {
        if world {
            self.current_world_planars.clone()
        } else {
            self.current.planars.clone()
        }
    }

    /// Blob keypoints of the current frame (see [`Slam::edges_keypoints`]).
    pub fn blobs_keypoints(&self, world: bool) -> PointCloud {
        if world {
            self.current_world_blobs.clone()
        } else {
            self.current.blobs.clone()
        }
    }

    /// The current input sweep transformed point-for-point into WORLD.
    pub fn output_frame(&self) -> PointCloud {
        self.current_frame
            .transformed(&self.t_world, self.config.world_frame_id.clone())
    }

    /// Number of frames fully processed.
    pub fn nb_frames_processed(&self) -> u32 {
        self.nb_frames_processed
    }

    /// Drop and anomaly counters.
    pub fn counters(&self) -> FrameCounters {
        self.counters
    }

    /// Per-frame scalar diagnostics (`EgoMotion: edges used`, ...).
    pub fn debug_information(&self) -> &HashMap<String, f64> {
        &self.debug_info
    }

    /// Per-point debug arrays: extractor curvature/validity/label
    /// arrays plus the localization match tags per keypoint kind.
    pub fn debug_arrays(&self) -> HashMap<String, Vec<f64>> {
        let mut arrays = self.extractor.debug_arrays().clone();
        if let Some(summary) = &self.localization_summary {
            let encode = |tags: &[MatchingResult]| -> Vec<f64> {
                tags.iter().map(|t| t.code() as f64).collect()
            };
            arrays.insert("Localization: edge match".into(), encode(&summary.edge_tags));
            arrays.insert(
                "Localization: planar match".into(),
                encode(&summary.planar_tags),
            );
            arrays.insert("Localization: blob match".into(), encode(&summary.blob_tags));
        }
        arrays
    }

    /// Outcome of the last ego-motion registration, if it ran.
    pub fn ego_motion_summary(&self) -> Option<&RegistrationSummary> {
        self.ego_summary.as_ref()
    }

    /// Outcome of the last localization registration.
    pub fn localization_summary(&self) -> Option<&RegistrationSummary> {
        self.localization_summary.as_ref()
    }

    /// Engine configuration.
    pub fn config(&self) -> &SlamConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    //   State mutators
    // ------------------------------------------------------------------

    /// Reset the whole estimation state; `reset_log` also clears the
    /// trajectory and keypoint logs. Configuration and calibration are
    /// kept.
    pub fn reset(&mut self, reset_log: bool) {
        self.nb_frames_processed = 0;
        self.previous_frame_seq = 0;
        self.current_timestamp = 0.0;
        self.frame_gap = 0.0;
        self.latency = 0.0;
        self.t_world = Isometry3::identity();
        self.t_relative = Isometry3::identity();
        self.within_frame_motion = MotionInterpolator::constant(Isometry3::identity());
        self.covariance = Matrix6::zeros();
        self.current = Keypoints {
            edges: PointCloud::default(),
            planars: PointCloud::default(),
            blobs: PointCloud::default(),
            valid: PointCloud::default(),
        };
        self.previous = self.current.clone();
        self.current_frame = PointCloud::default();
        self.current_world_edges = PointCloud::default();
        self.current_world_planars = PointCloud::default();
        self.current_world_blobs = PointCloud::default();
        self.edges_map.clear();
        self.planars_map.clear();
        self.blobs_map.clear();
        self.ego_summary = None;
        self.localization_summary = None;
        self.counters = FrameCounters::default();
        self.debug_info.clear();
        if reset_log {
            self.log.clear();
        }
    }

    /// Drop every point from the three rolling maps, keeping the pose
    /// and trajectory state.
    pub fn clear_maps(&mut self) {
        self.edges_map.clear();
        self.planars_map.clear();
        self.blobs_map.clear();
    }

    /// Override the current world pose (e.g. from a GPS-calibrated
    /// guess). The velocity prior is reset.
    pub fn set_world_transform_from_guess(&mut self, guess: &Transform) {
        self.t_world = guess.isometry;
        self.t_relative = Isometry3::identity();
        self.within_frame_motion = MotionInterpolator::constant(self.t_world);
    }

    /// Replace the logged trajectory with an externally optimized one
    /// and optionally rebuild the maps from the logged keypoints.
    ///
    /// A pure mutator: the back-end solver is not owned by the core,
    /// and this is never invoked from the per-frame hot path.
    pub fn apply_pose_graph_optimization(
        &mut self,
        corrected: &[Transform],
        rebuild_maps: bool,
    ) {
        if corrected.is_empty() {
            return;
        }
        if rebuild_maps {
            if corrected.len() == self.log.len() {
                self.edges_map.clear();
                self.planars_map.clear();
                self.blobs_map.clear();
                for (entry, pose) in self.log.iter().zip(corrected.iter()) {
                    let center = pose.isometry.translation.vector;
                    self.edges_map.roll(&center);
                    self.planars_map.roll(&center);
                    self.blobs_map.roll(&center);
                    self.edges_map
                        .add_points(&entry.edges.transformed(&pose.isometry, "world"));
                    self.planars_map
                        .add_points(&entry.planars.transformed(&pose.isometry, "world"));
                    self.blobs_map
                        .add_points(&entry.blobs.transformed(&pose.isometry, "world"));
                }
            } else {
                log::warn!(
                    "pose graph rebuild skipped: {} corrected poses vs {} logged frames",
                    corrected.len(),
                    self.log.len()
                );
            }
        }
        for (entry, pose) in self.log.iter_mut().zip(corrected.iter()) {
            entry.pose = pose.clone();
        }
        if let Some(last) = corrected.last() {
            self.t_world = last.isometry;
            self.t_relative = Isometry3::identity();
            self.within_frame_motion = MotionInterpolator::constant(self.t_world);
        }
    }

    // ------------------------------------------------------------------
    //   Persistence
    // ------------------------------------------------------------------

    /// Save the three feature maps as `{prefix}_edges.pcd`,
    /// `{prefix}_planars.pcd` and `{prefix}_blobs.pcd`.
    pub fn save_maps_to_pcd(&self, prefix: &str, format: PcdFormat) -> Result<(), SlamError> {
        for (suffix, cloud) in [
            ("edges", self.edges_map.snapshot()),
            ("planars", self.planars_map.snapshot()),
            ("blobs", self.blobs_map.snapshot()),
        ] {
            let path = PathBuf::from(format!("{prefix}_{suffix}.pcd"));
            crate::io::save_pcd(&path, &cloud, format)?;
        }
        Ok(())
    }

    /// Load the three feature maps saved by [`Slam::save_maps_to_pcd`].
    ///
    /// All three files are parsed before any grid is touched: a
    /// malformed file leaves the maps unchanged. When `reset_maps` is
    /// true the grids are replaced, otherwise the loaded points are
    /// merged in.
    pub fn load_maps_from_pcd(&mut self, prefix: &str, reset_maps: bool) -> Result<(), SlamError> {
        let edges = crate::io::load_pcd(&PathBuf::from(format!("{prefix}_edges.pcd")))?;
        let planars = crate::io::load_pcd(&PathBuf::from(format!("{prefix}_planars.pcd")))?;
        let blobs = crate::io::load_pcd(&PathBuf::from(format!("{prefix}_blobs.pcd")))?;

        if reset_maps {
            self.edges_map.replace(&edges);
            self.planars_map.replace(&planars);
            self.blobs_map.replace(&blobs);
        } else {
            self.edges_map.add_points(&edges);
            self.planars_map.add_points(&planars);
            self.blobs_map.add_points(&blobs);
        }
        Ok(())
    }

    /// Re-anchor the rolling maps on a position, e.g. before
    /// localization-only runs in a loaded map.
    pub fn roll_maps_to(&mut self, center: &Vector3<f64>) {
        self.edges_map.roll(center);
        self.planars_map.roll(center);
        self.blobs_map.roll(center);
    }
}
