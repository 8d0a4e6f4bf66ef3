//! AkashaSLAM - LiDAR odometry and mapping for spinning multi-beam sensors
//!
//! A LOAM-family estimation core: each sweep is classified into edge,
//! planar and blob keypoints per scan line, registered twice (a fast
//! frame-to-frame ego-motion pass, then a localization pass against
//! rolling feature maps) with point-to-line and point-to-plane
//! residuals under a Levenberg-Marquardt solver, and finally merged
//! into the maps. Sensor motion within a sweep is compensated through
//! per-point pose interpolation.
//!
//! # Architecture
//!
//! The crate is organized into 5 logical layers:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                      io/                            │  ← Map persistence (PCD)
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                    engine/                          │  ← Orchestration
//! │            (per-frame state machine)                │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │           extraction/    registration/              │  ← Core algorithms
//! │        (keypoints)       (ICP + LM solver)          │
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     map/                            │  ← Rolling grids, kd-trees
//! └─────────────────────────────────────────────────────┘
//!                          │
//! ┌─────────────────────────────────────────────────────┐
//! │                     core/                           │  ← Foundation
//! │                (types, math)                        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! # Coordinate frames
//!
//! - **LIDAR**: attached to the sensor's geometric center; input
//!   clouds arrive in this frame.
//! - **BASE**: origin of the moving body; linked to LIDAR by the
//!   static `base_to_lidar_offset`.
//! - **WORLD**: coincides with BASE at the first accepted frame. The
//!   output trajectory describes BASE in WORLD.
//!
//! # Example
//!
//! ```rust,ignore
//! use akasha_slam::{Calibration, PointCloud, Slam, SlamConfig};
//!
//! let mut slam = Slam::new(SlamConfig::default())?;
//! slam.set_calibration(&Calibration::new(vertical_angles))?;
//! for sweep in sweeps {
//!     let result = slam.add_frame(&sweep)?;
//!     println!("pose: {:?}", result.pose.pose6());
//! }
//! ```

// ============================================================================
// Layer 1: Core foundation (no internal deps)
// ============================================================================
pub mod core;

// ============================================================================
// Layer 2: Rolling maps (depends on core)
// ============================================================================
pub mod map;

// ============================================================================
// Layer 3: Algorithms (depends on core, map)
// ============================================================================
pub mod extraction;
pub mod registration;

// ============================================================================
// Layer 4: SLAM engine (depends on all lower layers)
// ============================================================================
pub mod engine;

// ============================================================================
// Layer 5: I/O (map persistence)
// ============================================================================
pub mod io;

mod error;

// ============================================================================
// Convenience re-exports (flat namespace for common use)
// ============================================================================

// Core types
pub use self::core::math;
pub use self::core::types::{Calibration, MotionInterpolator, Point, PointCloud, Transform};

// Extraction
pub use extraction::{ExtractionConfig, Keypoints, SpinningSensorKeypointExtractor};

// Maps
pub use map::{KdTreeCloud, RollingGrid};

// Registration
pub use registration::{
    MatchHistogram, MatchingConfig, MatchingResult, Registration, RegistrationSummary,
    UndistortionMode,
};

// Engine
pub use engine::{EgoMotionMode, FrameCounters, FrameResult, MapsConfig, Slam, SlamConfig};

// I/O
pub use io::{load_pcd, save_pcd, PcdFormat};

// Errors
pub use error::SlamError;
