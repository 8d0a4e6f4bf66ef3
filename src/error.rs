//! Error types for the SLAM core.
//!
//! # Error Recovery Strategies
//!
//! The pose output stream is never broken by a single bad frame; most
//! conditions are per-frame drops that leave the engine state intact:
//!
//! - **`EmptyFrame`**, **`TimestampRegression`**, **`DuplicateFrame`**:
//!   the offending sweep is dropped, a counter is incremented and the
//!   next valid sweep continues the trajectory as if the bad one never
//!   arrived.
//!
//! - **`MissingCalibration`**: the frame is refused before any state is
//!   touched. Provide a calibration table via [`crate::Slam::set_calibration`]
//!   and resubmit.
//!
//! - **`MapLoadFormat`**: a malformed PCD file was rejected. The rolling
//!   grids keep their previous contents.
//!
//! - **`InvalidConfig`**: the only fatal condition. Raised at engine
//!   construction when the configuration contradicts itself (zero grid
//!   size, non-positive resolution, ...). Fix the configuration and
//!   rebuild the engine.
//!
//! Degenerate geometry and numerical failures inside the optimizer are
//! *not* errors: they are flags and counters on the per-frame result,
//! and the previous pose estimate is reused.

use thiserror::Error;

/// All error conditions surfaced by the SLAM core.
#[derive(Debug, Error)]
pub enum SlamError {
    /// The input sweep contains no points, or too few to form the
    /// minimum number of usable scan lines.
    #[error("input frame is empty or below the minimum point count")]
    EmptyFrame,

    /// The sweep timestamp is not strictly greater than the previous
    /// accepted sweep.
    #[error("frame timestamp {current:.6} does not advance past {previous:.6}")]
    TimestampRegression { previous: f64, current: f64 },

    /// The sweep carries the same sequence number as the previous
    /// accepted sweep.
    #[error("frame sequence number {seq} repeats the previous accepted frame")]
    DuplicateFrame { seq: u32 },

    /// No laser calibration table has been provided, so scan lines
    /// cannot be ordered by vertical angle.
    #[error("no laser calibration set, cannot map scan lines by vertical angle")]
    MissingCalibration,

    /// The configuration contradicts itself. Detected at construction;
    /// the engine is never built.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A map file could not be parsed. The rolling grids are left
    /// untouched.
    #[error("malformed map file {path}: {reason}")]
    MapLoadFormat { path: String, reason: String },

    /// Underlying I/O failure while reading or writing map files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SlamError::TimestampRegression {
            previous: 10.5,
            current: 10.5,
        };
        let msg = err.to_string();
        assert!(msg.contains("10.5"));

        let err = SlamError::InvalidConfig("voxel grid size is zero".into());
        assert!(err.to_string().contains("voxel grid size is zero"));
    }
}
