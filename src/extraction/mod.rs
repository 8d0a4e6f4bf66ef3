//! Keypoint extraction from structured multi-beam scans.

mod config;
mod extractor;

pub use config::ExtractionConfig;
pub use extractor::{Keypoints, SpinningSensorKeypointExtractor};
