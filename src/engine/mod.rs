//! SLAM orchestration: configuration and the per-frame engine.

mod config;
mod slam;

pub use config::{EgoMotionMode, MapsConfig, SlamConfig};
pub use slam::{FrameCounters, FrameResult, Slam};
