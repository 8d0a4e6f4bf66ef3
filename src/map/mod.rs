//! Rolling feature maps and their spatial indexes.

mod kdtree;
mod rolling_grid;

pub use kdtree::KdTreeCloud;
pub use rolling_grid::RollingGrid;
