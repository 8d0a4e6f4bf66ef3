//! Map persistence.

mod pcd;

pub use pcd::{load_pcd, save_pcd, PcdFormat};
