//! Sensor calibration table.

use serde::{Deserialize, Serialize};

/// Per-laser calibration of a spinning multi-beam sensor.
///
/// Only the vertical correction angles are needed by the core: they
/// define the ordering of scan lines by vertical angle, which the
/// keypoint extractor uses to group points into lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    /// Vertical correction angle of each physical laser, in degrees.
    pub vertical_correction: Vec<f64>,
}

impl Calibration {
    /// Create a calibration table from vertical correction angles.
    pub fn new(vertical_correction: Vec<f64>) -> Self {
        Self {
            vertical_correction,
        }
    }

    /// Number of lasers.
    #[inline]
    pub fn nb_lasers(&self) -> usize {
        self.vertical_correction.len()
    }

    /// Check if the table is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertical_correction.is_empty()
    }

    /// Mapping from vertical-angle rank to physical laser index.
    ///
    /// Index `k` of the result is the physical laser with the `k`-th
    /// largest vertical correction (descending sort, matching the
    /// sensor convention of numbering beams top-down).
    pub fn laser_id_mapping(&self) -> Vec<usize> {
        let mut idx: Vec<usize> = (0..self.vertical_correction.len()).collect();
        idx.sort_by(|&a, &b| {
            self.vertical_correction[b]
                .partial_cmp(&self.vertical_correction[a])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_laser_id_mapping_descending() {
        let calib = Calibration::new(vec![-10.0, 5.0, 0.0, 12.0]);
        assert_eq!(calib.laser_id_mapping(), vec![3, 1, 2, 0]);
    }

    #[test]
    fn test_empty() {
        let calib = Calibration::default();
        assert!(calib.is_empty());
        assert!(calib.laser_id_mapping().is_empty());
    }
}
