//! Keypoint-to-primitive matching.
//!
//! For each keypoint, the k nearest map (or previous-frame) neighbours
//! are fitted with a local primitive by PCA: a line for edge
//! keypoints, a plane for planar keypoints, a full covariance
//! ellipsoid for blobs. A successful fit yields a [`Residual`]; every
//! failure is tagged with the [`MatchingResult`] that rejected it.

use nalgebra::{Matrix3, Vector3};
use serde::{Deserialize, Serialize};

use super::residual::{MatchingResult, Residual};
use crate::map::KdTreeCloud;

/// Matching and optimization parameters for one registration phase.
///
/// The same block serves both phases; [`MatchingConfig::ego_motion`]
/// and [`MatchingConfig::localization`] carry the per-phase defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Maximum Levenberg–Marquardt iterations per ICP iteration.
    pub lm_max_iter: u32,

    /// Maximum outer ICP (match-and-minimize) iterations.
    pub icp_max_iter: u32,

    /// Neighbours fetched to fit a line around an edge keypoint.
    pub line_nbr_neighbors: usize,

    /// Minimum neighbours required for a line fit.
    pub min_line_neighbors: usize,

    /// Eigenvalue dominance ratio required of a line neighbourhood:
    /// the largest eigenvalue must exceed the middle one by this
    /// factor.
    pub line_distance_factor: f64,

    /// Neighbours fetched to fit a plane around a planar keypoint.
    /// All of them must exist for the fit to proceed.
    pub plane_nbr_neighbors: usize,

    /// Plane criterion, flatness part: the middle eigenvalue must
    /// exceed the smallest by this factor.
    pub plane_distance_factor1: f64,

    /// Plane criterion, isotropy part: the largest eigenvalue must not
    /// exceed the middle one by more than this factor.
    pub plane_distance_factor2: f64,

    /// Neighbours fetched to fit a covariance ellipsoid around a blob
    /// keypoint.
    pub blob_nbr_neighbors: usize,

    /// Maximum admissible RMS distance of neighbours to the fitted
    /// line, meters.
    pub max_line_distance: f64,

    /// Maximum admissible RMS distance of neighbours to the fitted
    /// plane, meters.
    pub max_plane_distance: f64,

    /// Robust loss scale at the first ICP iteration.
    pub init_loss_scale: f64,

    /// Robust loss scale at the last ICP iteration.
    pub final_loss_scale: f64,
}

impl MatchingConfig {
    /// Defaults for the ego-motion phase (coarse, fast).
    pub fn ego_motion() -> Self {
        Self {
            lm_max_iter: 15,
            icp_max_iter: 4,
            line_nbr_neighbors: 8,
            min_line_neighbors: 3,
            line_distance_factor: 5.0,
            plane_nbr_neighbors: 5,
            plane_distance_factor1: 35.0,
            plane_distance_factor2: 8.0,
            blob_nbr_neighbors: 25,
            max_line_distance: 0.2,
            max_plane_distance: 0.2,
            init_loss_scale: 2.0,
            final_loss_scale: 0.2,
        }
    }

    /// Defaults for the localization phase (fine, against the maps).
    pub fn localization() -> Self {
        Self {
            lm_max_iter: 15,
            icp_max_iter: 3,
            line_nbr_neighbors: 10,
            min_line_neighbors: 4,
            line_distance_factor: 5.0,
            plane_nbr_neighbors: 5,
            plane_distance_factor1: 35.0,
            plane_distance_factor2: 8.0,
            blob_nbr_neighbors: 25,
            max_line_distance: 0.2,
            max_plane_distance: 0.2,
            init_loss_scale: 0.7,
            final_loss_scale: 0.05,
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self::ego_motion()
    }
}

/// PCA of a neighbourhood: centroid, eigenvalues in ascending order
/// and the matching eigenvectors as matrix columns.
fn neighborhood_pca(
    tree: &KdTreeCloud<'_>,
    neighbors: &[(usize, f64)],
) -> Option<(Vector3<f64>, Vector3<f64>, Matrix3<f64>)> {
    let n = neighbors.len() as f64;
    let mut centroid = Vector3::zeros();
    for &(idx, _) in neighbors {
        centroid += tree.point(idx).position();
    }
    centroid /= n;

    let mut covariance = Matrix3::zeros();
    for &(idx, _) in neighbors {
        let d = tree.point(idx).position() - centroid;
        covariance += d * d.transpose();
    }
    covariance /= n;

    let eigen = covariance.symmetric_eigen();
    // Ascending eigenvalue order with matching eigenvector columns.
    let mut order = [0usize, 1, 2];
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[a]
            .partial_cmp(&eigen.eigenvalues[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let values = Vector3::new(
        eigen.eigenvalues[order[0]],
        eigen.eigenvalues[order[1]],
        eigen.eigenvalues[order[2]],
    );
    if !values.iter().all(|v| v.is_finite()) {
        return None;
    }
    let vectors = Matrix3::from_columns(&[
        eigen.eigenvectors.column(order[0]).into_owned(),
        eigen.eigenvectors.column(order[1]).into_owned(),
        eigen.eigenvectors.column(order[2]).into_owned(),
    ]);
    Some((centroid, values, vectors))
}

/// Mean of `(q − p)ᵀ A (q − p)` over the neighbours: the mean squared
/// distance to the fitted primitive.
fn mean_squared_primitive_distance(
    tree: &KdTreeCloud<'_>,
    neighbors: &[(usize, f64)],
    a: &Matrix3<f64>,
    p: &Vector3<f64>,
) -> f64 {
    let mut sum = 0.0;
    for &(idx, _) in neighbors {
        let d = tree.point(idx).position() - p;
        sum += (d.transpose() * a * d)[0];
    }
    sum / neighbors.len() as f64
}

/// Builds residuals for the keypoints of one frame against one target
/// kd-tree set.
pub struct KeypointMatcher<'a> {
    config: &'a MatchingConfig,
    max_distance_squared: f64,
}

impl<'a> KeypointMatcher<'a> {
    /// Create a matcher with the phase configuration and the shared
    /// ICP matching range.
    pub fn new(config: &'a MatchingConfig, max_distance: f64) -> Self {
        Self {
            config,
            max_distance_squared: max_distance * max_distance,
        }
    }

    /// Fetch neighbours and apply the shared admission checks.
    fn neighborhood(
        &self,
        tree: &KdTreeCloud<'_>,
        query: &Vector3<f64>,
        k: usize,
        k_min: usize,
    ) -> Result<Vec<(usize, f64)>, MatchingResult> {
        let found = tree.nearest_n(query, k);
        if found.is_empty() || found.len() < k_min {
            return Err(MatchingResult::NotEnoughNeighbors);
        }
        // The list is sorted by distance: checking the farthest
        // accepted neighbour is enough.
        if found[found.len() - 1].1 > self.max_distance_squared {
            return Err(MatchingResult::NeighborsTooFar);
        }
        Ok(found)
    }

    /// Match an edge keypoint against a line fitted to its neighbours.
    ///
    /// `x_base` is the keypoint in BASE coordinates, `query` its
    /// position under the current pose estimate, `time` its
    /// sweep-relative acquisition time.
    pub fn match_edge(
        &self,
        x_base: &Vector3<f64>,
        query: &Vector3<f64>,
        time: f64,
        tree: &KdTreeCloud<'_>,
    ) -> Result<Residual, MatchingResult> {
        let neighbors = self.neighborhood(
            tree,
            query,
            self.config.line_nbr_neighbors,
            self.config.min_line_neighbors,
        )?;
        let (centroid, values, vectors) =
            neighborhood_pca(tree, &neighbors).ok_or(MatchingResult::InvalidNumerical)?;

        // A line neighbourhood is dominated by one direction.
        if values[2] < self.config.line_distance_factor * values[1] {
            return Err(MatchingResult::BadPcaStructure);
        }
        let u = vectors.column(2).into_owned();
        let projector = Matrix3::identity() - u * u.transpose();
        let a = projector.transpose() * projector;

        let mse = mean_squared_primitive_distance(tree, &neighbors, &a, &centroid);
        if !mse.is_finite() {
            return Err(MatchingResult::InvalidNumerical);
        }
        if mse > self.config.max_line_distance * self.config.max_line_distance {
            return Err(MatchingResult::MseTooLarge);
        }

        Ok(Residual {
            a,
            p: centroid,
            x: *x_base,
            weight: 1.0,
            time,
        })
    }

    /// Match a planar keypoint against a plane fitted to its
    /// neighbours.
    pub fn match_planar(
        &self,
        x_base: &Vector3<f64>,
        query: &Vector3<f64>,
        time: f64,
        tree: &KdTreeCloud<'_>,
    ) -> Result<Residual, MatchingResult> {
        let k = self.config.plane_nbr_neighbors;
        let neighbors = self.neighborhood(tree, query, k, k)?;
        let (centroid, values, vectors) =
            neighborhood_pca(tree, &neighbors).ok_or(MatchingResult::InvalidNumerical)?;

        // One flat direction, two comparable in-plane directions.
        if values[1] < self.config.plane_distance_factor1 * values[0]
            || values[2] > self.config.plane_distance_factor2 * values[1]
        {
            return Err(MatchingResult::BadPcaStructure);
        }
        let normal = vectors.column(0).into_owned();
        let a = normal * normal.transpose();

        let mse = mean_squared_primitive_distance(tree, &neighbors, &a, &centroid);
        if !mse.is_finite() {
            return Err(MatchingResult::InvalidNumerical);
        }
        if mse > self.config.max_plane_distance * self.config.max_plane_distance {
            return Err(MatchingResult::MseTooLarge);
        }

        Ok(Residual {
            a,
            p: centroid,
            x: *x_base,
            weight: 1.0,
            time,
        })
    }

    /// Match a blob keypoint against the covariance ellipsoid of its
    /// neighbours.
    pub fn match_blob(
        &self,
        x_base: &Vector3<f64>,
        query: &Vector3<f64>,
        time: f64,
        tree: &KdTreeCloud<'_>,
    ) -> Result<Residual, MatchingResult> {
        let k = self.config.blob_nbr_neighbors;
        let neighbors = self.neighborhood(tree, query, k, k.div_ceil(2))?;
        let (centroid, values, _) =
            neighborhood_pca(tree, &neighbors).ok_or(MatchingResult::InvalidNumerical)?;

        // A near-singular covariance cannot be inverted meaningfully.
        if values[0] <= 1e-12 || values[2] > 1e6 * values[0] {
            return Err(MatchingResult::InvalidNumerical);
        }

        let n = neighbors.len() as f64;
        let mut covariance = Matrix3::zeros();
        for &(idx, _) in &neighbors {
            let d = tree.point(idx).position() - centroid;
            covariance += d * d.transpose();
        }
        covariance /= n;

        let inverse = covariance
            .try_inverse()
            .ok_or(MatchingResult::InvalidNumerical)?;
        // Normalized so the strongest direction has unit weight.
        let a = inverse * values[0];
        if !a.iter().all(|v| v.is_finite()) {
            return Err(MatchingResult::InvalidNumerical);
        }

        Ok(Residual {
            a,
            p: centroid,
            x: *x_base,
            weight: 1.0,
            time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Point;
    use approx::assert_relative_eq;

    fn pt(x: f64, y: f64, z: f64) -> Point {
        Point::new(x, y, z, 0.0, 0, 0.0)
    }

    fn line_points(n: usize) -> Vec<Point> {
        (0..n).map(|i| pt(i as f64 * 0.05, 0.0, 0.0)).collect()
    }

    fn plane_points() -> Vec<Point> {
        let mut points = Vec::new();
        for i in 0..5 {
            for j in 0..5 {
                points.push(pt(i as f64 * 0.1, j as f64 * 0.1, 0.0));
            }
        }
        points
    }

    #[test]
    fn test_edge_match_on_line() {
        let points = line_points(12);
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::ego_motion();
        let matcher = KeypointMatcher::new(&config, 5.0);

        let query = Vector3::new(0.25, 0.02, 0.0);
        let residual = matcher
            .match_edge(&query, &query, 0.0, &tree)
            .expect("line fit should succeed");

        // The weighting matrix projects out the line direction (x).
        let along = Vector3::new(1.0, 0.0, 0.0);
        assert_relative_eq!((residual.a * along).norm(), 0.0, epsilon = 1e-9);
        // Distance to the line is measured in y/z.
        let d = query - residual.p;
        let e = (d.transpose() * residual.a * d)[0];
        assert_relative_eq!(e, 0.02 * 0.02, epsilon = 1e-9);
    }

    #[test]
    fn test_planar_match_on_plane() {
        let points = plane_points();
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::localization();
        let matcher = KeypointMatcher::new(&config, 5.0);

        let query = Vector3::new(0.2, 0.2, 0.03);
        let residual = matcher
            .match_planar(&query, &query, 0.0, &tree)
            .expect("plane fit should succeed");

        // A = nnᵀ with n = ±z: in-plane displacement costs nothing.
        let in_plane = Vector3::new(1.0, 1.0, 0.0);
        assert_relative_eq!((residual.a * in_plane).norm(), 0.0, epsilon = 1e-9);
        let d = query - residual.p;
        let e = (d.transpose() * residual.a * d)[0];
        assert_relative_eq!(e, 0.03 * 0.03, epsilon = 1e-9);
    }

    #[test]
    fn test_not_enough_neighbors() {
        let points = line_points(2);
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::ego_motion();
        let matcher = KeypointMatcher::new(&config, 5.0);
        let query = Vector3::zeros();
        assert_eq!(
            matcher.match_edge(&query, &query, 0.0, &tree).unwrap_err(),
            MatchingResult::NotEnoughNeighbors
        );
    }

    #[test]
    fn test_neighbors_too_far() {
        let points = line_points(12);
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::ego_motion();
        let matcher = KeypointMatcher::new(&config, 0.1);
        // Query far from the line: neighbours exist but beyond range.
        let query = Vector3::new(0.0, 10.0, 0.0);
        assert_eq!(
            matcher.match_edge(&query, &query, 0.0, &tree).unwrap_err(),
            MatchingResult::NeighborsTooFar
        );
    }

    #[test]
    fn test_plane_rejected_as_line() {
        // An isotropic plane patch has no dominant direction.
        let points = plane_points();
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::ego_motion();
        let matcher = KeypointMatcher::new(&config, 5.0);
        let query = Vector3::new(0.2, 0.2, 0.0);
        assert_eq!(
            matcher.match_edge(&query, &query, 0.0, &tree).unwrap_err(),
            MatchingResult::BadPcaStructure
        );
    }

    #[test]
    fn test_line_rejected_as_plane() {
        let points = line_points(12);
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::localization();
        let matcher = KeypointMatcher::new(&config, 5.0);
        let query = Vector3::new(0.25, 0.0, 0.0);
        assert_eq!(
            matcher
                .match_planar(&query, &query, 0.0, &tree)
                .unwrap_err(),
            MatchingResult::BadPcaStructure
        );
    }

    #[test]
    fn test_noisy_line_mse_too_large() {
        // Alternate points far off the line axis: structure is still
        // dominated by x, but the fit is loose.
        let points: Vec<Point> = (0..12)
            .map(|i| {
                let off = if i % 2 == 0 { 0.5 } else { -0.5 };
                pt(i as f64 * 2.0, off, 0.0)
            })
            .collect();
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::ego_motion();
        let matcher = KeypointMatcher::new(&config, 50.0);
        let query = Vector3::new(11.0, 0.0, 0.0);
        assert_eq!(
            matcher.match_edge(&query, &query, 0.0, &tree).unwrap_err(),
            MatchingResult::MseTooLarge
        );
    }

    #[test]
    fn test_blob_match_normalized() {
        // An anisotropic but well-conditioned cluster.
        let mut points = Vec::new();
        for i in 0..3 {
            for j in 0..3 {
                for k in 0..3 {
                    points.push(pt(
                        i as f64 * 0.2,
                        j as f64 * 0.1,
                        k as f64 * 0.05,
                    ));
                }
            }
        }
        let tree = KdTreeCloud::build(&points);
        let config = MatchingConfig::localization();
        let matcher = KeypointMatcher::new(&config, 5.0);
        let query = Vector3::new(0.2, 0.1, 0.05);
        let residual = matcher
            .match_blob(&query, &query, 0.0, &tree)
            .expect("blob fit should succeed");
        // Normalization bounds the eigenvalues of A in (0, 1].
        let eigen = residual.a.symmetric_eigen();
        for &v in eigen.eigenvalues.iter() {
            assert!(v > 0.0 && v <= 1.0 + 1e-9, "eigenvalue {v} out of range");
        }
    }
}
