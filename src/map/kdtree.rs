//! kd-tree index over a point cloud.

use kiddo::float::kdtree::KdTree as FloatKdTree;
use kiddo::SquaredEuclidean;
use nalgebra::Vector3;

use crate::core::types::Point;

/// Bucket size for the underlying kd-tree. Larger than kiddo's default
/// (32) so that point clouds with many points sharing the same
/// coordinate on one axis (e.g. a flat wall) don't overflow a leaf
/// during construction.
const BUCKET_SIZE: usize = 256;

type KdTree = FloatKdTree<f64, u64, 3, BUCKET_SIZE, u32>;

/// A kd-tree built over a borrowed slice of points.
///
/// Built lazily wherever nearest-neighbour queries are needed: over
/// the previous frame's keypoints for ego-motion, and over rolling
/// grid query results for localization. Neighbour ties are broken by
/// insertion order, which follows the slice order.
pub struct KdTreeCloud<'a> {
    points: &'a [Point],
    tree: KdTree,
}

impl<'a> KdTreeCloud<'a> {
    /// Build a tree over the given points.
    pub fn build(points: &'a [Point]) -> Self {
        let mut tree = KdTree::with_capacity(points.len());
        for (i, p) in points.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }
        Self { points, tree }
    }

    /// Number of indexed points.
    #[inline]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the index is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The indexed point at `idx`.
    #[inline]
    pub fn point(&self, idx: usize) -> &Point {
        &self.points[idx]
    }

    /// The `k` nearest neighbours of `query`, as `(index, squared
    /// distance)` pairs sorted by increasing distance. Returns fewer
    /// than `k` entries when the index is smaller.
    pub fn nearest_n(&self, query: &Vector3<f64>, k: usize) -> Vec<(usize, f64)> {
        if self.points.is_empty() || k == 0 {
            return Vec::new();
        }
        self.tree
            .nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k)
            .into_iter()
            .map(|nn| (nn.item as usize, nn.distance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pt(x: f64, y: f64, z: f64) -> Point {
        Point::new(x, y, z, 0.0, 0, 0.0)
    }

    #[test]
    fn test_nearest_sorted_by_distance() {
        let points = vec![pt(0.0, 0.0, 0.0), pt(1.0, 0.0, 0.0), pt(3.0, 0.0, 0.0)];
        let tree = KdTreeCloud::build(&points);
        let found = tree.nearest_n(&Vector3::new(0.9, 0.0, 0.0), 3);
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].0, 1);
        assert_eq!(found[1].0, 0);
        assert_eq!(found[2].0, 2);
        assert!(found[0].1 <= found[1].1 && found[1].1 <= found[2].1);
    }

    #[test]
    fn test_fewer_points_than_k() {
        let points = vec![pt(0.0, 0.0, 0.0), pt(1.0, 1.0, 1.0)];
        let tree = KdTreeCloud::build(&points);
        let found = tree.nearest_n(&Vector3::zeros(), 10);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_empty_index() {
        let points: Vec<Point> = Vec::new();
        let tree = KdTreeCloud::build(&points);
        assert!(tree.is_empty());
        assert!(tree.nearest_n(&Vector3::zeros(), 5).is_empty());
    }

    #[test]
    fn test_squared_distances() {
        let points = vec![pt(0.0, 3.0, 4.0)];
        let tree = KdTreeCloud::build(&points);
        let found = tree.nearest_n(&Vector3::zeros(), 1);
        assert!((found[0].1 - 25.0).abs() < 1e-12);
    }
}
