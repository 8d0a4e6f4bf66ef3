//! Bounded rolling voxel grid of feature points.
//!
//! A `G × G × G` array of cells, each owning a small point cloud. The
//! grid is anchored to the world by an integer voxel origin; when the
//! tracked pose approaches the boundary, the grid *rolls*: it
//! translates by an integer voxel vector so the pose lands back near
//! the middle, dropping the cells that fall off the trailing faces.
//!
//! Memory stays bounded by construction: points are voxel-filtered per
//! cell at the configured leaf size and each cell holds at most
//! `max_points_per_cell` points, evicting oldest-inserted first.

use std::collections::BTreeMap;

use nalgebra::Vector3;

use crate::core::types::{Point, PointCloud};

/// Rolling voxel grid of map points (world coordinates).
#[derive(Debug, Clone)]
pub struct RollingGrid {
    /// Number of cells per side (`G`).
    grid_size: usize,
    /// Edge length of one cell, meters.
    voxel_resolution: f64,
    /// Leaf size of the per-cell voxel filter, meters.
    leaf_size: f64,
    /// Point cap per cell.
    max_points_per_cell: usize,
    /// Voxel coordinates of cell `(0, 0, 0)`.
    origin: Vector3<i64>,
    /// Flattened `G³` cell array.
    cells: Vec<Vec<Point>>,
    /// Total stored points, kept in sync with `cells`.
    nb_points: usize,
    /// Number of rolls performed since construction.
    nb_rolls: usize,
}

impl RollingGrid {
    /// Create an empty grid centred on the world origin.
    pub fn new(
        grid_size: usize,
        voxel_resolution: f64,
        leaf_size: f64,
        max_points_per_cell: usize,
    ) -> Self {
        let half = (grid_size / 2) as i64;
        Self {
            grid_size,
            voxel_resolution,
            leaf_size,
            max_points_per_cell,
            origin: Vector3::new(-half, -half, -half),
            cells: vec![Vec::new(); grid_size * grid_size * grid_size],
            nb_points: 0,
            nb_rolls: 0,
        }
    }

    /// Total number of stored points.
    #[inline]
    pub fn nb_points(&self) -> usize {
        self.nb_points
    }

    /// Check if the grid holds no points.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nb_points == 0
    }

    /// Number of rolls performed since construction.
    #[inline]
    pub fn nb_rolls(&self) -> usize {
        self.nb_rolls
    }

    /// Leaf size of the per-cell voxel filter.
    #[inline]
    pub fn leaf_size(&self) -> f64 {
        self.leaf_size
    }

    /// Drop every stored point, keeping the grid anchor.
    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.clear();
        }
        self.nb_points = 0;
    }

    /// Voxel coordinates of a world position.
    #[inline]
    fn voxel_of(&self, position: &Vector3<f64>) -> Vector3<i64> {
        Vector3::new(
            (position.x / self.voxel_resolution).floor() as i64,
            (position.y / self.voxel_resolution).floor() as i64,
            (position.z / self.voxel_resolution).floor() as i64,
        )
    }

    /// Flattened cell index of a voxel, or `None` if outside the grid.
    #[inline]
    fn cell_index(&self, voxel: &Vector3<i64>) -> Option<usize> {
        let g = self.grid_size as i64;
        let rel = voxel - self.origin;
        if rel.x < 0 || rel.y < 0 || rel.z < 0 || rel.x >= g || rel.y >= g || rel.z >= g {
            return None;
        }
        Some(((rel.x * g + rel.y) * g + rel.z) as usize)
    }

    /// Insert points (world coordinates) into their cells.
    ///
    /// Points outside the current extent are ignored. Each touched
    /// cell is re-filtered at the leaf size and truncated to the
    /// per-cell cap, evicting oldest-inserted points first.
    pub fn add_points(&mut self, cloud: &PointCloud) {
        let mut dirty: Vec<usize> = Vec::new();
        for point in &cloud.points {
            let voxel = self.voxel_of(&point.position());
            if let Some(idx) = self.cell_index(&voxel) {
                self.nb_points -= self.cells[idx].len();
                self.cells[idx].push(*point);
                self.nb_points += self.cells[idx].len();
                if !dirty.contains(&idx) {
                    dirty.push(idx);
                }
            }
        }
        for idx in dirty {
            self.nb_points -= self.cells[idx].len();
            downsample_cell(&mut self.cells[idx], self.leaf_size, self.max_points_per_cell);
            self.nb_points += self.cells[idx].len();
        }
    }

    /// Re-centre the grid on `center` if it has drifted outside the
    /// middle half of the extent. Returns `true` when a roll happened.
    ///
    /// Rolling translates the grid by an integer voxel vector: cells
    /// leaving the extent are dropped, cells entering it start empty.
    pub fn roll(&mut self, center: &Vector3<f64>) -> bool {
        let g = self.grid_size as i64;
        let margin = g / 4;
        let center_voxel = self.voxel_of(center);

        let mut new_origin = self.origin;
        for k in 0..3 {
            let rel = center_voxel[k] - self.origin[k];
            if rel < margin || rel >= g - margin {
                new_origin[k] = center_voxel[k] - g / 2;
            }
        }
        if new_origin == self.origin {
            return false;
        }

        let mut new_cells = vec![Vec::new(); self.cells.len()];
        let mut nb_points = 0;
        for x in 0..g {
            for y in 0..g {
                for z in 0..g {
                    let voxel = self.origin + Vector3::new(x, y, z);
                    let rel = voxel - new_origin;
                    if rel.x >= 0 && rel.y >= 0 && rel.z >= 0 && rel.x < g && rel.y < g && rel.z < g
                    {
                        let old_idx = ((x * g + y) * g + z) as usize;
                        let new_idx = ((rel.x * g + rel.y) * g + rel.z) as usize;
                        nb_points += self.cells[old_idx].len();
                        new_cells[new_idx] = std::mem::take(&mut self.cells[old_idx]);
                    }
                }
            }
        }
        self.origin = new_origin;
        self.cells = new_cells;
        self.nb_points = nb_points;
        self.nb_rolls += 1;
        true
    }

    /// Concatenate the points of every cell intersecting the
    /// axis-aligned envelope of the sphere `(center, radius)`.
    pub fn query(&self, center: &Vector3<f64>, radius: f64) -> PointCloud {
        let mut result = PointCloud::new("world", 0.0, 0);
        let lo = self.voxel_of(&(center - Vector3::repeat(radius)));
        let hi = self.voxel_of(&(center + Vector3::repeat(radius)));
        let g = self.grid_size as i64;
        for x in lo.x.max(self.origin.x)..=hi.x.min(self.origin.x + g - 1) {
            for y in lo.y.max(self.origin.y)..=hi.y.min(self.origin.y + g - 1) {
                for z in lo.z.max(self.origin.z)..=hi.z.min(self.origin.z + g - 1) {
                    if let Some(idx) = self.cell_index(&Vector3::new(x, y, z)) {
                        result.points.extend_from_slice(&self.cells[idx]);
                    }
                }
            }
        }
        result
    }

    /// All stored points as one cloud.
    pub fn snapshot(&self) -> PointCloud {
        let mut result = PointCloud::with_capacity("world", 0.0, 0, self.nb_points);
        for cell in &self.cells {
            result.points.extend_from_slice(cell);
        }
        result
    }

    /// Replace the grid contents with `cloud`, re-anchoring on its
    /// centroid first so the whole cloud fits the extent.
    pub fn replace(&mut self, cloud: &PointCloud) {
        self.clear();
        self.roll(&cloud.centroid());
        self.add_points(cloud);
    }

    /// Verify the storage invariant: every stored point lies in the
    /// cell its coordinates map to, and the capacity bound holds.
    pub fn is_consistent(&self) -> bool {
        let mut total = 0;
        for (idx, cell) in self.cells.iter().enumerate() {
            if cell.len() > self.max_points_per_cell {
                return false;
            }
            total += cell.len();
            for point in cell {
                let voxel = self.voxel_of(&point.position());
                if self.cell_index(&voxel) != Some(idx) {
                    return false;
                }
            }
        }
        total == self.nb_points
    }
}

/// Voxel-filter a cell at `leaf_size`, then cap it.
///
/// Within each leaf the point nearest the leaf centre is kept, in the
/// slot (insertion age) of the leaf's first point, so repeated
/// insertions of the same static scene are stable. When the cap is
/// exceeded, oldest-inserted points are evicted first.
fn downsample_cell(cell: &mut Vec<Point>, leaf_size: f64, max_points: usize) {
    if leaf_size > 0.0 {
        let mut kept: Vec<Point> = Vec::with_capacity(cell.len());
        // leaf -> (slot in `kept`, squared distance to leaf centre)
        let mut leaves: BTreeMap<(i64, i64, i64), (usize, f64)> = BTreeMap::new();
        for point in cell.iter() {
            let key = (
                (point.x / leaf_size).floor() as i64,
                (point.y / leaf_size).floor() as i64,
                (point.z / leaf_size).floor() as i64,
            );
            let centre = Vector3::new(
                (key.0 as f64 + 0.5) * leaf_size,
                (key.1 as f64 + 0.5) * leaf_size,
                (key.2 as f64 + 0.5) * leaf_size,
            );
            let dist = (point.position() - centre).norm_squared();
            match leaves.get_mut(&key) {
                None => {
                    leaves.insert(key, (kept.len(), dist));
                    kept.push(*point);
                }
                Some((slot, best)) => {
                    if dist < *best {
                        kept[*slot] = *point;
                        *best = dist;
                    }
                }
            }
        }
        *cell = kept;
    }
    if cell.len() > max_points {
        let excess = cell.len() - max_points;
        cell.drain(..excess);
    }
}
