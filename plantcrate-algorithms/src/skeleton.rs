//! Skeletonization and tip detection
//!
//! A cloud is voxelized into a binary occupancy grid, thinned to a one-voxel
//! wide skeleton by repeatedly deleting simple border voxels, and the skeleton's
//! voxel centers are classified as tips when exactly one other skeleton point
//! lies within the tip radius.
//!
//! Both the voxel size and the tip radius change the tip count. For a connected
//! voxel skeleton the tip radius has to reach diagonal neighbors (`√3 · voxel`)
//! while staying below the second neighbor along a line (`2 · voxel`);
//! [`SkeletonParams::for_diagonal`] derives both from the cloud's size.

use crate::nearest_neighbor::SpatialIndex;
use plantcrate_core::{Bounded, Error, Point3d, PointCloud, Result};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Upper bound on grid cells, to refuse voxel sizes far too small for the cloud
pub const MAX_VOXELS: usize = 1 << 28;

/// Face directions, one thinning subiteration each
const DIRECTIONS: [[i64; 3]; 6] = [
    [0, 0, 1],
    [0, 0, -1],
    [0, 1, 0],
    [0, -1, 0],
    [1, 0, 0],
    [-1, 0, 0],
];

/// Binary occupancy grid anchored at `origin` (the minimum corner of the cloud)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoxelGrid {
    dims: [usize; 3],
    origin: Point3d,
    voxel_size: f64,
    occupied: Vec<bool>,
}

impl VoxelGrid {
    /// Snap every point to the cell containing it.
    ///
    /// Cell `i` along an axis covers `[origin + i·v, origin + (i+1)·v)`, so the
    /// grid has `floor(extent / v) + 1` cells per axis and the maximum point
    /// always falls inside.
    pub fn from_points(points: &[Point3d], voxel_size: f64) -> Result<Self> {
        if !voxel_size.is_finite() || voxel_size <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "voxel size must be finite and positive, got {}",
                voxel_size
            )));
        }
        let bounds = points
            .bounds()
            .ok_or_else(|| Error::empty("voxelization needs at least one point"))?;

        let extents = bounds.extents();
        let cells = |extent: f64| (extent / voxel_size).floor() as usize + 1;
        let dims = [cells(extents.x), cells(extents.y), cells(extents.z)];
        let total = dims[0]
            .checked_mul(dims[1])
            .and_then(|n| n.checked_mul(dims[2]))
            .filter(|&n| n <= MAX_VOXELS)
            .ok_or_else(|| {
                Error::InvalidParameter(format!(
                    "voxel size {} gives a {}x{}x{} grid, more than {} cells",
                    voxel_size, dims[0], dims[1], dims[2], MAX_VOXELS
                ))
            })?;

        let mut grid = Self {
            dims,
            origin: bounds.min,
            voxel_size,
            occupied: vec![false; total],
        };
        for p in points {
            let offset = (p - bounds.min) / voxel_size;
            let cell = [
                (offset.x.floor() as usize).min(dims[0] - 1),
                (offset.y.floor() as usize).min(dims[1] - 1),
                (offset.z.floor() as usize).min(dims[2] - 1),
            ];
            let idx = grid.linear(cell);
            grid.occupied[idx] = true;
        }
        Ok(grid)
    }

    pub fn dims(&self) -> [usize; 3] {
        self.dims
    }

    pub fn origin(&self) -> Point3d {
        self.origin
    }

    pub fn voxel_size(&self) -> f64 {
        self.voxel_size
    }

    fn linear(&self, [x, y, z]: [usize; 3]) -> usize {
        x + self.dims[0] * (y + self.dims[1] * z)
    }

    fn cell(&self, idx: usize) -> [usize; 3] {
        let x = idx % self.dims[0];
        let y = (idx / self.dims[0]) % self.dims[1];
        let z = idx / (self.dims[0] * self.dims[1]);
        [x, y, z]
    }

    /// Occupancy at signed coordinates; everything outside the grid is empty
    pub fn is_occupied(&self, x: i64, y: i64, z: i64) -> bool {
        if x < 0 || y < 0 || z < 0 {
            return false;
        }
        let (x, y, z) = (x as usize, y as usize, z as usize);
        if x >= self.dims[0] || y >= self.dims[1] || z >= self.dims[2] {
            return false;
        }
        self.occupied[self.linear([x, y, z])]
    }

    pub fn occupied_count(&self) -> usize {
        self.occupied.iter().filter(|&&o| o).count()
    }

    /// Occupied cells in memory order
    pub fn occupied_voxels(&self) -> Vec<[usize; 3]> {
        self.occupied
            .iter()
            .enumerate()
            .filter(|(_, &o)| o)
            .map(|(idx, _)| self.cell(idx))
            .collect()
    }

    /// World position of a cell's center
    pub fn voxel_center(&self, [x, y, z]: [usize; 3]) -> Point3d {
        let half = 0.5 * self.voxel_size;
        Point3d::new(
            self.origin.x + x as f64 * self.voxel_size + half,
            self.origin.y + y as f64 * self.voxel_size + half,
            self.origin.z + z as f64 * self.voxel_size + half,
        )
    }

    /// Centers of all occupied cells
    pub fn to_points(&self) -> Vec<Point3d> {
        self.occupied_voxels()
            .into_iter()
            .map(|cell| self.voxel_center(cell))
            .collect()
    }

    /// 3x3x3 occupancy around a cell, indexed `(dx+1) + 3(dy+1) + 9(dz+1)`
    fn neighborhood(&self, [x, y, z]: [usize; 3]) -> [bool; 27] {
        let mut n = [false; 27];
        for dz in -1..=1i64 {
            for dy in -1..=1i64 {
                for dx in -1..=1i64 {
                    n[offset_index(dx, dy, dz)] =
                        self.is_occupied(x as i64 + dx, y as i64 + dy, z as i64 + dz);
                }
            }
        }
        n
    }
}

const CENTER: usize = 13;

fn offset_index(dx: i64, dy: i64, dz: i64) -> usize {
    ((dx + 1) + 3 * (dy + 1) + 9 * (dz + 1)) as usize
}

fn offset_of(idx: usize) -> [i64; 3] {
    [(idx % 3) as i64 - 1, ((idx / 3) % 3) as i64 - 1, (idx / 9) as i64 - 1]
}

/// Number of nonzero components of a neighborhood offset
fn order(idx: usize) -> usize {
    offset_of(idx).iter().filter(|&&c| c != 0).count()
}

fn adjacent(a: usize, b: usize, connectivity: usize) -> bool {
    let (oa, ob) = (offset_of(a), offset_of(b));
    let diff = [0, 1, 2].map(|i| (oa[i] - ob[i]).abs());
    if diff.iter().any(|&d| d > 1) {
        return false;
    }
    let changed = diff.iter().filter(|&&d| d != 0).count();
    match connectivity {
        6 => changed == 1,
        _ => changed >= 1,
    }
}

/// Connected components among the `members` positions of a 3x3x3 neighborhood
fn components(members: &[usize], connectivity: usize) -> Vec<Vec<usize>> {
    let mut seen = [false; 27];
    let mut result = Vec::new();
    for &start in members {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let mut component = vec![start];
        let mut queue = VecDeque::from([start]);
        while let Some(current) = queue.pop_front() {
            for &other in members {
                if !seen[other] && adjacent(current, other, connectivity) {
                    seen[other] = true;
                    component.push(other);
                    queue.push_back(other);
                }
            }
        }
        result.push(component);
    }
    result
}

/// Foreground voxels among the 26 neighbors
fn neighbor_count(n: &[bool; 27]) -> usize {
    (0..27).filter(|&i| i != CENTER && n[i]).count()
}

/// A voxel is simple when deleting it changes neither the 26-connected
/// foreground topology nor the 6-connected background topology around it:
/// its foreground 26-neighbors form exactly one 26-component, and the
/// background among its 18-neighbors has exactly one 6-component touching a
/// face of the voxel.
fn is_simple(n: &[bool; 27]) -> bool {
    let foreground: Vec<usize> = (0..27).filter(|&i| i != CENTER && n[i]).collect();
    if components(&foreground, 26).len() != 1 {
        return false;
    }

    let background: Vec<usize> = (0..27)
        .filter(|&i| i != CENTER && order(i) <= 2 && !n[i])
        .collect();
    let touching_faces = components(&background, 6)
        .into_iter()
        .filter(|c| c.iter().any(|&i| order(i) == 1))
        .count();
    touching_faces == 1
}

/// Voxel whose deletion keeps topology and end structure
fn is_deletable(n: &[bool; 27]) -> bool {
    n[CENTER] && neighbor_count(n) != 1 && is_simple(n)
}

/// Result of thinning a voxel grid
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Skeleton {
    pub grid: VoxelGrid,
    /// Full passes over the six directions
    pub iterations: usize,
    /// `false` when the pass cap was hit while voxels were still being removed
    pub converged: bool,
}

impl Skeleton {
    /// Skeleton voxel centers in world coordinates
    pub fn points(&self) -> Vec<Point3d> {
        self.grid.to_points()
    }

    pub fn len(&self) -> usize {
        self.grid.occupied_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Voxelize a cloud
pub fn voxelize(cloud: &PointCloud, voxel_size: f64) -> Result<VoxelGrid> {
    cloud.ensure_not_empty("voxelization needs at least one point")?;
    VoxelGrid::from_points(cloud.points(), voxel_size)
}

/// Topology-preserving thinning
///
/// Each pass runs six directional subiterations. A subiteration collects the
/// border voxels for its direction that are simple and not line ends, then
/// deletes them one at a time, re-checking each against the current grid.
/// Isolated voxels are never deleted, so connected components survive.
pub fn thin(grid: &VoxelGrid, max_iterations: usize) -> Skeleton {
    let mut grid = grid.clone();
    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iterations {
        iterations += 1;
        let mut removed = 0;

        for [dx, dy, dz] in DIRECTIONS {
            let candidates: Vec<usize> = grid
                .occupied
                .par_iter()
                .enumerate()
                .filter(|(_, &o)| o)
                .map(|(idx, _)| idx)
                .filter(|&idx| {
                    let [x, y, z] = grid.cell(idx);
                    let border = !grid.is_occupied(x as i64 + dx, y as i64 + dy, z as i64 + dz);
                    border && is_deletable(&grid.neighborhood([x, y, z]))
                })
                .collect();

            for idx in candidates {
                let cell = grid.cell(idx);
                if is_deletable(&grid.neighborhood(cell)) {
                    grid.occupied[idx] = false;
                    removed += 1;
                }
            }
        }

        debug!(iteration = iterations, removed, "thinning pass");
        if removed == 0 {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            iterations,
            remaining = grid.occupied_count(),
            "thinning hit the iteration cap"
        );
    }

    Skeleton {
        grid,
        iterations,
        converged,
    }
}

/// Skeleton points classified as topological endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TipSet {
    /// Indices into the classified point list
    pub indices: Vec<usize>,
    pub points: Vec<Point3d>,
}

impl TipSet {
    pub fn count(&self) -> usize {
        self.indices.len()
    }
}

/// A point is a tip when exactly two points, itself included, lie within `radius`
pub fn detect_tips(points: &[Point3d], radius: f64) -> Result<TipSet> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(Error::InvalidParameter(format!(
            "tip radius must be finite and positive, got {}",
            radius
        )));
    }
    let index = SpatialIndex::build(points)?;

    let is_tip: Vec<bool> = points
        .par_iter()
        .map(|p| index.radius_count(p, radius) == 2)
        .collect();

    let indices: Vec<usize> = is_tip
        .iter()
        .enumerate()
        .filter_map(|(i, &tip)| tip.then_some(i))
        .collect();
    let points = indices.iter().map(|&i| points[i]).collect();

    Ok(TipSet { indices, points })
}

/// Parameters of the skeleton pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkeletonParams {
    /// Voxel edge length. Coarser grids smooth noise, finer grids keep thin branches.
    pub voxel_size: f64,
    /// Neighborhood radius of the tip test
    pub tip_radius: f64,
    /// Cap on full thinning passes
    pub max_iterations: usize,
}

impl Default for SkeletonParams {
    fn default() -> Self {
        Self {
            voxel_size: 0.2,
            tip_radius: 0.36,
            max_iterations: 100,
        }
    }
}

impl SkeletonParams {
    /// Fraction of the bounding-box diagonal used as voxel size
    pub const VOXEL_FRACTION: f64 = 0.02;
    /// Tip radius in voxels
    pub const TIP_RADIUS_VOXELS: f64 = 1.8;

    /// Voxel size and tip radius scaled to a cloud with the given bounding-box diagonal
    pub fn for_diagonal(diagonal: f64) -> Result<Self> {
        if !diagonal.is_finite() || diagonal <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "bounding-box diagonal must be finite and positive, got {}",
                diagonal
            )));
        }
        let voxel_size = Self::VOXEL_FRACTION * diagonal;
        Ok(Self {
            voxel_size,
            tip_radius: Self::TIP_RADIUS_VOXELS * voxel_size,
            ..Self::default()
        })
    }

    pub fn validate(&self) -> Result<()> {
        if !self.voxel_size.is_finite() || self.voxel_size <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "voxel size must be finite and positive, got {}",
                self.voxel_size
            )));
        }
        if !self.tip_radius.is_finite() || self.tip_radius <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "tip radius must be finite and positive, got {}",
                self.tip_radius
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameter(
                "thinning max_iterations must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output of the skeleton pipeline
#[derive(Debug, Clone)]
pub struct TipAnalysis {
    pub skeleton: Skeleton,
    pub skeleton_points: Vec<Point3d>,
    pub tips: TipSet,
}

impl TipAnalysis {
    /// Leaf-count proxy
    pub fn tip_count(&self) -> usize {
        self.tips.count()
    }
}

/// Voxelize, thin and count tips
pub fn count_leaf_tips(cloud: &PointCloud, params: &SkeletonParams) -> Result<TipAnalysis> {
    params.validate()?;
    let grid = voxelize(cloud, params.voxel_size)?;
    let skeleton = thin(&grid, params.max_iterations);
    let skeleton_points = skeleton.points();
    let tips = detect_tips(&skeleton_points, params.tip_radius)?;

    info!(
        points = cloud.len(),
        voxels = grid.occupied_count(),
        skeleton = skeleton_points.len(),
        tips = tips.count(),
        converged = skeleton.converged,
        "skeleton analysis"
    );

    Ok(TipAnalysis {
        skeleton,
        skeleton_points,
        tips,
    })
}
