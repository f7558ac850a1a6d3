//! Core traits for plantcrate

use crate::{point::*, point_cloud::PointCloud};

/// Trait for nearest neighbor search functionality.
///
/// Results are `(index, distance)` pairs. A query point that is itself a member
/// of the indexed set is returned as its own neighbor at distance zero.
pub trait NearestNeighborSearch {
    /// Find the k nearest neighbors to a query point, closest first
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)>;

    /// Find all neighbors within a given radius (inclusive), ordered by index
    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)>;
}

/// Trait for objects with a spatial extent
pub trait Bounded {
    /// Get the bounding box of the object, `None` when it has no points
    fn bounds(&self) -> Option<Aabb>;

    /// Get the center point of the bounding box
    fn center(&self) -> Option<Point3d> {
        self.bounds().map(|b| b.center())
    }
}

impl Bounded for PointCloud {
    fn bounds(&self) -> Option<Aabb> {
        self.bounding_box()
    }
}

impl Bounded for [Point3d] {
    fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self)
    }
}
