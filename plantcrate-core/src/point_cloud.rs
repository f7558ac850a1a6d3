//! Point cloud data structures and functionality

use crate::error::{Error, Result};
use crate::point::*;
use crate::transform::RigidTransform;
use serde::{Deserialize, Serialize};
use std::ops::Index;

/// A point cloud with optional per-point colors and normals.
///
/// Attribute arrays, when present, are index-aligned with `points`. The fields are
/// private so that alignment can only be established through the checked
/// constructors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloud {
    points: Vec<Point3d>,
    colors: Option<Vec<Rgb>>,
    normals: Option<Vec<Vector3d>>,
}

impl PointCloud {
    /// Create a new empty point cloud
    pub fn new() -> Self {
        Self {
            points: Vec::new(),
            colors: None,
            normals: None,
        }
    }

    /// Create a point cloud from a vector of points
    pub fn from_points(points: Vec<Point3d>) -> Self {
        Self {
            points,
            colors: None,
            normals: None,
        }
    }

    /// Attach colors, which must be index-aligned with the points
    pub fn with_colors(mut self, colors: Vec<Rgb>) -> Result<Self> {
        if colors.len() != self.points.len() {
            return Err(Error::InvalidData(format!(
                "{} colors for {} points",
                colors.len(),
                self.points.len()
            )));
        }
        self.colors = Some(colors);
        Ok(self)
    }

    /// Attach normals, which must be index-aligned with the points
    pub fn with_normals(mut self, normals: Vec<Vector3d>) -> Result<Self> {
        if normals.len() != self.points.len() {
            return Err(Error::InvalidData(format!(
                "{} normals for {} points",
                normals.len(),
                self.points.len()
            )));
        }
        self.normals = Some(normals);
        Ok(self)
    }

    /// Get the number of points in the cloud
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Check if the point cloud is empty
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point3d] {
        &self.points
    }

    pub fn colors(&self) -> Option<&[Rgb]> {
        self.colors.as_deref()
    }

    pub fn normals(&self) -> Option<&[Vector3d]> {
        self.normals.as_deref()
    }

    pub fn has_colors(&self) -> bool {
        self.colors.is_some()
    }

    pub fn has_normals(&self) -> bool {
        self.normals.is_some()
    }

    /// Get an iterator over the points
    pub fn iter(&self) -> std::slice::Iter<'_, Point3d> {
        self.points.iter()
    }

    /// Fail with [`Error::EmptyInput`] when the cloud has no points
    pub fn ensure_not_empty(&self, context: &str) -> Result<()> {
        if self.is_empty() {
            return Err(Error::empty(context));
        }
        Ok(())
    }

    /// New cloud made of the given indices, attributes kept aligned
    pub fn select(&self, indices: &[usize]) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.points.len()) {
            return Err(Error::InvalidData(format!(
                "index {} out of bounds for {} points",
                bad,
                self.points.len()
            )));
        }

        Ok(Self {
            points: indices.iter().map(|&i| self.points[i]).collect(),
            colors: self
                .colors
                .as_ref()
                .map(|c| indices.iter().map(|&i| c[i]).collect()),
            normals: self
                .normals
                .as_ref()
                .map(|n| indices.iter().map(|&i| n[i]).collect()),
        })
    }

    /// Concatenate two clouds. An attribute survives only if both sides carry it.
    pub fn merge(&self, other: &PointCloud) -> Self {
        let mut points = Vec::with_capacity(self.len() + other.len());
        points.extend_from_slice(&self.points);
        points.extend_from_slice(&other.points);

        let colors = match (&self.colors, &other.colors) {
            (Some(a), Some(b)) => Some(a.iter().chain(b.iter()).copied().collect()),
            _ => None,
        };
        let normals = match (&self.normals, &other.normals) {
            (Some(a), Some(b)) => Some(a.iter().chain(b.iter()).copied().collect()),
            _ => None,
        };

        Self {
            points,
            colors,
            normals,
        }
    }

    /// Return a transformed copy; normals are rotated, never translated
    pub fn transformed(&self, transform: &RigidTransform) -> Self {
        let mut copy = self.clone();
        copy.transform(transform);
        copy
    }

    /// Apply a rigid transformation to all points in place
    pub fn transform(&mut self, transform: &RigidTransform) {
        for point in &mut self.points {
            *point = transform.transform_point(point);
        }
        if let Some(normals) = &mut self.normals {
            for normal in normals.iter_mut() {
                *normal = transform.transform_vector(normal);
            }
        }
    }

    /// Mean of all point positions
    pub fn centroid(&self) -> Option<Point3d> {
        if self.is_empty() {
            return None;
        }
        let sum = self
            .points
            .iter()
            .fold(Vector3d::zeros(), |acc, p| acc + p.coords);
        Some(Point3d::from(sum / self.points.len() as f64))
    }

    pub fn bounding_box(&self) -> Option<Aabb> {
        Aabb::from_points(&self.points)
    }
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PointCloud {
    type Output = Point3d;

    fn index(&self, index: usize) -> &Self::Output {
        &self.points[index]
    }
}

impl<'a> IntoIterator for &'a PointCloud {
    type Item = &'a Point3d;
    type IntoIter = std::slice::Iter<'a, Point3d>;

    fn into_iter(self) -> Self::IntoIter {
        self.points.iter()
    }
}

impl FromIterator<Point3d> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Point3d>>(iter: I) -> Self {
        Self::from_points(Vec::from_iter(iter))
    }
}
