//! Normal estimation algorithms
//!
//! Normals come from a least-squares plane fit (PCA) over a hybrid neighborhood:
//! at most `max_nn` neighbors that also lie within `radius`. Points with fewer
//! than three neighbors have no defined normal and are reported as such rather
//! than given a placeholder direction.

use crate::nearest_neighbor::SpatialIndex;
use nalgebra::{Matrix3, SymmetricEigen};
use plantcrate_core::{Error, Point3d, PointCloud, Result, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum neighborhood size (self included) for a plane fit
pub const MIN_NORMAL_NEIGHBORS: usize = 3;

/// Parameters for normal estimation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalParams {
    /// Neighborhood radius
    pub radius: f64,
    /// Maximum neighbors used per point
    pub max_nn: usize,
    /// Flip normals so they point away from the cloud centroid
    pub orient_outward: bool,
}

impl Default for NormalParams {
    fn default() -> Self {
        Self {
            radius: 0.1,
            max_nn: 30,
            orient_outward: true,
        }
    }
}

impl NormalParams {
    pub fn validate(&self) -> Result<()> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "normal radius must be finite and positive, got {}",
                self.radius
            )));
        }
        if self.max_nn < MIN_NORMAL_NEIGHBORS {
            return Err(Error::InvalidParameter(format!(
                "normal max_nn must be at least {}, got {}",
                MIN_NORMAL_NEIGHBORS, self.max_nn
            )));
        }
        Ok(())
    }
}

/// Estimate the normal of `points[index]` from its neighborhood in `search`.
///
/// The returned normal is unit length and not yet oriented.
pub fn estimate_normal_at(
    points: &[Point3d],
    search: &SpatialIndex,
    index: usize,
    params: &NormalParams,
) -> Result<Vector3d> {
    let query = points.get(index).ok_or_else(|| {
        Error::InvalidParameter(format!(
            "point index {} out of range for {} points",
            index,
            points.len()
        ))
    })?;
    let neighbors = search.hybrid_query(query, params.radius, params.max_nn);
    if neighbors.len() < MIN_NORMAL_NEIGHBORS {
        return Err(Error::InsufficientNeighbors {
            index,
            found: neighbors.len(),
            required: MIN_NORMAL_NEIGHBORS,
        });
    }

    let n = neighbors.len() as f64;
    let centroid = neighbors
        .iter()
        .fold(Vector3d::zeros(), |acc, &(i, _)| acc + points[i].coords)
        / n;

    let mut covariance = Matrix3::zeros();
    for &(i, _) in &neighbors {
        let diff = points[i].coords - centroid;
        covariance += diff * diff.transpose();
    }
    covariance /= n;

    let eigen = SymmetricEigen::new(covariance);
    let min_idx = eigen.eigenvalues.imin();
    let normal: Vector3d = eigen.eigenvectors.column(min_idx).into_owned();

    normal
        .try_normalize(1e-12)
        .ok_or_else(|| Error::DegenerateGeometry(format!(
            "neighborhood of point {} collapsed to a single location",
            index
        )))
}

/// Estimate normals for every point of a cloud.
///
/// Entry `i` is `None` when point `i` has fewer than three neighbors; such
/// points are excluded from downstream feature matching.
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `params` - Neighborhood and orientation settings
///
/// # Returns
/// * `Result<Vec<Option<Vector3d>>>` - One entry per input point
pub fn estimate_normals(cloud: &PointCloud, params: &NormalParams) -> Result<Vec<Option<Vector3d>>> {
    params.validate()?;
    cloud.ensure_not_empty("normal estimation needs at least one point")?;

    let points = cloud.points();
    let search = SpatialIndex::build(points)?;
    let centroid = cloud
        .centroid()
        .ok_or_else(|| Error::empty("normal estimation needs at least one point"))?;

    let normals: Vec<Option<Vector3d>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let normal = estimate_normal_at(points, &search, i, params).ok()?;
            if params.orient_outward && normal.dot(&(points[i] - centroid)) < 0.0 {
                Some(-normal)
            } else {
                Some(normal)
            }
        })
        .collect();

    let undefined = normals.iter().filter(|n| n.is_none()).count();
    debug!(
        points = points.len(),
        undefined,
        radius = params.radius,
        max_nn = params.max_nn,
        "estimated normals"
    );

    Ok(normals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn tilted_plane() -> PointCloud {
        // z = 0.5 x, sampled on a 10x10 grid
        (0..10)
            .flat_map(|i| (0..10).map(move |j| (i as f64 * 0.05, j as f64 * 0.05)))
            .map(|(x, y)| Point3d::new(x, y, 0.5 * x))
            .collect()
    }

    #[test]
    fn test_plane_normals() {
        let cloud = tilted_plane();
        let params = NormalParams {
            radius: 0.12,
            ..NormalParams::default()
        };
        let normals = estimate_normals(&cloud, &params).unwrap();
        let expected = Vector3d::new(-0.5, 0.0, 1.0).normalize();

        assert_eq!(normals.len(), cloud.len());
        for normal in normals.iter().flatten() {
            assert_relative_eq!(normal.dot(&expected).abs(), 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_isolated_point_has_no_normal() {
        let mut points = tilted_plane().points().to_vec();
        points.push(Point3d::new(10.0, 10.0, 10.0));
        let cloud = PointCloud::from_points(points);

        let normals = estimate_normals(&cloud, &NormalParams::default()).unwrap();
        assert!(normals.last().unwrap().is_none());

        let search = SpatialIndex::build(cloud.points()).unwrap();
        let err = estimate_normal_at(cloud.points(), &search, cloud.len() - 1, &NormalParams::default());
        assert!(matches!(
            err,
            Err(Error::InsufficientNeighbors { found: 1, required: 3, .. })
        ));
    }

    #[test]
    fn test_out_of_range_index_is_rejected() {
        let cloud = tilted_plane();
        let search = SpatialIndex::build(cloud.points()).unwrap();
        let err = estimate_normal_at(cloud.points(), &search, cloud.len(), &NormalParams::default());
        assert!(matches!(err, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_normals_point_outward() {
        // points on a sphere of radius 1
        let cloud: PointCloud = (0..20)
            .flat_map(|i| (0..40).map(move |j| (i, j)))
            .map(|(i, j)| {
                let theta = (i as f64 + 0.5) / 20.0 * std::f64::consts::PI;
                let phi = j as f64 / 40.0 * 2.0 * std::f64::consts::PI;
                Point3d::new(theta.sin() * phi.cos(), theta.sin() * phi.sin(), theta.cos())
            })
            .collect();

        let params = NormalParams {
            radius: 0.4,
            max_nn: 30,
            orient_outward: true,
        };
        let normals = estimate_normals(&cloud, &params).unwrap();
        for (p, n) in cloud.iter().zip(normals.iter()) {
            let n = n.unwrap();
            assert!(n.dot(&p.coords) > 0.0);
        }
    }

    #[test]
    fn test_rejects_empty_cloud_and_bad_params() {
        assert!(matches!(
            estimate_normals(&PointCloud::new(), &NormalParams::default()),
            Err(Error::EmptyInput { .. })
        ));
        let params = NormalParams {
            radius: -1.0,
            ..NormalParams::default()
        };
        assert!(params.validate().is_err());
    }
}
