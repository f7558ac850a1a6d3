//! Registration algorithms

use crate::nearest_neighbor::SpatialIndex;
use nalgebra::{Matrix3, Rotation3, Translation3, UnitQuaternion};
use plantcrate_core::{Error, Point3d, PointCloud, Result, RigidTransform, Stage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Minimum number of correspondences for a rigid fit
pub const MIN_CORRESPONDENCES: usize = 3;

/// Parameters for ICP refinement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcpParams {
    /// Maximum distance for valid correspondences
    pub max_correspondence_distance: f64,
    /// Iteration cap
    pub max_iterations: usize,
    /// MSE change below which the refinement is considered converged
    pub convergence_threshold: f64,
}

impl Default for IcpParams {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.02,
            max_iterations: 30,
            convergence_threshold: 1e-10,
        }
    }
}

impl IcpParams {
    pub fn validate(&self) -> Result<()> {
        if !self.max_correspondence_distance.is_finite() || self.max_correspondence_distance <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "ICP correspondence distance must be finite and positive, got {}",
                self.max_correspondence_distance
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameter(
                "ICP max_iterations must be positive".to_string(),
            ));
        }
        if self.convergence_threshold.is_nan() || self.convergence_threshold < 0.0 {
            return Err(Error::InvalidParameter(format!(
                "ICP convergence threshold must be non-negative, got {}",
                self.convergence_threshold
            )));
        }
        Ok(())
    }
}

/// Result of ICP registration
#[derive(Debug, Clone)]
pub struct IcpResult {
    /// Transformation mapping the source onto the target
    pub transform: RigidTransform,
    /// Fraction of source points with a correspondence under the final transform
    pub fitness: f64,
    /// RMSE over those correspondences
    pub rmse: f64,
    /// Number of iterations performed
    pub iterations: usize,
    /// Whether the MSE change dropped below the threshold before the cap
    pub converged: bool,
    /// `(source, target)` correspondences under the final transform
    pub correspondences: Vec<(usize, usize)>,
}

/// Quality of an alignment, measured against a target index
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationEvaluation {
    pub fitness: f64,
    pub rmse: f64,
    pub correspondences: Vec<(usize, usize)>,
}

/// For each source point, the closest target point within `max_distance`
fn find_correspondences(
    source: &[Point3d],
    target: &SpatialIndex,
    max_distance: f64,
) -> Vec<Option<(usize, f64)>> {
    source
        .par_iter()
        .map(|point| target.nearest(point).filter(|&(_, d)| d <= max_distance))
        .collect()
}

/// Least-squares rigid transform mapping `source[i]` onto `target[i]` (Kabsch)
///
/// # Arguments
/// * `source` - Points to be moved
/// * `target` - Corresponding destination points, same length
///
/// # Returns
/// * `Result<RigidTransform>` - Proper rotation (det = +1) plus translation
pub fn compute_rigid_transform(source: &[Point3d], target: &[Point3d]) -> Result<RigidTransform> {
    if source.len() != target.len() {
        return Err(Error::InvalidData(format!(
            "point correspondence mismatch: {} source vs {} target points",
            source.len(),
            target.len()
        )));
    }
    if source.len() < MIN_CORRESPONDENCES {
        return Err(Error::DegenerateGeometry(format!(
            "a rigid fit needs at least {} correspondences, got {}",
            MIN_CORRESPONDENCES,
            source.len()
        )));
    }

    let n = source.len() as f64;
    let source_centroid = source.iter().fold(Point3d::origin(), |acc, p| acc + p.coords) / n;
    let target_centroid = target.iter().fold(Point3d::origin(), |acc, p| acc + p.coords) / n;

    // Cross-covariance H
    let mut h = Matrix3::zeros();
    for (src, tgt) in source.iter().zip(target.iter()) {
        let p = src - source_centroid;
        let q = tgt - target_centroid;
        h += p * q.transpose();
    }

    let svd = h.svd(true, true);
    let u = svd
        .u
        .ok_or_else(|| Error::DegenerateGeometry("SVD U matrix not available".to_string()))?;
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::DegenerateGeometry("SVD V^T matrix not available".to_string()))?;

    let mut r = v_t.transpose() * u.transpose();

    // Ensure proper rotation (det(R) = 1)
    if r.determinant() < 0.0 {
        let mut v_t_corrected = v_t;
        v_t_corrected.set_row(2, &(-v_t.row(2)));
        r = v_t_corrected.transpose() * u.transpose();
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
    let translation = target_centroid - rotation * source_centroid;

    Ok(RigidTransform::from_parts(
        Translation3::new(translation.x, translation.y, translation.z),
        rotation,
    ))
}

/// Mean squared error between corresponding points
fn compute_mse(source: &[Point3d], target: &[Point3d]) -> f64 {
    if source.is_empty() {
        return 0.0;
    }

    let sum_squared_error: f64 = source
        .iter()
        .zip(target.iter())
        .map(|(src, tgt)| (src - tgt).norm_squared())
        .sum();

    sum_squared_error / source.len() as f64
}

/// Fitness and RMSE of `transform` applied to `source`, against an index built
/// over the target.
pub fn evaluate_registration(
    source: &[Point3d],
    target: &SpatialIndex,
    transform: &RigidTransform,
    max_correspondence_distance: f64,
) -> RegistrationEvaluation {
    let moved: Vec<Point3d> = source.iter().map(|p| transform.transform_point(p)).collect();
    let matches = find_correspondences(&moved, target, max_correspondence_distance);

    let mut squared_error = 0.0;
    let mut correspondences = Vec::new();
    for (src_idx, m) in matches.iter().enumerate() {
        if let Some((tgt_idx, dist)) = m {
            squared_error += dist * dist;
            correspondences.push((src_idx, *tgt_idx));
        }
    }

    let fitness = if source.is_empty() {
        0.0
    } else {
        correspondences.len() as f64 / source.len() as f64
    };
    let rmse = if correspondences.is_empty() {
        0.0
    } else {
        (squared_error / correspondences.len() as f64).sqrt()
    };

    RegistrationEvaluation {
        fitness,
        rmse,
        correspondences,
    }
}

/// Point-to-point ICP refinement
///
/// Starting from `init`, alternates nearest-neighbor correspondence search
/// (limited to `max_correspondence_distance`) with a least-squares rigid fit,
/// until the MSE change drops below `convergence_threshold` or the iteration
/// cap is hit. Hitting the cap is not an error: the best-so-far transform is
/// returned with `converged == false`.
///
/// # Arguments
/// * `source` - Source point cloud to be aligned
/// * `target` - Target point cloud to align to
/// * `init` - Initial transformation estimate
/// * `params` - Correspondence distance, iteration cap and tolerance
///
/// # Returns
/// * `Result<IcpResult>` - Transform, fitness, RMSE and convergence info
///
/// # Example
/// ```rust
/// use plantcrate_algorithms::{icp, IcpParams};
/// use plantcrate_core::{PointCloud, Point3d, RigidTransform, Vector3d};
///
/// fn main() -> plantcrate_core::Result<()> {
///     let source: PointCloud = (0..27)
///         .map(|i| Point3d::new((i % 3) as f64, ((i / 3) % 3) as f64, (i / 9) as f64))
///         .collect();
///     let shift = RigidTransform::translation(Vector3d::new(0.1, 0.0, 0.05));
///     let target = source.transformed(&shift);
///
///     let params = IcpParams { max_correspondence_distance: 0.5, ..IcpParams::default() };
///     let result = icp(&source, &target, &RigidTransform::identity(), &params)?;
///     assert!(result.converged);
///     Ok(())
/// }
/// ```
pub fn icp(
    source: &PointCloud,
    target: &PointCloud,
    init: &RigidTransform,
    params: &IcpParams,
) -> Result<IcpResult> {
    params.validate()?;
    source.ensure_not_empty("ICP source cloud")?;
    target.ensure_not_empty("ICP target cloud")?;

    let target_index = SpatialIndex::build(target.points())?;
    let target_points = target.points();

    let mut current_transform = *init;
    let mut previous_mse = f64::INFINITY;
    let mut converged = false;
    let mut iterations = 0;

    for iteration in 0..params.max_iterations {
        iterations = iteration + 1;

        let transformed_source: Vec<Point3d> = source
            .iter()
            .map(|point| current_transform.transform_point(point))
            .collect();

        let correspondences = find_correspondences(
            &transformed_source,
            &target_index,
            params.max_correspondence_distance,
        );

        let mut valid_source_points = Vec::new();
        let mut valid_target_points = Vec::new();
        for (src_idx, correspondence) in correspondences.iter().enumerate() {
            if let Some((tgt_idx, _)) = correspondence {
                valid_source_points.push(transformed_source[src_idx]);
                valid_target_points.push(target_points[*tgt_idx]);
            }
        }

        if valid_source_points.len() < MIN_CORRESPONDENCES {
            return Err(Error::NoConvergence {
                stage: Stage::Refinement,
                iterations,
                reason: format!(
                    "{} correspondences within {} (need {})",
                    valid_source_points.len(),
                    params.max_correspondence_distance,
                    MIN_CORRESPONDENCES
                ),
            });
        }

        let current_mse = compute_mse(&valid_source_points, &valid_target_points);
        if (previous_mse - current_mse).abs() < params.convergence_threshold {
            converged = true;
            break;
        }

        let delta_transform = compute_rigid_transform(&valid_source_points, &valid_target_points)?;
        current_transform = delta_transform * current_transform;
        previous_mse = current_mse;

        debug!(
            iteration,
            correspondences = valid_source_points.len(),
            mse = current_mse,
            "ICP iteration"
        );
    }

    let evaluation = evaluate_registration(
        source.points(),
        &target_index,
        &current_transform,
        params.max_correspondence_distance,
    );

    if converged {
        info!(
            iterations,
            fitness = evaluation.fitness,
            rmse = evaluation.rmse,
            "ICP converged"
        );
    } else {
        warn!(
            iterations,
            fitness = evaluation.fitness,
            rmse = evaluation.rmse,
            "ICP hit the iteration cap without converging"
        );
    }

    Ok(IcpResult {
        transform: current_transform,
        fitness: evaluation.fitness,
        rmse: evaluation.rmse,
        iterations,
        converged,
        correspondences: evaluation.correspondences,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Unit;
    use plantcrate_core::Vector3d;

    fn grid() -> PointCloud {
        let mut points = Vec::new();
        for x in -2..=2 {
            for y in -2..=2 {
                for z in -1..=1 {
                    points.push(Point3d::new(x as f64, y as f64, z as f64));
                }
            }
        }
        PointCloud::from_points(points)
    }

    fn small_motion() -> RigidTransform {
        RigidTransform::from_parts(
            Translation3::new(0.1, -0.05, 0.02),
            UnitQuaternion::from_axis_angle(&Vector3d::z_axis(), 0.05),
        )
    }

    #[test]
    fn test_kabsch_recovers_known_transform() {
        let axis = Unit::new_normalize(Vector3d::new(1.0, 2.0, 3.0));
        let known = RigidTransform::from_parts(
            Translation3::new(0.5, -1.0, 2.0),
            UnitQuaternion::from_axis_angle(&axis, 0.7),
        );
        let source = grid();
        let target = source.transformed(&known);

        let estimated = compute_rigid_transform(source.points(), target.points()).unwrap();
        assert_relative_eq!(estimated.to_matrix(), known.to_matrix(), epsilon = 1e-9);
    }

    #[test]
    fn test_kabsch_rejects_mismatch_and_too_few() {
        let a = vec![Point3d::origin(); 3];
        let b = vec![Point3d::origin(); 2];
        assert!(matches!(compute_rigid_transform(&a, &b), Err(Error::InvalidData(_))));
        assert!(matches!(
            compute_rigid_transform(&b, &b),
            Err(Error::DegenerateGeometry(_))
        ));
    }

    #[test]
    fn test_icp_identity_transformation() {
        let cloud = grid();
        let params = IcpParams {
            max_correspondence_distance: 0.5,
            ..IcpParams::default()
        };
        let result = icp(&cloud, &cloud, &RigidTransform::identity(), &params).unwrap();

        assert!(result.converged);
        assert!(result.iterations <= 2);
        assert!(result.transform.is_identity(1e-12));
        assert_relative_eq!(result.fitness, 1.0);
        assert!(result.rmse < 1e-12);
    }

    #[test]
    fn test_icp_known_transform() {
        let source = grid();
        let known = small_motion();
        let target = source.transformed(&known);

        let params = IcpParams {
            max_correspondence_distance: 0.5,
            ..IcpParams::default()
        };
        let result = icp(&source, &target, &RigidTransform::identity(), &params).unwrap();

        assert!(result.converged);
        assert!(result.iterations <= 5);
        assert_relative_eq!(result.transform.to_matrix(), known.to_matrix(), epsilon = 1e-9);
        assert_relative_eq!(result.fitness, 1.0);
        assert!(result.rmse < 1e-9);
    }

    #[test]
    fn test_icp_starts_from_initial_guess() {
        let source = grid();
        let known = small_motion();
        let target = source.transformed(&known);

        let params = IcpParams {
            max_correspondence_distance: 0.01,
            ..IcpParams::default()
        };
        // too far apart for a 0.01 search radius without the guess
        assert!(icp(&source, &target, &RigidTransform::identity(), &params).is_err());

        let result = icp(&source, &target, &known, &params).unwrap();
        assert!(result.converged);
        assert_relative_eq!(result.fitness, 1.0);
    }

    #[test]
    fn test_icp_iteration_cap_is_not_an_error() {
        let source = grid();
        let target = source.transformed(&small_motion());

        let params = IcpParams {
            max_correspondence_distance: 0.5,
            max_iterations: 1,
            convergence_threshold: 0.0,
        };
        let result = icp(&source, &target, &RigidTransform::identity(), &params).unwrap();
        assert!(!result.converged);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn test_icp_max_distance_filters_outliers() {
        let source: PointCloud = (0..10).map(|i| Point3d::new(i as f64, 0.0, 0.0)).collect();
        let target: PointCloud = (0..10)
            .map(|i| {
                if i < 5 {
                    Point3d::new(i as f64, 0.0, 0.0)
                } else {
                    Point3d::new(i as f64 + 10.0, 0.0, 0.0)
                }
            })
            .collect();

        let params = IcpParams {
            max_correspondence_distance: 0.5,
            ..IcpParams::default()
        };
        let result = icp(&source, &target, &RigidTransform::identity(), &params).unwrap();
        assert_eq!(result.correspondences.len(), 5);
        assert_relative_eq!(result.fitness, 0.5);
    }

    #[test]
    fn test_icp_validation() {
        let cloud = grid();
        let identity = RigidTransform::identity();

        assert!(matches!(
            icp(&PointCloud::new(), &cloud, &identity, &IcpParams::default()),
            Err(Error::EmptyInput { .. })
        ));
        assert!(matches!(
            icp(&cloud, &PointCloud::new(), &identity, &IcpParams::default()),
            Err(Error::EmptyInput { .. })
        ));

        let zero_iterations = IcpParams {
            max_iterations: 0,
            ..IcpParams::default()
        };
        assert!(matches!(
            icp(&cloud, &cloud, &identity, &zero_iterations),
            Err(Error::InvalidParameter(_))
        ));
    }
}
