//! 3D rigid transformation utilities

use crate::error::{Error, Result};
use crate::point::{Point3d, Vector3d};
use nalgebra::{Isometry3, Matrix3, Matrix4, Rotation3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

/// Tolerance used when accepting a 4x4 matrix as a rigid transform
const ORTHONORMAL_TOLERANCE: f64 = 1e-6;

/// A rotation followed by a translation, no scale or shear.
///
/// Backed by an [`Isometry3`], so the rotation block is orthonormal with
/// determinant +1 by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RigidTransform {
    pub isometry: Isometry3<f64>,
}

impl RigidTransform {
    /// Create an identity transformation
    pub fn identity() -> Self {
        Self {
            isometry: Isometry3::identity(),
        }
    }

    /// Create a translation transformation
    pub fn translation(translation: Vector3d) -> Self {
        Self {
            isometry: Isometry3::translation(translation.x, translation.y, translation.z),
        }
    }

    /// Create a rotation transformation from a quaternion
    pub fn rotation(rotation: UnitQuaternion<f64>) -> Self {
        Self {
            isometry: Isometry3::from_parts(Translation3::identity(), rotation),
        }
    }

    /// Create a transformation from translation and rotation
    pub fn from_parts(translation: Translation3<f64>, rotation: UnitQuaternion<f64>) -> Self {
        Self {
            isometry: Isometry3::from_parts(translation, rotation),
        }
    }

    /// Build from a homogeneous matrix, rejecting scale, shear and reflections
    pub fn from_matrix(matrix: &Matrix4<f64>) -> Result<Self> {
        if matrix[(3, 0)] != 0.0 || matrix[(3, 1)] != 0.0 || matrix[(3, 2)] != 0.0 || matrix[(3, 3)] != 1.0 {
            return Err(Error::InvalidData(
                "homogeneous matrix must end with row [0, 0, 0, 1]".to_string(),
            ));
        }

        let r: Matrix3<f64> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
        let orthogonality = (r.transpose() * r - Matrix3::identity()).norm();
        if orthogonality > ORTHONORMAL_TOLERANCE {
            return Err(Error::InvalidData(format!(
                "rotation block is not orthonormal (|RᵀR - I| = {:.3e})",
                orthogonality
            )));
        }
        if r.determinant() < 0.0 {
            return Err(Error::InvalidData(
                "rotation block is a reflection (det < 0)".to_string(),
            ));
        }

        let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r));
        let t = matrix.fixed_view::<3, 1>(0, 3);
        Ok(Self::from_parts(Translation3::new(t[0], t[1], t[2]), rotation))
    }

    /// The 4x4 homogeneous matrix
    pub fn to_matrix(&self) -> Matrix4<f64> {
        self.isometry.to_homogeneous()
    }

    /// Apply the transformation to a point
    pub fn transform_point(&self, point: &Point3d) -> Point3d {
        self.isometry * point
    }

    /// Apply the rotation part to a vector
    pub fn transform_vector(&self, vector: &Vector3d) -> Vector3d {
        self.isometry.rotation * vector
    }

    /// `self.compose(other)` applies `other` first, then `self`
    pub fn compose(&self, other: &Self) -> Self {
        Self {
            isometry: self.isometry * other.isometry,
        }
    }

    /// Get the inverse transformation
    pub fn inverse(&self) -> Self {
        Self {
            isometry: self.isometry.inverse(),
        }
    }

    pub fn translation_vector(&self) -> Vector3d {
        self.isometry.translation.vector
    }

    /// Rotation angle in radians, in `[0, π]`
    pub fn rotation_angle(&self) -> f64 {
        self.isometry.rotation.angle()
    }

    /// Check if this is approximately the identity transformation
    pub fn is_identity(&self, epsilon: f64) -> bool {
        (self.to_matrix() - Matrix4::identity()).norm() < epsilon
    }
}

impl Default for RigidTransform {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::ops::Mul for RigidTransform {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self::Output {
        self.compose(&rhs)
    }
}

impl From<Isometry3<f64>> for RigidTransform {
    fn from(isometry: Isometry3<f64>) -> Self {
        Self { isometry }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_transform() -> RigidTransform {
        let axis = nalgebra::Unit::new_normalize(Vector3d::new(1.0, 2.0, 3.0));
        RigidTransform::from_parts(
            Translation3::new(0.5, -1.0, 2.0),
            UnitQuaternion::from_axis_angle(&axis, 0.7),
        )
    }

    #[test]
    fn test_identity_is_exact() {
        let p = Point3d::new(-0.3, 12.5, 1e-9);
        assert_eq!(RigidTransform::identity().transform_point(&p), p);
        assert!(RigidTransform::identity().is_identity(1e-12));
    }

    #[test]
    fn test_inverse_round_trip() {
        let t = sample_transform();
        let p = Point3d::new(1.0, 2.0, 3.0);
        let back = t.inverse().transform_point(&t.transform_point(&p));
        assert_relative_eq!(back, p, epsilon = 1e-12);
        assert!((t * t.inverse()).is_identity(1e-12));
    }

    #[test]
    fn test_compose_order() {
        let shift = RigidTransform::translation(Vector3d::new(1.0, 0.0, 0.0));
        let turn = RigidTransform::rotation(UnitQuaternion::from_axis_angle(
            &Vector3d::z_axis(),
            std::f64::consts::FRAC_PI_2,
        ));
        // shift first, then turn
        let p = turn.compose(&shift).transform_point(&Point3d::origin());
        assert_relative_eq!(p, Point3d::new(0.0, 1.0, 0.0), epsilon = 1e-12);
    }

    #[test]
    fn test_matrix_round_trip() {
        let t = sample_transform();
        let back = RigidTransform::from_matrix(&t.to_matrix()).unwrap();
        assert_relative_eq!(back.to_matrix(), t.to_matrix(), epsilon = 1e-12);

        let det = back.to_matrix().fixed_view::<3, 3>(0, 0).determinant();
        assert_relative_eq!(det, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_from_matrix_rejects_scale_and_reflection() {
        let scaled = Matrix4::new_scaling(2.0);
        assert!(RigidTransform::from_matrix(&scaled).is_err());

        let mut reflection = Matrix4::identity();
        reflection[(0, 0)] = -1.0;
        assert!(RigidTransform::from_matrix(&reflection).is_err());
    }
}
