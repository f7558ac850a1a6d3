//! Reference-object calibration: straightening a scan along a vertical
//! reference stick, and converting enclosed mesh volumes to physical volumes.

use nalgebra::{Unit, UnitQuaternion};
use plantcrate_core::{Error, Point3d, Result, RigidTransform, Vector3d};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

/// Below this cross-product norm the stick direction counts as already (anti)parallel to +Z
const PARALLEL_TOLERANCE: f64 = 1e-6;

/// Rotation, about the lowest point, that stands the reference stick upright.
///
/// The stick direction runs from the point with the lowest z to the point
/// with the highest z. Apply the returned transform to the whole scan.
pub fn vertical_alignment(points: &[Point3d]) -> Result<RigidTransform> {
    let base = points
        .iter()
        .min_by(|a, b| a.z.total_cmp(&b.z))
        .ok_or_else(|| Error::empty("vertical alignment needs reference points"))?;
    let top = points
        .iter()
        .max_by(|a, b| a.z.total_cmp(&b.z))
        .ok_or_else(|| Error::empty("vertical alignment needs reference points"))?;

    let direction = Unit::try_new(top - base, f64::EPSILON).ok_or_else(|| {
        Error::DegenerateGeometry(format!(
            "reference has no vertical extent (lowest and highest point both at {:?})",
            base
        ))
    })?;

    let up = Vector3d::z();
    let axis = direction.cross(&up);
    let rotation = if axis.norm() > PARALLEL_TOLERANCE {
        let angle = direction.dot(&up).clamp(-1.0, 1.0).acos();
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(axis), angle)
    } else if direction.dot(&up) > 0.0 {
        UnitQuaternion::identity()
    } else {
        UnitQuaternion::from_axis_angle(&Vector3d::x_axis(), PI)
    };

    debug!(
        tilt = rotation.angle(),
        base = ?base,
        "vertical alignment of reference"
    );

    // rotate about the base: x -> R (x - base) + base
    let to_origin = RigidTransform::translation(-base.coords);
    let rotate = RigidTransform::rotation(rotation);
    let back = RigidTransform::translation(base.coords);
    Ok(back.compose(&rotate.compose(&to_origin)))
}

/// Real-to-model volume ratio from a reference object of known volume
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VolumeCalibration {
    /// Physical volume per model volume unit
    pub ratio: f64,
}

impl VolumeCalibration {
    /// Calibrate against a reference whose enclosed model volume and real
    /// volume are both known (e.g. a 3.765 cm³ cube scanned next to the plant)
    pub fn from_reference(reference_model_volume: f64, reference_real_volume: f64) -> Result<Self> {
        check_volume("reference model volume", reference_model_volume)?;
        check_volume("reference real volume", reference_real_volume)?;
        Ok(Self {
            ratio: reference_real_volume / reference_model_volume,
        })
    }

    /// Physical volume of an object with the given model volume
    pub fn calibrate(&self, model_volume: f64) -> Result<f64> {
        check_volume("model volume", model_volume)?;
        Ok(model_volume * self.ratio)
    }
}

fn check_volume(name: &str, volume: f64) -> Result<()> {
    if !volume.is_finite() || volume <= 0.0 {
        return Err(Error::InvalidParameter(format!(
            "{} must be finite and positive, got {}",
            name, volume
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tilted_stick_becomes_vertical() {
        let base = Point3d::new(1.0, 2.0, 0.5);
        let direction = Vector3d::new(0.3, -0.2, 1.0).normalize();
        let stick: Vec<Point3d> = (0..20).map(|i| base + direction * (i as f64 * 0.05)).collect();

        let transform = vertical_alignment(&stick).unwrap();
        let straightened: Vec<Point3d> = stick.iter().map(|p| transform.transform_point(p)).collect();

        assert_relative_eq!(straightened[0], base, epsilon = 1e-12);
        for p in &straightened {
            assert_relative_eq!(p.x, base.x, epsilon = 1e-9);
            assert_relative_eq!(p.y, base.y, epsilon = 1e-9);
        }
        assert_relative_eq!(straightened[19].z - base.z, 0.95, epsilon = 1e-9);
    }

    #[test]
    fn test_upright_stick_is_identity() {
        let stick: Vec<Point3d> = (0..5).map(|i| Point3d::new(0.5, 0.5, i as f64)).collect();
        assert!(vertical_alignment(&stick).unwrap().is_identity(1e-12));
    }

    #[test]
    fn test_alignment_rejects_bad_input() {
        assert!(matches!(vertical_alignment(&[]), Err(Error::EmptyInput { .. })));
        let point = vec![Point3d::new(0.3, 0.1, 1.0); 4];
        assert!(matches!(vertical_alignment(&point), Err(Error::DegenerateGeometry(_))));
    }

    #[test]
    fn test_volume_calibration() {
        // the reference cube came out at 3.0 model units, its real volume is 3.765
        let calibration = VolumeCalibration::from_reference(3.0, 3.765).unwrap();
        assert_relative_eq!(calibration.ratio, 1.255, epsilon = 1e-12);
        assert_relative_eq!(calibration.calibrate(10.0).unwrap(), 12.55, epsilon = 1e-12);

        assert!(VolumeCalibration::from_reference(0.0, 3.765).is_err());
        assert!(VolumeCalibration::from_reference(3.0, f64::INFINITY).is_err());
        assert!(calibration.calibrate(-1.0).is_err());
    }
}
