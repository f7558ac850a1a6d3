//! Leaf measurements from an isolated leaf point set
//!
//! Length is the longest span between convex hull vertices. The remaining
//! two measures come from the points projected onto the plane orthogonal to
//! that span: width is the extent along the dominant in-plane direction, and
//! area is the 2-D hull area of the points in the (length, width) frame.

use itertools::Itertools;
use nalgebra::{Matrix3, Point2, SymmetricEigen};
use plantcrate_core::{Bounded, Error, LengthUnit, MeasurementScale, Point3d, Result, Vector3d};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum number of points spanning a 3-D hull
pub const MIN_HULL_POINTS: usize = 4;

/// Relative thickness, as a fraction of the bounding-box diagonal, below which
/// a point set is treated as flat
const FLATNESS_TOLERANCE: f64 = 1e-9;

/// Measurements of one leaf, in the units of the scale they were taken with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafMeasurement {
    pub length: f64,
    pub width: f64,
    pub area: f64,
    pub unit: LengthUnit,
    /// Endpoints of the longest span, in model coordinates
    pub endpoints: (Point3d, Point3d),
    /// Unit direction of the longest span
    pub length_axis: Vector3d,
    /// Unit direction of the width, orthogonal to `length_axis`
    pub width_axis: Vector3d,
    pub hull_vertices: usize,
}

/// Farthest pair among `points`, brute force
fn farthest_pair(points: &[Point3d]) -> Option<(Point3d, Point3d, f64)> {
    points
        .iter()
        .tuple_combinations()
        .map(|(a, b)| (*a, *b, (b - a).norm()))
        .max_by(|x, y| x.2.total_cmp(&y.2))
}

/// Rejects point sets whose thinnest principal direction has no extent
fn check_volume(points: &[Point3d]) -> Result<()> {
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3d::zeros(), |acc, p| acc + p.coords) / n;
    let covariance = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p.coords - centroid;
        acc + d * d.transpose()
    }) / n;
    let thickness = SymmetricEigen::new(covariance).eigenvalues.min().max(0.0).sqrt();

    let diagonal = points.bounds().map(|b| b.diagonal()).unwrap_or(0.0);
    if diagonal <= 0.0 || thickness <= FLATNESS_TOLERANCE * diagonal {
        return Err(Error::DegenerateGeometry(format!(
            "{} points are coplanar (thickness {:.3e}, diagonal {:.3e}); no 3-D hull",
            points.len(),
            thickness,
            diagonal
        )));
    }
    Ok(())
}

/// Dominant direction of `residuals`, which are all orthogonal to `axis`
fn width_direction(residuals: &[Vector3d], axis: &Vector3d) -> Vector3d {
    let covariance = residuals
        .iter()
        .fold(Matrix3::zeros(), |acc, r| acc + r * r.transpose());
    let eigen = SymmetricEigen::new(covariance);
    let dominant = eigen.eigenvectors.column(eigen.eigenvalues.imax()).into_owned();

    // strip any numerical drift back into the length direction
    let w = dominant - axis * axis.dot(&dominant);
    w.try_normalize(f64::EPSILON).unwrap_or_else(|| {
        // every residual is zero: the points lie on the axis, any normal will do
        let helper = if axis.x.abs() < 0.9 { Vector3d::x() } else { Vector3d::y() };
        axis.cross(&helper).normalize()
    })
}

/// Shoelace area of a counter-clockwise polygon
fn polygon_area(polygon: &[Point2<f64>]) -> f64 {
    let n = polygon.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let (a, b) = (polygon[i], polygon[(i + 1) % n]);
            a.x * b.y - b.x * a.y
        })
        .sum();
    0.5 * twice.abs()
}

/// Measure a leaf
///
/// # Arguments
/// * `points` - Points of one isolated leaf
/// * `scale` - Model-to-physical conversion
///
/// # Returns
/// * `Result<LeafMeasurement>` - Length, width and area in `scale.unit`
pub fn measure_leaf(points: &[Point3d], scale: &MeasurementScale) -> Result<LeafMeasurement> {
    if points.is_empty() {
        return Err(Error::empty("leaf measurement needs at least one point"));
    }
    if points.len() < MIN_HULL_POINTS {
        return Err(Error::DegenerateGeometry(format!(
            "a 3-D hull needs at least {} points, got {}",
            MIN_HULL_POINTS,
            points.len()
        )));
    }
    check_volume(points)?;

    let (hull, _) = parry3d_f64::transformation::try_convex_hull(points)
        .map_err(|e| Error::DegenerateGeometry(format!("convex hull failed: {:?}", e)))?;
    let (a, b, length) = farthest_pair(&hull).ok_or_else(|| {
        Error::DegenerateGeometry(format!("convex hull has only {} vertices", hull.len()))
    })?;
    let u = (b - a) / length;

    let residuals: Vec<Vector3d> = points
        .iter()
        .map(|p| {
            let d = p - a;
            d - u * u.dot(&d)
        })
        .collect();
    let w = width_direction(&residuals, &u);

    let (min_w, max_w) = residuals
        .iter()
        .map(|r| r.dot(&w))
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), x| (lo.min(x), hi.max(x)));
    let width = max_w - min_w;

    let projected: Vec<Point2<f64>> = points
        .iter()
        .map(|p| {
            let d = p - a;
            Point2::new(d.dot(&u), d.dot(&w))
        })
        .collect();
    let outline = parry2d_f64::transformation::convex_hull(&projected);
    let area = if outline.len() >= 3 { polygon_area(&outline) } else { 0.0 };

    debug!(
        points = points.len(),
        hull_vertices = hull.len(),
        length,
        width,
        area,
        "measured leaf in model units"
    );

    Ok(LeafMeasurement {
        length: scale.length(length),
        width: scale.length(width),
        area: scale.area(area),
        unit: scale.unit,
        endpoints: (a, b),
        length_axis: u,
        width_axis: w,
        hull_vertices: hull.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn box_corners(x: f64, y: f64, z: f64) -> Vec<Point3d> {
        let mut corners = Vec::new();
        for &cx in &[0.0, x] {
            for &cy in &[0.0, y] {
                for &cz in &[0.0, z] {
                    corners.push(Point3d::new(cx, cy, cz));
                }
            }
        }
        corners
    }

    #[test]
    fn test_box_dimensions() {
        let m = measure_leaf(&box_corners(2.0, 2.0, 1.0), &MeasurementScale::unit_meters()).unwrap();

        assert!(m.hull_vertices >= 8);
        assert_relative_eq!(m.length, 3.0, epsilon = 1e-9);
        assert_relative_eq!(m.width, 2.0 * 2f64.sqrt(), epsilon = 1e-9);
        // hexagonal outline in the (length, width) frame
        assert_relative_eq!(m.area, 10.0 * 2f64.sqrt() / 3.0, epsilon = 1e-9);
        assert_relative_eq!(m.length_axis.dot(&m.width_axis), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_scale_applies_per_dimension() {
        let corners = box_corners(2.0, 2.0, 1.0);
        let model = measure_leaf(&corners, &MeasurementScale::unit_meters()).unwrap();
        let scale = MeasurementScale::new(10.0, LengthUnit::Centimeters).unwrap();
        let scaled = measure_leaf(&corners, &scale).unwrap();

        assert_eq!(scaled.unit, LengthUnit::Centimeters);
        assert_relative_eq!(scaled.length, 10.0 * model.length, epsilon = 1e-9);
        assert_relative_eq!(scaled.width, 10.0 * model.width, epsilon = 1e-9);
        assert_relative_eq!(scaled.area, 100.0 * model.area, epsilon = 1e-7);
    }

    #[test]
    fn test_interior_points_do_not_change_length() {
        let mut points = box_corners(4.0, 1.0, 0.5);
        points.push(Point3d::new(2.0, 0.5, 0.25));
        points.push(Point3d::new(1.0, 0.2, 0.1));
        let m = measure_leaf(&points, &MeasurementScale::unit_meters()).unwrap();

        assert!(m.hull_vertices < points.len());
        assert_relative_eq!(m.length, (16.0f64 + 1.0 + 0.25).sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_degenerate_inputs() {
        let scale = MeasurementScale::unit_meters();
        assert!(matches!(measure_leaf(&[], &scale), Err(Error::EmptyInput { .. })));

        let three = vec![Point3d::origin(), Point3d::new(1.0, 0.0, 0.0), Point3d::new(0.0, 1.0, 0.0)];
        assert!(matches!(measure_leaf(&three, &scale), Err(Error::DegenerateGeometry(_))));

        let flat: Vec<Point3d> = (0..5)
            .flat_map(|i| (0..5).map(move |j| Point3d::new(i as f64, j as f64, 2.0)))
            .collect();
        assert!(matches!(measure_leaf(&flat, &scale), Err(Error::DegenerateGeometry(_))));

        let same = vec![Point3d::new(1.0, 1.0, 1.0); 6];
        assert!(matches!(measure_leaf(&same, &scale), Err(Error::DegenerateGeometry(_))));
    }
}
