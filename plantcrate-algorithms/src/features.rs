//! Feature extraction algorithms
//!
//! Fast Point Feature Histograms (FPFH). Each point gets a 33-bin signature: three
//! 11-bin histograms of the Darboux-frame angles between the point's normal and
//! its neighbors' normals, smoothed over the neighborhood with inverse-distance
//! weights.

use crate::nearest_neighbor::SpatialIndex;
use plantcrate_core::{Error, Point3d, Result, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::debug;

/// Bins per angular feature
pub const FPFH_BINS: usize = 11;

/// Length of a full descriptor
pub const FPFH_DIMENSION: usize = 3 * FPFH_BINS;

/// 33-dimensional FPFH descriptor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FpfhFeature {
    pub histogram: [f64; FPFH_DIMENSION],
}

impl FpfhFeature {
    pub fn zeros() -> Self {
        Self {
            histogram: [0.0; FPFH_DIMENSION],
        }
    }

    pub fn distance_squared(&self, other: &FpfhFeature) -> f64 {
        self.histogram
            .iter()
            .zip(other.histogram.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    pub fn distance(&self, other: &FpfhFeature) -> f64 {
        self.distance_squared(other).sqrt()
    }
}

/// Parameters for FPFH extraction. The radius is normally larger than the
/// normal estimation radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureParams {
    pub radius: f64,
    pub max_nn: usize,
}

impl Default for FeatureParams {
    fn default() -> Self {
        Self {
            radius: 0.25,
            max_nn: 100,
        }
    }
}

impl FeatureParams {
    pub fn validate(&self) -> Result<()> {
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "feature radius must be finite and positive, got {}",
                self.radius
            )));
        }
        if self.max_nn < 2 {
            return Err(Error::InvalidParameter(format!(
                "feature max_nn must be at least 2, got {}",
                self.max_nn
            )));
        }
        Ok(())
    }
}

/// Darboux-frame angles `(f1, f2, f3)` for an oriented point pair.
///
/// The pair is reordered so the source is the point whose normal makes the
/// smaller angle with the connecting line. Returns `None` when the points
/// coincide or the connecting line is parallel to the source normal.
pub fn pair_features(
    p1: &Point3d,
    n1: &Vector3d,
    p2: &Point3d,
    n2: &Vector3d,
) -> Option<(f64, f64, f64)> {
    let mut d = p2 - p1;
    let f4 = d.norm();
    if f4 == 0.0 {
        return None;
    }

    let angle1 = n1.dot(&d) / f4;
    let angle2 = n2.dot(&d) / f4;

    let (source_n, target_n, f3) = if angle1.abs().acos() > angle2.abs().acos() {
        d = -d;
        (n2, n1, -angle2)
    } else {
        (n1, n2, angle1)
    };

    let v = d.cross(source_n);
    let v_norm = v.norm();
    if v_norm == 0.0 {
        return None;
    }
    let v = v / v_norm;
    let w = source_n.cross(&v);

    let f2 = v.dot(target_n);
    let f1 = w.dot(target_n).atan2(source_n.dot(target_n));
    Some((f1, f2, f3))
}

fn bin(value: f64, lower: f64, upper: f64) -> usize {
    let scaled = (FPFH_BINS as f64 * (value - lower) / (upper - lower)).floor();
    scaled.clamp(0.0, (FPFH_BINS - 1) as f64) as usize
}

/// Simplified point feature histogram of one point against its neighbors
fn compute_spfh(
    index: usize,
    points: &[Point3d],
    normals: &[Option<Vector3d>],
    neighbors: &[(usize, f64)],
) -> Option<FpfhFeature> {
    let normal = normals[index]?;
    let angles: Vec<(f64, f64, f64)> = neighbors
        .iter()
        .filter(|&&(j, _)| j != index)
        .filter_map(|&(j, _)| {
            let other = normals[j]?;
            pair_features(&points[index], &normal, &points[j], &other)
        })
        .collect();

    let mut spfh = FpfhFeature::zeros();
    if angles.is_empty() {
        return Some(spfh);
    }

    let hop = 100.0 / angles.len() as f64;
    for (f1, f2, f3) in angles {
        spfh.histogram[bin(f1, -PI, PI)] += hop;
        spfh.histogram[FPFH_BINS + bin(f2, -1.0, 1.0)] += hop;
        spfh.histogram[2 * FPFH_BINS + bin(f3, -1.0, 1.0)] += hop;
    }
    Some(spfh)
}

/// Compute FPFH descriptors for every point.
///
/// `normals` must be index-aligned with `points`. Entry `i` of the result is
/// `None` when point `i` has no normal; such points never take part in
/// matching.
///
/// # Arguments
/// * `points` - Point positions
/// * `normals` - Per-point normals, `None` where undefined
/// * `params` - Neighborhood used for the histograms
///
/// # Returns
/// * `Result<Vec<Option<FpfhFeature>>>` - One descriptor per point
pub fn compute_fpfh_features(
    points: &[Point3d],
    normals: &[Option<Vector3d>],
    params: &FeatureParams,
) -> Result<Vec<Option<FpfhFeature>>> {
    params.validate()?;
    if points.is_empty() {
        return Err(Error::empty("feature extraction needs at least one point"));
    }
    if normals.len() != points.len() {
        return Err(Error::InvalidData(format!(
            "{} normals for {} points",
            normals.len(),
            points.len()
        )));
    }

    let search = SpatialIndex::build(points)?;
    let neighborhoods: Vec<Vec<(usize, f64)>> = points
        .par_iter()
        .map(|p| search.hybrid_query(p, params.radius, params.max_nn))
        .collect();

    let spfh: Vec<Option<FpfhFeature>> = (0..points.len())
        .into_par_iter()
        .map(|i| compute_spfh(i, points, normals, &neighborhoods[i]))
        .collect();

    let features: Vec<Option<FpfhFeature>> = (0..points.len())
        .into_par_iter()
        .map(|i| {
            let own = spfh[i]?;
            let mut fpfh = FpfhFeature::zeros();
            let mut block_sums = [0.0; 3];

            for &(j, dist) in &neighborhoods[i] {
                if j == i || dist == 0.0 {
                    continue;
                }
                let Some(neighbor) = &spfh[j] else { continue };
                for (f, value) in neighbor.histogram.iter().enumerate() {
                    let weighted = value / dist;
                    block_sums[f / FPFH_BINS] += weighted;
                    fpfh.histogram[f] += weighted;
                }
            }

            for (f, value) in fpfh.histogram.iter_mut().enumerate() {
                let sum = block_sums[f / FPFH_BINS];
                if sum != 0.0 {
                    *value *= 100.0 / sum;
                }
                *value += own.histogram[f];
            }
            Some(fpfh)
        })
        .collect();

    debug!(
        points = points.len(),
        described = features.iter().filter(|f| f.is_some()).count(),
        radius = params.radius,
        "computed FPFH features"
    );

    Ok(features)
}
