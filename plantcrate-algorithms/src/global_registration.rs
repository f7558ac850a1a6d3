//! Feature-based global registration
//!
//! Coarse alignment without an initial guess: FPFH correspondences are sampled
//! in minimal sets, each set proposes a rigid transform, and the proposal
//! explaining the most correspondences wins.

use crate::features::FpfhFeature;
use crate::nearest_neighbor::SpatialIndex;
use crate::registration::{compute_rigid_transform, evaluate_registration, MIN_CORRESPONDENCES};
use itertools::Itertools;
use plantcrate_core::{Error, Point3d, Result, RigidTransform, Stage};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// A proposed match between a source point and a target point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub source: usize,
    pub target: usize,
    /// Distance between the two descriptors
    pub feature_distance: f64,
}

/// Parameters for RANSAC global registration.
///
/// The search stops at `max_iterations` or once `confidence` is reached,
/// whichever comes first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRegistrationParams {
    /// Inlier distance between a transformed source point and its match
    pub max_correspondence_distance: f64,
    /// Correspondences per sample
    pub ransac_n: usize,
    /// Pairwise edge lengths of a sample must agree within this ratio
    pub edge_length_ratio: f64,
    /// Keep only mutual nearest feature matches
    pub mutual_filter: bool,
    pub max_iterations: usize,
    /// Probability of having drawn at least one all-inlier sample
    pub confidence: f64,
    /// Seed for the sampling RNG
    pub seed: u64,
}

impl Default for GlobalRegistrationParams {
    fn default() -> Self {
        Self {
            max_correspondence_distance: 0.05,
            ransac_n: 4,
            edge_length_ratio: 0.9,
            mutual_filter: true,
            max_iterations: 100_000,
            confidence: 0.999,
            seed: 42,
        }
    }
}

impl GlobalRegistrationParams {
    pub fn validate(&self) -> Result<()> {
        if !self.max_correspondence_distance.is_finite() || self.max_correspondence_distance <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "RANSAC correspondence distance must be finite and positive, got {}",
                self.max_correspondence_distance
            )));
        }
        if self.ransac_n < MIN_CORRESPONDENCES {
            return Err(Error::InvalidParameter(format!(
                "ransac_n must be at least {}, got {}",
                MIN_CORRESPONDENCES, self.ransac_n
            )));
        }
        if !(self.edge_length_ratio > 0.0 && self.edge_length_ratio <= 1.0) {
            return Err(Error::InvalidParameter(format!(
                "edge length ratio must be in (0, 1], got {}",
                self.edge_length_ratio
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameter(
                "RANSAC max_iterations must be positive".to_string(),
            ));
        }
        if !(self.confidence > 0.0 && self.confidence < 1.0) {
            return Err(Error::InvalidParameter(format!(
                "RANSAC confidence must be in (0, 1), got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Result of RANSAC global registration
#[derive(Debug, Clone)]
pub struct GlobalRegistrationResult {
    pub transform: RigidTransform,
    /// Fraction of source points with a target point within the inlier distance
    pub fitness: f64,
    pub inlier_rmse: f64,
    /// Feature correspondences consistent with `transform`
    pub inlier_correspondences: Vec<Correspondence>,
    /// Number of samples drawn
    pub iterations: usize,
    /// Samples that passed every check and were scored
    pub valid_candidates: usize,
}

fn nearest_feature(
    query: &FpfhFeature,
    candidates: &[(usize, &FpfhFeature)],
) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for &(idx, feature) in candidates {
        let d2 = query.distance_squared(feature);
        if best.map_or(true, |(_, best_d2)| d2 < best_d2) {
            best = Some((idx, d2));
        }
    }
    best.map(|(idx, d2)| (idx, d2.sqrt()))
}

/// Match each described source point to its nearest target descriptor.
///
/// With `mutual_filter` set only mutual nearest pairs are kept, unless fewer
/// than `3 * ransac_n` survive, in which case the unfiltered set is returned.
pub fn match_features(
    source_features: &[Option<FpfhFeature>],
    target_features: &[Option<FpfhFeature>],
    params: &GlobalRegistrationParams,
) -> Result<Vec<Correspondence>> {
    let described = |features: &[Option<FpfhFeature>]| -> Vec<(usize, FpfhFeature)> {
        features
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.map(|f| (i, f)))
            .collect()
    };
    let source = described(source_features);
    let target = described(target_features);
    if source.is_empty() {
        return Err(Error::empty("no source point has a feature descriptor"));
    }
    if target.is_empty() {
        return Err(Error::empty("no target point has a feature descriptor"));
    }

    let source_refs: Vec<(usize, &FpfhFeature)> = source.iter().map(|(i, f)| (*i, f)).collect();
    let target_refs: Vec<(usize, &FpfhFeature)> = target.iter().map(|(i, f)| (*i, f)).collect();

    let forward: Vec<Correspondence> = source
        .par_iter()
        .filter_map(|(i, feature)| {
            nearest_feature(feature, &target_refs).map(|(j, d)| Correspondence {
                source: *i,
                target: j,
                feature_distance: d,
            })
        })
        .collect();

    if !params.mutual_filter {
        return Ok(forward);
    }

    let backward: std::collections::HashMap<usize, usize> = target
        .par_iter()
        .filter_map(|(j, feature)| nearest_feature(feature, &source_refs).map(|(i, _)| (*j, i)))
        .collect();

    let mutual: Vec<Correspondence> = forward
        .iter()
        .filter(|c| backward.get(&c.target) == Some(&c.source))
        .copied()
        .collect();

    let required = 3 * params.ransac_n;
    if mutual.len() < required {
        warn!(
            mutual = mutual.len(),
            required,
            total = forward.len(),
            "too few mutual feature matches, using all matches"
        );
        return Ok(forward);
    }

    debug!(mutual = mutual.len(), total = forward.len(), "mutual feature matches");
    Ok(mutual)
}

/// Number of samples needed to draw an all-inlier set with `confidence`
fn required_iterations(inlier_ratio: f64, sample_size: usize, confidence: f64) -> f64 {
    let all_inliers = inlier_ratio.powi(sample_size as i32);
    if all_inliers <= 0.0 {
        return f64::INFINITY;
    }
    if all_inliers >= 1.0 {
        return 1.0;
    }
    ((1.0 - confidence).ln() / (1.0 - all_inliers).ln()).ceil()
}

fn edge_lengths_consistent(
    sample: &[Correspondence],
    source: &[Point3d],
    target: &[Point3d],
    ratio: f64,
) -> bool {
    sample.iter().tuple_combinations().all(|(a, b)| {
        let d_source = (source[a.source] - source[b.source]).norm();
        let d_target = (target[a.target] - target[b.target]).norm();
        d_source >= d_target * ratio && d_target >= d_source * ratio
    })
}

/// RANSAC registration over feature correspondences
///
/// Each iteration samples `ransac_n` correspondences, rejects the sample if
/// its pairwise edge lengths disagree between the two clouds, fits a rigid
/// transform, rejects it if a sampled pair stays farther apart than the inlier
/// distance, and otherwise scores it by the number of inlier correspondences
/// (ties broken by lower inlier RMSE).
///
/// # Arguments
/// * `source` - Source points, index-aligned with `source_features`
/// * `target` - Target points, index-aligned with `target_features`
/// * `source_features` / `target_features` - FPFH descriptors, `None` where undefined
/// * `params` - Sampling, checking and termination settings
///
/// # Returns
/// * `Result<GlobalRegistrationResult>` - Best transform and its quality;
///   [`Error::NoConvergence`] when no sample survives the checks
pub fn ransac_global_registration(
    source: &[Point3d],
    target: &[Point3d],
    source_features: &[Option<FpfhFeature>],
    target_features: &[Option<FpfhFeature>],
    params: &GlobalRegistrationParams,
) -> Result<GlobalRegistrationResult> {
    params.validate()?;
    if source.is_empty() {
        return Err(Error::empty("global registration source cloud"));
    }
    if target.is_empty() {
        return Err(Error::empty("global registration target cloud"));
    }
    if source_features.len() != source.len() || target_features.len() != target.len() {
        return Err(Error::InvalidData(format!(
            "features not aligned with points: {}/{} source, {}/{} target",
            source_features.len(),
            source.len(),
            target_features.len(),
            target.len()
        )));
    }

    let correspondences = match_features(source_features, target_features, params)?;
    if correspondences.len() < params.ransac_n {
        return Err(Error::NoConvergence {
            stage: Stage::GlobalRegistration,
            iterations: 0,
            reason: format!(
                "{} feature correspondences, a sample needs {}",
                correspondences.len(),
                params.ransac_n
            ),
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let threshold = params.max_correspondence_distance;
    let threshold_squared = threshold * threshold;

    let mut best: Option<(RigidTransform, usize, f64)> = None;
    let mut valid_candidates = 0;
    let mut iteration_bound = params.max_iterations as f64;
    let mut iterations = 0;

    while (iterations as f64) < iteration_bound {
        iterations += 1;

        let sample: Vec<Correspondence> =
            rand::seq::index::sample(&mut rng, correspondences.len(), params.ransac_n)
                .into_iter()
                .map(|k| correspondences[k])
                .collect();

        if !edge_lengths_consistent(&sample, source, target, params.edge_length_ratio) {
            continue;
        }

        let sample_source: Vec<Point3d> = sample.iter().map(|c| source[c.source]).collect();
        let sample_target: Vec<Point3d> = sample.iter().map(|c| target[c.target]).collect();
        let Ok(candidate) = compute_rigid_transform(&sample_source, &sample_target) else {
            continue;
        };

        let sample_fits = sample_source
            .iter()
            .zip(sample_target.iter())
            .all(|(s, t)| (candidate.transform_point(s) - t).norm_squared() <= threshold_squared);
        if !sample_fits {
            continue;
        }

        valid_candidates += 1;

        let mut inliers = 0;
        let mut squared_error = 0.0;
        for c in &correspondences {
            let d2 = (candidate.transform_point(&source[c.source]) - target[c.target]).norm_squared();
            if d2 <= threshold_squared {
                inliers += 1;
                squared_error += d2;
            }
        }
        let rmse = (squared_error / inliers as f64).sqrt();

        let improves = match &best {
            None => true,
            Some((_, best_inliers, best_rmse)) => outscores((inliers, rmse), (*best_inliers, *best_rmse)),
        };
        if improves {
            best = Some((candidate, inliers, rmse));
            let ratio = inliers as f64 / correspondences.len() as f64;
            iteration_bound = iteration_bound
                .min(required_iterations(ratio, params.ransac_n, params.confidence));
        }
    }

    let Some((transform, inlier_count, _)) = best else {
        warn!(
            iterations,
            correspondences = correspondences.len(),
            "no RANSAC sample passed the consistency checks"
        );
        return Err(Error::NoConvergence {
            stage: Stage::GlobalRegistration,
            iterations,
            reason: format!(
                "none of {} samples over {} correspondences passed the edge length and distance checks",
                iterations,
                correspondences.len()
            ),
        });
    };

    let inlier_correspondences: Vec<Correspondence> = correspondences
        .iter()
        .filter(|c| {
            (transform.transform_point(&source[c.source]) - target[c.target]).norm_squared()
                <= threshold_squared
        })
        .copied()
        .collect();

    let target_index = SpatialIndex::build(target)?;
    let evaluation = evaluate_registration(source, &target_index, &transform, threshold);

    info!(
        iterations,
        valid_candidates,
        inliers = inlier_count,
        correspondences = correspondences.len(),
        fitness = evaluation.fitness,
        rmse = evaluation.rmse,
        "global registration finished"
    );

    Ok(GlobalRegistrationResult {
        transform,
        fitness: evaluation.fitness,
        inlier_rmse: evaluation.rmse,
        inlier_correspondences,
        iterations,
        valid_candidates,
    })
}

/// Candidate ranking: more inliers wins, equal inlier counts go to the lower RMSE.
/// Both arguments are `(inlier count, inlier rmse)`.
fn outscores(candidate: (usize, f64), best: (usize, f64)) -> bool {
    candidate.0 > best.0 || (candidate.0 == best.0 && candidate.1 < best.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FPFH_DIMENSION;
    use approx::assert_relative_eq;
    use nalgebra::{Translation3, Unit, UnitQuaternion};
    use plantcrate_core::Vector3d;
    use rand::Rng;

    /// Unique synthetic descriptor per index so matching is exact
    fn tagged_features(n: usize) -> Vec<Option<FpfhFeature>> {
        (0..n)
            .map(|i| {
                let mut f = FpfhFeature::zeros();
                f.histogram[i % FPFH_DIMENSION] = 100.0;
                f.histogram[(i / FPFH_DIMENSION) % FPFH_DIMENSION] += 10.0 * (i + 1) as f64;
                Some(f)
            })
            .collect()
    }

    fn random_points(n: usize, seed: u64) -> Vec<Point3d> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point3d::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    fn known_transform() -> RigidTransform {
        let axis = Unit::new_normalize(Vector3d::new(1.0, 2.0, 3.0));
        RigidTransform::from_parts(
            Translation3::new(0.5, -1.0, 2.0),
            UnitQuaternion::from_axis_angle(&axis, 0.7),
        )
    }

    #[test]
    fn test_required_iterations() {
        assert_eq!(required_iterations(1.0, 4, 0.999), 1.0);
        assert!(required_iterations(0.0, 4, 0.999).is_infinite());
        // 0.5^4 = 1/16 → ln(0.001) / ln(15/16) ≈ 107.04
        assert_relative_eq!(required_iterations(0.5, 4, 0.999), 108.0);
    }

    #[test]
    fn test_candidate_ranking() {
        // equal inliers: lower residual wins, equal residual does not replace
        assert!(outscores((12, 0.010), (12, 0.020)));
        assert!(!outscores((12, 0.020), (12, 0.010)));
        assert!(!outscores((12, 0.010), (12, 0.010)));
        // inlier count dominates residual
        assert!(outscores((13, 0.050), (12, 0.001)));
        assert!(!outscores((11, 0.001), (12, 0.050)));
    }

    #[test]
    fn test_match_features_mutual() {
        let features = tagged_features(40);
        let params = GlobalRegistrationParams::default();
        let matches = match_features(&features, &features, &params).unwrap();
        assert_eq!(matches.len(), 40);
        assert!(matches.iter().all(|c| c.source == c.target && c.feature_distance == 0.0));
    }

    #[test]
    fn test_match_features_skips_undescribed_points() {
        let mut source = tagged_features(40);
        source[3] = None;
        let params = GlobalRegistrationParams {
            mutual_filter: false,
            ..GlobalRegistrationParams::default()
        };
        let matches = match_features(&source, &tagged_features(40), &params).unwrap();
        assert_eq!(matches.len(), 39);
        assert!(matches.iter().all(|c| c.source != 3));

        assert!(matches!(
            match_features(&[None, None], &tagged_features(4), &params),
            Err(Error::EmptyInput { .. })
        ));
    }

    #[test]
    fn test_recovers_transform_with_outlier_matches() {
        let source = random_points(60, 3);
        let known = known_transform();
        let target: Vec<Point3d> = source.iter().map(|p| known.transform_point(p)).collect();

        // every fourth target descriptor is shuffled to create false matches
        let source_features = tagged_features(60);
        let mut target_features = source_features.clone();
        for i in (0..60).step_by(4) {
            target_features.swap(i, (i + 17) % 60);
        }

        let params = GlobalRegistrationParams {
            mutual_filter: false,
            ..GlobalRegistrationParams::default()
        };
        let result =
            ransac_global_registration(&source, &target, &source_features, &target_features, &params)
                .unwrap();

        assert_relative_eq!(result.transform.to_matrix(), known.to_matrix(), epsilon = 1e-9);
        assert_relative_eq!(result.fitness, 1.0);
        assert!(result.valid_candidates >= 1);
        assert!(result.iterations < params.max_iterations);
    }

    #[test]
    fn test_same_seed_same_result() {
        let source = random_points(50, 5);
        let target: Vec<Point3d> = source.iter().map(|p| known_transform().transform_point(p)).collect();
        let features = tagged_features(50);
        let params = GlobalRegistrationParams::default();

        let a = ransac_global_registration(&source, &target, &features, &features, &params).unwrap();
        let b = ransac_global_registration(&source, &target, &features, &features, &params).unwrap();
        assert_eq!(a.transform, b.transform);
        assert_eq!(a.iterations, b.iterations);
    }

    #[test]
    fn test_no_valid_candidate_is_an_error() {
        // target is the source scaled by 3, so no sample passes the edge check
        let source = random_points(30, 9);
        let target: Vec<Point3d> = source.iter().map(|p| Point3d::from(p.coords * 3.0)).collect();
        let features = tagged_features(30);
        let params = GlobalRegistrationParams {
            max_iterations: 200,
            ..GlobalRegistrationParams::default()
        };

        let result = ransac_global_registration(&source, &target, &features, &features, &params);
        assert!(matches!(
            result,
            Err(Error::NoConvergence {
                stage: Stage::GlobalRegistration,
                iterations: 200,
                ..
            })
        ));
    }

    #[test]
    fn test_rejects_empty_input() {
        let params = GlobalRegistrationParams::default();
        let points = random_points(10, 1);
        let features = tagged_features(10);
        assert!(matches!(
            ransac_global_registration(&[], &points, &[], &features, &params),
            Err(Error::EmptyInput { .. })
        ));
        assert!(matches!(
            ransac_global_registration(&points, &[], &features, &[], &params),
            Err(Error::EmptyInput { .. })
        ));
    }
}
