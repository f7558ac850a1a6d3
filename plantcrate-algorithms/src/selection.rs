//! Segment selection over cluster summaries
//!
//! Pure ranking and filtering; no access to the underlying points.

use crate::clustering::ClusterSummary;
use plantcrate_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

/// Known dimensions of a reference object, e.g. a calibration stick topped by a cube
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeTarget {
    /// Expected vertical extent
    pub height: f64,
    /// Allowed height deviation as a fraction of `height`
    pub height_tolerance: f64,
    /// Horizontal extent band, inclusive
    pub min_width: f64,
    pub max_width: f64,
}

impl Default for ShapeTarget {
    fn default() -> Self {
        Self {
            height: 1.0,
            height_tolerance: 0.1,
            min_width: 0.1,
            max_width: 0.2,
        }
    }
}

impl ShapeTarget {
    pub fn matches(&self, summary: &ClusterSummary) -> bool {
        let width = summary.width();
        (summary.height() - self.height).abs() <= self.height_tolerance * self.height
            && width >= self.min_width
            && width <= self.max_width
    }
}

/// How to pick the clusters of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectionPolicy {
    /// The `k` clusters with the most points
    TopKBySize { k: usize },
    /// Among the `k` largest clusters, the `m` closest to the reference point
    NearestToReference { k: usize, m: usize },
    /// The single cluster whose height and width fit the target
    ShapeMatch(ShapeTarget),
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        SelectionPolicy::TopKBySize { k: 1 }
    }
}

impl SelectionPolicy {
    pub fn validate(&self) -> Result<()> {
        match self {
            SelectionPolicy::TopKBySize { k } if *k == 0 => Err(Error::InvalidParameter(
                "top-k selection needs k >= 1".to_string(),
            )),
            SelectionPolicy::NearestToReference { k, m } if *k == 0 || *m == 0 => {
                Err(Error::InvalidParameter(format!(
                    "nearest-to-reference selection needs k, m >= 1, got k = {}, m = {}",
                    k, m
                )))
            }
            SelectionPolicy::ShapeMatch(target) => {
                let height_ok = target.height.is_finite() && target.height > 0.0;
                let tolerance_ok = target.height_tolerance.is_finite() && target.height_tolerance >= 0.0;
                let band_ok = target.min_width >= 0.0 && target.min_width <= target.max_width;
                if !(height_ok && tolerance_ok && band_ok) {
                    return Err(Error::InvalidParameter(format!(
                        "invalid shape target {:?}",
                        target
                    )));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Larger first, then lower id
fn by_size(a: &ClusterSummary, b: &ClusterSummary) -> Ordering {
    b.size.cmp(&a.size).then(a.id.cmp(&b.id))
}

fn top_k_by_size(summaries: &[ClusterSummary], k: usize) -> Vec<ClusterSummary> {
    let mut ranked = summaries.to_vec();
    ranked.sort_by(by_size);
    ranked.truncate(k);
    ranked
}

/// Pick clusters according to `policy`
///
/// Results are ordered by the policy's ranking. `ShapeMatch` returns exactly
/// one cluster (smallest height deviation, then lowest id) or fails with
/// [`Error::NoMatchingCluster`].
///
/// # Arguments
/// * `summaries` - One summary per cluster
/// * `policy` - Selection rule
///
/// # Returns
/// * `Result<Vec<ClusterSummary>>` - Selected clusters
pub fn select_clusters(summaries: &[ClusterSummary], policy: &SelectionPolicy) -> Result<Vec<ClusterSummary>> {
    policy.validate()?;

    let selected = match policy {
        SelectionPolicy::TopKBySize { k } => top_k_by_size(summaries, *k),
        SelectionPolicy::NearestToReference { k, m } => {
            let mut ranked = top_k_by_size(summaries, *k);
            ranked.sort_by(|a, b| {
                a.min_distance_to_reference
                    .total_cmp(&b.min_distance_to_reference)
                    .then_with(|| by_size(a, b))
            });
            ranked.truncate(*m);
            ranked
        }
        SelectionPolicy::ShapeMatch(target) => {
            let best = summaries
                .iter()
                .filter(|s| target.matches(s))
                .min_by(|a, b| {
                    let da = (a.height() - target.height).abs();
                    let db = (b.height() - target.height).abs();
                    da.total_cmp(&db).then(a.id.cmp(&b.id))
                })
                .ok_or_else(|| Error::NoMatchingCluster {
                    candidates: summaries.len(),
                    reason: format!(
                        "no height within {:.0}% of {} with width in [{}, {}]",
                        target.height_tolerance * 100.0,
                        target.height,
                        target.min_width,
                        target.max_width
                    ),
                })?;
            vec![best.clone()]
        }
    };

    debug!(
        candidates = summaries.len(),
        selected = ?selected.iter().map(|s| s.id).collect::<Vec<_>>(),
        ?policy,
        "selected clusters"
    );
    Ok(selected)
}
