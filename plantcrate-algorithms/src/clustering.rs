//! Density-based clustering (DBSCAN)
//!
//! A point is a core point when at least `min_samples` points, itself included,
//! lie within `eps`. Clusters are the connected components of core points under
//! the `eps` relation. Every non-core point within `eps` of a core point joins
//! the cluster of its nearest core point; everything else is noise.
//!
//! Core membership and the core components do not depend on input order, and
//! border points are resolved by distance (then by coordinates), so permuting
//! the input permutes the labels but never changes the partition.

use crate::nearest_neighbor::SpatialIndex;
use plantcrate_core::{Aabb, Error, NearestNeighborSearch, Point3d, PointCloud, Result, Vector3d};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use tracing::debug;

/// Parameters for density clustering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbscanParams {
    /// Neighborhood radius
    pub eps: f64,
    /// Minimum neighborhood size of a core point, the point itself included
    pub min_samples: usize,
}

impl Default for DbscanParams {
    fn default() -> Self {
        Self {
            eps: 0.03,
            min_samples: 3,
        }
    }
}

impl DbscanParams {
    pub fn new(eps: f64, min_samples: usize) -> Self {
        Self { eps, min_samples }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(Error::InvalidParameter(format!(
                "eps must be finite and positive, got {}",
                self.eps
            )));
        }
        if self.min_samples == 0 {
            return Err(Error::InvalidParameter(
                "min_samples must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cluster id per point, `None` for noise.
///
/// Ids run from `0` to `num_clusters() - 1`. They are deterministic for a given
/// input order but carry no meaning beyond grouping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterLabeling {
    labels: Vec<Option<usize>>,
    num_clusters: usize,
}

impl ClusterLabeling {
    pub fn labels(&self) -> &[Option<usize>] {
        &self.labels
    }

    pub fn label(&self, index: usize) -> Option<usize> {
        self.labels.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_clusters(&self) -> usize {
        self.num_clusters
    }

    pub fn noise_count(&self) -> usize {
        self.labels.iter().filter(|l| l.is_none()).count()
    }

    /// Member indices of every cluster, indexed by cluster id
    pub fn clusters(&self) -> Vec<Vec<usize>> {
        let mut clusters = vec![Vec::new(); self.num_clusters];
        for (idx, label) in self.labels.iter().enumerate() {
            if let Some(id) = label {
                clusters[*id].push(idx);
            }
        }
        clusters
    }

    pub fn cluster_indices(&self, id: usize) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(idx, label)| (*label == Some(id)).then_some(idx))
            .collect()
    }

    pub fn cluster_sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0; self.num_clusters];
        for id in self.labels.iter().flatten() {
            sizes[*id] += 1;
        }
        sizes
    }

    fn check_matches(&self, cloud: &PointCloud) -> Result<()> {
        if self.labels.len() != cloud.len() {
            return Err(Error::InvalidData(format!(
                "labeling covers {} points, cloud has {}",
                self.labels.len(),
                cloud.len()
            )));
        }
        Ok(())
    }

    fn check_ids(&self, ids: &[usize]) -> Result<()> {
        if let Some(bad) = ids.iter().find(|&&id| id >= self.num_clusters) {
            return Err(Error::InvalidParameter(format!(
                "cluster id {} out of range, labeling has {} clusters",
                bad, self.num_clusters
            )));
        }
        Ok(())
    }
}

fn lexicographic(a: &Point3d, b: &Point3d) -> Ordering {
    a.x.total_cmp(&b.x)
        .then(a.y.total_cmp(&b.y))
        .then(a.z.total_cmp(&b.z))
}

/// Cluster a point cloud by density
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `params` - `eps` radius and `min_samples` density threshold
///
/// # Returns
/// * `Result<ClusterLabeling>` - Label per point; zero clusters is a valid result
///
/// # Example
/// ```rust
/// use plantcrate_core::{PointCloud, Point3d};
/// use plantcrate_algorithms::{dbscan, DbscanParams};
///
/// fn main() -> plantcrate_core::Result<()> {
///     let cloud = PointCloud::from_points(vec![
///         Point3d::new(0.0, 0.0, 0.0),
///         Point3d::new(0.01, 0.0, 0.0),
///         Point3d::new(0.02, 0.0, 0.0),
///         Point3d::new(5.0, 5.0, 5.0),
///     ]);
///
///     let labeling = dbscan(&cloud, &DbscanParams::new(0.015, 2))?;
///     assert_eq!(labeling.num_clusters(), 1);
///     assert_eq!(labeling.label(3), None);
///     Ok(())
/// }
/// ```
pub fn dbscan(cloud: &PointCloud, params: &DbscanParams) -> Result<ClusterLabeling> {
    params.validate()?;
    cloud.ensure_not_empty("density clustering needs at least one point")?;

    let points = cloud.points();
    let index = SpatialIndex::build(points)?;

    let is_core: Vec<bool> = points
        .par_iter()
        .map(|p| index.radius_count(p, params.eps) >= params.min_samples)
        .collect();

    let mut labels: Vec<Option<usize>> = vec![None; points.len()];
    let mut num_clusters = 0;
    let mut queue = VecDeque::new();

    for seed in 0..points.len() {
        if !is_core[seed] || labels[seed].is_some() {
            continue;
        }

        let id = num_clusters;
        num_clusters += 1;
        labels[seed] = Some(id);
        queue.push_back(seed);

        while let Some(current) = queue.pop_front() {
            for neighbor in index.radius_query(&points[current], params.eps) {
                if is_core[neighbor] && labels[neighbor].is_none() {
                    labels[neighbor] = Some(id);
                    queue.push_back(neighbor);
                }
            }
        }
    }

    // Border points join the cluster of their nearest core point
    let core_labels = &labels;
    let border: Vec<(usize, usize)> = (0..points.len())
        .into_par_iter()
        .filter(|&i| !is_core[i])
        .filter_map(|i| {
            index
                .find_radius_neighbors(&points[i], params.eps)
                .into_iter()
                .filter(|&(j, _)| is_core[j])
                .min_by(|a, b| {
                    a.1.total_cmp(&b.1)
                        .then_with(|| lexicographic(&points[a.0], &points[b.0]))
                })
                .and_then(|(j, _)| core_labels[j].map(|id| (i, id)))
        })
        .collect();

    for (i, id) in border {
        labels[i] = Some(id);
    }

    let labeling = ClusterLabeling {
        labels,
        num_clusters,
    };

    debug!(
        points = points.len(),
        core = is_core.iter().filter(|&&c| c).count(),
        clusters = num_clusters,
        noise = labeling.noise_count(),
        eps = params.eps,
        min_samples = params.min_samples,
        "density clustering"
    );

    Ok(labeling)
}

/// Per-cluster statistics used by the segment selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub id: usize,
    pub size: usize,
    pub centroid: Point3d,
    pub bounds: Aabb,
    /// Smallest distance from any member point to the reference point
    pub min_distance_to_reference: f64,
}

impl ClusterSummary {
    pub fn extents(&self) -> Vector3d {
        self.bounds.extents()
    }

    /// Vertical extent
    pub fn height(&self) -> f64 {
        self.extents().z
    }

    /// Larger of the two horizontal extents
    pub fn width(&self) -> f64 {
        let e = self.extents();
        e.x.max(e.y)
    }
}

/// Summaries of every cluster, ordered by id
///
/// `reference` is typically the centroid of the whole cloud.
pub fn summarize_clusters(
    cloud: &PointCloud,
    labeling: &ClusterLabeling,
    reference: &Point3d,
) -> Result<Vec<ClusterSummary>> {
    cloud.ensure_not_empty("cluster summaries need a non-empty cloud")?;
    labeling.check_matches(cloud)?;

    let points = cloud.points();
    labeling
        .clusters()
        .into_par_iter()
        .enumerate()
        .map(|(id, members)| {
            let member_points: Vec<Point3d> = members.iter().map(|&i| points[i]).collect();
            let bounds = Aabb::from_points(&member_points)
                .ok_or_else(|| Error::InvalidData(format!("cluster {} has no members", id)))?;
            let centroid = Point3d::from(
                member_points
                    .iter()
                    .fold(Vector3d::zeros(), |acc, p| acc + p.coords)
                    / member_points.len() as f64,
            );
            let min_distance_to_reference = member_points
                .iter()
                .map(|p| (p - reference).norm())
                .fold(f64::INFINITY, f64::min);

            Ok(ClusterSummary {
                id,
                size: members.len(),
                centroid,
                bounds,
                min_distance_to_reference,
            })
        })
        .collect()
}

/// New cloud made of one cluster's points
pub fn extract_cluster(cloud: &PointCloud, labeling: &ClusterLabeling, id: usize) -> Result<PointCloud> {
    extract_clusters(cloud, labeling, &[id])
}

/// New cloud made of the points of all listed clusters, in input order
pub fn extract_clusters(cloud: &PointCloud, labeling: &ClusterLabeling, ids: &[usize]) -> Result<PointCloud> {
    labeling.check_matches(cloud)?;
    labeling.check_ids(ids)?;

    let keep: Vec<usize> = labeling
        .labels()
        .iter()
        .enumerate()
        .filter_map(|(idx, label)| label.filter(|id| ids.contains(id)).map(|_| idx))
        .collect();
    cloud.select(&keep)
}

/// New cloud without the listed clusters. Noise points are dropped too.
pub fn remove_clusters(cloud: &PointCloud, labeling: &ClusterLabeling, ids: &[usize]) -> Result<PointCloud> {
    labeling.check_matches(cloud)?;
    labeling.check_ids(ids)?;

    let keep: Vec<usize> = labeling
        .labels()
        .iter()
        .enumerate()
        .filter_map(|(idx, label)| label.filter(|id| !ids.contains(id)).map(|_| idx))
        .collect();
    cloud.select(&keep)
}
