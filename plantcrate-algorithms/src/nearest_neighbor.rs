//! Nearest neighbor search implementations

use plantcrate_core::{Error, NearestNeighborSearch, Point3d, Result};
use rstar::primitives::GeomWithData;
use rstar::RTree;

type IndexedPoint = GeomWithData<[f64; 3], usize>;

fn to_array(point: &Point3d) -> [f64; 3] {
    [point.x, point.y, point.z]
}

/// R*-tree spatial index over a point set snapshot.
///
/// Built once with [`SpatialIndex::build`]; there is no incremental update, a
/// changed point set needs a new index.
#[derive(Debug)]
pub struct SpatialIndex {
    tree: RTree<IndexedPoint>,
    len: usize,
}

impl SpatialIndex {
    pub fn build(points: &[Point3d]) -> Result<Self> {
        if points.is_empty() {
            return Err(Error::empty("cannot build a spatial index over zero points"));
        }

        let items = points
            .iter()
            .enumerate()
            .map(|(idx, p)| IndexedPoint::new(to_array(p), idx))
            .collect();

        Ok(Self {
            tree: RTree::bulk_load(items),
            len: points.len(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Indices within `radius` of `query`, ordered by index
    pub fn radius_query(&self, query: &Point3d, radius: f64) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .tree
            .locate_within_distance(to_array(query), radius * radius)
            .map(|item| item.data)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Number of indexed points within `radius` of `query`, the query included
    pub fn radius_count(&self, query: &Point3d, radius: f64) -> usize {
        self.tree
            .locate_within_distance(to_array(query), radius * radius)
            .count()
    }

    /// Indices of the `k` nearest points, closest first
    pub fn knn_query(&self, query: &Point3d, k: usize) -> Vec<usize> {
        self.find_k_nearest(query, k)
            .into_iter()
            .map(|(idx, _)| idx)
            .collect()
    }

    /// At most `max_nn` nearest points that also lie within `radius`, closest first
    pub fn hybrid_query(&self, query: &Point3d, radius: f64, max_nn: usize) -> Vec<(usize, f64)> {
        let radius_squared = radius * radius;
        self.tree
            .nearest_neighbor_iter_with_distance_2(&to_array(query))
            .take_while(|(_, d2)| *d2 <= radius_squared)
            .take(max_nn)
            .map(|(item, d2)| (item.data, d2.sqrt()))
            .collect()
    }

    /// Closest indexed point and its distance
    pub fn nearest(&self, query: &Point3d) -> Option<(usize, f64)> {
        self.tree
            .nearest_neighbor_iter_with_distance_2(&to_array(query))
            .next()
            .map(|(item, d2)| (item.data, d2.sqrt()))
    }
}

impl NearestNeighborSearch for SpatialIndex {
    fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
        self.tree
            .nearest_neighbor_iter_with_distance_2(&to_array(query))
            .take(k)
            .map(|(item, d2)| (item.data, d2.sqrt()))
            .collect()
    }

    fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)> {
        let q = to_array(query);
        let mut neighbors: Vec<(usize, f64)> = self
            .tree
            .locate_within_distance(q, radius * radius)
            .map(|item| {
                let p = item.geom();
                let d2 = (p[0] - q[0]).powi(2) + (p[1] - q[1]).powi(2) + (p[2] - q[2]).powi(2);
                (item.data, d2.sqrt())
            })
            .collect();
        neighbors.sort_unstable_by_key(|&(idx, _)| idx);
        neighbors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_points(n: usize, seed: u64) -> Vec<Point3d> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point3d::new(rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)))
            .collect()
    }

    /// Exhaustive search used as the reference answer
    struct BruteForceSearch {
        points: Vec<Point3d>,
    }

    impl BruteForceSearch {
        fn new(points: &[Point3d]) -> Self {
            Self {
                points: points.to_vec(),
            }
        }
    }

    impl NearestNeighborSearch for BruteForceSearch {
        fn find_k_nearest(&self, query: &Point3d, k: usize) -> Vec<(usize, f64)> {
            let mut distances: Vec<(usize, f64)> = self
                .points
                .iter()
                .enumerate()
                .map(|(idx, point)| (idx, (point - query).norm()))
                .collect();

            distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            distances.truncate(k);
            distances
        }

        fn find_radius_neighbors(&self, query: &Point3d, radius: f64) -> Vec<(usize, f64)> {
            let radius_squared = radius * radius;
            self.points
                .iter()
                .enumerate()
                .filter_map(|(idx, point)| {
                    let distance_squared = (point - query).norm_squared();
                    (distance_squared <= radius_squared).then(|| (idx, distance_squared.sqrt()))
                })
                .collect()
        }
    }

    #[test]
    fn test_build_empty_fails() {
        assert!(matches!(SpatialIndex::build(&[]), Err(Error::EmptyInput { .. })));
    }

    #[test]
    fn test_query_includes_self() {
        let points = vec![
            Point3d::new(0.0, 0.0, 0.0),
            Point3d::new(1.0, 0.0, 0.0),
            Point3d::new(5.0, 0.0, 0.0),
        ];
        let index = SpatialIndex::build(&points).unwrap();

        assert_eq!(index.radius_query(&points[0], 1.0), vec![0, 1]);
        assert_eq!(index.radius_count(&points[2], 1.0), 1);
        assert_eq!(index.knn_query(&points[2], 1), vec![2]);
        assert_eq!(index.nearest(&Point3d::new(0.9, 0.0, 0.0)).map(|n| n.0), Some(1));
    }

    #[test]
    fn test_hybrid_query_bounds() {
        let points: Vec<Point3d> = (0..10).map(|i| Point3d::new(i as f64, 0.0, 0.0)).collect();
        let index = SpatialIndex::build(&points).unwrap();

        let by_radius = index.hybrid_query(&points[0], 2.5, 100);
        assert_eq!(by_radius.iter().map(|n| n.0).collect::<Vec<_>>(), vec![0, 1, 2]);

        let by_count = index.hybrid_query(&points[5], 10.0, 2);
        assert_eq!(by_count.len(), 2);
        assert_eq!(by_count[0].0, 5);
    }

    #[test]
    fn test_matches_brute_force() {
        let points = random_points(500, 7);
        let index = SpatialIndex::build(&points).unwrap();
        let brute = BruteForceSearch::new(&points);

        for query in random_points(20, 11) {
            let fast = index.find_radius_neighbors(&query, 0.3);
            let slow = brute.find_radius_neighbors(&query, 0.3);
            assert_eq!(
                fast.iter().map(|n| n.0).collect::<Vec<_>>(),
                slow.iter().map(|n| n.0).collect::<Vec<_>>()
            );

            let fast_knn = index.find_k_nearest(&query, 5);
            let slow_knn = brute.find_k_nearest(&query, 5);
            for (a, b) in fast_knn.iter().zip(slow_knn.iter()) {
                assert!((a.1 - b.1).abs() < 1e-12);
            }
        }
    }
}
