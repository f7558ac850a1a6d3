//! Benchmarks for density clustering and the spatial queries it depends on

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use plantcrate_algorithms::{dbscan, DbscanParams, SpatialIndex};
use plantcrate_core::{Point3d, PointCloud};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A pot-like blob, a plant-like blob and sparse outliers
fn generate_scan(size: usize) -> PointCloud {
    let mut rng = StdRng::seed_from_u64(17);
    let pot = size * 6 / 10;
    let plant = size * 35 / 100;
    let outliers = size - pot - plant;

    let mut points = Vec::with_capacity(size);
    for _ in 0..pot {
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        let radius = rng.gen_range(0.25..0.3);
        points.push(Point3d::new(radius * angle.cos(), radius * angle.sin(), rng.gen_range(0.0..0.4)));
    }
    for _ in 0..plant {
        points.push(Point3d::new(
            rng.gen_range(-0.2..0.2),
            rng.gen_range(-0.2..0.2),
            rng.gen_range(0.45..0.9),
        ));
    }
    for _ in 0..outliers {
        points.push(Point3d::new(
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..1.0),
            rng.gen_range(-1.0..2.0),
        ));
    }
    PointCloud::from_points(points)
}

fn bench_dbscan(c: &mut Criterion) {
    let mut group = c.benchmark_group("dbscan");
    let params = DbscanParams::new(0.03, 3);

    for &size in &[1_000, 10_000, 50_000] {
        let cloud = generate_scan(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &cloud, |b, cloud| {
            b.iter(|| dbscan(black_box(cloud), black_box(&params)))
        });
    }
    group.finish();
}

fn bench_radius_queries(c: &mut Criterion) {
    let mut group = c.benchmark_group("radius_count");

    for &size in &[1_000, 10_000, 50_000] {
        let cloud = generate_scan(size);
        let index = match SpatialIndex::build(cloud.points()) {
            Ok(index) => index,
            Err(_) => continue,
        };
        group.bench_with_input(BenchmarkId::from_parameter(size), &cloud, |b, cloud| {
            b.iter(|| {
                cloud
                    .points()
                    .iter()
                    .map(|p| index.radius_count(black_box(p), 0.03))
                    .sum::<usize>()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dbscan, bench_radius_queries);
criterion_main!(benches);
