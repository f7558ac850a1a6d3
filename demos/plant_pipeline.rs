//! Plant scan pipelines on synthetic data
//!
//! Builds a synthetic potted plant (pot, stem, leaves and a reference stick)
//! and runs one of the four pipelines on it:
//!
//! - `register`: align a displaced copy of the scan and merge the two
//! - `segment`: cluster the scan, find the reference stick and remove it
//! - `tips`: skeletonize the plant and count leaf tips
//! - `measure`: measure one leaf and calibrate a plant volume
//!
//! Set `RUST_LOG` or pass `-v`/`-vv` to see the library's stage logging.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nalgebra::{Translation3, Unit, UnitQuaternion};
use plantcrate_algorithms::*;
use plantcrate_core::{Bounded, LengthUnit, MeasurementScale, Point3d, PointCloud, RigidTransform, Vector3d};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Clustering radius that keeps the stick's top cube attached to the stick
const SEGMENT_EPS: f64 = 0.05;
const SEGMENT_MIN_SAMPLES: usize = 3;
const STICK_HEIGHT: f64 = 1.0;
/// Physical length of the synthetic reference stick, in meters
const STICK_REAL_LENGTH: f64 = 0.3;

#[derive(Parser)]
#[command(name = "plant_pipeline")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Seed for the synthetic scan
    #[arg(long, global = true, default_value = "7")]
    seed: u64,

    /// Number of leaves on the synthetic plant
    #[arg(long, global = true, default_value = "5")]
    leaves: usize,

    /// Increase output verbosity (-v for info, -vv for debug)
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a rotated and shifted copy of the scan back onto it
    Register {
        /// Voxel size of the coarse stage copies
        #[arg(long, default_value = "0.02")]
        voxel_size: f64,

        /// Rotation applied to the copy, in radians
        #[arg(long, default_value = "0.5")]
        angle: f64,

        /// ICP correspondence distance
        #[arg(long, default_value = "0.02")]
        icp_distance: f64,
    },

    /// Density clustering and reference stick selection
    Segment {
        #[arg(long, default_value_t = SEGMENT_EPS)]
        eps: f64,

        #[arg(long, default_value_t = SEGMENT_MIN_SAMPLES)]
        min_samples: usize,

        /// Height of the reference stick
        #[arg(long, default_value_t = STICK_HEIGHT)]
        stick_height: f64,
    },

    /// Skeleton tip count as a leaf-count proxy
    Tips {
        /// Voxel size; derived from the bounding-box diagonal when omitted
        #[arg(long)]
        voxel_size: Option<f64>,

        /// Tip neighborhood radius; 1.8 voxels when omitted
        #[arg(long)]
        tip_radius: Option<f64>,

        #[arg(long, default_value = "100")]
        max_iterations: usize,
    },

    /// Leaf length, width and area, and calibrated plant volume
    Measure {
        /// Reference length as measured in the scan; the synthetic stick's
        /// vertical extent when omitted
        #[arg(long)]
        reference_model_length: Option<f64>,

        /// Real reference length in meters
        #[arg(long, default_value_t = STICK_REAL_LENGTH)]
        reference_real_length: f64,

        /// Enclosed model volume of the reference cube
        #[arg(long, default_value = "3.0")]
        cube_model_volume: f64,

        /// Real volume of the reference cube
        #[arg(long, default_value = "3.765")]
        cube_real_volume: f64,

        /// Enclosed model volume of the plant
        #[arg(long, default_value = "42.0")]
        plant_model_volume: f64,
    },
}

fn init_tracing(verbose: u8) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match verbose {
            0 => "warn",
            1 => "plantcrate_algorithms=info,plant_pipeline=info",
            _ => "plantcrate_algorithms=debug,plant_pipeline=debug",
        };
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .with(filter)
        .init();
}

/// Synthetic potted plant
struct Scan {
    pot: Vec<Point3d>,
    plant: Vec<Point3d>,
    leaves: Vec<Vec<Point3d>>,
    stick: Vec<Point3d>,
}

impl Scan {
    fn generate(seed: u64, leaf_count: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);

        // open cylinder
        let pot: Vec<Point3d> = (0..3000)
            .map(|_| {
                let a = rng.gen_range(0.0..TAU);
                Point3d::new(0.3 * a.cos(), 0.3 * a.sin(), rng.gen_range(0.0..0.5))
            })
            .collect();

        // stem up the middle
        let mut plant: Vec<Point3d> = (0..300)
            .map(|i| {
                let z = 0.5 + i as f64 * 0.002;
                Point3d::new(rng.gen_range(-0.005..0.005), rng.gen_range(-0.005..0.005), z)
            })
            .collect();

        // curved leaves fanning out from the stem top
        let leaves: Vec<Vec<Point3d>> = (0..leaf_count)
            .map(|k| {
                let heading = TAU * k as f64 / leaf_count as f64;
                let (along, across) = (
                    Vector3d::new(heading.cos(), heading.sin(), 0.0),
                    Vector3d::new(-heading.sin(), heading.cos(), 0.0),
                );
                let base = Point3d::new(0.0, 0.0, 1.1);
                (0..400)
                    .map(|_| {
                        let t: f64 = rng.gen_range(0.0..1.0);
                        let half_width = 0.06 * (std::f64::consts::PI * t).sin();
                        let s = rng.gen_range(-1.0..1.0) * half_width;
                        let lift = 0.15 * t - 0.2 * t * t + rng.gen_range(-0.003..0.003);
                        base + along * (0.02 + 0.35 * t) + across * s + Vector3d::z() * lift
                    })
                    .collect()
            })
            .collect();
        plant.extend(leaves.iter().flatten().copied());

        // reference stick topped by a cube, beside the pot
        let stick: Vec<Point3d> = (0..400)
            .map(|i| {
                let z = i as f64 * 0.0025;
                let half = if z > 0.88 { 0.06 } else { 0.01 };
                Point3d::new(
                    0.7 + rng.gen_range(-half..half),
                    rng.gen_range(-half..half),
                    z,
                )
            })
            .collect();

        Self {
            pot,
            plant,
            leaves,
            stick,
        }
    }

    /// Vertical extent of the reference stick
    fn stick_length(&self) -> Option<f64> {
        let bounds = self.stick.as_slice().bounds()?;
        Some(bounds.max.z - bounds.min.z)
    }

    fn cloud(&self) -> PointCloud {
        self.pot
            .iter()
            .chain(&self.plant)
            .chain(&self.stick)
            .copied()
            .collect()
    }
}

fn run_register(scan: &Scan, voxel_size: f64, angle: f64, icp_distance: f64) -> Result<()> {
    let target = scan.cloud();
    let applied = RigidTransform::from_parts(
        Translation3::new(0.05, -0.03, 0.02),
        UnitQuaternion::from_axis_angle(&Unit::new_normalize(Vector3d::new(0.2, 0.1, 1.0)), angle),
    );
    let source = target.transformed(&applied);

    let config = RegistrationConfig {
        voxel_size: Some(voxel_size),
        normals: NormalParams {
            radius: 2.0 * voxel_size,
            ..NormalParams::default()
        },
        features: FeatureParams {
            radius: 5.0 * voxel_size,
            ..FeatureParams::default()
        },
        global: GlobalRegistrationParams {
            max_correspondence_distance: 1.5 * voxel_size,
            ..GlobalRegistrationParams::default()
        },
        icp: IcpParams {
            max_correspondence_distance: icp_distance,
            ..IcpParams::default()
        },
    };

    let (merged, report) = align_and_merge(&source, &target, &config).context("registration failed")?;
    let error = report.transform.compose(&applied);

    println!("stage:              {:?}", report.stage);
    if let Some(coarse) = &report.coarse {
        println!(
            "coarse:             fitness {:.3}, rmse {:.5}, {} samples",
            coarse.fitness, coarse.inlier_rmse, coarse.iterations
        );
    }
    if let Some(refined) = &report.refined {
        println!(
            "refined:            fitness {:.3}, rmse {:.6}, {} iterations, converged {}",
            refined.fitness, refined.rmse, refined.iterations, refined.converged
        );
    }
    println!("residual rotation:  {:.2e} rad", error.rotation_angle());
    println!("residual shift:     {:.2e}", error.translation_vector().norm());
    println!("merged points:      {}", merged.len());
    Ok(())
}

fn run_segment(scan: &Scan, eps: f64, min_samples: usize, stick_height: f64) -> Result<()> {
    let cloud = scan.cloud();
    let labeling = dbscan(&cloud, &DbscanParams::new(eps, min_samples))?;
    let centroid = cloud.centroid().context("empty scan")?;
    let summaries = summarize_clusters(&cloud, &labeling, &centroid)?;

    println!("clusters: {}, noise points: {}", labeling.num_clusters(), labeling.noise_count());
    for s in select_clusters(&summaries, &SelectionPolicy::TopKBySize { k: 5 })? {
        println!(
            "  #{:<3} {:>6} points  height {:.3}  width {:.3}  distance {:.3}",
            s.id,
            s.size,
            s.height(),
            s.width(),
            s.min_distance_to_reference
        );
    }

    let target = ShapeTarget {
        height: stick_height,
        ..ShapeTarget::default()
    };
    let stick = select_clusters(&summaries, &SelectionPolicy::ShapeMatch(target))
        .context("reference stick not found; widen the shape tolerance or retune eps")?;
    let stick_id = stick[0].id;
    println!("reference stick: cluster #{}", stick_id);

    let stick_cloud = extract_cluster(&cloud, &labeling, stick_id)?;
    let upright = vertical_alignment(stick_cloud.points())?;
    println!("stick tilt: {:.4} rad", upright.rotation_angle());

    let without_stick = remove_clusters(&cloud, &labeling, &[stick_id])?;
    println!("points without stick and noise: {}", without_stick.len());

    let nearest = select_clusters(&summaries, &SelectionPolicy::NearestToReference { k: 3, m: 1 })?;
    info!(cluster = nearest[0].id, "cluster nearest the scan centroid");
    Ok(())
}

fn run_tips(scan: &Scan, voxel_size: Option<f64>, tip_radius: Option<f64>, max_iterations: usize) -> Result<()> {
    let plant: PointCloud = scan.plant.iter().copied().collect();
    let diagonal = plant.bounding_box().context("empty plant")?.diagonal();

    let mut params = SkeletonParams::for_diagonal(diagonal)?;
    if let Some(voxel_size) = voxel_size {
        params.voxel_size = voxel_size;
        params.tip_radius = SkeletonParams::TIP_RADIUS_VOXELS * voxel_size;
    }
    if let Some(tip_radius) = tip_radius {
        params.tip_radius = tip_radius;
    }
    params.max_iterations = max_iterations;

    let analysis = count_leaf_tips(&plant, &params)?;
    println!("voxel size:      {:.4} (diagonal {:.3})", params.voxel_size, diagonal);
    println!("tip radius:      {:.4}", params.tip_radius);
    println!("skeleton points: {}", analysis.skeleton_points.len());
    println!("thinning passes: {} (converged {})", analysis.skeleton.iterations, analysis.skeleton.converged);
    println!("tips:            {} (plant has {} leaves)", analysis.tip_count(), scan.leaves.len());
    Ok(())
}

fn run_measure(
    scan: &Scan,
    reference_model_length: Option<f64>,
    reference_real_length: f64,
    cube_model_volume: f64,
    cube_real_volume: f64,
    plant_model_volume: f64,
) -> Result<()> {
    let Some(leaf) = scan.leaves.first() else {
        bail!("the synthetic plant has no leaves");
    };
    let reference_model_length = match reference_model_length {
        Some(length) => length,
        None => scan.stick_length().context("the synthetic scan has no reference stick")?,
    };
    let scale = MeasurementScale::from_reference(reference_model_length, reference_real_length, LengthUnit::Centimeters)?;
    let m = measure_leaf(leaf, &scale)?;
    let unit = m.unit.symbol();
    println!("leaf length: {:.3} {}", m.length, unit);
    println!("leaf width:  {:.3} {}", m.width, unit);
    println!("leaf area:   {:.3} {}²", m.area, unit);

    let calibration = VolumeCalibration::from_reference(cube_model_volume, cube_real_volume)?;
    println!("volume ratio: {:.3}", calibration.ratio);
    println!("plant volume: {:.3}", calibration.calibrate(plant_model_volume)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let scan = Scan::generate(cli.seed, cli.leaves);
    info!(
        pot = scan.pot.len(),
        plant = scan.plant.len(),
        stick = scan.stick.len(),
        "generated synthetic scan"
    );

    match cli.command {
        Commands::Register {
            voxel_size,
            angle,
            icp_distance,
        } => run_register(&scan, voxel_size, angle, icp_distance),
        Commands::Segment {
            eps,
            min_samples,
            stick_height,
        } => run_segment(&scan, eps, min_samples, stick_height),
        Commands::Tips {
            voxel_size,
            tip_radius,
            max_iterations,
        } => run_tips(&scan, voxel_size, tip_radius, max_iterations),
        Commands::Measure {
            reference_model_length,
            reference_real_length,
            cube_model_volume,
            cube_real_volume,
            plant_model_volume,
        } => run_measure(
            &scan,
            reference_model_length,
            reference_real_length,
            cube_model_volume,
            cube_real_volume,
            plant_model_volume,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_defaults_find_the_stick() {
        let scan = Scan::generate(7, 5);
        assert!(run_segment(&scan, SEGMENT_EPS, SEGMENT_MIN_SAMPLES, STICK_HEIGHT).is_ok());
    }

    #[test]
    fn test_measure_defaults_use_the_stick() {
        let scan = Scan::generate(7, 5);
        let stick = scan.stick_length().unwrap();
        assert!((stick - 0.9975).abs() < 1e-9);

        assert!(run_measure(&scan, None, STICK_REAL_LENGTH, 3.0, 3.765, 42.0).is_ok());
    }
}
