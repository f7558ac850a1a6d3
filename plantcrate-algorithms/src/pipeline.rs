//! Pairwise registration pipeline
//!
//! Runs the two registration stages in order: feature-based coarse alignment
//! on down-sampled copies, then ICP refinement on the full-resolution clouds.

use crate::features::{compute_fpfh_features, FeatureParams, FpfhFeature};
use crate::filtering::voxel_down_sample;
use crate::global_registration::{
    ransac_global_registration, GlobalRegistrationParams, GlobalRegistrationResult,
};
use crate::normals::{estimate_normals, NormalParams};
use crate::registration::{icp, IcpParams, IcpResult};
use plantcrate_core::{Error, Point3d, PointCloud, Result, RigidTransform};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use tracing::{debug, info};

/// How far a pairwise registration has progressed.
///
/// Stages only advance in order, `Initial → CoarseAligned → Refined`;
/// `Refined` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStage {
    Initial,
    CoarseAligned,
    Refined,
}

/// Configuration of the full registration pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Voxel size for the coarse stage copies, `None` to use the clouds as-is
    pub voxel_size: Option<f64>,
    pub normals: NormalParams,
    pub features: FeatureParams,
    pub global: GlobalRegistrationParams,
    pub icp: IcpParams,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            voxel_size: Some(0.02),
            normals: NormalParams::default(),
            features: FeatureParams::default(),
            global: GlobalRegistrationParams::default(),
            icp: IcpParams::default(),
        }
    }
}

impl RegistrationConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(voxel_size) = self.voxel_size {
            if !voxel_size.is_finite() || voxel_size <= 0.0 {
                return Err(Error::InvalidParameter(format!(
                    "registration voxel size must be finite and positive, got {}",
                    voxel_size
                )));
            }
        }
        self.normals.validate()?;
        self.features.validate()?;
        self.global.validate()?;
        self.icp.validate()
    }
}

/// Outcome of a pairwise registration
#[derive(Debug, Clone)]
pub struct RegistrationReport {
    /// Last stage completed
    pub stage: RegistrationStage,
    /// Transform mapping the source onto the target
    pub transform: RigidTransform,
    pub coarse: Option<GlobalRegistrationResult>,
    pub refined: Option<IcpResult>,
}

/// Points and FPFH descriptors of the (optionally down-sampled) cloud
fn describe(cloud: &PointCloud, config: &RegistrationConfig) -> Result<(Vec<Point3d>, Vec<Option<FpfhFeature>>)> {
    let reduced = match config.voxel_size {
        Some(voxel_size) => Cow::Owned(voxel_down_sample(cloud, voxel_size)?),
        None => Cow::Borrowed(cloud),
    };
    let normals = estimate_normals(&reduced, &config.normals)?;
    let features = compute_fpfh_features(reduced.points(), &normals, &config.features)?;
    Ok((reduced.points().to_vec(), features))
}

/// Registration of one source cloud onto one target cloud.
///
/// [`coarse_align`](Self::coarse_align) must run before
/// [`refine`](Self::refine); calling either out of order is an
/// `InvalidParameter` error and leaves the registration untouched.
pub struct PairwiseRegistration<'a> {
    source: &'a PointCloud,
    target: &'a PointCloud,
    config: &'a RegistrationConfig,
    stage: RegistrationStage,
    transform: RigidTransform,
    coarse: Option<GlobalRegistrationResult>,
    refined: Option<IcpResult>,
}

impl<'a> PairwiseRegistration<'a> {
    pub fn new(source: &'a PointCloud, target: &'a PointCloud, config: &'a RegistrationConfig) -> Result<Self> {
        config.validate()?;
        source.ensure_not_empty("registration source cloud")?;
        target.ensure_not_empty("registration target cloud")?;

        Ok(Self {
            source,
            target,
            config,
            stage: RegistrationStage::Initial,
            transform: RigidTransform::identity(),
            coarse: None,
            refined: None,
        })
    }

    pub fn stage(&self) -> RegistrationStage {
        self.stage
    }

    /// Current best transform
    pub fn transform(&self) -> RigidTransform {
        self.transform
    }

    fn require_stage(&self, expected: RegistrationStage, step: &str) -> Result<()> {
        if self.stage != expected {
            return Err(Error::InvalidParameter(format!(
                "{} needs stage {:?}, registration is at {:?}",
                step, expected, self.stage
            )));
        }
        Ok(())
    }

    /// Feature-based RANSAC alignment
    pub fn coarse_align(&mut self) -> Result<&GlobalRegistrationResult> {
        self.require_stage(RegistrationStage::Initial, "coarse alignment")?;
        let (source_points, source_features) = describe(self.source, self.config)?;
        let (target_points, target_features) = describe(self.target, self.config)?;
        debug!(
            source = source_points.len(),
            target = target_points.len(),
            "coarse stage inputs"
        );

        let result = ransac_global_registration(
            &source_points,
            &target_points,
            &source_features,
            &target_features,
            &self.config.global,
        )?;

        self.transform = result.transform;
        self.stage = RegistrationStage::CoarseAligned;
        Ok(&*self.coarse.insert(result))
    }

    /// ICP on the full-resolution clouds, starting from the coarse transform
    pub fn refine(&mut self) -> Result<&IcpResult> {
        self.require_stage(RegistrationStage::CoarseAligned, "refinement")?;
        let result = icp(self.source, self.target, &self.transform, &self.config.icp)?;
        self.transform = result.transform;
        self.stage = RegistrationStage::Refined;
        Ok(&*self.refined.insert(result))
    }

    pub fn into_report(self) -> RegistrationReport {
        RegistrationReport {
            stage: self.stage,
            transform: self.transform,
            coarse: self.coarse,
            refined: self.refined,
        }
    }
}

/// Coarse alignment followed by refinement
///
/// # Arguments
/// * `source` - Cloud to be moved
/// * `target` - Reference cloud
/// * `config` - Parameters of every stage
///
/// # Returns
/// * `Result<RegistrationReport>` - Both stage results and the final transform
pub fn register_pair(source: &PointCloud, target: &PointCloud, config: &RegistrationConfig) -> Result<RegistrationReport> {
    let mut registration = PairwiseRegistration::new(source, target, config)?;
    registration.coarse_align()?;
    registration.refine()?;

    let report = registration.into_report();
    info!(
        stage = ?report.stage,
        rotation = report.transform.rotation_angle(),
        "pairwise registration finished"
    );
    Ok(report)
}

/// Register `source` onto `target` and return the two merged in the target frame
pub fn align_and_merge(
    source: &PointCloud,
    target: &PointCloud,
    config: &RegistrationConfig,
) -> Result<(PointCloud, RegistrationReport)> {
    let report = register_pair(source, target, config)?;
    let merged = source.transformed(&report.transform).merge(target);
    Ok((merged, report))
}
