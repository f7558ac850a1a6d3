//! Filtering algorithms

use plantcrate_core::{Error, PointCloud, Point3d, Result, Rgb, Vector3d};
use std::collections::BTreeMap;
use tracing::debug;

type VoxelKey = (i64, i64, i64);

#[derive(Default)]
struct VoxelAccumulator {
    count: usize,
    position: Vector3d,
    color: Option<Vector3d>,
    normal: Option<Vector3d>,
    first_normal: Option<Vector3d>,
}

/// Voxel grid down-sampling
///
/// Groups points into cubic voxels of edge `voxel_size` anchored at the cloud's
/// minimum corner and replaces every occupied voxel by the average of its
/// points. Colors are averaged; normals are averaged and renormalised. A voxel
/// whose normals sum to zero keeps the normal of its first input point.
///
/// Output points are ordered by voxel key, so the result does not depend on
/// hash iteration order.
///
/// # Arguments
/// * `cloud` - Input point cloud
/// * `voxel_size` - Size of each voxel cube
///
/// # Returns
/// * `Result<PointCloud>` - Down-sampled point cloud
///
/// # Example
/// ```rust
/// use plantcrate_core::{PointCloud, Point3d};
/// use plantcrate_algorithms::voxel_down_sample;
///
/// fn main() -> plantcrate_core::Result<()> {
///     let cloud = PointCloud::from_points(vec![
///         Point3d::new(0.0, 0.0, 0.0),
///         Point3d::new(0.1, 0.0, 0.0),
///         Point3d::new(0.0, 0.1, 0.0),
///         Point3d::new(1.0, 1.0, 1.0),
///     ]);
///
///     let down = voxel_down_sample(&cloud, 0.5)?;
///     assert_eq!(down.len(), 2);
///     Ok(())
/// }
/// ```
pub fn voxel_down_sample(cloud: &PointCloud, voxel_size: f64) -> Result<PointCloud> {
    if !voxel_size.is_finite() || voxel_size <= 0.0 {
        return Err(Error::InvalidParameter(format!(
            "voxel_size must be finite and positive, got {}",
            voxel_size
        )));
    }
    let bounds = cloud
        .bounding_box()
        .ok_or_else(|| Error::empty("voxel down-sampling needs at least one point"))?;

    let key_of = |point: &Point3d| -> VoxelKey {
        let offset = (point - bounds.min) / voxel_size;
        (
            offset.x.floor() as i64,
            offset.y.floor() as i64,
            offset.z.floor() as i64,
        )
    };

    let colors = cloud.colors();
    let normals = cloud.normals();
    let mut voxels: BTreeMap<VoxelKey, VoxelAccumulator> = BTreeMap::new();

    for (idx, point) in cloud.iter().enumerate() {
        let acc = voxels.entry(key_of(point)).or_default();
        acc.count += 1;
        acc.position += point.coords;
        if let Some(colors) = colors {
            let c = colors[idx];
            *acc.color.get_or_insert_with(Vector3d::zeros) += Vector3d::new(c.r, c.g, c.b);
        }
        if let Some(normals) = normals {
            *acc.normal.get_or_insert_with(Vector3d::zeros) += normals[idx];
            acc.first_normal.get_or_insert(normals[idx]);
        }
    }

    let mut points = Vec::with_capacity(voxels.len());
    let mut out_colors = Vec::with_capacity(if colors.is_some() { voxels.len() } else { 0 });
    let mut out_normals = Vec::with_capacity(if normals.is_some() { voxels.len() } else { 0 });

    for acc in voxels.values() {
        let n = acc.count as f64;
        points.push(Point3d::from(acc.position / n));
        if let Some(c) = acc.color {
            let mean = c / n;
            out_colors.push(Rgb::new(mean.x, mean.y, mean.z));
        }
        if let (Some(sum), Some(first)) = (acc.normal, acc.first_normal) {
            out_normals.push(sum.try_normalize(f64::EPSILON).unwrap_or(first));
        }
    }

    debug!(
        input = cloud.len(),
        output = points.len(),
        voxel_size,
        "voxel down-sampling"
    );

    let mut result = PointCloud::from_points(points);
    if colors.is_some() {
        result = result.with_colors(out_colors)?;
    }
    if normals.is_some() {
        result = result.with_normals(out_normals)?;
    }
    Ok(result)
}
