//! # plantcrate algorithms
//!
//! Point cloud algorithms for 3D scans of potted plants.
//!
//! The crate covers the four pipelines of a plant scan workflow: pairwise
//! registration of overlapping scans (FPFH features, RANSAC, ICP), density
//! clustering and selection of the plant or a reference object, skeleton
//! tip counting as a leaf-count proxy, and leaf measurements converted to
//! physical units.

pub mod calibration;
pub mod clustering;
pub mod features;
pub mod filtering;
pub mod global_registration;
pub mod measurement;
pub mod nearest_neighbor;
pub mod normals;
pub mod pipeline;
pub mod registration;
pub mod selection;
pub mod skeleton;

// Re-export commonly used items
pub use calibration::*;
pub use clustering::*;
pub use features::*;
pub use filtering::*;
pub use global_registration::*;
pub use measurement::*;
pub use nearest_neighbor::*;
pub use normals::*;
pub use pipeline::*;
pub use registration::*;
pub use selection::*;
pub use skeleton::*;
