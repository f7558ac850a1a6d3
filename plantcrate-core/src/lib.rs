//! Core data structures and traits for plantcrate
//!
//! This crate provides the fundamental types shared by the plant scan pipelines:
//! points, point clouds with optional per-point attributes, rigid transforms,
//! length units and the error taxonomy.

pub mod point;
pub mod point_cloud;
pub mod traits;
pub mod transform;
pub mod units;
pub mod error;

pub use point::*;
pub use point_cloud::*;
pub use traits::*;
pub use transform::*;
pub use units::*;
pub use error::*;

/// Re-export commonly used types from nalgebra
pub use nalgebra::{Point3, Vector3, Matrix3, Matrix4, Isometry3, UnitQuaternion};
