//! Error types for plantcrate

use std::fmt;
use thiserror::Error;

/// Iterative stage that produced a convergence failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Feature-based RANSAC alignment
    GlobalRegistration,
    /// Iterative closest point refinement
    Refinement,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::GlobalRegistration => write!(f, "global registration"),
            Stage::Refinement => write!(f, "refinement"),
        }
    }
}

/// Main error type for plantcrate operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("empty input: {context}")]
    EmptyInput { context: String },

    #[error("point {index} has {found} neighbors, at least {required} are needed")]
    InsufficientNeighbors {
        index: usize,
        found: usize,
        required: usize,
    },

    #[error("{stage} did not converge after {iterations} iterations: {reason}")]
    NoConvergence {
        stage: Stage,
        iterations: usize,
        reason: String,
    },

    #[error("no cluster matched among {candidates} candidates: {reason}")]
    NoMatchingCluster { candidates: usize, reason: String },

    #[error("degenerate geometry: {0}")]
    DegenerateGeometry(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Shorthand for an [`Error::EmptyInput`] naming what was empty
    pub fn empty(context: impl Into<String>) -> Self {
        Error::EmptyInput {
            context: context.into(),
        }
    }
}

/// Result type alias for plantcrate operations
pub type Result<T> = std::result::Result<T, Error>;
