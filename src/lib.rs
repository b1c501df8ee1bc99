//! SG tree: a cover-tree family index for exact nearest-neighbour search.
//!
//! The tree is built once, in parallel, from an immutable [`PointStore`] and is
//! read-only afterwards. Every node is a ball of radius `base^level` around one of
//! the stored points; queries descend best-first and prune subtrees with the
//! triangle inequality, so results are exact for any [`Metric`] that satisfies it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use sgtree_rs::{BuildParams, Euclidean, PointStore, SgTree};
//!
//! let store = Arc::new(PointStore::from_rows(&[vec![0.0, 0.0], vec![1.0, 1.0]])?);
//! let tree = SgTree::build(store, Euclidean, &BuildParams::default().with_base(1.3))?;
//! let hits = tree.nearest(&[0.9, 0.9], 1)?;
//! assert_eq!(hits[0].id, 1);
//! # Ok::<(), sgtree_rs::SgTreeError>(())
//! ```

pub mod builder;
pub mod config;
pub mod metric;
pub mod node;
pub mod persist;
pub mod search;
pub mod stats;
pub mod store;
pub mod trace;
pub mod tree;
pub mod validate;

mod math;

#[cfg(feature = "python")]
mod python_bindings;

pub use config::{BuildParams, QueryParams};
pub use metric::{Euclidean, Manhattan, Metric};
pub use node::{Node, NodeId, PointId};
pub use persist::{NodeRecord, TreeDocument};
pub use search::{CancelFlag, Neighbour, Neighbours};
pub use stats::{LevelDistances, TreeStats};
pub use store::PointStore;
pub use trace::{write_traces, TraceAction, TraceEvent, TraceSink};
pub use tree::SgTree;
pub use validate::InvariantViolation;

#[cfg(test)]
mod tests;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SgTreeError>;

/// Errors that can occur when building, querying or persisting an SG tree.
#[derive(thiserror::Error, Debug)]
pub enum SgTreeError {
    /// Returned when a point matrix is ragged, empty-dimensional or non-finite.
    #[error("invalid point matrix shape: {0}")]
    InvalidShape(String),
    /// Returned when the scale base cannot separate levels.
    #[error("invalid scale base {0}: base must be finite and greater than 1")]
    InvalidScale(f64),
    /// Returned when two stored points are too far apart for an `f32` distance.
    #[error("distance from point {from} to point {to} is not finite")]
    NonFiniteDistance { from: PointId, to: PointId },
    /// Returned when the base is too close to 1 for the range of distances.
    #[error("scale base {base} cannot reach distance {distance} within the level range")]
    LevelOutOfRange { base: f64, distance: f32 },
    /// Returned when a build is attempted over zero points.
    #[error("cannot build a tree over an empty dataset")]
    EmptyDataset,
    /// Returned when more neighbours are requested than the tree holds.
    #[error("requested {requested} neighbours but the tree holds only {available} points")]
    InsufficientPoints { requested: usize, available: usize },
    /// Returned when a persisted tree is inconsistent with itself or with the point store.
    #[error("malformed tree: {0}")]
    MalformedTree(String),
    /// Returned when the dimension of a query does not match the point store.
    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    /// Returned when an invalid configuration is supplied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// Returned when a query observed its cancellation flag.
    #[error("query cancelled")]
    Cancelled,
    /// Returned when persistence encounters an I/O failure.
    #[error("i/o error while reading or writing a tree: {0}")]
    Io(#[from] std::io::Error),
    /// Returned when the structured document cannot be encoded or decoded.
    #[error("tree document encoding error: {0}")]
    Json(#[from] serde_json::Error),
    /// Returned when the persisted bytes are inconsistent or corrupt.
    #[error("invalid persisted tree: {0}")]
    InvalidPersistence(&'static str),
    /// Returned when the worker pool cannot be started.
    #[error("failed to start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
