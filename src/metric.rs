use crate::math::{l1_distance, l2_distance_sqr};

/// Distance function the tree is built and searched under.
///
/// Implementations must return a non-negative, symmetric and deterministic value
/// and must satisfy the triangle inequality `d(a, c) <= d(a, b) + d(b, c)`.
/// Pruning relies on it; a metric that violates it yields undefined (inexact)
/// results. Both slices always have the point store's dimension.
pub trait Metric: Send + Sync {
    /// Distance between two vectors of equal length.
    fn distance(&self, a: &[f32], b: &[f32]) -> f32;

    /// Stable name recorded in persisted trees.
    fn name(&self) -> &'static str;
}

/// True Euclidean (L2) distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Euclidean;

impl Metric for Euclidean {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        l2_distance_sqr(a, b).sqrt()
    }

    fn name(&self) -> &'static str {
        "euclidean"
    }
}

/// Manhattan (L1) distance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Manhattan;

impl Metric for Manhattan {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        l1_distance(a, b)
    }

    fn name(&self) -> &'static str {
        "manhattan"
    }
}

impl<M: Metric + ?Sized> Metric for &M {
    #[inline]
    fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        (**self).distance(a, b)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
