use serde::{Deserialize, Serialize};

/// Row index of a point in the [`PointStore`](crate::PointStore).
pub type PointId = u32;

/// Index of a node in the tree arena.
pub type NodeId = u32;

/// One ball of the hierarchy.
///
/// A node covers every point of its subtree within `base^level` of `center`.
/// Its children share one lower level and are pairwise further apart than that
/// level's radius. When a node has children, the first one is its own center
/// restated one scale down (the *self child*).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Point this ball is centred on.
    pub center: PointId,
    /// Scale exponent; the nominal covering radius is `base^level`.
    pub level: i32,
    /// Child nodes, self child first.
    pub children: Vec<NodeId>,
    /// Exact maximum distance from `center` to any point of the subtree.
    pub max_child_distance: f32,
    /// Other points at distance zero from `center`, stored where `center` is introduced.
    pub coincident: Vec<PointId>,
}

impl Node {
    /// Check whether the node has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Nominal covering radius of `level` under `base`.
#[inline]
pub(crate) fn radius(base: f64, level: i32) -> f64 {
    base.powi(level)
}

/// Largest level magnitude the arithmetic below will produce.
///
/// Level `n` sits `n` multiplications of `base` away from 1; beyond this the
/// base is too close to 1 for the distances involved.
pub(crate) const LEVEL_LIMIT: i32 = 1 << 24;

/// `ceil(log_base(target))`, or `None` when it is outside `±LEVEL_LIMIT`.
fn approximate_level(base: f64, target: f64) -> Option<i32> {
    let exact = (target.ln() / base.ln()).ceil();
    (exact.is_finite() && exact.abs() <= f64::from(LEVEL_LIMIT)).then_some(exact as i32)
}

/// Smallest level whose radius covers `distance`.
///
/// Returns `None` for a non-finite distance or one out of reach of `base`.
pub(crate) fn covering_level(base: f64, distance: f32) -> Option<i32> {
    let target = f64::from(distance);
    if !target.is_finite() {
        return None;
    }
    if target <= 0.0 {
        return Some(0);
    }
    let mut level = approximate_level(base, target)?;
    while radius(base, level) < target {
        level += 1;
    }
    while radius(base, level - 1) >= target {
        level -= 1;
    }
    Some(level)
}

/// Largest level not above `ceiling` whose radius is strictly below `distance`.
///
/// Children are placed at this level so at least one point escapes the parent's
/// own ball and the net below the parent has more than one center. Returns
/// `None` unless `distance` is finite and positive and within reach of `base`.
pub(crate) fn split_level(base: f64, distance: f32, ceiling: i32) -> Option<i32> {
    let target = f64::from(distance);
    if !(target.is_finite() && target > 0.0) {
        return None;
    }
    let mut level = approximate_level(base, target)?
        .saturating_sub(1)
        .min(ceiling);
    while radius(base, level) >= target {
        level -= 1;
    }
    while level < ceiling && radius(base, level + 1) < target {
        level += 1;
    }
    Some(level)
}
