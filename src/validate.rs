//! Geometric self-check of a tree.
//!
//! [`SgTree::check_invariants`] walks the whole arena and recomputes every
//! distance it needs, so it costs roughly `points × depth` metric evaluations.

use crate::metric::Metric;
use crate::node::{radius, NodeId, PointId};
use crate::tree::SgTree;

/// Relative tolerance when comparing recorded and recomputed subtree radii.
const RADIUS_TOLERANCE: f32 = 1e-5;

/// First broken invariant found by [`SgTree::check_invariants`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("point {point} lies {distance} from center of node {node}, beyond radius {radius}")]
    Covering {
        node: NodeId,
        point: PointId,
        distance: f32,
        radius: f64,
    },
    #[error("children {a} and {b} of node {parent} are only {distance} apart at radius {radius}")]
    Separation {
        parent: NodeId,
        a: NodeId,
        b: NodeId,
        distance: f32,
        radius: f64,
    },
    #[error("node {node} breaks nesting: {reason}")]
    Nesting { node: NodeId, reason: &'static str },
    #[error("node {node} records max child distance {recorded}, actual {actual}")]
    MaxChildDistance {
        node: NodeId,
        recorded: f32,
        actual: f32,
    },
    #[error("point {point} is introduced {count} times")]
    Introduction { point: PointId, count: usize },
}

impl<M: Metric> SgTree<M> {
    /// Verify covering, separation, nesting, subtree radii and that every point
    /// enters the tree exactly once.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut introduced = vec![0usize; self.len()];
        self.introduce_counts(self.root, None, &mut introduced);
        if let Some((point, &count)) = introduced.iter().enumerate().find(|(_, &c)| c != 1) {
            return Err(InvariantViolation::Introduction {
                point: point as PointId,
                count,
            });
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            let id = idx as NodeId;
            let center = self.store.vector(node.center);

            if let Some(&first) = node.children.first() {
                if self.nodes[first as usize].center != node.center {
                    return Err(InvariantViolation::Nesting {
                        node: id,
                        reason: "first child is not the self child",
                    });
                }
                let child_level = self.nodes[first as usize].level;
                if child_level >= node.level {
                    return Err(InvariantViolation::Nesting {
                        node: id,
                        reason: "child level is not below parent level",
                    });
                }
                if node.children.iter().any(|&c| self.nodes[c as usize].level != child_level) {
                    return Err(InvariantViolation::Nesting {
                        node: id,
                        reason: "children sit on different levels",
                    });
                }

                let child_radius = radius(self.base, child_level);
                for (i, &a) in node.children.iter().enumerate() {
                    let va = self.store.vector(self.nodes[a as usize].center);
                    for &b in &node.children[i + 1..] {
                        let vb = self.store.vector(self.nodes[b as usize].center);
                        let distance = self.metric.distance(va, vb);
                        if f64::from(distance) <= child_radius {
                            return Err(InvariantViolation::Separation {
                                parent: id,
                                a,
                                b,
                                distance,
                                radius: child_radius,
                            });
                        }
                    }
                }
            }

            let node_radius = radius(self.base, node.level);
            let mut actual = 0.0f32;
            for point in self.subtree_points(id) {
                let distance = self.metric.distance(center, self.store.vector(point));
                if f64::from(distance) > node_radius {
                    return Err(InvariantViolation::Covering {
                        node: id,
                        point,
                        distance,
                        radius: node_radius,
                    });
                }
                actual = actual.max(distance);
            }
            let tolerance = RADIUS_TOLERANCE * actual.max(1.0);
            if (actual - node.max_child_distance).abs() > tolerance {
                return Err(InvariantViolation::MaxChildDistance {
                    node: id,
                    recorded: node.max_child_distance,
                    actual,
                });
            }
        }
        Ok(())
    }

    /// Every point stored in the subtree of `id`, each once.
    pub fn subtree_points(&self, id: NodeId) -> Vec<PointId> {
        let mut points = Vec::new();
        let mut stack: Vec<(NodeId, Option<PointId>)> = vec![(id, None)];
        while let Some((node_id, parent_center)) = stack.pop() {
            let node = &self.nodes[node_id as usize];
            if parent_center != Some(node.center) {
                points.push(node.center);
            }
            points.extend_from_slice(&node.coincident);
            for &child in &node.children {
                stack.push((child, Some(node.center)));
            }
        }
        points
    }

    fn introduce_counts(&self, root: NodeId, parent: Option<PointId>, counts: &mut [usize]) {
        let mut stack = vec![(root, parent)];
        while let Some((node_id, parent_center)) = stack.pop() {
            let node = &self.nodes[node_id as usize];
            if parent_center != Some(node.center) {
                counts[node.center as usize] += 1;
            }
            for &point in &node.coincident {
                counts[point as usize] += 1;
            }
            for &child in &node.children {
                stack.push((child, Some(node.center)));
            }
        }
    }
}
