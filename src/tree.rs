use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::metric::{Euclidean, Metric};
use crate::node::{radius, Node, NodeId, PointId};
use crate::store::PointStore;

/// A built SG tree: a node arena over a shared, read-only [`PointStore`].
///
/// Construction lives in [`builder`](crate::builder), queries in
/// [`search`](crate::search) and persistence in [`persist`](crate::persist).
#[derive(Debug, Clone)]
pub struct SgTree<M: Metric = Euclidean> {
    pub(crate) store: Arc<PointStore>,
    pub(crate) metric: M,
    pub(crate) base: f64,
    pub(crate) nodes: Vec<Node>,
    pub(crate) root: NodeId,
}

impl<M: Metric> SgTree<M> {
    /// Number of indexed points.
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Always false: a tree cannot be built or loaded over zero points.
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Vector dimension.
    pub fn dim(&self) -> usize {
        self.store.dim()
    }

    /// Scale base the tree was built with.
    pub fn base(&self) -> f64 {
        self.base
    }

    /// The metric distances are computed with.
    pub fn metric(&self) -> &M {
        &self.metric
    }

    /// The shared point store.
    pub fn store(&self) -> &Arc<PointStore> {
        &self.store
    }

    /// Identifier of the root node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Number of nodes in the arena.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Borrow a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id as usize)
    }

    /// All nodes, indexed by [`NodeId`].
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Nominal covering radius of a level under this tree's base.
    pub fn level_radius(&self, level: i32) -> f64 {
        radius(self.base, level)
    }

    /// Up to `count` well spread points, taken from the top of the hierarchy down.
    ///
    /// The root center comes first, then the centers each node introduces, visiting
    /// nodes by descending child level (ties by node id). Points introduced under
    /// one parent are further apart than their level's radius, so any prefix is a
    /// coarse net of the data. Coincident points are skipped.
    pub fn spread_points(&self, count: usize) -> Vec<PointId> {
        let mut points = Vec::with_capacity(count.min(self.len()));
        if count == 0 {
            return points;
        }
        points.push(self.nodes[self.root as usize].center);

        let mut frontier: BinaryHeap<(i32, Reverse<NodeId>)> = BinaryHeap::new();
        let push = |frontier: &mut BinaryHeap<(i32, Reverse<NodeId>)>, id: NodeId| {
            if let Some(&first) = self.nodes[id as usize].children.first() {
                frontier.push((self.nodes[first as usize].level, Reverse(id)));
            }
        };
        push(&mut frontier, self.root);

        while let Some((_, Reverse(id))) = frontier.pop() {
            let node = &self.nodes[id as usize];
            for &child_id in &node.children {
                let child = &self.nodes[child_id as usize];
                if child.center != node.center {
                    if points.len() == count {
                        return points;
                    }
                    points.push(child.center);
                }
                push(&mut frontier, child_id);
            }
        }
        points
    }

    #[inline]
    pub(crate) fn distance_to(&self, query: &[f32], node: &Node) -> f32 {
        self.metric.distance(query, self.store.vector(node.center))
    }
}
