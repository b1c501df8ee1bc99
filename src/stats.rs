use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::metric::Metric;
use crate::tree::SgTree;

/// Shape summary of a built tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeStats {
    pub nodes: usize,
    pub leaves: usize,
    pub points: usize,
    /// Longest root-to-leaf path, counted in nodes.
    pub depth: usize,
    pub min_level: i32,
    pub max_level: i32,
    pub nodes_per_level: BTreeMap<i32, usize>,
    pub max_fanout: usize,
    /// Mean child count over internal nodes.
    pub mean_fanout: f64,
    /// Subtree radii (`max_child_distance`) of the nodes on each level.
    pub distances_per_level: BTreeMap<i32, LevelDistances>,
}

/// Summary of `max_child_distance` over the nodes of one level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelDistances {
    pub mean: f64,
    pub max: f32,
}

impl<M: Metric> SgTree<M> {
    /// Count nodes per level, fan-out and depth, and summarise subtree radii per level.
    pub fn stats(&self) -> TreeStats {
        let mut nodes_per_level = BTreeMap::new();
        let mut leaves = 0usize;
        let mut max_fanout = 0usize;
        let mut child_total = 0usize;
        let mut distance_sums: BTreeMap<i32, (f64, f32)> = BTreeMap::new();

        for node in &self.nodes {
            *nodes_per_level.entry(node.level).or_insert(0usize) += 1;
            let (sum, max) = distance_sums.entry(node.level).or_insert((0.0, 0.0));
            *sum += f64::from(node.max_child_distance);
            *max = max.max(node.max_child_distance);
            if node.is_leaf() {
                leaves += 1;
            }
            max_fanout = max_fanout.max(node.children.len());
            child_total += node.children.len();
        }

        let mut depth = 0usize;
        let mut stack = vec![(self.root, 1usize)];
        while let Some((id, d)) = stack.pop() {
            depth = depth.max(d);
            for &child in &self.nodes[id as usize].children {
                stack.push((child, d + 1));
            }
        }

        let distances_per_level = distance_sums
            .into_iter()
            .map(|(level, (sum, max))| {
                let mean = sum / nodes_per_level[&level] as f64;
                (level, LevelDistances { mean, max })
            })
            .collect();

        let internal = self.nodes.len() - leaves;
        TreeStats {
            nodes: self.nodes.len(),
            leaves,
            points: self.len(),
            depth,
            min_level: nodes_per_level.keys().next().copied().unwrap_or(0),
            max_level: nodes_per_level.keys().next_back().copied().unwrap_or(0),
            nodes_per_level,
            max_fanout,
            mean_fanout: if internal == 0 {
                0.0
            } else {
                child_total as f64 / internal as f64
            },
            distances_per_level,
        }
    }
}
