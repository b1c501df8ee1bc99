//! Exact k-nearest-neighbour, range and furthest-neighbour queries.
//!
//! Nearest-neighbour search is best-first branch-and-bound. The frontier is a
//! min-heap of nodes keyed by the distance from the query to their center; a
//! node is discarded when `d(q, center) - max_child_distance` exceeds the
//! current k-th best distance. The comparison is strict, so candidates tied with
//! the bound are still explored.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::QueryParams;
use crate::metric::Metric;
use crate::node::{Node, NodeId, PointId};
use crate::store::PointStore;
use crate::trace::{write_traces, TraceAction, TraceEvent, TraceSink};
use crate::tree::SgTree;
use crate::{Result, SgTreeError};

/// Relative slack applied to prune bounds so that rounding in computed
/// distances can never discard a true neighbour.
const PRUNE_SLACK: f64 = 1e-6;

/// Result entry of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbour {
    pub id: PointId,
    pub distance: f32,
}

/// Neighbours of one query row, ascending by distance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Neighbours {
    pub ids: Vec<PointId>,
    pub distances: Vec<f32>,
}

impl From<Vec<Neighbour>> for Neighbours {
    fn from(hits: Vec<Neighbour>) -> Self {
        let (ids, distances) = hits.into_iter().map(|n| (n.id, n.distance)).unzip();
        Self { ids, distances }
    }
}

/// Cooperative cancellation shared between a caller and running queries.
///
/// Queries poll the flag before every node expansion and return
/// [`SgTreeError::Cancelled`] once it is raised.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
struct HeapCandidate {
    id: PointId,
    distance: f32,
}

impl PartialEq for HeapCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapCandidate {}

impl PartialOrd for HeapCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.id.cmp(&other.id))
    }
}

/// The k best candidates seen so far; the worst one sits on top.
struct KBest {
    k: usize,
    heap: BinaryHeap<HeapCandidate>,
}

impl KBest {
    fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    fn offer(&mut self, id: PointId, distance: f32) {
        let candidate = HeapCandidate { id, distance };
        if self.heap.len() < self.k {
            self.heap.push(candidate);
        } else if let Some(mut worst) = self.heap.peek_mut() {
            if candidate < *worst {
                *worst = candidate;
            }
        }
    }

    fn bound(&self) -> f32 {
        if self.heap.len() < self.k {
            f32::INFINITY
        } else {
            self.heap.peek().map_or(f32::INFINITY, |c| c.distance)
        }
    }

    fn into_sorted(self) -> Vec<Neighbour> {
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|c| Neighbour {
                id: c.id,
                distance: c.distance,
            })
            .collect()
    }
}

/// Frontier entry ordered by center distance, then node id.
#[derive(Debug, Clone, Copy)]
struct FrontierEntry {
    distance: f32,
    node: NodeId,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.distance
            .total_cmp(&other.distance)
            .then(self.node.cmp(&other.node))
    }
}

/// Furthest-neighbour frontier entry, ordered by the largest distance its subtree can reach.
#[derive(Debug, Clone, Copy)]
struct FarEntry {
    reach: f32,
    distance: f32,
    node: NodeId,
}

impl FarEntry {
    fn new(node: &Node, id: NodeId, distance: f32) -> Self {
        Self {
            reach: distance + node.max_child_distance,
            distance,
            node: id,
        }
    }
}

impl PartialEq for FarEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FarEntry {}

impl PartialOrd for FarEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FarEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reach
            .total_cmp(&other.reach)
            .then(other.node.cmp(&self.node))
    }
}

/// True when every point within `reach` of a center at `distance` lies beyond `bound`.
#[inline]
fn beyond(distance: f32, reach: f32, bound: f32) -> bool {
    let lower = f64::from(distance) - f64::from(reach);
    let bound = f64::from(bound);
    lower > bound + bound.abs() * PRUNE_SLACK
}

impl<M: Metric> SgTree<M> {
    /// Exact `k` nearest neighbours of `query`, ascending by distance (ties by id).
    pub fn nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbour>> {
        self.nearest_with(query, k, None, None)
    }

    /// Like [`nearest`](Self::nearest), recording every visited node into `trace`.
    pub fn nearest_traced(
        &self,
        query: &[f32],
        k: usize,
        trace: &mut dyn TraceSink,
    ) -> Result<Vec<Neighbour>> {
        self.nearest_with(query, k, Some(trace), None)
    }

    /// Full-control single query: optional trace sink and cancellation flag.
    pub fn nearest_with(
        &self,
        query: &[f32],
        k: usize,
        trace: Option<&mut dyn TraceSink>,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<Neighbour>> {
        self.check_dim(query.len())?;
        self.check_k(k)?;
        self.search_knn(query, k, trace, cancel)
    }

    /// Exact k-NN for every row of `queries`, evaluated on `params.parallelism` workers.
    pub fn nearest_batch(
        &self,
        queries: &PointStore,
        params: &QueryParams,
    ) -> Result<Vec<Neighbours>> {
        self.nearest_batch_cancellable(queries, params, None)
    }

    /// Batch k-NN that stops early once `cancel` is raised.
    pub fn nearest_batch_cancellable(
        &self,
        queries: &PointStore,
        params: &QueryParams,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<Neighbours>> {
        self.run_batch(queries, params, |query| {
            self.search_knn(query, params.k, None, cancel)
                .map(Neighbours::from)
        })
    }

    /// Batch k-NN that also returns the per-query search path.
    pub fn nearest_batch_traced(
        &self,
        queries: &PointStore,
        params: &QueryParams,
    ) -> Result<(Vec<Neighbours>, Vec<Vec<TraceEvent>>)> {
        let traced = self.run_batch(queries, params, |query| {
            let mut events = Vec::new();
            let sink: &mut dyn TraceSink = &mut events;
            let hits = self.search_knn(query, params.k, Some(sink), None)?;
            Ok((Neighbours::from(hits), events))
        })?;
        Ok(traced.into_iter().unzip())
    }

    /// Batch k-NN that writes the search paths to `path` as JSON lines.
    pub fn nearest_batch_to_trace_file<P: AsRef<Path>>(
        &self,
        queries: &PointStore,
        params: &QueryParams,
        path: P,
    ) -> Result<Vec<Neighbours>> {
        let (results, traces) = self.nearest_batch_traced(queries, params)?;
        let writer = BufWriter::new(File::create(path)?);
        write_traces(writer, &traces)?;
        tracing::debug!(queries = results.len(), "wrote query traces");
        Ok(results)
    }

    /// Every point within `radius` of `query`, ascending by distance.
    pub fn range(&self, query: &[f32], radius: f32) -> Result<Vec<Neighbour>> {
        self.check_dim(query.len())?;
        if !(radius >= 0.0) {
            return Err(SgTreeError::InvalidConfig("radius must be non-negative"));
        }

        let root = self.root_node();
        let mut hits = Vec::new();
        let mut stack: Vec<(NodeId, f32)> = Vec::new();
        let root_distance = self.distance_to(query, root);
        self.introduce(root, root_distance, |id, d| {
            if d <= radius {
                hits.push(Neighbour { id, distance: d });
            }
        });
        stack.push((self.root, root_distance));

        while let Some((node_id, distance)) = stack.pop() {
            let node = &self.nodes[node_id as usize];
            if beyond(distance, node.max_child_distance, radius) {
                continue;
            }
            for &child_id in &node.children {
                let child = &self.nodes[child_id as usize];
                let child_distance = if child.center == node.center {
                    distance
                } else {
                    let d = self.distance_to(query, child);
                    self.introduce(child, d, |id, d| {
                        if d <= radius {
                            hits.push(Neighbour { id, distance: d });
                        }
                    });
                    d
                };
                stack.push((child_id, child_distance));
            }
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        Ok(hits)
    }

    /// The point furthest from `query`; ties go to the lower id.
    pub fn furthest(&self, query: &[f32]) -> Result<Neighbour> {
        self.check_dim(query.len())?;

        let root = self.root_node();
        let root_distance = self.distance_to(query, root);
        let mut best = Neighbour {
            id: root.center,
            distance: root_distance,
        };
        let consider = |best: &mut Neighbour, id: PointId, d: f32| {
            if d > best.distance || (d == best.distance && id < best.id) {
                *best = Neighbour { id, distance: d };
            }
        };
        self.introduce(root, root_distance, |id, d| consider(&mut best, id, d));

        let mut frontier: BinaryHeap<FarEntry> = BinaryHeap::new();
        frontier.push(FarEntry::new(root, self.root, root_distance));

        while let Some(entry) = frontier.pop() {
            // Max-heap on the reach bound: nothing left can beat `best`.
            if f64::from(entry.reach) * (1.0 + PRUNE_SLACK) < f64::from(best.distance) {
                break;
            }
            let node = &self.nodes[entry.node as usize];
            for &child_id in &node.children {
                let child = &self.nodes[child_id as usize];
                let child_distance = if child.center == node.center {
                    entry.distance
                } else {
                    let d = self.distance_to(query, child);
                    self.introduce(child, d, |id, d| consider(&mut best, id, d));
                    d
                };
                if !child.is_leaf() {
                    frontier.push(FarEntry::new(child, child_id, child_distance));
                }
            }
        }
        Ok(best)
    }

    /// Reference answer by exhaustive scan, ascending by distance (ties by id).
    pub fn brute_force_nearest(&self, query: &[f32], k: usize) -> Result<Vec<Neighbour>> {
        self.check_dim(query.len())?;
        self.check_k(k)?;
        let mut all: Vec<Neighbour> = self
            .store
            .iter()
            .map(|(id, v)| Neighbour {
                id,
                distance: self.metric.distance(query, v),
            })
            .collect();
        all.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
        all.truncate(k);
        Ok(all)
    }

    fn search_knn(
        &self,
        query: &[f32],
        k: usize,
        mut trace: Option<&mut dyn TraceSink>,
        cancel: Option<&CancelFlag>,
    ) -> Result<Vec<Neighbour>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut best = KBest::new(k);
        let mut frontier: BinaryHeap<Reverse<FrontierEntry>> = BinaryHeap::new();

        let root = self.root_node();
        let root_distance = self.distance_to(query, root);
        self.introduce(root, root_distance, |id, d| best.offer(id, d));
        frontier.push(Reverse(FrontierEntry {
            distance: root_distance,
            node: self.root,
        }));

        while let Some(Reverse(entry)) = frontier.pop() {
            if cancel.is_some_and(CancelFlag::is_cancelled) {
                return Err(SgTreeError::Cancelled);
            }
            let node = &self.nodes[entry.node as usize];
            let pruned = beyond(entry.distance, node.max_child_distance, best.bound());
            if let Some(sink) = trace.as_deref_mut() {
                sink.record(TraceEvent {
                    node: entry.node,
                    center: node.center,
                    level: node.level,
                    distance: entry.distance,
                    action: if pruned {
                        TraceAction::Pruned
                    } else {
                        TraceAction::Expanded
                    },
                });
            }
            if pruned {
                continue;
            }

            for &child_id in &node.children {
                let child = &self.nodes[child_id as usize];
                let child_distance = if child.center == node.center {
                    entry.distance
                } else {
                    let d = self.distance_to(query, child);
                    self.introduce(child, d, |id, d| best.offer(id, d));
                    d
                };
                frontier.push(Reverse(FrontierEntry {
                    distance: child_distance,
                    node: child_id,
                }));
            }
        }

        Ok(best.into_sorted())
    }

    fn run_batch<T, F>(&self, queries: &PointStore, params: &QueryParams, op: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&[f32]) -> Result<T> + Sync,
    {
        if params.parallelism == 0 {
            return Err(SgTreeError::InvalidConfig("parallelism must be positive"));
        }
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        self.check_dim(queries.dim())?;
        self.check_k(params.k)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.parallelism)
            .thread_name(|idx| format!("sgtree-query-{idx}"))
            .build()?;
        tracing::debug!(
            queries = queries.len(),
            k = params.k,
            parallelism = params.parallelism,
            "running batch query"
        );
        pool.install(|| {
            (0..queries.len() as PointId)
                .into_par_iter()
                .map(|row| op(queries.vector(row)))
                .collect()
        })
    }

    /// Report a node's own point and its coincident points, all at `distance`.
    #[inline]
    fn introduce(&self, node: &Node, distance: f32, mut offer: impl FnMut(PointId, f32)) {
        offer(node.center, distance);
        for &id in &node.coincident {
            offer(id, distance);
        }
    }

    fn root_node(&self) -> &Node {
        &self.nodes[self.root as usize]
    }

    fn check_dim(&self, got: usize) -> Result<()> {
        if got != self.dim() {
            return Err(SgTreeError::DimensionMismatch {
                expected: self.dim(),
                got,
            });
        }
        Ok(())
    }

    fn check_k(&self, k: usize) -> Result<()> {
        if k > self.len() {
            return Err(SgTreeError::InsufficientPoints {
                requested: k,
                available: self.len(),
            });
        }
        Ok(())
    }
}
