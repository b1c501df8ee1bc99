//! Parallel batch construction.
//!
//! The tree is grown top-down. Each node owns the candidate points of its
//! subtree together with their distance to the node center. A farthest-first
//! sweep turns those candidates into a net at the child radius: the chosen
//! centers are pairwise further apart than the radius and every candidate is
//! handed to its nearest center. Each center then recurses on its own share.
//!
//! Every decision depends only on distances and point ids (ties go to the lower
//! id), so the arena comes out identical for any worker count.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;

use crate::config::BuildParams;
use crate::metric::{Euclidean, Metric};
use crate::node::{covering_level, radius, split_level, Node, NodeId, PointId};
use crate::store::PointStore;
use crate::tree::SgTree;
use crate::{Result, SgTreeError};

/// Candidate sets below this size are swept on the calling thread.
const PARALLEL_SWEEP_MIN: usize = 4096;

/// Sibling groups below this many candidates are built sequentially.
const PARALLEL_SUBTREE_MIN: usize = 1024;

/// Worker stack size; deep chains of nested balls recurse once per level.
const BUILD_STACK_SIZE: usize = 64 << 20;

/// A point waiting to be placed, with its distance to the center that owns it.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: PointId,
    distance: f32,
}

/// Per-candidate state of a farthest-first sweep.
#[derive(Debug, Clone, Copy)]
struct Slot {
    id: PointId,
    distance: f32,
    owner: u32,
    is_center: bool,
}

/// A subtree built by one task, flattened into the arena afterwards.
#[derive(Debug)]
struct PendingNode {
    center: PointId,
    level: i32,
    max_child_distance: f32,
    coincident: Vec<PointId>,
    children: Vec<PendingNode>,
}

struct BuildContext<'a, M> {
    store: &'a PointStore,
    metric: &'a M,
    base: f64,
}

impl<M: Metric> BuildContext<'_, M> {
    #[inline]
    fn distance(&self, a: PointId, b: PointId) -> f32 {
        self.metric
            .distance(self.store.vector(a), self.store.vector(b))
    }

    fn build_node(
        &self,
        center: PointId,
        level: i32,
        candidates: Vec<Candidate>,
    ) -> Result<PendingNode> {
        let (coincident, rest): (Vec<Candidate>, Vec<Candidate>) =
            candidates.into_iter().partition(|c| c.distance == 0.0);
        let coincident: Vec<PointId> = coincident.into_iter().map(|c| c.id).collect();

        let max_child_distance = rest.iter().map(|c| c.distance).fold(0.0f32, f32::max);
        if rest.is_empty() {
            return Ok(PendingNode {
                center,
                level,
                max_child_distance,
                coincident,
                children: Vec::new(),
            });
        }

        let child_level = split_level(self.base, max_child_distance, level - 1).ok_or(
            SgTreeError::LevelOutOfRange {
                base: self.base,
                distance: max_child_distance,
            },
        )?;
        let groups = self.net(center, rest, radius(self.base, child_level));

        let total: usize = groups.iter().map(|(_, members)| members.len()).sum();
        let children = if total >= PARALLEL_SUBTREE_MIN && groups.len() > 1 {
            groups
                .into_par_iter()
                .map(|(child, members)| self.build_node(child, child_level, members))
                .collect::<Result<Vec<_>>>()?
        } else {
            groups
                .into_iter()
                .map(|(child, members)| self.build_node(child, child_level, members))
                .collect::<Result<Vec<_>>>()?
        };

        Ok(PendingNode {
            center,
            level,
            max_child_distance,
            coincident,
            children,
        })
    }

    /// Farthest-first net of `candidates` at `net_radius`, seeded with `center`.
    ///
    /// Returns one group per center in selection order, `center` first. Each
    /// group lists the candidates assigned to that center, excluding the center.
    fn net(
        &self,
        center: PointId,
        candidates: Vec<Candidate>,
        net_radius: f64,
    ) -> Vec<(PointId, Vec<Candidate>)> {
        let mut slots: Vec<Slot> = candidates
            .into_iter()
            .map(|c| Slot {
                id: c.id,
                distance: c.distance,
                owner: 0,
                is_center: false,
            })
            .collect();
        let mut centers: Vec<PointId> = vec![center];

        while let Some(pick) = farthest_slot(&slots) {
            if f64::from(slots[pick].distance) <= net_radius {
                break;
            }
            let new_center = slots[pick].id;
            let owner = centers.len() as u32;
            centers.push(new_center);
            slots[pick] = Slot {
                id: new_center,
                distance: 0.0,
                owner,
                is_center: true,
            };

            let reassign = |slot: &mut Slot| {
                if slot.is_center {
                    return;
                }
                let d = self.distance(new_center, slot.id);
                let current = centers[slot.owner as usize];
                if d < slot.distance || (d == slot.distance && new_center < current) {
                    slot.distance = d;
                    slot.owner = owner;
                }
            };
            if slots.len() >= PARALLEL_SWEEP_MIN {
                slots
                    .par_iter_mut()
                    .with_min_len(PARALLEL_SWEEP_MIN / 4)
                    .for_each(reassign);
            } else {
                slots.iter_mut().for_each(reassign);
            }
        }

        let mut groups: Vec<(PointId, Vec<Candidate>)> =
            centers.iter().map(|&c| (c, Vec::new())).collect();
        for slot in slots.iter().filter(|s| !s.is_center) {
            groups[slot.owner as usize].1.push(Candidate {
                id: slot.id,
                distance: slot.distance,
            });
        }
        groups
    }
}

/// Index of the non-center slot furthest from its owner; ties go to the lower point id.
fn farthest_slot(slots: &[Slot]) -> Option<usize> {
    let better = |a: (usize, Slot), b: (usize, Slot)| {
        match a.1.distance.total_cmp(&b.1.distance) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            std::cmp::Ordering::Equal => {
                if a.1.id <= b.1.id {
                    a
                } else {
                    b
                }
            }
        }
    };
    let open = |&(_, slot): &(usize, Slot)| !slot.is_center;

    if slots.len() >= PARALLEL_SWEEP_MIN {
        slots
            .par_iter()
            .with_min_len(PARALLEL_SWEEP_MIN / 4)
            .copied()
            .enumerate()
            .filter(open)
            .reduce_with(better)
            .map(|(idx, _)| idx)
    } else {
        slots
            .iter()
            .copied()
            .enumerate()
            .filter(open)
            .reduce(better)
            .map(|(idx, _)| idx)
    }
}

/// Lay a pending tree out breadth-first; the root gets id 0 and siblings are contiguous.
fn flatten(root: PendingNode) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::new();
    let mut queue: VecDeque<(PendingNode, Option<usize>)> = VecDeque::new();
    queue.push_back((root, None));

    while let Some((pending, parent)) = queue.pop_front() {
        let id = nodes.len();
        nodes.push(Node {
            center: pending.center,
            level: pending.level,
            children: Vec::with_capacity(pending.children.len()),
            max_child_distance: pending.max_child_distance,
            coincident: pending.coincident,
        });
        if let Some(parent) = parent {
            nodes[parent].children.push(id as NodeId);
        }
        for child in pending.children {
            queue.push_back((child, Some(id)));
        }
    }
    nodes
}

impl SgTree<Euclidean> {
    /// Build a Euclidean tree with [`BuildParams::default`].
    pub fn build_default(store: Arc<PointStore>) -> Result<Self> {
        Self::build(store, Euclidean, &BuildParams::default())
    }
}

impl<M: Metric> SgTree<M> {
    /// Build a tree over every point of `store`.
    ///
    /// Fails with [`SgTreeError::EmptyDataset`] for an empty store and with
    /// [`SgTreeError::InvalidScale`] unless `params.base` is finite and above 1.
    /// Points whose distance from point 0 overflows `f32` give
    /// [`SgTreeError::NonFiniteDistance`].
    /// The resulting node table does not depend on `params.parallelism`.
    pub fn build(store: Arc<PointStore>, metric: M, params: &BuildParams) -> Result<Self> {
        if store.is_empty() {
            return Err(SgTreeError::EmptyDataset);
        }
        if !params.base.is_finite() || params.base <= 1.0 {
            return Err(SgTreeError::InvalidScale(params.base));
        }
        if params.parallelism == 0 {
            return Err(SgTreeError::InvalidConfig("parallelism must be positive"));
        }

        tracing::info!(
            points = store.len(),
            dim = store.dim(),
            base = params.base,
            parallelism = params.parallelism,
            metric = metric.name(),
            "building SG tree"
        );
        let start = Instant::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(params.parallelism)
            .stack_size(BUILD_STACK_SIZE)
            .thread_name(|idx| format!("sgtree-build-{idx}"))
            .build()?;

        let ctx = BuildContext {
            store: &store,
            metric: &metric,
            base: params.base,
        };
        let root_center: PointId = 0;
        let pending = pool.install(|| -> Result<Vec<Node>> {
            let candidates: Vec<Candidate> = (1..store.len() as PointId)
                .into_par_iter()
                .with_min_len(PARALLEL_SWEEP_MIN / 4)
                .map(|id| Candidate {
                    id,
                    distance: ctx.distance(root_center, id),
                })
                .collect();
            // Sweeps only ever lower these, so every later level stays finite.
            if let Some(far) = candidates.iter().find(|c| !c.distance.is_finite()) {
                return Err(SgTreeError::NonFiniteDistance {
                    from: root_center,
                    to: far.id,
                });
            }
            let spread = candidates.iter().map(|c| c.distance).fold(0.0f32, f32::max);
            let top_level =
                covering_level(params.base, spread).ok_or(SgTreeError::LevelOutOfRange {
                    base: params.base,
                    distance: spread,
                })?;
            tracing::debug!(top_level, spread, "root level chosen");
            let pending = ctx.build_node(root_center, top_level, candidates)?;
            Ok(flatten(pending))
        })?;

        let tree = Self {
            store,
            metric,
            base: params.base,
            nodes: pending,
            root: 0,
        };

        let stats = tree.stats();
        tracing::info!(
            nodes = stats.nodes,
            depth = stats.depth,
            max_level = stats.max_level,
            min_level = stats.min_level,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "SG tree built"
        );
        tracing::debug!(?stats, "SG tree statistics");
        Ok(tree)
    }
}
