//! Tree persistence.
//!
//! A tree is persisted as its node table ([`TreeDocument`]); the point vectors
//! are not stored and must be supplied again on load. Two encodings share the
//! same table and the same validation:
//!
//! * a JSON document (`dump_json` / `load_json`);
//! * a compact little-endian binary file with a CRC32 trailer
//!   (`save_to_writer` / `load_from_reader`).
//!
//! Loading is all-or-nothing: any structural inconsistency yields
//! [`SgTreeError::MalformedTree`] and no tree.

use std::collections::VecDeque;
use std::convert::TryFrom;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::metric::Metric;
use crate::node::{Node, NodeId, PointId};
use crate::store::PointStore;
use crate::tree::SgTree;
use crate::{Result, SgTreeError};

const PERSIST_MAGIC: [u8; 4] = *b"SGT1";
const PERSIST_VERSION: u32 = 1;

/// Version written into JSON documents.
pub const DOCUMENT_VERSION: u32 = 1;

/// Upper bound on speculative pre-allocation while decoding untrusted counts.
const MAX_PREALLOC: usize = 1 << 16;

/// One row of the persisted node table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub center: PointId,
    pub level: i32,
    pub children: Vec<NodeId>,
    pub max_child_distance: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coincident: Vec<PointId>,
}

/// Structured, encoding-independent form of a tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDocument {
    pub format_version: u32,
    pub metric: String,
    pub base: f64,
    pub dimension: usize,
    pub point_count: usize,
    pub root: NodeId,
    pub nodes: Vec<NodeRecord>,
}

fn malformed(reason: impl Into<String>) -> SgTreeError {
    SgTreeError::MalformedTree(reason.into())
}

impl TreeDocument {
    /// Check the table against itself and against `store`, producing the arena.
    fn into_nodes(self, store: &PointStore, metric_name: &str) -> Result<Vec<Node>> {
        if self.format_version != DOCUMENT_VERSION {
            return Err(malformed(format!(
                "unsupported document version {}",
                self.format_version
            )));
        }
        if self.metric != metric_name {
            return Err(malformed(format!(
                "tree was built with metric `{}`, loading with `{metric_name}`",
                self.metric
            )));
        }
        if !self.base.is_finite() || self.base <= 1.0 {
            return Err(malformed(format!("invalid base {}", self.base)));
        }
        if self.dimension != store.dim() {
            return Err(malformed(format!(
                "tree dimension {} does not match point store dimension {}",
                self.dimension,
                store.dim()
            )));
        }
        if self.point_count != store.len() || store.is_empty() {
            return Err(malformed(format!(
                "tree indexes {} points, point store holds {}",
                self.point_count,
                store.len()
            )));
        }

        let count = self.nodes.len();
        if count == 0 {
            return Err(malformed("node table is empty"));
        }
        if let Some((pos, record)) = self
            .nodes
            .iter()
            .enumerate()
            .find(|(pos, record)| record.id as usize != *pos)
        {
            return Err(malformed(format!(
                "node at position {pos} carries id {}",
                record.id
            )));
        }
        if self.root as usize >= count {
            return Err(malformed(format!("root {} is not a node", self.root)));
        }

        let mut parent: Vec<Option<NodeId>> = vec![None; count];
        for record in &self.nodes {
            if record.center as usize >= self.point_count {
                return Err(malformed(format!(
                    "node {} is centred on missing point {}",
                    record.id, record.center
                )));
            }
            if let Some(&point) = record
                .coincident
                .iter()
                .find(|&&p| p as usize >= self.point_count)
            {
                return Err(malformed(format!(
                    "node {} lists missing coincident point {point}",
                    record.id
                )));
            }
            if !record.max_child_distance.is_finite() || record.max_child_distance < 0.0 {
                return Err(malformed(format!(
                    "node {} has invalid max child distance {}",
                    record.id, record.max_child_distance
                )));
            }

            let mut child_level = None;
            for (pos, &child) in record.children.iter().enumerate() {
                let Some(child_record) = self.nodes.get(child as usize) else {
                    return Err(malformed(format!(
                        "node {} references missing child {child}",
                        record.id
                    )));
                };
                if child == record.id || child == self.root {
                    return Err(malformed(format!(
                        "node {} lists node {child} as a child",
                        record.id
                    )));
                }
                if parent[child as usize].replace(record.id).is_some() {
                    return Err(malformed(format!("node {child} has two parents")));
                }
                if child_record.level >= record.level {
                    return Err(malformed(format!(
                        "child {child} at level {} is not below parent {} at level {}",
                        child_record.level, record.id, record.level
                    )));
                }
                if *child_level.get_or_insert(child_record.level) != child_record.level {
                    return Err(malformed(format!(
                        "children of node {} sit on different levels",
                        record.id
                    )));
                }
                let is_self = child_record.center == record.center;
                if is_self != (pos == 0) {
                    return Err(malformed(format!(
                        "node {} must list its self child first and only once",
                        record.id
                    )));
                }
            }
        }

        // Every node reachable from the root exactly once rules out cycles.
        let mut seen = vec![false; count];
        let mut queue = VecDeque::from([self.root]);
        let mut reached = 0usize;
        while let Some(id) = queue.pop_front() {
            if std::mem::replace(&mut seen[id as usize], true) {
                return Err(malformed(format!("node {id} is reachable twice")));
            }
            reached += 1;
            queue.extend(self.nodes[id as usize].children.iter().copied());
        }
        if reached != count {
            return Err(malformed(format!(
                "{} nodes are unreachable from the root",
                count - reached
            )));
        }

        let mut introduced = vec![0u32; self.point_count];
        for record in &self.nodes {
            let restated = parent[record.id as usize]
                .is_some_and(|p| self.nodes[p as usize].center == record.center);
            if !restated {
                introduced[record.center as usize] += 1;
            }
            for &point in &record.coincident {
                introduced[point as usize] += 1;
            }
        }
        if let Some((point, &times)) = introduced.iter().enumerate().find(|(_, &n)| n != 1) {
            return Err(malformed(format!(
                "point {point} appears {times} times instead of once"
            )));
        }

        Ok(self
            .nodes
            .into_iter()
            .map(|record| Node {
                center: record.center,
                level: record.level,
                children: record.children,
                max_child_distance: record.max_child_distance,
                coincident: record.coincident,
            })
            .collect())
    }
}

fn write_u32<W: Write>(writer: &mut W, value: u32, hasher: &mut Hasher) -> io::Result<()> {
    let bytes = value.to_le_bytes();
    hasher.update(&bytes);
    writer.write_all(&bytes)
}

fn write_u64<W: Write>(writer: &mut W, value: u64, hasher: &mut Hasher) -> io::Result<()> {
    let bytes = value.to_le_bytes();
    hasher.update(&bytes);
    writer.write_all(&bytes)
}

fn write_ids<W: Write>(writer: &mut W, ids: &[u32], hasher: &mut Hasher) -> Result<()> {
    let len = u32::try_from(ids.len())
        .map_err(|_| SgTreeError::InvalidPersistence("id list exceeds persistence limits"))?;
    write_u32(writer, len, hasher)?;
    for &id in ids {
        write_u32(writer, id, hasher)?;
    }
    Ok(())
}

fn read_array<R: Read, const N: usize>(
    reader: &mut R,
    hasher: Option<&mut Hasher>,
) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader.read_exact(&mut buf)?;
    if let Some(h) = hasher {
        h.update(&buf);
    }
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R, hasher: Option<&mut Hasher>) -> io::Result<u32> {
    read_array::<R, 4>(reader, hasher).map(u32::from_le_bytes)
}

fn read_u64<R: Read>(reader: &mut R, hasher: Option<&mut Hasher>) -> io::Result<u64> {
    read_array::<R, 8>(reader, hasher).map(u64::from_le_bytes)
}

fn read_ids<R: Read>(reader: &mut R, hasher: &mut Hasher) -> io::Result<Vec<u32>> {
    let len = read_u32(reader, Some(&mut *hasher))? as usize;
    let mut ids = Vec::with_capacity(len.min(MAX_PREALLOC));
    for _ in 0..len {
        ids.push(read_u32(reader, Some(&mut *hasher))?);
    }
    Ok(ids)
}

fn usize_from_u64(value: u64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| SgTreeError::InvalidPersistence("value exceeds platform limits"))
}

impl<M: Metric> SgTree<M> {
    /// Export the node table.
    pub fn to_document(&self) -> TreeDocument {
        TreeDocument {
            format_version: DOCUMENT_VERSION,
            metric: self.metric.name().to_string(),
            base: self.base,
            dimension: self.dim(),
            point_count: self.len(),
            root: self.root,
            nodes: self
                .nodes
                .iter()
                .enumerate()
                .map(|(id, node)| NodeRecord {
                    id: id as NodeId,
                    center: node.center,
                    level: node.level,
                    children: node.children.clone(),
                    max_child_distance: node.max_child_distance,
                    coincident: node.coincident.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild a tree from a node table over the store it was built from.
    ///
    /// The table is checked structurally but its distances are trusted: a table
    /// that understates `max_child_distance` or a covering radius still loads,
    /// and queries against it can then prune true neighbours. Use
    /// [`from_document_verified`](Self::from_document_verified) for tables that
    /// did not come from [`to_document`](Self::to_document).
    pub fn from_document(
        document: TreeDocument,
        store: Arc<PointStore>,
        metric: M,
    ) -> Result<Self> {
        let base = document.base;
        let root = document.root;
        let nodes = document.into_nodes(&store, metric.name())?;
        Ok(Self {
            store,
            metric,
            base,
            nodes,
            root,
        })
    }

    /// Like [`from_document`](Self::from_document), then recomputes the
    /// geometry with [`check_invariants`](Self::check_invariants) and rejects
    /// the table on the first violation.
    pub fn from_document_verified(
        document: TreeDocument,
        store: Arc<PointStore>,
        metric: M,
    ) -> Result<Self> {
        let tree = Self::from_document(document, store, metric)?;
        tree.check_invariants()
            .map_err(|violation| malformed(violation.to_string()))?;
        Ok(tree)
    }

    /// Write the node table as a JSON document.
    pub fn dump_json<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        serde_json::to_writer(&mut writer, &self.to_document())?;
        writer.flush()?;
        Ok(())
    }

    /// Write the node table as a JSON document at `path`.
    pub fn dump_json_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.dump_json(File::create(path)?)?;
        tracing::info!(path = %path.display(), nodes = self.nodes.len(), "dumped SG tree");
        Ok(())
    }

    /// Read a JSON document and rebuild the tree over `store`.
    pub fn load_json<R: Read>(reader: R, store: Arc<PointStore>, metric: M) -> Result<Self> {
        let document: TreeDocument = serde_json::from_reader(BufReader::new(reader))?;
        Self::from_document(document, store, metric)
    }

    /// Read a JSON document from `path` and rebuild the tree over `store`.
    pub fn load_json_from_path<P: AsRef<Path>>(
        path: P,
        store: Arc<PointStore>,
        metric: M,
    ) -> Result<Self> {
        Self::load_json(File::open(path)?, store, metric)
    }

    /// Persist the tree to the provided filesystem path in the binary format.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        self.save_to_writer(BufWriter::new(file))
    }

    /// Persist the tree using the supplied writer in the binary format.
    pub fn save_to_writer<W: Write>(&self, writer: W) -> Result<()> {
        let mut writer = BufWriter::new(writer);
        writer.write_all(&PERSIST_MAGIC)?;
        writer.write_all(&PERSIST_VERSION.to_le_bytes())?;

        let mut hasher = Hasher::new();

        let name = self.metric.name().as_bytes();
        let name_len = u32::try_from(name.len())
            .map_err(|_| SgTreeError::InvalidPersistence("metric name too long"))?;
        write_u32(&mut writer, name_len, &mut hasher)?;
        writer.write_all(name)?;
        hasher.update(name);

        write_u64(&mut writer, self.base.to_bits(), &mut hasher)?;
        write_u64(&mut writer, self.dim() as u64, &mut hasher)?;
        write_u64(&mut writer, self.len() as u64, &mut hasher)?;
        write_u32(&mut writer, self.root, &mut hasher)?;
        write_u64(&mut writer, self.nodes.len() as u64, &mut hasher)?;

        for node in &self.nodes {
            write_u32(&mut writer, node.center, &mut hasher)?;
            write_u32(&mut writer, node.level as u32, &mut hasher)?;
            write_u32(&mut writer, node.max_child_distance.to_bits(), &mut hasher)?;
            write_ids(&mut writer, &node.children, &mut hasher)?;
            write_ids(&mut writer, &node.coincident, &mut hasher)?;
        }

        writer.write_all(&hasher.finalize().to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Load a binary tree from the provided filesystem path.
    pub fn load_from_path<P: AsRef<Path>>(
        path: P,
        store: Arc<PointStore>,
        metric: M,
    ) -> Result<Self> {
        let file = File::open(path)?;
        Self::load_from_reader(BufReader::new(file), store, metric)
    }

    /// Load a binary tree from a persisted byte stream.
    pub fn load_from_reader<R: Read>(reader: R, store: Arc<PointStore>, metric: M) -> Result<Self> {
        let mut reader = BufReader::new(reader);
        let magic: [u8; 4] = read_array(&mut reader, None)?;
        if magic != PERSIST_MAGIC {
            return Err(SgTreeError::InvalidPersistence("unrecognized file header"));
        }
        if read_u32(&mut reader, None)? != PERSIST_VERSION {
            return Err(SgTreeError::InvalidPersistence(
                "unsupported tree format version",
            ));
        }

        let mut hasher = Hasher::new();

        let name_len = read_u32(&mut reader, Some(&mut hasher))? as usize;
        if name_len > 256 {
            return Err(SgTreeError::InvalidPersistence("metric name too long"));
        }
        let mut name = vec![0u8; name_len];
        reader.read_exact(&mut name)?;
        hasher.update(&name);
        let metric_name = String::from_utf8(name)
            .map_err(|_| SgTreeError::InvalidPersistence("metric name is not utf-8"))?;

        let base = f64::from_bits(read_u64(&mut reader, Some(&mut hasher))?);
        let dimension = usize_from_u64(read_u64(&mut reader, Some(&mut hasher))?)?;
        let point_count = usize_from_u64(read_u64(&mut reader, Some(&mut hasher))?)?;
        let root = read_u32(&mut reader, Some(&mut hasher))?;
        let node_count = usize_from_u64(read_u64(&mut reader, Some(&mut hasher))?)?;

        let mut nodes = Vec::with_capacity(node_count.min(MAX_PREALLOC));
        for id in 0..node_count {
            let id = NodeId::try_from(id)
                .map_err(|_| SgTreeError::InvalidPersistence("node count exceeds id range"))?;
            let center = read_u32(&mut reader, Some(&mut hasher))?;
            let level = read_u32(&mut reader, Some(&mut hasher))? as i32;
            let max_child_distance = f32::from_bits(read_u32(&mut reader, Some(&mut hasher))?);
            let children = read_ids(&mut reader, &mut hasher)?;
            let coincident = read_ids(&mut reader, &mut hasher)?;
            nodes.push(NodeRecord {
                id,
                center,
                level,
                children,
                max_child_distance,
                coincident,
            });
        }

        let computed = hasher.finalize();
        let stored = read_u32(&mut reader, None)?;
        if computed != stored {
            return Err(SgTreeError::InvalidPersistence("checksum mismatch"));
        }

        let document = TreeDocument {
            format_version: DOCUMENT_VERSION,
            metric: metric_name,
            base,
            dimension,
            point_count,
            root,
            nodes,
        };
        let tree = Self::from_document(document, store, metric)?;
        tracing::debug!(nodes = tree.nodes.len(), "loaded SG tree");
        Ok(tree)
    }
}
