//! Search-path recording.
//!
//! A [`TraceSink`] receives one [`TraceEvent`] per frontier pop, in visitation
//! order. The events are enough to replay which balls a query opened and which
//! it discarded; they never influence the result.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::node::{NodeId, PointId};
use crate::Result;

/// What the search did with a visited node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAction {
    /// The node's children were pushed onto the frontier.
    Expanded,
    /// The triangle inequality ruled out the whole subtree.
    Pruned,
}

/// One visited node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub node: NodeId,
    pub center: PointId,
    pub level: i32,
    /// Distance from the query to `center`.
    pub distance: f32,
    pub action: TraceAction,
}

/// Destination for trace events.
pub trait TraceSink {
    fn record(&mut self, event: TraceEvent);
}

impl TraceSink for Vec<TraceEvent> {
    fn record(&mut self, event: TraceEvent) {
        self.push(event);
    }
}

#[derive(Serialize)]
struct TraceLine<'a> {
    query: usize,
    #[serde(flatten)]
    event: &'a TraceEvent,
}

/// Write per-query traces as JSON lines, one event per line, tagged with the query row.
pub fn write_traces<W: Write>(mut writer: W, traces: &[Vec<TraceEvent>]) -> Result<()> {
    for (query, events) in traces.iter().enumerate() {
        for event in events {
            serde_json::to_writer(&mut writer, &TraceLine { query, event })?;
            writer.write_all(b"\n")?;
        }
    }
    writer.flush()?;
    Ok(())
}
