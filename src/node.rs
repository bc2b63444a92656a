// Licensed under the MIT License

//! Node identity: the monotonic id and shared bookkeeping common to
//! anything schedulable (spec §3, "Node").
//!
//! Rust has no inheritance, so `Task` and `Workflow` each embed a
//! [`NodeCore`] rather than extending a base class. Generic code that only
//! needs status/history/deps operates on `&NodeCore`/`&mut NodeCore`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::status::Status;

/// A flow-wide unique identifier, assigned monotonically at construction.
/// `0` is never issued, matching the "nonzero integer" invariant of spec §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Task,
    Workflow,
}

/// A dependency edge: this node requires that, for each tag in `exts`, the
/// upstream node has produced a file of that extension in its `outdir`
/// (spec §3, "Dependency"). The edge only stores the upstream id; resolution
/// goes through the flow-scoped node registry rather than a direct pointer,
/// which is what keeps the graph acyclic-by-construction under
/// serialization (spec §9).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dependency {
    pub upstream: NodeId,
    pub exts: BTreeSet<String>,
}

impl Dependency {
    pub fn new(upstream: NodeId, exts: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Dependency {
            upstream,
            exts: exts.into_iter().map(Into::into).collect(),
        }
    }
}

/// Fields shared by every schedulable node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeCore {
    pub id: NodeId,
    pub kind: NodeKind,
    pub status: Status,
    /// Append-only log of `(tick, message)` pairs. The tick is the owning
    /// `Flow`'s logical clock, not wall-clock time, so persisted history
    /// compares equal across runs in tests (spec §3 "history").
    pub history: Vec<(u64, String)>,
    /// Terminal latch: true once this node has finalized/published S_OK as
    /// its own event. For a `Task` this is set the instant it reaches
    /// S_OK; for a `Workflow` it is the exactly-once finalization flag of
    /// spec §4.2.
    pub finalized: bool,
    pub deps: Vec<Dependency>,
}

impl NodeCore {
    pub fn new(id: NodeId, kind: NodeKind) -> Self {
        NodeCore {
            id,
            kind,
            status: Status::Init,
            history: Vec::new(),
            finalized: false,
            deps: Vec::new(),
        }
    }

    pub fn record(&mut self, tick: u64, message: impl Into<String>) {
        self.history.push((tick, message.into()));
    }

    /// All upstream dependencies are at S_OK.
    pub fn deps_satisfied(&self, status_of: impl Fn(NodeId) -> Option<Status>) -> bool {
        self.deps
            .iter()
            .all(|d| status_of(d.upstream) == Some(Status::Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_nonzero_by_convention() {
        // The allocator (see flow::Flow::alloc_id) starts at 1; this test
        // just documents the expectation that callers never hand out 0.
        assert_ne!(NodeId(1).0, 0);
    }

    #[test]
    fn dependency_dedupes_extensions() {
        let d = Dependency::new(NodeId(1), ["DEN", "DEN", "WFK"]);
        assert_eq!(d.exts.len(), 2);
    }
}
