// Licensed under the MIT License

//! The process-wide publish/subscribe signal bus (spec §4.5).
//!
//! A closure-based bus would be the obvious port of the original's
//! `subscribe(handler, signal, sender)`, but closures aren't serializable
//! and the whole point of this engine is that it survives a snapshot/load
//! cycle. So subscriptions here are *data* — a small enum naming which of
//! the `Flow`'s own dispatch methods to call — and the bus itself is never
//! persisted: [`crate::flow::Flow::connect_signals`] rebuilds it from the
//! workflow/task/callback graph on every load, exactly as spec §4.6
//! requires ("subscriptions are not part of the snapshot").

use std::collections::HashMap;

use crate::node::NodeId;
use crate::status::Status;

/// What to do when `(signal, sender)` fires. `weak` subscriptions are not
/// modeled: every handler here is reconstructed from durable graph data
/// (the workflow that owns a task, the callback that depends on a node), so
/// there is no "sole strong referrer" problem to solve — see spec §9's note
/// that `weak=False` is required in the original because no other strong
/// referrer may exist. Our handlers are plain data, not references, so the
/// distinction doesn't apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handler {
    /// The workflow `NodeId` owns the task that is `sender`; call its
    /// `on_ok` finalization check.
    WorkflowOnOk(NodeId),
    /// The flow's `on_dep_ok` callback dispatcher should run.
    FlowOnDepOk,
}

#[derive(Default, Debug)]
pub struct SignalBus {
    subscribers: HashMap<(Status, NodeId), Vec<Handler>>,
}

impl SignalBus {
    pub fn new() -> Self {
        SignalBus::default()
    }

    pub fn subscribe(&mut self, signal: Status, sender: NodeId, handler: Handler) {
        let slot = self.subscribers.entry((signal, sender)).or_default();
        if !slot.contains(&handler) {
            slot.push(handler);
        }
    }

    /// Handlers currently subscribed to `(signal, sender)`, in registration
    /// order. Used by `Flow::publish` to drain without holding a borrow of
    /// the bus across dispatch (dispatch mutates the flow that owns us).
    pub fn live_receivers(&self, signal: Status, sender: NodeId) -> Vec<Handler> {
        self.subscribers
            .get(&(signal, sender))
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_is_idempotent() {
        let mut bus = SignalBus::new();
        let n = NodeId(1);
        bus.subscribe(Status::Ok, n, Handler::FlowOnDepOk);
        bus.subscribe(Status::Ok, n, Handler::FlowOnDepOk);
        assert_eq!(bus.live_receivers(Status::Ok, n).len(), 1);
    }

    #[test]
    fn distinct_senders_are_independent() {
        let mut bus = SignalBus::new();
        bus.subscribe(Status::Ok, NodeId(1), Handler::WorkflowOnOk(NodeId(9)));
        assert!(bus.live_receivers(Status::Ok, NodeId(2)).is_empty());
        assert_eq!(bus.live_receivers(Status::Ok, NodeId(1)).len(), 1);
    }
}
