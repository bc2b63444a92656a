// Licensed under the MIT License

//! Deferred workflow synthesis (spec §4.4, "Callback") and the iteration
//! exit-predicate hook used by `IterativeWorkflow` (spec §4.3).
//!
//! Both are conceptually "a function to call later", and in the original
//! these are captured closures. Closures can't round-trip through
//! `bincode`, so both are modeled as a stable string key resolved against a
//! registry of plain `fn` pointers (spec §9, "callback `func` must be
//! serializable... require callbacks to be named entries in a registry
//! keyed by a stable string").

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::flow::Flow;
use crate::node::NodeId;
use crate::task::Task;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallbackKey(pub String);

impl From<&str> for CallbackKey {
    fn from(s: &str) -> Self {
        CallbackKey(s.to_string())
    }
}

pub type CallbackFn = fn(&mut Flow, NodeId, &serde_json::Value) -> Result<()>;

#[derive(Default)]
pub struct CallbackRegistry {
    funcs: HashMap<CallbackKey, CallbackFn>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        CallbackRegistry::default()
    }

    pub fn register(&mut self, key: impl Into<CallbackKey>, f: CallbackFn) {
        self.funcs.insert(key.into(), f);
    }

    pub fn get(&self, key: &CallbackKey) -> Result<CallbackFn> {
        self.funcs
            .get(key)
            .copied()
            .ok_or_else(|| FlowError::Config(format!("no callback registered under `{}`", key.0)))
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("keys", &self.funcs.keys().map(|k| &k.0).collect::<Vec<_>>())
            .finish()
    }
}

/// `(func, owning_workflow, deps, user_data, disabled)` (spec §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Callback {
    pub key: CallbackKey,
    pub workflow: NodeId,
    pub deps: Vec<NodeId>,
    pub user_data: serde_json::Value,
    pub disabled: bool,
}

impl Callback {
    pub fn new(
        key: impl Into<CallbackKey>,
        workflow: NodeId,
        deps: Vec<NodeId>,
        user_data: serde_json::Value,
    ) -> Self {
        Callback {
            key: key.into(),
            workflow,
            deps,
            user_data,
            disabled: false,
        }
    }

    /// All of this callback's dependency nodes are at S_OK, per the
    /// caller-supplied status lookup.
    pub fn ready(&self, status_of: impl Fn(NodeId) -> Option<crate::status::Status>) -> bool {
        !self.disabled
            && !self.deps.is_empty()
            && self
                .deps
                .iter()
                .all(|d| status_of(*d) == Some(crate::status::Status::Ok))
    }
}

/// `exit_iteration()` (spec §4.3): an abstract hook returning at least
/// `{exit: bool}`. `data` carries whatever domain-specific convergence
/// payload a concrete rule wants to stash in the task's history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExitDecision {
    pub exit: bool,
    pub data: serde_json::Value,
}

pub type ExitRuleFn = fn(iteration: usize, last_task: &Task) -> ExitDecision;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitRuleKey(pub String);

impl From<&str> for ExitRuleKey {
    fn from(s: &str) -> Self {
        ExitRuleKey(s.to_string())
    }
}

#[derive(Default)]
pub struct ExitRuleRegistry {
    funcs: HashMap<ExitRuleKey, ExitRuleFn>,
}

impl ExitRuleRegistry {
    pub fn new() -> Self {
        ExitRuleRegistry::default()
    }

    pub fn register(&mut self, key: impl Into<ExitRuleKey>, f: ExitRuleFn) {
        self.funcs.insert(key.into(), f);
    }

    pub fn get(&self, key: &ExitRuleKey) -> Result<ExitRuleFn> {
        self.funcs
            .get(key)
            .copied()
            .ok_or_else(|| FlowError::Config(format!("no exit rule registered under `{}`", key.0)))
    }
}

impl std::fmt::Debug for ExitRuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitRuleRegistry")
            .field("keys", &self.funcs.keys().map(|k| &k.0).collect::<Vec<_>>())
            .finish()
    }
}

/// An exit rule that never exits early; the iteration loop runs until the
/// strategy pool is exhausted or `max_niter` is hit.
pub fn never_exit(_iteration: usize, _last_task: &Task) -> ExitDecision {
    ExitDecision {
        exit: false,
        data: serde_json::Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Status;

    #[test]
    fn callback_not_ready_until_all_deps_ok() {
        let cb = Callback::new("synth", NodeId(9), vec![NodeId(1), NodeId(2)], serde_json::Value::Null);
        assert!(!cb.ready(|id| if id == NodeId(1) { Some(Status::Ok) } else { Some(Status::Run) }));
        assert!(cb.ready(|_| Some(Status::Ok)));
    }

    #[test]
    fn disabled_callback_never_ready() {
        let mut cb = Callback::new("synth", NodeId(9), vec![NodeId(1)], serde_json::Value::Null);
        cb.disabled = true;
        assert!(!cb.ready(|_| Some(Status::Ok)));
    }

    #[test]
    fn registry_rejects_unknown_key() {
        let reg = CallbackRegistry::new();
        assert!(reg.get(&CallbackKey::from("missing")).is_err());
    }
}
