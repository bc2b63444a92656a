// Licensed under the MIT License

//! `Flow`: the top-level container of workflows, inter-workflow
//! dependencies, and callbacks (spec §3, §4.4).
//!
//! `Flow` is the only thing that owns the signal bus, the task manager,
//! and the function registries — all deliberately `#[serde(skip)]`, all
//! rebuilt from durable configuration after a snapshot load (spec §4.6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callback::{Callback, CallbackKey, CallbackRegistry, ExitRuleRegistry};
use crate::error::{FlowError, Result};
use crate::node::{Dependency, NodeId};
use crate::signal::{Handler, SignalBus};
use crate::status::Status;
use crate::taskmanager::{ManagerConfig, TaskManager};
use crate::workflow::{FetchOutcome, Workflow, WorkflowKind};

/// Informational CPU accounting (spec §5): `reserved` counts tasks at
/// S_SUB, `allocated` counts S_SUB ∪ S_RUN, `inuse` counts S_RUN.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuReport {
    pub reserved: u32,
    pub allocated: u32,
    pub inuse: u32,
}

#[derive(Serialize, Deserialize)]
pub struct Flow {
    pub workdir: PathBuf,
    pub manager_config: ManagerConfig,
    pub workflows: Vec<Workflow>,
    pub callbacks: Vec<Callback>,
    next_id: u64,
    pub tick: u64,

    #[serde(skip)]
    bus: SignalBus,
    #[serde(skip)]
    manager: Option<Box<dyn TaskManager>>,
    #[serde(skip)]
    callback_registry: CallbackRegistry,
    #[serde(skip)]
    exit_rules: ExitRuleRegistry,
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("workdir", &self.workdir)
            .field("workflows", &self.workflows)
            .field("callbacks", &self.callbacks)
            .field("tick", &self.tick)
            .finish()
    }
}

impl Flow {
    pub fn new(workdir: PathBuf, manager_config: ManagerConfig) -> Self {
        Flow {
            workdir,
            manager_config,
            workflows: Vec::new(),
            callbacks: Vec::new(),
            next_id: 0,
            tick: 0,
            bus: SignalBus::new(),
            manager: None,
            callback_registry: CallbackRegistry::new(),
            exit_rules: ExitRuleRegistry::new(),
        }
    }

    pub fn alloc_id(&mut self) -> NodeId {
        self.next_id += 1;
        NodeId(self.next_id)
    }

    /// Register a named callback function so it can be resolved by key
    /// after this (or a reloaded) flow's callbacks fire. Must be called
    /// for every `CallbackKey` a flow's callbacks reference, both on fresh
    /// construction and again after `persistence::load`.
    pub fn register_callback_fn(&mut self, key: impl Into<CallbackKey>, f: crate::callback::CallbackFn) {
        self.callback_registry.register(key, f);
    }

    pub fn register_exit_rule(&mut self, key: impl Into<crate::callback::ExitRuleKey>, f: crate::callback::ExitRuleFn) {
        self.exit_rules.register(key, f);
    }

    /// Append an already-built workflow under `work_<i>`, attach
    /// inter-workflow dependency edges (spec §4.4 `register_work`).
    pub fn register_work(&mut self, mut work: Workflow, deps: Vec<Dependency>) -> Result<NodeId> {
        let idx = self.workflows.len();
        work.set_workdir(self.workdir.join(format!("work_{idx}")))?;
        work.core.deps = deps;
        let id = work.id();
        self.workflows.push(work);
        Ok(id)
    }

    /// Create an empty workflow gated on `deps`, and a matching Callback
    /// record keyed by `key` (spec §4.4 `register_callback`). The workflow
    /// is returned empty; tasks are added when the callback fires.
    pub fn register_callback(
        &mut self,
        key: impl Into<CallbackKey>,
        deps: Vec<NodeId>,
        user_data: serde_json::Value,
    ) -> Result<NodeId> {
        if deps.is_empty() {
            return Err(FlowError::Config(
                "register_callback requires at least one dependency".to_string(),
            ));
        }
        let id = self.alloc_id();
        let workflow = Workflow::new(id);
        let dep_edges = deps
            .iter()
            .map(|&d| Dependency::new(d, Vec::<String>::new()))
            .collect();
        let work_id = self.register_work(workflow, dep_edges)?;
        self.callbacks
            .push(Callback::new(key, work_id, deps, user_data));
        Ok(work_id)
    }

    pub fn allocate(&mut self) -> Result<()> {
        for wf in &mut self.workflows {
            wf.allocate()?;
        }
        Ok(())
    }

    /// Delegate `build()` to every workflow, then rebuild the signal bus
    /// (spec §4.4 `build`). Also lazily constructs the task manager from
    /// `manager_config` if this flow was just loaded from a snapshot.
    pub fn build(&mut self) -> Result<()> {
        if self.manager.is_none() {
            self.manager = Some(self.manager_config.build());
        }
        for wf in &mut self.workflows {
            wf.build()?;
        }
        self.connect_signals();
        Ok(())
    }

    /// Re-subscribe every task's S_OK to its owning workflow's `on_ok`, and
    /// every callback dependency's S_OK to `on_dep_ok` (spec §4.4
    /// `connect_signals`). Idempotent; safe to call repeatedly (e.g. after
    /// a dynamically-created workflow gets new tasks).
    pub fn connect_signals(&mut self) {
        self.bus.clear();
        for wf in &self.workflows {
            for task in &wf.tasks {
                self.bus
                    .subscribe(Status::Ok, task.id(), Handler::WorkflowOnOk(wf.id()));
            }
        }
        for cb in &self.callbacks {
            for dep in &cb.deps {
                self.bus.subscribe(Status::Ok, *dep, Handler::FlowOnDepOk);
            }
        }
    }

    /// Resolve any node (workflow or task) to its current status.
    pub fn status_of(&self, id: NodeId) -> Option<Status> {
        for wf in &self.workflows {
            if wf.id() == id {
                return Some(wf.core.status);
            }
            if let Some(task) = wf.tasks.iter().find(|t| t.id() == id) {
                return Some(task.core.status);
            }
        }
        None
    }

    fn status_snapshot(&self) -> HashMap<NodeId, Status> {
        let mut map = HashMap::new();
        for wf in &self.workflows {
            map.insert(wf.id(), wf.core.status);
            for task in &wf.tasks {
                map.insert(task.id(), task.core.status);
            }
        }
        map
    }

    /// Poll every in-flight task, promote newly-satisfied tasks to
    /// S_READY, and fire S_OK signals for whatever just completed (spec
    /// §4.1 `check_status`).
    pub fn check_status(&mut self) -> Result<()> {
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| FlowError::Config("flow manager not built; call build() first".to_string()))?
            .as_ref();

        let mut newly_ok = Vec::new();
        for wf in &mut self.workflows {
            for task in &mut wf.tasks {
                if let Some(status) = task.poll(self.tick, manager)? {
                    self.tick += 1;
                    if status == Status::Ok {
                        newly_ok.push(task.id());
                    }
                }
            }
        }

        let snapshot = self.status_snapshot();
        for wf in &mut self.workflows {
            wf.promote_ready(self.tick, |id| snapshot.get(&id).copied());
            wf.recompute_status();
        }

        for id in newly_ok {
            self.publish(Status::Ok, id);
        }

        for wf in &self.workflows {
            if wf.is_deadlocked() {
                tracing::warn!(workflow = %wf.id(), "possible deadlock: no task ready, submitted, or running");
            }
        }

        Ok(())
    }

    /// Synchronously invoke every handler subscribed to `(signal, sender)`
    /// (spec §4.5 `publish`). A handler's own error is logged and does not
    /// stop sibling handlers from running.
    pub fn publish(&mut self, signal: Status, sender: NodeId) {
        for handler in self.bus.live_receivers(signal, sender) {
            let outcome = match handler {
                Handler::WorkflowOnOk(wf_id) => self.dispatch_workflow_on_ok(wf_id),
                Handler::FlowOnDepOk => self.on_dep_ok(sender),
            };
            if let Err(err) = outcome {
                tracing::warn!(%sender, ?signal, error = %err, "signal handler failed");
            }
        }
    }

    fn dispatch_workflow_on_ok(&mut self, wf_id: NodeId) -> Result<()> {
        let Some(idx) = self.workflows.iter().position(|w| w.id() == wf_id) else {
            return Ok(());
        };
        let (_, fired) = self.workflows[idx].on_ok(self.tick);
        self.tick += 1;
        if fired {
            self.publish(Status::Ok, wf_id);
        }
        Ok(())
    }

    /// `on_dep_ok(signal, sender)` (spec §4.4): run every not-yet-disabled
    /// callback whose dependency set is now fully satisfied, in
    /// registration order.
    fn on_dep_ok(&mut self, sender: NodeId) -> Result<()> {
        let snapshot = self.status_snapshot();
        let ready_indices: Vec<usize> = self
            .callbacks
            .iter()
            .enumerate()
            .filter(|(_, cb)| cb.deps.contains(&sender) && cb.ready(|id| snapshot.get(&id).copied()))
            .map(|(i, _)| i)
            .collect();

        for idx in ready_indices {
            let (key, work_id, user_data) = {
                let cb = &self.callbacks[idx];
                (cb.key.clone(), cb.workflow, cb.user_data.clone())
            };
            let f = self.callback_registry.get(&key)?;
            f(self, work_id, &user_data)?;
            self.callbacks[idx].disabled = true;
        }
        Ok(())
    }

    pub fn cpu_report(&self) -> CpuReport {
        let mut report = CpuReport::default();
        for wf in &self.workflows {
            for task in &wf.tasks {
                match task.core.status {
                    Status::Sub => {
                        report.reserved += task.ncpus;
                        report.allocated += task.ncpus;
                    }
                    Status::Run => {
                        report.allocated += task.ncpus;
                        report.inuse += task.ncpus;
                    }
                    _ => {}
                }
            }
        }
        report
    }

    fn run_iterative_workflow(&mut self, idx: usize) -> Result<()> {
        let mut wf = std::mem::replace(&mut self.workflows[idx], Workflow::new(NodeId(0)));
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| FlowError::Config("flow manager not built".to_string()))?
            .as_ref();
        let exit_rules = &self.exit_rules;
        let tick = &mut self.tick;
        let next_id = &mut self.next_id;
        let result = wf.submit_tasks_iterative(tick, manager, exit_rules, || {
            *next_id += 1;
            NodeId(*next_id)
        });
        self.workflows[idx] = wf;
        result
    }

    /// Drive the flow to completion: build, then repeatedly poll and
    /// submit until nothing more can progress (spec §5's single-threaded
    /// cooperative driver). Iterative workflows run their whole loop in
    /// one step since their internal submission policy is inherently
    /// sequential.
    pub fn run(&mut self) -> Result<()> {
        self.allocate()?;
        self.build()?;

        loop {
            self.check_status()?;

            let mut made_progress = false;
            // Pending work that might still resolve on a later tick. A
            // workflow that is advisory-deadlocked, or an iterative
            // workflow whose own dependency already failed, is excluded —
            // spec §5/§8 makes deadlock detection advisory only ("the
            // caller must break out"), so the driver has to recognize
            // "stuck forever" and stop rather than spin.
            let mut any_recoverable_pending = false;

            for idx in 0..self.workflows.len() {
                if matches!(self.workflows[idx].kind, WorkflowKind::Iterative(_))
                    && self.workflows[idx].tasks.is_empty()
                {
                    let snapshot = self.status_snapshot();
                    if self.workflows[idx].deps_satisfied(|id| snapshot.get(&id).copied()) {
                        self.run_iterative_workflow(idx)?;
                        self.workflows[idx].recompute_status();
                        made_progress = true;
                    } else {
                        let blocked = self.workflows[idx].core.deps.iter().any(|d| {
                            snapshot.get(&d.upstream).copied().unwrap_or(Status::Init).is_failure()
                        });
                        if !blocked {
                            any_recoverable_pending = true;
                        }
                    }
                    continue;
                }

                match self.workflows[idx].fetch_task_to_run() {
                    FetchOutcome::Ready(task_id) => {
                        self.launch_one(idx, task_id)?;
                        made_progress = true;
                    }
                    FetchOutcome::Pending => {
                        if !self.workflows[idx].is_deadlocked() {
                            any_recoverable_pending = true;
                        }
                    }
                    FetchOutcome::AllDone => {}
                }
            }

            self.dispatch_pending_finalizations()?;

            if !made_progress && !any_recoverable_pending {
                break;
            }
            if !made_progress {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(())
    }

    fn launch_one(&mut self, workflow_idx: usize, task_id: NodeId) -> Result<()> {
        let wf = &mut self.workflows[workflow_idx];
        let task_idx = wf
            .tasks
            .iter()
            .position(|t| t.id() == task_id)
            .ok_or_else(|| FlowError::Config(format!("task {task_id} not found for launch")))?;
        if wf.tasks[task_idx].workdir.is_none() {
            wf.allocate()?;
        }
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| FlowError::Config("flow manager not built".to_string()))?
            .as_ref();
        wf.tasks[task_idx].launch(self.tick, manager)?;
        self.tick += 1;
        Ok(())
    }

    /// Any workflow whose tasks are all S_OK but that hasn't yet published
    /// its own S_OK needs `on_ok` run explicitly — this covers the case
    /// where a workflow's last task finished in the same `check_status`
    /// pass that already dispatched its signal (normal path), as well as
    /// workflows built with zero tasks from the start.
    fn dispatch_pending_finalizations(&mut self) -> Result<()> {
        let ids: Vec<NodeId> = self
            .workflows
            .iter()
            .filter(|wf| !wf.core.finalized && matches!(wf.fetch_task_to_run(), FetchOutcome::AllDone))
            .map(|wf| wf.id())
            .collect();
        for id in ids {
            self.dispatch_workflow_on_ok(id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmanager::ScriptedOutcome;

    fn mk_flow(dir: &std::path::Path) -> Flow {
        Flow::new(dir.to_path_buf(), ManagerConfig { workers: 2 })
    }

    #[test]
    fn e1_linear_chain_submits_in_order_and_finalizes_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = mk_flow(dir.path());

        let id1 = flow.alloc_id();
        let id2 = flow.alloc_id();
        let mut wf = Workflow::new(flow.alloc_id());
        wf.register(id1, serde_json::Value::Null, Vec::new(), vec!["DEN"], 1);
        wf.register(
            id2,
            serde_json::Value::Null,
            vec![Dependency::new(id1, ["DEN"])],
            Vec::<String>::new(),
            1,
        );
        flow.register_work(wf, Vec::new()).unwrap();

        flow.run().unwrap();

        assert_eq!(flow.status_of(id1), Some(Status::Ok));
        assert_eq!(flow.status_of(id2), Some(Status::Ok));
        let wf = &flow.workflows[0];
        assert!(wf.core.finalized);
        assert_eq!(wf.core.status, Status::Ok);
    }

    #[test]
    fn e6_terminal_failure_blocks_downstream_and_never_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = mk_flow(dir.path());

        let id1 = flow.alloc_id();
        let id2 = flow.alloc_id();
        let mut wf = Workflow::new(flow.alloc_id());
        wf.register(id1, serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        wf.register(
            id2,
            serde_json::Value::Null,
            vec![Dependency::new(id1, ["DEN"])],
            Vec::<String>::new(),
            1,
        );
        wf.tasks[0].scripted = ScriptedOutcome { succeed: false };
        flow.register_work(wf, Vec::new()).unwrap();

        flow.run().unwrap();

        assert_eq!(flow.status_of(id1), Some(Status::Error));
        assert_eq!(flow.status_of(id2), Some(Status::Init));
        assert!(!flow.workflows[0].core.finalized);
    }

    #[test]
    fn cpu_report_counts_reserved_allocated_inuse() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = mk_flow(dir.path());
        let id1 = flow.alloc_id();
        let mut wf = Workflow::new(flow.alloc_id());
        wf.register(id1, serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 4);
        wf.tasks[0].core.status = Status::Run;
        flow.register_work(wf, Vec::new()).unwrap();

        let report = flow.cpu_report();
        assert_eq!(report.inuse, 4);
        assert_eq!(report.allocated, 4);
        assert_eq!(report.reserved, 0);
    }

    #[test]
    fn e5_callback_fires_once_and_populates_downstream_workflow() {
        fn synth(flow: &mut Flow, work_id: NodeId, _user_data: &serde_json::Value) -> Result<()> {
            let id = flow.alloc_id();
            let idx = flow.workflows.iter().position(|w| w.id() == work_id).unwrap();
            flow.workflows[idx].register(id, serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
            Ok(())
        }

        let dir = tempfile::tempdir().unwrap();
        let mut flow = mk_flow(dir.path());
        flow.register_callback_fn("synth", synth);

        let upstream_id = flow.alloc_id();
        let mut upstream = Workflow::new(flow.alloc_id());
        upstream.register(upstream_id, serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        flow.register_work(upstream, Vec::new()).unwrap();

        let cb_work = flow.register_callback("synth", vec![upstream_id], serde_json::Value::Null).unwrap();

        flow.run().unwrap();

        assert_eq!(flow.status_of(upstream_id), Some(Status::Ok));
        assert!(flow.callbacks[0].disabled);
        let idx = flow.workflows.iter().position(|w| w.id() == cb_work).unwrap();
        assert_eq!(flow.workflows[idx].tasks.len(), 1);
    }
}
