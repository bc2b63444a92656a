// Licensed under the MIT License

//! `Workflow`: an ordered, insertion-indexed container of tasks (spec §3,
//! §4.2), plus `IterativeWorkflow` as a variant of the same type rather
//! than a subclass (spec §9: "model Task as a record with a variant tag
//! plus a small dispatch table, rather than deep inheritance" — the same
//! reasoning applies one level up).

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::callback::{ExitRuleKey, ExitRuleRegistry};
use crate::error::{FlowError, Result};
use crate::node::{Dependency, NodeCore, NodeId, NodeKind};
use crate::status::Status;
use crate::task::{find_by_extension, Task};
use crate::taskmanager::TaskManager;

/// Outcome of `on_ok`'s bookkeeping pass, mirroring the `{returncode,
/// message}` dict the source returns from finalization hooks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnOkResult {
    pub returncode: i32,
    pub message: String,
}

/// What `fetch_task_to_run` found (spec §4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Ready(NodeId),
    /// Nothing runnable right now, but some task is still in flight or
    /// waiting on a dependency that may yet resolve.
    Pending,
    /// Every task reached a terminal state and all of them are S_OK.
    AllDone,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterativeState {
    /// Already-generated strategy values from the producer (spec §9: a
    /// non-restartable producer is snapshotted as its already-generated
    /// list plus a cursor, not as the live generator).
    pub strategies: Vec<serde_json::Value>,
    pub cursor: usize,
    /// `<= 0` means unbounded.
    pub max_niter: i64,
    pub exit_rule: ExitRuleKey,
    pub produces: BTreeSet<String>,
    pub ncpus: u32,
    pub last_exit_data: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WorkflowKind {
    Normal,
    Iterative(IterativeState),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Workflow {
    pub core: NodeCore,
    pub workdir: Option<PathBuf>,
    pub tasks: Vec<Task>,
    pub kind: WorkflowKind,
}

impl Workflow {
    /// All upstream dependencies of this workflow itself (its inter-workflow
    /// edges, not its tasks') are at S_OK.
    pub fn deps_satisfied(&self, status_of: impl Fn(NodeId) -> Option<Status>) -> bool {
        self.core.deps_satisfied(status_of)
    }
}

impl Workflow {
    pub fn new(id: NodeId) -> Self {
        Workflow {
            core: NodeCore::new(id, NodeKind::Workflow),
            workdir: None,
            tasks: Vec::new(),
            kind: WorkflowKind::Normal,
        }
    }

    pub fn new_iterative(
        id: NodeId,
        strategies: Vec<serde_json::Value>,
        max_niter: i64,
        exit_rule: impl Into<ExitRuleKey>,
        produces: impl IntoIterator<Item = impl Into<String>>,
        ncpus: u32,
    ) -> Self {
        let mut wf = Workflow::new(id);
        wf.kind = WorkflowKind::Iterative(IterativeState {
            strategies,
            cursor: 0,
            max_niter,
            exit_rule: exit_rule.into(),
            produces: produces.into_iter().map(Into::into).collect(),
            ncpus,
            last_exit_data: None,
        });
        wf
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    pub fn set_workdir(&mut self, path: PathBuf) -> Result<()> {
        match &self.workdir {
            Some(existing) if *existing == path => Ok(()),
            Some(existing) => Err(FlowError::Config(format!(
                "workflow {} workdir already bound to `{}`, cannot rebind to `{}`",
                self.core.id,
                existing.display(),
                path.display()
            ))),
            None => {
                self.workdir = Some(path);
                Ok(())
            }
        }
    }

    pub fn indir(&self) -> Option<PathBuf> {
        self.workdir.as_ref().map(|w| w.join("indata"))
    }

    pub fn outdir(&self) -> Option<PathBuf> {
        self.workdir.as_ref().map(|w| w.join("outdata"))
    }

    pub fn tmpdir(&self) -> Option<PathBuf> {
        self.workdir.as_ref().map(|w| w.join("tmpdata"))
    }

    /// Append a task at index `len(self)`. The caller (`Flow::register`)
    /// owns the global id allocator, so `id` arrives pre-assigned.
    pub fn register(
        &mut self,
        id: NodeId,
        input: serde_json::Value,
        deps: Vec<Dependency>,
        produces: impl IntoIterator<Item = impl Into<String>>,
        ncpus: u32,
    ) -> NodeId {
        let index = self.tasks.len();
        let mut task = Task::new(id, index, input, deps, produces, ncpus);
        if let Some(wd) = &self.workdir {
            // allocate() would also do this; set it eagerly so a workflow
            // built right after registration doesn't need a separate pass.
            let _ = task.set_workdir(wd.join(format!("task_{index}")));
        }
        self.tasks.push(task);
        id
    }

    /// Assign canonical per-task workdirs to any task that doesn't have
    /// one yet (spec §4.2 `allocate`).
    pub fn allocate(&mut self) -> Result<()> {
        let Some(wd) = self.workdir.clone() else {
            return Ok(());
        };
        for (idx, task) in self.tasks.iter_mut().enumerate() {
            if task.workdir.is_none() {
                task.set_workdir(wd.join(format!("task_{idx}")))?;
            }
        }
        Ok(())
    }

    /// Create `indata/outdata/tmpdata` and recursively build every task
    /// (spec §4.2 `build`). Signal wiring (`on_ok` subscriptions) is the
    /// caller's job since the bus lives on `Flow`, not here.
    pub fn build(&self) -> Result<()> {
        for dir in [self.indir(), self.outdir(), self.tmpdir()].into_iter().flatten() {
            std::fs::create_dir_all(&dir)?;
        }
        for task in &self.tasks {
            task.build()?;
        }
        Ok(())
    }

    pub fn recompute_status(&mut self) {
        self.core.status = self
            .tasks
            .iter()
            .map(|t| t.core.status)
            .min()
            .unwrap_or(Status::Init);
    }

    /// Promote every task whose status is ≤ S_SUB and whose deps are all
    /// S_OK (per `status_of`, a flow-wide lookup) to S_READY (spec §4.1).
    pub fn promote_ready(&mut self, tick: u64, status_of: impl Fn(NodeId) -> Option<Status>) {
        for task in &mut self.tasks {
            if task.core.status <= Status::Sub && task.core.deps_satisfied(&status_of) {
                if task.core.status != Status::Ready {
                    task.core.status = Status::Ready;
                    task.core.record(tick, "ready");
                }
            }
        }
    }

    /// First S_READY task in index order, or the deadlock/all-done verdict
    /// (spec §4.2 `fetch_task_to_run`).
    pub fn fetch_task_to_run(&self) -> FetchOutcome {
        if let Some(task) = self.tasks.iter().find(|t| t.core.status == Status::Ready) {
            return FetchOutcome::Ready(task.core.id);
        }

        if !self.tasks.is_empty() && self.tasks.iter().all(|t| t.core.status == Status::Ok) {
            return FetchOutcome::AllDone;
        }

        FetchOutcome::Pending
    }

    /// True if no task is ready or in flight but some task is not yet
    /// terminal — the advisory deadlock condition of spec §4.2/§8.
    pub fn is_deadlocked(&self) -> bool {
        let any_actionable = self
            .tasks
            .iter()
            .any(|t| matches!(t.core.status, Status::Ready | Status::Sub | Status::Run));
        let any_incomplete = self.tasks.iter().any(|t| !t.core.status.is_terminal());
        !any_actionable && any_incomplete
    }

    /// `on_ok(sender)` (spec §4.2): called once every child task has
    /// published S_OK. Returns `Some` only the one time finalization
    /// actually happens, so the caller knows to publish the workflow's own
    /// S_OK.
    pub fn on_ok(&mut self, tick: u64) -> (OnOkResult, bool) {
        let all_ok = !self.tasks.is_empty() && self.tasks.iter().all(|t| t.core.status == Status::Ok);
        if !all_ok {
            return (
                OnOkResult {
                    returncode: 1,
                    message: "not all tasks at S_OK".to_string(),
                },
                false,
            );
        }
        if self.core.finalized {
            return (
                OnOkResult {
                    returncode: 0,
                    message: "already finalized".to_string(),
                },
                false,
            );
        }

        self.core.finalized = true;
        self.core.status = Status::Ok;
        self.core.record(tick, "finalized");
        (
            OnOkResult {
                returncode: 0,
                message: "all tasks ok".to_string(),
            },
            true,
        )
    }

    /// Reset one terminal task back to S_INIT for a retry, without
    /// touching the workflow's `finalized` latch. Not part of the source
    /// contract (restart is explicitly out of core scope there), but a
    /// harmless additive operation: it only ever moves a task backward
    /// from a terminal state, so it cannot violate readiness monotonicity
    /// for tasks that haven't run yet.
    pub fn restart_task(&mut self, tick: u64, index: usize) -> Result<()> {
        let task = self
            .tasks
            .get_mut(index)
            .ok_or_else(|| FlowError::Config(format!("no task at index {index}")))?;
        if !task.core.status.is_terminal() {
            return Err(FlowError::Config(format!(
                "task {} is not terminal (status {}), nothing to restart",
                task.core.id, task.core.status
            )));
        }
        task.core.status = Status::Init;
        task.core.finalized = false;
        task.core.record(tick, "restarted");
        Ok(())
    }

    /// Locate each task's output for `tag`; fails fast if any task has not
    /// reached a terminal status (spec §4.2 `read_outputs`).
    pub fn read_outputs(&self, tag: &str) -> Result<Vec<PathBuf>> {
        for task in &self.tasks {
            match task.core.status {
                Status::Error => return Err(FlowError::TerminalTaskFailure(task.core.id)),
                Status::Unconverged => return Err(FlowError::NonConvergence(task.core.id)),
                s if !s.is_terminal() => {
                    return Err(FlowError::Config(format!(
                        "task {} is not terminal, cannot read outputs yet",
                        task.core.id
                    )))
                }
                _ => {}
            }
        }
        self.tasks.iter().map(|t| t.find_output(tag)).collect()
    }

    /// Delete the workflow's workdir, optionally preserving files matching
    /// any of the `|`-separated shell wildcards in `preserve_glob` (spec
    /// §4.2 `rmtree`).
    pub fn rmtree(&self, preserve_glob: &str) -> Result<()> {
        let Some(wd) = &self.workdir else {
            return Ok(());
        };
        if !wd.exists() {
            return Ok(());
        }
        let patterns: Vec<&str> = preserve_glob.split('|').filter(|p| !p.is_empty()).collect();
        if patterns.is_empty() {
            std::fs::remove_dir_all(wd)?;
            return Ok(());
        }
        for entry in walkdir::WalkDir::new(wd).contents_first(true) {
            let entry = entry.map_err(|e| FlowError::Config(e.to_string()))?;
            let name = entry.file_name().to_string_lossy();
            if patterns.iter().any(|p| glob_match(p, &name)) {
                continue;
            }
            if entry.file_type().is_dir() {
                let _ = std::fs::remove_dir(entry.path());
            } else {
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Relocate the workdir; refuses if `dest` already exists (spec §4.2
    /// `move`).
    pub fn move_to(&mut self, dest: PathBuf) -> Result<()> {
        let Some(wd) = self.workdir.clone() else {
            return Err(FlowError::Config(format!(
                "workflow {} has no workdir to move",
                self.core.id
            )));
        };
        if dest.exists() {
            return Err(FlowError::Config(format!(
                "move destination `{}` already exists",
                dest.display()
            )));
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&wd, &dest)?;
        for (idx, task) in self.tasks.iter_mut().enumerate() {
            task.workdir = Some(dest.join(format!("task_{idx}")));
        }
        self.workdir = Some(dest);
        Ok(())
    }

    /// Pull the next strategy value from the iterative producer and
    /// register it as a new task (spec §4.3 `next_task`). Returns `None`
    /// if the producer is exhausted.
    pub fn next_task(&mut self, next_id: NodeId) -> Option<NodeId> {
        let WorkflowKind::Iterative(state) = &mut self.kind else {
            return None;
        };
        if state.cursor >= state.strategies.len() {
            return None;
        }
        let input = state.strategies[state.cursor].clone();
        let produces = state.produces.clone();
        let ncpus = state.ncpus;
        state.cursor += 1;
        Some(self.register(next_id, input, Vec::new(), produces, ncpus))
    }

    /// Default serial submission policy: start and wait on each task
    /// before moving to the next (spec §5 ordering guarantees). Stops
    /// early if a task ends in failure, since no later task's deps could
    /// ever resolve at that point.
    pub fn submit_tasks(
        &mut self,
        tick: &mut u64,
        manager: &dyn TaskManager,
        status_of: impl Fn(NodeId) -> Option<Status>,
    ) -> Result<()> {
        // Tasks finished earlier in *this* call aren't visible to the
        // caller's `status_of` until the next flow-wide `check_status`
        // pass, so track them locally too — the common chained-task case
        // (T2 depends on sibling T1) must not need a round trip through
        // the flow to see T1 just went S_OK.
        let mut completed_here: std::collections::HashMap<NodeId, Status> =
            std::collections::HashMap::new();
        for idx in 0..self.tasks.len() {
            let ready = {
                let task = &self.tasks[idx];
                if task.core.status.is_terminal() {
                    continue;
                }
                task.core.deps.iter().all(|d| {
                    completed_here
                        .get(&d.upstream)
                        .copied()
                        .or_else(|| status_of(d.upstream))
                        == Some(Status::Ok)
                })
            };
            if !ready {
                break;
            }
            self.tasks[idx].core.status = Status::Ready;
            self.tasks[idx].launch(*tick, manager)?;
            *tick += 1;
            let terminal = loop {
                if let Some(status) = self.tasks[idx].poll(*tick, manager)? {
                    *tick += 1;
                    if status.is_terminal() {
                        break status;
                    }
                } else {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            };
            completed_here.insert(self.tasks[idx].core.id, terminal);
            if terminal.is_failure() {
                break;
            }
        }
        Ok(())
    }

    /// `IterativeWorkflow::submit_tasks` (spec §4.3): one task at a time,
    /// generated lazily, bounded by `max_niter` and cut short by the exit
    /// rule.
    pub fn submit_tasks_iterative(
        &mut self,
        tick: &mut u64,
        manager: &dyn TaskManager,
        exit_rules: &ExitRuleRegistry,
        mut alloc_id: impl FnMut() -> NodeId,
    ) -> Result<()> {
        let WorkflowKind::Iterative(state) = &self.kind else {
            return Err(FlowError::Config(format!(
                "workflow {} is not iterative",
                self.core.id
            )));
        };
        let max_niter = state.max_niter;
        let exit_rule = exit_rules.get(&state.exit_rule.clone())?;

        let mut iteration: i64 = 1;
        loop {
            if max_niter > 0 && iteration > max_niter {
                break;
            }
            let id = alloc_id();
            let Some(task_id) = self.next_task(id) else {
                break;
            };
            let idx = self.tasks.iter().position(|t| t.core.id == task_id).unwrap();
            if let Some(wd) = self.workdir.clone() {
                self.tasks[idx].set_workdir(wd.join(format!("task_{idx}")))?;
                self.tasks[idx].build()?;
            }
            self.tasks[idx].core.status = Status::Ready;
            self.tasks[idx].launch(*tick, manager)?;
            *tick += 1;
            loop {
                if let Some(status) = self.tasks[idx].poll(*tick, manager)? {
                    *tick += 1;
                    if status.is_terminal() {
                        break;
                    }
                } else {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
            }

            let decision = exit_rule(iteration as usize, &self.tasks[idx]);
            if let WorkflowKind::Iterative(state) = &mut self.kind {
                state.last_exit_data = Some(decision.data.clone());
            }
            if decision.exit {
                break;
            }
            iteration += 1;
        }
        Ok(())
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            (Some(b'?'), Some(_)) => rec(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => rec(&p[1..], &t[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmanager::{ManagerConfig, ThreadPoolTaskManager};
    use tempfile::tempdir;

    fn mk_workflow(id: u64) -> Workflow {
        Workflow::new(NodeId(id))
    }

    #[test]
    fn fetch_task_to_run_prefers_lowest_index() {
        let mut wf = mk_workflow(1);
        wf.register(NodeId(2), serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        wf.register(NodeId(3), serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        wf.tasks[0].core.status = Status::Ready;
        wf.tasks[1].core.status = Status::Ready;
        assert_eq!(wf.fetch_task_to_run(), FetchOutcome::Ready(NodeId(2)));
    }

    #[test]
    fn all_done_only_when_every_task_is_ok() {
        let mut wf = mk_workflow(1);
        wf.register(NodeId(2), serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        wf.tasks[0].core.status = Status::Ok;
        assert_eq!(wf.fetch_task_to_run(), FetchOutcome::AllDone);

        wf.tasks[0].core.status = Status::Error;
        assert_eq!(wf.fetch_task_to_run(), FetchOutcome::Pending);
    }

    #[test]
    fn deadlock_detected_when_blocked_task_cannot_progress() {
        let mut wf = mk_workflow(1);
        wf.register(
            NodeId(2),
            serde_json::Value::Null,
            vec![Dependency::new(NodeId(99), ["DEN"])],
            Vec::<String>::new(),
            1,
        );
        assert!(wf.is_deadlocked());
    }

    #[test]
    fn on_ok_finalizes_exactly_once() {
        let mut wf = mk_workflow(1);
        wf.register(NodeId(2), serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        wf.tasks[0].core.status = Status::Ok;

        let (result, fired) = wf.on_ok(0);
        assert_eq!(result.returncode, 0);
        assert!(fired);
        assert!(wf.core.finalized);

        let (result, fired) = wf.on_ok(1);
        assert!(!fired);
        assert_eq!(result.message, "already finalized");
    }

    #[test]
    fn restart_task_resets_only_terminal_tasks() {
        let mut wf = mk_workflow(1);
        wf.register(NodeId(2), serde_json::Value::Null, Vec::new(), Vec::<String>::new(), 1);
        assert!(wf.restart_task(0, 0).is_err());
        wf.tasks[0].core.status = Status::Error;
        wf.restart_task(0, 0).unwrap();
        assert_eq!(wf.tasks[0].core.status, Status::Init);
    }

    #[test]
    fn read_outputs_reports_terminal_failure_kind() {
        let mut wf = mk_workflow(1);
        wf.register(NodeId(2), serde_json::Value::Null, Vec::new(), vec!["DEN"], 1);
        wf.tasks[0].core.status = Status::Error;
        assert!(matches!(
            wf.read_outputs("DEN"),
            Err(FlowError::TerminalTaskFailure(_))
        ));

        wf.tasks[0].core.status = Status::Unconverged;
        assert!(matches!(
            wf.read_outputs("DEN"),
            Err(FlowError::NonConvergence(_))
        ));
    }

    #[test]
    fn submit_tasks_runs_chain_in_order_and_stops_on_failure() {
        let dir = tempdir().unwrap();
        let mut wf = mk_workflow(1);
        wf.set_workdir(dir.path().to_path_buf()).unwrap();
        wf.register(NodeId(2), serde_json::Value::Null, Vec::new(), vec!["DEN"], 1);
        wf.register(
            NodeId(3),
            serde_json::Value::Null,
            vec![Dependency::new(NodeId(2), ["DEN"])],
            Vec::<String>::new(),
            1,
        );
        wf.tasks[1].scripted = crate::taskmanager::ScriptedOutcome { succeed: false };
        wf.allocate().unwrap();
        wf.build().unwrap();

        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 2 });
        let mut tick = 0u64;
        wf.submit_tasks(&mut tick, &mgr, |_| None).unwrap();

        assert_eq!(wf.tasks[0].core.status, Status::Ok);
        assert_eq!(wf.tasks[1].core.status, Status::Error);
    }

    #[test]
    fn glob_match_supports_star_and_question() {
        assert!(glob_match("*.log", "run.log"));
        assert!(!glob_match("*.log", "run.out"));
        assert!(glob_match("task_?", "task_0"));
    }

    #[test]
    fn e4_iterative_workflow_stops_at_exit_rule_without_touching_later_iterations() {
        use crate::callback::ExitDecision;

        fn exit_on_third(iteration: usize, _last_task: &Task) -> ExitDecision {
            ExitDecision {
                exit: iteration == 3,
                data: serde_json::json!({"iteration": iteration}),
            }
        }

        let dir = tempdir().unwrap();
        let strategies: Vec<serde_json::Value> = (0..5).map(|i| serde_json::json!({"try": i})).collect();
        let mut wf = Workflow::new_iterative(NodeId(1), strategies, 5, "exit_on_third", vec!["GSR"], 1);
        wf.set_workdir(dir.path().to_path_buf()).unwrap();

        let mut registry = ExitRuleRegistry::new();
        registry.register("exit_on_third", exit_on_third);

        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 1 });
        let mut tick = 0u64;
        let mut next_id = 1u64;
        wf.submit_tasks_iterative(&mut tick, &mgr, &registry, || {
            next_id += 1;
            NodeId(next_id)
        })
        .unwrap();

        assert_eq!(wf.tasks.len(), 3);
        assert!(wf.tasks.iter().all(|t| t.core.status == Status::Ok));
        let WorkflowKind::Iterative(state) = &wf.kind else {
            panic!("expected iterative kind");
        };
        assert_eq!(state.cursor, 3);
        assert_eq!(
            state.last_exit_data,
            Some(serde_json::json!({"iteration": 3}))
        );
    }
}
