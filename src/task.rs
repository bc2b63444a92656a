// Licensed under the MIT License

//! `Task`: the leaf unit of work (spec §3, §4.1).
//!
//! A real task kind (Scf, Nscf, HaydockBse, ...) differs from another only
//! in which `Strategy` it accepts and which output tags it produces; per
//! spec §9 we model that as data (an opaque `input` value plus a
//! `produces` tag list) rather than a type per task kind, so the scheduler
//! can treat every task uniformly.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::node::{Dependency, NodeCore, NodeId, NodeKind};
use crate::status::Status;
use crate::taskmanager::{PollOutcome, ScriptedOutcome, TaskManager};

/// Classification of a manager's exit code into a terminal status. `0` is
/// success, `2` is the conventional "ran fine but did not converge" code,
/// anything else is a hard failure. A domain-specific `TaskManager` is free
/// to return outcomes that never hit the `2` case if convergence isn't a
/// concept it has.
fn classify_returncode(returncode: i32) -> Status {
    match returncode {
        0 => Status::Ok,
        2 => Status::Unconverged,
        _ => Status::Error,
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Task {
    pub core: NodeCore,
    /// Index within the owning workflow; stable for the task's lifetime
    /// (spec §3, "position in the sequence is a stable task index").
    pub index: usize,
    pub workdir: Option<PathBuf>,
    /// Opaque rendered strategy or raw input deck (spec §3: "Input may be
    /// either a rendered strategy or a raw input deck").
    pub input: serde_json::Value,
    /// Extension tags this task writes to its `outdir` on success.
    pub produces: BTreeSet<String>,
    pub ncpus: u32,
    pub scripted: ScriptedOutcome,
}

impl Task {
    pub fn new(
        id: NodeId,
        index: usize,
        input: serde_json::Value,
        deps: Vec<Dependency>,
        produces: impl IntoIterator<Item = impl Into<String>>,
        ncpus: u32,
    ) -> Self {
        let mut core = NodeCore::new(id, NodeKind::Task);
        core.deps = deps;
        Task {
            core,
            index,
            workdir: None,
            input,
            produces: produces.into_iter().map(Into::into).collect(),
            ncpus,
            scripted: ScriptedOutcome::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.core.id
    }

    /// Bind (or re-bind) this task's working directory. A rebind to the
    /// same path is a no-op; a rebind to a different path is a
    /// `ConfigError`, mirroring the workflow-level invariant in spec §3.
    pub fn set_workdir(&mut self, path: PathBuf) -> Result<()> {
        match &self.workdir {
            Some(existing) if *existing == path => Ok(()),
            Some(existing) => Err(FlowError::Config(format!(
                "task {} workdir already bound to `{}`, cannot rebind to `{}`",
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

    /// Create `indata/`, `outdata/`, `tmpdata/` under this task's workdir.
    pub fn build(&self) -> Result<()> {
        for dir in [self.indir(), self.outdir(), self.tmpdir()].into_iter().flatten() {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Submit this task to `manager`, transitioning S_READY -> S_SUB.
    pub fn launch(&mut self, tick: u64, manager: &dyn TaskManager) -> Result<()> {
        if self.core.status != Status::Ready {
            return Err(FlowError::Config(format!(
                "task {} launched from status {}, expected S_READY",
                self.core.id, self.core.status
            )));
        }
        manager.launch(self.core.id, self.scripted)?;
        self.core.status = Status::Sub;
        self.core.record(tick, "submitted");
        Ok(())
    }

    /// Poll the manager and advance local status. Returns the new status
    /// if a transition occurred, so the caller (the owning `Workflow`, via
    /// `Flow::check_status`) knows whether to publish a signal.
    pub fn poll(&mut self, tick: u64, manager: &dyn TaskManager) -> Result<Option<Status>> {
        if !matches!(self.core.status, Status::Sub | Status::Run) {
            return Ok(None);
        }

        match manager.poll(self.core.id)? {
            PollOutcome::Running => {
                if self.core.status == Status::Sub {
                    self.core.status = Status::Run;
                    self.core.record(tick, "running");
                    Ok(Some(Status::Run))
                } else {
                    Ok(None)
                }
            }
            PollOutcome::Done { returncode } => {
                self.core.status = Status::Done;
                self.core.record(tick, format!("exited with code {returncode}"));
                let terminal = classify_returncode(returncode);
                self.core.status = terminal;
                self.core
                    .record(tick, format!("classified as {terminal}"));

                if terminal == Status::Ok {
                    self.materialize_outputs()?;
                    self.core.finalized = true;
                }

                Ok(Some(terminal))
            }
        }
    }

    /// Touch one empty file per declared output tag in `outdir`, so that
    /// dependency resolution (`Flow::resolve_output`) has something real to
    /// find. A real `TaskManager`/`Strategy` pair would have actually
    /// written these during the external job; this reference path exists
    /// because that collaborator is out of scope here.
    fn materialize_outputs(&self) -> Result<()> {
        let Some(outdir) = self.outdir() else {
            return Ok(());
        };
        fs::create_dir_all(&outdir)?;
        for ext in &self.produces {
            let path = outdir.join(format!("run.{ext}"));
            fs::write(path, [])?;
        }
        Ok(())
    }

    /// Locate the first file in `outdir` whose extension matches `ext`
    /// case-insensitively (spec §6 lookup policy).
    pub fn find_output(&self, ext: &str) -> Result<PathBuf> {
        let outdir = self.outdir().ok_or_else(|| {
            FlowError::Config(format!("task {} has no workdir/outdir yet", self.core.id))
        })?;
        find_by_extension(&outdir, ext).ok_or_else(|| FlowError::Dependency {
            upstream: self.core.id,
            ext: ext.to_string(),
            outdir,
        })
    }
}

pub(crate) fn find_by_extension(dir: &Path, ext: &str) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(file_ext) = path.extension().and_then(|e| e.to_str()) {
            if file_ext.eq_ignore_ascii_case(ext) {
                return Some(path);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmanager::{ManagerConfig, ThreadPoolTaskManager};
    use tempfile::tempdir;

    fn mk_task(id: u64, produces: &[&str]) -> Task {
        Task::new(
            NodeId(id),
            0,
            serde_json::json!({"deck": "dummy"}),
            Vec::new(),
            produces.to_vec(),
            1,
        )
    }

    #[test]
    fn rebinding_workdir_to_same_path_is_noop() {
        let mut t = mk_task(1, &[]);
        let p = PathBuf::from("/tmp/wf/task_0");
        t.set_workdir(p.clone()).unwrap();
        t.set_workdir(p).unwrap();
    }

    #[test]
    fn rebinding_workdir_to_different_path_errors() {
        let mut t = mk_task(1, &[]);
        t.set_workdir(PathBuf::from("/tmp/a")).unwrap();
        assert!(t.set_workdir(PathBuf::from("/tmp/b")).is_err());
    }

    #[test]
    fn successful_run_materializes_declared_outputs_and_finalizes() {
        let dir = tempdir().unwrap();
        let mut t = mk_task(1, &["DEN"]);
        t.set_workdir(dir.path().join("task_0")).unwrap();
        t.build().unwrap();
        t.core.status = Status::Ready;

        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 1 });
        t.launch(0, &mgr).unwrap();
        let status = loop {
            if let Some(s) = t.poll(1, &mgr).unwrap() {
                if s.is_terminal() {
                    break s;
                }
            }
        };

        assert_eq!(status, Status::Ok);
        assert!(t.core.finalized);
        assert!(t.find_output("DEN").is_ok());
    }

    #[test]
    fn failing_run_does_not_materialize_outputs() {
        let dir = tempdir().unwrap();
        let mut t = mk_task(1, &["DEN"]);
        t.scripted = ScriptedOutcome { succeed: false };
        t.set_workdir(dir.path().join("task_0")).unwrap();
        t.build().unwrap();
        t.core.status = Status::Ready;

        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 1 });
        t.launch(0, &mgr).unwrap();
        let status = loop {
            if let Some(s) = t.poll(1, &mgr).unwrap() {
                if s.is_terminal() {
                    break s;
                }
            }
        };

        assert_eq!(status, Status::Error);
        assert!(t.find_output("DEN").is_err());
    }
}
