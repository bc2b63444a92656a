// Licensed under the MIT License

//! `TaskManager`: the external process-runner interface (spec §6) and the
//! one reference implementation the crate ships, `ThreadPoolTaskManager`.
//!
//! The real collaborator — an actual queue submission system or subprocess
//! launcher — is out of scope; internals of *how* a job runs are the
//! caller's business. What we own is the bookkeeping contract: `launch`
//! starts a job identified by `NodeId`, `poll`/`wait` observe it, and
//! `tot_ncpus` answers how many CPUs the manager will account against it.
//! The reference implementation runs jobs on a shared [`threadpool::ThreadPool`]
//! and hands results back over an `mpsc` channel per task, mirroring this
//! crate's own `texworker`-style subprocess-driving pattern (one thread per
//! in-flight job, results collected by the driver via non-blocking `poll`).

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::node::NodeId;

/// Deterministic, serializable stand-in for "the outcome an external job
/// will have". A real `TaskManager` would instead inspect the launched
/// process; this lets tests and demos script task outcomes without forking
/// real subprocesses, while still round-tripping through a snapshot (unlike
/// a live process handle, which spec §4.6 calls out as inherently
/// unpicklable state).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ScriptedOutcome {
    pub succeed: bool,
}

impl Default for ScriptedOutcome {
    fn default() -> Self {
        ScriptedOutcome { succeed: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    Running,
    Done { returncode: i32 },
}

/// `deepcopy`, `launch`, `wait`, `poll`, `tot_ncpus` — spec §6's
/// `TaskManager` contract verbatim.
pub trait TaskManager: std::fmt::Debug + Send + Sync {
    fn deepcopy(&self) -> Box<dyn TaskManager>;
    fn launch(&self, id: NodeId, outcome: ScriptedOutcome) -> Result<()>;
    fn wait(&self, id: NodeId) -> Result<i32>;
    fn poll(&self, id: NodeId) -> Result<PollOutcome>;
    fn tot_ncpus(&self, requested: u32) -> u32;
}

/// Serializable description of a manager, used to reconstruct a live
/// `Box<dyn TaskManager>` after loading a snapshot — the trait object
/// itself cannot be serialized, only its configuration can (spec §4.6: any
/// component with unpicklable state must be rebuildable from pickled state
/// alone).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub workers: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            workers: num_cpus::get().max(1),
        }
    }
}

impl ManagerConfig {
    pub fn build(&self) -> Box<dyn TaskManager> {
        Box::new(ThreadPoolTaskManager::new(*self))
    }
}

#[derive(Debug)]
pub struct ThreadPoolTaskManager {
    config: ManagerConfig,
    pool: threadpool::ThreadPool,
    pending: Mutex<HashMap<NodeId, mpsc::Receiver<i32>>>,
    finished: Mutex<HashMap<NodeId, i32>>,
}

impl ThreadPoolTaskManager {
    pub fn new(config: ManagerConfig) -> Self {
        ThreadPoolTaskManager {
            pool: threadpool::ThreadPool::new(config.workers.max(1)),
            config,
            pending: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }
}

impl TaskManager for ThreadPoolTaskManager {
    fn deepcopy(&self) -> Box<dyn TaskManager> {
        Box::new(ThreadPoolTaskManager::new(self.config))
    }

    fn launch(&self, id: NodeId, outcome: ScriptedOutcome) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.pending.lock().unwrap().insert(id, rx);
        self.pool.execute(move || {
            let returncode = if outcome.succeed { 0 } else { 1 };
            // A `Disconnected` send here would mean the receiving side was
            // dropped without ever polling; nothing useful to do about it.
            let _ = tx.send(returncode);
        });
        Ok(())
    }

    fn poll(&self, id: NodeId) -> Result<PollOutcome> {
        if let Some(rc) = self.finished.lock().unwrap().get(&id) {
            return Ok(PollOutcome::Done { returncode: *rc });
        }

        let mut pending = self.pending.lock().unwrap();
        let Some(rx) = pending.get(&id) else {
            return Err(FlowError::Config(format!(
                "poll() on task {id} that was never launched"
            )));
        };

        match rx.try_recv() {
            Ok(returncode) => {
                pending.remove(&id);
                self.finished.lock().unwrap().insert(id, returncode);
                Ok(PollOutcome::Done { returncode })
            }
            Err(mpsc::TryRecvError::Empty) => Ok(PollOutcome::Running),
            Err(mpsc::TryRecvError::Disconnected) => Err(FlowError::Config(format!(
                "worker thread for task {id} vanished without a result"
            ))),
        }
    }

    fn wait(&self, id: NodeId) -> Result<i32> {
        loop {
            match self.poll(id)? {
                PollOutcome::Done { returncode } => return Ok(returncode),
                PollOutcome::Running => std::thread::sleep(Duration::from_millis(1)),
            }
        }
    }

    fn tot_ncpus(&self, requested: u32) -> u32 {
        requested.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_then_wait_reports_scripted_returncode() {
        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 2 });
        mgr.launch(NodeId(1), ScriptedOutcome { succeed: true }).unwrap();
        assert_eq!(mgr.wait(NodeId(1)).unwrap(), 0);

        mgr.launch(NodeId(2), ScriptedOutcome { succeed: false }).unwrap();
        assert_eq!(mgr.wait(NodeId(2)).unwrap(), 1);
    }

    #[test]
    fn poll_before_launch_is_an_error() {
        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 1 });
        assert!(mgr.poll(NodeId(99)).is_err());
    }

    #[test]
    fn deepcopy_yields_independent_tracking_state() {
        let mgr = ThreadPoolTaskManager::new(ManagerConfig { workers: 1 });
        mgr.launch(NodeId(1), ScriptedOutcome::default()).unwrap();
        let copy = mgr.deepcopy();
        // The copy has its own bookkeeping; it never saw task 1 launched.
        assert!(copy.poll(NodeId(1)).is_err());
    }
}
