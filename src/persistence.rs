// Licensed under the MIT License

//! Snapshot and restore of an entire [`Flow`] (spec §4.6).
//!
//! The canonical file is `flow.workdir/__workflow__.pickle` — kept as a
//! literal name even though the payload is `bincode`, not a Python pickle,
//! so the filesystem layout in spec §6 stays recognizable. A crash between
//! "dump begin" and "dump complete" must never leave a truncated file
//! visible under that name: we serialize to a sibling temp file in the same
//! directory (so the final rename is same-filesystem and atomic), and keep
//! one prior copy (`__workflow__.pickle.bak`) so a failed rename can be
//! rolled back rather than leaving the canonical path missing or partial.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{FlowError, Result};
use crate::flow::Flow;

pub const SNAPSHOT_FILE_NAME: &str = "__workflow__.pickle";

pub fn snapshot_path(workdir: &Path) -> PathBuf {
    workdir.join(SNAPSHOT_FILE_NAME)
}

fn backup_path(canonical: &Path) -> PathBuf {
    let mut name = canonical.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

/// Serialize `flow` to `flow.workdir/__workflow__.pickle`, atomically.
///
/// On any failure the in-memory flow is untouched (nothing here mutates
/// `flow`) and the canonical file, if it already existed, is left exactly
/// as it was (spec §7 `PersistenceError`: "the in-memory flow is untouched
/// on write failure").
pub fn dump(flow: &Flow) -> Result<()> {
    let workdir = &flow.workdir;
    fs::create_dir_all(workdir)?;
    let canonical = snapshot_path(workdir);

    let mut tmp = tempfile::NamedTempFile::new_in(workdir)
        .map_err(|e| FlowError::Persistence(format!("cannot create temp snapshot file: {e}")))?;
    bincode::serialize_into(&mut tmp, flow)
        .map_err(|e| FlowError::Persistence(format!("failed to serialize flow: {e}")))?;
    tmp.as_file_mut()
        .flush()
        .map_err(|e| FlowError::Persistence(format!("failed to flush temp snapshot file: {e}")))?;
    tmp.as_file_mut()
        .sync_all()
        .map_err(|e| FlowError::Persistence(format!("failed to fsync temp snapshot file: {e}")))?;

    let backup = backup_path(&canonical);
    let had_prior = canonical.exists();
    if had_prior {
        fs::copy(&canonical, &backup)
            .map_err(|e| FlowError::Persistence(format!("failed to snapshot prior copy: {e}")))?;
    }

    match tmp.persist(&canonical) {
        Ok(_) => {
            if had_prior {
                let _ = fs::remove_file(&backup);
            }
            Ok(())
        }
        Err(persist_err) => {
            // Rename failed; canonical (if it existed) is untouched by a
            // failed rename, but restore explicitly from the backup in
            // case a partial write ever got this far on a platform without
            // atomic same-directory rename.
            if had_prior {
                let _ = fs::copy(&backup, &canonical);
                let _ = fs::remove_file(&backup);
            }
            Err(FlowError::Persistence(format!(
                "failed to atomically replace `{}`: {}",
                canonical.display(),
                persist_err.error
            )))
        }
    }
}

/// Reconstruct a [`Flow`] from `flow.workdir/__workflow__.pickle` and
/// rewire its in-memory signal bus (spec §4.6 `load`: "must call
/// `connect_signals()`... subscriptions are not part of the snapshot").
///
/// The returned flow has no task manager yet and an empty callback/exit-rule
/// registry — the caller must re-register the same callback and exit-rule
/// keys it used before snapshotting (spec §9: callbacks round-trip as
/// `(registry_key, user_data)`, not as code), then call [`Flow::build`].
pub fn load(workdir: &Path) -> Result<Flow> {
    let canonical = snapshot_path(workdir);
    let file = fs::File::open(&canonical)
        .map_err(|e| FlowError::Persistence(format!("cannot open `{}`: {e}", canonical.display())))?;
    let mut flow: Flow = bincode::deserialize_from(file)
        .map_err(|e| FlowError::Persistence(format!("cannot deserialize `{}`: {e}", canonical.display())))?;
    flow.connect_signals();
    Ok(flow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taskmanager::ManagerConfig;

    #[test]
    fn round_trip_preserves_ids_edges_and_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = Flow::new(dir.path().to_path_buf(), ManagerConfig { workers: 1 });
        let id1 = flow.alloc_id();
        let mut wf = crate::workflow::Workflow::new(flow.alloc_id());
        wf.register(id1, serde_json::Value::Null, Vec::new(), vec!["DEN"], 2);
        wf.tasks[0].core.status = crate::status::Status::Ok;
        flow.register_work(wf, Vec::new()).unwrap();

        dump(&flow).unwrap();
        assert!(snapshot_path(dir.path()).exists());

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.workflows.len(), 1);
        assert_eq!(loaded.workflows[0].tasks[0].id(), id1);
        assert_eq!(loaded.workflows[0].tasks[0].core.status, crate::status::Status::Ok);
        assert_eq!(loaded.workdir, flow.workdir);
    }

    #[test]
    fn dump_leaves_no_temp_file_behind_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let flow = Flow::new(dir.path().to_path_buf(), ManagerConfig { workers: 1 });
        dump(&flow).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n != SNAPSHOT_FILE_NAME)
            .collect();
        assert!(leftovers.is_empty(), "unexpected leftovers: {leftovers:?}");
    }

    #[test]
    fn second_dump_overwrites_without_leaving_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut flow = Flow::new(dir.path().to_path_buf(), ManagerConfig { workers: 1 });
        dump(&flow).unwrap();
        flow.alloc_id();
        dump(&flow).unwrap();

        let backup = backup_path(&snapshot_path(dir.path()));
        assert!(!backup.exists());
    }
}
