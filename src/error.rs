// Licensed under the MIT License

//! Error kinds for the engine, per the error-handling design: one
//! `thiserror`-derived enum covering every library-level failure, with
//! `anyhow` reserved for the CLI boundary.

use std::path::PathBuf;

use crate::node::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Invalid construction: rebinding a workdir to a different path,
    /// registering a callback with no dependencies, resolving an unknown
    /// node id, etc.
    #[error("config error: {0}")]
    Config(String),

    /// A referenced upstream output tag is not present when queried.
    #[error("dependency error: node {upstream:?} has no output tagged `{ext}` in `{}`", outdir.display())]
    Dependency {
        upstream: NodeId,
        ext: String,
        outdir: PathBuf,
    },

    /// A task ended in S_ERROR; the owning workflow cannot finalize.
    #[error("task {0:?} failed (S_ERROR)")]
    TerminalTaskFailure(NodeId),

    /// A task ended in S_UNCONVERGED; treated like failure for finalization.
    #[error("task {0:?} did not converge (S_UNCONVERGED)")]
    NonConvergence(NodeId),

    /// Snapshot write or load failed. The in-memory flow is left untouched
    /// when this occurs during a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;
