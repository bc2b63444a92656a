// Licensed under the MIT License

//! `latticeflow`: a dependency-aware execution engine for DAGs of external
//! scientific-compute jobs.
//!
//! The crate is organized leaves-first, mirroring spec §2's component
//! table: [`node`] and [`status`] are shared by everything schedulable,
//! [`signal`] is the pub/sub bus connecting them, [`task`] and
//! [`taskmanager`] are the leaf unit of work and its external runner,
//! [`workflow`] aggregates tasks, [`callback`] is the deferred-synthesis
//! mechanism, [`flow`] is the top-level container, and [`persistence`] is
//! the snapshot/resume protocol that ties a `Flow` to disk.

pub mod callback;
pub mod config;
pub mod error;
pub mod node;
pub mod persistence;
pub mod signal;
pub mod status;
pub mod task;
pub mod taskmanager;
pub mod workflow;

pub mod flow;

pub use error::{FlowError, Result};
pub use flow::Flow;
pub use node::NodeId;
pub use status::Status;
