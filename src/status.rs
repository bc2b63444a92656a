// Licensed under the MIT License

//! The node status lifecycle (spec §4.1).
//!
//! Variant declaration order is the total order: `Init < Locked < Ready <
//! Sub < Run < Done < Error < Unconverged < Ok`. Derived `Ord` walks
//! variants in declaration order, so this file *is* the ordering — don't
//! reorder the variants without checking every place that relies on `min()`
//! aggregation or `<`/`>=` comparisons against a specific status.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Constructed, not yet buildable.
    Init,
    /// Held pending an external condition (reserved for future use).
    Locked,
    /// All dependencies satisfied; may be submitted.
    Ready,
    /// Submitted to the TaskManager; CPUs reserved.
    Sub,
    /// Actively executing; CPUs in use.
    Run,
    /// Process exited; outcome not yet classified.
    Done,
    /// Terminal failure.
    Error,
    /// Terminal-but-recoverable non-convergence.
    Unconverged,
    /// Success; outputs visible in `outdir`.
    Ok,
}

impl Status {
    /// Terminal statuses never progress further under normal operation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Ok | Status::Error | Status::Unconverged)
    }

    /// `S_ERROR` and `S_UNCONVERGED` both block workflow finalization but
    /// are not in-flight; `is_terminal() && !is_ok()`.
    pub fn is_failure(self) -> bool {
        matches!(self, Status::Error | Status::Unconverged)
    }
}

impl Default for Status {
    fn default() -> Self {
        Status::Init
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Init => "S_INIT",
            Status::Locked => "S_LOCKED",
            Status::Ready => "S_READY",
            Status::Sub => "S_SUB",
            Status::Run => "S_RUN",
            Status::Done => "S_DONE",
            Status::Error => "S_ERROR",
            Status::Unconverged => "S_UNCONVERGED",
            Status::Ok => "S_OK",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_matches_spec() {
        assert!(Status::Init < Status::Locked);
        assert!(Status::Locked < Status::Ready);
        assert!(Status::Ready < Status::Sub);
        assert!(Status::Sub < Status::Run);
        assert!(Status::Run < Status::Done);
        assert!(Status::Done < Status::Error);
        assert!(Status::Error < Status::Unconverged);
        assert!(Status::Unconverged < Status::Ok);
    }

    #[test]
    fn terminal_classification() {
        assert!(Status::Ok.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(Status::Unconverged.is_terminal());
        assert!(!Status::Run.is_terminal());
        assert!(Status::Error.is_failure());
        assert!(!Status::Ok.is_failure());
    }

    #[test]
    fn min_aggregation_picks_worst_in_progress_status() {
        let v = vec![Status::Ok, Status::Run, Status::Ready];
        assert_eq!(v.into_iter().min().unwrap(), Status::Ready);
    }
}
