//! Error types for the XA coordinator
//!
//! Client-facing errors follow the X/Open mnemonic taxonomy: `XAER_*` for
//! protocol violations, `XA_RB*` for branches the resource manager rolled
//! back, plus the transient retry advice used when the commit metadata lock
//! cannot be acquired.

use tandem_common::RmCode;
use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, XaError>;

/// Errors surfaced by XA command handlers and crash recovery
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum XaError {
    /// The command cannot run while the branch is in this state.
    #[error("XAER_RMFAIL: the command cannot be executed when global transaction is in the {state} state")]
    RmFail { state: &'static str },

    /// Unknown XID.
    #[error("XAER_NOTA: unknown XID")]
    Nota,

    /// The XID is already known to the transaction cache.
    #[error("XAER_DUPID: the XID already exists")]
    DupId,

    /// Invalid option or forbidden byte in the XID.
    #[error("XAER_INVAL: invalid arguments (or unsupported command)")]
    Inval,

    /// XA START attempted inside another transaction or under LOCK TABLES.
    #[error("XAER_OUTSIDE: some work is done outside global transaction")]
    Outside,

    /// A resource manager failed; data consistency must be checked.
    #[error("XAER_RMERR: fatal error occurred in the transaction branch - check your data for consistency")]
    RmError,

    /// The branch was rolled back by a resource manager.
    #[error("XA_RBROLLBACK: transaction branch was rolled back")]
    RbRollback,

    /// The branch was rolled back after a lock wait timeout.
    #[error("XA_RBTIMEOUT: transaction branch was rolled back: took too long")]
    RbTimeout,

    /// The branch was rolled back to break a deadlock.
    #[error("XA_RBDEADLOCK: transaction branch was rolled back: deadlock was detected")]
    RbDeadlock,

    /// The commit metadata lock could not be acquired in time; the branch
    /// is unchanged and the statement can simply be retried.
    #[error("the prepared transaction could not acquire the commit lock, please retry")]
    Retry,

    /// Empty XA branches are not allowed on a replication applier.
    #[error("an empty XA transaction is not allowed on a replication applier session")]
    ReplicationFilters,

    /// Heuristic recovery by rollback is unsafe with several two-phase
    /// capable engines.
    #[error("heuristic recover by rollback requires a single two-phase-commit capable engine")]
    NoMulti2pcHeuristicRecover,

    /// Internal prepared transactions were found while recovery was
    /// disabled; startup must not continue.
    #[error("found {count} prepared internal transaction(s); run the server with recovery enabled against {log_file}")]
    InternalXidsFound { count: usize, log_file: String },

    /// The startup scan itself failed; the server must not start.
    #[error("crash recovery failed: {reason}")]
    RecoveryFailed { reason: String },
}

impl XaError {
    /// Map a resource-manager error classification to the rollback-only
    /// error the client sees.
    pub fn rollback_error(code: RmCode) -> Self {
        match code {
            RmCode::LockWaitTimeout => XaError::RbTimeout,
            RmCode::Deadlock => XaError::RbDeadlock,
            RmCode::Other(_) => XaError::RbRollback,
        }
    }
}
