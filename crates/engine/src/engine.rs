//! Storage engine capability trait
//!
//! Engines are polymorphic over a small capability record rather than an
//! inheritance hierarchy. All methods are synchronous and run on the
//! invoking session's thread; the coordinator never holds its cache lock
//! across any of these calls.

use tandem_common::{RmCode, XaStatus, Xid};
use thiserror::Error;

/// Error from a storage engine call on the session path.
///
/// The `kind` classification feeds the branch's `rm_error` field and
/// decides which rollback-only error the client ultimately sees.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct EngineError {
    pub kind: RmCode,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: RmCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(RmCode::Other(0), message)
    }
}

/// A table modified by a branch, recorded so recovery can reacquire
/// metadata locks for retained branches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub db: String,
    pub table: String,
}

impl TableRef {
    pub fn new(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
        }
    }
}

/// One prepared branch reported by an engine's recovery scan.
#[derive(Debug, Clone)]
pub struct RecoveredBranch {
    pub xid: Xid,
    pub mod_tables: Vec<TableRef>,
    /// Set when the engine prepared this branch as part of a one-phase
    /// commit that never finished. Only expected on the first startup of a
    /// cloned instance.
    pub one_phase_prepared: bool,
}

/// Capabilities a storage engine exposes to the XA coordinator.
pub trait StorageEngine: Send + Sync {
    /// Engine name, for logs and recovery messages.
    fn name(&self) -> &str;

    /// Whether this engine participates in two-phase commit and recovery.
    /// Engines answering false are skipped by by-xid fan-outs and by the
    /// startup scan.
    fn supports_two_phase(&self) -> bool {
        true
    }

    /// Phase one: make the branch durable and eligible for commit or
    /// rollback only.
    fn prepare(&self, xid: &Xid) -> Result<(), EngineError>;

    /// Commit a branch owned by the calling session (phase two, or the
    /// whole transaction for a one-phase commit).
    fn commit(&self, xid: &Xid) -> Result<(), EngineError>;

    /// Roll back a branch owned by the calling session.
    fn rollback(&self, xid: &Xid) -> Result<(), EngineError>;

    /// Commit a detached prepared branch by its XID. `Nota` means the
    /// branch does not exist in this engine and is not an error.
    fn commit_by_xid(&self, xid: &Xid) -> XaStatus;

    /// Roll back a detached prepared branch by its XID.
    fn rollback_by_xid(&self, xid: &Xid) -> XaStatus;

    /// List the branches this engine holds in the prepared state. Called
    /// once at startup, before client connections are accepted.
    fn recover(&self) -> Result<Vec<RecoveredBranch>, EngineError>;

    /// Whether the engine can detach its native transaction from a session,
    /// letting a prepared branch outlive the session that drove it.
    fn supports_detach(&self) -> bool {
        false
    }

    /// Detach the engine-side transaction of `xid` from its session.
    fn detach_native_transaction(&self, _xid: &Xid) {}

    /// Restore the previously detached engine-side transaction.
    fn reattach_native_transaction(&self, _xid: &Xid) {}
}
