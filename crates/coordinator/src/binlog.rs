//! Binlog collaborator seam
//!
//! The binlog writer is out of scope; the coordinator consumes it through
//! three narrow surfaces: the recovery sets the scanner derives from the
//! last binlog file at startup, the group-commit entry used when a session
//! commits its own prepared branch, and the participation predicate that
//! decides whether a branch is marked as binlogged.

use crate::config::CoordinatorConfig;
use crate::session::Session;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tandem_engine::{EngineError, StorageEngine};
use tandem_common::Xid;

/// Per-branch fate information derived from the binlog at startup.
///
/// External XA sets are keyed by the branch's gtrid bytes; the commit list
/// holds the transaction ids embedded in internal XIDs.
#[derive(Debug, Clone, Default)]
pub struct BinlogRecoverySets {
    /// Internal two-phase-commit branches the binlog committed.
    pub commit_list: HashSet<u64>,
    /// Branches observed as `XA PREPARE`, including the prepared-id
    /// snapshot carried over from the previous binlog file.
    pub xa_prepared: BTreeSet<Vec<u8>>,
    /// Branches finalized by `XA COMMIT ... ONE PHASE`.
    pub xa_one_phase_committed: BTreeSet<Vec<u8>>,
    /// Branches observed as `XA COMMIT`.
    pub xa_committed: BTreeSet<Vec<u8>>,
    /// Branches observed as `XA ROLLBACK`.
    pub xa_aborted: BTreeSet<Vec<u8>>,
}

impl BinlogRecoverySets {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Group-commit entry point for a branch the session itself prepared.
pub trait TcLog: Send + Sync {
    fn commit(
        &self,
        xid: &Xid,
        engines: &[Arc<dyn StorageEngine>],
        slots: &[usize],
    ) -> Result<(), EngineError>;
}

/// Default transaction-coordinator log: commit directly in each
/// participating engine. Stands in for the binlog group-commit pipeline.
#[derive(Debug, Default)]
pub struct EngineTcLog;

impl TcLog for EngineTcLog {
    fn commit(
        &self,
        xid: &Xid,
        engines: &[Arc<dyn StorageEngine>],
        slots: &[usize],
    ) -> Result<(), EngineError> {
        for &slot in slots {
            engines[slot].commit(xid)?;
        }
        Ok(())
    }
}

/// Whether this session's branch participates in the binlog: appliers only
/// with `log_replica_updates`, and always subject to the session's
/// `sql_log_bin` switch.
pub fn should_binlog(session: &Session, config: &CoordinatorConfig) -> bool {
    (!session.is_applier || config.log_replica_updates) && config.log_bin && session.sql_log_bin
}
