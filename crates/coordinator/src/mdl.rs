//! Metadata-lock facade
//!
//! The coordinator needs two things from the metadata-lock manager: the
//! server-wide commit latch that serializes XA finalization against
//! `FLUSH TABLES WITH READ LOCK`, and the backup store that preserves a
//! prepared branch's table locks across session teardown and restart. The
//! full lock graph lives elsewhere; table requests are only recorded here
//! so they can be saved and restored.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Lock namespace of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdlKey {
    /// The commit namespace: global, coordinates with FTWRL.
    Commit,
    /// A table lock, recorded for backup/restore.
    Table { db: String, table: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdlMode {
    IntentionExclusive,
    SharedWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MdlDuration {
    Statement,
    Transaction,
}

/// One metadata lock request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdlRequest {
    pub key: MdlKey,
    pub mode: MdlMode,
    pub duration: MdlDuration,
}

impl MdlRequest {
    /// The request XA finalization takes before touching engines or the
    /// binlog: commit namespace, intention-exclusive, statement scope.
    pub fn commit_intention() -> Self {
        Self {
            key: MdlKey::Commit,
            mode: MdlMode::IntentionExclusive,
            duration: MdlDuration::Statement,
        }
    }

    /// The request recovery rebuilds for each table a retained branch
    /// modified. The exact lock taken before the crash is unknown, so a
    /// strong one is used.
    pub fn shared_write_table(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            key: MdlKey::Table {
                db: db.into(),
                table: table.into(),
            },
            mode: MdlMode::SharedWrite,
            duration: MdlDuration::Transaction,
        }
    }
}

/// The commit latch timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out waiting for the commit metadata lock")]
pub struct MdlTimeout;

/// A backup already exists for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("a metadata lock backup already exists for this key")]
pub struct DuplicateBackup;

#[derive(Debug, Default)]
struct LatchState {
    exclusive: bool,
    shared: usize,
}

/// Server-wide metadata-lock manager, reduced to the commit latch.
///
/// Intention-exclusive holders (XA PREPARE / COMMIT / ROLLBACK) share the
/// latch; the global read lock takes it exclusively and blocks them.
#[derive(Debug, Default)]
pub struct MdlManager {
    latch: Mutex<LatchState>,
    cond: Condvar,
}

impl MdlManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire_commit_intention(&self, timeout: Duration) -> Result<(), MdlTimeout> {
        let deadline = Instant::now() + timeout;
        let mut state = self.latch.lock();
        while state.exclusive {
            if Instant::now() >= deadline {
                return Err(MdlTimeout);
            }
            self.cond.wait_until(&mut state, deadline);
        }
        state.shared += 1;
        Ok(())
    }

    fn release_commit_intention(&self) {
        let mut state = self.latch.lock();
        state.shared -= 1;
        self.cond.notify_all();
    }

    /// Take the exclusive side of the latch, as `FLUSH TABLES WITH READ
    /// LOCK` does. Blocks until all intention holders are gone.
    pub fn global_read_lock(self: &Arc<Self>) -> GlobalReadLock {
        let mut state = self.latch.lock();
        while state.exclusive || state.shared > 0 {
            self.cond.wait(&mut state);
        }
        state.exclusive = true;
        GlobalReadLock {
            manager: Arc::clone(self),
        }
    }
}

/// Guard for the exclusive side of the commit latch.
pub struct GlobalReadLock {
    manager: Arc<MdlManager>,
}

impl Drop for GlobalReadLock {
    fn drop(&mut self) {
        let mut state = self.manager.latch.lock();
        state.exclusive = false;
        self.manager.cond.notify_all();
    }
}

/// Per-session metadata-lock context.
#[derive(Debug)]
pub struct MdlContext {
    manager: Arc<MdlManager>,
    commit_locks: usize,
    transactional: Vec<MdlRequest>,
}

impl MdlContext {
    pub fn new(manager: Arc<MdlManager>) -> Self {
        Self {
            manager,
            commit_locks: 0,
            transactional: Vec::new(),
        }
    }

    /// Acquire a lock. Commit-namespace requests contend on the latch with
    /// the given timeout; table requests are recorded for backup purposes.
    pub fn acquire_lock(&mut self, request: MdlRequest, timeout: Duration) -> Result<(), MdlTimeout> {
        match request.key {
            MdlKey::Commit => {
                self.manager.acquire_commit_intention(timeout)?;
                self.commit_locks += 1;
                Ok(())
            }
            MdlKey::Table { .. } => {
                self.transactional.push(request);
                Ok(())
            }
        }
    }

    /// Release statement-scoped locks; called when a command finishes.
    pub fn release_statement_locks(&mut self) {
        for _ in 0..self.commit_locks {
            self.manager.release_commit_intention();
        }
        self.commit_locks = 0;
    }

    /// Release everything the transaction holds.
    pub fn release_transactional_locks(&mut self) {
        self.release_statement_locks();
        self.transactional.clear();
    }

    pub fn transactional_requests(&self) -> &[MdlRequest] {
        &self.transactional
    }

    fn import_requests(&mut self, requests: Vec<MdlRequest>) {
        self.transactional.extend(requests);
    }
}

/// Store of saved lock sets for prepared branches that outlive their
/// session, keyed by the branch's XID key.
#[derive(Debug, Default)]
pub struct MdlBackupManager {
    backups: Mutex<HashMap<Vec<u8>, Vec<MdlRequest>>>,
}

impl MdlBackupManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_backup(&self, key: &[u8], requests: Vec<MdlRequest>) -> Result<(), DuplicateBackup> {
        let mut backups = self.backups.lock();
        if backups.contains_key(key) {
            return Err(DuplicateBackup);
        }
        backups.insert(key.to_vec(), requests);
        Ok(())
    }

    /// Save the transactional locks a session context currently holds.
    pub fn create_backup_from_context(
        &self,
        ctx: &MdlContext,
        key: &[u8],
    ) -> Result<(), DuplicateBackup> {
        self.create_backup(key, ctx.transactional.clone())
    }

    /// Move a saved lock set back into a session context. Missing backups
    /// are a no-op: the branch may have been prepared before locks were
    /// tracked.
    pub fn restore_backup(&self, ctx: &mut MdlContext, key: &[u8]) {
        if let Some(requests) = self.backups.lock().remove(key) {
            ctx.import_requests(requests);
        }
    }

    pub fn delete_backup(&self, key: &[u8]) {
        self.backups.lock().remove(key);
    }

    pub fn has_backup(&self, key: &[u8]) -> bool {
        self.backups.lock().contains_key(key)
    }
}
