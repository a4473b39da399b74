//! Process-wide transaction cache
//!
//! Maps XID keys to branch contexts. A live session's branch is shared
//! between the session and the cache; recovery-owned branches have no
//! session and live here alone. One mutex guards the map and is held only
//! for map-level operations, never across engine or metadata-lock calls.

use crate::error::XaError;
use crate::session::{TransactionCtx, XaState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tandem_common::Xid;

/// Concurrent XID → branch mapping.
#[derive(Debug, Default)]
pub struct TransactionCache {
    map: Mutex<HashMap<Vec<u8>, Arc<TransactionCtx>>>,
}

impl TransactionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the branch for `xid`, if any.
    pub fn search(&self, xid: &Xid) -> Option<Arc<TransactionCtx>> {
        self.map.lock().get(&xid.key()).cloned()
    }

    /// Insert a live session's branch. Fails with `DupId` when the XID is
    /// already known; the caller unwinds its started transaction.
    pub fn insert_live(&self, xid: &Xid, ctx: &Arc<TransactionCtx>) -> Result<(), XaError> {
        let mut map = self.map.lock();
        if map.contains_key(&xid.key()) {
            return Err(XaError::DupId);
        }
        map.insert(xid.key(), Arc::clone(ctx));
        Ok(())
    }

    /// Insert a branch found prepared during crash recovery: owned by the
    /// cache, already prepared, assumed binlogged. Idempotent: a branch
    /// already present is left untouched.
    pub fn insert_recovery(&self, xid: &Xid) {
        let mut map = self.map.lock();
        if map.contains_key(&xid.key()) {
            return;
        }
        let ctx = Arc::new(TransactionCtx::new());
        ctx.xid_state().start_recovery_xa(xid, true);
        map.insert(xid.key(), ctx);
    }

    /// Erase the entry for this branch, but only if the entry still *is*
    /// this branch. A stale handle must not evict a newer branch that
    /// reused the same XID.
    pub fn delete(&self, ctx: &Arc<TransactionCtx>) {
        let key = ctx.xid_state().xid().key();
        let mut map = self.map.lock();
        if let Some(current) = map.get(&key) {
            if Arc::ptr_eq(current, ctx) {
                map.remove(&key);
            }
        }
    }

    /// Replace a live session's prepared branch with an equivalent
    /// cache-owned one, preserving the binlogged flag. The branch then
    /// survives the session's teardown; only a later finalizer or restart
    /// touches it again.
    pub fn detach(&self, ctx: &Arc<TransactionCtx>) {
        let xs = ctx.xid_state();
        debug_assert_eq!(xs.state(), XaState::Prepared);
        let xid = xs.xid();
        let was_binlogged = xs.is_binlogged();

        let mut map = self.map.lock();
        debug_assert!(map.contains_key(&xid.key()));
        map.remove(&xid.key());

        let detached = Arc::new(TransactionCtx::new());
        detached.xid_state().start_recovery_xa(&xid, was_binlogged);
        map.insert(xid.key(), detached);
    }

    /// Visit every cached branch under the cache mutex. The visitor must
    /// not block.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<TransactionCtx>)) {
        let map = self.map.lock();
        for ctx in map.values() {
            visitor(ctx);
        }
    }

    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    /// Drop every entry; server shutdown.
    pub fn clear(&self) {
        self.map.lock().clear();
    }
}
