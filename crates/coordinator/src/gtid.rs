//! GTID tracker facade
//!
//! XA finalization must persist the transaction's owned GTIDs before
//! touching engines; a store failure turns the finalization into a
//! rollback. The real tracker is a collaborator, so this facade only
//! mirrors the call shape and lets tests inject the failure.

use parking_lot::Mutex;
use thiserror::Error;

/// The GTID store rejected the transaction's owned GTIDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to store owned GTIDs")]
pub struct GtidStoreError;

/// Whether owned GTIDs must be cleared once the statement finishes.
pub type NeedClear = bool;

#[derive(Debug, Default)]
struct Counters {
    commits: usize,
    rollbacks: usize,
}

/// Accounting facade over the GTID state machine.
#[derive(Debug, Default)]
pub struct GtidFacade {
    fail_next_store: Mutex<bool>,
    counters: Mutex<Counters>,
}

impl GtidFacade {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next [`GtidFacade::commit_owned_gtids`] call fail.
    pub fn fail_next_store(&self) {
        *self.fail_next_store.lock() = true;
    }

    /// Persist the session's owned GTIDs ahead of the engine fan-out.
    pub fn commit_owned_gtids(&self) -> Result<NeedClear, GtidStoreError> {
        let mut fail = self.fail_next_store.lock();
        if *fail {
            *fail = false;
            return Err(GtidStoreError);
        }
        Ok(true)
    }

    /// Settle the GTID state once the outcome is known.
    pub fn commit_or_rollback(&self, need_clear: NeedClear, success: bool) {
        if !need_clear {
            return;
        }
        let mut counters = self.counters.lock();
        if success {
            counters.commits += 1;
        } else {
            counters.rollbacks += 1;
        }
    }

    pub fn commits(&self) -> usize {
        self.counters.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.counters.lock().rollbacks
    }
}
