//! Transaction state observer
//!
//! Every state transition of a branch is reported to an observer so the
//! instrumentation layer can mirror it. The server wires its own
//! implementation; [`NullObserver`] is the default and tests use
//! [`RecordingObserver`].

use crate::session::XaState;
use parking_lot::Mutex;
use tandem_common::Xid;

/// Hook notified on every XA state transition of a session's branch.
pub trait TransactionObserver: Send + Sync {
    /// A branch changed state (including entering `Active` on start).
    fn xa_state_changed(&self, _xid: &Xid, _state: XaState) {}

    /// The session's transaction ended (commit or rollback completed).
    fn transaction_ended(&self) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Default)]
pub struct NullObserver;

impl TransactionObserver for NullObserver {}

/// Observer that records transitions, for tests.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    pub transitions: Mutex<Vec<(String, XaState)>>,
    pub ended: Mutex<usize>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionObserver for RecordingObserver {
    fn xa_state_changed(&self, xid: &Xid, state: XaState) {
        self.transitions.lock().push((xid.serialize(), state));
    }

    fn transaction_ended(&self) {
        *self.ended.lock() += 1;
    }
}
