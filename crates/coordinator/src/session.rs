//! Per-session XA state
//!
//! Each session owns one branch context at a time. The context is shared
//! with the transaction cache while the branch is live, so every mutable
//! field sits behind a mutex and the context is handed around as an `Arc`.
//!
//! The state machine is `NotR → Active → Idle → Prepared`, terminated by
//! commit or rollback; branches that hit a resource-manager error divert to
//! `RollbackOnly` and stay there until a terminating command clears them.

use crate::error::XaError;
use crate::mdl::MdlContext;
use crate::observer::{NullObserver, TransactionObserver};
use crate::row::RowWriter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tandem_common::{RmCode, Xid};
use tandem_engine::TableRef;

/// Lifecycle state of a session's XA branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XaState {
    NotR,
    Active,
    Idle,
    Prepared,
    RollbackOnly,
}

impl XaState {
    /// Display name used in client error messages.
    pub fn name(self) -> &'static str {
        match self {
            XaState::NotR => "NON-EXISTING",
            XaState::Active => "ACTIVE",
            XaState::Idle => "IDLE",
            XaState::Prepared => "PREPARED",
            XaState::RollbackOnly => "ROLLBACK ONLY",
        }
    }
}

/// Who drives this branch: the server's own two-phase commit, or an
/// external transaction manager through `XA` statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaOwner {
    Internal,
    External,
}

#[derive(Debug)]
struct XidStateInner {
    xid: Xid,
    state: XaState,
    rm_error: u32,
    is_binlogged: bool,
    in_recovery: bool,
    owner: XaOwner,
}

/// The XA half of a branch context: current XID, state, and the flags the
/// finalization paths consult.
#[derive(Debug)]
pub struct XidState {
    inner: Mutex<XidStateInner>,
    /// Serializes competing COMMIT/ROLLBACK of the same detached branch.
    /// Without it, two sessions could each write a finalization event for
    /// the same XID into the binlog.
    xa_lock: Mutex<()>,
}

impl XidState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(XidStateInner {
                xid: Xid::null(),
                state: XaState::NotR,
                rm_error: 0,
                is_binlogged: false,
                in_recovery: false,
                owner: XaOwner::Internal,
            }),
            xa_lock: Mutex::new(()),
        }
    }

    /// Begin a client-driven branch. The caller has verified `NotR`.
    pub fn start_normal_xa(&self, xid: &Xid) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, XaState::NotR);
        inner.xid = *xid;
        inner.state = XaState::Active;
        inner.owner = XaOwner::External;
        inner.rm_error = 0;
    }

    /// Revive a branch found prepared during crash recovery. The branch is
    /// assumed binlogged unless the caller knows otherwise: if `log_bin`
    /// was turned on since the shutdown, its finalization may be logged
    /// alone.
    pub fn start_recovery_xa(&self, xid: &Xid, is_binlogged: bool) {
        let mut inner = self.inner.lock();
        inner.xid = *xid;
        inner.state = XaState::Prepared;
        inner.owner = XaOwner::External;
        inner.in_recovery = true;
        inner.is_binlogged = is_binlogged;
        inner.rm_error = 0;
    }

    pub fn state(&self) -> XaState {
        self.inner.lock().state
    }

    /// Callers must respect the transition table; this only records the
    /// new state.
    pub fn set_state(&self, state: XaState) {
        self.inner.lock().state = state;
    }

    pub fn has_state(&self, state: XaState) -> bool {
        self.state() == state
    }

    pub fn xid(&self) -> Xid {
        self.inner.lock().xid
    }

    pub fn has_same_xid(&self, xid: &Xid) -> bool {
        self.inner.lock().xid == *xid
    }

    pub fn owner(&self) -> XaOwner {
        self.inner.lock().owner
    }

    pub fn is_in_recovery(&self) -> bool {
        self.inner.lock().in_recovery
    }

    pub fn is_binlogged(&self) -> bool {
        self.inner.lock().is_binlogged
    }

    pub fn set_binlogged(&self) {
        self.inner.lock().is_binlogged = true;
    }

    pub fn unset_binlogged(&self) {
        self.inner.lock().is_binlogged = false;
    }

    pub fn rm_error(&self) -> u32 {
        self.inner.lock().rm_error
    }

    /// Record a resource-manager error for the current branch. Ignored
    /// when no branch is open.
    pub fn set_error(&self, code: RmCode) {
        let mut inner = self.inner.lock();
        if inner.state != XaState::NotR {
            inner.rm_error = code.code();
        }
    }

    pub fn reset_error(&self) {
        self.inner.lock().rm_error = 0;
    }

    /// Forget the branch entirely; the session is back to `NotR`.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.xid = Xid::null();
        inner.state = XaState::NotR;
        inner.rm_error = 0;
        inner.is_binlogged = false;
        inner.in_recovery = false;
        inner.owner = XaOwner::Internal;
    }

    /// If the branch was rolled back by a resource manager, divert it to
    /// `RollbackOnly` and return the error the client must see. A branch
    /// stays `RollbackOnly` until a terminating command clears it.
    pub fn rollback_only_error(&self) -> Option<XaError> {
        let mut inner = self.inner.lock();
        if let Some(code) = RmCode::from_code(inner.rm_error) {
            inner.state = XaState::RollbackOnly;
            return Some(XaError::rollback_error(code));
        }
        if inner.state == XaState::RollbackOnly {
            Some(XaError::RbRollback)
        } else {
            None
        }
    }

    /// Reject callers that must not run inside an XA branch.
    pub fn check_in_xa(&self) -> Result<(), XaError> {
        let state = self.state();
        if state != XaState::NotR {
            return Err(XaError::RmFail { state: state.name() });
        }
        Ok(())
    }

    /// Reject callers that conflict with a branch between END and COMMIT.
    pub fn check_xa_idle_or_prepared(&self) -> Result<(), XaError> {
        let state = self.state();
        if matches!(state, XaState::Idle | XaState::Prepared) {
            return Err(XaError::RmFail { state: state.name() });
        }
        Ok(())
    }

    /// Reject callers while the session has an uncommitted branch.
    pub fn check_has_uncommitted_xa(&self) -> Result<(), XaError> {
        let state = self.state();
        if matches!(
            state,
            XaState::Idle | XaState::Prepared | XaState::RollbackOnly
        ) {
            return Err(XaError::RmFail { state: state.name() });
        }
        Ok(())
    }

    /// Emit the four `XA RECOVER` columns for this branch.
    pub fn store_xid_info(&self, row: &mut dyn RowWriter, as_hex: bool) {
        let inner = self.inner.lock();
        row.store_int(inner.xid.format_id() as i64);
        row.store_int(inner.xid.gtrid_length() as i64);
        row.store_int(inner.xid.bqual_length() as i64);
        if as_hex {
            row.store_bytes(inner.xid.to_hex_literal().as_bytes());
        } else {
            row.store_bytes(inner.xid.data_bytes());
        }
    }

    /// Diagnostic one-liner for logs.
    pub fn describe(&self) -> String {
        let inner = self.inner.lock();
        format!(
            "xid: {}, state: {}, type: {:?}, in_recovery: {}, binlogged: {}, rm_error: {}",
            inner.xid.serialize(),
            inner.state.name(),
            inner.owner,
            inner.in_recovery,
            inner.is_binlogged,
            inner.rm_error,
        )
    }

    pub fn xa_lock(&self) -> &Mutex<()> {
        &self.xa_lock
    }
}

impl Default for XidState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-branch bundle shared between a session and the transaction cache:
/// the XA state plus bookkeeping of which engines hold work for the branch
/// and which tables it modified.
#[derive(Debug, Default)]
pub struct TransactionCtx {
    xid_state: XidState,
    engines: Mutex<Vec<usize>>,
    mod_tables: Mutex<Vec<TableRef>>,
}

impl TransactionCtx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn xid_state(&self) -> &XidState {
        &self.xid_state
    }

    /// Record that the engine in `slot` holds work for this branch.
    pub fn register_engine(&self, slot: usize) {
        let mut engines = self.engines.lock();
        if !engines.contains(&slot) {
            engines.push(slot);
        }
    }

    pub fn engine_slots(&self) -> Vec<usize> {
        self.engines.lock().clone()
    }

    pub fn has_engine_work(&self) -> bool {
        !self.engines.lock().is_empty()
    }

    pub fn add_mod_tables(&self, tables: &[TableRef]) {
        self.mod_tables.lock().extend_from_slice(tables);
    }

    pub fn mod_tables(&self) -> Vec<TableRef> {
        self.mod_tables.lock().clone()
    }

    /// Drop per-transaction bookkeeping after a terminal transition.
    pub fn cleanup(&self) {
        self.engines.lock().clear();
        self.mod_tables.lock().clear();
    }
}

/// One client connection's view of the coordinator.
pub struct Session {
    id: u64,
    ctx: Arc<TransactionCtx>,
    mdl: MdlContext,
    observer: Arc<dyn TransactionObserver>,

    /// Replication applier sessions detach their branches after PREPARE.
    pub is_applier: bool,
    /// Session-level binlog switch.
    pub sql_log_bin: bool,
    /// How long finalization waits for the commit metadata lock.
    pub lock_wait_timeout: Duration,
    /// An ordinary multi-statement transaction is open.
    pub in_multi_stmt_transaction: bool,
    /// The session holds LOCK TABLES.
    pub locked_tables_mode: bool,

    in_transaction: bool,
    option_begin: bool,
    unsafe_rollback_flags: bool,
}

impl Session {
    pub fn new(id: u64, mdl: MdlContext, lock_wait_timeout: Duration) -> Self {
        Self {
            id,
            ctx: Arc::new(TransactionCtx::new()),
            mdl,
            observer: Arc::new(NullObserver),
            is_applier: false,
            sql_log_bin: true,
            lock_wait_timeout,
            in_multi_stmt_transaction: false,
            locked_tables_mode: false,
            in_transaction: false,
            option_begin: false,
            unsafe_rollback_flags: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ctx(&self) -> &Arc<TransactionCtx> {
        &self.ctx
    }

    pub fn xid_state(&self) -> &XidState {
        self.ctx.xid_state()
    }

    pub fn mdl(&self) -> &MdlContext {
        &self.mdl
    }

    pub fn mdl_mut(&mut self) -> &mut MdlContext {
        &mut self.mdl
    }

    pub fn set_observer(&mut self, observer: Arc<dyn TransactionObserver>) {
        self.observer = observer;
    }

    pub fn observer(&self) -> &Arc<dyn TransactionObserver> {
        &self.observer
    }

    pub fn notify_state(&self, state: XaState) {
        self.observer.xa_state_changed(&self.xid_state().xid(), state);
    }

    /// Mark work done in `slot` touching `tables`, as statement execution
    /// would after routing DML to an engine.
    pub fn register_engine_work(&mut self, slot: usize, tables: &[TableRef]) {
        self.ctx.register_engine(slot);
        self.ctx.add_mod_tables(tables);
        self.unsafe_rollback_flags = true;
    }

    /// Set the in-transaction server status bits.
    pub fn start_transaction_state(&mut self) {
        self.in_transaction = true;
        self.option_begin = true;
    }

    /// Clear the in-transaction server status bits, the BEGIN flag and the
    /// unsafe-rollback flags.
    pub fn clear_transaction_state(&mut self) {
        self.in_transaction = false;
        self.option_begin = false;
        self.unsafe_rollback_flags = false;
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn option_begin(&self) -> bool {
        self.option_begin
    }

    pub fn has_unsafe_rollback(&self) -> bool {
        self.unsafe_rollback_flags
    }

    /// Give the session a fresh branch context. Used after a prepared
    /// branch is detached into the cache: the old context lives on there.
    pub fn reset_ctx(&mut self) {
        self.ctx = Arc::new(TransactionCtx::new());
    }
}
