//! XA command handlers
//!
//! `XaCoordinator` owns the process-wide pieces (cache, registry, metadata
//! locks, GTID facade, engines) and exposes one method per XA statement.
//! Sessions call in on their own threads; the coordinator never holds the
//! cache mutex across an engine or metadata-lock call.

use crate::binlog::{BinlogRecoverySets, EngineTcLog, TcLog, should_binlog};
use crate::cache::TransactionCache;
use crate::config::CoordinatorConfig;
use crate::error::{Result, XaError};
use crate::gtid::GtidFacade;
use crate::mdl::{MdlBackupManager, MdlContext, MdlManager, MdlRequest};
use crate::recovery::{
    RecoveredTransactions, RecoveryReport, RecoveryResolver, fetch_prepared,
};
use crate::registry::PreparedRegistry;
use crate::row::RowWriter;
use crate::session::{Session, TransactionCtx, XaState};
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_common::Xid;
use tandem_engine::StorageEngine;
use tracing::{debug, error};

/// Option attached to `XA START`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOption {
    None,
    Join,
    Resume,
    Suspend,
    Migrate,
}

/// Option attached to `XA END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOption {
    None,
    Suspend,
    Migrate,
}

/// The XA transaction coordinator.
///
/// Created once by the server lifecycle owner; [`XaCoordinator::shutdown`]
/// drops all cached branches.
pub struct XaCoordinator {
    config: CoordinatorConfig,
    engines: Vec<Arc<dyn StorageEngine>>,
    cache: TransactionCache,
    registry: PreparedRegistry,
    mdl: Arc<MdlManager>,
    backups: MdlBackupManager,
    gtid: GtidFacade,
    tc_log: Box<dyn TcLog>,
}

impl XaCoordinator {
    pub fn new(config: CoordinatorConfig, engines: Vec<Arc<dyn StorageEngine>>) -> Self {
        Self {
            config,
            engines,
            cache: TransactionCache::new(),
            registry: PreparedRegistry::new(),
            mdl: Arc::new(MdlManager::new()),
            backups: MdlBackupManager::new(),
            gtid: GtidFacade::new(),
            tc_log: Box::new(EngineTcLog),
        }
    }

    /// Replace the transaction-coordinator log used for committing a
    /// session's own prepared branch.
    pub fn with_tc_log(mut self, tc_log: Box<dyn TcLog>) -> Self {
        self.tc_log = tc_log;
        self
    }

    /// Open a session wired to this coordinator's lock manager and
    /// configured defaults.
    pub fn new_session(&self, id: u64) -> Session {
        Session::new(
            id,
            MdlContext::new(Arc::clone(&self.mdl)),
            self.config.lock_wait_timeout,
        )
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn cache(&self) -> &TransactionCache {
        &self.cache
    }

    pub fn registry(&self) -> &PreparedRegistry {
        &self.registry
    }

    pub fn mdl_manager(&self) -> &Arc<MdlManager> {
        &self.mdl
    }

    pub fn backups(&self) -> &MdlBackupManager {
        &self.backups
    }

    pub fn gtid(&self) -> &GtidFacade {
        &self.gtid
    }

    pub fn engine(&self, slot: usize) -> &Arc<dyn StorageEngine> {
        &self.engines[slot]
    }

    /// Drop every cached branch; server shutdown.
    pub fn shutdown(&self) {
        self.cache.clear();
    }

    /// Parse an XID literal in the configured text form: hex literal by
    /// default, single-quoted raw bytes in `ddc_mode`.
    pub fn parse_xid_literal(&self, text: &str) -> Result<Xid> {
        let parsed = if self.config.ddc_mode {
            Xid::parse_quoted(text)
        } else {
            Xid::parse(text)
        };
        parsed.map_err(|_| XaError::Inval)
    }

    /// Render an XID in the configured text form.
    pub fn format_xid(&self, xid: &Xid) -> String {
        if self.config.ddc_mode {
            xid.serialize_quoted()
        } else {
            xid.serialize()
        }
    }

    // === XA START ===

    pub fn xa_start(&self, session: &mut Session, xid: &Xid, option: StartOption) -> Result<()> {
        self.start_branch(session, xid, option)?;
        if session.is_applier {
            // The applier's engine-side transactions are parked so the
            // branch can survive the applier moving on after PREPARE.
            for engine in self.engines.iter().filter(|e| e.supports_detach()) {
                engine.detach_native_transaction(xid);
            }
        }
        Ok(())
    }

    fn start_branch(&self, session: &mut Session, xid: &Xid, option: StartOption) -> Result<()> {
        let state = session.xid_state().state();

        if state == XaState::Idle && option == StartOption::Resume {
            if !session.xid_state().has_same_xid(xid) {
                return Err(XaError::Nota);
            }
            session.xid_state().set_state(XaState::Active);
            session.notify_state(XaState::Active);
            return Ok(());
        }

        if option != StartOption::None {
            return Err(XaError::Inval);
        }
        if state != XaState::NotR {
            return Err(XaError::RmFail { state: state.name() });
        }
        if session.locked_tables_mode || session.in_multi_stmt_transaction {
            return Err(XaError::Outside);
        }
        if xid.contains_reserved_byte() {
            // '|' separates ids in the binlog's prepared-id snapshot.
            return Err(XaError::Inval);
        }

        session.start_transaction_state();
        session.xid_state().start_normal_xa(xid);
        session.notify_state(XaState::Active);

        if let Err(e) = self.cache.insert_live(xid, session.ctx()) {
            session.xid_state().reset();
            session.clear_transaction_state();
            session.ctx().cleanup();
            return Err(e);
        }
        Ok(())
    }

    // === XA END ===

    pub fn xa_end(&self, session: &mut Session, xid: &Xid, option: EndOption) -> Result<()> {
        if option != EndOption::None {
            return Err(XaError::Inval);
        }
        let state = session.xid_state().state();
        if state != XaState::Active {
            return Err(XaError::RmFail { state: state.name() });
        }
        if !session.xid_state().has_same_xid(xid) {
            return Err(XaError::Nota);
        }
        if let Some(err) = session.xid_state().rollback_only_error() {
            session.notify_state(session.xid_state().state());
            return Err(err);
        }
        session.xid_state().set_state(XaState::Idle);
        session.notify_state(XaState::Idle);
        Ok(())
    }

    // === XA PREPARE ===

    pub fn xa_prepare(&self, session: &mut Session, xid: &Xid) -> Result<()> {
        // Registered before anything can fail: the rotation snapshot takes
        // the conservative view of what is "currently prepared".
        self.registry.add_id(xid.gtrid());

        let result = self.prepare_branch(session, xid);
        session.mdl_mut().release_statement_locks();
        if result.is_ok() && session.is_applier {
            self.applier_reset_after_prepare(session, xid);
        }
        result
    }

    fn prepare_branch(&self, session: &mut Session, xid: &Xid) -> Result<()> {
        let state = session.xid_state().state();
        if state != XaState::Idle {
            return Err(XaError::RmFail { state: state.name() });
        }
        if !session.xid_state().has_same_xid(xid) {
            return Err(XaError::Nota);
        }
        if session.is_applier && !session.ctx().has_engine_work() {
            // Replication filters can empty a branch; empty XA branches
            // are not allowed on a replica.
            return Err(XaError::ReplicationFilters);
        }

        let timeout = session.lock_wait_timeout;
        let latch_ok = session
            .mdl_mut()
            .acquire_lock(MdlRequest::commit_intention(), timeout)
            .is_ok();
        let prepared = latch_ok && self.prepare_engines(session.ctx(), xid).is_ok();

        if !prepared {
            // Nothing partial survives: every engine branch is rolled
            // back and the session is back to square one.
            self.rollback_engines_of(session.ctx());
            session.xid_state().reset_error();
            self.cleanup_trans_state(session);
            session.xid_state().set_state(XaState::NotR);
            session.ctx().cleanup();
            session.notify_state(XaState::NotR);
            return Err(XaError::RbRollback);
        }

        if should_binlog(session, &self.config) {
            session.xid_state().set_binlogged();
        }
        session.xid_state().set_state(XaState::Prepared);
        session.notify_state(XaState::Prepared);
        Ok(())
    }

    /// After a successful applier PREPARE the branch must outlive the
    /// session: save its metadata locks, hand the cache entry over to
    /// recovery ownership and give the session a clean slate.
    fn applier_reset_after_prepare(&self, session: &mut Session, xid: &Xid) {
        if let Err(e) = self
            .backups
            .create_backup_from_context(session.mdl(), &xid.key())
        {
            // The connection is done with the branch either way; failing
            // to save the locks is logged, not returned.
            error!(xid = %xid, error = %e, "cannot save metadata locks of prepared branch");
        }
        self.cache.detach(session.ctx());
        session.clear_transaction_state();
        session.xid_state().reset();
        for engine in self.engines.iter().filter(|e| e.supports_detach()) {
            engine.reattach_native_transaction(xid);
        }
        session.reset_ctx();
        session.mdl_mut().release_transactional_locks();
    }

    // === XA COMMIT / XA ROLLBACK ===

    pub fn xa_commit(&self, session: &mut Session, xid: &Xid, one_phase: bool) -> Result<()> {
        let result = if session.xid_state().has_same_xid(xid) {
            self.commit_own(session, one_phase)
        } else {
            self.finalize_external(session, xid, true)
        };
        session.mdl_mut().release_statement_locks();
        if result.is_ok() {
            session.mdl_mut().release_transactional_locks();
            self.registry.del_id(xid.gtrid());
        }
        result
    }

    pub fn xa_rollback(&self, session: &mut Session, xid: &Xid) -> Result<()> {
        let result = if session.xid_state().has_same_xid(xid) {
            self.rollback_own(session)
        } else {
            self.finalize_external(session, xid, false)
        };
        session.mdl_mut().release_statement_locks();
        if result.is_ok() {
            session.mdl_mut().release_transactional_locks();
            self.registry.del_id(xid.gtrid());
        }
        result
    }

    fn commit_own(&self, session: &mut Session, one_phase: bool) -> Result<()> {
        if let Some(rb_error) = session.xid_state().rollback_only_error() {
            if let Err(e) = self.force_rollback(session) {
                error!(error = %e, "engine rollback failed while clearing a rolled-back branch");
            }
            self.terminate_own(session);
            return Err(rb_error);
        }

        let state = session.xid_state().state();
        match (state, one_phase) {
            (XaState::Idle, true) => {
                let result = self.commit_one_phase(session);
                self.terminate_own(session);
                result
            }
            (XaState::Prepared, false) => {
                let timeout = session.lock_wait_timeout;
                if session
                    .mdl_mut()
                    .acquire_lock(MdlRequest::commit_intention(), timeout)
                    .is_err()
                {
                    // A prepared branch cannot be rolled back on lock
                    // failure; leave it untouched and let the client retry.
                    return Err(XaError::Retry);
                }

                match self.gtid.commit_owned_gtids() {
                    Err(_) => {
                        // The GTID store refused the transaction; it is
                        // rolled back instead.
                        self.rollback_engines_of(session.ctx());
                        self.gtid.commit_or_rollback(true, false);
                        self.terminate_own(session);
                        Err(XaError::RmError)
                    }
                    Ok(need_clear) => {
                        let xid = session.xid_state().xid();
                        let slots = session.ctx().engine_slots();
                        let result = self.tc_log.commit(&xid, &self.engines, &slots);
                        self.gtid.commit_or_rollback(need_clear, result.is_ok());
                        self.terminate_own(session);
                        result.map_err(|_| XaError::RmError)
                    }
                }
            }
            _ => Err(XaError::RmFail { state: state.name() }),
        }
    }

    fn rollback_own(&self, session: &mut Session) -> Result<()> {
        let state = session.xid_state().state();
        match state {
            XaState::NotR => Err(XaError::RmFail { state: state.name() }),
            XaState::Active => {
                let result = self.force_rollback(session);
                self.terminate_own(session);
                result
            }
            _ => {
                // Idle, Prepared or RollbackOnly.
                let timeout = session.lock_wait_timeout;
                if session
                    .mdl_mut()
                    .acquire_lock(MdlRequest::commit_intention(), timeout)
                    .is_err()
                {
                    // Rolling back a prepared branch involves the redo log
                    // and the binlog; without the lock it must stay put.
                    return Err(XaError::RmError);
                }
                let gtid_result = self.gtid.commit_owned_gtids();
                let result = self.force_rollback(session);
                self.gtid
                    .commit_or_rollback(gtid_result.unwrap_or(true), gtid_result.is_ok());
                self.terminate_own(session);
                if gtid_result.is_err() {
                    return Err(XaError::RbRollback);
                }
                result
            }
        }
    }

    /// Finalize a prepared branch that belongs to no session: one left by
    /// a disconnected client, a detached applier branch, or one revived by
    /// crash recovery.
    fn finalize_external(&self, session: &mut Session, xid: &Xid, commit: bool) -> Result<()> {
        let ctx = self.find_for_finalize(session, xid)?;
        let branch = ctx.xid_state();

        let mut rb_error = if commit { branch.rollback_only_error() } else { None };

        // One finalizer at a time per branch: without this, two sessions
        // could each write a finalization event for the same XID.
        let _finalizer = branch.xa_lock().lock();

        // The branch may have been finalized while we waited for the lock.
        self.find_for_finalize(session, xid)?;

        let timeout = session.lock_wait_timeout;
        if session
            .mdl_mut()
            .acquire_lock(MdlRequest::commit_intention(), timeout)
            .is_err()
        {
            // The branch must not be touched without the commit lock; the
            // redo log and binlog would diverge. It stays prepared.
            return Err(if commit { XaError::Retry } else { XaError::RmError });
        }

        self.backups.restore_backup(session.mdl_mut(), &xid.key());

        let gtid_result = self.gtid.commit_owned_gtids();
        if !commit {
            rb_error = branch.rollback_only_error();
        }

        // The branch's binlogged flag decides how the finalization event
        // is logged; it travels through the invoking session's state.
        if branch.is_binlogged() {
            session.xid_state().set_binlogged();
        } else {
            session.xid_state().unset_binlogged();
        }

        let commit_engines = commit && rb_error.is_none() && gtid_result.is_ok();
        let mut engine_error = None;
        for engine in self.engines.iter().filter(|e| e.supports_two_phase()) {
            let status = if commit_engines {
                engine.commit_by_xid(xid)
            } else {
                engine.rollback_by_xid(xid)
            };
            if !status.is_acceptable() {
                engine_error = Some(XaError::RmError);
                break;
            }
        }

        session.xid_state().unset_binlogged();
        self.backups.delete_backup(&xid.key());
        self.cache.delete(&ctx);
        self.gtid
            .commit_or_rollback(gtid_result.unwrap_or(true), gtid_result.is_ok());

        if commit {
            if let Some(e) = rb_error {
                return Err(e);
            }
            if gtid_result.is_err() {
                return Err(XaError::RbRollback);
            }
        } else {
            if gtid_result.is_err() {
                return Err(XaError::RbRollback);
            }
            if let Some(e) = rb_error {
                return Err(e);
            }
        }
        engine_error.map_or(Ok(()), Err)
    }

    /// Look up a detached branch for finalization and validate both sides:
    /// the invoking session must be outside any transaction, and the
    /// cached branch must be a recovery-owned prepared one.
    fn find_for_finalize(&self, session: &Session, xid: &Xid) -> Result<Arc<TransactionCtx>> {
        let state = session.xid_state().state();
        if state != XaState::NotR {
            return Err(XaError::RmFail { state: state.name() });
        }
        let ctx = match self.cache.search(xid) {
            Some(ctx) if ctx.xid_state().is_in_recovery() => ctx,
            _ => return Err(XaError::Nota),
        };
        if session.in_multi_stmt_transaction {
            return Err(XaError::RmFail { state: state.name() });
        }
        debug_assert_eq!(ctx.xid_state().state(), XaState::Prepared);
        Ok(ctx)
    }

    // === session teardown ===

    /// A disconnecting session hands a prepared branch over to the cache
    /// (with its metadata locks saved), so a different session or the next
    /// server incarnation can finalize it. Any other live branch is fully
    /// rolled back.
    pub fn disconnect_session(&self, session: &mut Session) {
        match session.xid_state().state() {
            XaState::Prepared => {
                let xid = session.xid_state().xid();
                debug!(branch = %session.xid_state().describe(), "detaching prepared branch");
                if let Err(e) = self
                    .backups
                    .create_backup_from_context(session.mdl(), &xid.key())
                {
                    error!(xid = %xid, error = %e, "cannot save metadata locks of prepared branch");
                }
                self.cache.detach(session.ctx());
            }
            XaState::Active | XaState::Idle | XaState::RollbackOnly => {
                if let Err(e) = self.force_rollback(session) {
                    error!(error = %e, "engine rollback failed during session teardown");
                }
                self.cache.delete(session.ctx());
            }
            XaState::NotR => {}
        }
        session.clear_transaction_state();
        session.xid_state().reset();
        session.reset_ctx();
        session.mdl_mut().release_transactional_locks();
    }

    // === XA RECOVER ===

    /// Emit one row per prepared branch in the cache. With `convert_xid`
    /// the data column is rendered as 0x-prefixed hex.
    pub fn xa_recover(
        &self,
        filter: Option<&Xid>,
        convert_xid: bool,
        out: &mut dyn RowWriter,
    ) -> usize {
        let mut rows = 0;
        self.cache.for_each(|ctx| {
            let xs = ctx.xid_state();
            if xs.state() == XaState::Prepared && filter.is_none_or(|f| xs.has_same_xid(f)) {
                out.begin_row();
                xs.store_xid_info(out, convert_xid);
                out.end_row();
                rows += 1;
            }
        });
        rows
    }

    // === startup and binlog hooks ===

    /// Run crash recovery: scan engines, decide every prepared branch, and
    /// install the retained ones into the cache with their metadata locks.
    pub fn recover_at_startup(
        &self,
        sets: Option<&BinlogRecoverySets>,
    ) -> Result<RecoveryReport> {
        let resolver = RecoveryResolver::new(&self.engines, sets, &self.config);
        let mut outcome = resolver.resolve()?;
        outcome.retained.install(&self.cache, &self.backups)?;
        self.registry.populate_from_recovery(&outcome.engine_prepared);
        Ok(outcome.report)
    }

    /// Collect externally prepared branches when recovery proper already
    /// ran: they go straight into the cache and the registry.
    pub fn fetch_prepared_at_startup(&self) -> Result<()> {
        let mut retained = RecoveredTransactions::new();
        fetch_prepared(&self.engines, &self.registry, &mut retained)?;
        retained.install(&self.cache, &self.backups)
    }

    /// Seed the registry from a binlog preamble: the prepared-id snapshot
    /// minus the ids the same file already finalized.
    pub fn seed_registry_from_binlog(
        &self,
        prepared: BTreeSet<Vec<u8>>,
        committed: &BTreeSet<Vec<u8>>,
        aborted: &BTreeSet<Vec<u8>>,
    ) {
        self.registry.populate_reconciled(prepared, committed, aborted);
    }

    /// Snapshot the prepared-id set into a binlog file preamble. Caller
    /// holds the rotation lock.
    pub fn serialize_prepared_ids(&self, out: &mut Vec<u8>) {
        self.registry.serialize_into(out);
    }

    // === shared internals ===

    fn prepare_engines(&self, ctx: &Arc<TransactionCtx>, xid: &Xid) -> Result<()> {
        for slot in ctx.engine_slots() {
            self.engines[slot]
                .prepare(xid)
                .map_err(|_| XaError::RmError)?;
        }
        Ok(())
    }

    fn rollback_engines_of(&self, ctx: &Arc<TransactionCtx>) {
        let xid = ctx.xid_state().xid();
        for slot in ctx.engine_slots() {
            if let Err(e) = self.engines[slot].rollback(&xid) {
                error!(xid = %xid, error = %e, "engine rollback failed");
            }
        }
    }

    /// Roll the session's own branch back in every participating engine.
    /// The recorded resource-manager error is cleared first, so this path
    /// reports success even when the branch failed earlier; the debug log
    /// records what was hidden.
    fn force_rollback(&self, session: &mut Session) -> Result<()> {
        let rm_error = session.xid_state().rm_error();
        if rm_error != 0 {
            debug!(rm_error, "clearing resource-manager error before forced rollback");
        }
        session.xid_state().reset_error();

        let xid = session.xid_state().xid();
        for slot in session.ctx().engine_slots() {
            self.engines[slot]
                .rollback(&xid)
                .map_err(|_| XaError::RmError)?;
        }
        Ok(())
    }

    /// One-phase commit of an IDLE branch. With several participating
    /// engines an internal two-phase round keeps them atomic.
    fn commit_one_phase(&self, session: &mut Session) -> Result<()> {
        let xid = session.xid_state().xid();
        let slots = session.ctx().engine_slots();

        if slots.len() > 1 {
            for &slot in &slots {
                if self.engines[slot].prepare(&xid).is_err() {
                    self.rollback_engines_of(session.ctx());
                    return Err(XaError::RbRollback);
                }
            }
        }
        for &slot in &slots {
            self.engines[slot]
                .commit(&xid)
                .map_err(|_| XaError::RmError)?;
        }
        Ok(())
    }

    /// Clear the session's transaction bits and drop the cache entry (if
    /// it is still this session's branch).
    fn cleanup_trans_state(&self, session: &mut Session) {
        session.clear_transaction_state();
        self.cache.delete(session.ctx());
    }

    /// Terminal transition of the session's own branch.
    fn terminate_own(&self, session: &mut Session) {
        self.cleanup_trans_state(session);
        session.xid_state().set_state(XaState::NotR);
        session.xid_state().unset_binlogged();
        session.ctx().cleanup();
        session.notify_state(XaState::NotR);
        session.observer().transaction_ended();
    }
}
