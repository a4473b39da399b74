//! Crash recovery of prepared branches
//!
//! Runs once at startup, after engines have opened their logs and before
//! client connections are accepted. Each engine reports its prepared
//! branches; every branch is classified (internal vs external) and decided:
//! commit, roll back, or retain for the external transaction manager.
//! Retained branches are installed into the transaction cache with their
//! table locks rebuilt, so a later session (or operator) can finalize them.

use crate::binlog::BinlogRecoverySets;
use crate::cache::TransactionCache;
use crate::config::{CoordinatorConfig, HeuristicRecover};
use crate::error::XaError;
use crate::mdl::{MdlBackupManager, MdlRequest};
use crate::registry::PreparedRegistry;
use std::collections::BTreeSet;
use std::sync::Arc;
use tandem_common::Xid;
use tandem_engine::{RecoveredBranch, StorageEngine};
use tracing::{info, warn};

/// What to do with one engine-prepared branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Commit,
    Rollback,
    Retain,
}

/// Decide an external branch's fate from the binlog sets.
fn decide_external(sets: &BinlogRecoverySets, gtrid: &[u8], one_phase_prepared: bool) -> Decision {
    if sets.xa_one_phase_committed.contains(gtrid) {
        // Already in the binlog as a finished one-phase commit; the engine
        // just never got the memo.
        return Decision::Commit;
    }
    if !sets.xa_prepared.contains(gtrid) {
        // Prepared in the engine but never reached the binlog.
        return Decision::Rollback;
    }
    if sets.xa_committed.contains(gtrid) {
        return Decision::Commit;
    }
    if sets.xa_aborted.contains(gtrid) {
        return Decision::Rollback;
    }
    if one_phase_prepared {
        // Only possible on the first startup of a cloned instance.
        return Decision::Rollback;
    }
    Decision::Retain
}

/// External branch fate when no binlog decisions are available.
fn decide_external_without_binlog(one_phase_prepared: bool) -> Decision {
    if one_phase_prepared {
        Decision::Rollback
    } else {
        Decision::Retain
    }
}

/// Internal branch fate: the binlog commit list decides, or the operator's
/// heuristic when the binlog is not consulted.
fn decide_internal(
    my_xid: u64,
    sets: Option<&BinlogRecoverySets>,
    heuristic: HeuristicRecover,
) -> Decision {
    match sets {
        Some(sets) if sets.commit_list.contains(&my_xid) => Decision::Commit,
        Some(_) => Decision::Rollback,
        None if heuristic == HeuristicRecover::Commit => Decision::Commit,
        None => Decision::Rollback,
    }
}

/// External branches the scan decided to keep prepared, pending
/// installation into the cache.
#[derive(Debug, Default)]
pub struct RecoveredTransactions {
    branches: Vec<RecoveredBranch>,
}

impl RecoveredTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, branch: RecoveredBranch) {
        self.branches.push(branch);
    }

    pub fn branches(&self) -> &[RecoveredBranch] {
        &self.branches
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    pub fn clear(&mut self) {
        self.branches.clear();
    }

    /// Insert every retained branch into the cache and rebuild its table
    /// locks under the metadata-lock backup keyed by the branch's XID.
    /// The locks taken before the crash are unknown, so shared-write is
    /// requested for every modified table.
    pub fn install(
        &mut self,
        cache: &TransactionCache,
        backups: &MdlBackupManager,
    ) -> Result<(), XaError> {
        for branch in &self.branches {
            cache.insert_recovery(&branch.xid);

            let requests: Vec<MdlRequest> = branch
                .mod_tables
                .iter()
                .map(|t| MdlRequest::shared_write_table(&*t.db, &*t.table))
                .collect();
            backups
                .create_backup(&branch.xid.key(), requests)
                .map_err(|e| XaError::RecoveryFailed {
                    reason: format!("cannot save metadata locks for {}: {e}", branch.xid),
                })?;
        }
        self.branches.clear();
        Ok(())
    }
}

/// Outcome counters for logging and verification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub found_foreign_xids: usize,
    pub found_my_xids: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

/// Everything the startup scan produced.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub report: RecoveryReport,
    pub retained: RecoveredTransactions,
    /// Gtrids of branches left prepared in engines, for the prepared-id
    /// registry.
    pub engine_prepared: BTreeSet<Vec<u8>>,
}

/// Startup resolver reconciling engine-prepared branches against the
/// binlog-derived sets.
pub struct RecoveryResolver<'a> {
    engines: &'a [Arc<dyn StorageEngine>],
    sets: Option<&'a BinlogRecoverySets>,
    config: &'a CoordinatorConfig,
}

impl<'a> RecoveryResolver<'a> {
    pub fn new(
        engines: &'a [Arc<dyn StorageEngine>],
        sets: Option<&'a BinlogRecoverySets>,
        config: &'a CoordinatorConfig,
    ) -> Self {
        Self {
            engines,
            sets,
            config,
        }
    }

    /// Scan every two-phase engine and decide each prepared branch. Any
    /// hard engine error aborts recovery and the server must not start.
    pub fn resolve(&self) -> Result<RecoveryOutcome, XaError> {
        let mut outcome = RecoveryOutcome::default();

        let two_phase: Vec<&Arc<dyn StorageEngine>> = self
            .engines
            .iter()
            .filter(|e| e.supports_two_phase())
            .collect();
        if two_phase.is_empty() {
            return Ok(outcome);
        }

        // The binlog decides, or the operator's heuristic does; never both.
        debug_assert!(
            self.sets.is_none() || self.config.tc_heuristic_recover == HeuristicRecover::NotUsed
        );

        let mut heuristic = self.config.tc_heuristic_recover;
        let mut dry_run = self.sets.is_none() && heuristic == HeuristicRecover::NotUsed;

        if self.sets.is_some() {
            info!("starting XA crash recovery");
        }

        if two_phase.len() > 1 {
            if heuristic == HeuristicRecover::Rollback {
                return Err(XaError::NoMulti2pcHeuristicRecover);
            }
        } else {
            // With a single two-phase engine it is always safe to roll
            // back; the setting is ignored under binlog recovery.
            heuristic = HeuristicRecover::Rollback;
            dry_run = false;
        }

        for &engine in &two_phase {
            let branches = engine.recover().map_err(|e| XaError::RecoveryFailed {
                reason: format!("prepared-branch scan failed in {}: {e}", engine.name()),
            })?;
            if branches.is_empty() {
                continue;
            }
            info!(
                engine = engine.name(),
                count = branches.len(),
                "found prepared transactions"
            );

            for branch in branches {
                let my_xid = branch.xid.my_xid();
                if my_xid == 0 {
                    self.resolve_external(engine.as_ref(), branch, dry_run, &mut outcome)?;
                } else {
                    self.resolve_internal(engine.as_ref(), &branch.xid, my_xid, heuristic, dry_run, &mut outcome)?;
                }
            }
        }

        if outcome.report.found_foreign_xids > 0 {
            info!(
                count = outcome.report.found_foreign_xids,
                "found prepared external XA transactions"
            );
        }
        if dry_run && outcome.report.found_my_xids > 0 {
            return Err(XaError::InternalXidsFound {
                count: outcome.report.found_my_xids,
                log_file: self.config.tc_log_file.clone(),
            });
        }
        if self.sets.is_some() {
            info!("XA crash recovery finished");
        }
        Ok(outcome)
    }

    fn resolve_external(
        &self,
        engine: &dyn StorageEngine,
        branch: RecoveredBranch,
        dry_run: bool,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), XaError> {
        if dry_run {
            outcome.report.found_foreign_xids += 1;
            return Ok(());
        }

        let decision = match self.sets {
            Some(sets) => decide_external(sets, branch.xid.gtrid(), branch.one_phase_prepared),
            None => decide_external_without_binlog(branch.one_phase_prepared),
        };
        match decision {
            Decision::Commit => {
                finalize_in_engine(engine, &branch.xid, true)?;
                outcome.report.committed += 1;
            }
            Decision::Rollback => {
                finalize_in_engine(engine, &branch.xid, false)?;
                outcome.report.rolled_back += 1;
                if self.sets.is_none() {
                    warn!(
                        xid = %branch.xid,
                        "rolled back an engine-prepared branch outside binlog recovery; \
                         expected only on the first startup of a cloned instance"
                    );
                }
            }
            Decision::Retain => {
                outcome.engine_prepared.insert(branch.xid.gtrid().to_vec());
                outcome.report.found_foreign_xids += 1;
                outcome.retained.add(branch);
            }
        }
        Ok(())
    }

    fn resolve_internal(
        &self,
        engine: &dyn StorageEngine,
        xid: &Xid,
        my_xid: u64,
        heuristic: HeuristicRecover,
        dry_run: bool,
        outcome: &mut RecoveryOutcome,
    ) -> Result<(), XaError> {
        if dry_run {
            outcome.report.found_my_xids += 1;
            return Ok(());
        }
        match decide_internal(my_xid, self.sets, heuristic) {
            Decision::Commit => {
                finalize_in_engine(engine, xid, true)?;
                outcome.report.committed += 1;
            }
            _ => {
                finalize_in_engine(engine, xid, false)?;
                outcome.report.rolled_back += 1;
            }
        }
        Ok(())
    }
}

fn finalize_in_engine(engine: &dyn StorageEngine, xid: &Xid, commit: bool) -> Result<(), XaError> {
    let status = if commit {
        info!(xid = %xid, engine = engine.name(), "committing prepared branch");
        engine.commit_by_xid(xid)
    } else {
        info!(xid = %xid, engine = engine.name(), "rolling back prepared branch");
        engine.rollback_by_xid(xid)
    };
    // The branch legitimately may not exist in every engine.
    if !status.is_acceptable() {
        return Err(XaError::RecoveryFailed {
            reason: format!(
                "engine {} answered {status:?} while finalizing {xid}",
                engine.name()
            ),
        });
    }
    Ok(())
}

/// Collect externally prepared branches without making binlog decisions:
/// the path taken when recovery proper already ran elsewhere. Finding an
/// internal XID here means recovery was skipped when it should not have
/// been.
pub fn fetch_prepared(
    engines: &[Arc<dyn StorageEngine>],
    registry: &PreparedRegistry,
    retained: &mut RecoveredTransactions,
) -> Result<(), XaError> {
    for engine in engines.iter().filter(|e| e.supports_two_phase()) {
        let branches = engine.recover().map_err(|e| XaError::RecoveryFailed {
            reason: format!("prepared-branch scan failed in {}: {e}", engine.name()),
        })?;
        if branches.is_empty() {
            continue;
        }
        info!(
            engine = engine.name(),
            count = branches.len(),
            "found prepared transactions"
        );
        for branch in branches {
            let my_xid = branch.xid.my_xid();
            if my_xid != 0 {
                return Err(XaError::RecoveryFailed {
                    reason: format!(
                        "found internal XID {my_xid} in {} although recovery was skipped",
                        engine.name()
                    ),
                });
            }
            registry.add_id(branch.xid.gtrid());
            retained.add(branch);
        }
    }
    Ok(())
}
