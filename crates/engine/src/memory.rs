//! In-memory storage engine
//!
//! Tracks branches through `Active → Prepared → {Committed, RolledBack}`
//! and answers the recovery scan from its prepared set. Failure injection
//! hooks drive the coordinator's error-path tests.

use crate::engine::{EngineError, RecoveredBranch, StorageEngine, TableRef};
use parking_lot::Mutex;
use std::collections::HashMap;
use tandem_common::{RmCode, XaStatus, Xid};

/// Lifecycle phase of one branch inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Default)]
struct Branch {
    phase: Option<BranchPhase>,
    mod_tables: Vec<TableRef>,
    one_phase_prepared: bool,
    /// How many times this branch actually transitioned into Committed.
    commit_transitions: usize,
}

#[derive(Default)]
struct Inner {
    branches: HashMap<Xid, Branch>,
    fail_next_prepare: Option<RmCode>,
    fail_next_commit: Option<RmCode>,
    fail_recover: bool,
    force_commit_by_xid: Option<XaStatus>,
    force_rollback_by_xid: Option<XaStatus>,
}

/// In-memory [`StorageEngine`] used by tests.
pub struct MemoryEngine {
    name: String,
    two_phase: bool,
    inner: Mutex<Inner>,
}

impl MemoryEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            two_phase: true,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// An engine that sits out two-phase commit and recovery.
    pub fn without_two_phase(name: impl Into<String>) -> Self {
        Self {
            two_phase: false,
            ..Self::new(name)
        }
    }

    /// Register work for a branch, as statement execution would.
    pub fn begin_branch(&self, xid: &Xid, tables: &[TableRef]) {
        let mut inner = self.inner.lock();
        let branch = inner.branches.entry(*xid).or_default();
        branch.phase = Some(BranchPhase::Active);
        branch.mod_tables.extend_from_slice(tables);
    }

    /// Place a branch directly in the prepared state, as a previous server
    /// incarnation would have left it. For recovery tests.
    pub fn seed_prepared(&self, xid: &Xid, tables: &[TableRef], one_phase_prepared: bool) {
        let mut inner = self.inner.lock();
        inner.branches.insert(
            *xid,
            Branch {
                phase: Some(BranchPhase::Prepared),
                mod_tables: tables.to_vec(),
                one_phase_prepared,
                commit_transitions: 0,
            },
        );
    }

    pub fn phase(&self, xid: &Xid) -> Option<BranchPhase> {
        self.inner.lock().branches.get(xid).and_then(|b| b.phase)
    }

    /// Number of times the branch transitioned into Committed. At most one
    /// finalizer may ever observe an engine commit for a given XID.
    pub fn commit_transitions(&self, xid: &Xid) -> usize {
        self.inner
            .lock()
            .branches
            .get(xid)
            .map_or(0, |b| b.commit_transitions)
    }

    pub fn fail_next_prepare(&self, kind: RmCode) {
        self.inner.lock().fail_next_prepare = Some(kind);
    }

    pub fn fail_next_commit(&self, kind: RmCode) {
        self.inner.lock().fail_next_commit = Some(kind);
    }

    pub fn fail_recover(&self) {
        self.inner.lock().fail_recover = true;
    }

    pub fn force_commit_by_xid(&self, status: XaStatus) {
        self.inner.lock().force_commit_by_xid = Some(status);
    }

    pub fn force_rollback_by_xid(&self, status: XaStatus) {
        self.inner.lock().force_rollback_by_xid = Some(status);
    }
}

impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_two_phase(&self) -> bool {
        self.two_phase
    }

    fn prepare(&self, xid: &Xid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(kind) = inner.fail_next_prepare.take() {
            return Err(EngineError::new(kind, "injected prepare failure"));
        }
        match inner.branches.get_mut(xid) {
            Some(branch) if branch.phase == Some(BranchPhase::Active) => {
                branch.phase = Some(BranchPhase::Prepared);
                Ok(())
            }
            _ => Err(EngineError::other(format!(
                "prepare of unknown branch {xid}"
            ))),
        }
    }

    fn commit(&self, xid: &Xid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(kind) = inner.fail_next_commit.take() {
            return Err(EngineError::new(kind, "injected commit failure"));
        }
        if let Some(branch) = inner.branches.get_mut(xid) {
            if matches!(
                branch.phase,
                Some(BranchPhase::Active) | Some(BranchPhase::Prepared)
            ) {
                branch.phase = Some(BranchPhase::Committed);
                branch.commit_transitions += 1;
            }
        }
        // A branch the engine never saw carries no work to commit.
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), EngineError> {
        let mut inner = self.inner.lock();
        if let Some(branch) = inner.branches.get_mut(xid) {
            if matches!(
                branch.phase,
                Some(BranchPhase::Active) | Some(BranchPhase::Prepared)
            ) {
                branch.phase = Some(BranchPhase::RolledBack);
            }
        }
        Ok(())
    }

    fn commit_by_xid(&self, xid: &Xid) -> XaStatus {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.force_commit_by_xid.take() {
            return status;
        }
        match inner.branches.get_mut(xid) {
            Some(branch) if branch.phase == Some(BranchPhase::Prepared) => {
                branch.phase = Some(BranchPhase::Committed);
                branch.commit_transitions += 1;
                XaStatus::Ok
            }
            _ => XaStatus::Nota,
        }
    }

    fn rollback_by_xid(&self, xid: &Xid) -> XaStatus {
        let mut inner = self.inner.lock();
        if let Some(status) = inner.force_rollback_by_xid.take() {
            return status;
        }
        match inner.branches.get_mut(xid) {
            Some(branch) if branch.phase == Some(BranchPhase::Prepared) => {
                branch.phase = Some(BranchPhase::RolledBack);
                XaStatus::Ok
            }
            _ => XaStatus::Nota,
        }
    }

    fn recover(&self) -> Result<Vec<RecoveredBranch>, EngineError> {
        let inner = self.inner.lock();
        if inner.fail_recover {
            return Err(EngineError::other("injected recover failure"));
        }
        Ok(inner
            .branches
            .iter()
            .filter(|(_, b)| b.phase == Some(BranchPhase::Prepared))
            .map(|(xid, b)| RecoveredBranch {
                xid: *xid,
                mod_tables: b.mod_tables.clone(),
                one_phase_prepared: b.one_phase_prepared,
            })
            .collect())
    }

    fn supports_detach(&self) -> bool {
        true
    }
}
