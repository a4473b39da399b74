//! Startup crash-recovery tests: engine-prepared branches against
//! binlog-derived decision sets

use std::sync::Arc;
use tandem_common::Xid;
use tandem_coordinator::binlog::BinlogRecoverySets;
use tandem_coordinator::row::VecRowWriter;
use tandem_coordinator::{
    CoordinatorConfig, HeuristicRecover, XaCoordinator, XaError, XaState,
};
use tandem_engine::{BranchPhase, MemoryEngine, StorageEngine, TableRef};

fn xid(s: &[u8]) -> Xid {
    Xid::new(1, s, b"").unwrap()
}

fn coordinator_with(
    config: CoordinatorConfig,
    engines: Vec<Arc<MemoryEngine>>,
) -> XaCoordinator {
    let dyn_engines: Vec<Arc<dyn StorageEngine>> = engines
        .into_iter()
        .map(|e| e as Arc<dyn StorageEngine>)
        .collect();
    XaCoordinator::new(config, dyn_engines)
}

fn sets_with_prepared(gtrids: &[&[u8]]) -> BinlogRecoverySets {
    let mut sets = BinlogRecoverySets::new();
    for gtrid in gtrids {
        sets.xa_prepared.insert(gtrid.to_vec());
    }
    sets
}

#[test]
fn test_orphan_engine_branch_is_rolled_back() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let x = xid(b"orphan");
    engine.seed_prepared(&x, &[], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine.clone()]);
    let sets = BinlogRecoverySets::new(); // nothing reached the binlog
    let report = coord.recover_at_startup(Some(&sets)).unwrap();

    assert_eq!(report.rolled_back, 1);
    assert_eq!(report.committed, 0);
    assert_eq!(engine.phase(&x), Some(BranchPhase::RolledBack));
    assert!(coord.cache().is_empty());

    let mut out = VecRowWriter::new();
    assert_eq!(coord.xa_recover(None, false, &mut out), 0);
}

#[test]
fn test_undecided_branch_is_retained_for_the_operator() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let x = xid(b"ext");
    engine.seed_prepared(&x, &[TableRef::new("app", "orders")], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine.clone()]);
    let report = coord
        .recover_at_startup(Some(&sets_with_prepared(&[b"ext"])))
        .unwrap();

    assert_eq!(report.found_foreign_xids, 1);
    assert_eq!(engine.phase(&x), Some(BranchPhase::Prepared));

    // Visible to XA RECOVER, with its metadata locks saved and the
    // prepared-id registry seeded.
    let cached = coord.cache().search(&x).unwrap();
    assert!(cached.xid_state().is_in_recovery());
    assert_eq!(cached.xid_state().state(), XaState::Prepared);
    assert!(coord.backups().has_backup(&x.key()));
    assert!(coord.registry().contains(b"ext"));

    let mut out = VecRowWriter::new();
    assert_eq!(coord.xa_recover(None, false, &mut out), 1);

    // The operator finalizes it.
    let mut session = coord.new_session(1);
    coord.xa_commit(&mut session, &x, false).unwrap();
    assert_eq!(engine.phase(&x), Some(BranchPhase::Committed));
    assert!(coord.cache().is_empty());
    assert!(!coord.backups().has_backup(&x.key()));
    assert!(!coord.registry().contains(b"ext"));
}

#[test]
fn test_binlog_decisions_commit_and_rollback() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let committed = xid(b"c1");
    let aborted = xid(b"a1");
    let one_phase = xid(b"cop");
    let leftover = xid(b"clone");
    engine.seed_prepared(&committed, &[], false);
    engine.seed_prepared(&aborted, &[], false);
    engine.seed_prepared(&one_phase, &[], false);
    engine.seed_prepared(&leftover, &[], true);

    let mut sets = sets_with_prepared(&[b"c1", b"a1", b"clone"]);
    sets.xa_committed.insert(b"c1".to_vec());
    sets.xa_aborted.insert(b"a1".to_vec());
    sets.xa_one_phase_committed.insert(b"cop".to_vec());

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine.clone()]);
    let report = coord.recover_at_startup(Some(&sets)).unwrap();

    assert_eq!(report.committed, 2);
    assert_eq!(report.rolled_back, 2);
    assert_eq!(report.found_foreign_xids, 0);
    assert_eq!(engine.phase(&committed), Some(BranchPhase::Committed));
    assert_eq!(engine.phase(&aborted), Some(BranchPhase::RolledBack));
    assert_eq!(engine.phase(&one_phase), Some(BranchPhase::Committed));
    assert_eq!(engine.phase(&leftover), Some(BranchPhase::RolledBack));
    assert!(coord.cache().is_empty());
}

#[test]
fn test_internal_branches_follow_the_commit_list() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let committed = Xid::internal(1, 42);
    let lost = Xid::internal(1, 43);
    engine.seed_prepared(&committed, &[], false);
    engine.seed_prepared(&lost, &[], false);

    let mut sets = BinlogRecoverySets::new();
    sets.commit_list.insert(42);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine.clone()]);
    let report = coord.recover_at_startup(Some(&sets)).unwrap();

    assert_eq!(report.committed, 1);
    assert_eq!(report.rolled_back, 1);
    assert_eq!(engine.phase(&committed), Some(BranchPhase::Committed));
    assert_eq!(engine.phase(&lost), Some(BranchPhase::RolledBack));
}

#[test]
fn test_dry_run_counts_without_acting() {
    // Two engines so the single-engine rollback forcing does not kick in.
    let e1 = Arc::new(MemoryEngine::new("memtree"));
    let e2 = Arc::new(MemoryEngine::new("pagestore"));
    let external = xid(b"ext");
    e1.seed_prepared(&external, &[], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![e1.clone(), e2]);
    let report = coord.recover_at_startup(None).unwrap();

    assert_eq!(report.found_foreign_xids, 1);
    assert_eq!(report.committed, 0);
    assert_eq!(report.rolled_back, 0);
    // Nothing acted on, nothing retained.
    assert_eq!(e1.phase(&external), Some(BranchPhase::Prepared));
    assert!(coord.cache().is_empty());
}

#[test]
fn test_dry_run_aborts_startup_on_internal_xids() {
    let e1 = Arc::new(MemoryEngine::new("memtree"));
    let e2 = Arc::new(MemoryEngine::new("pagestore"));
    e1.seed_prepared(&Xid::internal(1, 7), &[], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![e1.clone(), e2]);
    let err = coord.recover_at_startup(None).unwrap_err();

    assert!(matches!(err, XaError::InternalXidsFound { count: 1, .. }));
    assert_eq!(e1.phase(&Xid::internal(1, 7)), Some(BranchPhase::Prepared));
}

#[test]
fn test_heuristic_commit_applies_to_internal_branches() {
    let e1 = Arc::new(MemoryEngine::new("memtree"));
    let e2 = Arc::new(MemoryEngine::new("pagestore"));
    let internal = Xid::internal(1, 9);
    let external = xid(b"ext");
    e1.seed_prepared(&internal, &[], false);
    e1.seed_prepared(&external, &[], false);

    let config = CoordinatorConfig {
        tc_heuristic_recover: HeuristicRecover::Commit,
        ..CoordinatorConfig::default()
    };
    let coord = coordinator_with(config, vec![e1.clone(), e2]);
    let report = coord.recover_at_startup(None).unwrap();

    assert_eq!(report.committed, 1);
    assert_eq!(e1.phase(&internal), Some(BranchPhase::Committed));
    // External branches are never decided heuristically; they wait for
    // the transaction manager.
    assert_eq!(e1.phase(&external), Some(BranchPhase::Prepared));
    assert_eq!(report.found_foreign_xids, 1);
    assert!(coord.cache().search(&external).is_some());
}

#[test]
fn test_heuristic_rollback_rejected_with_multiple_engines() {
    let e1 = Arc::new(MemoryEngine::new("memtree"));
    let e2 = Arc::new(MemoryEngine::new("pagestore"));
    let config = CoordinatorConfig {
        tc_heuristic_recover: HeuristicRecover::Rollback,
        ..CoordinatorConfig::default()
    };
    let coord = coordinator_with(config, vec![e1, e2]);

    assert_eq!(
        coord.recover_at_startup(None),
        Err(XaError::NoMulti2pcHeuristicRecover)
    );
}

#[test]
fn test_single_engine_forces_rollback_of_internal_branches() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let internal = Xid::internal(1, 5);
    let external = xid(b"keep");
    engine.seed_prepared(&internal, &[], false);
    engine.seed_prepared(&external, &[], false);

    // No binlog decisions, no heuristic configured: with one two-phase
    // engine this is not a dry run, rollback is forced.
    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine.clone()]);
    let report = coord.recover_at_startup(None).unwrap();

    assert_eq!(report.rolled_back, 1);
    assert_eq!(engine.phase(&internal), Some(BranchPhase::RolledBack));
    assert_eq!(engine.phase(&external), Some(BranchPhase::Prepared));
    assert!(coord.cache().search(&external).is_some());
}

#[test]
fn test_engine_scan_failure_aborts_recovery() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    engine.fail_recover();

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine]);
    let err = coord
        .recover_at_startup(Some(&BinlogRecoverySets::new()))
        .unwrap_err();
    assert!(matches!(err, XaError::RecoveryFailed { .. }));
}

#[test]
fn test_nota_from_engine_finalization_is_tolerated() {
    // The branch exists in one engine only; the other answers Nota when
    // the commit decision fans out. Recovery must succeed.
    let e1 = Arc::new(MemoryEngine::new("memtree"));
    let e2 = Arc::new(MemoryEngine::new("pagestore"));
    let x = xid(b"half");
    e1.seed_prepared(&x, &[], false);

    let mut sets = sets_with_prepared(&[b"half"]);
    sets.xa_committed.insert(b"half".to_vec());

    let coord = coordinator_with(CoordinatorConfig::default(), vec![e1.clone(), e2.clone()]);
    let report = coord.recover_at_startup(Some(&sets)).unwrap();

    assert_eq!(report.committed, 1);
    assert_eq!(e1.phase(&x), Some(BranchPhase::Committed));
    assert_eq!(e2.phase(&x), None);
}

#[test]
fn test_fetch_prepared_fills_cache_and_registry() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let x = xid(b"fp");
    engine.seed_prepared(&x, &[TableRef::new("app", "t")], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine]);
    coord.fetch_prepared_at_startup().unwrap();

    assert!(coord.registry().contains(b"fp"));
    assert!(coord.cache().search(&x).is_some());
    assert!(coord.backups().has_backup(&x.key()));
}

#[test]
fn test_fetch_prepared_rejects_internal_xids() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    engine.seed_prepared(&Xid::internal(1, 11), &[], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine]);
    assert!(matches!(
        coord.fetch_prepared_at_startup(),
        Err(XaError::RecoveryFailed { .. })
    ));
}

#[test]
fn test_registry_snapshot_after_recovery() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    engine.seed_prepared(&xid(b"p1"), &[], false);
    engine.seed_prepared(&xid(b"p2"), &[], false);

    let coord = coordinator_with(CoordinatorConfig::default(), vec![engine]);
    coord
        .recover_at_startup(Some(&sets_with_prepared(&[b"p1", b"p2"])))
        .unwrap();

    let mut out = Vec::new();
    coord.serialize_prepared_ids(&mut out);
    let parsed = tandem_coordinator::registry::PreparedRegistry::parse(&out);
    assert!(parsed.contains(b"p1".as_slice()));
    assert!(parsed.contains(b"p2".as_slice()));
}

#[test]
fn test_seed_registry_from_binlog_preamble() {
    let coord = coordinator_with(CoordinatorConfig::default(), vec![]);
    let prepared = [b"x1".to_vec(), b"x2".to_vec(), b"x3".to_vec()]
        .into_iter()
        .collect();
    let committed = [b"x2".to_vec()].into_iter().collect();
    let aborted = std::collections::BTreeSet::new();

    coord.seed_registry_from_binlog(prepared, &committed, &aborted);
    assert!(coord.registry().contains(b"x1"));
    assert!(!coord.registry().contains(b"x2"));
    assert!(coord.registry().contains(b"x3"));
}
