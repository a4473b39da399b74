//! Concurrency properties: competing finalizers and commit-lock contention

use std::sync::{Arc, Barrier};
use std::time::Duration;
use tandem_common::Xid;
use tandem_coordinator::binlog::BinlogRecoverySets;
use tandem_coordinator::{CoordinatorConfig, StartOption, XaCoordinator, XaError, XaState};
use tandem_engine::{BranchPhase, MemoryEngine, StorageEngine};

fn xid(s: &[u8]) -> Xid {
    Xid::new(1, s, b"").unwrap()
}

/// A coordinator holding one retained prepared branch, as after restart.
fn coordinator_with_retained(gtrid: &[u8]) -> (Arc<XaCoordinator>, Arc<MemoryEngine>, Xid) {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let x = xid(gtrid);
    engine.seed_prepared(&x, &[], false);

    let engines: Vec<Arc<dyn StorageEngine>> = vec![engine.clone()];
    let coord = Arc::new(XaCoordinator::new(CoordinatorConfig::default(), engines));

    let mut sets = BinlogRecoverySets::new();
    sets.xa_prepared.insert(gtrid.to_vec());
    coord.recover_at_startup(Some(&sets)).unwrap();
    assert_eq!(coord.cache().len(), 1);

    (coord, engine, x)
}

#[test]
fn test_at_most_one_finalizer_wins() {
    for round in 0..16 {
        let (coord, engine, x) = coordinator_with_retained(b"p2c");
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2u64)
            .map(|id| {
                let coord = Arc::clone(&coord);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut session = coord.new_session(id);
                    barrier.wait();
                    coord.xa_commit(&mut session, &x, false)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let losers: Vec<_> = results.iter().filter_map(|r| r.clone().err()).collect();

        assert_eq!(ok, 1, "round {round}: exactly one finalizer must win");
        for err in losers {
            assert!(
                matches!(err, XaError::Nota | XaError::Retry),
                "round {round}: loser saw {err:?}"
            );
        }
        // Never two engine commits for the same branch.
        assert_eq!(engine.commit_transitions(&x), 1);
        assert!(coord.cache().is_empty());
    }
}

#[test]
fn test_commit_blocked_by_global_read_lock_is_retryable() {
    let (coord, engine, x) = coordinator_with_retained(b"locked");

    let guard = coord.mdl_manager().global_read_lock();
    let mut session = coord.new_session(1);
    session.lock_wait_timeout = Duration::from_millis(30);

    // Backup in progress: the finalization backs off without touching
    // anything.
    assert_eq!(coord.xa_commit(&mut session, &x, false), Err(XaError::Retry));
    assert_eq!(engine.phase(&x), Some(BranchPhase::Prepared));
    let cached = coord.cache().search(&x).unwrap();
    assert_eq!(cached.xid_state().state(), XaState::Prepared);

    // After the lock is released the same statement goes through.
    drop(guard);
    coord.xa_commit(&mut session, &x, false).unwrap();
    assert_eq!(engine.phase(&x), Some(BranchPhase::Committed));
    assert!(coord.cache().is_empty());
}

#[test]
fn test_rollback_blocked_by_global_read_lock_reports_rm_error() {
    let (coord, engine, x) = coordinator_with_retained(b"locked2");

    let guard = coord.mdl_manager().global_read_lock();
    let mut session = coord.new_session(1);
    session.lock_wait_timeout = Duration::from_millis(30);

    assert_eq!(coord.xa_rollback(&mut session, &x), Err(XaError::RmError));
    assert_eq!(engine.phase(&x), Some(BranchPhase::Prepared));

    drop(guard);
    coord.xa_rollback(&mut session, &x).unwrap();
    assert_eq!(engine.phase(&x), Some(BranchPhase::RolledBack));
}

#[test]
fn test_concurrent_start_with_same_xid() {
    let engine = Arc::new(MemoryEngine::new("memtree"));
    let engines: Vec<Arc<dyn StorageEngine>> = vec![engine];
    let coord = Arc::new(XaCoordinator::new(CoordinatorConfig::default(), engines));
    let x = xid(b"race");
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2u64)
        .map(|id| {
            let coord = Arc::clone(&coord);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let mut session = coord.new_session(id);
                barrier.wait();
                let result = coord.xa_start(&mut session, &x, StartOption::None);
                (result, session.xid_state().state())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = results.iter().filter(|(r, _)| r.is_ok()).count();
    assert_eq!(winners, 1);
    for (result, state) in &results {
        match result {
            Ok(()) => assert_eq!(*state, XaState::Active),
            Err(e) => {
                assert_eq!(*e, XaError::DupId);
                assert_eq!(*state, XaState::NotR);
            }
        }
    }
    assert_eq!(coord.cache().len(), 1);
}

#[test]
fn test_finalizers_race_against_prepare_latch() {
    // A finalizer that loses the race entirely (branch already gone) must
    // see Nota even when it arrives much later.
    let (coord, _engine, x) = coordinator_with_retained(b"late");

    let mut s1 = coord.new_session(1);
    coord.xa_commit(&mut s1, &x, false).unwrap();

    let mut s2 = coord.new_session(2);
    assert_eq!(coord.xa_commit(&mut s2, &x, false), Err(XaError::Nota));
    assert_eq!(coord.xa_rollback(&mut s2, &x), Err(XaError::Nota));
}
