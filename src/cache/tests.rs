//! Cache Module Tests
//!
//! Validates the lock candidate queue discipline (FIFO fairness, ownership
//! promotion, out-of-order arrival), waiter wakeups and per-key version
//! monotonicity.

use super::entry::{CacheEntry, LockOutcome, Wakeups};
use super::store::{CacheStore, EntryBackend, LockAttempt, MemoryBackend};
use super::version::{GridVersion, TxXid, VersionSource};
use serde_json::json;

fn xid(order: u64) -> TxXid {
    TxXid(GridVersion {
        topology: 1,
        order,
        node_order: 1,
    })
}

// ============================================================
// CANDIDATE QUEUE TESTS
// ============================================================

#[test]
fn test_first_candidate_owns_entry() {
    let mut entry = CacheEntry::new("k".into());
    assert!(entry.add_candidate(xid(1), true));
    assert!(entry.is_owner(xid(1)));
    assert!(!entry.add_candidate(xid(2), false));
    assert!(!entry.is_owner(xid(2)));
}

#[test]
fn test_fifo_fairness_on_owner_removal() {
    let mut entry = CacheEntry::new("k".into());
    entry.add_candidate(xid(1), true);
    entry.add_candidate(xid(3), false);
    entry.add_candidate(xid(2), false);

    let mut wakeups = Wakeups::new();
    assert!(entry.remove_candidate(xid(1), &mut wakeups));

    // The earliest still-pending candidate must be promoted, not the one
    // that happened to arrive first.
    assert!(entry.is_owner(xid(2)));
    assert!(!entry.is_owner(xid(3)));

    assert!(entry.remove_candidate(xid(2), &mut wakeups));
    assert!(entry.is_owner(xid(3)));
}

#[test]
fn test_late_lower_version_does_not_preempt_owner() {
    let mut entry = CacheEntry::new("k".into());
    entry.add_candidate(xid(5), true);

    // A commit message raced ahead of its lock grant: a candidate with a
    // lower version arrives while a higher one already owns the entry.
    assert!(!entry.add_candidate(xid(2), false));
    assert!(entry.is_owner(xid(5)));

    let mut wakeups = Wakeups::new();
    entry.remove_candidate(xid(5), &mut wakeups);
    assert!(entry.is_owner(xid(2)));
}

#[test]
fn test_reentrant_candidate_is_not_duplicated() {
    let mut entry = CacheEntry::new("k".into());
    assert!(entry.add_candidate(xid(1), true));
    assert!(entry.add_candidate(xid(1), true));
    assert_eq!(entry.candidates().len(), 1);
    assert_eq!(entry.candidates()[0].reentry, 2);

    // A single removal releases the lock regardless of reentrancy.
    let mut wakeups = Wakeups::new();
    entry.remove_candidate(xid(1), &mut wakeups);
    assert!(entry.owner().is_none());
}

#[test]
fn test_removing_non_owner_keeps_owner() {
    let mut entry = CacheEntry::new("k".into());
    entry.add_candidate(xid(1), true);
    entry.add_candidate(xid(2), false);
    entry.add_candidate(xid(3), false);

    let mut wakeups = Wakeups::new();
    assert!(!entry.remove_candidate(xid(2), &mut wakeups));
    assert!(entry.is_owner(xid(1)));
    assert_eq!(entry.candidates().len(), 2);
}

// ============================================================
// WAITER TESTS
// ============================================================

#[tokio::test]
async fn test_waiter_resumes_on_owner_change() {
    let store = CacheStore::new();
    let key = "k".to_string();

    assert!(matches!(
        store.lock_or_wait(&key, xid(1), true),
        LockAttempt::Owned
    ));

    let LockAttempt::Waiting(rx) = store.lock_or_wait(&key, xid(2), false) else {
        panic!("second candidate must wait");
    };

    store.remove_candidate(&key, xid(1));

    assert_eq!(rx.await.unwrap(), LockOutcome::Granted);
    assert!(store.is_owner(&key, xid(2)));
}

#[tokio::test]
async fn test_invalidate_fails_all_waiters() {
    let store = CacheStore::new();
    let key = "k".to_string();

    store.lock_or_wait(&key, xid(1), true);
    let LockAttempt::Waiting(rx_a) = store.lock_or_wait(&key, xid(2), false) else {
        panic!("must wait");
    };
    let LockAttempt::Waiting(rx_b) = store.lock_or_wait(&key, xid(3), false) else {
        panic!("must wait");
    };

    store.invalidate(&key);

    assert_eq!(rx_a.await.unwrap(), LockOutcome::Invalidated);
    assert_eq!(rx_b.await.unwrap(), LockOutcome::Invalidated);
    assert!(store.owner_of(&key).is_none());
}

#[tokio::test]
async fn test_wait_ownership_without_candidate_resolves_invalidated() {
    let store = CacheStore::new();
    let key = "k".to_string();

    // No candidate for this xid exists, so nothing will ever grant it.
    let rx = store.wait_ownership(&key, xid(9));
    assert_eq!(rx.await.unwrap(), LockOutcome::Invalidated);
}

#[tokio::test]
async fn test_wait_ownership_for_current_owner_is_immediate() {
    let store = CacheStore::new();
    let key = "k".to_string();
    store.lock_or_wait(&key, xid(1), true);

    let rx = store.wait_ownership(&key, xid(1));
    assert_eq!(rx.await.unwrap(), LockOutcome::Granted);
}

// ============================================================
// VERSION TESTS
// ============================================================

#[test]
fn test_writes_apply_in_strictly_increasing_version_order() {
    let store = CacheStore::new();
    let source = VersionSource::new(1);
    let key = "k".to_string();

    let v1 = source.next();
    store.apply_write(&key, Some(json!(1)), v1).unwrap();

    let v2 = source.after(v1);
    assert!(v2 > v1);
    store.apply_write(&key, Some(json!(2)), v2).unwrap();

    // Replaying an older write must be rejected.
    assert!(store.apply_write(&key, Some(json!(0)), v1).is_err());

    let (value, version) = store.read(&key).unwrap();
    assert_eq!(value, Some(json!(2)));
    assert_eq!(version, v2);
}

#[test]
fn test_version_source_advances_past_observed_stamps() {
    let local = VersionSource::new(1);
    let remote = VersionSource::new(2);

    let seen = GridVersion {
        topology: 3,
        order: 100,
        node_order: 2,
    };
    local.observe(seen);

    let next = local.next();
    assert!(next > seen, "{} must exceed observed {}", next, seen);
    assert_eq!(next.node_order, 1);

    // Two sources never issue equal stamps: node order breaks ties.
    let a = local.next();
    let b = remote.next();
    assert_ne!(a, b);
}

#[test]
fn test_memory_backend_round_trip() {
    let backend = MemoryBackend::new();
    let source = VersionSource::new(1);
    let v = source.next();

    backend.store(&"k".to_string(), &json!({"a": 1}), v).unwrap();
    let loaded = backend.load(&"k".to_string()).unwrap().unwrap();
    assert_eq!(loaded.0, json!({"a": 1}));
    assert_eq!(loaded.1, v);

    backend.remove(&"k".to_string()).unwrap();
    assert!(backend.load(&"k".to_string()).unwrap().is_none());
}
