//! Cache Entry and Lock Candidate Queue
//!
//! One `CacheEntry` serializes all concurrent access to one key. Lock
//! requests become candidates in a queue ordered FIFO by transaction
//! version; the head of the queue owns the entry. Removing the owner
//! promotes the next candidate and fires any waiters registered for it,
//! which is how a remote commit blocked behind an in-flight prepare
//! resumes automatically, even when messages arrived out of order.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::version::{GridVersion, TxXid};

pub type Key = String;
pub type Value = serde_json::Value;

/// What a lock waiter learns when its wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    /// The waiting transaction now owns the entry.
    Granted,
    /// The entry was removed/evicted or the candidate was discarded; the
    /// waiting transaction will never own it.
    Invalidated,
}

/// One transaction's pending or granted lock request on one entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockCandidate {
    /// Version of the owning transaction; the queue's fairness key.
    pub xid: TxXid,
    /// Placed by the near (originating) node rather than a remote primary.
    pub near: bool,
    /// Reentrancy count; the same transaction locking a key twice holds a
    /// single candidate.
    pub reentry: u32,
    /// Granted flag: true only for the queue head.
    pub owned: bool,
}

/// Wakeups collected while a shard lock is held, fired after it is
/// released so no waiter code ever runs under the entry's lock.
pub type Wakeups = Vec<(oneshot::Sender<LockOutcome>, LockOutcome)>;

/// Per-key value, version and candidate queue. Mutated only under the
/// owning shard's mutex.
#[derive(Debug)]
pub struct CacheEntry {
    key: Key,
    value: Option<Value>,
    version: GridVersion,
    candidates: Vec<LockCandidate>,
    waiters: Vec<(TxXid, oneshot::Sender<LockOutcome>)>,
}

impl CacheEntry {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            value: None,
            version: GridVersion::default(),
            candidates: Vec::new(),
            waiters: Vec::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn version(&self) -> GridVersion {
        self.version
    }

    pub fn candidates(&self) -> &[LockCandidate] {
        &self.candidates
    }

    /// Inserts a candidate for `xid`, or bumps its reentrancy count if one
    /// already exists. Returns true when the transaction owns the entry.
    ///
    /// Ordering rule: candidates queue FIFO by transaction version, but a
    /// late-arriving lower version never preempts the current owner; the
    /// head keeps ownership until it is removed.
    pub fn add_candidate(&mut self, xid: TxXid, near: bool) -> bool {
        if let Some(existing) = self.candidates.iter_mut().find(|c| c.xid == xid) {
            existing.reentry += 1;
            return existing.owned;
        }

        let owned = self.candidates.is_empty();
        let candidate = LockCandidate {
            xid,
            near,
            reentry: 1,
            owned,
        };

        if owned {
            self.candidates.push(candidate);
            return true;
        }

        // Insert into the non-owner tail, ordered by version.
        let pos = self.candidates[1..]
            .iter()
            .position(|c| c.xid > xid)
            .map(|i| i + 1)
            .unwrap_or(self.candidates.len());
        self.candidates.insert(pos, candidate);
        false
    }

    /// Removes `xid`'s candidate regardless of reentrancy. If it was the
    /// owner, promotes the next candidate and queues its waiters for
    /// wakeup. Returns true when ownership changed hands.
    pub fn remove_candidate(&mut self, xid: TxXid, wakeups: &mut Wakeups) -> bool {
        let Some(pos) = self.candidates.iter().position(|c| c.xid == xid) else {
            return false;
        };

        let was_owner = pos == 0 && self.candidates[0].owned;
        self.candidates.remove(pos);

        // Drop any waiters the removed transaction still had registered.
        let mut i = 0;
        while i < self.waiters.len() {
            if self.waiters[i].0 == xid {
                let (_, sender) = self.waiters.remove(i);
                wakeups.push((sender, LockOutcome::Invalidated));
            } else {
                i += 1;
            }
        }

        if was_owner {
            if let Some(next) = self.candidates.first_mut() {
                next.owned = true;
                let next_xid = next.xid;
                let mut i = 0;
                while i < self.waiters.len() {
                    if self.waiters[i].0 == next_xid {
                        let (_, sender) = self.waiters.remove(i);
                        wakeups.push((sender, LockOutcome::Granted));
                    } else {
                        i += 1;
                    }
                }
            }
            return true;
        }

        false
    }

    pub fn is_owner(&self, xid: TxXid) -> bool {
        self.candidates
            .first()
            .map(|c| c.owned && c.xid == xid)
            .unwrap_or(false)
    }

    pub fn owner(&self) -> Option<TxXid> {
        self.candidates
            .first()
            .filter(|c| c.owned)
            .map(|c| c.xid)
    }

    /// Forcibly fails every candidate and waiter. Used on entry removal or
    /// eviction and when a transaction's originating node dies.
    pub fn invalidate_all(&mut self, wakeups: &mut Wakeups) {
        self.candidates.clear();
        for (_, sender) in self.waiters.drain(..) {
            wakeups.push((sender, LockOutcome::Invalidated));
        }
    }

    /// Registers a wait for `xid` to own this entry. Resolves immediately
    /// when it already does, or when it holds no candidate at all (nothing
    /// will ever grant it).
    pub fn register_waiter(&mut self, xid: TxXid) -> oneshot::Receiver<LockOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.is_owner(xid) {
            let _ = tx.send(LockOutcome::Granted);
        } else if !self.candidates.iter().any(|c| c.xid == xid) {
            let _ = tx.send(LockOutcome::Invalidated);
        } else {
            self.waiters.push((xid, tx));
        }
        rx
    }

    /// Applies a committed write. The version must strictly exceed the
    /// entry's current version; stale writes are rejected, which is what
    /// keeps per-key versions monotone on every node that sees them.
    pub fn write(&mut self, value: Option<Value>, version: GridVersion) -> Result<(), GridVersion> {
        if version <= self.version {
            return Err(self.version);
        }
        self.value = value;
        self.version = version;
        Ok(())
    }
}
