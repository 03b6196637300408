//! Sharded Entry Store
//!
//! Holds every cache entry this node owns (as primary or backup) in a
//! sharded map with one mutex per shard. Shard locks guard only local
//! mutation; waiter wakeups collected under a lock are fired after it is
//! released, and no lock is ever held across a network call.
//!
//! The `EntryBackend` trait is the storage-layer collaborator invoked
//! during commit application; the default is a plain in-memory map.

use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use tokio::sync::oneshot;

use super::entry::{CacheEntry, Key, LockOutcome, Value, Wakeups};
use super::version::{GridVersion, TxXid};

const SHARD_COUNT: usize = 64;

/// Storage-layer failure during commit application. Captured per entry;
/// any failure moves the whole transaction to the heuristic Unknown
/// outcome rather than being masked.
#[derive(Debug, Clone, thiserror::Error)]
#[error("store failure on key {key}: {reason}")]
pub struct StoreError {
    pub key: Key,
    pub reason: String,
}

/// Storage collaborator behind each cache entry.
pub trait EntryBackend: Send + Sync {
    fn load(&self, key: &Key) -> Result<Option<(Value, GridVersion)>, StoreError>;
    fn store(&self, key: &Key, value: &Value, version: GridVersion) -> Result<(), StoreError>;
    fn remove(&self, key: &Key) -> Result<(), StoreError>;
}

/// Default in-memory backend.
#[derive(Default)]
pub struct MemoryBackend {
    data: DashMap<Key, (Value, GridVersion)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl EntryBackend for MemoryBackend {
    fn load(&self, key: &Key) -> Result<Option<(Value, GridVersion)>, StoreError> {
        Ok(self.data.get(key).map(|e| e.value().clone()))
    }

    fn store(&self, key: &Key, value: &Value, version: GridVersion) -> Result<(), StoreError> {
        self.data.insert(key.clone(), (value.clone(), version));
        Ok(())
    }

    fn remove(&self, key: &Key) -> Result<(), StoreError> {
        self.data.remove(key);
        Ok(())
    }
}

/// Backend that fails configured keys; drives the Unknown-outcome path in
/// tests.
#[cfg(test)]
#[derive(Default)]
pub struct FailingBackend {
    inner: MemoryBackend,
    fail_keys: DashMap<Key, ()>,
}

#[cfg(test)]
impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, key: &str) {
        self.fail_keys.insert(key.to_string(), ());
    }
}

#[cfg(test)]
impl EntryBackend for FailingBackend {
    fn load(&self, key: &Key) -> Result<Option<(Value, GridVersion)>, StoreError> {
        self.inner.load(key)
    }

    fn store(&self, key: &Key, value: &Value, version: GridVersion) -> Result<(), StoreError> {
        if self.fail_keys.contains_key(key) {
            return Err(StoreError {
                key: key.clone(),
                reason: "injected store failure".into(),
            });
        }
        self.inner.store(key, value, version)
    }

    fn remove(&self, key: &Key) -> Result<(), StoreError> {
        if self.fail_keys.contains_key(key) {
            return Err(StoreError {
                key: key.clone(),
                reason: "injected store failure".into(),
            });
        }
        self.inner.remove(key)
    }
}

/// Result of a lock attempt against one entry.
pub enum LockAttempt {
    /// The transaction owns the entry.
    Owned,
    /// Someone else owns it; the receiver resolves on ownership change.
    Waiting(oneshot::Receiver<LockOutcome>),
}

/// Sharded map of cache entries.
pub struct CacheStore {
    shards: Vec<Mutex<HashMap<Key, CacheEntry>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &Key) -> &Mutex<HashMap<Key, CacheEntry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() % SHARD_COUNT as u64) as usize]
    }

    fn fire(wakeups: Wakeups) {
        for (sender, outcome) in wakeups {
            let _ = sender.send(outcome);
        }
    }

    /// Adds a lock candidate for `xid`, creating the entry on first touch.
    /// Returns `Owned` when the candidate became (or already was) the
    /// owner, otherwise a receiver that resolves once ownership arrives.
    pub fn lock_or_wait(&self, key: &Key, xid: TxXid, near: bool) -> LockAttempt {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        let entry = shard
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()));

        if entry.add_candidate(xid, near) {
            LockAttempt::Owned
        } else {
            LockAttempt::Waiting(entry.register_waiter(xid))
        }
    }

    /// Registers a wait for ownership without adding a candidate. Used by
    /// the deferred commit path: the candidate was placed at prepare time,
    /// the finish message may just be ahead of the grant.
    pub fn wait_ownership(&self, key: &Key, xid: TxXid) -> oneshot::Receiver<LockOutcome> {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        let entry = shard
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()));
        entry.register_waiter(xid)
    }

    pub fn is_owner(&self, key: &Key, xid: TxXid) -> bool {
        let shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.get(key).map(|e| e.is_owner(xid)).unwrap_or(false)
    }

    /// Removes `xid`'s candidate, promoting and waking the next in line.
    pub fn remove_candidate(&self, key: &Key, xid: TxXid) {
        let mut wakeups = Wakeups::new();
        {
            let mut shard = self.shard(key).lock().expect("cache shard poisoned");
            if let Some(entry) = shard.get_mut(key) {
                entry.remove_candidate(xid, &mut wakeups);
            }
        }
        Self::fire(wakeups);
    }

    /// Releases every candidate a transaction holds across `keys`.
    pub fn release_all(&self, xid: TxXid, keys: &[Key]) {
        for key in keys {
            self.remove_candidate(key, xid);
        }
    }

    /// Forcibly fails all candidates and waiters on `key` (entry removal,
    /// eviction, or originating-node death).
    pub fn invalidate(&self, key: &Key) {
        let mut wakeups = Wakeups::new();
        {
            let mut shard = self.shard(key).lock().expect("cache shard poisoned");
            if let Some(entry) = shard.get_mut(key) {
                entry.invalidate_all(&mut wakeups);
            }
        }
        Self::fire(wakeups);
    }

    /// Current value and version of `key`, if the entry exists.
    pub fn read(&self, key: &Key) -> Option<(Option<Value>, GridVersion)> {
        let shard = self.shard(key).lock().expect("cache shard poisoned");
        shard
            .get(key)
            .map(|e| (e.value().cloned(), e.version()))
    }

    /// Applies a committed write at `version`. Rejects stale versions to
    /// keep per-key versions strictly increasing on this node.
    pub fn apply_write(
        &self,
        key: &Key,
        value: Option<Value>,
        version: GridVersion,
    ) -> Result<(), GridVersion> {
        let mut shard = self.shard(key).lock().expect("cache shard poisoned");
        let entry = shard
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()));
        entry.write(value, version)
    }

    /// Snapshot of the candidate owner for diagnostics and tests.
    pub fn owner_of(&self, key: &Key) -> Option<TxXid> {
        let shard = self.shard(key).lock().expect("cache shard poisoned");
        shard.get(key).and_then(|e| e.owner())
    }
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}
