//! Transaction Object
//!
//! Mutable record of one transaction on its near (originating) node: the
//! read and write sets, the per-node mappings, and the state machine token.
//! The owning thread mutates it freely until prepare begins; afterwards
//! only protocol callbacks touch it, and every state change goes through a
//! compare-and-set so concurrent triggers resolve to "another thread
//! already handled it".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::cache::{GridVersion, Key, TxXid, Value};
use crate::membership::types::NodeId;
use crate::topology::TopologySnapshot;

use super::error::TxnError;
use super::protocol::EntryPayload;

/// Concurrency control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Concurrency {
    /// Locks acquired at prepare time; read versions validated.
    Optimistic,
    /// Locks acquired at operation time.
    Pessimistic,
}

/// Isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Per-entry operation recorded by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryOp {
    /// Read-set entry; exists for version validation, skipped at commit.
    Read,
    /// Create-or-update; the primary resolves which at apply time.
    Update,
    Delete,
}

/// Transaction lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    Active = 0,
    Preparing = 1,
    Prepared = 2,
    Committing = 3,
    Committed = 4,
    RollingBack = 5,
    RolledBack = 6,
    /// Heuristic outcome: commit was attempted but its result can't be
    /// confirmed.
    Unknown = 7,
}

impl TxState {
    fn from_u8(raw: u8) -> TxState {
        match raw {
            0 => TxState::Active,
            1 => TxState::Preparing,
            2 => TxState::Prepared,
            3 => TxState::Committing,
            4 => TxState::Committed,
            5 => TxState::RollingBack,
            6 => TxState::RolledBack,
            _ => TxState::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::Unknown
        )
    }

    /// Legal state-machine edges. `Unknown` is reachable from any in-flight
    /// state; rollback is allowed from any non-terminal state.
    pub fn can_transition(self, to: TxState) -> bool {
        if to == TxState::Unknown {
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (TxState::Active, TxState::Preparing)
                | (TxState::Active, TxState::RollingBack)
                | (TxState::Preparing, TxState::Prepared)
                | (TxState::Preparing, TxState::RollingBack)
                | (TxState::Prepared, TxState::Committing)
                | (TxState::Prepared, TxState::RollingBack)
                | (TxState::Committing, TxState::Committed)
                | (TxState::RollingBack, TxState::RolledBack)
        )
    }
}

/// Final outcome reported to the caller. Never a silent partial commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
    /// Optimistic validation failed; nothing was applied anywhere.
    Conflict,
    /// Heuristic outcome: the commit was attempted but a mid-commit failure
    /// left its result unconfirmed.
    Unknown,
}

/// Keys routed to one participating node.
#[derive(Debug, Clone)]
pub struct NodeMapping {
    pub node: NodeId,
    /// Keys assigned to this node, in the order the application touched
    /// them.
    pub keys: Vec<Key>,
    /// Locks were already placed at operation time (pessimistic).
    pub explicit_lock: bool,
}

/// One (key, operation, value) pair in the transaction's read or write set.
#[derive(Debug, Clone)]
pub struct TxEntry {
    pub key: Key,
    pub op: EntryOp,
    pub value: Option<Value>,
    /// Version observed when the key was read, if it was.
    pub read_version: Option<GridVersion>,
    /// Value observed at read time, served again under repeatable-read.
    pub read_value: Option<Value>,
    pub partition: u32,
}

#[derive(Default)]
struct TxInner {
    /// Read and write sets combined, in insertion order.
    entries: Vec<TxEntry>,
    mappings: BTreeMap<NodeId, NodeMapping>,
}

/// A single transaction as seen by its near node.
pub struct Transaction {
    xid: TxXid,
    concurrency: Concurrency,
    isolation: Isolation,
    state: AtomicU8,
    /// Topology version pinned on the first operation; 0 = unpinned.
    topology_version: AtomicU64,
    inner: Mutex<TxInner>,
}

impl Transaction {
    pub fn new(xid: TxXid, concurrency: Concurrency, isolation: Isolation) -> Self {
        Self {
            xid,
            concurrency,
            isolation,
            state: AtomicU8::new(TxState::Active as u8),
            topology_version: AtomicU64::new(0),
            inner: Mutex::new(TxInner::default()),
        }
    }

    pub fn xid(&self) -> TxXid {
        self.xid
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn state(&self) -> TxState {
        TxState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Compare-and-set state transition. Returns false when the target is
    /// no longer reachable from the current state; callers treat that as
    /// "another thread already handled it".
    pub fn try_transition(&self, to: TxState) -> bool {
        loop {
            let current = self.state();
            if !current.can_transition(to) {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current as u8,
                    to as u8,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Pins the topology version on first use so every key in this
    /// transaction is routed against the same snapshot. Returns the
    /// effective pinned version.
    pub fn pin_topology(&self, version: u64) -> u64 {
        match self.topology_version.compare_exchange(
            0,
            version,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => version,
            Err(existing) => existing,
        }
    }

    pub fn topology_version(&self) -> Option<u64> {
        match self.topology_version.load(Ordering::SeqCst) {
            0 => None,
            v => Some(v),
        }
    }

    /// Re-pins after a stale-topology rejection; part of the bounded
    /// re-routing path.
    pub fn repin_topology(&self, version: u64) {
        self.topology_version.store(version, Ordering::SeqCst);
    }

    /// Records an operation against `key`, merging with a previous touch of
    /// the same key (the entry keeps its original position, so apply order
    /// matches what the application observed).
    pub fn record(
        &self,
        entry: TxEntry,
        primary: NodeId,
        explicit_lock: bool,
    ) -> Result<(), TxnError> {
        let state = self.state();
        if state != TxState::Active {
            return Err(TxnError::InvalidState(state, "record operation"));
        }

        let mut inner = self.inner.lock().expect("tx lock poisoned");

        if let Some(existing) = inner.entries.iter_mut().find(|e| e.key == entry.key) {
            // Writes override reads but the first observed version sticks.
            if entry.op != EntryOp::Read {
                existing.op = entry.op;
                existing.value = entry.value;
            }
            if existing.read_version.is_none() {
                existing.read_version = entry.read_version;
                existing.read_value = entry.read_value;
            }
        } else {
            let key = entry.key.clone();
            inner.entries.push(entry);

            let mapping = inner
                .mappings
                .entry(primary.clone())
                .or_insert_with(|| NodeMapping {
                    node: primary,
                    keys: Vec::new(),
                    explicit_lock,
                });
            mapping.keys.push(key);
            mapping.explicit_lock |= explicit_lock;
        }

        Ok(())
    }

    /// Value this transaction would observe for `key` from its own write
    /// set, if it wrote the key.
    pub fn read_your_writes(&self, key: &Key) -> Option<Option<Value>> {
        let inner = self.inner.lock().expect("tx lock poisoned");
        inner.entries.iter().find(|e| e.key == *key).and_then(|e| match e.op {
            EntryOp::Update => Some(Some(e.value.clone().unwrap_or(Value::Null))),
            EntryOp::Delete => Some(None),
            EntryOp::Read => None,
        })
    }

    /// Previously read value for `key`, served again under repeatable-read
    /// and serializable isolation.
    pub fn cached_read(&self, key: &Key) -> Option<Option<Value>> {
        let inner = self.inner.lock().expect("tx lock poisoned");
        inner
            .entries
            .iter()
            .find(|e| e.key == *key && e.read_version.is_some())
            .map(|e| e.read_value.clone())
    }

    pub fn mappings(&self) -> Vec<NodeMapping> {
        let inner = self.inner.lock().expect("tx lock poisoned");
        inner.mappings.values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<Key> {
        let inner = self.inner.lock().expect("tx lock poisoned");
        inner.entries.iter().map(|e| e.key.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().expect("tx lock poisoned").entries.is_empty()
    }

    /// Wire payloads for the entries mapped to `node`, in insertion order.
    pub fn payloads_for(&self, node: &NodeId) -> Vec<EntryPayload> {
        let inner = self.inner.lock().expect("tx lock poisoned");
        let Some(mapping) = inner.mappings.get(node) else {
            return Vec::new();
        };
        inner
            .entries
            .iter()
            .filter(|e| mapping.keys.contains(&e.key))
            .map(|e| EntryPayload {
                key: e.key.clone(),
                op: e.op,
                value: e.value.clone(),
                read_version: e.read_version,
                partition: e.partition,
            })
            .collect()
    }

    /// Rebuilds the per-node mappings against a fresh snapshot after a
    /// stale-topology rejection. The entry set itself is immutable here.
    pub fn remap(&self, snapshot: &TopologySnapshot) -> Result<(), TxnError> {
        let mut inner = self.inner.lock().expect("tx lock poisoned");
        let explicit = inner.mappings.values().any(|m| m.explicit_lock);

        let mut mappings: BTreeMap<NodeId, NodeMapping> = BTreeMap::new();
        for entry in &inner.entries {
            let primary = snapshot
                .primary(entry.partition)
                .ok_or(TxnError::Unmapped(entry.partition))?
                .clone();
            let mapping = mappings.entry(primary.clone()).or_insert_with(|| NodeMapping {
                node: primary,
                keys: Vec::new(),
                explicit_lock: explicit,
            });
            mapping.keys.push(entry.key.clone());
        }

        inner.mappings = mappings;
        Ok(())
    }
}
