//! Remote Transaction Participation
//!
//! The participant half of the protocol: what a primary or backup does when
//! a prepare, finish or probe message arrives. Each in-flight transaction
//! this node participates in is tracked by a `RemoteTransaction` record in
//! the manager's remote map; the record merges the primary role (entries to
//! apply, locks held) and the backup role (staged write set) because one
//! node can play both in the same transaction.
//!
//! Commit application is guarded by a compare-and-set so a duplicate finish
//! message, a deferred apply task and cooperative recovery can race without
//! applying twice.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{GridVersion, Key, LockAttempt, LockOutcome, TxXid, Value};
use crate::membership::types::NodeId;

use super::manager::TransactionManager;
use super::protocol::*;
use super::transaction::EntryOp;

/// Participant-side record of one in-flight transaction.
pub struct RemoteTransaction {
    pub xid: TxXid,
    pub near_node: NodeId,
    pub topology_version: u64,
    /// Every node participating in the transaction; needed for cooperative
    /// recovery when the near node dies.
    tx_nodes: Mutex<Vec<NodeId>>,
    /// Entries this node is primary for, in insertion order.
    entries: Mutex<Vec<EntryPayload>>,
    /// Write set staged on this node as a backup during prepare.
    staged: Mutex<Vec<EntryPayload>>,
    /// Keys this transaction holds lock candidates for on this node.
    locked: Mutex<Vec<Key>>,
    /// Set once when commit application begins; enforces at-most-once.
    commit_guard: AtomicBool,
}

impl RemoteTransaction {
    fn new(xid: TxXid, near_node: NodeId, topology_version: u64) -> Self {
        Self {
            xid,
            near_node,
            topology_version,
            tx_nodes: Mutex::new(Vec::new()),
            entries: Mutex::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
            locked: Mutex::new(Vec::new()),
            commit_guard: AtomicBool::new(false),
        }
    }

    pub fn tx_nodes(&self) -> Vec<NodeId> {
        self.tx_nodes.lock().expect("rtx lock poisoned").clone()
    }

    fn set_tx_nodes(&self, nodes: Vec<NodeId>) {
        let mut tx_nodes = self.tx_nodes.lock().expect("rtx lock poisoned");
        if tx_nodes.is_empty() {
            *tx_nodes = nodes;
        }
    }

    /// Adds a prepare batch to the primary-role write set, keeping the
    /// first payload per key and the arrival order across batches.
    fn add_entries(&self, payloads: Vec<EntryPayload>) {
        let mut entries = self.entries.lock().expect("rtx lock poisoned");
        for payload in payloads {
            if !entries.iter().any(|e| e.key == payload.key) {
                entries.push(payload);
            }
        }
    }

    pub fn entries(&self) -> Vec<EntryPayload> {
        self.entries.lock().expect("rtx lock poisoned").clone()
    }

    /// This record carries a primary role, not just a staged backup set.
    pub fn is_primary_participant(&self) -> bool {
        !self.entries.lock().expect("rtx lock poisoned").is_empty()
            || !self.locked.lock().expect("rtx lock poisoned").is_empty()
    }

    fn stage(&self, payloads: Vec<EntryPayload>) {
        let mut staged = self.staged.lock().expect("rtx lock poisoned");
        for payload in payloads {
            if !staged.iter().any(|e| e.key == payload.key) {
                staged.push(payload);
            }
        }
    }

    fn clear_staged(&self) {
        self.staged.lock().expect("rtx lock poisoned").clear();
    }

    fn add_locked(&self, key: &Key) {
        let mut locked = self.locked.lock().expect("rtx lock poisoned");
        if !locked.contains(key) {
            locked.push(key.clone());
        }
    }

    pub fn locked_keys(&self) -> Vec<Key> {
        self.locked.lock().expect("rtx lock poisoned").clone()
    }

    fn try_begin_commit(&self) -> bool {
        self.commit_guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl TransactionManager {
    fn remote_record(
        &self,
        xid: TxXid,
        near_node: &NodeId,
        topology_version: u64,
    ) -> Arc<RemoteTransaction> {
        self.remote
            .entry(xid)
            .or_insert_with(|| {
                Arc::new(RemoteTransaction::new(
                    xid,
                    near_node.clone(),
                    topology_version,
                ))
            })
            .clone()
    }

    /// Value and version of `key` as this primary sees it: the cache entry
    /// when one exists, the storage backend otherwise.
    fn read_local(&self, key: &Key) -> Result<(Option<Value>, Option<GridVersion>), TxnFault> {
        if let Some((value, version)) = self.store.read(key) {
            return Ok((value, Some(version)));
        }
        match self.backend.load(key) {
            Ok(Some((value, version))) => Ok((Some(value), Some(version))),
            Ok(None) => Ok((None, None)),
            Err(e) => Err(TxnFault::Store {
                key: e.key,
                reason: e.reason,
            }),
        }
    }

    /// Unlocked single-key read served by the primary.
    pub fn on_read(&self, req: ReadRequest) -> ReadResponse {
        let snapshot = self.topology.current();
        if !snapshot.is_primary(req.partition, &self.local) {
            return ReadResponse {
                value: None,
                version: None,
                fault: Some(TxnFault::NotOwner {
                    partition: req.partition,
                    topology: snapshot.version,
                }),
            };
        }
        match self.read_local(&req.key) {
            Ok((value, version)) => ReadResponse {
                value,
                version,
                fault: None,
            },
            Err(fault) => ReadResponse {
                value: None,
                version: None,
                fault: Some(fault),
            },
        }
    }

    /// Acquires lock candidates for `keys`, waiting in the candidate queue
    /// up to the request timeout. Returns the locked keys so a failure can
    /// release exactly what this call acquired.
    async fn acquire_locks(
        &self,
        rtx: &RemoteTransaction,
        keys: &[Key],
        timeout: Duration,
    ) -> Result<(), TxnFault> {
        let mut acquired: Vec<Key> = Vec::new();

        for key in keys {
            if self.store.is_owner(key, rtx.xid) {
                rtx.add_locked(key);
                continue;
            }
            let attempt = self.store.lock_or_wait(key, rtx.xid, false);
            let granted = match attempt {
                LockAttempt::Owned => true,
                LockAttempt::Waiting(rx) => {
                    matches!(
                        tokio::time::timeout(timeout, rx).await,
                        Ok(Ok(LockOutcome::Granted))
                    )
                }
            };
            if !granted {
                // The candidate is still queued on timeout; drop it along
                // with everything this call acquired.
                self.store.remove_candidate(key, rtx.xid);
                self.store.release_all(rtx.xid, &acquired);
                tracing::debug!("{}: {} lock wait on {} failed", self.local, rtx.xid, key);
                return Err(TxnFault::LockTimeout);
            }
            acquired.push(key.clone());
            rtx.add_locked(key);
        }

        Ok(())
    }

    /// Pessimistic lock acquisition at operation time.
    pub async fn on_lock(self: &Arc<Self>, req: LockRequest) -> LockResponse {
        let snapshot = self.topology.current();
        for lock_key in &req.keys {
            if !snapshot.is_primary(lock_key.partition, &self.local) {
                return LockResponse {
                    xid: req.xid,
                    success: false,
                    fault: Some(TxnFault::NotOwner {
                        partition: lock_key.partition,
                        topology: snapshot.version,
                    }),
                    values: Vec::new(),
                };
            }
        }

        let rtx = self.remote_record(req.xid, &req.near_node, req.topology_version);
        let keys: Vec<Key> = req.keys.iter().map(|k| k.key.clone()).collect();
        let timeout = Duration::from_millis(req.timeout_ms);

        if let Err(fault) = self.acquire_locks(&rtx, &keys, timeout).await {
            return LockResponse {
                xid: req.xid,
                success: false,
                fault: Some(fault),
                values: Vec::new(),
            };
        }

        let mut values = Vec::new();
        for lock_key in &req.keys {
            if !lock_key.read {
                continue;
            }
            match self.read_local(&lock_key.key) {
                Ok((value, version)) => values.push(LockedValue {
                    key: lock_key.key.clone(),
                    value,
                    version,
                }),
                Err(fault) => {
                    return LockResponse {
                        xid: req.xid,
                        success: false,
                        fault: Some(fault),
                        values: Vec::new(),
                    }
                }
            }
        }

        LockResponse {
            xid: req.xid,
            success: true,
            fault: None,
            values,
        }
    }

    /// Phase one on a primary: verify ownership, take the remaining locks,
    /// validate optimistic read versions, pre-stage backups, and on the
    /// one-phase fast path apply the commit inline.
    pub async fn on_prepare(self: &Arc<Self>, req: PrepareRequest) -> PrepareResponse {
        let snapshot = self.topology.current();
        for entry in &req.entries {
            if !snapshot.is_primary(entry.partition, &self.local) {
                return PrepareResponse {
                    xid: req.xid,
                    success: false,
                    fault: Some(TxnFault::NotOwner {
                        partition: entry.partition,
                        topology: snapshot.version,
                    }),
                    owned_versions: Vec::new(),
                };
            }
        }

        let rtx = self.remote_record(req.xid, &req.near_node, req.topology_version);
        rtx.set_tx_nodes(req.tx_nodes.clone());
        rtx.add_entries(req.entries.clone());

        let keys: Vec<Key> = req.entries.iter().map(|e| e.key.clone()).collect();
        if let Err(fault) = self.acquire_locks(&rtx, &keys, self.cfg.lock_timeout).await {
            self.release_participant(&rtx);
            return PrepareResponse {
                xid: req.xid,
                success: false,
                fault: Some(fault),
                owned_versions: Vec::new(),
            };
        }

        // A non-last batch only takes its locks; validation, backup
        // staging and the commit decision wait for the final batch.
        if !req.last {
            return PrepareResponse {
                xid: req.xid,
                success: true,
                fault: None,
                owned_versions: Vec::new(),
            };
        }

        // Optimistic validation over the full accumulated write set: every
        // recorded read version must still match the entry, now that the
        // lock pins it.
        let entries = rtx.entries();
        let mut owned_versions = Vec::new();
        for entry in &entries {
            let found = match self.read_local(&entry.key) {
                Ok((_, version)) => version,
                Err(fault) => {
                    self.release_participant(&rtx);
                    return PrepareResponse {
                        xid: req.xid,
                        success: false,
                        fault: Some(fault),
                        owned_versions: Vec::new(),
                    };
                }
            };
            if let Some(read) = entry.read_version {
                if found.unwrap_or_default() != read {
                    tracing::debug!(
                        "{}: {} conflict on {} (read {}, found {})",
                        self.local,
                        req.xid,
                        entry.key,
                        read,
                        found.unwrap_or_default()
                    );
                    self.release_participant(&rtx);
                    return PrepareResponse {
                        xid: req.xid,
                        success: false,
                        fault: Some(TxnFault::Conflict {
                            key: entry.key.clone(),
                            read: Some(read),
                            found,
                        }),
                        owned_versions: Vec::new(),
                    };
                }
            }
            owned_versions.push((entry.key.clone(), found.unwrap_or_default()));
        }

        // Pre-stage the write set on every backup of the touched
        // partitions. Best effort: a backup that misses the stage still
        // receives the full write set at finish.
        for (backup, payloads) in self.backup_targets(req.topology_version, &entries) {
            let stage = BackupPrepareRequest {
                xid: req.xid,
                primary: self.local.clone(),
                near_node: req.near_node.clone(),
                tx_nodes: req.tx_nodes.clone(),
                topology_version: req.topology_version,
                entries: payloads,
            };
            if let Err(e) = self.call_backup_prepare(&backup, stage).await {
                tracing::warn!(
                    "{}: {} backup pre-stage to {} failed: {}",
                    self.local,
                    req.xid,
                    backup,
                    e
                );
            }
        }

        if req.one_phase {
            if let Err(fault) = self.apply_commit(&rtx).await {
                return PrepareResponse {
                    xid: req.xid,
                    success: false,
                    fault: Some(fault),
                    owned_versions,
                };
            }
        }

        PrepareResponse {
            xid: req.xid,
            success: true,
            fault: None,
            owned_versions,
        }
    }

    /// Phase two on a participant. Idempotent: an unknown xid means the
    /// transaction already finished here and the message is a duplicate.
    pub async fn on_finish(self: &Arc<Self>, req: FinishRequest) -> FinishResponse {
        self.merge_evidence(&req.evidence);

        let Some(rtx) = self.remote.get(&req.xid).map(|r| r.value().clone()) else {
            return FinishResponse {
                xid: req.xid,
                success: true,
                fault: None,
            };
        };

        if !rtx.is_primary_participant() {
            // Backup-only record; it resolves through backup-finish or,
            // failing that, the recovery probe.
            return FinishResponse {
                xid: req.xid,
                success: true,
                fault: None,
            };
        }

        if !req.commit {
            self.release_participant(&rtx);
            self.record_rollback_evidence(req.xid);
            // Drop the write sets staged on the backups.
            let evidence = self.evidence_sample(Vec::new());
            for (backup, _) in self.backup_targets(rtx.topology_version, &rtx.entries()) {
                let drop_stage = BackupFinishRequest {
                    xid: req.xid,
                    primary: self.local.clone(),
                    commit: false,
                    writes: Vec::new(),
                    evidence: evidence.clone(),
                };
                if let Err(e) = self.call_backup_finish(&backup, drop_stage).await {
                    tracing::debug!(
                        "{}: {} backup release to {} failed: {}",
                        self.local,
                        req.xid,
                        backup,
                        e
                    );
                }
            }
            return FinishResponse {
                xid: req.xid,
                success: true,
                fault: None,
            };
        }

        // Commit: apply immediately when every lock is owned, otherwise
        // defer until ownership arrives. The near node gets its ack either
        // way; the commit decision is already durable in the evidence it
        // sent.
        let waiting: Vec<Key> = rtx
            .locked_keys()
            .into_iter()
            .filter(|key| !self.store.is_owner(key, req.xid))
            .collect();

        if waiting.is_empty() {
            return match self.apply_commit(&rtx).await {
                Ok(()) => FinishResponse {
                    xid: req.xid,
                    success: true,
                    fault: None,
                },
                Err(fault) => FinishResponse {
                    xid: req.xid,
                    success: false,
                    fault: Some(fault),
                },
            };
        }

        let receivers: Vec<_> = waiting
            .iter()
            .map(|key| self.store.wait_ownership(key, req.xid))
            .collect();
        let manager = self.clone();
        tokio::spawn(async move {
            for rx in receivers {
                match rx.await {
                    Ok(LockOutcome::Granted) => {}
                    _ => {
                        tracing::error!(
                            "{}: {} lost a lock after the commit decision; abandoning apply",
                            manager.local,
                            rtx.xid
                        );
                        manager.release_participant(&rtx);
                        return;
                    }
                }
            }
            if let Err(fault) = manager.apply_commit(&rtx).await {
                tracing::error!(
                    "{}: {} deferred apply failed: {:?}",
                    manager.local,
                    rtx.xid,
                    fault
                );
            }
        });

        FinishResponse {
            xid: req.xid,
            success: true,
            fault: None,
        }
    }

    /// Applies the committed write set: version each write past the entry's
    /// current version, push it to the backend and the cache entry, release
    /// the locks, and ship the final per-entry outcome to the backups.
    ///
    /// At most once per transaction; a second caller returns immediately.
    pub(super) async fn apply_commit(
        self: &Arc<Self>,
        rtx: &Arc<RemoteTransaction>,
    ) -> Result<(), TxnFault> {
        if !rtx.try_begin_commit() {
            return Ok(());
        }

        let entries = rtx.entries();
        let mut writes: Vec<(u32, EntryWrite)> = Vec::new();
        let mut fault: Option<TxnFault> = None;

        for entry in &entries {
            if entry.op == EntryOp::Read {
                continue;
            }
            let floor = self
                .store
                .read(&entry.key)
                .map(|(_, version)| version)
                .unwrap_or_default();
            let version = self.versions.after(floor);

            let applied = match entry.op {
                EntryOp::Update => {
                    let value = entry.value.clone().unwrap_or(Value::Null);
                    self.backend
                        .store(&entry.key, &value, version)
                        .map(|_| Some(value))
                }
                EntryOp::Delete => self.backend.remove(&entry.key).map(|_| None),
                EntryOp::Read => unreachable!("read entries are skipped"),
            };

            match applied {
                Ok(value) => {
                    if self
                        .store
                        .apply_write(&entry.key, value.clone(), version)
                        .is_ok()
                    {
                        self.notify_post_commit(&entry.key, value.as_ref(), version);
                    }
                    writes.push((
                        entry.partition,
                        EntryWrite {
                            key: entry.key.clone(),
                            value,
                            version,
                        },
                    ));
                }
                Err(e) => {
                    // Keep applying the rest; a partial failure surfaces as
                    // a store fault and the transaction ends heuristically.
                    tracing::error!(
                        "{}: {} store failure on {}: {}",
                        self.local,
                        rtx.xid,
                        e.key,
                        e.reason
                    );
                    if fault.is_none() {
                        fault = Some(TxnFault::Store {
                            key: e.key,
                            reason: e.reason,
                        });
                    }
                }
            }
        }

        self.store.release_all(rtx.xid, &rtx.locked_keys());
        self.record_commit_evidence(rtx.xid);
        self.remote.remove(&rtx.xid);

        let evidence = self.evidence_sample(Vec::new());
        let payload_partitions: Vec<EntryPayload> = entries;
        for (backup, keys) in self.backup_targets(rtx.topology_version, &payload_partitions) {
            let owned: Vec<EntryWrite> = writes
                .iter()
                .filter(|(partition, _)| keys.iter().any(|e| e.partition == *partition))
                .map(|(_, write)| write.clone())
                .collect();
            let finish = BackupFinishRequest {
                xid: rtx.xid,
                primary: self.local.clone(),
                commit: true,
                writes: owned,
                evidence: evidence.clone(),
            };
            if let Err(e) = self.call_backup_finish(&backup, finish).await {
                tracing::warn!(
                    "{}: {} backup finish to {} failed: {}",
                    self.local,
                    rtx.xid,
                    backup,
                    e
                );
            }
        }

        match fault {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }

    /// Releases everything a participant record holds and forgets it.
    pub(super) fn release_participant(&self, rtx: &RemoteTransaction) {
        self.store.release_all(rtx.xid, &rtx.locked_keys());
        self.remote.remove(&rtx.xid);
    }

    /// Groups `entries` by the backup nodes owning their partitions under
    /// the transaction's pinned snapshot. The local node never appears.
    fn backup_targets(
        &self,
        topology_version: u64,
        entries: &[EntryPayload],
    ) -> BTreeMap<NodeId, Vec<EntryPayload>> {
        let snapshot = self
            .topology
            .for_version(topology_version)
            .unwrap_or_else(|| self.topology.current());

        let mut targets: BTreeMap<NodeId, Vec<EntryPayload>> = BTreeMap::new();
        for entry in entries {
            for backup in snapshot.backups(entry.partition) {
                if backup == &self.local {
                    continue;
                }
                targets
                    .entry(backup.clone())
                    .or_default()
                    .push(entry.clone());
            }
        }
        targets
    }

    /// Pre-stages a write set on this node in its backup role.
    pub fn on_backup_prepare(&self, req: BackupPrepareRequest) -> BackupAck {
        let rtx = self.remote_record(req.xid, &req.near_node, req.topology_version);
        rtx.set_tx_nodes(req.tx_nodes);
        rtx.stage(req.entries);
        BackupAck {
            xid: req.xid,
            success: true,
        }
    }

    /// Applies the final per-entry outcome in this node's backup role. The
    /// writes arrive pre-versioned by the primary; stale ones (already
    /// superseded locally) are skipped, keeping per-key versions strictly
    /// increasing.
    pub fn on_backup_finish(&self, req: BackupFinishRequest) -> BackupAck {
        self.merge_evidence(&req.evidence);

        if req.commit {
            for write in &req.writes {
                self.versions.observe(write.version);
                let backend_result = match &write.value {
                    Some(value) => self.backend.store(&write.key, value, write.version),
                    None => self.backend.remove(&write.key),
                };
                if let Err(e) = backend_result {
                    tracing::error!(
                        "{}: {} backup store failure on {}: {}",
                        self.local,
                        req.xid,
                        e.key,
                        e.reason
                    );
                    continue;
                }
                if self
                    .store
                    .apply_write(&write.key, write.value.clone(), write.version)
                    .is_ok()
                {
                    self.notify_post_commit(&write.key, write.value.as_ref(), write.version);
                }
            }
            self.record_commit_evidence(req.xid);
        } else {
            self.record_rollback_evidence(req.xid);
        }

        let drop_record = match self.remote.get(&req.xid) {
            Some(rtx) => {
                rtx.clear_staged();
                !rtx.is_primary_participant()
            }
            None => false,
        };
        if drop_record {
            self.remote.remove(&req.xid);
        }

        BackupAck {
            xid: req.xid,
            success: true,
        }
    }

    /// Recovery probe: reports this node's knowledge of an xid. An xid is
    /// pending when this node holds an in-flight record for it, or a peer
    /// declared it in flight in merged evidence.
    pub fn on_probe(&self, req: ProbeRequest) -> ProbeResponse {
        let outcome = self.known_outcome(req.xid);
        let pending = self.remote.contains_key(&req.xid)
            || self.evidence_pending(req.xid)
            || self
                .near
                .get(&req.xid)
                .map(|tx| !tx.state().is_terminal())
                .unwrap_or(false);
        ProbeResponse {
            xid: req.xid,
            outcome,
            pending,
        }
    }
}
