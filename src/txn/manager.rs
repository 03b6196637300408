//! Transaction Manager
//!
//! One explicit instance per node process, constructed at startup with its
//! dependencies injected (topology, cache store, storage backend,
//! transport). Owns the maps of in-flight transactions (near-side ones
//! this node originated, remote-side ones it participates in) plus the
//! bounded log of recently finished transaction versions that travels as
//! recovery evidence on finish messages.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::{
    CacheStore, EntryBackend, GridVersion, Key, TxXid, Value, VersionSource,
};
use crate::config::GridConfig;
use crate::membership::types::NodeId;
use crate::net::GridTransport;
use crate::topology::{TopologyEvent, TopologyService, TopologySnapshot};

use super::error::TxnError;
use super::protocol::*;
use super::remote::RemoteTransaction;
use super::transaction::{
    Concurrency, EntryOp, Isolation, Transaction, TxEntry, TxOutcome,
};
use super::{finish, recovery};

/// Hook invoked after every committed write on this node (query/eviction
/// layers subscribe here).
pub type PostCommitHook = Box<dyn Fn(&Key, Option<&Value>, GridVersion) + Send + Sync>;

/// Bounded ring of recently finished transaction versions. Carried on
/// finish messages so peers can resolve writes they are missing without a
/// consensus round.
pub struct EvidenceLog {
    capacity: usize,
    committed: VecDeque<TxXid>,
    committed_set: HashSet<TxXid>,
    rolled_back: VecDeque<TxXid>,
    rolled_back_set: HashSet<TxXid>,
    /// Xids peers declared still in flight; answered as pending on probes
    /// until an outcome lands.
    pending: VecDeque<TxXid>,
    pending_set: HashSet<TxXid>,
}

/// How many entries of each set are piggybacked per finish message.
const EVIDENCE_SAMPLE: usize = 64;

impl EvidenceLog {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            committed: VecDeque::new(),
            committed_set: HashSet::new(),
            rolled_back: VecDeque::new(),
            rolled_back_set: HashSet::new(),
            pending: VecDeque::new(),
            pending_set: HashSet::new(),
        }
    }

    fn push(
        ring: &mut VecDeque<TxXid>,
        set: &mut HashSet<TxXid>,
        capacity: usize,
        xid: TxXid,
    ) {
        if set.insert(xid) {
            ring.push_back(xid);
            while ring.len() > capacity {
                if let Some(old) = ring.pop_front() {
                    set.remove(&old);
                }
            }
        }
    }

    pub fn record_commit(&mut self, xid: TxXid) {
        self.pending_set.remove(&xid);
        Self::push(
            &mut self.committed,
            &mut self.committed_set,
            self.capacity,
            xid,
        );
    }

    pub fn record_rollback(&mut self, xid: TxXid) {
        // A commit that already went through wins over late rollback noise.
        if self.committed_set.contains(&xid) {
            return;
        }
        self.pending_set.remove(&xid);
        Self::push(
            &mut self.rolled_back,
            &mut self.rolled_back_set,
            self.capacity,
            xid,
        );
    }

    /// Records an xid a peer declared still in flight. A no-op once an
    /// outcome is known.
    pub fn record_pending(&mut self, xid: TxXid) {
        if self.committed_set.contains(&xid) || self.rolled_back_set.contains(&xid) {
            return;
        }
        Self::push(&mut self.pending, &mut self.pending_set, self.capacity, xid);
    }

    pub fn is_pending(&self, xid: TxXid) -> bool {
        self.pending_set.contains(&xid)
    }

    pub fn outcome(&self, xid: TxXid) -> Option<KnownOutcome> {
        if self.committed_set.contains(&xid) {
            Some(KnownOutcome::Committed)
        } else if self.rolled_back_set.contains(&xid) {
            Some(KnownOutcome::RolledBack)
        } else {
            None
        }
    }

    /// Recent sample of both sets, newest first.
    pub fn sample(&self, pending: Vec<TxXid>) -> Evidence {
        Evidence {
            committed: self.committed.iter().rev().take(EVIDENCE_SAMPLE).copied().collect(),
            rolled_back: self
                .rolled_back
                .iter()
                .rev()
                .take(EVIDENCE_SAMPLE)
                .copied()
                .collect(),
            pending,
        }
    }

    pub fn merge(&mut self, evidence: &Evidence) {
        for xid in &evidence.committed {
            self.record_commit(*xid);
        }
        for xid in &evidence.rolled_back {
            self.record_rollback(*xid);
        }
        for xid in &evidence.pending {
            self.record_pending(*xid);
        }
    }
}

/// The node-level engine driving transactions this node originates and
/// serving the protocol messages of transactions it participates in.
pub struct TransactionManager {
    pub(super) local: NodeId,
    pub(super) cfg: GridConfig,
    pub(super) topology: Arc<TopologyService>,
    pub(super) store: Arc<CacheStore>,
    pub(super) backend: Arc<dyn EntryBackend>,
    pub(super) transport: Arc<dyn GridTransport>,
    pub(super) versions: Arc<VersionSource>,
    /// Transactions originated by this node, keyed by xid.
    pub(super) near: DashMap<TxXid, Arc<Transaction>>,
    /// Transactions this node participates in as primary or backup.
    pub(super) remote: DashMap<TxXid, Arc<RemoteTransaction>>,
    pub(super) evidence: Mutex<EvidenceLog>,
    post_commit: Mutex<Option<PostCommitHook>>,
}

/// Stable per-node discriminant used to break version ties.
fn node_order_of(node: &NodeId) -> u32 {
    let mut hasher = DefaultHasher::new();
    node.0.hash(&mut hasher);
    (hasher.finish() & 0xffff_ffff) as u32
}

impl TransactionManager {
    pub fn new(
        local: NodeId,
        cfg: GridConfig,
        topology: Arc<TopologyService>,
        backend: Arc<dyn EntryBackend>,
        transport: Arc<dyn GridTransport>,
    ) -> Arc<Self> {
        let versions = Arc::new(VersionSource::new(node_order_of(&local)));
        versions.on_topology_change(topology.current_version());

        let evidence_capacity = cfg.evidence_capacity;
        Arc::new(Self {
            local,
            cfg,
            topology,
            store: Arc::new(CacheStore::new()),
            backend,
            transport,
            versions,
            near: DashMap::new(),
            remote: DashMap::new(),
            evidence: Mutex::new(EvidenceLog::new(evidence_capacity)),
            post_commit: Mutex::new(None),
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn set_post_commit_hook(&self, hook: PostCommitHook) {
        *self.post_commit.lock().expect("hook lock poisoned") = Some(hook);
    }

    pub(super) fn notify_post_commit(&self, key: &Key, value: Option<&Value>, version: GridVersion) {
        if let Some(hook) = self.post_commit.lock().expect("hook lock poisoned").as_ref() {
            hook(key, value, version);
        }
    }

    /// Spawns the topology listener reacting to node departures: remote
    /// transactions originated by a dead node are resolved cooperatively,
    /// and the version source follows topology bumps.
    pub fn start(self: &Arc<Self>) {
        let manager = self.clone();
        let mut events = self.topology.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TopologyEvent::Joined(_, version)) => {
                        manager.versions.on_topology_change(version);
                    }
                    Ok(TopologyEvent::Left(node, version)) => {
                        manager.versions.on_topology_change(version);
                        recovery::handle_node_left(&manager, node).await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("topology listener lagged by {} events", skipped);
                    }
                    Err(_) => break,
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    pub fn begin(&self, concurrency: Concurrency, isolation: Isolation) -> Arc<Transaction> {
        let xid = TxXid(self.versions.next());
        let tx = Arc::new(Transaction::new(xid, concurrency, isolation));
        self.near.insert(xid, tx.clone());
        tracing::debug!(
            "{}: begin {:?}/{:?} transaction {}",
            self.local,
            concurrency,
            isolation,
            xid
        );
        tx
    }

    /// Snapshot this transaction routes against: its pinned version while
    /// it stays in the history window, the current one otherwise.
    pub(super) fn routing_snapshot(&self, tx: &Transaction) -> Arc<TopologySnapshot> {
        let pinned = tx.pin_topology(self.topology.current_version());
        self.topology
            .for_version(pinned)
            .unwrap_or_else(|| self.topology.current())
    }

    fn route(&self, tx: &Transaction, key: &Key) -> Result<(u32, NodeId), TxnError> {
        let snapshot = self.routing_snapshot(tx);
        let partition = self.topology.partition_for(key);
        let primary = snapshot
            .primary(partition)
            .ok_or(TxnError::Unmapped(partition))?
            .clone();
        Ok((partition, primary))
    }

    pub async fn get(self: &Arc<Self>, tx: &Transaction, key: &Key) -> Result<Option<Value>, TxnError> {
        if let Some(own) = tx.read_your_writes(key) {
            return Ok(own);
        }
        if tx.isolation() != Isolation::ReadCommitted {
            if let Some(cached) = tx.cached_read(key) {
                return Ok(cached);
            }
        }

        for _ in 0..=self.cfg.routing_retries {
            let (partition, primary) = self.route(tx, key)?;
            let (value, version) = match self.read_entry(tx, key, partition, &primary).await {
                Ok(read) => read,
                // Routing staleness recovers locally; everything else is
                // the caller's to handle.
                Err(TxnError::NotOwner { partition, topology }) => {
                    self.reroute(tx, partition, topology);
                    continue;
                }
                Err(e) => return Err(e),
            };

            tx.record(
                TxEntry {
                    key: key.clone(),
                    op: EntryOp::Read,
                    value: None,
                    read_version: Some(version.unwrap_or_default()),
                    read_value: value.clone(),
                    partition,
                },
                primary,
                tx.concurrency() == Concurrency::Pessimistic,
            )?;
            return Ok(value);
        }

        Err(TxnError::RoutingExhausted)
    }

    /// One remote read (optimistic) or read-lock (pessimistic) of `key`.
    async fn read_entry(
        self: &Arc<Self>,
        tx: &Transaction,
        key: &Key,
        partition: u32,
        primary: &NodeId,
    ) -> Result<(Option<Value>, Option<GridVersion>), TxnError> {
        match tx.concurrency() {
            Concurrency::Pessimistic => {
                let resp = self
                    .call_lock(
                        primary,
                        LockRequest {
                            xid: tx.xid(),
                            near_node: self.local.clone(),
                            topology_version: tx.topology_version().unwrap_or(0),
                            keys: vec![LockKey {
                                key: key.clone(),
                                partition,
                                read: true,
                            }],
                            timeout_ms: self.cfg.lock_timeout.as_millis() as u64,
                        },
                    )
                    .await?;
                if !resp.success {
                    return Err(fault_to_error(resp.fault));
                }
                let locked = resp.values.into_iter().find(|v| v.key == *key);
                Ok(match locked {
                    Some(v) => (v.value, v.version),
                    None => (None, None),
                })
            }
            Concurrency::Optimistic => {
                let resp = self
                    .call_read(
                        primary,
                        ReadRequest {
                            key: key.clone(),
                            partition,
                            topology_version: tx.topology_version().unwrap_or(0),
                        },
                    )
                    .await?;
                if let Some(fault) = resp.fault {
                    return Err(fault_to_error(Some(fault)));
                }
                Ok((resp.value, resp.version))
            }
        }
    }

    /// Stale-topology rejection on an operation: re-pin against the current
    /// snapshot so the retry routes with fresh affinity.
    fn reroute(&self, tx: &Transaction, partition: u32, topology: u64) {
        tracing::debug!(
            "{}: {} partition {} moved (topology v{}), re-routing",
            self.local,
            tx.xid(),
            partition,
            topology
        );
        tx.repin_topology(self.topology.current_version());
    }

    pub async fn put(self: &Arc<Self>, tx: &Transaction, key: Key, value: Value) -> Result<(), TxnError> {
        self.write(tx, key, EntryOp::Update, Some(value)).await
    }

    pub async fn remove(self: &Arc<Self>, tx: &Transaction, key: Key) -> Result<(), TxnError> {
        self.write(tx, key, EntryOp::Delete, None).await
    }

    async fn write(
        self: &Arc<Self>,
        tx: &Transaction,
        key: Key,
        op: EntryOp,
        value: Option<Value>,
    ) -> Result<(), TxnError> {
        for _ in 0..=self.cfg.routing_retries {
            let (partition, primary) = self.route(tx, &key)?;

            // Pessimistic transactions take the write lock at operation
            // time; optimistic ones defer everything to prepare.
            if tx.concurrency() == Concurrency::Pessimistic {
                let resp = self
                    .call_lock(
                        &primary,
                        LockRequest {
                            xid: tx.xid(),
                            near_node: self.local.clone(),
                            topology_version: tx.topology_version().unwrap_or(0),
                            keys: vec![LockKey {
                                key: key.clone(),
                                partition,
                                read: false,
                            }],
                            timeout_ms: self.cfg.lock_timeout.as_millis() as u64,
                        },
                    )
                    .await?;
                if !resp.success {
                    match fault_to_error(resp.fault) {
                        TxnError::NotOwner { partition, topology } => {
                            self.reroute(tx, partition, topology);
                            continue;
                        }
                        e => return Err(e),
                    }
                }
            }

            return tx.record(
                TxEntry {
                    key: key.clone(),
                    op,
                    value: value.clone(),
                    read_version: None,
                    read_value: None,
                    partition,
                },
                primary,
                tx.concurrency() == Concurrency::Pessimistic,
            );
        }

        Err(TxnError::RoutingExhausted)
    }

    /// Commits the transaction. The returned outcome is one of committed,
    /// rolled-back, conflict or heuristic-unknown; never a silent partial
    /// commit.
    pub async fn commit(self: &Arc<Self>, tx: &Arc<Transaction>) -> TxOutcome {
        finish::commit(self, tx).await
    }

    /// Rolls the transaction back. Idempotent: repeated calls yield the
    /// same terminal state and release no locks twice.
    pub async fn rollback(self: &Arc<Self>, tx: &Arc<Transaction>) -> TxOutcome {
        finish::rollback(self, tx).await
    }

    // ------------------------------------------------------------------
    // Call helpers: local dispatch short-circuits the transport
    // ------------------------------------------------------------------

    pub(super) async fn call_read(
        self: &Arc<Self>,
        node: &NodeId,
        req: ReadRequest,
    ) -> Result<ReadResponse, TxnError> {
        if node == &self.local {
            return Ok(self.on_read(req));
        }
        self.transport.read(node, req).await
    }

    pub(super) async fn call_lock(
        self: &Arc<Self>,
        node: &NodeId,
        req: LockRequest,
    ) -> Result<LockResponse, TxnError> {
        if node == &self.local {
            return Ok(self.on_lock(req).await);
        }
        self.transport.lock(node, req).await
    }

    pub(super) async fn call_prepare(
        self: &Arc<Self>,
        node: &NodeId,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, TxnError> {
        if node == &self.local {
            return Ok(self.on_prepare(req).await);
        }
        self.transport.prepare(node, req).await
    }

    pub(super) async fn call_finish(
        self: &Arc<Self>,
        node: &NodeId,
        req: FinishRequest,
    ) -> Result<FinishResponse, TxnError> {
        if node == &self.local {
            return Ok(self.on_finish(req).await);
        }
        self.transport.finish(node, req).await
    }

    pub(super) async fn call_backup_prepare(
        self: &Arc<Self>,
        node: &NodeId,
        req: BackupPrepareRequest,
    ) -> Result<BackupAck, TxnError> {
        if node == &self.local {
            return Ok(self.on_backup_prepare(req));
        }
        self.transport.backup_prepare(node, req).await
    }

    pub(super) async fn call_backup_finish(
        self: &Arc<Self>,
        node: &NodeId,
        req: BackupFinishRequest,
    ) -> Result<BackupAck, TxnError> {
        if node == &self.local {
            return Ok(self.on_backup_finish(req));
        }
        self.transport.backup_finish(node, req).await
    }

    pub(super) async fn call_probe(
        self: &Arc<Self>,
        node: &NodeId,
        req: ProbeRequest,
    ) -> Result<ProbeResponse, TxnError> {
        if node == &self.local {
            return Ok(self.on_probe(req));
        }
        self.transport.probe(node, req).await
    }

    // ------------------------------------------------------------------
    // Evidence helpers
    // ------------------------------------------------------------------

    pub(super) fn evidence_sample(&self, pending: Vec<TxXid>) -> Evidence {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .sample(pending)
    }

    pub(super) fn record_commit_evidence(&self, xid: TxXid) {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .record_commit(xid);
    }

    pub(super) fn record_rollback_evidence(&self, xid: TxXid) {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .record_rollback(xid);
    }

    pub(super) fn merge_evidence(&self, evidence: &Evidence) {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .merge(evidence);
    }

    pub fn known_outcome(&self, xid: TxXid) -> Option<KnownOutcome> {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .outcome(xid)
    }

    /// A peer declared this xid in flight and no outcome has landed since.
    pub(super) fn evidence_pending(&self, xid: TxXid) -> bool {
        self.evidence
            .lock()
            .expect("evidence lock poisoned")
            .is_pending(xid)
    }

    pub(super) fn reply_timeout(&self) -> Duration {
        self.cfg.reply_timeout
    }
}

/// Maps a wire fault back into the typed error taxonomy.
pub(super) fn fault_to_error(fault: Option<TxnFault>) -> TxnError {
    match fault {
        Some(TxnFault::LockTimeout) => TxnError::LockTimeout,
        Some(TxnFault::Conflict { key, read, found }) => TxnError::Conflict { key, read, found },
        Some(TxnFault::NotOwner {
            partition,
            topology,
        }) => TxnError::NotOwner {
            partition,
            topology,
        },
        Some(TxnFault::Store { key, reason }) => {
            TxnError::Store(crate::cache::StoreError { key, reason })
        }
        None => TxnError::Transport("unspecified remote failure".into()),
    }
}
