use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::store::FailingBackend;
use crate::cache::{GridVersion, MemoryBackend, TxXid};
use crate::config::GridConfig;
use crate::membership::types::NodeId;
use crate::net::{GridTransport, LocalTransport};
use crate::topology::{RendezvousAffinity, TopologyService};

use super::manager::{EvidenceLog, TransactionManager};
use super::protocol::{
    EntryPayload, Evidence, FinishRequest, PrepareRequest, ProbeRequest,
};
use super::transaction::{Concurrency, EntryOp, Isolation, TxOutcome, TxState};

/// In-process cluster: one shared topology, one local transport, one
/// manager per node.
struct Cluster {
    topology: Arc<TopologyService>,
    transport: Arc<LocalTransport>,
    managers: Vec<Arc<TransactionManager>>,
}

impl Cluster {
    fn node_id(index: usize) -> NodeId {
        NodeId(format!("node-{:02}", index))
    }

    fn new(size: usize) -> Self {
        let cfg = GridConfig::for_testing();
        let topology = TopologyService::new(&cfg, Arc::new(RendezvousAffinity::new()));
        let transport = LocalTransport::new();

        let mut managers = Vec::new();
        for index in 0..size {
            let node = Self::node_id(index);
            let manager = TransactionManager::new(
                node.clone(),
                cfg.clone(),
                topology.clone(),
                Arc::new(MemoryBackend::new()),
                transport.clone() as Arc<dyn GridTransport>,
            );
            transport.register(node.clone(), manager.clone());
            topology.node_joined(node);
            manager.start();
            managers.push(manager);
        }

        Self {
            topology,
            transport,
            managers,
        }
    }

    /// First key with the given tag whose primary is `managers[index]`.
    fn key_on(&self, index: usize, tag: &str) -> String {
        let node = self.managers[index].local_node().clone();
        let snapshot = self.topology.current();
        for i in 0..10_000 {
            let key = format!("{}-{}", tag, i);
            let partition = self.topology.partition_for(&key);
            if snapshot.primary(partition) == Some(&node) {
                return key;
            }
        }
        panic!("no key found with primary {}", node);
    }

    fn kill(&self, index: usize) {
        let node = self.managers[index].local_node().clone();
        self.transport.kill(&node);
        self.topology.node_left(&node);
    }
}

fn xid(order: u64) -> TxXid {
    TxXid(GridVersion {
        topology: 1,
        order,
        node_order: 99,
    })
}

#[test]
fn state_machine_edges() {
    assert!(TxState::Active.can_transition(TxState::Preparing));
    assert!(TxState::Preparing.can_transition(TxState::Prepared));
    assert!(TxState::Prepared.can_transition(TxState::Committing));
    assert!(TxState::Committing.can_transition(TxState::Committed));
    assert!(TxState::Active.can_transition(TxState::RollingBack));
    assert!(TxState::Prepared.can_transition(TxState::RollingBack));

    assert!(!TxState::Committing.can_transition(TxState::RollingBack));
    assert!(!TxState::Committed.can_transition(TxState::RollingBack));
    assert!(!TxState::Active.can_transition(TxState::Committed));

    // Unknown is reachable from any in-flight state, never from terminal.
    assert!(TxState::Committing.can_transition(TxState::Unknown));
    assert!(TxState::Active.can_transition(TxState::Unknown));
    assert!(!TxState::Committed.can_transition(TxState::Unknown));
    assert!(!TxState::RolledBack.can_transition(TxState::Unknown));
}

#[test]
fn evidence_log_is_bounded_and_commit_wins() {
    let mut log = EvidenceLog::new(4);

    for order in 0..8 {
        log.record_commit(xid(order));
    }
    // Oldest entries fell out of the ring.
    assert_eq!(log.outcome(xid(0)), None);
    assert_eq!(
        log.outcome(xid(7)),
        Some(super::protocol::KnownOutcome::Committed)
    );

    // A rollback recorded after a commit of the same xid is noise.
    log.record_rollback(xid(7));
    assert_eq!(
        log.outcome(xid(7)),
        Some(super::protocol::KnownOutcome::Committed)
    );

    log.record_rollback(xid(100));
    assert_eq!(
        log.outcome(xid(100)),
        Some(super::protocol::KnownOutcome::RolledBack)
    );

    let sample = log.sample(vec![xid(200)]);
    assert!(sample.committed.contains(&xid(7)));
    assert!(sample.rolled_back.contains(&xid(100)));
    assert_eq!(sample.pending, vec![xid(200)]);
}

#[tokio::test]
async fn begin_assigns_increasing_xids() {
    let cluster = Cluster::new(1);
    let manager = &cluster.managers[0];

    let a = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    let b = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert!(a.xid() < b.xid());
}

#[tokio::test]
async fn read_your_writes_before_commit() {
    let cluster = Cluster::new(1);
    let manager = &cluster.managers[0];
    let key = cluster.key_on(0, "ryw");

    let tx = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    manager
        .put(&tx, key.clone(), json!({"n": 1}))
        .await
        .unwrap();

    // The uncommitted write is visible inside the transaction only.
    assert_eq!(
        manager.get(&tx, &key).await.unwrap(),
        Some(json!({"n": 1}))
    );
    let other = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(manager.get(&other, &key).await.unwrap(), None);

    manager.remove(&tx, key.clone()).await.unwrap();
    assert_eq!(manager.get(&tx, &key).await.unwrap(), None);
}

#[tokio::test]
async fn repeatable_read_serves_the_first_observation() {
    let cluster = Cluster::new(1);
    let manager = &cluster.managers[0];
    let key = cluster.key_on(0, "rr");

    let writer = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    manager.put(&writer, key.clone(), json!(1)).await.unwrap();
    assert_eq!(manager.commit(&writer).await, TxOutcome::Committed);

    let rr = manager.begin(Concurrency::Optimistic, Isolation::RepeatableRead);
    let rc = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(manager.get(&rr, &key).await.unwrap(), Some(json!(1)));
    assert_eq!(manager.get(&rc, &key).await.unwrap(), Some(json!(1)));

    let writer = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    manager.put(&writer, key.clone(), json!(2)).await.unwrap();
    assert_eq!(manager.commit(&writer).await, TxOutcome::Committed);

    // Repeatable-read keeps serving its first observation; read-committed
    // sees the newly committed value.
    assert_eq!(manager.get(&rr, &key).await.unwrap(), Some(json!(1)));
    assert_eq!(manager.get(&rc, &key).await.unwrap(), Some(json!(2)));
}

#[tokio::test]
async fn stale_routing_is_retried_on_reads_and_locks() {
    let cluster = Cluster::new(1);
    let near = &cluster.managers[0];

    // Both transactions pin the single-node topology before a second node
    // joins and takes over a share of the partitions.
    let t_read = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    let t_write = near.begin(Concurrency::Pessimistic, Isolation::ReadCommitted);
    assert_eq!(
        near.get(&t_read, &cluster.key_on(0, "pin-a")).await.unwrap(),
        None
    );
    assert_eq!(
        near.get(&t_write, &cluster.key_on(0, "pin-b")).await.unwrap(),
        None
    );

    let node = Cluster::node_id(1);
    let joined = TransactionManager::new(
        node.clone(),
        GridConfig::for_testing(),
        cluster.topology.clone(),
        Arc::new(MemoryBackend::new()),
        cluster.transport.clone() as Arc<dyn GridTransport>,
    );
    cluster.transport.register(node.clone(), joined.clone());
    cluster.topology.node_joined(node.clone());
    joined.start();

    let snapshot = cluster.topology.current();
    let moved = (0..10_000)
        .map(|i| format!("moved-{}", i))
        .find(|k| snapshot.primary(cluster.topology.partition_for(k)) == Some(&node))
        .expect("no partition moved to the new node");

    // The pinned snapshot still routes `moved` to the old node, which
    // rejects as not-owner; the operation re-routes instead of surfacing
    // the fault to the caller.
    assert_eq!(near.get(&t_read, &moved).await.unwrap(), None);
    assert_eq!(near.commit(&t_read).await, TxOutcome::Committed);

    near.put(&t_write, moved.clone(), json!("routed")).await.unwrap();
    assert_eq!(near.commit(&t_write).await, TxOutcome::Committed);
    assert_eq!(joined.store().read(&moved).unwrap().0, Some(json!("routed")));
}

#[tokio::test]
async fn prepare_batches_defer_the_decision_to_the_last() {
    let cluster = Cluster::new(2);
    let primary = &cluster.managers[1];
    let near = cluster.managers[0].local_node().clone();
    let key_a = cluster.key_on(1, "batch-a");
    let key_b = cluster.key_on(1, "batch-b");
    let tx_xid = xid(900);

    let batch = |key: &String, value: serde_json::Value, last: bool, one_phase: bool| {
        PrepareRequest {
            xid: tx_xid,
            near_node: near.clone(),
            topology_version: cluster.topology.current_version(),
            concurrency: Concurrency::Optimistic,
            isolation: Isolation::ReadCommitted,
            entries: vec![EntryPayload {
                key: key.clone(),
                op: EntryOp::Update,
                value: Some(value),
                read_version: None,
                partition: cluster.topology.partition_for(key),
            }],
            tx_nodes: vec![primary.local_node().clone()],
            last,
            one_phase,
        }
    };

    // A non-last batch takes its locks but leaves the decision open.
    let resp = primary.on_prepare(batch(&key_a, json!("a"), false, false)).await;
    assert!(resp.success, "first batch failed: {:?}", resp.fault);
    assert_eq!(primary.store().owner_of(&key_a), Some(tx_xid));
    assert_eq!(primary.store().read(&key_a).and_then(|(v, _)| v), None);

    // The last batch completes the write set; one-phase applies the union
    // of every batch and releases the locks.
    let resp = primary.on_prepare(batch(&key_b, json!("b"), true, true)).await;
    assert!(resp.success, "last batch failed: {:?}", resp.fault);
    assert_eq!(primary.store().read(&key_a).unwrap().0, Some(json!("a")));
    assert_eq!(primary.store().read(&key_b).unwrap().0, Some(json!("b")));
    assert_eq!(primary.store().owner_of(&key_a), None);
    assert_eq!(primary.store().owner_of(&key_b), None);
}

#[tokio::test]
async fn prepare_advances_the_near_version_source() {
    let cluster = Cluster::new(2);
    let near = &cluster.managers[0];
    let primary = &cluster.managers[1];
    let key = cluster.key_on(1, "stamp");

    // The primary already holds the key at a high version.
    let high = GridVersion {
        topology: cluster.topology.current_version(),
        order: 1_000,
        node_order: 77,
    };
    primary
        .store()
        .apply_write(&key, Some(json!("old")), high)
        .unwrap();

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key.clone(), json!("new")).await.unwrap();
    assert_eq!(near.commit(&tx).await, TxOutcome::Committed);

    // The lock version reported at prepare was observed by the near node:
    // stamps it issues afterwards order after the primary's.
    let next = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert!(next.xid().version() > high);
}

#[tokio::test]
async fn empty_transaction_commits() {
    let cluster = Cluster::new(2);
    let manager = &cluster.managers[0];

    let tx = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(manager.commit(&tx).await, TxOutcome::Committed);
}

#[tokio::test]
async fn store_failure_during_apply_is_unknown() {
    let cfg = GridConfig::for_testing();
    let topology = TopologyService::new(&cfg, Arc::new(RendezvousAffinity::new()));
    let transport = LocalTransport::new();

    let node = NodeId("node-00".to_string());
    let backend = Arc::new(FailingBackend::new());
    let manager = TransactionManager::new(
        node.clone(),
        cfg,
        topology.clone(),
        backend.clone(),
        transport.clone() as Arc<dyn GridTransport>,
    );
    transport.register(node.clone(), manager.clone());
    topology.node_joined(node);
    manager.start();

    let snapshot = topology.current();
    let key = (0..10_000)
        .map(|i| format!("poison-{}", i))
        .find(|k| snapshot.primary(topology.partition_for(k)).is_some())
        .unwrap();
    backend.fail_on(&key);

    let tx = manager.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    manager.put(&tx, key.clone(), json!("v")).await.unwrap();

    // The apply was attempted and partially failed: heuristic outcome,
    // never reported as a clean rollback or commit.
    assert_eq!(manager.commit(&tx).await, TxOutcome::Unknown);
    assert_eq!(tx.state(), TxState::Unknown);

    // The lock did not leak.
    assert_eq!(manager.store().owner_of(&key), None);
}

#[tokio::test]
async fn duplicate_finish_applies_exactly_once() {
    let cluster = Cluster::new(2);
    let primary = &cluster.managers[1];
    let near = cluster.managers[0].local_node().clone();
    let key = cluster.key_on(1, "dup");
    let partition = cluster.topology.partition_for(&key);

    let tx_xid = xid(500);
    let prepare = PrepareRequest {
        xid: tx_xid,
        near_node: near.clone(),
        topology_version: cluster.topology.current_version(),
        concurrency: Concurrency::Optimistic,
        isolation: Isolation::ReadCommitted,
        entries: vec![EntryPayload {
            key: key.clone(),
            op: EntryOp::Update,
            value: Some(json!(42)),
            read_version: None,
            partition,
        }],
        tx_nodes: vec![primary.local_node().clone()],
        last: true,
        one_phase: false,
    };
    let resp = primary.on_prepare(prepare).await;
    assert!(resp.success, "prepare failed: {:?}", resp.fault);

    let finish = FinishRequest {
        xid: tx_xid,
        near_node: near,
        topology_version: cluster.topology.current_version(),
        commit: true,
        evidence: Evidence::default(),
    };
    assert!(primary.on_finish(finish.clone()).await.success);
    let version_after_first = primary.store().read(&key).unwrap().1;

    // The duplicate is acknowledged but changes nothing.
    assert!(primary.on_finish(finish).await.success);
    let version_after_second = primary.store().read(&key).unwrap().1;
    assert_eq!(version_after_first, version_after_second);
}

#[tokio::test]
async fn one_phase_primary_loss_without_evidence_is_unknown() {
    let cluster = Cluster::new(2);
    let near = &cluster.managers[0];
    let key = cluster.key_on(1, "loss");

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key, json!("v")).await.unwrap();

    // Primary unreachable before the one-phase prepare; no backup has any
    // evidence, so the outcome is heuristically unknown.
    let primary_node = cluster.managers[1].local_node().clone();
    cluster.transport.kill(&primary_node);

    assert_eq!(near.commit(&tx).await, TxOutcome::Unknown);
}

#[tokio::test]
async fn one_phase_primary_loss_with_backup_evidence_commits() {
    let cluster = Cluster::new(2);
    let near = &cluster.managers[0];
    let key = cluster.key_on(1, "loss-ev");

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key, json!("v")).await.unwrap();

    // The backup (this node) saw the commit before the primary died.
    near.record_commit_evidence(tx.xid());

    let primary_node = cluster.managers[1].local_node().clone();
    cluster.transport.kill(&primary_node);

    assert_eq!(near.commit(&tx).await, TxOutcome::Committed);
}

#[tokio::test]
async fn orphaned_locks_are_released_when_near_node_dies() {
    let cluster = Cluster::new(3);
    let near = &cluster.managers[0];
    let primary = &cluster.managers[1];
    let key = cluster.key_on(1, "orphan");

    let tx = near.begin(Concurrency::Pessimistic, Isolation::ReadCommitted);
    near.put(&tx, key.clone(), json!("v")).await.unwrap();
    assert_eq!(primary.store().owner_of(&key), Some(tx.xid()));

    // The near node dies; the primary probes, finds no commit evidence and
    // releases the lock.
    cluster.kill(0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(primary.store().owner_of(&key), None);
}

#[tokio::test]
async fn orphaned_transaction_with_peer_evidence_is_applied() {
    let cluster = Cluster::new(3);
    let near_node = cluster.managers[0].local_node().clone();
    let primary = &cluster.managers[1];
    let witness = &cluster.managers[2];
    let key = cluster.key_on(1, "orphan-ev");
    let partition = cluster.topology.partition_for(&key);

    let tx_xid = xid(700);
    let prepare = PrepareRequest {
        xid: tx_xid,
        near_node,
        topology_version: cluster.topology.current_version(),
        concurrency: Concurrency::Optimistic,
        isolation: Isolation::ReadCommitted,
        entries: vec![EntryPayload {
            key: key.clone(),
            op: EntryOp::Update,
            value: Some(json!("decided")),
            read_version: None,
            partition,
        }],
        tx_nodes: vec![
            primary.local_node().clone(),
            witness.local_node().clone(),
        ],
        last: true,
        one_phase: false,
    };
    assert!(primary.on_prepare(prepare).await.success);

    // A surviving peer knows the transaction committed.
    witness.record_commit_evidence(tx_xid);

    cluster.kill(0);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The primary resolved the orphan by applying the commit.
    let (value, _) = primary.store().read(&key).unwrap();
    assert_eq!(value, Some(json!("decided")));
    assert_eq!(primary.store().owner_of(&key), None);
}

#[tokio::test]
async fn probe_reports_known_outcomes() {
    let cluster = Cluster::new(1);
    let manager = &cluster.managers[0];

    manager.record_commit_evidence(xid(1));
    manager.record_rollback_evidence(xid(2));

    let committed = manager.on_probe(ProbeRequest { xid: xid(1) });
    assert_eq!(
        committed.outcome,
        Some(super::protocol::KnownOutcome::Committed)
    );
    let rolled = manager.on_probe(ProbeRequest { xid: xid(2) });
    assert_eq!(
        rolled.outcome,
        Some(super::protocol::KnownOutcome::RolledBack)
    );
    let unknown = manager.on_probe(ProbeRequest { xid: xid(3) });
    assert_eq!(unknown.outcome, None);
    assert!(!unknown.pending);
}

#[tokio::test]
async fn merged_pending_evidence_shows_on_probes() {
    let cluster = Cluster::new(1);
    let manager = &cluster.managers[0];

    // A peer's finish declared the xid still in flight.
    manager.merge_evidence(&Evidence {
        committed: Vec::new(),
        rolled_back: Vec::new(),
        pending: vec![xid(9)],
    });
    let probe = manager.on_probe(ProbeRequest { xid: xid(9) });
    assert!(probe.pending);
    assert_eq!(probe.outcome, None);

    // An outcome supersedes the pending marker.
    manager.record_commit_evidence(xid(9));
    let probe = manager.on_probe(ProbeRequest { xid: xid(9) });
    assert!(!probe.pending);
    assert_eq!(
        probe.outcome,
        Some(super::protocol::KnownOutcome::Committed)
    );
}
