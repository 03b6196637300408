//! Protocol scenarios over an in-process cluster: several transaction
//! managers sharing one topology service and routing messages through the
//! local transport, so multi-node prepare/finish runs deterministically
//! without sockets.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use gridtx::cache::MemoryBackend;
use gridtx::config::GridConfig;
use gridtx::membership::types::NodeId;
use gridtx::net::{GridTransport, LocalTransport};
use gridtx::topology::{RendezvousAffinity, TopologyService};
use gridtx::txn::manager::TransactionManager;
use gridtx::txn::{Concurrency, Isolation, TxOutcome};

struct Cluster {
    topology: Arc<TopologyService>,
    transport: Arc<LocalTransport>,
    managers: Vec<Arc<TransactionManager>>,
}

impl Cluster {
    fn new(size: usize) -> Self {
        let cfg = GridConfig::for_testing();
        let topology = TopologyService::new(&cfg, Arc::new(RendezvousAffinity::new()));
        let transport = LocalTransport::new();

        let mut managers = Vec::new();
        for index in 0..size {
            let node = NodeId(format!("node-{:02}", index));
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

    fn manager_for(&self, node: &NodeId) -> &Arc<TransactionManager> {
        self.managers
            .iter()
            .find(|m| m.local_node() == node)
            .expect("unknown node")
    }

    fn kill(&self, index: usize) {
        let node = self.managers[index].local_node().clone();
        self.transport.kill(&node);
        self.topology.node_left(&node);
    }
}

#[tokio::test]
async fn commit_spanning_two_primaries() {
    let cluster = Cluster::new(3);
    let near = &cluster.managers[0];
    let key_a = cluster.key_on(1, "pair-a");
    let key_b = cluster.key_on(2, "pair-b");

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key_a.clone(), json!({"v": "a"})).await.unwrap();
    near.put(&tx, key_b.clone(), json!({"v": "b"})).await.unwrap();
    assert_eq!(near.commit(&tx).await, TxOutcome::Committed);

    // Both primaries applied and released their locks.
    let reader = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(
        near.get(&reader, &key_a).await.unwrap(),
        Some(json!({"v": "a"}))
    );
    assert_eq!(
        near.get(&reader, &key_b).await.unwrap(),
        Some(json!({"v": "b"}))
    );
    assert_eq!(cluster.managers[1].store().owner_of(&key_a), None);
    assert_eq!(cluster.managers[2].store().owner_of(&key_b), None);
}

#[tokio::test]
async fn one_phase_commit_on_single_primary() {
    let cluster = Cluster::new(3);
    let near = &cluster.managers[0];
    let key = cluster.key_on(1, "fast");

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key.clone(), json!(7)).await.unwrap();
    assert_eq!(near.commit(&tx).await, TxOutcome::Committed);

    // Visible from any node.
    let other = &cluster.managers[2];
    let reader = other.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(other.get(&reader, &key).await.unwrap(), Some(json!(7)));
}

#[tokio::test]
async fn backup_receives_the_committed_write() {
    let cluster = Cluster::new(3);
    let near = &cluster.managers[0];
    let key = cluster.key_on(1, "replica");
    let partition = cluster.topology.partition_for(&key);

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key.clone(), json!("copied")).await.unwrap();
    assert_eq!(near.commit(&tx).await, TxOutcome::Committed);

    let snapshot = cluster.topology.current();
    let backup = snapshot.backups(partition).first().expect("no backup");
    let backup_manager = cluster.manager_for(backup);

    // The backup holds the same value at the same version as the primary.
    let (primary_value, primary_version) =
        cluster.managers[1].store().read(&key).expect("primary entry");
    let (backup_value, backup_version) =
        backup_manager.store().read(&key).expect("backup entry");
    assert_eq!(primary_value, Some(json!("copied")));
    assert_eq!(backup_value, primary_value);
    assert_eq!(backup_version, primary_version);
}

#[tokio::test]
async fn pessimistic_contention_serializes_writers() {
    let cluster = Cluster::new(2);
    let near = cluster.managers[0].clone();
    let key = cluster.key_on(1, "contend");
    let primary = cluster.managers[1].clone();

    let t1 = near.begin(Concurrency::Pessimistic, Isolation::ReadCommitted);
    near.put(&t1, key.clone(), json!("first")).await.unwrap();
    assert_eq!(primary.store().owner_of(&key), Some(t1.xid()));

    // The second writer blocks in the candidate queue until the first
    // commits, then signals its grant and waits for permission to commit
    // so the intermediate state stays observable.
    let (locked_tx, locked_rx) = tokio::sync::oneshot::channel();
    let (commit_tx, commit_rx) = tokio::sync::oneshot::channel();
    let contender = {
        let near = near.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let t2 = near.begin(Concurrency::Pessimistic, Isolation::ReadCommitted);
            near.put(&t2, key.clone(), json!("second")).await.unwrap();
            locked_tx.send(()).unwrap();
            commit_rx.await.unwrap();
            near.commit(&t2).await
        })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!contender.is_finished());
    assert_eq!(near.commit(&t1).await, TxOutcome::Committed);

    // The contender now holds the lock; the first write is applied.
    locked_rx.await.unwrap();
    let (first_value, first_version) = primary.store().read(&key).expect("entry");
    assert_eq!(first_value, Some(json!("first")));

    commit_tx.send(()).unwrap();
    assert_eq!(contender.await.unwrap(), TxOutcome::Committed);

    // Last writer wins at a strictly greater version, no lock left behind.
    let (second_value, second_version) = primary.store().read(&key).expect("entry");
    assert_eq!(second_value, Some(json!("second")));
    assert!(second_version > first_version);
    assert_eq!(primary.store().owner_of(&key), None);
}

#[tokio::test]
async fn optimistic_conflict_fails_the_second_committer() {
    let cluster = Cluster::new(2);
    let near = &cluster.managers[0];
    let key = cluster.key_on(1, "race");

    let t1 = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    let t2 = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);

    // Both observe the same version, both write.
    assert_eq!(near.get(&t1, &key).await.unwrap(), None);
    assert_eq!(near.get(&t2, &key).await.unwrap(), None);
    near.put(&t1, key.clone(), json!("t1")).await.unwrap();
    near.put(&t2, key.clone(), json!("t2")).await.unwrap();

    assert_eq!(near.commit(&t1).await, TxOutcome::Committed);
    // The second validation sees a newer version: conflict, nothing
    // applied.
    assert_eq!(near.commit(&t2).await, TxOutcome::Conflict);

    let reader = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(near.get(&reader, &key).await.unwrap(), Some(json!("t1")));
}

#[tokio::test]
async fn rollback_releases_locks_and_is_idempotent() {
    let cluster = Cluster::new(2);
    let near = &cluster.managers[0];
    let key = cluster.key_on(1, "undo");
    let primary = &cluster.managers[1];

    let tx = near.begin(Concurrency::Pessimistic, Isolation::ReadCommitted);
    near.put(&tx, key.clone(), json!("never")).await.unwrap();
    assert_eq!(primary.store().owner_of(&key), Some(tx.xid()));

    assert_eq!(near.rollback(&tx).await, TxOutcome::RolledBack);
    assert_eq!(primary.store().owner_of(&key), None);

    // Repeats and a late commit report the same terminal outcome.
    assert_eq!(near.rollback(&tx).await, TxOutcome::RolledBack);
    assert_eq!(near.commit(&tx).await, TxOutcome::RolledBack);

    let reader = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(near.get(&reader, &key).await.unwrap(), None);
}

#[tokio::test]
async fn node_departure_during_prepare_rolls_back() {
    let cluster = Cluster::new(3);
    let near = &cluster.managers[0];
    let key_a = cluster.key_on(1, "dep-a");
    let key_b = cluster.key_on(2, "dep-b");

    let tx = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&tx, key_a.clone(), json!("a")).await.unwrap();
    near.put(&tx, key_b.clone(), json!("b")).await.unwrap();

    // One of the two primaries dies before prepare: the commit decision
    // was never made, so the whole transaction rolls back.
    cluster.kill(2);
    assert_eq!(near.commit(&tx).await, TxOutcome::RolledBack);

    // The surviving primary applied nothing and holds no lock.
    assert_eq!(cluster.managers[1].store().owner_of(&key_a), None);
    let reader = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    assert_eq!(near.get(&reader, &key_a).await.unwrap(), None);
}

#[tokio::test]
async fn pessimistic_read_locks_out_writers() {
    let cluster = Cluster::new(2);
    let near = cluster.managers[0].clone();
    let key = cluster.key_on(1, "rlock");
    let primary = cluster.managers[1].clone();

    let writer = near.begin(Concurrency::Optimistic, Isolation::ReadCommitted);
    near.put(&writer, key.clone(), json!(1)).await.unwrap();
    assert_eq!(near.commit(&writer).await, TxOutcome::Committed);

    let reader = near.begin(Concurrency::Pessimistic, Isolation::RepeatableRead);
    assert_eq!(near.get(&reader, &key).await.unwrap(), Some(json!(1)));
    assert_eq!(primary.store().owner_of(&key), Some(reader.xid()));

    // A concurrent writer waits behind the read lock.
    let blocked = {
        let near = near.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let w = near.begin(Concurrency::Pessimistic, Isolation::ReadCommitted);
            near.put(&w, key, json!(2)).await.unwrap();
            near.commit(&w).await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!blocked.is_finished());

    assert_eq!(near.commit(&reader).await, TxOutcome::Committed);
    assert_eq!(blocked.await.unwrap(), TxOutcome::Committed);
}
