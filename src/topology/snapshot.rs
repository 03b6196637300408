//! Versioned Topology Snapshots
//!
//! The `TopologyService` owns the current snapshot and the recent history.
//! Node joins and departures (from the membership layer, or driven directly
//! in tests) bump the version and publish an event so in-flight protocol
//! work can react to departures without polling.

use crate::config::GridConfig;
use crate::membership::types::{MembershipEvent, NodeId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc};

use super::affinity::{partition_for_key, AffinityFunction};

/// How many past snapshots are kept for `for_version` lookups. Transactions
/// pin a version when they start; anything older than this window has long
/// finished or been rolled back.
const HISTORY_LIMIT: usize = 32;

/// Immutable view of the cluster at one topology version.
#[derive(Debug)]
pub struct TopologySnapshot {
    /// Monotonically increasing, bumped on every node set change.
    pub version: u64,
    /// Live nodes, sorted by id (canonical order).
    pub nodes: Vec<NodeId>,
    /// Per-partition owner lists, primary first.
    pub assignments: Vec<Vec<NodeId>>,
}

impl TopologySnapshot {
    pub fn owners(&self, partition: u32) -> &[NodeId] {
        self.assignments
            .get(partition as usize)
            .map(|owners| owners.as_slice())
            .unwrap_or(&[])
    }

    pub fn primary(&self, partition: u32) -> Option<&NodeId> {
        self.owners(partition).first()
    }

    pub fn backups(&self, partition: u32) -> &[NodeId] {
        let owners = self.owners(partition);
        if owners.is_empty() { owners } else { &owners[1..] }
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.binary_search(node).is_ok()
    }

    pub fn is_primary(&self, partition: u32, node: &NodeId) -> bool {
        self.primary(partition) == Some(node)
    }

    pub fn is_owner(&self, partition: u32, node: &NodeId) -> bool {
        self.owners(partition).contains(node)
    }
}

/// Node join/leave transitions at topology granularity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    Joined(NodeId, u64),
    Left(NodeId, u64),
}

/// Owns the current snapshot and rebuilds it on membership changes.
pub struct TopologyService {
    partitions: u32,
    backups: usize,
    affinity: Arc<dyn AffinityFunction>,
    current: RwLock<Arc<TopologySnapshot>>,
    history: Mutex<VecDeque<Arc<TopologySnapshot>>>,
    events: broadcast::Sender<TopologyEvent>,
}

impl TopologyService {
    pub fn new(cfg: &GridConfig, affinity: Arc<dyn AffinityFunction>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let empty = Arc::new(TopologySnapshot {
            version: 0,
            nodes: Vec::new(),
            assignments: vec![Vec::new(); cfg.partitions as usize],
        });

        Arc::new(Self {
            partitions: cfg.partitions,
            backups: cfg.backups,
            affinity,
            current: RwLock::new(empty.clone()),
            history: Mutex::new(VecDeque::from([empty])),
            events,
        })
    }

    /// Current snapshot; cheap, clones only an `Arc`.
    pub fn current(&self) -> Arc<TopologySnapshot> {
        self.current.read().expect("topology lock poisoned").clone()
    }

    pub fn current_version(&self) -> u64 {
        self.current().version
    }

    /// Snapshot for a pinned version, if still within the history window.
    pub fn for_version(&self, version: u64) -> Option<Arc<TopologySnapshot>> {
        self.history
            .lock()
            .expect("topology history lock poisoned")
            .iter()
            .find(|snap| snap.version == version)
            .cloned()
    }

    pub fn partition_for(&self, key: &str) -> u32 {
        partition_for_key(key, self.partitions)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// Resolves once `node` is no longer part of the topology. Returns
    /// immediately when the node is already gone; used by the protocol
    /// engine so mini-futures waiting on a departed node never hang.
    pub async fn wait_departure(&self, node: &NodeId) {
        let mut rx = self.events.subscribe();
        if !self.current().contains(node) {
            return;
        }
        loop {
            match rx.recv().await {
                Ok(TopologyEvent::Left(left, _)) if &left == node => return,
                Ok(_) => {}
                // Channel lagged or closed: fall back to the snapshot.
                Err(_) => {
                    if !self.current().contains(node) {
                        return;
                    }
                }
            }
        }
    }

    pub fn node_joined(&self, node: NodeId) {
        let version = self.rebuild(|nodes| {
            if !nodes.contains(&node) {
                nodes.push(node.clone());
            }
        });
        if let Some(version) = version {
            tracing::info!("Topology v{}: node {} joined", version, node);
            let _ = self.events.send(TopologyEvent::Joined(node, version));
        }
    }

    pub fn node_left(&self, node: &NodeId) {
        let version = self.rebuild(|nodes| {
            nodes.retain(|n| n != node);
        });
        if let Some(version) = version {
            tracing::info!("Topology v{}: node {} left", version, node);
            let _ = self
                .events
                .send(TopologyEvent::Left(node.clone(), version));
        }
    }

    /// Applies `mutate` to the node set and installs a new snapshot.
    /// Returns the new version, or `None` when the node set was unchanged.
    fn rebuild<F: FnOnce(&mut Vec<NodeId>)>(&self, mutate: F) -> Option<u64> {
        let mut current = self.current.write().expect("topology lock poisoned");

        let mut nodes = current.nodes.clone();
        mutate(&mut nodes);
        nodes.sort();
        nodes.dedup();

        if nodes == current.nodes {
            return None;
        }

        let version = current.version + 1;
        let assignments = self
            .affinity
            .assign(version, &nodes, self.partitions, self.backups);

        let snapshot = Arc::new(TopologySnapshot {
            version,
            nodes,
            assignments,
        });

        *current = snapshot.clone();
        drop(current);

        let mut history = self.history.lock().expect("topology history lock poisoned");
        history.push_back(snapshot);
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }

        Some(version)
    }

    /// Bridges membership events into topology changes. Spawned once per
    /// node at startup.
    pub fn bridge(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<MembershipEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let topology = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MembershipEvent::Joined(node) => topology.node_joined(node.id),
                    MembershipEvent::Left(node_id) => topology.node_left(&node_id),
                }
            }
        })
    }
}
