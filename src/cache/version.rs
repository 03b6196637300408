//! Grid Versions
//!
//! A `GridVersion` stamps every committed write and every transaction. It is
//! totally ordered across the cluster: first by the topology version it was
//! issued under, then by a per-node logical counter, with the node's order
//! discriminant breaking ties between nodes that issued the same counter.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cluster-wide totally ordered version stamp.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GridVersion {
    /// Topology version the stamp was issued under.
    pub topology: u64,
    /// Per-node logical counter, advanced past every observed stamp.
    pub order: u64,
    /// Stable per-node discriminant (derived from the node id) breaking
    /// ties between concurrent writers.
    pub node_order: u32,
}

impl std::fmt::Display for GridVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.topology, self.order, self.node_order)
    }
}

/// Globally unique transaction version (xid). Doubles as the fairness key
/// of the lock candidate queue: candidates are served FIFO by xid.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxXid(pub GridVersion);

impl std::fmt::Display for TxXid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xid-{}", self.0)
    }
}

impl TxXid {
    pub fn version(&self) -> GridVersion {
        self.0
    }
}

/// Per-node source of strictly increasing `GridVersion`s.
///
/// Works like a logical clock: `observe` advances the local counter past any
/// stamp seen on the wire, so `next` always produces something greater than
/// everything this node has witnessed.
pub struct VersionSource {
    topology: AtomicU64,
    order: AtomicU64,
    node_order: u32,
}

impl VersionSource {
    pub fn new(node_order: u32) -> Self {
        Self {
            topology: AtomicU64::new(0),
            order: AtomicU64::new(0),
            node_order,
        }
    }

    pub fn node_order(&self) -> u32 {
        self.node_order
    }

    /// Records a topology change; subsequent stamps carry the new version.
    pub fn on_topology_change(&self, topology_version: u64) {
        self.topology.fetch_max(topology_version, Ordering::SeqCst);
    }

    /// Advances the local counter past a stamp observed elsewhere.
    pub fn observe(&self, seen: GridVersion) {
        self.topology.fetch_max(seen.topology, Ordering::SeqCst);
        self.order.fetch_max(seen.order, Ordering::SeqCst);
    }

    /// Issues the next stamp, strictly greater than anything observed.
    pub fn next(&self) -> GridVersion {
        GridVersion {
            topology: self.topology.load(Ordering::SeqCst),
            order: self.order.fetch_add(1, Ordering::SeqCst) + 1,
            node_order: self.node_order,
        }
    }

    /// Issues a stamp strictly greater than `floor`. Used when applying a
    /// write on top of an existing entry version.
    pub fn after(&self, floor: GridVersion) -> GridVersion {
        self.observe(floor);
        self.next()
    }
}
