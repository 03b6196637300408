//! Affinity Function
//!
//! Pure mapping from a partition id to the ordered list of owning nodes:
//! index 0 is the primary, the rest are backups. The same (topology version,
//! partition) pair always maps to the same assignment, so every node can
//! compute ownership independently and agree without talking to each other.

use crate::membership::types::NodeId;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Post-filter over the naive assignment, e.g. "never place primary and
/// backup in the same failure domain".
pub trait BackupFilter: Send + Sync {
    fn allows(&self, primary: &NodeId, backup: &NodeId) -> bool;
}

/// Deterministic partition-to-owners assignment.
///
/// Implementations must not depend on the iteration order of the input
/// beyond the canonical ordering applied here (nodes sorted by id).
pub trait AffinityFunction: Send + Sync {
    /// Computes the full assignment table for one topology version.
    ///
    /// Returns one owner list per partition, primary first. When fewer live
    /// nodes than `backups + 1` exist, partitions get fewer backups than
    /// configured rather than failing.
    fn assign(
        &self,
        topology_version: u64,
        nodes: &[NodeId],
        partitions: u32,
        backups: usize,
    ) -> Vec<Vec<NodeId>>;
}

/// Rendezvous (highest-random-weight) affinity.
///
/// Each (node, partition) pair is scored with a stable hash; owners are the
/// highest-scoring nodes. Adding or removing one node only moves the
/// partitions that scored highest on that node, keeping reassignment churn
/// low across topology changes.
pub struct RendezvousAffinity {
    filter: Option<Box<dyn BackupFilter>>,
}

impl RendezvousAffinity {
    pub fn new() -> Self {
        Self { filter: None }
    }

    pub fn with_backup_filter(filter: Box<dyn BackupFilter>) -> Self {
        Self {
            filter: Some(filter),
        }
    }

    fn score(node: &NodeId, partition: u32) -> u64 {
        let mut hasher = DefaultHasher::new();
        node.0.hash(&mut hasher);
        partition.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for RendezvousAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityFunction for RendezvousAffinity {
    fn assign(
        &self,
        _topology_version: u64,
        nodes: &[NodeId],
        partitions: u32,
        backups: usize,
    ) -> Vec<Vec<NodeId>> {
        // Canonical node ordering: callers may pass nodes in any order.
        let mut canonical: Vec<&NodeId> = nodes.iter().collect();
        canonical.sort();
        canonical.dedup();

        let mut table = Vec::with_capacity(partitions as usize);

        for partition in 0..partitions {
            if canonical.is_empty() {
                table.push(Vec::new());
                continue;
            }

            let mut scored: Vec<(u64, &NodeId)> = canonical
                .iter()
                .map(|node| (Self::score(node, partition), *node))
                .collect();
            // Ties broken by node id so the result stays total-ordered.
            scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));

            let primary = scored[0].1.clone();
            let mut owners = vec![primary.clone()];

            for (_, candidate) in scored.iter().skip(1) {
                if owners.len() > backups {
                    break;
                }
                let allowed = self
                    .filter
                    .as_ref()
                    .map(|f| f.allows(&primary, candidate))
                    .unwrap_or(true);
                if allowed {
                    owners.push((*candidate).clone());
                }
            }

            table.push(owners);
        }

        table
    }
}

/// Stable hash of a key into a partition id. Every node must agree on this
/// mapping, which is why it lives next to the affinity function.
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions as u64) as u32
}
