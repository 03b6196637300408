//! Node Configuration
//!
//! Tunables for the grid node: partition count, backup count, protocol
//! timeouts and retry budgets. A single `GridConfig` instance is built at
//! startup (from command-line flags in `main.rs`) and injected into the
//! components that need it.

use std::time::Duration;

/// Default number of partitions the key space is divided into.
/// Must be identical on every node of the cluster.
pub const DEFAULT_PARTITIONS: u32 = 1024;

/// Default number of backup copies kept per partition.
pub const DEFAULT_BACKUPS: usize = 1;

/// Default window a prepare may wait for a contended lock before the whole
/// transaction fails with a lock-timeout error.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(3);

/// Default window the near node waits for a single prepare/finish reply.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of re-routing attempts after a stale-topology rejection.
pub const DEFAULT_ROUTING_RETRIES: usize = 3;

/// Default capacity of the per-node ring of recently finished transaction
/// versions carried as recovery evidence on finish messages.
pub const DEFAULT_EVIDENCE_CAPACITY: usize = 4096;

/// Runtime configuration of a grid node.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// Fixed number of hash partitions (cluster-wide constant).
    pub partitions: u32,
    /// Configured backups per partition. Fewer are assigned when the
    /// cluster has fewer than `backups + 1` live nodes.
    pub backups: usize,
    /// How long a remote prepare may stay suspended waiting for lock
    /// ownership before failing the transaction.
    pub lock_timeout: Duration,
    /// Per-node reply timeout for prepare/finish round-trips.
    pub reply_timeout: Duration,
    /// Bounded retry budget for stale-topology re-routing.
    pub routing_retries: usize,
    /// Capacity of the committed/rolled-back evidence rings.
    pub evidence_capacity: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            partitions: DEFAULT_PARTITIONS,
            backups: DEFAULT_BACKUPS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            routing_retries: DEFAULT_ROUTING_RETRIES,
            evidence_capacity: DEFAULT_EVIDENCE_CAPACITY,
        }
    }
}

impl GridConfig {
    /// Small configuration used by tests: few partitions, short timeouts.
    pub fn for_testing() -> Self {
        Self {
            partitions: 64,
            backups: 1,
            lock_timeout: Duration::from_millis(500),
            reply_timeout: Duration::from_secs(2),
            routing_retries: 3,
            evidence_capacity: 256,
        }
    }
}
