//! Transaction Network Protocol
//!
//! Defines the API endpoints and Data Transfer Objects (DTOs) used to drive
//! the distributed prepare/finish handshake between the near node, the
//! primaries and their backups.
//!
//! Every message is tagged with the transaction xid and the topology version
//! it was computed against; receivers reject messages whose partitions they
//! no longer own, and senders re-route against a fresh snapshot.

use serde::{Deserialize, Serialize};

use crate::cache::{GridVersion, Key, TxXid, Value};
use crate::membership::types::NodeId;

use super::transaction::{Concurrency, EntryOp, Isolation};

// --- API Endpoints ---

/// Unlocked read of a single key from its primary (optimistic reads).
pub const ENDPOINT_TX_READ: &str = "/tx/read";
/// Lock acquisition at operation time (pessimistic transactions).
pub const ENDPOINT_TX_LOCK: &str = "/tx/lock";
/// Phase one: near node to primary.
pub const ENDPOINT_TX_PREPARE: &str = "/tx/prepare";
/// Phase two (commit or rollback): near node to every participant.
pub const ENDPOINT_TX_FINISH: &str = "/tx/finish";
/// Primary to backup: pre-stage the write set during prepare.
pub const ENDPOINT_TX_BACKUP_PREPARE: &str = "/tx/backup-prepare";
/// Primary to backup: apply the final per-entry outcome.
pub const ENDPOINT_TX_BACKUP_FINISH: &str = "/tx/backup-finish";
/// Recovery probe: ask a surviving node what it knows about an xid.
pub const ENDPOINT_TX_PROBE: &str = "/tx/probe";

// --- Data Transfer Objects ---

/// Protocol-level failure reasons carried in responses. Mapped back to
/// `TxnError` by the near node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TxnFault {
    LockTimeout,
    Conflict {
        key: Key,
        read: Option<GridVersion>,
        found: Option<GridVersion>,
    },
    NotOwner {
        partition: u32,
        topology: u64,
    },
    Store {
        key: Key,
        reason: String,
    },
}

/// One transaction entry on the wire: enough to replay the operation
/// against the remote primary's cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPayload {
    pub key: Key,
    pub op: EntryOp,
    /// New value for updates; `None` for reads and deletes.
    pub value: Option<Value>,
    /// Version observed at read time; validated at prepare for optimistic
    /// transactions.
    pub read_version: Option<GridVersion>,
    pub partition: u32,
}

/// Recovery evidence piggybacked on finish messages: the sets of
/// transaction versions this node knows finished cluster-wide, so a
/// receiver can resolve an equally-versioned write it is missing without a
/// separate consensus round.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    pub committed: Vec<TxXid>,
    pub rolled_back: Vec<TxXid>,
    /// Xids the sender still has in flight; receivers answer recovery
    /// probes for them as pending until an outcome lands.
    pub pending: Vec<TxXid>,
}

/// Unlocked single-key read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadRequest {
    pub key: Key,
    pub partition: u32,
    pub topology_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadResponse {
    pub value: Option<Value>,
    pub version: Option<GridVersion>,
    pub fault: Option<TxnFault>,
}

/// One key in a lock request; `read` selects read intent (the value is
/// returned alongside the grant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockKey {
    pub key: Key,
    pub partition: u32,
    pub read: bool,
}

/// Pessimistic lock acquisition, sent at operation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRequest {
    pub xid: TxXid,
    pub near_node: NodeId,
    pub topology_version: u64,
    pub keys: Vec<LockKey>,
    pub timeout_ms: u64,
}

/// A value observed under a granted lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedValue {
    pub key: Key,
    pub value: Option<Value>,
    pub version: Option<GridVersion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockResponse {
    pub xid: TxXid,
    pub success: bool,
    pub fault: Option<TxnFault>,
    pub values: Vec<LockedValue>,
}

/// Phase-one request from the near node to one primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub xid: TxXid,
    pub near_node: NodeId,
    pub topology_version: u64,
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    /// Entries owned by the receiving primary, in insertion order.
    pub entries: Vec<EntryPayload>,
    /// Every node participating in this transaction; primaries need it for
    /// backup fan-out and cooperative recovery.
    pub tx_nodes: Vec<NodeId>,
    /// True when this is the last prepare this primary will receive for
    /// the transaction, so it can decide without an explicit count.
    pub last: bool,
    /// One-phase fast path: prepare and commit merged into one round-trip
    /// (write set maps to exactly one primary).
    pub one_phase: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareResponse {
    pub xid: TxXid,
    pub success: bool,
    pub fault: Option<TxnFault>,
    /// Versions of entries the primary holds locks for; observed by the
    /// near node's version source so stamps it issues afterwards order
    /// after them.
    pub owned_versions: Vec<(Key, GridVersion)>,
}

/// Phase-two request: commit or roll back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    pub xid: TxXid,
    pub near_node: NodeId,
    pub topology_version: u64,
    pub commit: bool,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishResponse {
    pub xid: TxXid,
    pub success: bool,
    pub fault: Option<TxnFault>,
}

/// Pre-stages the write set on a backup during prepare, cutting the work
/// left at commit time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupPrepareRequest {
    pub xid: TxXid,
    pub primary: NodeId,
    pub near_node: NodeId,
    pub tx_nodes: Vec<NodeId>,
    pub topology_version: u64,
    pub entries: Vec<EntryPayload>,
}

/// Final per-entry outcome shipped to backups at commit, so they never
/// replay conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryWrite {
    pub key: Key,
    /// `None` encodes a delete.
    pub value: Option<Value>,
    pub version: GridVersion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupFinishRequest {
    pub xid: TxXid,
    pub primary: NodeId,
    pub commit: bool,
    pub writes: Vec<EntryWrite>,
    pub evidence: Evidence,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupAck {
    pub xid: TxXid,
    pub success: bool,
}

/// What a surviving node knows about a transaction's outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnownOutcome {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub xid: TxXid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub xid: TxXid,
    pub outcome: Option<KnownOutcome>,
    /// The node still holds an in-flight record for the xid.
    pub pending: bool,
}
