//! Transaction Error Taxonomy
//!
//! Typed failures of the transaction protocol. Routing errors and lock
//! timeouts are handled inside the engine (retried or turned into a
//! rollback); store failures and recovery ambiguity always surface
//! distinctly, because application-level compensation depends on telling
//! "rolled back" apart from "maybe committed".

use crate::cache::{GridVersion, Key, StoreError};
use crate::membership::types::NodeId;

use super::transaction::TxState;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TxnError {
    /// A prepare could not acquire a lock within the configured window.
    #[error("lock acquisition timed out")]
    LockTimeout,

    /// Optimistic validation failed: the version recorded at read time no
    /// longer matches the entry.
    #[error("optimistic conflict on key {key}: read {read:?}, found {found:?}")]
    Conflict {
        key: Key,
        read: Option<GridVersion>,
        found: Option<GridVersion>,
    },

    /// The receiving node no longer owns the partition; the near node must
    /// recompute affinity and re-route.
    #[error("partition {partition} not owned at topology {topology}")]
    NotOwner { partition: u32, topology: u64 },

    /// No alive node owns the partition.
    #[error("no alive nodes own partition {0}")]
    Unmapped(u32),

    /// A participating node left the cluster mid-protocol.
    #[error("node {0} left the cluster")]
    NodeLeft(NodeId),

    /// Storage-layer failure during commit application.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The bounded re-routing budget ran out.
    #[error("routing retry budget exhausted")]
    RoutingExhausted,

    /// An operation was attempted in a state that does not allow it.
    #[error("invalid transaction state {0:?} for {1}")]
    InvalidState(TxState, &'static str),

    /// A per-node reply did not arrive within the reply timeout.
    #[error("reply timed out")]
    ReplyTimeout,

    /// Transport-level failure talking to a peer.
    #[error("transport failure: {0}")]
    Transport(String),
}
