//! Cache Entry Module
//!
//! Per-key state of the grid: the current value, a monotonically increasing
//! version, and the ordered queue of lock candidates (transactions wanting
//! to read or write the key).
//!
//! ## Core Concepts
//! - **Version**: totally ordered across the cluster; every committed write
//!   to a key strictly increases it on every node that applies it.
//! - **Candidate queue**: FIFO by transaction version; the head owns the
//!   entry, everyone else waits. Ownership changes fire registered waiters,
//!   which is how a suspended prepare or a deferred commit resumes.
//! - **Sharding**: entries live in a sharded map with one mutex per shard,
//!   held only for local mutation and never across a network call.

pub mod entry;
pub mod store;
pub mod version;

pub use entry::{CacheEntry, Key, LockCandidate, LockOutcome, Value};
pub use store::{CacheStore, EntryBackend, LockAttempt, MemoryBackend, StoreError};
pub use version::{GridVersion, TxXid, VersionSource};

#[cfg(test)]
mod tests;
