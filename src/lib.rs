//! Partitioned In-Memory Transactional Data Grid
//!
//! This library crate defines the core modules of a distributed key/value grid
//! that supports multi-key transactions across a dynamic cluster of nodes.
//! It serves as the foundation for the node binary (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of five loosely coupled subsystems:
//!
//! - **`membership`**: The cluster coordination layer. Uses a UDP-based Gossip
//!   protocol (SWIM-like) to manage node discovery and failure detection, and
//!   feeds node join/leave transitions into the topology layer.
//! - **`topology`**: Versioned, immutable snapshots of the cluster plus the
//!   affinity function that decides which nodes own which partitions
//!   (primary first, then backups).
//! - **`cache`**: Per-entry state: value, monotonic version, and the lock
//!   candidate queue serializing concurrent transactions on the same key.
//! - **`txn`**: The transaction object, its state machine, and the two-phase
//!   prepare/finish protocol engine spanning near node, primaries and backups,
//!   including the one-phase fast path and partial-failure recovery.
//! - **`net`**: The transport seam. Inter-node protocol messages travel as
//!   JSON over HTTP in production; tests route them in-process.

pub mod cache;
pub mod config;
pub mod membership;
pub mod net;
pub mod topology;
pub mod txn;
