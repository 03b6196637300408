//! Cluster Topology Module
//!
//! Maintains versioned, immutable snapshots of `{node set, partition ->
//! owners}`. Every transaction and protocol message carries the topology
//! version it was computed against; a message computed against a stale
//! version is rejected by the receiver and re-routed by the sender.
//!
//! Snapshots are replaced, never mutated, so readers only swap a reference
//! and never hold a lock across any real work.

pub mod affinity;
pub mod snapshot;

pub use affinity::{AffinityFunction, BackupFilter, RendezvousAffinity};
pub use snapshot::{TopologyEvent, TopologyService, TopologySnapshot};
