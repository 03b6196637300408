//! Cluster Membership Module
//!
//! UDP gossip (SWIM-like) node discovery and failure detection. The service
//! tracks the member set and publishes `MembershipEvent`s (joins and
//! departures) that the topology layer turns into versioned snapshots.

pub mod service;
pub mod types;
