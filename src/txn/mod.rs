//! Distributed Transactions
//!
//! The transaction engine: a near (originating) node records a
//! transaction's read and write sets, groups them per primary, and drives
//! the two-phase prepare/finish protocol across the owners, with a
//! one-phase fast path when a single primary is involved. Participants
//! queue lock candidates on the cache entries, validate optimistic reads,
//! pre-stage backups, and apply the committed write set exactly once.
//!
//! Failures resolve through recovery evidence piggybacked on finish
//! messages; a commit whose result genuinely cannot be confirmed ends in
//! the explicit `Unknown` outcome, never a silent partial commit.

pub mod error;
mod finish;
pub mod future;
pub mod handlers;
pub mod manager;
mod prepare;
pub mod protocol;
mod recovery;
pub mod remote;
pub mod transaction;

#[cfg(test)]
mod tests;

pub use error::TxnError;
pub use manager::{EvidenceLog, PostCommitHook, TransactionManager};
pub use transaction::{Concurrency, Isolation, Transaction, TxOutcome, TxState};
