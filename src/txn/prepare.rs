//! Near-Side Prepare
//!
//! Drives phase one from the originating node: the transaction's entries
//! are grouped per primary, one prepare mini-future is spawned per node,
//! and the replies are folded into a single verdict. A stale-topology
//! rejection rolls the participants back, re-routes against the current
//! snapshot and retries within a bounded budget.
//!
//! When the whole write set maps to a single primary the prepare is sent
//! with the one-phase flag and the primary commits inline, saving the
//! second round-trip.

use std::sync::Arc;
use tokio::task::JoinSet;

use crate::membership::types::NodeId;

use super::error::TxnError;
use super::future;
use super::manager::{fault_to_error, TransactionManager};
use super::protocol::{FinishRequest, PrepareRequest, TxnFault};
use super::transaction::{Transaction, TxState};

/// How phase one ended when it succeeded.
pub(super) enum PrepareOutcome {
    /// Every primary holds its locks; the commit decision is still ours.
    Prepared,
    /// Single-primary fast path: the primary already applied the commit.
    OnePhaseCommitted,
}

pub(super) async fn prepare(
    manager: &Arc<TransactionManager>,
    tx: &Arc<Transaction>,
) -> Result<PrepareOutcome, TxnError> {
    if !tx.try_transition(TxState::Preparing) {
        return Err(TxnError::InvalidState(tx.state(), "prepare"));
    }

    if tx.is_empty() {
        return Ok(PrepareOutcome::Prepared);
    }

    for attempt in 0..=manager.cfg.routing_retries {
        match prepare_once(manager, tx).await? {
            RoundVerdict::Done(outcome) => return Ok(outcome),
            RoundVerdict::StaleTopology { partition, topology } => {
                tracing::debug!(
                    "{}: {} partition {} moved (topology v{}), re-routing (attempt {})",
                    manager.local,
                    tx.xid(),
                    partition,
                    topology,
                    attempt + 1
                );
                release_round(manager, tx).await;
                let snapshot = manager.topology.current();
                tx.repin_topology(snapshot.version);
                tx.remap(&snapshot)?;
            }
        }
    }

    Err(TxnError::RoutingExhausted)
}

enum RoundVerdict {
    Done(PrepareOutcome),
    StaleTopology { partition: u32, topology: u64 },
}

async fn prepare_once(
    manager: &Arc<TransactionManager>,
    tx: &Arc<Transaction>,
) -> Result<RoundVerdict, TxnError> {
    let snapshot = manager.routing_snapshot(tx);
    let mappings = tx.mappings();
    let one_phase = mappings.len() == 1;
    let topology_version = tx.topology_version().unwrap_or(snapshot.version);

    // Every node with a stake in the transaction: primaries plus the
    // backups of each touched partition. Participants keep the list for
    // cooperative recovery should the near node die.
    let mut tx_nodes: Vec<NodeId> = Vec::new();
    for mapping in &mappings {
        for payload in tx.payloads_for(&mapping.node) {
            for owner in snapshot.owners(payload.partition) {
                if !tx_nodes.contains(owner) {
                    tx_nodes.push(owner.clone());
                }
            }
        }
    }

    let mut set = JoinSet::new();
    for mapping in &mappings {
        let req = PrepareRequest {
            xid: tx.xid(),
            near_node: manager.local.clone(),
            topology_version,
            concurrency: tx.concurrency(),
            isolation: tx.isolation(),
            entries: tx.payloads_for(&mapping.node),
            tx_nodes: tx_nodes.clone(),
            last: true,
            one_phase,
        };
        let call_manager = manager.clone();
        let target = mapping.node.clone();
        let call_target = target.clone();
        future::spawn_call(
            &mut set,
            manager.topology.clone(),
            target,
            manager.reply_timeout(),
            async move { call_manager.call_prepare(&call_target, req).await },
        );
    }

    for reply in future::collect(set).await {
        let response = reply.reply?;
        if response.success {
            // Lock versions reported by the primary feed the version
            // source, so stamps issued here order after everything the
            // transaction touched.
            for (_, version) in &response.owned_versions {
                manager.versions.observe(*version);
            }
            continue;
        }
        match response.fault {
            Some(TxnFault::NotOwner { partition, topology }) => {
                return Ok(RoundVerdict::StaleTopology { partition, topology });
            }
            fault => return Err(fault_to_error(fault)),
        }
    }

    Ok(RoundVerdict::Done(if one_phase {
        PrepareOutcome::OnePhaseCommitted
    } else {
        PrepareOutcome::Prepared
    }))
}

/// Rolls back whatever this round prepared so the next round starts clean.
/// Participants that never saw the prepare treat the finish as a duplicate.
async fn release_round(manager: &Arc<TransactionManager>, tx: &Arc<Transaction>) {
    let evidence = manager.evidence_sample(vec![tx.xid()]);
    for mapping in tx.mappings() {
        let req = FinishRequest {
            xid: tx.xid(),
            near_node: manager.local.clone(),
            topology_version: tx.topology_version().unwrap_or(0),
            commit: false,
            evidence: evidence.clone(),
        };
        if let Err(e) = manager.call_finish(&mapping.node, req).await {
            tracing::debug!(
                "{}: {} release to {} failed: {}",
                manager.local,
                tx.xid(),
                mapping.node,
                e
            );
        }
    }
}
