//! Recovery Coordination
//!
//! Two failure directions need resolving. A participant dying mid-commit
//! leaves the near node unsure whether the apply went through: its backups
//! are probed for commit evidence, and without any the transaction ends in
//! the heuristic unknown outcome. The near node dying leaves participants
//! holding locks for a decision that will never arrive: each surviving
//! participant probes the other transaction nodes, applies the commit when
//! any of them knows it happened, and rolls back otherwise so the locks
//! never outlive the coordinator.

use std::sync::Arc;

use crate::membership::types::NodeId;

use super::manager::TransactionManager;
use super::protocol::{KnownOutcome, ProbeRequest};
use super::remote::RemoteTransaction;
use super::transaction::Transaction;

/// Asks the backups of the partitions `departed` owned for this
/// transaction whether the commit was applied before the node died.
pub(super) async fn probe_for_commit(
    manager: &Arc<TransactionManager>,
    tx: &Arc<Transaction>,
    departed: &NodeId,
) -> bool {
    let snapshot = manager.routing_snapshot(tx);

    let mut probed: Vec<NodeId> = Vec::new();
    for payload in tx.payloads_for(departed) {
        for backup in snapshot.backups(payload.partition) {
            if backup == departed || probed.contains(backup) {
                continue;
            }
            probed.push(backup.clone());
        }
    }

    for node in probed {
        match manager.call_probe(&node, ProbeRequest { xid: tx.xid() }).await {
            Ok(resp) if resp.outcome == Some(KnownOutcome::Committed) => {
                return true;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(
                    "{}: {} probe to {} failed: {}",
                    manager.local,
                    tx.xid(),
                    node,
                    e
                );
            }
        }
    }

    false
}

/// Reacts to a node departure on the participant side: every in-flight
/// transaction originated by the dead node is resolved cooperatively.
pub(super) async fn handle_node_left(manager: &Arc<TransactionManager>, node: NodeId) {
    let orphans: Vec<Arc<RemoteTransaction>> = manager
        .remote
        .iter()
        .filter(|entry| entry.value().near_node == node)
        .map(|entry| entry.value().clone())
        .collect();

    if orphans.is_empty() {
        return;
    }
    tracing::info!(
        "{}: near node {} left with {} in-flight transaction(s), resolving",
        manager.local,
        node,
        orphans.len()
    );

    for rtx in orphans {
        resolve_orphan(manager, &rtx, &node).await;
    }
}

async fn resolve_orphan(
    manager: &Arc<TransactionManager>,
    rtx: &Arc<RemoteTransaction>,
    dead_near: &NodeId,
) {
    let mut verdict = manager.known_outcome(rtx.xid);

    if verdict.is_none() {
        for peer in rtx.tx_nodes() {
            if peer == manager.local || peer == *dead_near {
                continue;
            }
            match manager.call_probe(&peer, ProbeRequest { xid: rtx.xid }).await {
                Ok(resp) if resp.outcome.is_some() => {
                    verdict = resp.outcome;
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(
                        "{}: {} orphan probe to {} failed: {}",
                        manager.local,
                        rtx.xid,
                        peer,
                        e
                    );
                }
            }
        }
    }

    match verdict {
        Some(KnownOutcome::Committed) => {
            tracing::info!(
                "{}: applying orphaned transaction {} (peer evidence says committed)",
                manager.local,
                rtx.xid
            );
            if let Err(fault) = manager.apply_commit(rtx).await {
                tracing::error!(
                    "{}: {} orphan apply failed: {:?}",
                    manager.local,
                    rtx.xid,
                    fault
                );
            }
        }
        // No surviving evidence of a commit: the decision was never made
        // (or was rollback), so release the locks.
        _ => {
            tracing::info!(
                "{}: rolling back orphaned transaction {}",
                manager.local,
                rtx.xid
            );
            manager.release_participant(rtx);
            manager.record_rollback_evidence(rtx.xid);
        }
    }
}
