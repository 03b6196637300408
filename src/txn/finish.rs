//! Near-Side Finish
//!
//! Drives phase two from the originating node and owns the outcome
//! classification: committed, rolled back, conflict, or the heuristic
//! unknown when a mid-commit failure leaves the result unconfirmed. The
//! commit decision is made exactly once; everything after it only
//! propagates that decision, so a participant lost during phase two never
//! turns a committed transaction back into a rolled-back one.

use std::sync::Arc;
use tokio::task::JoinSet;

use super::error::TxnError;
use super::future;
use super::manager::TransactionManager;
use super::prepare::{self, PrepareOutcome};
use super::protocol::FinishRequest;
use super::recovery;
use super::transaction::{Transaction, TxOutcome, TxState};

fn outcome_of(state: TxState) -> TxOutcome {
    match state {
        TxState::Committed => TxOutcome::Committed,
        TxState::RolledBack => TxOutcome::RolledBack,
        TxState::Unknown => TxOutcome::Unknown,
        _ => TxOutcome::RolledBack,
    }
}

pub(super) async fn commit(manager: &Arc<TransactionManager>, tx: &Arc<Transaction>) -> TxOutcome {
    if tx.state().is_terminal() {
        return outcome_of(tx.state());
    }

    match prepare::prepare(manager, tx).await {
        Ok(PrepareOutcome::OnePhaseCommitted) => {
            tx.try_transition(TxState::Prepared);
            tx.try_transition(TxState::Committing);
            finalize_commit(manager, tx)
        }
        Ok(PrepareOutcome::Prepared) => {
            tx.try_transition(TxState::Prepared);
            tx.try_transition(TxState::Committing);
            drive_finish(manager, tx).await
        }
        Err(e) => failed_prepare(manager, tx, e).await,
    }
}

/// Propagates the commit decision to every participant and classifies the
/// replies.
async fn drive_finish(manager: &Arc<TransactionManager>, tx: &Arc<Transaction>) -> TxOutcome {
    let evidence = manager.evidence_sample(vec![tx.xid()]);
    let mut set = JoinSet::new();

    for mapping in tx.mappings() {
        let req = FinishRequest {
            xid: tx.xid(),
            near_node: manager.local.clone(),
            topology_version: tx.topology_version().unwrap_or(0),
            commit: true,
            evidence: evidence.clone(),
        };
        let call_manager = manager.clone();
        let target = mapping.node.clone();
        let call_target = target.clone();
        future::spawn_call(
            &mut set,
            manager.topology.clone(),
            target,
            manager.reply_timeout(),
            async move { call_manager.call_finish(&call_target, req).await },
        );
    }

    let mut unknown = false;
    for reply in future::collect(set).await {
        match reply.reply {
            Ok(response) if response.success => {}
            Ok(response) => {
                // A store fault during apply: the decision stands but part
                // of the write set may be missing.
                tracing::error!(
                    "{}: {} participant {} failed to apply: {:?}",
                    manager.local,
                    tx.xid(),
                    reply.node,
                    response.fault
                );
                unknown = true;
            }
            Err(TxnError::NodeLeft(node)) => {
                // The decision was commit; the dead primary's backups may
                // hold the evidence that it went through.
                if recovery::probe_for_commit(manager, tx, &node).await {
                    tracing::info!(
                        "{}: {} primary {} left mid-commit, backups confirm commit",
                        manager.local,
                        tx.xid(),
                        node
                    );
                } else {
                    unknown = true;
                }
            }
            Err(e) => {
                tracing::error!(
                    "{}: {} finish to {} failed: {}",
                    manager.local,
                    tx.xid(),
                    reply.node,
                    e
                );
                unknown = true;
            }
        }
    }

    if unknown {
        tx.try_transition(TxState::Unknown);
        manager.near.remove(&tx.xid());
        return TxOutcome::Unknown;
    }

    finalize_commit(manager, tx)
}

fn finalize_commit(manager: &Arc<TransactionManager>, tx: &Arc<Transaction>) -> TxOutcome {
    tx.try_transition(TxState::Committed);
    manager.record_commit_evidence(tx.xid());
    manager.near.remove(&tx.xid());
    tracing::debug!("{}: {} committed", manager.local, tx.xid());
    TxOutcome::Committed
}

/// Classifies a failed prepare and releases whatever it acquired.
async fn failed_prepare(
    manager: &Arc<TransactionManager>,
    tx: &Arc<Transaction>,
    error: TxnError,
) -> TxOutcome {
    let one_phase = tx.mappings().len() == 1;

    match &error {
        // One-phase: the lost or faulted primary may have applied the
        // commit before failing. Probe its backups; without evidence the
        // outcome is heuristically unknown, never rolled back.
        TxnError::NodeLeft(node) if one_phase => {
            let outcome = if recovery::probe_for_commit(manager, tx, node).await {
                tx.try_transition(TxState::Prepared);
                tx.try_transition(TxState::Committing);
                tx.try_transition(TxState::Committed);
                manager.record_commit_evidence(tx.xid());
                TxOutcome::Committed
            } else {
                tx.try_transition(TxState::Unknown);
                TxOutcome::Unknown
            };
            manager.near.remove(&tx.xid());
            outcome
        }
        TxnError::Store(e) if one_phase => {
            tracing::error!(
                "{}: {} one-phase apply failed on {}: {}",
                manager.local,
                tx.xid(),
                e.key,
                e.reason
            );
            tx.try_transition(TxState::Unknown);
            manager.near.remove(&tx.xid());
            TxOutcome::Unknown
        }
        _ => {
            tracing::debug!(
                "{}: {} prepare failed, rolling back: {}",
                manager.local,
                tx.xid(),
                error
            );
            let rolled = rollback(manager, tx).await;
            match (&error, rolled) {
                (TxnError::Conflict { .. }, TxOutcome::RolledBack) => TxOutcome::Conflict,
                (_, outcome) => outcome,
            }
        }
    }
}

/// Rolls the transaction back. Idempotent: a terminal transaction reports
/// its existing outcome and no lock is released twice.
pub(super) async fn rollback(
    manager: &Arc<TransactionManager>,
    tx: &Arc<Transaction>,
) -> TxOutcome {
    if tx.state().is_terminal() {
        return outcome_of(tx.state());
    }
    if !tx.try_transition(TxState::RollingBack) {
        // Another finish already owns the transition.
        return outcome_of(tx.state());
    }

    let evidence = manager.evidence_sample(vec![tx.xid()]);
    let mut set = JoinSet::new();
    for mapping in tx.mappings() {
        let req = FinishRequest {
            xid: tx.xid(),
            near_node: manager.local.clone(),
            topology_version: tx.topology_version().unwrap_or(0),
            commit: false,
            evidence: evidence.clone(),
        };
        let call_manager = manager.clone();
        let target = mapping.node.clone();
        let call_target = target.clone();
        future::spawn_call(
            &mut set,
            manager.topology.clone(),
            target,
            manager.reply_timeout(),
            async move { call_manager.call_finish(&call_target, req).await },
        );
    }

    for reply in future::collect(set).await {
        if let Err(e) = reply.reply {
            // A dead participant's locks died with it; nothing to release.
            tracing::debug!(
                "{}: {} rollback to {} failed: {}",
                manager.local,
                tx.xid(),
                reply.node,
                e
            );
        }
    }

    tx.try_transition(TxState::RolledBack);
    manager.record_rollback_evidence(tx.xid());
    manager.near.remove(&tx.xid());
    tracing::debug!("{}: {} rolled back", manager.local, tx.xid());
    TxOutcome::RolledBack
}
