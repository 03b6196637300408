//! HTTP Handlers
//!
//! Thin axum layer over the transaction manager: each protocol endpoint
//! deserializes its request DTO, delegates, and returns the response DTO.
//! Faults travel inside the response body; HTTP status stays 200 so the
//! retry layer only retries transport-level failures.

use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;
use std::sync::Arc;

use super::manager::TransactionManager;
use super::protocol::*;

pub async fn tx_read(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<ReadRequest>,
) -> Json<ReadResponse> {
    Json(manager.on_read(req))
}

pub async fn tx_lock(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<LockRequest>,
) -> Json<LockResponse> {
    Json(manager.on_lock(req).await)
}

pub async fn tx_prepare(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<PrepareRequest>,
) -> Json<PrepareResponse> {
    Json(manager.on_prepare(req).await)
}

pub async fn tx_finish(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<FinishRequest>,
) -> Json<FinishResponse> {
    Json(manager.on_finish(req).await)
}

pub async fn tx_backup_prepare(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<BackupPrepareRequest>,
) -> Json<BackupAck> {
    Json(manager.on_backup_prepare(req))
}

pub async fn tx_backup_finish(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<BackupFinishRequest>,
) -> Json<BackupAck> {
    Json(manager.on_backup_finish(req))
}

pub async fn tx_probe(
    Extension(manager): Extension<Arc<TransactionManager>>,
    Json(req): Json<ProbeRequest>,
) -> Json<ProbeResponse> {
    Json(manager.on_probe(req))
}

/// Node-level counters exposed for debugging and the stats loop.
#[derive(Debug, Serialize)]
pub struct NodeStats {
    pub node: String,
    pub topology_version: u64,
    pub near_in_flight: usize,
    pub remote_in_flight: usize,
}

pub async fn stats(
    Extension(manager): Extension<Arc<TransactionManager>>,
) -> Json<NodeStats> {
    Json(NodeStats {
        node: manager.local.to_string(),
        topology_version: manager.topology.current_version(),
        near_in_flight: manager.near.len(),
        remote_in_flight: manager.remote.len(),
    })
}

/// Protocol and debug routes for one node, with the manager attached as an
/// extension.
pub fn router(manager: Arc<TransactionManager>) -> Router {
    Router::new()
        .route(ENDPOINT_TX_READ, post(tx_read))
        .route(ENDPOINT_TX_LOCK, post(tx_lock))
        .route(ENDPOINT_TX_PREPARE, post(tx_prepare))
        .route(ENDPOINT_TX_FINISH, post(tx_finish))
        .route(ENDPOINT_TX_BACKUP_PREPARE, post(tx_backup_prepare))
        .route(ENDPOINT_TX_BACKUP_FINISH, post(tx_backup_finish))
        .route(ENDPOINT_TX_PROBE, post(tx_probe))
        .route("/stats", get(stats))
        .layer(Extension(manager))
}
