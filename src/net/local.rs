//! In-Process Transport
//!
//! Routes protocol messages directly to the target node's transaction
//! manager within the same process. Used by the protocol test harness to
//! run deterministic multi-node scenarios, including simulated node
//! failures: a killed node's calls fail with a node-left error just as a
//! departed peer would.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

use crate::membership::types::NodeId;
use crate::txn::error::TxnError;
use crate::txn::manager::TransactionManager;
use crate::txn::protocol::*;

use super::GridTransport;

#[derive(Default)]
pub struct LocalTransport {
    nodes: DashMap<NodeId, Arc<TransactionManager>>,
    down: DashMap<NodeId, ()>,
}

impl LocalTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: NodeId, manager: Arc<TransactionManager>) {
        self.nodes.insert(node, manager);
    }

    /// Simulates a crash: every subsequent message to `node` fails as if
    /// the peer were unreachable.
    pub fn kill(&self, node: &NodeId) {
        self.down.insert(node.clone(), ());
    }

    pub fn revive(&self, node: &NodeId) {
        self.down.remove(node);
    }

    fn target(&self, node: &NodeId) -> Result<Arc<TransactionManager>, TxnError> {
        if self.down.contains_key(node) {
            return Err(TxnError::NodeLeft(node.clone()));
        }
        self.nodes
            .get(node)
            .map(|m| m.value().clone())
            .ok_or_else(|| TxnError::NodeLeft(node.clone()))
    }
}

#[async_trait]
impl GridTransport for LocalTransport {
    async fn read(&self, node: &NodeId, req: ReadRequest) -> Result<ReadResponse, TxnError> {
        Ok(self.target(node)?.on_read(req))
    }

    async fn lock(&self, node: &NodeId, req: LockRequest) -> Result<LockResponse, TxnError> {
        let manager = self.target(node)?;
        Ok(manager.on_lock(req).await)
    }

    async fn prepare(
        &self,
        node: &NodeId,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, TxnError> {
        let manager = self.target(node)?;
        Ok(manager.on_prepare(req).await)
    }

    async fn finish(&self, node: &NodeId, req: FinishRequest) -> Result<FinishResponse, TxnError> {
        let manager = self.target(node)?;
        Ok(manager.on_finish(req).await)
    }

    async fn backup_prepare(
        &self,
        node: &NodeId,
        req: BackupPrepareRequest,
    ) -> Result<BackupAck, TxnError> {
        Ok(self.target(node)?.on_backup_prepare(req))
    }

    async fn backup_finish(
        &self,
        node: &NodeId,
        req: BackupFinishRequest,
    ) -> Result<BackupAck, TxnError> {
        Ok(self.target(node)?.on_backup_finish(req))
    }

    async fn probe(&self, node: &NodeId, req: ProbeRequest) -> Result<ProbeResponse, TxnError> {
        Ok(self.target(node)?.on_probe(req))
    }
}
