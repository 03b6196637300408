//! Transport Seam
//!
//! The wire-layer collaborator of the transaction engine: reliable,
//! per-node-pair request/response delivery for the protocol messages. The
//! engine only sees the `GridTransport` trait; production nodes use the
//! HTTP implementation, tests route messages in-process for deterministic
//! multi-node scenarios.
//!
//! Message framing below the JSON DTO level is owned by the transport and
//! out of scope for the engine.

pub mod http;
pub mod local;

use async_trait::async_trait;

use crate::membership::types::NodeId;
use crate::txn::error::TxnError;
use crate::txn::protocol::{
    BackupAck, BackupFinishRequest, BackupPrepareRequest, FinishRequest, FinishResponse,
    LockRequest, LockResponse, PrepareRequest, PrepareResponse, ProbeRequest, ProbeResponse,
    ReadRequest, ReadResponse,
};

pub use http::{HttpTransport, MemberResolver};
pub use local::LocalTransport;

/// Per-node-pair message delivery for the transaction protocol.
#[async_trait]
pub trait GridTransport: Send + Sync {
    async fn read(&self, node: &NodeId, req: ReadRequest) -> Result<ReadResponse, TxnError>;

    async fn lock(&self, node: &NodeId, req: LockRequest) -> Result<LockResponse, TxnError>;

    async fn prepare(
        &self,
        node: &NodeId,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, TxnError>;

    async fn finish(&self, node: &NodeId, req: FinishRequest) -> Result<FinishResponse, TxnError>;

    async fn backup_prepare(
        &self,
        node: &NodeId,
        req: BackupPrepareRequest,
    ) -> Result<BackupAck, TxnError>;

    async fn backup_finish(
        &self,
        node: &NodeId,
        req: BackupFinishRequest,
    ) -> Result<BackupAck, TxnError>;

    async fn probe(&self, node: &NodeId, req: ProbeRequest) -> Result<ProbeResponse, TxnError>;
}
