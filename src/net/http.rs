//! HTTP Transport
//!
//! Ships protocol messages as JSON over HTTP to the target node's protocol
//! endpoints, with bounded retry and jittered exponential backoff. Target
//! addresses are resolved through the membership service at send time, so
//! a node that rejoined under a new address is reached without any
//! transaction-level bookkeeping.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::membership::service::MembershipService;
use crate::membership::types::NodeId;
use crate::txn::error::TxnError;
use crate::txn::protocol::*;

use super::GridTransport;

/// Resolves a node id to the address its protocol endpoints listen on.
pub trait AddressResolver: Send + Sync {
    fn http_addr(&self, node: &NodeId) -> Option<SocketAddr>;
}

/// Membership-backed resolver used by real nodes.
pub struct MemberResolver {
    membership: Arc<MembershipService>,
}

impl MemberResolver {
    pub fn new(membership: Arc<MembershipService>) -> Self {
        Self { membership }
    }
}

impl AddressResolver for MemberResolver {
    fn http_addr(&self, node: &NodeId) -> Option<SocketAddr> {
        self.membership.get_member(node).map(|n| n.http_addr)
    }
}

pub struct HttpTransport {
    resolver: Arc<dyn AddressResolver>,
    client: reqwest::Client,
    request_timeout: Duration,
    attempts: usize,
}

impl HttpTransport {
    pub fn new(resolver: Arc<dyn AddressResolver>) -> Self {
        Self {
            resolver,
            client: reqwest::Client::new(),
            request_timeout: Duration::from_millis(500),
            attempts: 3,
        }
    }

    async fn post_with_retry<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        node: &NodeId,
        endpoint: &str,
        payload: &Req,
    ) -> Result<Resp, TxnError> {
        let addr = self
            .resolver
            .http_addr(node)
            .ok_or_else(|| TxnError::NodeLeft(node.clone()))?;
        let url = format!("http://{}{}", addr, endpoint);

        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .client
                .post(url.clone())
                .json(payload)
                .timeout(self.request_timeout)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    if !resp.status().is_success() {
                        return Err(TxnError::Transport(format!(
                            "{} replied {}",
                            endpoint,
                            resp.status()
                        )));
                    }
                    return resp
                        .json::<Resp>()
                        .await
                        .map_err(|e| TxnError::Transport(e.to_string()));
                }
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(TxnError::Transport(e.to_string()));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(TxnError::Transport("retry attempts exhausted".into()))
    }
}

#[async_trait]
impl GridTransport for HttpTransport {
    async fn read(&self, node: &NodeId, req: ReadRequest) -> Result<ReadResponse, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_READ, &req).await
    }

    async fn lock(&self, node: &NodeId, req: LockRequest) -> Result<LockResponse, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_LOCK, &req).await
    }

    async fn prepare(
        &self,
        node: &NodeId,
        req: PrepareRequest,
    ) -> Result<PrepareResponse, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_PREPARE, &req).await
    }

    async fn finish(&self, node: &NodeId, req: FinishRequest) -> Result<FinishResponse, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_FINISH, &req).await
    }

    async fn backup_prepare(
        &self,
        node: &NodeId,
        req: BackupPrepareRequest,
    ) -> Result<BackupAck, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_BACKUP_PREPARE, &req)
            .await
    }

    async fn backup_finish(
        &self,
        node: &NodeId,
        req: BackupFinishRequest,
    ) -> Result<BackupAck, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_BACKUP_FINISH, &req)
            .await
    }

    async fn probe(&self, node: &NodeId, req: ProbeRequest) -> Result<ProbeResponse, TxnError> {
        self.post_with_retry(node, ENDPOINT_TX_PROBE, &req).await
    }
}
