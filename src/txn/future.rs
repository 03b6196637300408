//! Distributed Future Composition
//!
//! A logical transaction operation fans out into one mini-future per
//! participating node. Each mini-future races its network call against the
//! node's departure and the reply timeout, so nothing ever hangs on a dead
//! peer; the reducer then folds the per-node replies into one result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::membership::types::NodeId;
use crate::topology::TopologyService;

use super::error::TxnError;

/// One node's contribution to a logical transaction future.
#[derive(Debug)]
pub struct NodeReply<R> {
    pub node: NodeId,
    pub reply: Result<R, TxnError>,
}

/// Spawns one mini-future: the call itself, short-circuited by node
/// departure and bounded by the reply timeout.
pub fn spawn_call<R, F>(
    set: &mut JoinSet<NodeReply<R>>,
    topology: Arc<TopologyService>,
    node: NodeId,
    timeout: Duration,
    call: F,
) where
    R: Send + 'static,
    F: Future<Output = Result<R, TxnError>> + Send + 'static,
{
    set.spawn(async move {
        let reply = tokio::select! {
            res = call => res,
            _ = topology.wait_departure(&node) => Err(TxnError::NodeLeft(node.clone())),
            _ = tokio::time::sleep(timeout) => Err(TxnError::ReplyTimeout),
        };
        NodeReply { node, reply }
    });
}

/// Collects every mini-future. Panicked tasks surface as transport errors
/// against an unknown node rather than poisoning the whole operation.
pub async fn collect<R: Send + 'static>(mut set: JoinSet<NodeReply<R>>) -> Vec<NodeReply<R>> {
    let mut replies = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(reply) => replies.push(reply),
            Err(e) => {
                tracing::error!("mini-future task failed: {}", e);
                replies.push(NodeReply {
                    node: NodeId(String::from("unknown")),
                    reply: Err(TxnError::Transport(e.to_string())),
                });
            }
        }
    }
    replies
}
