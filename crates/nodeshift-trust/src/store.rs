//! Trust store: poll, verify, publish

use nodeshift_proto::Node;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TrustError, TrustResult};
use crate::kv::KvClient;
use crate::token::HostKeyToken;

pub struct TrustStore {
    kv: Arc<dyn KvClient>,
    poll_interval: Duration,
}

impl TrustStore {
    pub fn new(kv: Arc<dyn KvClient>, poll_interval: Duration) -> Self {
        Self { kv, poll_interval }
    }

    /// Wait for the node's token, verify it, and return the host key
    ///
    /// Polls without a deadline: publication latency is the node's boot
    /// time. Bound it by cancelling `cancel`. A token that fails
    /// verification ends the fetch immediately.
    pub async fn fetch(
        &self,
        node: &Node,
        shared_secret: &str,
        cancel: &CancellationToken,
    ) -> TrustResult<String> {
        let mut attempt: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(TrustError::Cancelled);
            }

            attempt += 1;
            match self.kv.get(&node.uid).await {
                Ok(Some(token)) => {
                    let host_key = HostKeyToken::verify(&token, &node.uid, shared_secret)?;
                    info!(
                        node_uid = %node.uid,
                        attempt,
                        "Verified host key published by node"
                    );
                    return Ok(host_key);
                }
                Ok(None) => {
                    debug!(node_uid = %node.uid, attempt, "Host key not published yet");
                }
                Err(e) if e.is_transient() => {
                    warn!(node_uid = %node.uid, attempt, "KV lookup failed, retrying: {}", e);
                }
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(TrustError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Publish a token for `uid` (what the node's bootstrap script does)
    pub async fn publish(&self, uid: &str, token: &str) -> TrustResult<()> {
        self.kv.put(uid, token).await
    }

    pub async fn heartbeat(&self) -> TrustResult<()> {
        self.kv.ping().await
    }
}
