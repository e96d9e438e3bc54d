//! Recycle loop
//!
//! Owns the single active-node slot. A cycle provisions a replacement to
//! `Active`, records it as the active node, and only then retires the node it
//! replaces, so there is never a moment without a serving tunnel.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nodeshift_proto::{Connection, Node};
use nodeshift_provider::DeleteSummary;

use crate::context::{sweep_stragglers, LifecycleContext};
use crate::error::LifecycleResult;
use crate::lifecycle::NodeLifecycleManager;

pub struct RecycleScheduler {
    ctx: Arc<LifecycleContext>,
    active: Option<NodeLifecycleManager>,
}

impl RecycleScheduler {
    pub fn new(ctx: Arc<LifecycleContext>) -> Self {
        Self { ctx, active: None }
    }

    pub fn active(&self) -> Option<&Node> {
        self.active.as_ref().map(|m| m.node())
    }

    /// Pick up the active node recorded by a previous run, if it is still live
    pub async fn adopt_persisted(&mut self) -> LifecycleResult<bool> {
        if self.active.is_some() {
            return Ok(false);
        }
        let Some(connection) = self.ctx.store.active_connection() else {
            return Ok(false);
        };

        let manager = NodeLifecycleManager::adopt(self.ctx.clone(), &connection)?;
        self.ctx.tunnels.adopt(manager.node()).await;
        info!(
            node_uid = %connection.id,
            "Adopted active node {} from previous run",
            connection.name
        );
        self.active = Some(manager);
        Ok(true)
    }

    /// Whether the active slot is empty or its node has outlived the recycle interval
    pub fn is_due(&self) -> bool {
        match &self.active {
            None => true,
            Some(manager) => manager
                .node()
                .age()
                .to_std()
                .map(|age| age >= self.ctx.config.recycle_interval)
                .unwrap_or(false),
        }
    }

    /// Provision a replacement, promote it, then retire the previous node
    ///
    /// A failed replacement leaves the current active node untouched.
    pub async fn run_cycle(&mut self, cancel: &CancellationToken) -> LifecycleResult<()> {
        if self.ctx.config.heartbeat_gate {
            self.ctx.trust.heartbeat().await?;
        }

        let mut next = NodeLifecycleManager::on_any_provider(self.ctx.clone())?;
        next.run_to_active(cancel).await?;

        let new_name = next.node().name.clone();
        self.ctx
            .store
            .promote(&Connection::from_node(next.node()))?;

        match self.active.replace(next) {
            Some(mut previous) => {
                if let Err(e) = previous.retire(Some(&new_name)).await {
                    warn!("Retiring node {} failed: {}", previous.node().uid, e);
                }
            }
            None => {
                sweep_stragglers(&self.ctx, Some(&new_name)).await;
            }
        }

        Ok(())
    }

    /// Tick until `cancel` fires, cycling whenever the active node is due
    pub async fn run(&mut self, cancel: CancellationToken) -> LifecycleResult<()> {
        if let Err(e) = self.adopt_persisted().await {
            warn!("Could not adopt previously active node: {}", e);
        }

        info!(
            "🚀 Recycle loop started (max age {}s, tick {}s)",
            self.ctx.config.recycle_interval.as_secs(),
            self.ctx.config.check_interval.as_secs()
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if self.is_due() {
                match self.run_cycle(&cancel).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => break,
                    Err(e) if e.is_fatal_policy() => {
                        error!("Cycle abandoned: {}", e);
                    }
                    Err(e) => error!("Cycle failed: {}", e),
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.config.check_interval) => {}
            }
        }

        info!("Recycle loop stopping");
        if self.ctx.config.teardown_on_exit {
            self.shutdown().await?;
        }

        Ok(())
    }

    /// Retire the active node, leaving the slot empty
    pub async fn shutdown(&mut self) -> LifecycleResult<()> {
        if let Some(mut active) = self.active.take() {
            active.retire(None).await?;
        }
        Ok(())
    }

    /// Remove everything this orchestrator owns
    ///
    /// The active node (adopted from the store when needed) is retired
    /// first, which brings its tunnel and killswitch down. Every other
    /// prefixed instance is then deleted and no recorded connection is left
    /// live. Returns the straggler deletions.
    pub async fn cleanup(&mut self) -> LifecycleResult<DeleteSummary> {
        if let Err(e) = self.adopt_persisted().await {
            warn!("Could not adopt previously active node: {}", e);
        }

        let keep = self.active().map(|node| node.name.clone());
        let summary = sweep_stragglers(&self.ctx, keep.as_deref()).await;

        self.shutdown().await?;

        for connection in self.ctx.store.live_connections() {
            self.ctx.store.mark_deleted(&connection.id)?;
        }

        Ok(summary)
    }
}
