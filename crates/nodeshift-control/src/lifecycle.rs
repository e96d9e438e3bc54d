//! Node lifecycle state machine
//!
//! ```text
//! Requested -> Provisioning -> AwaitingNetwork -> AwaitingSshReady
//!   -> KeyExchange -> TunnelEstablishing -> Active -> Retiring -> Deleted
//! ```
//!
//! Any non-terminal state may fall into `Failed`. Waits for an IP address,
//! sshd and the published host key poll forever; only the cancellation token
//! bounds them.

use futures::future::join_all;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use nodeshift_proto::{Connection, CreateInstanceRequest, Node, NodeEvent, NodeState, Region};
use nodeshift_provider::{select_region, ProviderAdapter};
use nodeshift_trust::{generate_secret, publish_script, TrustError};

use crate::context::{sweep_stragglers, LifecycleContext};
use crate::error::{LifecycleError, LifecycleResult};
use crate::ssh::{generate_key, remove_key_files};

pub struct NodeLifecycleManager {
    ctx: Arc<LifecycleContext>,
    provider: Arc<dyn ProviderAdapter>,
    /// Providers whose eligible regions are pooled when the node is placed
    candidates: Vec<Arc<dyn ProviderAdapter>>,
    node: Node,
    shared_secret: String,
    trace: Vec<NodeState>,
}

impl NodeLifecycleManager {
    /// A fresh node in `Requested`, to be created on `provider`
    pub fn new(ctx: Arc<LifecycleContext>, provider: Arc<dyn ProviderAdapter>) -> Self {
        let config = &ctx.config;
        let uid = Uuid::new_v4().simple().to_string();
        let key_path = config.keys_dir().join(format!("{}-{}", config.name_prefix, uid));

        let mut node = Node::new(
            uid,
            &config.name_prefix,
            provider.kind(),
            config.tunnel_type,
            config.platform,
            key_path,
            config.tunnel_params(),
        );
        node.ssh_port = config.ssh.port;

        Self {
            ctx,
            candidates: vec![provider.clone()],
            provider,
            node,
            shared_secret: generate_secret(),
            trace: vec![NodeState::Requested],
        }
    }

    /// A fresh node placed in any eligible region of any configured provider
    pub fn on_any_provider(ctx: Arc<LifecycleContext>) -> LifecycleResult<Self> {
        let candidates = ctx.providers.clone();
        let first = candidates.first().cloned().ok_or(LifecycleError::NoProvider)?;

        let mut manager = Self::new(ctx, first);
        manager.candidates = candidates;
        Ok(manager)
    }

    /// A manager for a node that reached `Active` in an earlier process
    pub fn adopt(ctx: Arc<LifecycleContext>, connection: &Connection) -> LifecycleResult<Self> {
        let node = connection.to_node();
        node.check_active_invariant()
            .map_err(LifecycleError::InvariantViolation)?;
        if node.state != NodeState::Active {
            return Err(LifecycleError::InvariantViolation(format!(
                "cannot adopt node {} in state {}",
                node.uid, node.state
            )));
        }

        let provider = ctx
            .provider(node.provider)
            .ok_or(LifecycleError::NoProvider)?;

        Ok(Self {
            ctx,
            candidates: vec![provider.clone()],
            provider,
            trace: vec![node.state],
            node,
            shared_secret: String::new(),
        })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn state(&self) -> NodeState {
        self.node.state
    }

    /// Every state this node has been in, in order
    pub fn trace(&self) -> &[NodeState] {
        &self.trace
    }

    fn transition(&mut self, next: NodeState, message: Option<String>) -> LifecycleResult<()> {
        let current = self.node.state;
        if !current.can_transition_to(next) {
            return Err(LifecycleError::InvariantViolation(format!(
                "illegal transition {} -> {} for node {}",
                current, next, self.node.uid
            )));
        }
        if next == NodeState::Active {
            self.node
                .check_active_invariant()
                .map_err(LifecycleError::InvariantViolation)?;
        }

        self.node.state = next;
        self.trace.push(next);

        match &message {
            Some(reason) if next == NodeState::Failed => {
                error!(node_uid = %self.node.uid, from = %current, "Node failed: {}", reason)
            }
            _ => info!(
                node_uid = %self.node.uid,
                provider = %self.node.provider,
                "Node {} -> {}",
                current,
                next
            ),
        }

        let mut event = NodeEvent::new(&self.node.uid, self.node.node_id.as_deref(), next);
        if let Some(message) = message {
            event = event.with_message(message);
        }
        self.ctx.publish(event);

        Ok(())
    }

    fn checkpoint(&self) -> LifecycleResult<()> {
        self.ctx
            .store
            .upsert_connection(&Connection::from_node(&self.node))?;
        Ok(())
    }

    /// Persist the final state and flag the connection deleted
    fn record_deleted(&self) -> LifecycleResult<()> {
        self.checkpoint()?;
        self.ctx.store.mark_deleted(&self.node.uid)?;
        Ok(())
    }

    fn ensure_live(&self, cancel: &CancellationToken) -> LifecycleResult<()> {
        if cancel.is_cancelled() {
            Err(LifecycleError::Cancelled(self.node.state))
        } else {
            Ok(())
        }
    }

    async fn pause(&self, cancel: &CancellationToken) -> LifecycleResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(LifecycleError::Cancelled(self.node.state)),
            _ = tokio::time::sleep(self.ctx.config.poll_interval) => Ok(()),
        }
    }

    /// Drive the node from `Requested` to `Active`
    ///
    /// On any error (including cancellation) the instance and key created so
    /// far are deleted best-effort and the node ends in `Failed`.
    pub async fn run_to_active(&mut self, cancel: &CancellationToken) -> LifecycleResult<()> {
        match self.drive(cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.abort(&e).await;
                Err(e)
            }
        }
    }

    async fn drive(&mut self, cancel: &CancellationToken) -> LifecycleResult<()> {
        self.ensure_live(cancel)?;
        self.transition(NodeState::Provisioning, None)?;
        self.provision(cancel).await?;

        self.transition(NodeState::AwaitingNetwork, None)?;
        let ip = self.wait_for_ip(cancel).await?;

        self.transition(NodeState::AwaitingSshReady, None)?;
        self.wait_for_ssh(ip, cancel).await?;

        self.transition(NodeState::KeyExchange, None)?;
        self.exchange_keys(ip, cancel).await?;

        self.ensure_live(cancel)?;
        self.transition(NodeState::TunnelEstablishing, None)?;
        self.ctx.tunnels.enable(&self.node).await?;

        self.transition(NodeState::Active, None)?;
        self.checkpoint()?;

        info!(
            node_uid = %self.node.uid,
            ip = %ip,
            "✅ Node {} active in {}",
            self.node.name,
            self.node.region.as_deref().unwrap_or("unknown region")
        );
        Ok(())
    }

    /// Size requested from `provider`: the configured one or the vendor default
    fn instance_size(&self, provider: &dyn ProviderAdapter) -> String {
        self.ctx
            .config
            .instance_size
            .clone()
            .unwrap_or_else(|| provider.capability().default_size.clone())
    }

    /// Choose uniformly among the eligible regions of every candidate
    /// provider and bind the node to the provider offering the pick
    ///
    /// A provider whose listing fails is skipped; that failure is only
    /// raised when no other provider offers an eligible region.
    async fn place(&mut self) -> LifecycleResult<Region> {
        let disabled = self.ctx.config.disabled_country_set();

        let listings = join_all(self.candidates.iter().map(|provider| {
            let size = self.instance_size(provider.as_ref());
            let disabled = &disabled;
            async move {
                let regions = provider.list_regions(&size, disabled).await;
                (provider.clone(), regions)
            }
        }))
        .await;

        let mut pool: Vec<(Arc<dyn ProviderAdapter>, Region)> = Vec::new();
        let mut listing_error = None;
        for (provider, regions) in listings {
            match regions {
                Ok(regions) => pool.extend(regions.into_iter().map(|r| (provider.clone(), r))),
                Err(e) => {
                    warn!(node_uid = %self.node.uid, "Listing {} regions failed: {}", provider.kind(), e);
                    listing_error = Some(e);
                }
            }
        }

        if pool.is_empty() {
            if let Some(e) = listing_error {
                return Err(e.into());
            }
        }

        let kinds: Vec<_> = self.candidates.iter().map(|p| p.kind()).collect();
        let (provider, region) = {
            let mut rng = rand::thread_rng();
            select_region(&pool, &mut rng, &kinds)?.clone()
        };
        debug!(
            node_uid = %self.node.uid,
            "Selected {} region {} out of {} eligible",
            provider.kind(),
            region.id,
            pool.len()
        );

        self.node.provider = provider.kind();
        self.provider = provider;
        Ok(region)
    }

    async fn provision(&mut self, cancel: &CancellationToken) -> LifecycleResult<()> {
        let config = self.ctx.config.clone();

        let public_key = generate_key(
            self.ctx.runner.as_ref(),
            &self.node.ssh_key_path,
            &config.ssh.key_algorithm,
            config.ssh.key_bits,
            config.ssh.passphrase.as_deref(),
            &self.node.name,
        )
        .await?;
        self.ensure_live(cancel)?;

        let region = self.place().await?.id;
        self.ensure_live(cancel)?;

        let key_id = self.provider.add_key(&public_key, &self.node.name).await?;
        self.node.key_id = Some(key_id.clone());
        self.ensure_live(cancel)?;

        let size = self.instance_size(self.provider.as_ref());
        let image = config
            .instance_image
            .clone()
            .unwrap_or_else(|| self.provider.capability().default_image.clone());

        let request = CreateInstanceRequest {
            region: region.clone(),
            name: self.node.name.clone(),
            size,
            image,
            key_id,
            user_data: self.user_data()?,
        };
        let created = self.provider.create_instance(&request).await?;

        self.node.node_id = Some(created.instance.id.clone());
        self.node.api_base = Some(created.api_base);
        self.node.region = Some(created.instance.region.unwrap_or(region));
        self.node.public_ip = created.instance.public_ip;
        self.checkpoint()?;

        Ok(())
    }

    /// First-boot script: tunnel server preparation, then host key publication
    fn user_data(&self) -> LifecycleResult<String> {
        let prepare = self.ctx.tunnels.server_prepare_script(&self.node)?;
        let publish = publish_script(
            &self.ctx.config.kv_base_url,
            &self.node.uid,
            &self.shared_secret,
            self.ctx.config.token_validity.as_secs(),
        );
        Ok(format!("#!/bin/sh\nset -e\n{}\n{}", prepare, publish))
    }

    async fn wait_for_ip(&mut self, cancel: &CancellationToken) -> LifecycleResult<IpAddr> {
        let (id, api_base) = match (&self.node.node_id, &self.node.api_base) {
            (Some(id), Some(api_base)) => (id.clone(), api_base.clone()),
            _ => {
                return Err(LifecycleError::InvariantViolation(format!(
                    "node {} has no instance id",
                    self.node.uid
                )))
            }
        };

        let mut attempt: u64 = 0;
        loop {
            if let Some(ip) = self.node.public_ip {
                return Ok(ip);
            }
            self.ensure_live(cancel)?;

            attempt += 1;
            match self.provider.get_instance(&id, &api_base).await {
                Ok(instance) => match instance.public_ip {
                    Some(ip) => {
                        info!(node_uid = %self.node.uid, attempt, "Public IP {} assigned", ip);
                        self.node.public_ip = Some(ip);
                        self.checkpoint()?;
                        return Ok(ip);
                    }
                    None => debug!(node_uid = %self.node.uid, attempt, "No public IP yet"),
                },
                Err(e) if e.is_transient() => {
                    warn!(node_uid = %self.node.uid, attempt, "Instance lookup failed, retrying: {}", e)
                }
                Err(e) => return Err(e.into()),
            }

            self.pause(cancel).await?;
        }
    }

    async fn wait_for_ssh(&self, ip: IpAddr, cancel: &CancellationToken) -> LifecycleResult<()> {
        let mut attempt: u64 = 0;
        loop {
            self.ensure_live(cancel)?;

            attempt += 1;
            if self.ctx.probe.is_ready(ip, self.node.ssh_port).await {
                debug!(node_uid = %self.node.uid, attempt, "sshd is answering");
                return Ok(());
            }
            debug!(node_uid = %self.node.uid, attempt, "sshd not ready");

            self.pause(cancel).await?;
        }
    }

    async fn exchange_keys(&mut self, ip: IpAddr, cancel: &CancellationToken) -> LifecycleResult<()> {
        let host_key = match self
            .ctx
            .trust
            .fetch(&self.node, &self.shared_secret, cancel)
            .await
        {
            Ok(host_key) => host_key,
            Err(TrustError::Cancelled) => return Err(LifecycleError::Cancelled(self.node.state)),
            Err(e) => return Err(e.into()),
        };

        self.ctx
            .known_hosts
            .append(ip, self.node.ssh_port, &host_key)
            .await?;
        self.node.host_key = Some(host_key);
        self.checkpoint()?;

        Ok(())
    }

    /// Best-effort release of everything a failed lifecycle acquired
    async fn abort(&mut self, cause: &LifecycleError) {
        if self.node.state.is_terminal() {
            return;
        }

        if let Err(e) = self.ctx.tunnels.disable(&self.node).await {
            warn!(node_uid = %self.node.uid, "Tunnel teardown failed: {}", e);
        }

        if let (Some(id), Some(api_base)) = (&self.node.node_id, &self.node.api_base) {
            let summary = self
                .provider
                .delete_instances(std::slice::from_ref(id), api_base)
                .await;
            for (id, error) in &summary.failed {
                warn!(node_uid = %self.node.uid, "Failed to delete instance {}: {}", id, error);
            }
        }
        self.release_key().await;

        if let Some(ip) = self.node.public_ip {
            if self.node.host_key.is_some() {
                if let Err(e) = self.ctx.known_hosts.remove(ip, self.node.ssh_port).await {
                    warn!(node_uid = %self.node.uid, "Failed to prune known hosts: {}", e);
                }
            }
        }

        if let Err(e) = self.transition(NodeState::Failed, Some(cause.to_string())) {
            error!(node_uid = %self.node.uid, "{}", e);
            return;
        }

        if self.node.node_id.is_some() {
            if let Err(e) = self.record_deleted() {
                warn!(node_uid = %self.node.uid, "Failed to record failed node: {}", e);
            }
        }
    }

    async fn release_key(&self) {
        if let Some(key_id) = &self.node.key_id {
            if let Err(e) = self.provider.delete_key(key_id).await {
                warn!(node_uid = %self.node.uid, "Failed to delete key {}: {}", key_id, e);
            }
        }
        remove_key_files(&self.node.ssh_key_path).await;
    }

    /// Tear the node down and delete it along with any prefixed instance
    /// other than `keep` (the name of the node taking over)
    ///
    /// Cleanup failures are logged; only an illegal transition is an error.
    pub async fn retire(&mut self, keep: Option<&str>) -> LifecycleResult<()> {
        self.transition(NodeState::Retiring, None)?;
        if let Err(e) = self.checkpoint() {
            warn!(node_uid = %self.node.uid, "Failed to checkpoint retiring node: {}", e);
        }

        if let Err(e) = self.ctx.tunnels.disable(&self.node).await {
            warn!(node_uid = %self.node.uid, "Tunnel teardown failed: {}", e);
        }

        if let (Some(id), Some(api_base)) = (&self.node.node_id, &self.node.api_base) {
            let summary = self
                .provider
                .delete_instances(std::slice::from_ref(id), api_base)
                .await;
            for (id, error) in &summary.failed {
                warn!(node_uid = %self.node.uid, "Failed to delete instance {}: {}", id, error);
            }
        }
        sweep_stragglers(&self.ctx, keep).await;

        self.release_key().await;
        if let Some(ip) = self.node.public_ip {
            if let Err(e) = self.ctx.known_hosts.remove(ip, self.node.ssh_port).await {
                warn!(node_uid = %self.node.uid, "Failed to prune known hosts: {}", e);
            }
        }

        self.transition(NodeState::Deleted, None)?;
        if let Err(e) = self.record_deleted() {
            warn!(node_uid = %self.node.uid, "Failed to record deleted node: {}", e);
        }

        info!(node_uid = %self.node.uid, "🗑️ Node {} retired", self.node.name);
        Ok(())
    }
}
