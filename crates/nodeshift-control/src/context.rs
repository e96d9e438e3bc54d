//! Collaborators shared by every lifecycle

use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use nodeshift_proto::{NodeEvent, ProviderKind};
use nodeshift_provider::{DeleteSummary, ProviderAdapter};
use nodeshift_store::PersistenceStore;
use nodeshift_trust::{KnownHosts, TrustStore};
use nodeshift_tunnel::{ProcessRunner, TunnelManager};

use crate::config::OrchestratorConfig;
use crate::ssh::SshProbe;

const EVENT_CAPACITY: usize = 256;

pub struct LifecycleContext {
    pub config: Arc<OrchestratorConfig>,
    pub providers: Vec<Arc<dyn ProviderAdapter>>,
    pub trust: Arc<TrustStore>,
    pub tunnels: Arc<TunnelManager>,
    pub store: Arc<PersistenceStore>,
    pub probe: Arc<dyn SshProbe>,
    pub runner: Arc<dyn ProcessRunner>,
    pub known_hosts: KnownHosts,
    events: broadcast::Sender<NodeEvent>,
}

impl LifecycleContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<OrchestratorConfig>,
        providers: Vec<Arc<dyn ProviderAdapter>>,
        trust: Arc<TrustStore>,
        tunnels: Arc<TunnelManager>,
        store: Arc<PersistenceStore>,
        probe: Arc<dyn SshProbe>,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let known_hosts = KnownHosts::new(config.known_hosts_path());

        Self {
            config,
            providers,
            trust,
            tunnels,
            store,
            probe,
            runner,
            known_hosts,
            events,
        }
    }

    pub fn provider(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.providers.iter().find(|p| p.kind() == kind).cloned()
    }

    /// State changes of every node driven through this context
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: NodeEvent) {
        // No subscriber is fine
        let _ = self.events.send(event);
    }
}

/// Delete every instance carrying the name prefix on every provider, except
/// the one named `keep`
///
/// Listing and deletion run concurrently per provider and per API base;
/// failures are logged and collected, never raised.
pub async fn sweep_stragglers(ctx: &LifecycleContext, keep: Option<&str>) -> DeleteSummary {
    let prefix = format!("{}-", ctx.config.name_prefix);

    let per_provider = ctx.providers.iter().map(|provider| {
        let prefix = prefix.clone();
        async move {
            let groups = match provider.list_instances().await {
                Ok(groups) => groups,
                Err(e) => {
                    warn!("Listing {} instances for cleanup failed: {}", provider.kind(), e);
                    return DeleteSummary::default();
                }
            };

            let deletions = groups.into_iter().filter_map(|group| {
                let ids: Vec<String> = group
                    .instances
                    .iter()
                    .filter(|i| i.name.starts_with(&prefix) && Some(i.name.as_str()) != keep)
                    .map(|i| i.id.clone())
                    .collect();
                if ids.is_empty() {
                    return None;
                }
                let provider = provider.clone();
                Some(async move { provider.delete_instances(&ids, &group.api_base).await })
            });

            let mut summary = DeleteSummary::default();
            for result in join_all(deletions).await {
                summary.merge(result);
            }
            summary
        }
    });

    let mut summary = DeleteSummary::default();
    for result in join_all(per_provider).await {
        summary.merge(result);
    }

    if !summary.deleted.is_empty() {
        info!("🧹 Removed {} straggler instance(s)", summary.deleted.len());
    }
    for (id, error) in &summary.failed {
        warn!("Failed to delete straggler {}: {}", id, error);
    }

    summary
}
