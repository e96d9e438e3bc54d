//! Wiring of the concrete adapters behind the orchestrator

use anyhow::{anyhow, Context, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use nodeshift_control::{
    BannerProbe, LifecycleContext, OrchestratorConfig, ProbeKind, SshCommandProbe, SshProbe,
};
use nodeshift_proto::ProviderKind;
use nodeshift_provider::{digitalocean, upcloud, DigitalOcean, HttpOptions, ProviderAdapter, UpCloud};
use nodeshift_store::PersistenceStore;
use nodeshift_trust::{HttpKvClient, TrustStore};
use nodeshift_tunnel::{ProcessRunner, ScriptMatrix, ShellRunner, TunnelManager};

use crate::config::{FileConfig, ProviderCredentials};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoints the orchestrator itself must reach while the killswitch is up
#[derive(Debug, Clone, Default)]
pub struct ControlPlane {
    /// Host names pinned to the address found at startup
    pub resolved: Vec<(String, SocketAddr)>,
    /// Killswitch exceptions
    pub addresses: Vec<IpAddr>,
}

impl ControlPlane {
    fn admit(&mut self, ip: IpAddr) {
        if !self.addresses.contains(&ip) {
            self.addresses.push(ip);
        }
    }
}

/// Host and port of a URL, the port defaulting by scheme
pub fn url_endpoint(url: &str) -> Option<(String, u16)> {
    let re = regex_lite::Regex::new(
        r"^([A-Za-z][A-Za-z0-9+.-]*)://(?:[^@/]*@)?(\[[^\]]+\]|[^:/?#]+)(?::(\d+))?",
    )
    .ok()?;
    let caps = re.captures(url.trim())?;

    let scheme = caps.get(1)?.as_str().to_ascii_lowercase();
    let host = caps.get(2)?.as_str().trim_start_matches('[').trim_end_matches(']');
    let port = match caps.get(3) {
        Some(port) => port.as_str().parse().ok()?,
        None => match scheme.as_str() {
            "https" => 443,
            "http" => 80,
            _ => 1080,
        },
    };
    Some((host.to_string(), port))
}

/// Provider APIs, the proxy in front of them and the KV service
pub fn control_plane_urls(file: &FileConfig) -> Vec<String> {
    let mut urls: Vec<String> = file
        .orchestrator
        .providers
        .iter()
        .map(|kind| match kind {
            ProviderKind::DigitalOcean => digitalocean::DEFAULT_API_BASE.to_string(),
            ProviderKind::UpCloud => upcloud::DEFAULT_API_BASE.to_string(),
        })
        .collect();
    urls.extend(file.credentials.proxy.clone());
    urls.push(file.orchestrator.kv_base_url.clone());
    urls
}

/// Resolve every control-plane host once, preferring IPv4
///
/// A host that does not resolve is skipped with a warning; its traffic is
/// then blocked while the killswitch is up.
pub async fn resolve_control_plane(urls: &[String]) -> ControlPlane {
    let mut plane = ControlPlane::default();

    for url in urls {
        let Some((host, port)) = url_endpoint(url) else {
            warn!("Cannot tell the host of {}, not exempted from the killswitch", url);
            continue;
        };
        if let Ok(ip) = host.parse::<IpAddr>() {
            plane.admit(ip);
            continue;
        }
        if plane.resolved.iter().any(|(known, _)| *known == host) {
            continue;
        }

        let lookup = tokio::time::timeout(LOOKUP_TIMEOUT, tokio::net::lookup_host((host.as_str(), port)));
        let addrs: Vec<SocketAddr> = match lookup.await {
            Ok(Ok(addrs)) => addrs.collect(),
            Ok(Err(e)) => {
                warn!("Failed to resolve {}: {}", host, e);
                continue;
            }
            Err(_) => {
                warn!("Resolving {} timed out", host);
                continue;
            }
        };
        let Some(addr) = addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
        else {
            continue;
        };

        debug!("Pinned {} to {}", host, addr.ip());
        plane.admit(addr.ip());
        plane.resolved.push((host, addr));
    }

    plane
}

/// One adapter per enabled provider; every enabled provider needs credentials
pub fn build_providers(
    providers: &[ProviderKind],
    credentials: &ProviderCredentials,
    resolved: &[(String, SocketAddr)],
) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
    let options = HttpOptions {
        proxy: credentials.proxy.clone(),
        resolved: resolved.to_vec(),
    };
    let mut adapters: Vec<Arc<dyn ProviderAdapter>> = Vec::with_capacity(providers.len());

    for kind in providers {
        let adapter: Arc<dyn ProviderAdapter> = match kind {
            ProviderKind::DigitalOcean => {
                let creds = credentials
                    .digitalocean
                    .as_ref()
                    .ok_or_else(|| anyhow!("Missing credentials.digitalocean.token"))?;
                Arc::new(
                    DigitalOcean::new(&creds.token, &options)
                        .context("Failed to create DigitalOcean client")?,
                )
            }
            ProviderKind::UpCloud => {
                let creds = credentials
                    .upcloud
                    .as_ref()
                    .ok_or_else(|| anyhow!("Missing credentials.upcloud.username/password"))?;
                Arc::new(
                    UpCloud::new(&creds.username, &creds.password, &options)
                        .context("Failed to create UpCloud client")?,
                )
            }
        };
        adapters.push(adapter);
    }

    Ok(adapters)
}

/// Build the shared context for the configured tunnel and platform
///
/// Fails before anything is provisioned when the configuration is invalid
/// or the script matrix lacks an entry the configuration needs. With the
/// killswitch on, control-plane hosts are resolved here and exempted from
/// it, and every later request to them skips DNS.
pub async fn build_context(file: &FileConfig) -> Result<Arc<LifecycleContext>> {
    let config = &file.orchestrator;
    config.validate().context("Invalid configuration")?;

    for dir in [config.state_dir.clone(), config.keys_dir(), config.run_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create state directory: {:?}", dir))?;
    }

    let plane = if config.killswitch.enabled {
        resolve_control_plane(&control_plane_urls(file)).await
    } else {
        ControlPlane::default()
    };

    let providers = build_providers(&config.providers, &file.credentials, &plane.resolved)?;

    let kv = HttpKvClient::with_resolved(&config.kv_base_url, &plane.resolved)
        .context("Failed to create KV client")?;
    let trust = Arc::new(TrustStore::new(Arc::new(kv), config.poll_interval));

    let mut settings = config.tunnel_settings();
    settings
        .allowed_subnets
        .extend(plane.addresses.iter().map(IpAddr::to_string));

    let runner: Arc<dyn ProcessRunner> = Arc::new(ShellRunner::new());
    let tunnels = TunnelManager::new(
        ScriptMatrix::standard(),
        runner.clone(),
        settings,
        &[config.tunnel_type],
        &[config.platform],
    )
    .context("Tunnel scripts are incomplete for this configuration")?;

    let store = PersistenceStore::open(config.store_path())
        .with_context(|| format!("Failed to open store: {:?}", config.store_path()))?;

    let probe = build_probe(config, runner.clone());

    Ok(Arc::new(LifecycleContext::new(
        Arc::new(config.clone()),
        providers,
        trust,
        Arc::new(tunnels),
        Arc::new(store),
        probe,
        runner,
    )))
}

fn build_probe(config: &OrchestratorConfig, runner: Arc<dyn ProcessRunner>) -> Arc<dyn SshProbe> {
    match config.ssh.probe {
        ProbeKind::Banner => Arc::new(BannerProbe::new(config.ssh.probe_timeout)),
        ProbeKind::Command => Arc::new(SshCommandProbe::new(
            runner,
            config.ssh.user.clone(),
            config.ssh.probe_timeout,
        )),
    }
}
