//! Orchestrator configuration
//!
//! Built once by the caller and shared as `Arc<OrchestratorConfig>`.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use nodeshift_proto::{Platform, ProviderKind, TunnelParams, TunnelType, DEFAULT_SSH_PORT};
use nodeshift_tunnel::TunnelSettings;

use crate::error::{LifecycleError, LifecycleResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Every instance is named `<name_prefix>-<uid>`
    pub name_prefix: String,
    pub providers: Vec<ProviderKind>,
    /// ISO country codes whose regions are never used
    pub disabled_countries: Vec<String>,
    /// Overrides the provider's default size
    pub instance_size: Option<String>,
    /// Overrides the provider's default image
    pub instance_image: Option<String>,
    pub tunnel_type: TunnelType,
    /// Platform of the machine running the client side
    pub platform: Platform,
    pub killswitch: KillswitchConfig,
    /// Maximum age of the active node
    #[serde(with = "duration_secs")]
    pub recycle_interval: Duration,
    /// Scheduler tick
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,
    /// Delay between network, SSH and KV polls
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Validity of the token a node signs its host key with
    #[serde(with = "duration_secs")]
    pub token_validity: Duration,
    /// Skip a cycle when the KV service is unreachable
    pub heartbeat_gate: bool,
    pub ssh: SshConfig,
    pub kv_base_url: String,
    /// Store, keys, known hosts and tunnel runtime files
    pub state_dir: PathBuf,
    pub local_port: u16,
    pub remote_port: u16,
    /// Retire the active node when the scheduler stops
    pub teardown_on_exit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KillswitchConfig {
    pub enabled: bool,
    /// Destinations reachable outside the tunnel, e.g. the local LAN
    pub allowed_subnets: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Read the SSH identification banner
    #[default]
    Banner,
    /// Run `ssh` and treat "permission denied" as ready
    Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub port: u16,
    pub user: String,
    pub key_algorithm: String,
    pub key_bits: Option<u32>,
    pub passphrase: Option<String>,
    pub probe: ProbeKind,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_SSH_PORT,
            user: "root".to_string(),
            key_algorithm: "ed25519".to_string(),
            key_bits: None,
            passphrase: None,
            probe: ProbeKind::Banner,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let state_dir = dirs::home_dir()
            .map(|home| home.join(".nodeshift"))
            .unwrap_or_else(|| PathBuf::from(".nodeshift"));

        Self {
            name_prefix: "nodeshift".to_string(),
            providers: ProviderKind::ALL.to_vec(),
            disabled_countries: Vec::new(),
            instance_size: None,
            instance_image: None,
            tunnel_type: TunnelType::WireGuard,
            platform: Platform::current().unwrap_or(Platform::Linux),
            killswitch: KillswitchConfig::default(),
            recycle_interval: Duration::from_secs(3600),
            check_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            token_validity: Duration::from_secs(3600),
            heartbeat_gate: true,
            ssh: SshConfig::default(),
            kv_base_url: String::new(),
            state_dir,
            local_port: 1080,
            remote_port: 51820,
            teardown_on_exit: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> LifecycleResult<()> {
        if self.name_prefix.is_empty()
            || !self
                .name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(LifecycleError::Config(
                "name_prefix must be non-empty and contain only letters, digits and hyphens"
                    .to_string(),
            ));
        }
        if self.providers.is_empty() {
            return Err(LifecycleError::NoProvider);
        }
        if self.kv_base_url.trim().is_empty() {
            return Err(LifecycleError::Config("kv_base_url is required".to_string()));
        }
        for (name, value) in [
            ("recycle_interval", self.recycle_interval),
            ("check_interval", self.check_interval),
            ("poll_interval", self.poll_interval),
        ] {
            if value.is_zero() {
                return Err(LifecycleError::Config(format!("{} must be positive", name)));
            }
        }
        Ok(())
    }

    pub fn disabled_country_set(&self) -> HashSet<String> {
        self.disabled_countries
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .collect()
    }

    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join("store.json")
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.state_dir.join("known_hosts")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.state_dir.join("keys")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("run")
    }

    pub fn tunnel_log_path(&self) -> PathBuf {
        self.state_dir.join("tunnel.log")
    }

    pub fn tunnel_params(&self) -> TunnelParams {
        TunnelParams {
            local_port: self.local_port,
            remote_port: self.remote_port,
            key_algorithm: self.ssh.key_algorithm.clone(),
            passphrase: self.ssh.passphrase.clone(),
            log_path: self.tunnel_log_path(),
        }
    }

    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            ssh_user: self.ssh.user.clone(),
            known_hosts: self.known_hosts_path(),
            state_dir: self.run_dir(),
            killswitch: self.killswitch.enabled,
            allowed_subnets: self.killswitch.allowed_subnets.clone(),
        }
    }
}

/// Helper module for serializing Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
