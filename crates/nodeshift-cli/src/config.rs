//! YAML configuration file
//!
//! Loaded from `--config <path>` or `~/.nodeshift/config.yml`. The file holds
//! the orchestrator settings at the top level plus a `credentials` section.
//!
//! ```yaml
//! providers: [digitalocean, upcloud]
//! tunnel_type: wireguard
//! disabled_countries: [US]
//! kv_base_url: https://kv.example.com
//! credentials:
//!   digitalocean:
//!     token: "${DIGITALOCEAN_TOKEN}"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use nodeshift_control::OrchestratorConfig;
use nodeshift_proto::{ProviderKind, TunnelType};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub credentials: ProviderCredentials,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub digitalocean: Option<DigitalOceanCredentials>,
    pub upcloud: Option<UpCloudCredentials>,
    /// Outbound proxy for every provider API call
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigitalOceanCredentials {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpCloudCredentials {
    pub username: String,
    pub password: String,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub providers: Vec<ProviderKind>,
    pub tunnel_type: Option<TunnelType>,
    pub kv_base_url: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub killswitch: Option<bool>,
}

/// `~/.nodeshift/config.yml`
pub fn default_config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home.join(".nodeshift").join("config.yml"))
}

impl FileConfig {
    /// Load `path`, or the default location when `None`
    ///
    /// A missing default file yields the built-in defaults; a missing explicit
    /// file is an error.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let path = default_config_path()?;
                if path.exists() {
                    Self::load(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Invalid config file: {:?}", path))
    }

    /// Parse YAML and expand `${VAR}` references in credentials and URLs
    pub fn parse(content: &str) -> Result<Self> {
        let mut config: FileConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML config")?;

        config.orchestrator.kv_base_url = expand_env_vars(&config.orchestrator.kv_base_url);
        let credentials = &mut config.credentials;
        if let Some(digitalocean) = credentials.digitalocean.as_mut() {
            digitalocean.token = expand_env_vars(&digitalocean.token);
        }
        if let Some(upcloud) = credentials.upcloud.as_mut() {
            upcloud.username = expand_env_vars(&upcloud.username);
            upcloud.password = expand_env_vars(&upcloud.password);
        }
        if let Some(proxy) = credentials.proxy.take() {
            let proxy = expand_env_vars(&proxy);
            credentials.proxy = (!proxy.trim().is_empty()).then_some(proxy);
        }

        Ok(config)
    }

    pub fn apply(&mut self, overrides: Overrides) {
        let config = &mut self.orchestrator;
        if !overrides.providers.is_empty() {
            config.providers = overrides.providers;
        }
        if let Some(tunnel_type) = overrides.tunnel_type {
            config.tunnel_type = tunnel_type;
        }
        if let Some(url) = overrides.kv_base_url {
            config.kv_base_url = url;
        }
        if let Some(dir) = overrides.state_dir {
            config.state_dir = dir;
        }
        if let Some(enabled) = overrides.killswitch {
            config.killswitch.enabled = enabled;
        }
    }
}

/// Expand environment variables in a string
///
/// Supports `${VAR}` syntax. An unset variable expands to an empty string.
pub fn expand_env_vars(input: &str) -> String {
    let Ok(re) = regex_lite::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };

    re.replace_all(input, |caps: &regex_lite::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodeshift_control::ProbeKind;
    use std::time::Duration;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("NODESHIFT_TEST_VAR", "test_value");
        std::env::set_var("NODESHIFT_OTHER_VAR", "other");

        assert_eq!(expand_env_vars("${NODESHIFT_TEST_VAR}"), "test_value");
        assert_eq!(
            expand_env_vars("prefix_${NODESHIFT_TEST_VAR}_suffix"),
            "prefix_test_value_suffix"
        );
        assert_eq!(
            expand_env_vars("${NODESHIFT_TEST_VAR}_${NODESHIFT_OTHER_VAR}"),
            "test_value_other"
        );
        assert_eq!(expand_env_vars("no_vars"), "no_vars");
        assert_eq!(expand_env_vars("${NODESHIFT_UNSET_VAR}"), "");

        std::env::remove_var("NODESHIFT_TEST_VAR");
        std::env::remove_var("NODESHIFT_OTHER_VAR");
    }

    #[test]
    fn test_parse_full_config() {
        std::env::set_var("NODESHIFT_TEST_DO_TOKEN", "do-secret");

        let yaml = r#"
name_prefix: vpn
providers: [digitalocean]
tunnel_type: sshuttle
disabled_countries: [US, de]
recycle_interval: 1800
killswitch:
  enabled: true
  allowed_subnets: [192.168.1.0/24]
ssh:
  probe: command
kv_base_url: https://kv.example.com
credentials:
  digitalocean:
    token: "${NODESHIFT_TEST_DO_TOKEN}"
  proxy: ""
"#;
        let config = FileConfig::parse(yaml).unwrap();
        let orchestrator = &config.orchestrator;

        assert_eq!(orchestrator.name_prefix, "vpn");
        assert_eq!(orchestrator.providers, vec![ProviderKind::DigitalOcean]);
        assert_eq!(orchestrator.tunnel_type, TunnelType::Sshuttle);
        assert_eq!(orchestrator.recycle_interval, Duration::from_secs(1800));
        assert!(orchestrator.killswitch.enabled);
        assert_eq!(orchestrator.ssh.probe, ProbeKind::Command);
        // Untouched fields keep their defaults
        assert_eq!(orchestrator.ssh.port, 22);
        assert_eq!(orchestrator.check_interval, Duration::from_secs(60));
        orchestrator.validate().unwrap();

        assert_eq!(
            config.credentials.digitalocean.as_ref().unwrap().token,
            "do-secret"
        );
        assert!(config.credentials.upcloud.is_none());
        assert!(config.credentials.proxy.is_none());

        std::env::remove_var("NODESHIFT_TEST_DO_TOKEN");
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = FileConfig::parse("{}").unwrap();
        assert_eq!(config.orchestrator.name_prefix, "nodeshift");
        assert_eq!(config.orchestrator.tunnel_type, TunnelType::WireGuard);
        assert!(config.orchestrator.kv_base_url.is_empty());
        assert!(config.credentials.digitalocean.is_none());
    }

    #[test]
    fn test_parse_rejects_unknown_tunnel() {
        assert!(FileConfig::parse("tunnel_type: ipsec").is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = FileConfig::parse("providers: [digitalocean, upcloud]").unwrap();
        config.apply(Overrides {
            providers: vec![ProviderKind::UpCloud],
            tunnel_type: Some(TunnelType::HttpProxy),
            kv_base_url: Some("http://kv.local".to_string()),
            state_dir: Some(PathBuf::from("/tmp/ns")),
            killswitch: Some(true),
        });

        let orchestrator = &config.orchestrator;
        assert_eq!(orchestrator.providers, vec![ProviderKind::UpCloud]);
        assert_eq!(orchestrator.tunnel_type, TunnelType::HttpProxy);
        assert_eq!(orchestrator.kv_base_url, "http://kv.local");
        assert_eq!(orchestrator.store_path(), PathBuf::from("/tmp/ns/store.json"));
        assert!(orchestrator.killswitch.enabled);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("absent.yml");
        assert!(FileConfig::resolve(Some(&path)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, "name_prefix: edge\nkv_base_url: http://kv\n").unwrap();

        let config = FileConfig::resolve(Some(&path)).unwrap();
        assert_eq!(config.orchestrator.name_prefix, "edge");
        assert_eq!(config.orchestrator.kv_base_url, "http://kv");
    }
}
