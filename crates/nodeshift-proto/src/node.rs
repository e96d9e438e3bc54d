//! Node model and lifecycle states

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use crate::provider::ProviderKind;
use crate::tunnel::{Platform, TunnelType};
use crate::DEFAULT_SSH_PORT;

/// Lifecycle state of a node
///
/// The happy path runs `Requested` through `Active`, then `Retiring` and
/// `Deleted`. `Failed` is absorbing and reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Requested,
    Provisioning,
    AwaitingNetwork,
    AwaitingSshReady,
    KeyExchange,
    TunnelEstablishing,
    Active,
    Retiring,
    Deleted,
    Failed,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Requested => "requested",
            NodeState::Provisioning => "provisioning",
            NodeState::AwaitingNetwork => "awaiting_network",
            NodeState::AwaitingSshReady => "awaiting_ssh_ready",
            NodeState::KeyExchange => "key_exchange",
            NodeState::TunnelEstablishing => "tunnel_establishing",
            NodeState::Active => "active",
            NodeState::Retiring => "retiring",
            NodeState::Deleted => "deleted",
            NodeState::Failed => "failed",
        }
    }

    /// `Deleted` and `Failed` accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Deleted | NodeState::Failed)
    }

    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: NodeState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == NodeState::Failed {
            return true;
        }

        matches!(
            (self, next),
            (NodeState::Requested, NodeState::Provisioning)
                | (NodeState::Provisioning, NodeState::AwaitingNetwork)
                | (NodeState::AwaitingNetwork, NodeState::AwaitingSshReady)
                | (NodeState::AwaitingSshReady, NodeState::KeyExchange)
                | (NodeState::KeyExchange, NodeState::TunnelEstablishing)
                | (NodeState::TunnelEstablishing, NodeState::Active)
                | (NodeState::Active, NodeState::Retiring)
                | (NodeState::Retiring, NodeState::Deleted)
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel parameters carried by a node and persisted with its connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelParams {
    /// Local port the client side listens on (proxy tunnels, wireguard listen port)
    pub local_port: u16,
    /// Port the server side listens on
    pub remote_port: u16,
    /// SSH key algorithm used for the ephemeral key (e.g. "ed25519", "rsa")
    pub key_algorithm: String,
    /// Passphrase protecting the ephemeral key, if any
    pub passphrase: Option<String>,
    /// Where tunnel tooling writes its log
    pub log_path: PathBuf,
}

/// A requested or running compute instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Orchestrator-assigned identifier, also the trust store key
    pub uid: String,
    /// Instance name, always `<prefix>-<uid>`
    pub name: String,
    /// Provider-assigned instance identifier
    pub node_id: Option<String>,
    pub provider: ProviderKind,
    pub region: Option<String>,
    /// API base URL of the endpoint holding this instance
    pub api_base: Option<String>,
    /// Provider key id of the registered ephemeral SSH key
    pub key_id: Option<String>,
    pub public_ip: Option<IpAddr>,
    pub ssh_port: u16,
    pub ssh_key_path: PathBuf,
    pub host_key: Option<String>,
    pub tunnel_type: TunnelType,
    pub platform: Platform,
    pub params: TunnelParams,
    pub created_at: DateTime<Utc>,
    pub state: NodeState,
}

impl Node {
    /// Create a node in the `Requested` state
    pub fn new(
        uid: String,
        name_prefix: &str,
        provider: ProviderKind,
        tunnel_type: TunnelType,
        platform: Platform,
        ssh_key_path: PathBuf,
        params: TunnelParams,
    ) -> Self {
        Self {
            name: format!("{}-{}", name_prefix, uid),
            uid,
            node_id: None,
            provider,
            region: None,
            api_base: None,
            key_id: None,
            public_ip: None,
            ssh_port: DEFAULT_SSH_PORT,
            ssh_key_path,
            host_key: None,
            tunnel_type,
            platform,
            params,
            created_at: Utc::now(),
            state: NodeState::Requested,
        }
    }

    /// Public key file next to the private key
    pub fn public_key_path(&self) -> PathBuf {
        let mut path = self.ssh_key_path.clone().into_os_string();
        path.push(".pub");
        PathBuf::from(path)
    }

    /// Age of the node since it was requested
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Checks the preconditions for entering `Active`
    pub fn check_active_invariant(&self) -> Result<(), String> {
        if self.public_ip.is_none() {
            return Err(format!("node {} has no public IP", self.uid));
        }
        if self.host_key.is_none() {
            return Err(format!("node {} has no verified host key", self.uid));
        }
        Ok(())
    }

    /// SSH destination in `user@ip` form, if the IP is known
    pub fn ssh_destination(&self, user: &str) -> Option<String> {
        self.public_ip.map(|ip| format!("{}@{}", user, ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_node() -> Node {
        Node::new(
            "abc123".to_string(),
            "nodeshift",
            ProviderKind::DigitalOcean,
            TunnelType::Socks5Proxy,
            Platform::Linux,
            PathBuf::from("/tmp/keys/abc123"),
            TunnelParams {
                local_port: 1080,
                remote_port: 22,
                key_algorithm: "ed25519".to_string(),
                passphrase: None,
                log_path: PathBuf::from("/tmp/abc123.log"),
            },
        )
    }

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            NodeState::Requested,
            NodeState::Provisioning,
            NodeState::AwaitingNetwork,
            NodeState::AwaitingSshReady,
            NodeState::KeyExchange,
            NodeState::TunnelEstablishing,
            NodeState::Active,
            NodeState::Retiring,
            NodeState::Deleted,
        ];

        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} should be legal",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_failed_reachable_from_non_terminal_only() {
        assert!(NodeState::Requested.can_transition_to(NodeState::Failed));
        assert!(NodeState::Active.can_transition_to(NodeState::Failed));
        assert!(!NodeState::Deleted.can_transition_to(NodeState::Failed));
        assert!(!NodeState::Failed.can_transition_to(NodeState::Failed));
    }

    #[test]
    fn test_skipping_states_is_illegal() {
        assert!(!NodeState::Provisioning.can_transition_to(NodeState::Active));
        assert!(!NodeState::Requested.can_transition_to(NodeState::Retiring));
        assert!(!NodeState::Active.can_transition_to(NodeState::Deleted));
    }

    #[test]
    fn test_active_invariant() {
        let mut node = sample_node();
        assert!(node.check_active_invariant().is_err());

        node.public_ip = Some("203.0.113.5".parse().unwrap());
        assert!(node.check_active_invariant().is_err());

        node.host_key = Some("ssh-ed25519 AAAAC3Nza".to_string());
        assert!(node.check_active_invariant().is_ok());
    }

    #[test]
    fn test_name_and_key_paths() {
        let node = sample_node();
        assert_eq!(node.name, "nodeshift-abc123");
        assert_eq!(node.public_key_path(), PathBuf::from("/tmp/keys/abc123.pub"));
        assert_eq!(node.ssh_destination("root"), None);
    }
}
