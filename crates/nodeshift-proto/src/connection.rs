//! Durable connection record
//!
//! A `Connection` is the persisted summary of a node plus its tunnel
//! parameters. It outlives the in-memory `Node` and is what the orchestrator
//! rebuilds from after a restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::node::{Node, NodeState, TunnelParams};
use crate::provider::ProviderKind;
use crate::tunnel::{Platform, TunnelType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Same as `Node::uid`
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub node_id: Option<String>,
    pub region: Option<String>,
    pub api_base: Option<String>,
    pub key_id: Option<String>,
    pub public_ip: Option<IpAddr>,
    pub ssh_port: u16,
    pub ssh_key_path: PathBuf,
    pub host_key: Option<String>,
    pub tunnel_type: TunnelType,
    pub platform: Platform,
    pub local_port: u16,
    pub remote_port: u16,
    pub key_algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    pub log_path: PathBuf,
    pub state: NodeState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
}

impl Connection {
    /// Snapshot a node into a connection record
    pub fn from_node(node: &Node) -> Self {
        Self {
            id: node.uid.clone(),
            name: node.name.clone(),
            provider: node.provider,
            node_id: node.node_id.clone(),
            region: node.region.clone(),
            api_base: node.api_base.clone(),
            key_id: node.key_id.clone(),
            public_ip: node.public_ip,
            ssh_port: node.ssh_port,
            ssh_key_path: node.ssh_key_path.clone(),
            host_key: node.host_key.clone(),
            tunnel_type: node.tunnel_type,
            platform: node.platform,
            local_port: node.params.local_port,
            remote_port: node.params.remote_port,
            key_algorithm: node.params.key_algorithm.clone(),
            passphrase: node.params.passphrase.clone(),
            log_path: node.params.log_path.clone(),
            state: node.state,
            created_at: node.created_at,
            updated_at: Utc::now(),
            deleted_at: None,
            is_deleted: matches!(node.state, NodeState::Deleted),
        }
    }

    /// Rebuild the in-memory node this record describes
    pub fn to_node(&self) -> Node {
        Node {
            uid: self.id.clone(),
            name: self.name.clone(),
            node_id: self.node_id.clone(),
            provider: self.provider,
            region: self.region.clone(),
            api_base: self.api_base.clone(),
            key_id: self.key_id.clone(),
            public_ip: self.public_ip,
            ssh_port: self.ssh_port,
            ssh_key_path: self.ssh_key_path.clone(),
            host_key: self.host_key.clone(),
            tunnel_type: self.tunnel_type,
            platform: self.platform,
            params: TunnelParams {
                local_port: self.local_port,
                remote_port: self.remote_port,
                key_algorithm: self.key_algorithm.clone(),
                passphrase: self.passphrase.clone(),
                log_path: self.log_path.clone(),
            },
            created_at: self.created_at,
            state: self.state,
        }
    }

    /// Flag the record deleted; a failed node keeps its `Failed` state
    pub fn mark_deleted(&mut self) {
        let now = Utc::now();
        self.is_deleted = true;
        if self.state != NodeState::Failed {
            self.state = NodeState::Deleted;
        }
        self.deleted_at = Some(now);
        self.updated_at = now;
    }
}
