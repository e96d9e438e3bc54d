//! Nodeshift data model
//!
//! This crate defines the core types shared by every nodeshift component:
//! nodes and their lifecycle states, provider descriptors, tunnel matrix keys
//! and the durable connection record.

pub mod connection;
pub mod event;
pub mod node;
pub mod provider;
pub mod tunnel;

pub use connection::Connection;
pub use event::NodeEvent;
pub use node::{Node, NodeState, TunnelParams};
pub use provider::{
    CreateInstanceRequest, Instance, InstanceGroup, ProviderCapability, ProviderKind, Region,
};
pub use tunnel::{Platform, ScriptAction, ScriptPhase, Side, TunnelType};

use thiserror::Error;

/// Default SSH port on freshly provisioned nodes
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Errors raised when parsing enum values from configuration strings
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Unknown tunnel type: {0}")]
    UnknownTunnelType(String),

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),
}
