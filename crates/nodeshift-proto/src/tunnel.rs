//! Keys of the tunnel script matrix

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::ParseError;

/// Mechanism carrying client traffic through a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelType {
    #[serde(rename = "wireguard", alias = "wg")]
    WireGuard,
    Sshuttle,
    HttpProxy,
    Socks5Proxy,
}

impl TunnelType {
    pub const ALL: [TunnelType; 4] = [
        TunnelType::WireGuard,
        TunnelType::Sshuttle,
        TunnelType::HttpProxy,
        TunnelType::Socks5Proxy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::WireGuard => "wireguard",
            TunnelType::Sshuttle => "sshuttle",
            TunnelType::HttpProxy => "http_proxy",
            TunnelType::Socks5Proxy => "socks5_proxy",
        }
    }

    /// Proxy tunnels listen on `127.0.0.1:{local_port}` through an SSH forward
    pub fn binds_local_port(&self) -> bool {
        matches!(self, TunnelType::HttpProxy | TunnelType::Socks5Proxy)
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "wireguard" | "wg" => Ok(TunnelType::WireGuard),
            "sshuttle" => Ok(TunnelType::Sshuttle),
            "http_proxy" | "http" => Ok(TunnelType::HttpProxy),
            "socks5_proxy" | "socks5" => Ok(TunnelType::Socks5Proxy),
            other => Err(ParseError::UnknownTunnelType(other.to_string())),
        }
    }
}

/// Operating system a script targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Darwin,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Linux, Platform::Darwin];

    /// Platform of the running process, if supported
    pub fn current() -> Option<Self> {
        #[cfg(target_os = "macos")]
        {
            Some(Platform::Darwin)
        }
        #[cfg(target_os = "linux")]
        {
            Some(Platform::Linux)
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Darwin => "darwin",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "darwin" | "macos" => Ok(Platform::Darwin),
            other => Err(ParseError::UnknownPlatform(other.to_string())),
        }
    }
}

/// Which end of the tunnel a script runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptAction {
    Main,
    Killswitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptPhase {
    Prepare,
    Enable,
    Disable,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Client => "client",
            Side::Server => "server",
        })
    }
}

impl fmt::Display for ScriptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptAction::Main => "main",
            ScriptAction::Killswitch => "killswitch",
        })
    }
}

impl fmt::Display for ScriptPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScriptPhase::Prepare => "prepare",
            ScriptPhase::Enable => "enable",
            ScriptPhase::Disable => "disable",
        })
    }
}
