//! Provider descriptors and instance types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::ParseError;

/// Supported cloud vendors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    DigitalOcean,
    UpCloud,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 2] = [ProviderKind::DigitalOcean, ProviderKind::UpCloud];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::DigitalOcean => "digitalocean",
            ProviderKind::UpCloud => "upcloud",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "digitalocean" | "do" => Ok(ProviderKind::DigitalOcean),
            "upcloud" => Ok(ProviderKind::UpCloud),
            other => Err(ParseError::UnknownProvider(other.to_string())),
        }
    }
}

/// Static descriptor of what a provider offers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderCapability {
    pub kind: ProviderKind,
    /// Default API base URL
    pub api_base: String,
    /// Instance size used when the configuration does not override it
    pub default_size: String,
    /// Image used when the configuration does not override it
    pub default_image: String,
    /// False when SSH keys are passed inline at create time instead of registered
    pub native_key_registration: bool,
}

/// A region (or zone) and the country it lives in
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Region {
    pub id: String,
    /// ISO 3166-1 alpha-2 code, upper case
    pub country: String,
}

impl Region {
    pub fn new(id: impl Into<String>, country: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            country: country.into().to_ascii_uppercase(),
        }
    }
}

/// A compute instance as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub region: Option<String>,
    pub public_ip: Option<IpAddr>,
}

/// Instances reachable through one API endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceGroup {
    pub api_base: String,
    pub instances: Vec<Instance>,
}

/// Parameters for `instances.create`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateInstanceRequest {
    pub region: String,
    pub name: String,
    pub size: String,
    pub image: String,
    pub key_id: String,
    pub user_data: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), kind);
        }
        assert_eq!("DO".parse::<ProviderKind>().unwrap(), ProviderKind::DigitalOcean);
        assert!(matches!(
            "aws".parse::<ProviderKind>(),
            Err(ParseError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_region_country_is_upper_case() {
        assert_eq!(Region::new("ams3", "nl").country, "NL");
    }
}
