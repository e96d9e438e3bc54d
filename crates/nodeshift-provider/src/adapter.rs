//! The provider capability set

use async_trait::async_trait;
use nodeshift_proto::{
    CreateInstanceRequest, Instance, InstanceGroup, ProviderCapability, ProviderKind, Region,
};
use std::collections::{BTreeSet, HashSet};

use crate::error::ProviderResult;
use crate::policy::filter_regions;

/// Instance returned by `create_instance`, with the API base that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInstance {
    pub instance: Instance,
    pub api_base: String,
}

/// Outcome of a best-effort bulk delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: Vec<String>,
    pub not_found: Vec<String>,
    /// `(id, error)` pairs that failed; logged, never raised
    pub failed: Vec<(String, String)>,
}

impl DeleteSummary {
    pub fn merge(&mut self, other: DeleteSummary) {
        self.deleted.extend(other.deleted);
        self.not_found.extend(other.not_found);
        self.failed.extend(other.failed);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Uniform operations every cloud vendor exposes to the orchestrator
///
/// Adapters implement `fetch_regions`; the country policy is applied once in
/// the provided `list_regions`, so no adapter can return a disabled country.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn capability(&self) -> &ProviderCapability;

    fn kind(&self) -> ProviderKind {
        self.capability().kind
    }

    /// All regions, or only those offering `size` when given
    async fn fetch_regions(&self, size: Option<&str>) -> ProviderResult<Vec<Region>>;

    /// Regions supporting `size`, minus any country in `disabled_countries`
    async fn list_regions(
        &self,
        size: &str,
        disabled_countries: &HashSet<String>,
    ) -> ProviderResult<Vec<Region>> {
        let regions = self.fetch_regions(Some(size)).await?;
        Ok(filter_regions(regions, disabled_countries))
    }

    /// Every country representable by this provider's regions, sorted
    async fn list_countries(&self) -> ProviderResult<Vec<String>> {
        let regions = self.fetch_regions(None).await?;
        let countries: BTreeSet<String> = regions.into_iter().map(|r| r.country).collect();
        Ok(countries.into_iter().collect())
    }

    /// Register an SSH public key, returning the id to pass to `create_instance`
    async fn add_key(&self, public_key: &str, name: &str) -> ProviderResult<String>;

    async fn delete_key(&self, key_id: &str) -> ProviderResult<()>;

    /// Create an instance; the public IP may not be assigned yet
    async fn create_instance(&self, request: &CreateInstanceRequest)
        -> ProviderResult<CreatedInstance>;

    async fn get_instance(&self, id: &str, api_base: &str) -> ProviderResult<Instance>;

    /// Instances grouped by the API endpoint that owns them
    async fn list_instances(&self) -> ProviderResult<Vec<InstanceGroup>>;

    /// Best-effort delete; per-id failures land in the summary, not in `Err`
    async fn delete_instances(&self, ids: &[String], api_base: &str) -> DeleteSummary;
}
