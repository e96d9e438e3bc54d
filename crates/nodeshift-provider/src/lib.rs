//! Cloud provider adapters
//!
//! Every vendor implements [`ProviderAdapter`], a uniform surface over the
//! handful of operations the orchestrator needs: region and country
//! enumeration, SSH key registration, and instance create/get/list/delete.
//! Vendor adapters share the proxy-aware [`ProviderHttp`] client.

pub mod adapter;
pub mod digitalocean;
pub mod error;
pub mod http;
pub mod policy;
pub mod upcloud;

pub use adapter::{CreatedInstance, DeleteSummary, ProviderAdapter};
pub use digitalocean::DigitalOcean;
pub use error::{ProviderError, ProviderResult};
pub use http::{DeleteOutcome, HttpOptions, ProviderAuth, ProviderHttp};
pub use policy::{filter_regions, select_region};
pub use upcloud::UpCloud;
