//! DigitalOcean adapter (reference implementation)

use async_trait::async_trait;
use nodeshift_proto::{
    CreateInstanceRequest, Instance, InstanceGroup, ProviderCapability, ProviderKind, Region,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::adapter::{CreatedInstance, DeleteSummary, ProviderAdapter};
use crate::error::ProviderResult;
use crate::http::{DeleteOutcome, HttpOptions, ProviderAuth, ProviderHttp};

pub const DEFAULT_API_BASE: &str = "https://api.digitalocean.com/v2";

/// Tag applied to every droplet we create
const DROPLET_TAG: &str = "nodeshift";

/// Largest page the droplet listing accepts
const PAGE_SIZE: usize = 200;

/// Upper bound on followed `next` links
const MAX_PAGES: usize = 100;

pub struct DigitalOcean {
    http: ProviderHttp,
    capability: ProviderCapability,
}

impl DigitalOcean {
    pub fn new(token: impl Into<String>, options: &HttpOptions) -> ProviderResult<Self> {
        let http = ProviderHttp::new(
            ProviderKind::DigitalOcean,
            ProviderAuth::Bearer(token.into()),
            options,
        )?;

        Ok(Self {
            http,
            capability: ProviderCapability {
                kind: ProviderKind::DigitalOcean,
                api_base: DEFAULT_API_BASE.to_string(),
                default_size: "s-1vcpu-1gb".to_string(),
                default_image: "ubuntu-22-04-x64".to_string(),
                native_key_registration: true,
            },
        })
    }

    /// Point the adapter at another endpoint (for testing)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.capability.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.capability.api_base, path)
    }
}

/// Country of a region slug such as `nyc3` or `ams3`
fn region_country(slug: &str) -> Option<&'static str> {
    let city: String = slug.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    match city.as_str() {
        "nyc" | "sfo" | "atl" => Some("US"),
        "ams" => Some("NL"),
        "sgp" => Some("SG"),
        "lon" => Some("GB"),
        "fra" => Some("DE"),
        "tor" => Some("CA"),
        "blr" => Some("IN"),
        "syd" => Some("AU"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RegionsResponse {
    regions: Vec<DoRegion>,
}

#[derive(Debug, Deserialize)]
struct DoRegion {
    slug: String,
    #[serde(default)]
    available: bool,
    #[serde(default)]
    sizes: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CreateKeyBody<'a> {
    name: &'a str,
    public_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    ssh_key: DoKey,
}

#[derive(Debug, Deserialize)]
struct DoKey {
    id: u64,
}

#[derive(Debug, Serialize)]
struct CreateDropletBody<'a> {
    name: &'a str,
    region: &'a str,
    size: &'a str,
    image: &'a str,
    ssh_keys: Vec<serde_json::Value>,
    user_data: &'a str,
    tags: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct DropletResponse {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletsResponse {
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Links,
}

#[derive(Debug, Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Pages,
}

#[derive(Debug, Default, Deserialize)]
struct Pages {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    #[serde(default)]
    region: Option<DropletRegion>,
    #[serde(default)]
    networks: Networks,
}

#[derive(Debug, Deserialize)]
struct DropletRegion {
    slug: String,
}

#[derive(Debug, Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl From<Droplet> for Instance {
    fn from(droplet: Droplet) -> Self {
        let public_ip = droplet
            .networks
            .v4
            .iter()
            .filter(|n| n.kind == "public")
            .find_map(|n| n.ip_address.parse::<IpAddr>().ok());

        Instance {
            id: droplet.id.to_string(),
            name: droplet.name,
            region: droplet.region.map(|r| r.slug),
            public_ip,
        }
    }
}

#[async_trait]
impl ProviderAdapter for DigitalOcean {
    fn capability(&self) -> &ProviderCapability {
        &self.capability
    }

    async fn fetch_regions(&self, size: Option<&str>) -> ProviderResult<Vec<Region>> {
        let response: RegionsResponse = self
            .http
            .get_json(&self.url("/regions?per_page=200"), "regions.list")
            .await?;

        let regions = response
            .regions
            .into_iter()
            .filter(|r| r.available)
            .filter(|r| size.map_or(true, |s| r.sizes.iter().any(|rs| rs == s)))
            .filter_map(|r| match region_country(&r.slug) {
                Some(country) => Some(Region::new(r.slug, country)),
                None => {
                    debug!("Skipping DigitalOcean region with unknown country: {}", r.slug);
                    None
                }
            })
            .collect();

        Ok(regions)
    }

    async fn add_key(&self, public_key: &str, name: &str) -> ProviderResult<String> {
        let response: KeyResponse = self
            .http
            .post_json(
                &self.url("/account/keys"),
                &CreateKeyBody { name, public_key },
                "keys.add",
            )
            .await?;

        Ok(response.ssh_key.id.to_string())
    }

    async fn delete_key(&self, key_id: &str) -> ProviderResult<()> {
        self.http
            .delete(&self.url(&format!("/account/keys/{}", key_id)), "keys.delete")
            .await?;
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> ProviderResult<CreatedInstance> {
        // Numeric ids and fingerprints are both accepted
        let key = request
            .key_id
            .parse::<u64>()
            .map(serde_json::Value::from)
            .unwrap_or_else(|_| serde_json::Value::from(request.key_id.clone()));

        let body = CreateDropletBody {
            name: &request.name,
            region: &request.region,
            size: &request.size,
            image: &request.image,
            ssh_keys: vec![key],
            user_data: &request.user_data,
            tags: [DROPLET_TAG],
        };

        let response: DropletResponse = self
            .http
            .post_json(&self.url("/droplets"), &body, "instances.create")
            .await?;

        let instance = Instance::from(response.droplet);
        info!(
            "Created droplet {} ({}) in {}",
            instance.name, instance.id, request.region
        );

        Ok(CreatedInstance {
            instance,
            api_base: self.capability.api_base.clone(),
        })
    }

    async fn get_instance(&self, id: &str, api_base: &str) -> ProviderResult<Instance> {
        let response: DropletResponse = self
            .http
            .get_json(&format!("{}/droplets/{}", api_base, id), "instances.get")
            .await?;
        Ok(response.droplet.into())
    }

    async fn list_instances(&self) -> ProviderResult<Vec<InstanceGroup>> {
        let mut instances = Vec::new();
        let mut next = Some(self.url(&format!("/droplets?per_page={}", PAGE_SIZE)));
        let mut pages = 0;

        while let Some(url) = next.take() {
            let response: DropletsResponse = self.http.get_json(&url, "instances.list").await?;
            instances.extend(response.droplets.into_iter().map(Instance::from));

            pages += 1;
            next = response.links.pages.next;
            if pages >= MAX_PAGES && next.is_some() {
                warn!("Droplet listing truncated after {} pages", pages);
                break;
            }
        }

        debug!("Listed {} droplets over {} page(s)", instances.len(), pages);
        Ok(vec![InstanceGroup {
            api_base: self.capability.api_base.clone(),
            instances,
        }])
    }

    async fn delete_instances(&self, ids: &[String], api_base: &str) -> DeleteSummary {
        let mut summary = DeleteSummary::default();

        for id in ids {
            let url = format!("{}/droplets/{}", api_base, id);
            match self.http.delete(&url, "instances.delete").await {
                Ok(DeleteOutcome::Deleted) => {
                    info!("Deleted droplet {}", id);
                    summary.deleted.push(id.clone());
                }
                Ok(DeleteOutcome::NotFound) => {
                    debug!("Droplet {} already gone", id);
                    summary.not_found.push(id.clone());
                }
                Err(e) => {
                    warn!("Failed to delete droplet {}: {}", id, e);
                    summary.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        summary
    }
}
