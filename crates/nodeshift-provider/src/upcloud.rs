//! UpCloud adapter
//!
//! UpCloud has no account-level SSH key registry: keys are passed inline in
//! the server's login user at create time. `add_key` therefore hands the
//! public key back as its own id and `delete_key` is a no-op.

use async_trait::async_trait;
use nodeshift_proto::{
    CreateInstanceRequest, Instance, InstanceGroup, ProviderCapability, ProviderKind, Region,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::{CreatedInstance, DeleteSummary, ProviderAdapter};
use crate::error::{ProviderError, ProviderResult};
use crate::http::{DeleteOutcome, HttpOptions, ProviderAuth, ProviderHttp};

pub const DEFAULT_API_BASE: &str = "https://api.upcloud.com/1.3";

/// A server must be stopped before it can be deleted
const DELETE_ATTEMPTS: u32 = 3;

pub struct UpCloud {
    http: ProviderHttp,
    capability: ProviderCapability,
    delete_retry_delay: Duration,
}

impl UpCloud {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        options: &HttpOptions,
    ) -> ProviderResult<Self> {
        let http = ProviderHttp::new(
            ProviderKind::UpCloud,
            ProviderAuth::Basic {
                username: username.into(),
                password: password.into(),
            },
            options,
        )?;

        Ok(Self {
            http,
            capability: ProviderCapability {
                kind: ProviderKind::UpCloud,
                api_base: DEFAULT_API_BASE.to_string(),
                default_size: "1xCPU-1GB".to_string(),
                // Ubuntu Server 22.04 LTS template
                default_image: "01000000-0000-4000-8000-000030220200".to_string(),
                native_key_registration: false,
            },
            delete_retry_delay: Duration::from_secs(5),
        })
    }

    /// Point the adapter at another endpoint (for testing)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.capability.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_delete_retry_delay(mut self, delay: Duration) -> Self {
        self.delete_retry_delay = delay;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.capability.api_base, path)
    }

    async fn delete_one(&self, id: &str, api_base: &str) -> ProviderResult<DeleteOutcome> {
        let stop = json!({ "stop_server": { "stop_type": "hard", "timeout": "60" } });
        if let Err(e) = self
            .http
            .post_unit(&format!("{}/server/{}/stop", api_base, id), &stop, "instances.stop")
            .await
        {
            // Already stopped or already gone; the delete below decides
            debug!("Stop request for server {} failed: {}", id, e);
        }

        let url = format!("{}/server/{}?storages=1", api_base, id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.http.delete(&url, "instances.delete").await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if attempt < DELETE_ATTEMPTS => {
                    debug!(
                        "Delete of server {} not accepted yet (attempt {}): {}",
                        id, attempt, e
                    );
                    tokio::time::sleep(self.delete_retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Country of a zone id such as `de-fra1` or `uk-lon1`
fn zone_country(zone: &str) -> Option<String> {
    let prefix = zone.split('-').next()?;
    if prefix.len() != 2 {
        return None;
    }
    match prefix {
        "uk" => Some("GB".to_string()),
        other => Some(other.to_ascii_uppercase()),
    }
}

#[derive(Debug, Deserialize)]
struct ZonesResponse {
    zones: ZoneList,
}

#[derive(Debug, Deserialize)]
struct ZoneList {
    #[serde(default)]
    zone: Vec<Zone>,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    #[serde(default)]
    public: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlansResponse {
    plans: PlanList,
}

#[derive(Debug, Deserialize)]
struct PlanList {
    #[serde(default)]
    plan: Vec<Plan>,
}

#[derive(Debug, Deserialize)]
struct Plan {
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateServerBody {
    server: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ServerResponse {
    server: Server,
}

#[derive(Debug, Deserialize)]
struct ServersResponse {
    servers: ServerList,
}

#[derive(Debug, Deserialize)]
struct ServerList {
    #[serde(default)]
    server: Vec<Server>,
}

#[derive(Debug, Deserialize)]
struct Server {
    uuid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    zone: Option<String>,
    #[serde(default)]
    ip_addresses: Option<IpAddresses>,
}

#[derive(Debug, Deserialize)]
struct IpAddresses {
    #[serde(default)]
    ip_address: Vec<IpAddressEntry>,
}

#[derive(Debug, Deserialize)]
struct IpAddressEntry {
    address: String,
    access: String,
    family: String,
}

impl From<Server> for Instance {
    fn from(server: Server) -> Self {
        let public_ip = server.ip_addresses.as_ref().and_then(|ips| {
            ips.ip_address
                .iter()
                .filter(|ip| ip.access == "public" && ip.family == "IPv4")
                .find_map(|ip| ip.address.parse::<IpAddr>().ok())
        });

        Instance {
            id: server.uuid,
            name: server.title,
            region: server.zone,
            public_ip,
        }
    }
}

#[async_trait]
impl ProviderAdapter for UpCloud {
    fn capability(&self) -> &ProviderCapability {
        &self.capability
    }

    async fn fetch_regions(&self, size: Option<&str>) -> ProviderResult<Vec<Region>> {
        if let Some(size) = size {
            let plans: PlansResponse = self.http.get_json(&self.url("/plan"), "plans.list").await?;
            if !plans.plans.plan.iter().any(|p| p.name == size) {
                debug!("UpCloud has no plan named {}", size);
                return Ok(Vec::new());
            }
        }

        let response: ZonesResponse = self.http.get_json(&self.url("/zone"), "regions.list").await?;

        let regions = response
            .zones
            .zone
            .into_iter()
            .filter(|z| z.public.as_deref().map_or(true, |p| p == "yes"))
            .filter_map(|z| zone_country(&z.id).map(|country| Region::new(z.id, country)))
            .collect();

        Ok(regions)
    }

    async fn add_key(&self, public_key: &str, _name: &str) -> ProviderResult<String> {
        let key = public_key.trim();
        if key.is_empty() {
            return Err(ProviderError::Config("empty SSH public key".to_string()));
        }
        Ok(key.to_string())
    }

    async fn delete_key(&self, _key_id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> ProviderResult<CreatedInstance> {
        let body = CreateServerBody {
            server: json!({
                "zone": request.region,
                "title": request.name,
                "hostname": request.name,
                "plan": request.size,
                "metadata": "yes",
                "user_data": request.user_data,
                "storage_devices": {
                    "storage_device": [{
                        "action": "clone",
                        "storage": request.image,
                        "title": format!("{}-disk", request.name),
                        "size": 25,
                        "tier": "maxiops"
                    }]
                },
                "login_user": {
                    "username": "root",
                    "create_password": "no",
                    "ssh_keys": { "ssh_key": [request.key_id] }
                }
            }),
        };

        let response: ServerResponse = self
            .http
            .post_json(&self.url("/server"), &body, "instances.create")
            .await?;

        let instance = Instance::from(response.server);
        info!(
            "Created UpCloud server {} ({}) in {}",
            instance.name, instance.id, request.region
        );

        Ok(CreatedInstance {
            instance,
            api_base: self.capability.api_base.clone(),
        })
    }

    async fn get_instance(&self, id: &str, api_base: &str) -> ProviderResult<Instance> {
        let response: ServerResponse = self
            .http
            .get_json(&format!("{}/server/{}", api_base, id), "instances.get")
            .await?;
        Ok(response.server.into())
    }

    async fn list_instances(&self) -> ProviderResult<Vec<InstanceGroup>> {
        let response: ServersResponse = self
            .http
            .get_json(&self.url("/server"), "instances.list")
            .await?;

        Ok(vec![InstanceGroup {
            api_base: self.capability.api_base.clone(),
            instances: response.servers.server.into_iter().map(Instance::from).collect(),
        }])
    }

    async fn delete_instances(&self, ids: &[String], api_base: &str) -> DeleteSummary {
        let mut summary = DeleteSummary::default();

        for id in ids {
            match self.delete_one(id, api_base).await {
                Ok(DeleteOutcome::Deleted) => {
                    info!("Deleted UpCloud server {}", id);
                    summary.deleted.push(id.clone());
                }
                Ok(DeleteOutcome::NotFound) => summary.not_found.push(id.clone()),
                Err(e) => {
                    warn!("Failed to delete UpCloud server {}: {}", id, e);
                    summary.failed.push((id.clone(), e.to_string()));
                }
            }
        }

        summary
    }
}
