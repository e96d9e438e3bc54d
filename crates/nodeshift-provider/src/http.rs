//! Shared HTTP client for provider REST APIs
//!
//! Wraps a `reqwest::Client` with the vendor's authentication scheme, an
//! optional outbound proxy, pre-resolved hosts, and uniform error mapping: any non-2xx status
//! becomes [`ProviderError::Api`] and any undecodable body becomes
//! [`ProviderError::Malformed`], both carrying the raw response text.

use nodeshift_proto::ProviderKind;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};

/// Authentication carried in request headers
#[derive(Clone)]
pub enum ProviderAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

impl std::fmt::Debug for ProviderAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderAuth::Bearer(_) => f.write_str("Bearer([REDACTED])"),
            ProviderAuth::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Outbound settings shared by every vendor client
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Route every request through this proxy URL
    pub proxy: Option<String>,
    /// Hosts resolved ahead of time; requests to them never hit DNS
    pub resolved: Vec<(String, SocketAddr)>,
}

impl HttpOptions {
    pub fn with_proxy(proxy: Option<&str>) -> Self {
        Self {
            proxy: proxy.map(str::to_string),
            resolved: Vec::new(),
        }
    }
}

/// Result of an idempotent delete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

#[derive(Debug, Clone)]
pub struct ProviderHttp {
    client: Client,
    provider: ProviderKind,
    auth: ProviderAuth,
}

impl ProviderHttp {
    /// Build a client, routing every request through the proxy when one is set
    pub fn new(provider: ProviderKind, auth: ProviderAuth, options: &HttpOptions) -> ProviderResult<Self> {
        let mut builder = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("nodeshift/", env!("CARGO_PKG_VERSION")));

        if let Some(proxy_url) = &options.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str())
                .map_err(|e| ProviderError::Config(format!("invalid proxy {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy);
        }
        for (host, addr) in &options.resolved {
            builder = builder.resolve(host, *addr);
        }

        let client = builder.build().map_err(|source| ProviderError::Http {
            provider,
            operation: "client",
            source,
        })?;

        Ok(Self {
            client,
            provider,
            auth,
        })
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.auth {
            ProviderAuth::Bearer(token) => builder.bearer_auth(token),
            ProviderAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
        }
    }

    /// Send and return the status plus raw body, mapping transport failures
    async fn send(
        &self,
        builder: RequestBuilder,
        operation: &'static str,
    ) -> ProviderResult<(StatusCode, String)> {
        let response = builder.send().await.map_err(|source| ProviderError::Http {
            provider: self.provider,
            operation,
            source,
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| ProviderError::Http {
            provider: self.provider,
            operation,
            source,
        })?;

        debug!(provider = %self.provider, operation, status = status.as_u16(), "provider response");
        Ok((status, body))
    }

    fn api_error(&self, operation: &'static str, status: StatusCode, body: String) -> ProviderError {
        ProviderError::Api {
            provider: self.provider,
            operation,
            status: status.as_u16(),
            raw_response: body,
        }
    }

    fn decode<T: DeserializeOwned>(&self, operation: &'static str, body: String) -> ProviderResult<T> {
        serde_json::from_str(&body).map_err(|e| ProviderError::Malformed {
            provider: self.provider,
            operation,
            reason: e.to_string(),
            raw_response: body,
        })
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        operation: &'static str,
    ) -> ProviderResult<T> {
        let (status, body) = self.send(self.request(Method::GET, url), operation).await?;
        if !status.is_success() {
            return Err(self.api_error(operation, status, body));
        }
        self.decode(operation, body)
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        payload: &B,
        operation: &'static str,
    ) -> ProviderResult<T> {
        let (status, body) = self
            .send(self.request(Method::POST, url).json(payload), operation)
            .await?;
        if !status.is_success() {
            return Err(self.api_error(operation, status, body));
        }
        self.decode(operation, body)
    }

    /// POST where the response body is irrelevant
    pub async fn post_unit<B: Serialize + ?Sized>(
        &self,
        url: &str,
        payload: &B,
        operation: &'static str,
    ) -> ProviderResult<()> {
        let (status, body) = self
            .send(self.request(Method::POST, url).json(payload), operation)
            .await?;
        if !status.is_success() {
            return Err(self.api_error(operation, status, body));
        }
        Ok(())
    }

    /// DELETE treating 404 as success
    pub async fn delete(&self, url: &str, operation: &'static str) -> ProviderResult<DeleteOutcome> {
        let (status, body) = self.send(self.request(Method::DELETE, url), operation).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(DeleteOutcome::NotFound);
        }
        if !status.is_success() {
            return Err(self.api_error(operation, status, body));
        }
        Ok(DeleteOutcome::Deleted)
    }
}
