//! Key/value service client
//!
//! Nodes `PUT /values/{uid}` their signed token; the orchestrator reads it
//! back with `GET /values/{uid}`. A missing value is reported as HTTP 404,
//! an empty body, or the literal body `not found`.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;

use crate::error::{TrustError, TrustResult};

/// Key probed by `ping`; never written by nodes
pub const HEARTBEAT_KEY: &str = "nodeshift-heartbeat";

const NOT_FOUND_SENTINEL: &str = "not found";

#[async_trait]
pub trait KvClient: Send + Sync {
    /// Value under `key`, or `None` while nothing has been published
    async fn get(&self, key: &str) -> TrustResult<Option<String>>;

    async fn put(&self, key: &str, value: &str) -> TrustResult<()>;

    /// Reachability check independent of any node
    async fn ping(&self) -> TrustResult<()>;
}

#[derive(Debug, Clone)]
pub struct HttpKvClient {
    client: Client,
    base_url: String,
}

impl HttpKvClient {
    pub fn new(base_url: impl Into<String>) -> TrustResult<Self> {
        Self::with_resolved(base_url, &[])
    }

    /// A client that reaches the hosts in `resolved` without a DNS lookup
    pub fn with_resolved(
        base_url: impl Into<String>,
        resolved: &[(String, SocketAddr)],
    ) -> TrustResult<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(10));
        for (host, addr) in resolved {
            builder = builder.resolve(host, *addr);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.base_url, key)
    }
}

fn is_absent(body: &str) -> bool {
    let body = body.trim();
    body.is_empty() || body.eq_ignore_ascii_case(NOT_FOUND_SENTINEL)
}

#[async_trait]
impl KvClient for HttpKvClient {
    async fn get(&self, key: &str) -> TrustResult<Option<String>> {
        let response = self.client.get(self.value_url(key)).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(TrustError::Kv {
                status: status.as_u16(),
                body,
            });
        }
        if is_absent(&body) {
            return Ok(None);
        }

        Ok(Some(body.trim().to_string()))
    }

    async fn put(&self, key: &str, value: &str) -> TrustResult<()> {
        let response = self
            .client
            .put(self.value_url(key))
            .body(value.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TrustError::Kv {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    async fn ping(&self) -> TrustResult<()> {
        let response = self.client.get(self.value_url(HEARTBEAT_KEY)).send().await?;
        let status = response.status();
        debug!(status = status.as_u16(), "KV heartbeat");

        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(TrustError::Kv {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_sentinels() {
        assert!(is_absent(""));
        assert!(is_absent("  \n"));
        assert!(is_absent("Not Found"));
        assert!(!is_absent("eyJhbGciOiJIUzI1NiJ9.e30.sig"));
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let client = HttpKvClient::new("https://kv.example.com/").unwrap();
        assert_eq!(client.value_url("abc"), "https://kv.example.com/values/abc");
    }
}
