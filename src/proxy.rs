//! Reverse-proxy route publishing
//!
//! A running service with a proxy rule gets a route in the reverse proxy;
//! stopping it withdraws the route. Route ids are derived from the match
//! rule so publishing the same rule twice targets the same route.

use crate::error::{HotifyError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, info};

/// Publishes named routes into a reverse proxy
#[async_trait]
pub trait ProxyPublisher: Send + Sync {
    async fn add_route(&self, id: &str, match_rule: &str, upstream: &str) -> Result<()>;
    async fn delete_route(&self, id: &str) -> Result<()>;
    async fn route_exists(&self, id: &str) -> bool;
}

/// Deterministic route id for a match rule
pub fn route_id(match_rule: &str) -> String {
    let digest = Sha256::digest(match_rule.as_bytes());
    format!("hotify-{}", &hex::encode(digest)[..16])
}

/// A published route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub match_rule: String,
    pub upstream: String,
}

/// In-process route table, used when no proxy backend is configured
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Route> {
        self.routes.get(id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[async_trait]
impl ProxyPublisher for RouteTable {
    async fn add_route(&self, id: &str, match_rule: &str, upstream: &str) -> Result<()> {
        debug!(id, match_rule, upstream, "Route added");
        self.routes.insert(
            id.to_string(),
            Route {
                match_rule: match_rule.to_string(),
                upstream: upstream.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_route(&self, id: &str) -> Result<()> {
        debug!(id, "Route removed");
        self.routes.remove(id);
        Ok(())
    }

    async fn route_exists(&self, id: &str) -> bool {
        self.routes.contains_key(id)
    }
}

/// Publishes routes through the Caddy admin API
pub struct CaddyPublisher {
    admin_url: String,
    server: String,
    client: reqwest::Client,
}

impl CaddyPublisher {
    pub fn new(admin_url: &str, server: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HotifyError::Proxy(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            admin_url: admin_url.trim_end_matches('/').to_string(),
            server: server.to_string(),
            client,
        })
    }

    fn object_url(&self, id: &str) -> String {
        format!("{}/id/{}", self.admin_url, id)
    }

    fn routes_url(&self) -> String {
        format!(
            "{}/config/apps/http/servers/{}/routes",
            self.admin_url, self.server
        )
    }
}

/// Caddy JSON for a host-matched reverse-proxy route
pub fn caddy_route(id: &str, match_rule: &str, upstream: &str) -> serde_json::Value {
    serde_json::json!({
        "@id": id,
        "match": [{ "host": [match_rule] }],
        "handle": [{
            "handler": "reverse_proxy",
            "upstreams": [{ "dial": upstream }]
        }],
        "terminal": true
    })
}

#[async_trait]
impl ProxyPublisher for CaddyPublisher {
    async fn add_route(&self, id: &str, match_rule: &str, upstream: &str) -> Result<()> {
        let response = self
            .client
            .post(self.routes_url())
            .json(&caddy_route(id, match_rule, upstream))
            .send()
            .await
            .map_err(|e| HotifyError::Proxy(format!("failed to reach Caddy: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(HotifyError::Proxy(format!("Caddy API error {}: {}", status, text)));
        }

        info!(id, match_rule, upstream, "Caddy route added");
        Ok(())
    }

    async fn delete_route(&self, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.object_url(id))
            .send()
            .await
            .map_err(|e| HotifyError::Proxy(format!("failed to reach Caddy: {}", e)))?;

        let status = response.status();
        if !status.is_success() && status != reqwest::StatusCode::NOT_FOUND {
            let text = response.text().await.unwrap_or_default();
            return Err(HotifyError::Proxy(format!("Caddy API error {}: {}", status, text)));
        }

        info!(id, "Caddy route removed");
        Ok(())
    }

    async fn route_exists(&self, id: &str) -> bool {
        match self.client.get(self.object_url(id)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(id, error = %e, "Caddy route lookup failed");
                false
            }
        }
    }
}
