use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::rpc::{authed_http, base_url};

const DISCOVERY_PATH: &str = "/v1/service-discovery/orchestrators";

/// A worker instance as advertised by a cluster gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredInstance {
    pub unique_identifier: String,
    pub node_id: String,
    pub instance_id: String,
    pub version: String,
    pub commit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_domain: Option<String>,
}

/// Lists the worker instances a cluster currently advertises.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync + 'static {
    async fn list_orchestrators(&self) -> Result<Vec<DiscoveredInstance>>;
}

pub struct HttpServiceDiscovery {
    http: reqwest::Client,
    url: String,
}

impl HttpServiceDiscovery {
    pub fn new(endpoint: &str, tls: bool, secret: &str) -> Result<Self> {
        Ok(Self {
            http: authed_http(secret, tls, None)?,
            url: format!("{}{DISCOVERY_PATH}", base_url(endpoint, tls)),
        })
    }
}

#[async_trait]
impl ServiceDiscovery for HttpServiceDiscovery {
    async fn list_orchestrators(&self) -> Result<Vec<DiscoveredInstance>> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .context("service discovery request failed")?
            .error_for_status()
            .context("service discovery request rejected")?;
        response.json().await.context("decoding discovered instances")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_instance_decodes_wire_shape() {
        let payload = r#"[
            {
                "uniqueIdentifier": "uid-1",
                "nodeId": "node-1",
                "instanceId": "inst-1",
                "version": "0.4.2",
                "commit": "abc123",
                "sandboxDomain": "sb.example.com"
            },
            {
                "uniqueIdentifier": "uid-2",
                "nodeId": "node-2",
                "instanceId": "inst-2",
                "version": "0.4.2",
                "commit": "abc123"
            }
        ]"#;

        let instances: Vec<DiscoveredInstance> = serde_json::from_str(payload).unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].sandbox_domain.as_deref(), Some("sb.example.com"));
        assert!(instances[1].sandbox_domain.is_none());
    }
}
