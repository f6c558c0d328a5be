use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

/// Metadata header carrying the shared cluster secret.
pub const CLUSTER_SECRET_HEADER: &str = "x-sbx-cluster-secret";
/// Metadata header routing a proxied call to one service instance.
pub const INSTANCE_ID_HEADER: &str = "x-sbx-instance-id";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceRole {
    Orchestrator,
    TemplateBuilder,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineInfo {
    pub hostname: String,
    pub cpu_count: u32,
    pub memory_mb: u64,
}

/// Snapshot a worker reports about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInfo {
    pub service_id: String,
    pub status: ServiceStatus,
    pub roles: Vec<ServiceRole>,
    pub version: String,
    pub commit: String,
    pub machine_info: MachineInfo,
}

/// Parameters the control plane sends when placing a sandbox on a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxCreatePayload {
    pub sandbox_id: String,
    pub template_id: String,
    pub build_id: String,
    pub envd_access_token: String,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub allow_internet_access: bool,
    pub end_time: DateTime<Utc>,
}

/// One chunk of a template build's live log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildLogChunk {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Unary worker API. One client per discovered instance; calls travel through
/// the cluster gateway, which routes on the instance id header.
#[async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// Health/role snapshot refresh.
    async fn service_info(&self) -> Result<ServiceInfo>;
    /// Places a sandbox on the worker.
    async fn create_sandbox(&self, payload: SandboxCreatePayload) -> Result<()>;
    /// Tears a sandbox down; `pause` keeps its filesystem for a later resume.
    async fn remove_sandbox(&self, sandbox_id: &str, pause: bool) -> Result<()>;
    /// Live logs of an in-flight template build held in the builder's memory.
    async fn build_logs(&self, build_id: &str, offset: u32) -> Result<Vec<BuildLogChunk>>;
    /// Releases the underlying connection. Stateless clients need nothing.
    async fn close(&self) {}
}

/// Builds one client per discovered worker; tests substitute fakes here.
pub trait WorkerClientFactory: Send + Sync + 'static {
    fn client(&self, instance_id: &str) -> Result<Arc<dyn WorkerClient>>;
}

fn auth_headers(secret: &str, instance_id: Option<&str>) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(
        CLUSTER_SECRET_HEADER,
        HeaderValue::from_str(secret).context("cluster secret is not header-safe")?,
    );
    if let Some(instance_id) = instance_id {
        headers.insert(
            INSTANCE_ID_HEADER,
            HeaderValue::from_str(instance_id).context("instance id is not header-safe")?,
        );
    }
    Ok(headers)
}

pub(crate) fn authed_http(secret: &str, tls: bool, instance_id: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .default_headers(auth_headers(secret, instance_id)?)
        .timeout(REQUEST_TIMEOUT);
    if tls {
        builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_2);
    }
    builder.build().context("building authenticated HTTP client")
}

pub(crate) fn base_url(endpoint: &str, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    format!("{scheme}://{endpoint}")
}

/// Gateway-proxied worker client.
pub struct HttpWorkerClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpWorkerClient {
    pub fn connect(endpoint: &str, tls: bool, secret: &str, instance_id: &str) -> Result<Self> {
        Ok(Self {
            http: authed_http(secret, tls, Some(instance_id))?,
            base_url: base_url(endpoint, tls),
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn service_info(&self) -> Result<ServiceInfo> {
        let url = format!("{}/v1/service-info", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("service info request failed")?
            .error_for_status()
            .context("service info request rejected")?;
        response.json().await.context("decoding service info")
    }

    async fn create_sandbox(&self, payload: SandboxCreatePayload) -> Result<()> {
        let url = format!("{}/v1/sandboxes", self.base_url);
        self.http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .context("sandbox create request failed")?
            .error_for_status()
            .context("sandbox create rejected")?;
        Ok(())
    }

    async fn remove_sandbox(&self, sandbox_id: &str, pause: bool) -> Result<()> {
        let url = format!("{}/v1/sandboxes/{sandbox_id}", self.base_url);
        self.http
            .delete(&url)
            .query(&[("pause", pause)])
            .send()
            .await
            .context("sandbox remove request failed")?
            .error_for_status()
            .context("sandbox remove rejected")?;
        Ok(())
    }

    async fn build_logs(&self, build_id: &str, offset: u32) -> Result<Vec<BuildLogChunk>> {
        let url = format!("{}/v1/template-builds/{build_id}/logs", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("offset", offset)])
            .send()
            .await
            .context("build log request failed")?
            .error_for_status()
            .context("build log request rejected")?;
        response.json().await.context("decoding build logs")
    }
}

/// Cluster-scoped factory: every client shares the gateway endpoint and
/// secret, differing only in the routed instance id.
pub struct HttpWorkerClientFactory {
    pub endpoint: String,
    pub tls: bool,
    pub secret: String,
}

impl WorkerClientFactory for HttpWorkerClientFactory {
    fn client(&self, instance_id: &str) -> Result<Arc<dyn WorkerClient>> {
        Ok(Arc::new(HttpWorkerClient::connect(
            &self.endpoint,
            self.tls,
            &self.secret,
            instance_id,
        )?))
    }
}
