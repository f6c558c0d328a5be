use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use sbx_store::{Sandbox, SandboxSpec};

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    /// Template reference, `namespace/alias:tag`.
    pub template: String,
    pub team_id: Uuid,
    #[serde(default)]
    pub team_slug: Option<String>,
    pub client_id: String,
    /// Explicit placement; omitted means any cluster with capacity.
    #[serde(default)]
    pub cluster_id: Option<Uuid>,
    #[serde(default = "default_vcpu")]
    pub vcpu: u32,
    #[serde(default = "default_ram_mb")]
    pub ram_mb: u64,
    #[serde(default = "default_disk_mb")]
    pub disk_mb: u64,
    #[serde(default)]
    pub auto_pause: bool,
    #[serde(default = "default_true")]
    pub allow_internet_access: bool,
    /// Requested lifetime in seconds; clamped to the instance length limit.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn default_vcpu() -> u32 {
    2
}

fn default_ram_mb() -> u64 {
    512
}

fn default_disk_mb() -> u64 {
    1024
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateSandboxResponse {
    pub sandbox_id: String,
    pub template_id: String,
    pub cluster_id: Uuid,
    pub node_id: String,
    pub envd_access_token: String,
    pub traffic_access_token: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct SandboxSummary {
    pub sandbox_id: String,
    pub template_id: String,
    pub team_id: Uuid,
    pub client_id: String,
    pub node_id: String,
    pub cluster_id: Uuid,
    pub state: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    pub metadata: HashMap<String, String>,
}

impl From<&Sandbox> for SandboxSummary {
    fn from(sandbox: &Sandbox) -> Self {
        let spec = sandbox.spec();
        Self {
            sandbox_id: spec.sandbox_id.clone(),
            template_id: spec.template_id.clone(),
            team_id: spec.team_id,
            client_id: spec.client_id.clone(),
            node_id: spec.node_id.clone(),
            cluster_id: spec.cluster_id,
            state: sandbox.state().to_string(),
            start_time: sandbox.start_time(),
            end_time: sandbox.end_time(),
            vcpu: spec.vcpu,
            ram_mb: spec.ram_mb,
            disk_mb: spec.disk_mb,
            metadata: spec.metadata.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ExtendTimeoutRequest {
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub allow_shorter: bool,
}

#[derive(Debug, Serialize)]
pub struct ExtendTimeoutResponse {
    pub end_time: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RemovalResponse {
    pub sandbox_id: String,
    pub state: String,
    pub already_done: bool,
}

/// One sandbox as reported by a node's heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxReport {
    pub sandbox_id: String,
    pub template_id: String,
    #[serde(default)]
    pub base_template_id: Option<String>,
    pub build_id: String,
    #[serde(default)]
    pub kernel_version: String,
    #[serde(default)]
    pub firecracker_version: String,
    #[serde(default)]
    pub envd_version: String,
    pub team_id: Uuid,
    pub client_id: String,
    pub cluster_id: Uuid,
    pub vcpu: u32,
    pub ram_mb: u64,
    pub disk_mb: u64,
    #[serde(default)]
    pub auto_pause: bool,
    #[serde(default = "default_true")]
    pub allow_internet_access: bool,
    pub max_instance_length_seconds: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SandboxReport {
    /// Rehydrates a store record. Reported sandboxes carry no tokens; the
    /// seeds derive them again if a caller ever needs them.
    pub fn into_sandbox(self, node_id: &str) -> Sandbox {
        let base_template_id = self
            .base_template_id
            .unwrap_or_else(|| self.template_id.clone());
        Sandbox::running(
            SandboxSpec {
                sandbox_id: self.sandbox_id,
                template_id: self.template_id,
                base_template_id,
                build_id: self.build_id,
                kernel_version: self.kernel_version,
                firecracker_version: self.firecracker_version,
                envd_version: self.envd_version,
                node_id: node_id.to_string(),
                cluster_id: self.cluster_id,
                team_id: self.team_id,
                client_id: self.client_id,
                envd_access_token: String::new(),
                traffic_access_token: String::new(),
                vcpu: self.vcpu,
                ram_mb: self.ram_mb,
                disk_mb: self.disk_mb,
                auto_pause: self.auto_pause,
                allow_internet_access: self.allow_internet_access,
                max_instance_length: chrono::Duration::seconds(self.max_instance_length_seconds),
                metadata: self.metadata,
            },
            self.start_time,
            self.end_time,
        )
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
