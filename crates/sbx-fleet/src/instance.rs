use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::discovery::DiscoveredInstance;
use crate::rpc::{MachineInfo, ServiceRole, ServiceStatus, WorkerClient};

/// Consecutive sync failures tolerated before demotion to Unhealthy.
const MAX_SYNC_FAILURES: u32 = 3;

/// Health/role snapshot refreshed on every sync.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub status: ServiceStatus,
    pub roles: Vec<ServiceRole>,
    pub version: String,
    pub commit: String,
    pub machine_info: MachineInfo,
}

struct InstanceInner {
    unique_identifier: String,
    node_id: String,
    instance_id: String,
    client: Arc<dyn WorkerClient>,
    snapshot: RwLock<InstanceSnapshot>,
    sync_failures: AtomicU32,
    // role flags cached outside the snapshot lock for hot-path selection
    is_builder: AtomicBool,
    is_orchestrator: AtomicBool,
}

/// One worker node process in a cluster's pool. Cloning shares the record.
#[derive(Clone)]
pub struct WorkerInstance {
    inner: Arc<InstanceInner>,
}

impl WorkerInstance {
    /// Wraps a freshly discovered worker and performs the initial sync. The
    /// instance starts Unhealthy and earns Healthy from its first report.
    pub async fn connect(discovered: &DiscoveredInstance, client: Arc<dyn WorkerClient>) -> Self {
        let instance = Self {
            inner: Arc::new(InstanceInner {
                unique_identifier: discovered.unique_identifier.clone(),
                node_id: discovered.node_id.clone(),
                instance_id: discovered.instance_id.clone(),
                client,
                snapshot: RwLock::new(InstanceSnapshot {
                    status: ServiceStatus::Unhealthy,
                    roles: Vec::new(),
                    version: discovered.version.clone(),
                    commit: discovered.commit.clone(),
                    machine_info: MachineInfo::default(),
                }),
                sync_failures: AtomicU32::new(0),
                is_builder: AtomicBool::new(false),
                is_orchestrator: AtomicBool::new(false),
            }),
        };
        instance.sync().await;
        instance
    }

    /// Refreshes the snapshot from the worker. Success resets the failure
    /// counter; the third consecutive failure demotes the instance to
    /// Unhealthy until a later sync succeeds again.
    pub async fn sync(&self) {
        match self.inner.client.service_info().await {
            Ok(info) => {
                self.inner.sync_failures.store(0, Ordering::Relaxed);
                self.inner.is_builder.store(
                    info.roles.contains(&ServiceRole::TemplateBuilder),
                    Ordering::Relaxed,
                );
                self.inner.is_orchestrator.store(
                    info.roles.contains(&ServiceRole::Orchestrator),
                    Ordering::Relaxed,
                );
                let mut snapshot = self.inner.snapshot.write();
                snapshot.status = info.status;
                snapshot.roles = info.roles;
                snapshot.version = info.version;
                snapshot.commit = info.commit;
                snapshot.machine_info = info.machine_info;
            }
            Err(error) => {
                let failures = self.inner.sync_failures.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    node_id = %self.inner.node_id,
                    failures,
                    %error,
                    "worker sync failed"
                );
                if failures >= MAX_SYNC_FAILURES {
                    self.inner.snapshot.write().status = ServiceStatus::Unhealthy;
                }
            }
        }
    }

    pub fn unique_identifier(&self) -> &str {
        &self.inner.unique_identifier
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn status(&self) -> ServiceStatus {
        self.inner.snapshot.read().status
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.inner.snapshot.read().clone()
    }

    pub fn is_builder(&self) -> bool {
        self.inner.is_builder.load(Ordering::Relaxed)
    }

    pub fn is_orchestrator(&self) -> bool {
        self.inner.is_orchestrator.load(Ordering::Relaxed)
    }

    pub fn client(&self) -> &Arc<dyn WorkerClient> {
        &self.inner.client
    }

    pub async fn close(&self) {
        self.inner.client.close().await;
    }
}

impl std::fmt::Debug for WorkerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerInstance")
            .field("node_id", &self.inner.node_id)
            .field("unique_identifier", &self.inner.unique_identifier)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::rpc::{BuildLogChunk, SandboxCreatePayload, ServiceInfo};

    /// Scriptable worker: each sync pops the next canned response.
    pub struct ScriptedWorker {
        responses: Mutex<Vec<Result<ServiceInfo>>>,
        pub closed: Mutex<bool>,
    }

    impl ScriptedWorker {
        pub fn new(responses: Vec<Result<ServiceInfo>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses),
                closed: Mutex::new(false),
            })
        }
    }

    pub fn healthy_info(roles: Vec<ServiceRole>) -> ServiceInfo {
        ServiceInfo {
            service_id: "svc-1".to_string(),
            status: ServiceStatus::Healthy,
            roles,
            version: "0.4.2".to_string(),
            commit: "abc123".to_string(),
            machine_info: MachineInfo::default(),
        }
    }

    pub fn discovered(node_id: &str) -> DiscoveredInstance {
        DiscoveredInstance {
            unique_identifier: format!("uid-{node_id}"),
            node_id: node_id.to_string(),
            instance_id: format!("inst-{node_id}"),
            version: "0.4.2".to_string(),
            commit: "abc123".to_string(),
            sandbox_domain: None,
        }
    }

    #[async_trait]
    impl WorkerClient for ScriptedWorker {
        async fn service_info(&self) -> Result<ServiceInfo> {
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                return Err(anyhow!("no scripted response left"));
            }
            responses.remove(0)
        }

        async fn create_sandbox(&self, _payload: SandboxCreatePayload) -> Result<()> {
            Ok(())
        }

        async fn remove_sandbox(&self, _sandbox_id: &str, _pause: bool) -> Result<()> {
            Ok(())
        }

        async fn build_logs(&self, _build_id: &str, _offset: u32) -> Result<Vec<BuildLogChunk>> {
            Ok(Vec::new())
        }

        async fn close(&self) {
            *self.closed.lock() = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    use super::test_support::{discovered, healthy_info, ScriptedWorker};
    use super::*;

    #[tokio::test]
    async fn initial_sync_promotes_to_healthy() {
        let worker = ScriptedWorker::new(vec![Ok(healthy_info(vec![
            ServiceRole::Orchestrator,
            ServiceRole::TemplateBuilder,
        ]))]);
        let instance = WorkerInstance::connect(&discovered("node-1"), worker).await;

        assert_eq!(instance.status(), ServiceStatus::Healthy);
        assert!(instance.is_builder());
        assert!(instance.is_orchestrator());
    }

    #[tokio::test]
    async fn three_failures_demote_to_unhealthy() {
        let worker = ScriptedWorker::new(vec![
            Ok(healthy_info(vec![ServiceRole::Orchestrator])),
            Err(anyhow!("down")),
            Err(anyhow!("down")),
            Err(anyhow!("down")),
            Ok(healthy_info(vec![ServiceRole::Orchestrator])),
        ]);
        let instance = WorkerInstance::connect(&discovered("node-1"), worker).await;
        assert_eq!(instance.status(), ServiceStatus::Healthy);

        instance.sync().await;
        instance.sync().await;
        assert_eq!(instance.status(), ServiceStatus::Healthy);

        instance.sync().await;
        assert_eq!(instance.status(), ServiceStatus::Unhealthy);

        // the next good report recovers the instance
        instance.sync().await;
        assert_eq!(instance.status(), ServiceStatus::Healthy);
    }

    #[tokio::test]
    async fn role_flags_follow_the_latest_report() {
        let mut builder_only = healthy_info(vec![ServiceRole::TemplateBuilder]);
        builder_only.version = "0.4.3".to_string();
        let worker = ScriptedWorker::new(vec![
            Ok(healthy_info(vec![ServiceRole::Orchestrator])),
            Ok(builder_only),
        ]);
        let instance = WorkerInstance::connect(&discovered("node-1"), worker).await;
        assert!(instance.is_orchestrator());
        assert!(!instance.is_builder());

        instance.sync().await;
        assert!(!instance.is_orchestrator());
        assert!(instance.is_builder());
        assert_eq!(instance.snapshot().version, "0.4.3");
    }
}
