use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sbx_fleet::{ClusterPool, SandboxCreatePayload};
use sbx_store::{RemoveAction, Removal, Sandbox, SandboxRemover, ShardMap, StoreHooks};

/// Placement the sibling proxy needs to route traffic for one sandbox.
#[derive(Debug, Clone)]
pub struct Route {
    pub node_id: String,
    pub cluster_id: Uuid,
}

/// In-memory routing table. Fed synchronously on insert so a sandbox is
/// routable before its creation call returns; drained when the record is
/// torn down.
pub struct RoutingTable {
    routes: ShardMap<Route>,
}

impl RoutingTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            routes: ShardMap::new(),
        })
    }

    pub fn insert(&self, sandbox: &Sandbox) {
        self.routes.insert(
            sandbox.sandbox_id().to_string(),
            Route {
                node_id: sandbox.node_id().to_string(),
                cluster_id: sandbox.cluster_id(),
            },
        );
    }

    pub fn remove(&self, sandbox_id: &str) {
        self.routes.remove(sandbox_id);
    }

    pub fn lookup(&self, sandbox_id: &str) -> Option<Route> {
        self.routes.get(sandbox_id)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Store insert callbacks: routing first (inline), then background
/// bookkeeping.
pub struct ControlPlaneHooks {
    routes: Arc<RoutingTable>,
}

impl ControlPlaneHooks {
    pub fn new(routes: Arc<RoutingTable>) -> Arc<Self> {
        Arc::new(Self { routes })
    }
}

#[async_trait]
impl StoreHooks for ControlPlaneHooks {
    fn on_insert(&self, sandbox: &Sandbox) {
        self.routes.insert(sandbox);
        debug!(
            sandbox_id = %sandbox.sandbox_id(),
            node_id = %sandbox.node_id(),
            "sandbox routed"
        );
    }

    async fn on_insert_background(&self, sandbox: Sandbox) {
        debug!(
            sandbox_id = %sandbox.sandbox_id(),
            team_id = %sandbox.team_id(),
            routes = self.routes.len(),
            "sandbox counted"
        );
    }

    async fn on_created(&self, sandbox: Sandbox) {
        info!(
            sandbox_id = %sandbox.sandbox_id(),
            team_id = %sandbox.team_id(),
            template_id = %sandbox.spec().template_id,
            vcpu = sandbox.spec().vcpu,
            ram_mb = sandbox.spec().ram_mb,
            "sandbox created"
        );
    }
}

/// Issues the teardown call to the worker that runs `sandbox`.
pub async fn remove_on_node(
    pool: &ClusterPool,
    sandbox: &Sandbox,
    action: RemoveAction,
) -> Result<()> {
    let cluster = pool
        .get(sandbox.cluster_id())
        .ok_or_else(|| anyhow!("cluster {} is not in the pool", sandbox.cluster_id()))?;
    let instance = cluster
        .instance_by_node_id(sandbox.node_id())
        .ok_or_else(|| {
            anyhow!(
                "node {} is not in cluster {}",
                sandbox.node_id(),
                sandbox.cluster_id()
            )
        })?;
    instance
        .client()
        .remove_sandbox(sandbox.sandbox_id(), action == RemoveAction::Pause)
        .await
}

pub fn create_payload(sandbox: &Sandbox) -> SandboxCreatePayload {
    let spec = sandbox.spec();
    SandboxCreatePayload {
        sandbox_id: spec.sandbox_id.clone(),
        template_id: spec.template_id.clone(),
        build_id: spec.build_id.clone(),
        envd_access_token: spec.envd_access_token.clone(),
        vcpu: spec.vcpu,
        ram_mb: spec.ram_mb,
        disk_mb: spec.disk_mb,
        allow_internet_access: spec.allow_internet_access,
        end_time: sandbox.end_time(),
    }
}

/// Eviction callback: expired sandboxes leave through the same transition
/// gate request paths use. Auto-pause sandboxes are paused so they can be
/// resumed later; everything else is killed.
pub struct FleetRemover {
    pool: Arc<ClusterPool>,
    routes: Arc<RoutingTable>,
}

impl FleetRemover {
    pub fn new(pool: Arc<ClusterPool>, routes: Arc<RoutingTable>) -> Arc<Self> {
        Arc::new(Self { pool, routes })
    }
}

#[async_trait]
impl SandboxRemover for FleetRemover {
    async fn remove(&self, sandbox: Sandbox) {
        let action = if sandbox.spec().auto_pause {
            RemoveAction::Pause
        } else {
            RemoveAction::Kill
        };

        let cancel = CancellationToken::new();
        match sandbox.start_removing(&cancel, action).await {
            Ok(Removal::Started(handle)) => {
                let result = remove_on_node(&self.pool, &sandbox, action).await;
                if let Err(error) = &result {
                    warn!(
                        sandbox_id = %sandbox.sandbox_id(),
                        %error,
                        "eviction teardown failed"
                    );
                }
                handle.finish(result);
            }
            Ok(Removal::AlreadyDone) => {
                debug!(
                    sandbox_id = %sandbox.sandbox_id(),
                    "sandbox already removed by a request path"
                );
            }
            Err(error) => {
                warn!(sandbox_id = %sandbox.sandbox_id(), %error, "eviction transition rejected");
            }
        }

        self.routes.remove(sandbox.sandbox_id());
    }
}
