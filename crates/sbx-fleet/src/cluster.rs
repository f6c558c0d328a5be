use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use sbx_store::ShardMap;

use crate::discovery::{DiscoveredInstance, ServiceDiscovery};
use crate::error::FleetError;
use crate::instance::WorkerInstance;
use crate::reconcile::{PoolStore, Reconciler};
use crate::resources::ResourceQueries;
use crate::rpc::{ServiceStatus, WorkerClientFactory};

/// Static description of one cluster, local or remote.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub id: Uuid,
    pub endpoint: String,
    pub endpoint_tls: bool,
    pub secret: String,
    pub sandbox_proxy_domain: Option<String>,
}

/// Map of `node_id → WorkerInstance` kept converged against service
/// discovery by the cluster's reconciliation loop.
pub struct InstancePool {
    discovery: Arc<dyn ServiceDiscovery>,
    clients: Arc<dyn WorkerClientFactory>,
    instances: ShardMap<WorkerInstance>,
}

impl InstancePool {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        clients: Arc<dyn WorkerClientFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            clients,
            instances: ShardMap::new(),
        })
    }

    pub fn get(&self, node_id: &str) -> Option<WorkerInstance> {
        self.instances.get(node_id)
    }

    pub fn instances(&self) -> Vec<WorkerInstance> {
        self.instances
            .snapshot()
            .into_iter()
            .map(|(_, instance)| instance)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[async_trait]
impl PoolStore for InstancePool {
    type Source = DiscoveredInstance;
    type Item = WorkerInstance;

    async fn source_list(&self) -> anyhow::Result<Vec<DiscoveredInstance>> {
        self.discovery.list_orchestrators().await
    }

    fn source_contains(&self, source: &[DiscoveredInstance], item: &WorkerInstance) -> bool {
        source
            .iter()
            .any(|discovered| discovered.unique_identifier == item.unique_identifier())
    }

    fn pool_list(&self) -> Vec<WorkerInstance> {
        self.instances()
    }

    fn pool_contains(&self, source: &DiscoveredInstance) -> bool {
        self.instances
            .get(&source.node_id)
            .map_or(false, |instance| {
                instance.unique_identifier() == source.unique_identifier
            })
    }

    async fn pool_insert(&self, source: DiscoveredInstance) {
        let client = match self.clients.client(&source.instance_id) {
            Ok(client) => client,
            Err(error) => {
                warn!(node_id = %source.node_id, %error, "failed to build worker client");
                return;
            }
        };
        let instance = WorkerInstance::connect(&source, client).await;
        info!(node_id = %source.node_id, "worker instance joined");
        // a restarted node reuses its node id; the stale member is removed by
        // the reconciliation phase of the same round
        self.instances.insert(source.node_id.clone(), instance);
    }

    async fn pool_update(&self, item: WorkerInstance) {
        item.sync().await;
    }

    async fn pool_remove(&self, item: WorkerInstance) {
        self.instances
            .remove_if(item.node_id(), |current| {
                current.unique_identifier() == item.unique_identifier()
            });
        info!(node_id = %item.node_id(), "worker instance left");
        item.close().await;
    }
}

struct ClusterInner {
    config: ClusterConfig,
    pool: Arc<InstancePool>,
    reconciler: Reconciler<InstancePool>,
    resources: Arc<dyn ResourceQueries>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// One cluster of worker nodes: an instance pool, its reconciliation loop
/// against service discovery, and the resource facade answering metric/log
/// queries for sandboxes placed here.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        pool: Arc<InstancePool>,
        resources: Arc<dyn ResourceQueries>,
    ) -> Self {
        let reconciler = Reconciler::new(Arc::clone(&pool));
        Self {
            inner: Arc::new(ClusterInner {
                config,
                pool,
                reconciler,
                resources,
                loop_handle: Mutex::new(None),
            }),
        }
    }

    /// Spawns the instance reconciliation loop, discovering workers
    /// immediately.
    pub fn start(&self, interval: Duration, round_timeout: Duration) {
        let handle = self.inner.reconciler.start(interval, round_timeout, true);
        *self.inner.loop_handle.lock() = Some(handle);
    }

    pub fn id(&self) -> Uuid {
        self.inner.config.id
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.config.endpoint
    }

    pub fn sandbox_proxy_domain(&self) -> Option<&str> {
        self.inner.config.sandbox_proxy_domain.as_deref()
    }

    pub fn resources(&self) -> &Arc<dyn ResourceQueries> {
        &self.inner.resources
    }

    pub fn instances(&self) -> Vec<WorkerInstance> {
        self.inner.pool.instances()
    }

    pub fn instance_by_node_id(&self, node_id: &str) -> Option<WorkerInstance> {
        self.inner.pool.get(node_id)
    }

    /// A healthy template builder picked uniformly at random, so repeated
    /// builds spread across the builder fleet.
    pub fn available_template_builder(&self) -> Result<WorkerInstance, FleetError> {
        let mut candidates = self.instances();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .find(|instance| instance.status() == ServiceStatus::Healthy && instance.is_builder())
            .ok_or(FleetError::NoTemplateBuilder(self.id()))
    }

    /// Every instance carrying the orchestrator role, healthy or not.
    pub fn orchestrators(&self) -> Vec<WorkerInstance> {
        self.instances()
            .into_iter()
            .filter(WorkerInstance::is_orchestrator)
            .collect()
    }

    /// Exact builder lookup used for build log streaming.
    pub fn template_builder_by_node_id(
        &self,
        node_id: &str,
    ) -> Result<WorkerInstance, FleetError> {
        self.inner
            .pool
            .get(node_id)
            .filter(|instance| {
                instance.status() == ServiceStatus::Healthy && instance.is_builder()
            })
            .ok_or_else(|| FleetError::TemplateBuilderNotFound {
                node_id: node_id.to_string(),
            })
    }

    /// Stops the reconciliation loop, then releases every instance's
    /// connection.
    pub async fn close(&self) {
        self.inner.reconciler.close();
        let handle = self.inner.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for instance in self.instances() {
            instance.close().await;
        }
        info!(cluster_id = %self.id(), "cluster closed");
    }

    #[cfg(test)]
    pub(crate) async fn sync_instances_once(&self) -> anyhow::Result<()> {
        self.inner.reconciler.sync_once(Duration::from_secs(1)).await
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("instances", &self.inner.pool.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::instance::test_support::{discovered, healthy_info, ScriptedWorker};
    use crate::resources::test_support::NullResources;
    use crate::rpc::{ServiceInfo, ServiceRole, WorkerClient};

    struct FakeDiscovery {
        instances: PlMutex<Vec<DiscoveredInstance>>,
    }

    impl FakeDiscovery {
        fn new(instances: Vec<DiscoveredInstance>) -> Arc<Self> {
            Arc::new(Self {
                instances: PlMutex::new(instances),
            })
        }
    }

    #[async_trait]
    impl ServiceDiscovery for FakeDiscovery {
        async fn list_orchestrators(&self) -> Result<Vec<DiscoveredInstance>> {
            Ok(self.instances.lock().clone())
        }
    }

    struct FakeFactory {
        info: ServiceInfo,
    }

    impl WorkerClientFactory for FakeFactory {
        fn client(&self, _instance_id: &str) -> Result<Arc<dyn WorkerClient>> {
            // every sync repeats the same report
            Ok(ScriptedWorker::new(vec![
                Ok(self.info.clone()),
                Ok(self.info.clone()),
                Ok(self.info.clone()),
            ]))
        }
    }

    fn cluster_config() -> ClusterConfig {
        ClusterConfig {
            id: Uuid::new_v4(),
            endpoint: "gateway.example.com:8443".to_string(),
            endpoint_tls: true,
            secret: "secret".to_string(),
            sandbox_proxy_domain: None,
        }
    }

    fn cluster_with(
        discovery: Arc<dyn ServiceDiscovery>,
        factory: Arc<dyn WorkerClientFactory>,
    ) -> Cluster {
        let pool = InstancePool::new(discovery, factory);
        Cluster::new(cluster_config(), pool, Arc::new(NullResources))
    }

    #[tokio::test]
    async fn discovery_populates_the_pool() {
        let discovery = FakeDiscovery::new(vec![discovered("node-1"), discovered("node-2")]);
        let factory = Arc::new(FakeFactory {
            info: healthy_info(vec![ServiceRole::Orchestrator]),
        });
        let cluster = cluster_with(discovery, factory);

        cluster.sync_instances_once().await.unwrap();
        assert_eq!(cluster.instances().len(), 2);
        assert_eq!(cluster.orchestrators().len(), 2);
    }

    #[tokio::test]
    async fn vanished_instance_is_removed_and_closed() {
        let discovery = FakeDiscovery::new(vec![discovered("node-1"), discovered("node-2")]);
        let factory = Arc::new(FakeFactory {
            info: healthy_info(vec![ServiceRole::Orchestrator]),
        });
        let cluster = cluster_with(discovery.clone(), factory);

        cluster.sync_instances_once().await.unwrap();
        assert_eq!(cluster.instances().len(), 2);

        *discovery.instances.lock() = vec![discovered("node-1")];
        cluster.sync_instances_once().await.unwrap();

        assert_eq!(cluster.instances().len(), 1);
        assert!(cluster.instance_by_node_id("node-2").is_none());
    }

    #[tokio::test]
    async fn template_builder_selection_skips_plain_orchestrators() {
        let discovery = FakeDiscovery::new(vec![discovered("node-1")]);
        let factory = Arc::new(FakeFactory {
            info: healthy_info(vec![ServiceRole::Orchestrator]),
        });
        let cluster = cluster_with(discovery, factory);
        cluster.sync_instances_once().await.unwrap();

        assert!(matches!(
            cluster.available_template_builder(),
            Err(FleetError::NoTemplateBuilder(_))
        ));
        assert!(matches!(
            cluster.template_builder_by_node_id("node-1"),
            Err(FleetError::TemplateBuilderNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn template_builder_selection_finds_builders() {
        let discovery = FakeDiscovery::new(vec![discovered("node-1")]);
        let factory = Arc::new(FakeFactory {
            info: healthy_info(vec![ServiceRole::Orchestrator, ServiceRole::TemplateBuilder]),
        });
        let cluster = cluster_with(discovery, factory);
        cluster.sync_instances_once().await.unwrap();

        let builder = cluster.available_template_builder().unwrap();
        assert_eq!(builder.node_id(), "node-1");
        assert!(cluster.template_builder_by_node_id("node-1").is_ok());
    }
}
