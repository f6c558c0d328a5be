use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use sbx_store::ShardMap;

use crate::catalog::{ClusterCatalog, ClusterRecord, LOCAL_CLUSTER_ID};
use crate::cluster::{Cluster, ClusterConfig, InstancePool};
use crate::discovery::HttpServiceDiscovery;
use crate::reconcile::{PoolStore, Reconciler};
use crate::resources::{LocalResources, RemoteResources, ResourceQueries};
use crate::rpc::HttpWorkerClientFactory;

/// Builds a concrete [`Cluster`] for a catalog record at pool-insert time.
/// The local sentinel record and remote records get different resource
/// facades behind the same interface.
pub trait ClusterFactory: Send + Sync + 'static {
    fn build(&self, record: &ClusterRecord) -> anyhow::Result<Cluster>;
}

/// Production factory wiring HTTP discovery, gateway-proxied worker clients,
/// and the local/remote resource facades.
pub struct StandardClusterFactory {
    pub warehouse_url: String,
    pub log_store_url: String,
    pub instance_sync_interval: Duration,
    pub round_timeout: Duration,
}

impl ClusterFactory for StandardClusterFactory {
    fn build(&self, record: &ClusterRecord) -> anyhow::Result<Cluster> {
        let discovery = Arc::new(HttpServiceDiscovery::new(
            &record.endpoint,
            record.endpoint_tls,
            &record.token,
        )?);
        let clients = Arc::new(HttpWorkerClientFactory {
            endpoint: record.endpoint.clone(),
            tls: record.endpoint_tls,
            secret: record.token.clone(),
        });
        let pool = InstancePool::new(discovery, clients);

        let resources: Arc<dyn ResourceQueries> = if record.id == LOCAL_CLUSTER_ID {
            Arc::new(LocalResources::new(
                self.warehouse_url.clone(),
                self.log_store_url.clone(),
                Arc::clone(&pool),
            )?)
        } else {
            Arc::new(RemoteResources::new(
                &record.endpoint,
                record.endpoint_tls,
                &record.token,
            )?)
        };

        let cluster = Cluster::new(
            ClusterConfig {
                id: record.id,
                endpoint: record.endpoint.clone(),
                endpoint_tls: record.endpoint_tls,
                secret: record.token.clone(),
                sandbox_proxy_domain: record.sandbox_proxy_domain.clone(),
            },
            pool,
            resources,
        );
        cluster.start(self.instance_sync_interval, self.round_timeout);
        Ok(cluster)
    }
}

/// Cluster membership pool reconciled from the database catalog, plus an
/// optional statically configured local cluster.
pub(crate) struct ClusterPoolStore {
    catalog: Option<Arc<dyn ClusterCatalog>>,
    local: Option<ClusterRecord>,
    factory: Arc<dyn ClusterFactory>,
    clusters: ShardMap<Cluster>,
}

#[async_trait]
impl PoolStore for ClusterPoolStore {
    type Source = ClusterRecord;
    type Item = Cluster;

    async fn source_list(&self) -> anyhow::Result<Vec<ClusterRecord>> {
        let mut records = match &self.catalog {
            Some(catalog) => catalog.active_clusters().await?,
            None => Vec::new(),
        };
        if let Some(local) = &self.local {
            if !records.iter().any(|record| record.id == local.id) {
                records.push(local.clone());
            }
        }
        Ok(records)
    }

    fn source_contains(&self, source: &[ClusterRecord], item: &Cluster) -> bool {
        source.iter().any(|record| record.id == item.id())
    }

    fn pool_list(&self) -> Vec<Cluster> {
        self.clusters
            .snapshot()
            .into_iter()
            .map(|(_, cluster)| cluster)
            .collect()
    }

    fn pool_contains(&self, source: &ClusterRecord) -> bool {
        self.clusters.contains(&source.id.to_string())
    }

    async fn pool_insert(&self, record: ClusterRecord) {
        match self.factory.build(&record) {
            Ok(cluster) => {
                info!(cluster_id = %record.id, endpoint = %record.endpoint, "cluster joined");
                self.clusters.insert(record.id.to_string(), cluster);
            }
            Err(error) => {
                warn!(cluster_id = %record.id, %error, "failed to build cluster");
            }
        }
    }

    async fn pool_update(&self, _item: Cluster) {
        // each cluster refreshes its own instances; membership rows carry no
        // mutable state to pull here
    }

    async fn pool_remove(&self, item: Cluster) {
        self.clusters.remove(&item.id().to_string());
        item.close().await;
    }
}

/// The set of clusters the control plane can place sandboxes on.
pub struct ClusterPool {
    store: Arc<ClusterPoolStore>,
    reconciler: Reconciler<ClusterPoolStore>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterPool {
    pub fn new(
        catalog: Option<Arc<dyn ClusterCatalog>>,
        local: Option<ClusterRecord>,
        factory: Arc<dyn ClusterFactory>,
    ) -> Self {
        let store = Arc::new(ClusterPoolStore {
            catalog,
            local,
            factory,
            clusters: ShardMap::new(),
        });
        let reconciler = Reconciler::new(Arc::clone(&store));
        Self {
            store,
            reconciler,
            loop_handle: Mutex::new(None),
        }
    }

    /// Spawns the membership loop, populating the pool immediately.
    pub fn start(&self, interval: Duration, round_timeout: Duration) {
        let handle = self.reconciler.start(interval, round_timeout, true);
        *self.loop_handle.lock() = Some(handle);
    }

    /// One synchronous membership round; used at startup so placement has
    /// clusters before the first request arrives.
    pub async fn sync_once(&self, round_timeout: Duration) -> anyhow::Result<()> {
        self.reconciler.sync_once(round_timeout).await
    }

    pub fn get(&self, cluster_id: Uuid) -> Option<Cluster> {
        self.store.clusters.get(&cluster_id.to_string())
    }

    pub fn clusters(&self) -> Vec<Cluster> {
        self.store.pool_list()
    }

    pub fn len(&self) -> usize {
        self.store.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.clusters.is_empty()
    }

    /// Stops the membership loop, then closes every cluster gracefully.
    pub async fn close(&self) {
        self.reconciler.close();
        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for cluster in self.clusters() {
            self.store.clusters.remove(&cluster.id().to_string());
            cluster.close().await;
        }
    }
}
