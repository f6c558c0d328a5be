//! Cluster and worker membership for the SBX control plane.
//!
//! A [`pool::ClusterPool`] converges on the database's active-cluster rows;
//! each [`cluster::Cluster`] in turn converges its worker instances on what
//! the cluster gateway's service discovery advertises. Both loops run on the
//! same generic [`reconcile::Reconciler`] so the in-memory fleet view tracks
//! ground truth without ever blocking a request path.

pub mod catalog;
pub mod cluster;
pub mod discovery;
pub mod error;
pub mod instance;
pub mod pool;
pub mod reconcile;
pub mod resources;
pub mod rpc;

pub use catalog::{ClusterCatalog, ClusterRecord, PgClusterCatalog, LOCAL_CLUSTER_ID};
pub use cluster::{Cluster, ClusterConfig, InstancePool};
pub use discovery::{DiscoveredInstance, HttpServiceDiscovery, ServiceDiscovery};
pub use error::FleetError;
pub use instance::{InstanceSnapshot, WorkerInstance};
pub use pool::{ClusterFactory, ClusterPool, StandardClusterFactory};
pub use reconcile::{PoolStore, Reconciler};
pub use resources::{
    BuildLogsQuery, LogEntry, LogsQuery, LocalResources, MetricSample, MetricsQuery,
    RemoteResources, ResourceQueries,
};
pub use rpc::{
    BuildLogChunk, HttpWorkerClient, HttpWorkerClientFactory, MachineInfo, SandboxCreatePayload,
    ServiceInfo, ServiceRole, ServiceStatus, WorkerClient, WorkerClientFactory,
};
