use thiserror::Error;
use uuid::Uuid;

/// Error kinds surfaced by cluster and instance selection.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("cluster {0} not found")]
    ClusterNotFound(Uuid),
    #[error("no template builder available in cluster {0}")]
    NoTemplateBuilder(Uuid),
    #[error("no healthy orchestrator available in cluster {0}")]
    NoOrchestrator(Uuid),
    #[error("template builder {node_id} not found")]
    TemplateBuilderNotFound { node_id: String },
}
