use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rand::seq::SliceRandom;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use sbx_fleet::{
    Cluster, ClusterCatalog, ClusterPool, ClusterRecord, FleetError, PgClusterCatalog,
    ServiceStatus, StandardClusterFactory, WorkerInstance, LOCAL_CLUSTER_ID,
};
use sbx_store::{
    AccessTokenHasher, IdentifierError, RemoveAction, Removal, Sandbox, SandboxSpec, SandboxStore,
    StoreError, TemplateRef,
};

use crate::config::AppConfig;
use crate::lifecycle::{self, ControlPlaneHooks, FleetRemover, RoutingTable};
use crate::models::{
    CreateSandboxRequest, CreateSandboxResponse, ExtendTimeoutRequest, ExtendTimeoutResponse,
    HealthResponse, RemovalResponse, SandboxReport, SandboxSummary,
};

const ADMIN_TOKEN_HEADER: &str = "x-sbx-admin-token";
const DRAIN_PERIOD: Duration = Duration::from_secs(15);
const CLEANUP_BUDGET: Duration = Duration::from_secs(30);
const RECONCILE_ROUND_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(config: AppConfig) -> Result<()> {
    let hasher = Arc::new(AccessTokenHasher::new(&config.token_seed)?);
    let routes = RoutingTable::new();
    let store = SandboxStore::new(ControlPlaneHooks::new(Arc::clone(&routes)));

    let catalog: Option<Arc<dyn ClusterCatalog>> = match &config.postgres_dsn {
        Some(dsn) => Some(Arc::new(
            PgClusterCatalog::connect(dsn)
                .await
                .context("opening cluster catalog")?,
        )),
        None => None,
    };
    let local_record = config.local_cluster.as_ref().map(|local| ClusterRecord {
        id: LOCAL_CLUSTER_ID,
        endpoint: local.endpoint.clone(),
        endpoint_tls: local.tls,
        token: local.token.clone(),
        sandbox_proxy_domain: None,
    });
    let factory = Arc::new(StandardClusterFactory {
        warehouse_url: config.warehouse_url.clone(),
        log_store_url: config.log_store_url.clone(),
        instance_sync_interval: config.instance_sync_interval,
        round_timeout: RECONCILE_ROUND_TIMEOUT,
    });
    let pool = Arc::new(ClusterPool::new(catalog, local_record, factory));
    pool.start(config.cluster_sync_interval, RECONCILE_ROUND_TIMEOUT);

    let shutdown = CancellationToken::new();
    let remover = FleetRemover::new(Arc::clone(&pool), Arc::clone(&routes));
    store.start_eviction(shutdown.child_token(), remover);

    let draining = Arc::new(AtomicBool::new(false));
    let state = Arc::new(AppState {
        store,
        pool: Arc::clone(&pool),
        hasher,
        routes,
        draining: Arc::clone(&draining),
        config: config.clone(),
    });

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "sbx-daemon listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(draining))
        .await
        .context("HTTP server exited")?;

    // cleanup runs on a fixed budget; a hung cluster close is a dirty exit
    shutdown.cancel();
    tokio::time::timeout(CLEANUP_BUDGET, pool.close())
        .await
        .map_err(|_| anyhow!("cluster pool shutdown exceeded its budget"))?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(draining: Arc<AtomicBool>) {
    wait_for_signal().await;
    draining.store(true, Ordering::SeqCst);
    info!(drain_seconds = DRAIN_PERIOD.as_secs(), "draining before shutdown");
    tokio::time::sleep(DRAIN_PERIOD).await;
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(error) => {
                warn!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/api/v1/sandboxes",
            post(create_sandbox).get(list_sandboxes),
        )
        .route("/api/v1/sandboxes/:id", get(get_sandbox).delete(kill_sandbox))
        .route("/api/v1/sandboxes/:id/pause", post(pause_sandbox))
        .route("/api/v1/sandboxes/:id/timeout", post(extend_timeout))
        .route("/api/v1/nodes/:node_id/sync", post(node_sync))
        .with_state(state)
}

struct AppState {
    store: Arc<SandboxStore>,
    pool: Arc<ClusterPool>,
    hasher: Arc<AccessTokenHasher>,
    routes: Arc<RoutingTable>,
    draining: Arc<AtomicBool>,
    config: AppConfig,
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    if state.draining.load(Ordering::SeqCst) {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse { status: "draining" }),
        )
            .into_response()
    } else {
        Json(HealthResponse { status: "ok" }).into_response()
    }
}

async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSandboxRequest>,
) -> Result<Json<CreateSandboxResponse>, ApiError> {
    let template = TemplateRef::parse(&request.template, request.team_slug.as_deref())?;

    let sandbox_id = format!("sbx-{}", Uuid::new_v4().simple());
    let reservation = state
        .store
        .reserve(&sandbox_id, request.team_id, state.config.team_sandbox_limit)?;

    let (cluster, instance) = pick_placement(&state, request.cluster_id)?;

    let now = Utc::now();
    let max_instance_length = chrono::Duration::from_std(state.config.max_instance_length)
        .unwrap_or_else(|_| chrono::Duration::hours(24));
    let lifetime = request
        .timeout_seconds
        .map(|seconds| chrono::Duration::seconds(seconds as i64))
        .unwrap_or_else(|| {
            chrono::Duration::from_std(state.config.default_sandbox_lifetime)
                .unwrap_or_else(|_| chrono::Duration::minutes(5))
        });

    let spec = SandboxSpec {
        sandbox_id: sandbox_id.clone(),
        template_id: template.alias().to_string(),
        base_template_id: template.alias().to_string(),
        build_id: Uuid::new_v4().to_string(),
        kernel_version: "6.1".to_string(),
        firecracker_version: "1.7".to_string(),
        envd_version: "0.2".to_string(),
        node_id: instance.node_id().to_string(),
        cluster_id: cluster.id(),
        team_id: request.team_id,
        client_id: request.client_id,
        envd_access_token: state.hasher.envd_token(&sandbox_id),
        traffic_access_token: state.hasher.traffic_token(&sandbox_id),
        vcpu: request.vcpu,
        ram_mb: request.ram_mb,
        disk_mb: request.disk_mb,
        auto_pause: request.auto_pause,
        allow_internet_access: request.allow_internet_access,
        max_instance_length,
        metadata: request.metadata,
    };
    let sandbox = Sandbox::running(spec, now, now + lifetime);

    // place the workload before the record becomes visible; the reservation
    // keeps the team slot held either way and is surrendered on drop
    instance
        .client()
        .create_sandbox(lifecycle::create_payload(&sandbox))
        .await
        .map_err(ApiError::Upstream)?;

    state.store.add(sandbox.clone(), true)?;
    reservation.release();

    let spec = sandbox.spec();
    Ok(Json(CreateSandboxResponse {
        sandbox_id,
        template_id: spec.template_id.clone(),
        cluster_id: spec.cluster_id,
        node_id: spec.node_id.clone(),
        envd_access_token: spec.envd_access_token.clone(),
        traffic_access_token: spec.traffic_access_token.clone(),
        start_time: sandbox.start_time(),
        end_time: sandbox.end_time(),
    }))
}

fn pick_placement(
    state: &AppState,
    requested: Option<Uuid>,
) -> Result<(Cluster, WorkerInstance), ApiError> {
    let mut clusters = match requested {
        Some(cluster_id) => {
            let cluster = state
                .pool
                .get(cluster_id)
                .ok_or(FleetError::ClusterNotFound(cluster_id))?;
            vec![cluster]
        }
        None => state.pool.clusters(),
    };
    clusters.shuffle(&mut rand::thread_rng());

    for cluster in clusters {
        let mut candidates: Vec<WorkerInstance> = cluster
            .orchestrators()
            .into_iter()
            .filter(|instance| instance.status() == ServiceStatus::Healthy)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        if let Some(instance) = candidates.into_iter().next() {
            return Ok((cluster, instance));
        }
    }

    Err(ApiError::NoCapacity)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    team_id: Option<Uuid>,
}

async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Json<Vec<SandboxSummary>> {
    let summaries = state
        .store
        .items(query.team_id)
        .iter()
        .map(SandboxSummary::from)
        .collect();
    Json(summaries)
}

async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxSummary>, ApiError> {
    let sandbox = state.store.get(&sandbox_id, false)?;
    Ok(Json(SandboxSummary::from(&sandbox)))
}

async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<RemovalResponse>, ApiError> {
    remove_sandbox(state, sandbox_id, RemoveAction::Pause).await
}

async fn kill_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<RemovalResponse>, ApiError> {
    remove_sandbox(state, sandbox_id, RemoveAction::Kill).await
}

async fn remove_sandbox(
    state: Arc<AppState>,
    sandbox_id: String,
    action: RemoveAction,
) -> Result<Json<RemovalResponse>, ApiError> {
    let cancel = CancellationToken::new();
    match state
        .store
        .start_removing(&cancel, &sandbox_id, action)
        .await?
    {
        Removal::AlreadyDone => {
            let sandbox = state.store.get(&sandbox_id, true)?;
            Ok(Json(RemovalResponse {
                sandbox_id,
                state: sandbox.state().to_string(),
                already_done: true,
            }))
        }
        Removal::Started(handle) => {
            let sandbox = state.store.get(&sandbox_id, true)?;
            let result = lifecycle::remove_on_node(&state.pool, &sandbox, action).await;
            let failure = result.as_ref().err().map(|error| error.to_string());
            handle.finish(result);

            if let Some(message) = failure {
                return Err(ApiError::Upstream(anyhow!(message)));
            }
            state.routes.remove(&sandbox_id);
            Ok(Json(RemovalResponse {
                sandbox_id,
                state: sandbox.state().to_string(),
                already_done: false,
            }))
        }
    }
}

async fn extend_timeout(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
    Json(request): Json<ExtendTimeoutRequest>,
) -> Result<Json<ExtendTimeoutResponse>, ApiError> {
    let end_time =
        state
            .store
            .extend_end_time(&sandbox_id, request.end_time, request.allow_shorter)?;
    Ok(Json(ExtendTimeoutResponse { end_time }))
}

async fn node_sync(
    State(state): State<Arc<AppState>>,
    Path(node_id): Path<String>,
    headers: HeaderMap,
    Json(reports): Json<Vec<SandboxReport>>,
) -> Result<StatusCode, ApiError> {
    require_admin(&state, &headers)?;

    let reported = reports
        .into_iter()
        .map(|report| report.into_sandbox(&node_id))
        .collect();
    state.store.sync(&node_id, reported);
    Ok(StatusCode::NO_CONTENT)
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = &state.config.admin_token else {
        return Ok(());
    };
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if presented == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

#[derive(Debug)]
enum ApiError {
    Store(StoreError),
    Fleet(FleetError),
    Identifier(IdentifierError),
    NoCapacity,
    Unauthorized,
    Upstream(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        ApiError::Store(error)
    }
}

impl From<FleetError> for ApiError {
    fn from(error: FleetError) -> Self {
        ApiError::Fleet(error)
    }
}

impl From<IdentifierError> for ApiError {
    fn from(error: IdentifierError) -> Self {
        ApiError::Identifier(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Store(error) => {
                let status = match error {
                    StoreError::AlreadyBeingStarted(_) => StatusCode::CONFLICT,
                    StoreError::LimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                    StoreError::NotFound(_) => StatusCode::NOT_FOUND,
                    StoreError::InvalidTransition { .. } => StatusCode::CONFLICT,
                    StoreError::TransitionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
                    StoreError::InvalidSandbox(_) => StatusCode::BAD_REQUEST,
                    StoreError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, error.to_string())
            }
            ApiError::Fleet(error) => {
                let status = match error {
                    FleetError::ClusterNotFound(_) => StatusCode::NOT_FOUND,
                    FleetError::TemplateBuilderNotFound { .. } => StatusCode::NOT_FOUND,
                    FleetError::NoTemplateBuilder(_) | FleetError::NoOrchestrator(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                };
                (status, error.to_string())
            }
            ApiError::Identifier(error) => (StatusCode::BAD_REQUEST, error.to_string()),
            ApiError::NoCapacity => (
                StatusCode::SERVICE_UNAVAILABLE,
                "no healthy orchestrator available".to_string(),
            ),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Upstream(error) => {
                warn!(%error, "upstream worker call failed");
                (StatusCode::BAD_GATEWAY, error.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
