use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Reserved id marking the statically configured local cluster in the pool.
pub const LOCAL_CLUSTER_ID: Uuid = Uuid::nil();

/// One active cluster row.
#[derive(Debug, Clone)]
pub struct ClusterRecord {
    pub id: Uuid,
    pub endpoint: String,
    pub endpoint_tls: bool,
    pub token: String,
    pub sandbox_proxy_domain: Option<String>,
}

/// Source of truth for cluster membership.
#[async_trait]
pub trait ClusterCatalog: Send + Sync + 'static {
    async fn active_clusters(&self) -> Result<Vec<ClusterRecord>>;
}

/// Postgres-backed catalog.
pub struct PgClusterCatalog {
    pool: PgPool,
}

impl PgClusterCatalog {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(8)
            .connect(dsn)
            .await
            .context("connecting cluster catalog database")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ClusterCatalog for PgClusterCatalog {
    async fn active_clusters(&self) -> Result<Vec<ClusterRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, endpoint, endpoint_tls, token, sandbox_proxy_domain
            FROM clusters
            WHERE deleted_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing active clusters")?;

        rows.into_iter().map(map_cluster).collect()
    }
}

fn map_cluster(row: PgRow) -> Result<ClusterRecord> {
    Ok(ClusterRecord {
        id: row.try_get("id")?,
        endpoint: row.try_get("endpoint")?,
        endpoint_tls: row.try_get("endpoint_tls")?,
        token: row.try_get("token")?,
        sandbox_proxy_domain: row.try_get("sandbox_proxy_domain")?,
    })
}
