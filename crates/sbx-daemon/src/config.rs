use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Statically configured local cluster descriptor. Joins the pool under the
/// reserved local cluster id unless the catalog already carries that row.
#[derive(Debug, Clone)]
pub struct LocalClusterConfig {
    pub endpoint: String,
    pub token: String,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub token_seed: String,
    pub postgres_dsn: Option<String>,
    pub warehouse_url: String,
    pub log_store_url: String,
    pub local_cluster: Option<LocalClusterConfig>,
    pub admin_token: Option<String>,
    pub team_sandbox_limit: i64,
    pub default_sandbox_lifetime: Duration,
    pub max_instance_length: Duration,
    pub cluster_sync_interval: Duration,
    pub instance_sync_interval: Duration,
    /// OTLP trace sampling ratio in `0.0..=1.0`; 0 disables the exporter.
    pub otel_sampling_rate: f64,
    /// Complaint about a malformed sampling value, logged once telemetry is
    /// up (config parsing runs before any subscriber exists).
    pub otel_sampling_warning: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let listen_addr = env::var("SBX_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid SBX_API_ADDR")?;

        let token_seed = env::var("SANDBOX_ACCESS_TOKEN_HASH_SEED")
            .context("SANDBOX_ACCESS_TOKEN_HASH_SEED must be configured")?;
        if token_seed.is_empty() {
            anyhow::bail!("SANDBOX_ACCESS_TOKEN_HASH_SEED must not be empty");
        }

        let postgres_dsn = env::var("POSTGRES_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        let warehouse_url =
            env::var("CLICKHOUSE_URL").unwrap_or_else(|_| "http://127.0.0.1:8123".to_string());
        let log_store_url =
            env::var("LOKI_URL").unwrap_or_else(|_| "http://127.0.0.1:3100".to_string());

        let local_cluster = match env::var("LOCAL_CLUSTER_ENDPOINT") {
            Ok(endpoint) if !endpoint.is_empty() => Some(LocalClusterConfig {
                endpoint,
                token: env::var("LOCAL_CLUSTER_TOKEN")
                    .context("LOCAL_CLUSTER_TOKEN must accompany LOCAL_CLUSTER_ENDPOINT")?,
                tls: env_flag("LOCAL_CLUSTER_TLS", false),
            }),
            _ => None,
        };

        let (otel_sampling_rate, otel_sampling_warning) =
            sampling_rate(env::var("SBX_OTEL_SAMPLING_RATE").ok());

        Ok(Self {
            listen_addr,
            token_seed,
            postgres_dsn,
            warehouse_url,
            log_store_url,
            local_cluster,
            admin_token: env::var("SBX_ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            team_sandbox_limit: env_i64("SBX_TEAM_SANDBOX_LIMIT", 20),
            default_sandbox_lifetime: Duration::from_secs(env_u64(
                "SBX_DEFAULT_LIFETIME_SECONDS",
                300,
            )),
            max_instance_length: Duration::from_secs(
                env_u64("SBX_MAX_INSTANCE_LENGTH_HOURS", 24) * 3600,
            ),
            cluster_sync_interval: Duration::from_secs(env_u64(
                "SBX_CLUSTER_SYNC_INTERVAL_SECONDS",
                60,
            )),
            instance_sync_interval: Duration::from_secs(env_u64(
                "SBX_INSTANCE_SYNC_INTERVAL_SECONDS",
                10,
            )),
            otel_sampling_rate,
            otel_sampling_warning,
        })
    }
}

/// Interprets `SBX_OTEL_SAMPLING_RATE`. Anything unusable falls back to
/// sampling every trace; values outside the unit interval are clamped. The
/// second element carries the complaint to log once telemetry is installed.
fn sampling_rate(raw: Option<String>) -> (f64, Option<String>) {
    let Some(raw) = raw else {
        return (1.0, None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (
            1.0,
            Some("SBX_OTEL_SAMPLING_RATE is empty; sampling every trace".to_string()),
        );
    }
    match trimmed.parse::<f64>() {
        Ok(rate) if (0.0..=1.0).contains(&rate) => (rate, None),
        Ok(rate) => {
            let clamped = rate.clamp(0.0, 1.0);
            (
                clamped,
                Some(format!(
                    "SBX_OTEL_SAMPLING_RATE={trimmed} clamped to {clamped}"
                )),
            )
        }
        Err(_) => (
            1.0,
            Some(format!(
                "SBX_OTEL_SAMPLING_RATE={trimmed:?} is not a number; sampling every trace"
            )),
        ),
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(value) => matches!(value.trim(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}
