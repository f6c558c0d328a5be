use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::cluster::InstancePool;
use crate::rpc::{authed_http, base_url, ServiceStatus};

const LOG_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub sandbox_id: String,
    pub team_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_used_pct: f64,
    pub mem_used_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsQuery {
    pub sandbox_id: String,
    pub team_id: Uuid,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildLogsQuery {
    pub template_id: String,
    pub build_id: String,
    pub team_id: Uuid,
    pub builder_node_id: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Metric and log queries for sandboxes and template builds. Local clusters
/// read their own warehouse and log store; remote clusters forward to their
/// gateway. Either way log queries are clamped to the retention window.
#[async_trait]
pub trait ResourceQueries: Send + Sync + 'static {
    async fn metrics(&self, query: MetricsQuery) -> Result<Vec<MetricSample>>;
    async fn logs(&self, query: LogsQuery) -> Result<Vec<LogEntry>>;
    async fn build_logs(&self, query: BuildLogsQuery) -> Result<Vec<LogEntry>>;
}

/// Clamps `(start, end)` into the last seven days.
pub fn clamp_log_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    let floor = now - Duration::days(LOG_RETENTION_DAYS);
    let start = start.max(floor);
    let end = end.min(now).max(start);
    (start, end)
}

/// Local implementation: metrics from the columnar warehouse, logs from the
/// log store, with a builder fast path for live template build logs.
pub struct LocalResources {
    http: reqwest::Client,
    warehouse_url: String,
    log_store_url: String,
    builders: Arc<InstancePool>,
}

impl LocalResources {
    pub fn new(
        warehouse_url: String,
        log_store_url: String,
        builders: Arc<InstancePool>,
    ) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .context("building resource query HTTP client")?,
            warehouse_url,
            log_store_url,
            builders,
        })
    }

    async fn warehouse_rows(&self, query: &MetricsQuery) -> Result<Vec<WarehouseMetricRow>> {
        const SQL: &str = "SELECT toUnixTimestamp64Milli(ts) AS ts_ms, cpu_used_pct, mem_used_mb \
             FROM sandbox_metrics \
             WHERE sandbox_id = {sandbox_id:String} AND team_id = {team_id:String} \
               AND ts BETWEEN fromUnixTimestamp64Milli({start_ms:Int64}) \
                          AND fromUnixTimestamp64Milli({end_ms:Int64}) \
             ORDER BY ts \
             FORMAT JSONEachRow";

        let params = [
            ("query", SQL.to_string()),
            ("param_sandbox_id", query.sandbox_id.clone()),
            ("param_team_id", query.team_id.to_string()),
            ("param_start_ms", query.start.timestamp_millis().to_string()),
            ("param_end_ms", query.end.timestamp_millis().to_string()),
        ];
        let response = self
            .http
            .post(&self.warehouse_url)
            .query(&params)
            .send()
            .await
            .context("warehouse query failed")?
            .error_for_status()
            .context("warehouse query rejected")?;

        let body = response.text().await.context("reading warehouse rows")?;
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("decoding warehouse row"))
            .collect()
    }

    async fn log_store_query(
        &self,
        selector: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogEntry>> {
        let url = format!("{}/loki/api/v1/query_range", self.log_store_url);
        let params = [
            ("query", selector),
            ("start", nanos(start).to_string()),
            ("end", nanos(end).to_string()),
            ("limit", limit.to_string()),
            ("direction", "forward".to_string()),
        ];
        let response = self
            .http
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("log store query failed")?
            .error_for_status()
            .context("log store query rejected")?;

        let body: LokiResponse = response.json().await.context("decoding log store response")?;
        let mut entries = Vec::new();
        for stream in body.data.result {
            let level = stream.stream.get("level").cloned();
            for (timestamp, line) in stream.values {
                let Ok(timestamp) = timestamp.parse::<i64>().map(DateTime::from_timestamp_nanos)
                else {
                    continue;
                };
                entries.push(LogEntry {
                    timestamp,
                    line,
                    level: level.clone(),
                });
            }
        }
        entries.sort_by_key(|entry| entry.timestamp);
        Ok(entries)
    }
}

#[async_trait]
impl ResourceQueries for LocalResources {
    async fn metrics(&self, query: MetricsQuery) -> Result<Vec<MetricSample>> {
        let rows = self.warehouse_rows(&query).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                DateTime::from_timestamp_millis(row.ts_ms).map(|timestamp| MetricSample {
                    timestamp,
                    cpu_used_pct: row.cpu_used_pct,
                    mem_used_mb: row.mem_used_mb,
                })
            })
            .collect())
    }

    async fn logs(&self, query: LogsQuery) -> Result<Vec<LogEntry>> {
        let (start, end) = clamp_log_window(query.start, query.end);
        let selector = format!(
            "{{service=\"sandbox\",sandbox_id=\"{}\",team_id=\"{}\"}}",
            query.sandbox_id, query.team_id
        );
        self.log_store_query(selector, start, end, query.limit).await
    }

    async fn build_logs(&self, query: BuildLogsQuery) -> Result<Vec<LogEntry>> {
        // an in-flight build keeps its freshest logs on the builder itself
        if let Some(node_id) = &query.builder_node_id {
            let builder = self.builders.get(node_id).filter(|instance| {
                instance.status() == ServiceStatus::Healthy && instance.is_builder()
            });
            if let Some(builder) = builder {
                match builder.client().build_logs(&query.build_id, 0).await {
                    Ok(chunks) => {
                        return Ok(chunks
                            .into_iter()
                            .map(|chunk| LogEntry {
                                timestamp: chunk.timestamp,
                                line: chunk.line,
                                level: None,
                            })
                            .collect());
                    }
                    Err(error) => {
                        warn!(
                            node_id = %node_id,
                            build_id = %query.build_id,
                            %error,
                            "live build log fetch failed, falling back to log store"
                        );
                    }
                }
            }
        }

        let (start, end) = clamp_log_window(query.start, query.end);
        let selector = format!(
            "{{service=\"template-build\",build_id=\"{}\",team_id=\"{}\"}}",
            query.build_id, query.team_id
        );
        self.log_store_query(selector, start, end, query.limit).await
    }
}

/// Remote implementation: every query is forwarded to the cluster gateway.
pub struct RemoteResources {
    http: reqwest::Client,
    base_url: String,
}

impl RemoteResources {
    pub fn new(endpoint: &str, tls: bool, secret: &str) -> Result<Self> {
        Ok(Self {
            http: authed_http(secret, tls, None)?,
            base_url: base_url(endpoint, tls),
        })
    }
}

#[async_trait]
impl ResourceQueries for RemoteResources {
    async fn metrics(&self, query: MetricsQuery) -> Result<Vec<MetricSample>> {
        let url = format!(
            "{}/api/v1/sandboxes/{}/metrics",
            self.base_url, query.sandbox_id
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("team_id", query.team_id.to_string()),
                ("start", query.start.to_rfc3339()),
                ("end", query.end.to_rfc3339()),
            ])
            .send()
            .await
            .context("remote metrics query failed")?
            .error_for_status()
            .context("remote metrics query rejected")?;
        response.json().await.context("decoding remote metrics")
    }

    async fn logs(&self, query: LogsQuery) -> Result<Vec<LogEntry>> {
        let (start, end) = clamp_log_window(query.start, query.end);
        let url = format!(
            "{}/api/v1/sandboxes/{}/logs",
            self.base_url, query.sandbox_id
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("team_id", query.team_id.to_string()),
                ("start", start.to_rfc3339()),
                ("end", end.to_rfc3339()),
                ("limit", query.limit.to_string()),
            ])
            .send()
            .await
            .context("remote log query failed")?
            .error_for_status()
            .context("remote log query rejected")?;
        response.json().await.context("decoding remote logs")
    }

    async fn build_logs(&self, query: BuildLogsQuery) -> Result<Vec<LogEntry>> {
        let (start, end) = clamp_log_window(query.start, query.end);
        let url = format!(
            "{}/api/v1/template-builds/{}/logs",
            self.base_url, query.build_id
        );
        let mut request = self.http.get(&url).query(&[
            ("team_id", query.team_id.to_string()),
            ("start", start.to_rfc3339()),
            ("end", end.to_rfc3339()),
            ("limit", query.limit.to_string()),
        ]);
        if let Some(node_id) = &query.builder_node_id {
            request = request.query(&[("builder_node_id", node_id)]);
        }
        let response = request
            .send()
            .await
            .context("remote build log query failed")?
            .error_for_status()
            .context("remote build log query rejected")?;
        response.json().await.context("decoding remote build logs")
    }
}

fn nanos(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

#[derive(Debug, Deserialize)]
struct WarehouseMetricRow {
    ts_ms: i64,
    cpu_used_pct: f64,
    mem_used_mb: u64,
}

#[derive(Debug, Deserialize)]
struct LokiResponse {
    data: LokiData,
}

#[derive(Debug, Deserialize)]
struct LokiData {
    result: Vec<LokiStream>,
}

#[derive(Debug, Deserialize)]
struct LokiStream {
    #[serde(default)]
    stream: std::collections::HashMap<String, String>,
    values: Vec<(String, String)>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Facade answering every query with nothing; used by cluster tests.
    pub struct NullResources;

    #[async_trait]
    impl ResourceQueries for NullResources {
        async fn metrics(&self, _query: MetricsQuery) -> Result<Vec<MetricSample>> {
            Ok(Vec::new())
        }

        async fn logs(&self, _query: LogsQuery) -> Result<Vec<LogEntry>> {
            Ok(Vec::new())
        }

        async fn build_logs(&self, _query: BuildLogsQuery) -> Result<Vec<LogEntry>> {
            Ok(Vec::new())
        }
    }
}
