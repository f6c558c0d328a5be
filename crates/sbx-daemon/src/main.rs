use anyhow::Result;

use sbx_daemon::config::AppConfig;
use sbx_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env()?;
    let _telemetry = telemetry::init("sbx-daemon", &config)?;
    sbx_daemon::server::run(config).await
}
