use anyhow::Result;
use tracing_subscriber::EnvFilter;

use scraper_pool_common::AppConfig;
use scraper_pool_server::run_server;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::from_env();

    let filter = config
        .log_level
        .as_deref()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    run_server(config).await
}
