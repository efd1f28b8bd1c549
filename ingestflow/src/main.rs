use std::sync::Arc;

use ingestflow::config::EngineConfig;
use ingestflow::domain::{HttpCrawler, HttpScraper, MemoryDatastore, http};
use ingestflow::logging::init_logging;
use ingestflow::IngestEngine;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::from_env()?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let (logging, _guard) = init_logging(&config.log)?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.clone());

    let client = http::build_client(&config.http)?;
    let engine = IngestEngine::builder(config, Arc::new(MemoryDatastore::new()))
        .with_crawler(Arc::new(HttpCrawler::new(client.clone())))
        .with_scraper(Arc::new(HttpScraper::new(client)))
        .build()
        .await?;

    engine.start().await?;
    info!("ingestflow started, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    shutdown.cancel();
    engine.stop().await;
    Ok(())
}
