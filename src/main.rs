// ------------------------------------------------------------
// Module declarations
// ------------------------------------------------------------
//
// Each module represents a well-defined responsibility:
//
// - config:    Configuration struct loaded from JSON
// - schema:    JSON bodies of the control endpoints
// - util:      Server identifiers and address helpers
// - metrics:   Runtime counters of the proxy itself
// - collector: Per-server cached state, fetcher, schedule
// - registry:  Tracked servers, polling, aggregation
// - server:    HTTP surface (Axum)
//
mod collector;
mod config;
mod metrics;
mod registry;
mod schema;
mod server;
mod util;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use collector::fetcher::HttpFetcher;
use config::load_config;
use registry::{Registry, RegistrySettings};

const DEFAULT_CONFIG_PATH: &str = "config.json";

// ------------------------------------------------------------
// Application entry point
// ------------------------------------------------------------
//
// Responsibilities:
// - Initialize logging
// - Load configuration
// - Create the registry (the single owner of all collectors)
// - Serve the HTTP surface until Ctrl-C
//
// Collection starts lazily: the first registered server (or the
// first /set call) installs the polling schedule.
//
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // --------------------------------------------------------
    // Load configuration from disk
    //
    // The first argument overrides the default path. A missing
    // file means defaults.
    // --------------------------------------------------------
    let path = env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = load_config(&path)?;
    log::info!("Configuration: {config:?}");

    // --------------------------------------------------------
    // Registry
    //
    // One shared reqwest client for every scrape; the timeout
    // bounds how long a hung server occupies its scrape task.
    // --------------------------------------------------------
    let fetcher = HttpFetcher::new(config.fetch_timeout()).context("cannot build HTTP client")?;
    let registry = Registry::new(Arc::new(fetcher), RegistrySettings::from(&config));

    metrics::spawn_reporter(Duration::from_secs(config.metrics_report_secs));

    // --------------------------------------------------------
    // Serve until Ctrl-C, then stop the schedule
    // --------------------------------------------------------
    server::serve(config.listen, registry.clone(), async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Cannot listen for shutdown signal: {e}");
            futures_util::future::pending::<()>().await;
        }
        log::info!("Shutdown requested");
    })
    .await?;

    registry.shutdown().await;
    Ok(())
}
