//! # Open Food Facts MCP server (`openfoodfacts-mcp`)
//!
//! One binary, three modes:
//!
//! | Flag | Mode |
//! |------|------|
//! | (none) | HTTP MCP server on `$PORT` (bearer auth on `/mcp`) |
//! | `--stdio` | MCP over stdin/stdout for local clients like Claude Desktop |
//! | `--fetch-db` | Download/refresh the dataset snapshot and exit |
//!
//! Configuration comes entirely from the environment (plus an optional
//! `.env` file); see the `config` module for the full variable list.
//! Exits `0` on clean shutdown and `1` on startup or fatal runtime error.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use openfoodfacts_mcp::config::Config;
use openfoodfacts_mcp::dataset::DatasetManager;
use openfoodfacts_mcp::engine::{ProductQuery, QueryEngine};
use openfoodfacts_mcp::mcp::McpDispatcher;
use openfoodfacts_mcp::{http, logging, stdio};

/// Open Food Facts MCP server with an embedded DuckDB query engine.
///
/// Downloads and caches the Open Food Facts Parquet dataset and serves
/// MCP-compliant product search tools with bearer-token authentication
/// in HTTP mode.
#[derive(Parser)]
#[command(name = "openfoodfacts-mcp", version)]
struct Cli {
    /// Serve MCP over stdin/stdout instead of HTTP.
    #[arg(long)]
    stdio: bool,

    /// Download or refresh the dataset snapshot, then exit.
    #[arg(long = "fetch-db")]
    fetch_db: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config first: it loads `.env`, which may set LOG_LEVEL.
    let config = Config::load()?;
    // stdout carries the MCP wire in stdio mode, so log to stderr there
    // (and in fetch mode, where text output is friendlier than JSON).
    logging::init(cli.stdio || cli.fetch_db);

    if cli.fetch_db {
        run_fetch(&config).await
    } else if cli.stdio {
        run_stdio(config).await
    } else {
        http::serve(config).await
    }
}

async fn run_fetch(config: &Config) -> Result<()> {
    let manager = DatasetManager::new(config);
    let cancel = CancellationToken::new();
    manager
        .ensure_snapshot(&cancel)
        .await
        .context("dataset fetch failed")?;
    info!(path = %config.parquet_path.display(), "dataset ready");
    Ok(())
}

async fn run_stdio(config: Config) -> Result<()> {
    info!("starting Open Food Facts MCP server in stdio mode");

    let cancel = CancellationToken::new();
    let manager = DatasetManager::new(&config);
    manager
        .ensure_snapshot(&cancel)
        .await
        .context("failed to ensure dataset")?;

    let engine = Arc::new(QueryEngine::new(&config.parquet_path, &config.duckdb));
    engine
        .connection_test(&cancel)
        .await
        .context("query engine connection test failed")?;

    let query: Arc<dyn ProductQuery> = engine.clone();
    let dispatcher = Arc::new(McpDispatcher::new(
        query,
        config.is_development(),
        cancel.clone(),
    ));

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    let result = stdio::run(dispatcher, cancel).await;
    engine.close().await;
    result
}
