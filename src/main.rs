//! mail-sync-engine: job-queue driven IMAP synchronization
//!
//! Keeps a local SQLite cache of an IMAP account in step with the server.
//! Work is modelled as persisted jobs executed by a bounded worker set over a
//! shared connection pool, while dedicated IDLE connections turn mailbox
//! changes into debounced sync jobs. Jobs are exposed over MCP (stdio) and an
//! HTTP API with a resumable event feed.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading, CLI and serving
//! - [`config`]: Environment-driven configuration for the account and engine
//! - [`errors`]: Application error model with MCP error mapping
//! - [`db`]: SQLite connection setup and schema migrations
//! - [`jobs`]: Persistent job store with claim, progress and events
//! - [`cache`]: Local mail cache and per-folder sync markers
//! - [`protocol`]: Connector/connection traits the engine is written against
//! - [`imap`]: IMAP transport/session operations with timeout wrappers
//! - [`pool`]: Bounded pool of authenticated sessions
//! - [`folder_sync`]: Batched reconciliation of one folder
//! - [`mutation`]: Batched mark-read and move routine
//! - [`executor`]: Worker loop that claims and runs jobs
//! - [`coalesce`]: Debounced trigger-to-job coalescing
//! - [`watch`]: IDLE/poll monitor on a dedicated thread
//! - [`scheduler`]: Startup and catch-up job production, retention pruning
//! - [`feed`]: Live job event stream
//! - [`engine`]: Lifecycle wiring and the shared [`engine::EngineHandle`]
//! - [`server`]: MCP tool handlers
//! - [`http`]: HTTP API and SSE event feed
//! - [`models`]: Input/output DTOs and schema-bearing types
//! - [`mime`]: Header parsing and body previews

mod cache;
mod coalesce;
mod config;
mod db;
mod engine;
mod errors;
mod executor;
mod feed;
mod folder_sync;
mod http;
mod imap;
mod jobs;
mod mime;
mod models;
mod mutation;
mod pool;
mod protocol;
mod scheduler;
mod server;
#[cfg(test)]
mod testing;
mod watch;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use config::EngineConfig;
use engine::{Engine, StartOptions};
use errors::{AppError, AppResult};
use imap::ImapConnector;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command line switches; everything else comes from the environment
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Serve the HTTP API on this address (e.g. 127.0.0.1:8080)
    #[arg(long, value_name = "ADDR")]
    http: Option<SocketAddr>,
    /// Serve MCP over stdio (default when --http is not given)
    #[arg(long)]
    mcp: bool,
    /// Do not start IDLE watch monitors
    #[arg(long)]
    no_watch: bool,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, starts the engine
/// and serves the selected surfaces until interrupted or the MCP client
/// disconnects. Logs go to stderr so stdout stays free for MCP.
///
/// # Environment Variables
///
/// See [`EngineConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// MAIL_IMAP_HOST=imap.example.com \
/// MAIL_IMAP_USER=user@example.com \
/// MAIL_IMAP_PASS=secret \
/// cargo run -- --http 127.0.0.1:8080
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load_from_env()?;
    let connector = Arc::new(ImapConnector::new(config.account.clone(), config.timeouts));
    let engine = Engine::start(&config, connector, StartOptions { watch: !cli.no_watch })?;

    let shutdown = CancellationToken::new();
    let mut servers: JoinSet<AppResult<()>> = JoinSet::new();
    if let Some(addr) = cli.http {
        servers.spawn(http::serve(addr, engine.handle(), shutdown.clone()));
    }
    if cli.mcp || cli.http.is_none() {
        let handle = engine.handle();
        servers.spawn(async move {
            let service = server::MailSyncServer::new(handle)
                .serve(stdio())
                .await
                .map_err(|e| AppError::Internal(format!("MCP initialization failed: {e}")))?;
            service
                .waiting()
                .await
                .map_err(|e| AppError::Internal(format!("MCP service failed: {e}")))?;
            info!("MCP client disconnected");
            Ok(())
        });
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for interrupt");
            }
            info!("interrupt received, shutting down");
        }
        Some(joined) = servers.join_next() => match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "server stopped"),
            Err(e) => error!(error = %e, "server task failed"),
        },
    }

    shutdown.cancel();
    servers.shutdown().await;
    engine.shutdown().await;
    Ok(())
}
