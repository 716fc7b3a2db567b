// ABOUTME: Server binary wiring configuration, persistence, relay, and HTTP routes
// ABOUTME: Runs the streaming chat completion relay until shutdown
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Chat Relay Server Binary
//!
//! Starts the streaming chat completion relay: loads configuration from the
//! environment, bootstraps the SQLite schema, and serves the HTTP API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

use chat_relay_server::config::ServerConfig;
use chat_relay_server::database::repositories::TurnRepository;
use chat_relay_server::database::{self, ChatStore};
use chat_relay_server::llm::UpstreamClient;
use chat_relay_server::logging;
use chat_relay_server::routes::{ChatRoutes, HealthRoutes, ServerResources};
use chat_relay_server::services::{RelayService, RelaySettings};

#[derive(Parser)]
#[command(name = "chat-relay-server")]
#[command(about = "Streaming chat completion relay with durable conversations")]
struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::from_env()?;
    if let Some(http_port) = args.http_port {
        config.http_port = http_port;
    }

    logging::init_from_env()?;

    let pool = database::create_pool(&config.database_url).await?;
    let store = Arc::new(ChatStore::new(pool));

    let upstream = Arc::new(UpstreamClient::new(config.upstream_config())?);
    let repository = Arc::clone(&store) as Arc<dyn TurnRepository>;
    let relay = Arc::new(RelayService::new(
        repository,
        upstream,
        RelaySettings::default(),
    ));

    let resources = Arc::new(ServerResources::new(store, relay));

    let router = ChatRoutes::routes(resources)
        .merge(HealthRoutes::routes())
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Chat relay server listening on {addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Chat relay server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received");
    }
}
