// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence Relay Server
//!
//! Relays chat messages between WebSocket clients that are online and
//! queues them for replay when the receiver is away.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use presence_relay::config::RelayConfig;
use presence_relay::context::RelayContext;
use presence_relay::http::{self, HttpState};
use presence_relay::presence::{MemoryPresenceStore, PresenceStore};
use presence_relay::router::RouterService;
use presence_relay::server;
use presence_relay::storage::{create_message_log, MessageLog};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("presence_relay=info")),
        )
        .init();

    let config = RelayConfig::from_env();

    info!("Presence relay v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Presence TTL: {}s", config.presence_ttl_secs);

    let log: Arc<dyn MessageLog> =
        match create_message_log(config.storage_backend, &config.data_dir) {
            Ok(log) => Arc::from(log),
            Err(e) => {
                error!("Failed to open message log: {}", e);
                std::process::exit(1);
            }
        };
    let presence: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());

    let ctx = RelayContext::new(config.clone(), presence.clone(), log);

    if config.metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !config.metrics_addr.ip().is_loopback() {
        warn!("Metrics exposed on non-localhost without auth token");
    }
    let http_state = HttpState {
        metrics: ctx.metrics.clone(),
        metrics_token: config.metrics_token.clone(),
    };
    let http_listener = match TcpListener::bind(config.metrics_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind metrics listener: {}", e);
            std::process::exit(1);
        }
    };
    tokio::spawn(async move {
        if let Err(e) = http::serve(http_listener, http_state).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    server::spawn_presence_purge(presence, config.purge_interval());

    let listener = match TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind WebSocket listener: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server::serve(listener, RouterService::new(ctx)).await {
        error!("WebSocket server stopped: {}", e);
        std::process::exit(1);
    }
}
