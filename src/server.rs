// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Listener
//!
//! Accepts TCP connections, upgrades `/online/{username}` requests and hands
//! each session to the router on its own task.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info, warn};

use crate::error::AttachError;
use crate::presence::PresenceStore;
use crate::router::RouterService;

const ONLINE_PREFIX: &str = "/online/";

/// Extracts the username from an upgrade request path.
pub fn username_from_path(path: &str) -> Result<String, StatusCode> {
    let name = path.strip_prefix(ONLINE_PREFIX).ok_or(StatusCode::NOT_FOUND)?;
    if name.contains('/') {
        return Err(StatusCode::NOT_FOUND);
    }
    if name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    Ok(name.to_string())
}

fn error_response(status: StatusCode) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(
        status.canonical_reason().unwrap_or("error").to_string(),
    ));
    *response.status_mut() = status;
    response
}

/// Accepts connections until the listener fails.
pub async fn serve(listener: TcpListener, router: RouterService) -> std::io::Result<()> {
    info!("WebSocket server listening on {}", listener.local_addr()?);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept failed: {}", e);
                return Err(e);
            }
        };
        debug!("Connection from {}", addr);

        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_stream(stream, &router).await {
                router.context().metrics.connection_errors.inc();
                warn!("Connection from {} not attached: {}", addr, e);
            }
        });
    }
}

/// Upgrades one TCP stream and runs its session to completion.
///
/// A failed or slow upgrade returns before the router sees the connection.
pub async fn handle_stream(stream: TcpStream, router: &RouterService) -> Result<(), AttachError> {
    let handshake_timeout = router.context().config.handshake_timeout();
    let mut requested = None;
    let callback = |request: &Request, response: Response| {
        match username_from_path(request.uri().path()) {
            Ok(name) => {
                requested = Some(name);
                Ok(response)
            }
            Err(status) => Err(error_response(status)),
        }
    };

    let upgrade = accept_hdr_async(stream, callback);
    let ws_stream = match tokio::time::timeout(handshake_timeout, upgrade).await {
        Ok(Ok(ws_stream)) => ws_stream,
        Ok(Err(e)) => return Err(AttachError::Upgrade(e)),
        Err(_) => return Err(AttachError::HandshakeTimeout),
    };
    let username = requested.ok_or(AttachError::MissingUsername)?;

    info!("New WebSocket connection for {}", username);
    router.attach(&username, ws_stream).await?;
    info!("WebSocket connection for {} closed", username);
    Ok(())
}

/// Periodically drops expired presence entries.
pub fn spawn_presence_purge(presence: Arc<dyn PresenceStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(every).await;
            let removed = presence.purge_expired();
            if removed > 0 {
                info!("Cleaned up {} expired presence entries", removed);
            }
        }
    })
}
