// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod message;
pub mod metrics;
pub mod presence;
pub mod router;
pub mod server;
pub mod session;
pub mod storage;

use tokio::net::TcpListener;

use router::RouterService;

/// Test helper: serves `router` on an ephemeral localhost port and returns
/// the bound address.
pub async fn test_start(router: RouterService) -> std::io::Result<std::net::SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = server::serve(listener, router).await {
            tracing::error!("Test server stopped: {}", e);
        }
    });
    Ok(addr)
}
