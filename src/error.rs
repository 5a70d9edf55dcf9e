// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Error Types
//!
//! One enum per collaborator boundary. The router never surfaces these to
//! clients; they are logged and routed around.

use thiserror::Error;

/// Errors from the presence/bus store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A lock guarding store state was poisoned by a panicking holder.
    #[error("presence store lock poisoned")]
    Poisoned,
    /// The backend rejected or failed the operation.
    #[error("presence store backend: {0}")]
    Backend(String),
}

/// Errors from the durable message log.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("message log lock poisoned")]
    Poisoned,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt timestamp in row {0}")]
    BadTimestamp(i64),
}

/// Errors decoding wire or bus payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not text or binary")]
    UnsupportedFrame,
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),
    #[error("missing receiverId")]
    MissingReceiver,
}

/// Errors writing a message down a session's connection.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("encode: {0}")]
    Encode(#[from] CodecError),
    #[error("connection: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors establishing a session. Returned before any side effect happens.
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("websocket upgrade failed: {0}")]
    Upgrade(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("websocket upgrade timed out")]
    HandshakeTimeout,
    #[error("no username in request path")]
    MissingUsername,
}
