// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StorageBackend;

const DAY_SECS: u64 = 24 * 60 * 60;

/// Floors that keep the bus relay and the purge task from spinning.
const MIN_RECEIVE_WAIT_MS: u64 = 10;
const MIN_PURGE_INTERVAL_SECS: u64 = 1;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the WebSocket listener binds.
    pub listen_addr: SocketAddr,
    /// Address for the health/metrics HTTP server.
    pub metrics_addr: SocketAddr,
    /// Bearer token required on `/metrics`, if set.
    pub metrics_token: Option<String>,
    /// Message log backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage.
    pub data_dir: PathBuf,
    /// Presence marker lifetime. Refreshed only by reconnecting.
    pub presence_ttl_secs: u64,
    /// Undelivered hint lifetime, re-armed by every queued message.
    pub undelivered_ttl_secs: u64,
    /// Bounded wait of the bus relay, which also bounds teardown latency.
    pub receive_wait_ms: u64,
    /// Forwards allowed in flight per connection before reading pauses.
    pub max_in_flight_forwards: usize,
    /// Time allowed for the WebSocket upgrade.
    pub handshake_timeout_secs: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Interval of the expired-presence sweep in seconds.
    pub purge_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            metrics_addr: SocketAddr::from(([127, 0, 0, 1], 8081)),
            metrics_token: None,
            storage_backend: StorageBackend::Sqlite,
            data_dir: PathBuf::from("./data"),
            presence_ttl_secs: DAY_SECS,
            undelivered_ttl_secs: DAY_SECS,
            receive_wait_ms: 1000,
            max_in_flight_forwards: 64,
            handshake_timeout_secs: 10,
            max_message_size: 65_536,
            purge_interval_secs: 300,
        }
    }
}

/// Parses `name` from the environment, keeping `current` when unset or
/// malformed.
fn env_or<T: std::str::FromStr>(name: &str, current: T) -> T {
    match std::env::var(name) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                tracing::warn!("Ignoring malformed {}={}", name, val);
                current
            }
        },
        Err(_) => current,
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let storage_backend = match std::env::var("RELAY_STORAGE_BACKEND") {
            Ok(val) if val.eq_ignore_ascii_case("memory") => StorageBackend::Memory,
            Ok(_) => StorageBackend::Sqlite,
            Err(_) => defaults.storage_backend,
        };

        RelayConfig {
            listen_addr: env_or("RELAY_LISTEN_ADDR", defaults.listen_addr),
            metrics_addr: env_or("RELAY_METRICS_ADDR", defaults.metrics_addr),
            metrics_token: std::env::var("RELAY_METRICS_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
            storage_backend,
            data_dir: std::env::var("RELAY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            presence_ttl_secs: env_or("RELAY_PRESENCE_TTL_SECS", defaults.presence_ttl_secs),
            undelivered_ttl_secs: env_or(
                "RELAY_UNDELIVERED_TTL_SECS",
                defaults.undelivered_ttl_secs,
            ),
            receive_wait_ms: env_or("RELAY_RECEIVE_WAIT_MS", defaults.receive_wait_ms),
            max_in_flight_forwards: env_or(
                "RELAY_MAX_IN_FLIGHT_FORWARDS",
                defaults.max_in_flight_forwards,
            )
            .max(1),
            handshake_timeout_secs: env_or(
                "RELAY_HANDSHAKE_TIMEOUT_SECS",
                defaults.handshake_timeout_secs,
            ),
            max_message_size: env_or("RELAY_MAX_MESSAGE_SIZE", defaults.max_message_size),
            purge_interval_secs: env_or("RELAY_PURGE_INTERVAL_SECS", defaults.purge_interval_secs),
        }
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }

    pub fn undelivered_ttl(&self) -> Duration {
        Duration::from_secs(self.undelivered_ttl_secs)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms.max(MIN_RECEIVE_WAIT_MS))
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(MIN_PURGE_INTERVAL_SECS))
    }
}
