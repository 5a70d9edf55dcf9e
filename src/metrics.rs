// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Prometheus Metrics for the Presence Relay

use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};

/// Relay metrics. Cloning shares the underlying counters.
#[derive(Clone)]
pub struct RelayMetrics {
    pub registry: Arc<Registry>,

    // Sessions
    pub connections_total: IntCounter,
    pub connections_active: IntGauge,
    /// Upgrades that failed or timed out.
    pub connection_errors: IntCounter,

    // Routing
    pub messages_received: IntCounter,
    /// Inbound frames dropped (malformed, oversized, unsupported).
    pub messages_dropped: IntCounter,
    /// Forwards handed to a live subscriber on the bus.
    pub messages_published: IntCounter,
    /// Forwards that fell back to the durable log.
    pub messages_queued: IntCounter,
    /// Bus messages written to a recipient's connection.
    pub messages_delivered_live: IntCounter,
    /// Queued records written during replay.
    pub messages_replayed: IntCounter,

    // Failures
    pub store_errors: IntCounter,
    pub persistence_errors: IntCounter,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric registered once");
    counter
}

fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts");
    registry
        .register(Box::new(gauge.clone()))
        .expect("metric registered once");
    gauge
}

impl RelayMetrics {
    /// Creates a fresh registry with every relay metric registered.
    pub fn new() -> Self {
        let registry = Registry::new();
        let r = &registry;

        RelayMetrics {
            connections_total: counter(
                r,
                "relay_connections_total",
                "Total WebSocket sessions attached",
            ),
            connections_active: gauge(r, "relay_connections_active", "Currently attached sessions"),
            connection_errors: counter(
                r,
                "relay_connection_errors_total",
                "Failed or timed out upgrades",
            ),
            messages_received: counter(
                r,
                "relay_messages_received_total",
                "Chat messages read from clients",
            ),
            messages_dropped: counter(
                r,
                "relay_messages_dropped_total",
                "Inbound frames dropped before routing",
            ),
            messages_published: counter(
                r,
                "relay_messages_published_total",
                "Messages handed to an online recipient",
            ),
            messages_queued: counter(
                r,
                "relay_messages_queued_total",
                "Messages stored for later replay",
            ),
            messages_delivered_live: counter(
                r,
                "relay_messages_delivered_live_total",
                "Bus messages written to a recipient connection",
            ),
            messages_replayed: counter(
                r,
                "relay_messages_replayed_total",
                "Queued messages written during replay",
            ),
            store_errors: counter(
                r,
                "relay_store_errors_total",
                "Presence store operations that failed",
            ),
            persistence_errors: counter(
                r,
                "relay_persistence_errors_total",
                "Message log operations that failed",
            ),
            registry: Arc::new(registry),
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}
