// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Relay Context
//!
//! Everything the router needs, built once at startup and passed in.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::presence::PresenceStore;
use crate::storage::MessageLog;

/// Source of wall-clock timestamps written into messages and records.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = at;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// Shared handles for one relay process.
#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    pub presence: Arc<dyn PresenceStore>,
    pub log: Arc<dyn MessageLog>,
    pub clock: Arc<dyn Clock>,
    pub metrics: RelayMetrics,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        presence: Arc<dyn PresenceStore>,
        log: Arc<dyn MessageLog>,
    ) -> Self {
        RelayContext {
            config: Arc::new(config),
            presence,
            log,
            clock: Arc::new(SystemClock),
            metrics: RelayMetrics::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
