// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence Store
//!
//! Expiring key/value entries plus a publish/subscribe bus. The relay keeps
//! three kinds of keys per user here: the presence marker, the undelivered
//! hint, and the bus channel live messages are published on.
//!
//! Each subscription owns a bounded channel. A publish counts only the
//! subscribers that actually accepted the payload, so a full or closed
//! subscriber is reported the same as no subscriber at all.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::StoreError;

/// Per-subscription buffer before publishes start being refused.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Key naming shared by every relay instance.
pub mod keys {
    /// Presence marker, present while the user has a live session.
    pub fn online(username: &str) -> String {
        format!("{}-online", username)
    }

    /// Bus channel carrying live messages addressed to the user.
    pub fn channel(username: &str) -> String {
        format!("{}-channel", username)
    }

    /// Hint that undelivered records may exist for the user.
    pub fn undelivered(username: &str) -> String {
        format!("{}-undelivered", username)
    }
}

/// Outcome of a bounded wait on a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Payload(String),
    Timeout,
    /// The store dropped the subscription; nothing more will arrive.
    Closed,
}

/// A live subscription to one bus channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    rx: mpsc::Receiver<String>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Wraps a receiver fed by a store backend. `on_drop` runs once when
    /// the subscription goes away.
    pub fn new(
        channel: &str,
        rx: mpsc::Receiver<String>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Subscription {
            channel: channel.to_string(),
            rx,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits up to `wait` for the next payload.
    pub async fn receive_timeout(&mut self, wait: Duration) -> Received {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(payload)) => Received::Payload(payload),
            Ok(None) => Received::Closed,
            Err(_) => Received::Timeout,
        }
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

/// Trait for presence/bus backends.
pub trait PresenceStore: Send + Sync {
    /// Sets `key` to `value`, expiring after `ttl`. Overwrites and re-arms
    /// any existing entry.
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns the live value for `key`, `None` if absent or expired.
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Deletes `key` only if it currently holds `expected`, as one step.
    /// Returns whether an entry was removed.
    fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Publishes `payload` on `channel`. Returns how many subscribers took it.
    fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError>;

    fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    /// Drops expired entries. Returns the number removed.
    fn purge_expired(&self) -> usize;
}

// ============================================================================
// In-Memory Store (single relay instance)
// ============================================================================

#[derive(Debug)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    channels: RwLock<HashMap<String, Vec<(u64, mpsc::Sender<String>)>>>,
    next_subscriber: AtomicU64,
}

impl Inner {
    fn remove_subscriber(&self, channel: &str, id: u64) {
        let Ok(mut channels) = self.channels.write() else {
            return;
        };
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|(sub_id, _)| *sub_id != id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

/// Presence store kept in process memory.
///
/// Expiry uses `tokio::time::Instant`, so tests running with a paused
/// clock can advance past TTLs.
#[derive(Clone, Default)]
pub struct MemoryPresenceStore {
    inner: Arc<Inner>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of channels with at least one subscriber.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Number of subscribers on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .read()
            .map(|c| c.get(channel).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

impl PresenceStore for MemoryPresenceStore {
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.inner.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let entries = self.inner.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone()))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.inner.entries.write().map_err(|_| StoreError::Poisoned)?;
        entries.remove(key);
        Ok(())
    }

    fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut entries = self.inner.entries.write().map_err(|_| StoreError::Poisoned)?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) && entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        let channels = self.inner.channels.read().map_err(|_| StoreError::Poisoned)?;
        let received = channels
            .get(channel)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|(_, tx)| tx.try_send(payload.to_string()).is_ok())
                    .count()
            })
            .unwrap_or(0);
        Ok(received)
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        {
            let mut channels = self.inner.channels.write().map_err(|_| StoreError::Poisoned)?;
            channels.entry(channel.to_string()).or_default().push((id, tx));
        }

        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        Ok(Subscription::new(channel, rx, move || {
            if let Some(inner) = inner.upgrade() {
                inner.remove_subscriber(&name, id);
            }
        }))
    }

    fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let Ok(mut entries) = self.inner.entries.write() else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        before - entries.len()
    }
}
