// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures_util::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use presence_relay::config::RelayConfig;
use presence_relay::context::{ManualClock, RelayContext};
use presence_relay::error::{StorageError, StoreError};
use presence_relay::message::ChatMessage;
use presence_relay::presence::{MemoryPresenceStore, PresenceStore, Subscription};
use presence_relay::router::RouterService;
use presence_relay::storage::{MemoryMessageLog, MessageLog, MessageRecord};

/// Bus wait used by tests, short so teardown is quick.
pub const TEST_RECEIVE_WAIT_MS: u64 = 50;

// ============================================================================
// Fake connection
// ============================================================================

/// In-memory duplex connection driven by a [`FakeClient`].
pub struct FakeConnection {
    inbound: mpsc::UnboundedReceiver<Result<Message, WsError>>,
    outbound: mpsc::UnboundedSender<Message>,
    /// Writes allowed before every further write fails.
    writes_left: Option<usize>,
}

/// The client end of a [`FakeConnection`].
pub struct FakeClient {
    tx: Option<mpsc::UnboundedSender<Result<Message, WsError>>>,
    rx: mpsc::UnboundedReceiver<Message>,
}

#[allow(dead_code)]
pub fn fake_connection() -> (FakeConnection, FakeClient) {
    fake_connection_failing_after(None)
}

/// Connection whose writes start failing after `writes` successful ones.
#[allow(dead_code)]
pub fn fake_connection_failing_after(writes: Option<usize>) -> (FakeConnection, FakeClient) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    (
        FakeConnection {
            inbound: in_rx,
            outbound: out_tx,
            writes_left: writes,
        },
        FakeClient {
            tx: Some(in_tx),
            rx: out_rx,
        },
    )
}

impl Stream for FakeConnection {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}

impl Sink<Message> for FakeConnection {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
        match self.writes_left {
            Some(0) => return Err(WsError::ConnectionClosed),
            Some(ref mut left) => *left -= 1,
            None => {}
        }
        self.outbound
            .send(item)
            .map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
        Poll::Ready(Ok(()))
    }
}

#[allow(dead_code)]
impl FakeClient {
    /// Sends a chat message as a text frame.
    pub fn send_chat(&self, msg: &ChatMessage) {
        self.send_frame(Message::Text(serde_json::to_string(msg).unwrap()));
    }

    pub fn send_frame(&self, frame: Message) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Makes the connection report a read error.
    pub fn send_error(&self, err: WsError) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(err));
        }
    }

    /// Hangs up (end of stream on the relay side).
    pub fn hang_up(&mut self) {
        self.tx = None;
    }

    /// Next chat message written by the relay, if one arrives in time.
    pub async fn recv_chat(&mut self, wait: Duration) -> Option<ChatMessage> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(Message::Text(text))) => Some(serde_json::from_str(&text).unwrap()),
            Ok(Some(other)) => panic!("unexpected frame {:?}", other),
            _ => None,
        }
    }

    /// Whether the relay wrote nothing within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.rx.recv()).await.is_err()
    }
}

// ============================================================================
// Log and store wrappers
// ============================================================================

/// Runs once, right after the next undelivered lookup returns.
pub type AfterFind = Box<dyn FnOnce() + Send>;

/// Message log that counts reads and can be told to fail batch updates.
#[derive(Default)]
pub struct CountingLog {
    pub inner: MemoryMessageLog,
    pub find_calls: AtomicUsize,
    pub fail_mark_delivered: AtomicBool,
    pub after_find: Mutex<Option<AfterFind>>,
}

#[allow(dead_code)]
impl CountingLog {
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }

    pub fn all(&self) -> Vec<MessageRecord> {
        self.inner.all()
    }
}

impl MessageLog for CountingLog {
    fn append(&self, record: MessageRecord) -> Result<i64, StorageError> {
        self.inner.append(record)
    }

    fn find_undelivered_by_receiver(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let records = self.inner.find_undelivered_by_receiver(receiver_id);
        let hook = self.after_find.lock().ok().and_then(|mut hook| hook.take());
        if let Some(hook) = hook {
            hook();
        }
        records
    }

    fn mark_delivered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize, StorageError> {
        if self.fail_mark_delivered.load(Ordering::SeqCst) {
            return Err(StorageError::Poisoned);
        }
        self.inner.mark_delivered(ids, at)
    }

    fn get(&self, id: i64) -> Result<Option<MessageRecord>, StorageError> {
        self.inner.get(id)
    }

    fn record_count(&self) -> usize {
        self.inner.record_count()
    }
}

/// Message log where every operation fails.
#[allow(dead_code)]
pub struct FailingLog;

impl MessageLog for FailingLog {
    fn append(&self, _record: MessageRecord) -> Result<i64, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn find_undelivered_by_receiver(&self, _: &str) -> Result<Vec<MessageRecord>, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn mark_delivered(&self, _: &[i64], _: DateTime<Utc>) -> Result<usize, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn get(&self, _: i64) -> Result<Option<MessageRecord>, StorageError> {
        Err(StorageError::Poisoned)
    }

    fn record_count(&self) -> usize {
        0
    }
}

/// Presence store whose lookups and publishes fail while `broken` is set.
/// Writes and subscriptions go to the wrapped store.
#[derive(Default)]
pub struct FlakyPresenceStore {
    pub inner: MemoryPresenceStore,
    pub broken: AtomicBool,
}

impl FlakyPresenceStore {
    fn check(&self) -> Result<(), StoreError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("connection refused".into()));
        }
        Ok(())
    }
}

impl PresenceStore for FlakyPresenceStore {
    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.inner.set(key, value, ttl)
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check()?;
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key)
    }

    fn delete_if(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.inner.delete_if(key, expected)
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<usize, StoreError> {
        self.check()?;
        self.inner.publish(channel, payload)
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.inner.subscribe(channel)
    }

    fn purge_expired(&self) -> usize {
        self.inner.purge_expired()
    }
}

// ============================================================================
// Relay fixture
// ============================================================================

#[allow(dead_code)]
pub fn test_config() -> RelayConfig {
    RelayConfig {
        receive_wait_ms: TEST_RECEIVE_WAIT_MS,
        ..RelayConfig::default()
    }
}

#[allow(dead_code)]
pub fn start_instant() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// A router over memory stores with a manual clock.
#[allow(dead_code)]
pub struct TestRelay {
    pub router: RouterService,
    pub presence: Arc<FlakyPresenceStore>,
    pub log: Arc<CountingLog>,
    pub clock: Arc<ManualClock>,
}

#[allow(dead_code)]
impl TestRelay {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: RelayConfig) -> Self {
        let presence = Arc::new(FlakyPresenceStore::default());
        let log = Arc::new(CountingLog::default());
        let clock = Arc::new(ManualClock::new(start_instant()));
        let ctx = RelayContext::new(config, presence.clone(), log.clone())
            .with_clock(clock.clone());
        TestRelay {
            router: RouterService::new(ctx),
            presence,
            log,
            clock,
        }
    }

    /// Attaches `username` over a fresh fake connection on its own task.
    pub fn connect(&self, username: &str) -> (FakeClient, tokio::task::JoinHandle<()>) {
        let (conn, client) = fake_connection();
        (client, self.attach_with(username, conn))
    }

    pub fn attach_with(
        &self,
        username: &str,
        conn: FakeConnection,
    ) -> tokio::task::JoinHandle<()> {
        let router = self.router.clone();
        let username = username.to_string();
        tokio::spawn(async move {
            router.attach(&username, conn).await.unwrap();
        })
    }

    pub fn store(&self) -> &MemoryPresenceStore {
        &self.presence.inner
    }

    pub fn is_online(&self, username: &str) -> bool {
        self.store()
            .get(&presence_relay::presence::keys::online(username))
            .unwrap()
            .is_some()
    }

    pub fn has_undelivered_hint(&self, username: &str) -> bool {
        self.store()
            .get(&presence_relay::presence::keys::undelivered(username))
            .unwrap()
            .is_some()
    }

    /// Waits until `username`'s bus subscription is live.
    pub async fn wait_subscribed(&self, username: &str) {
        let channel = presence_relay::presence::keys::channel(username);
        let store = self.store().clone();
        assert!(
            wait_until(Duration::from_secs(2), || store.subscriber_count(&channel) > 0).await,
            "{} never subscribed",
            username
        );
    }
}

/// Polls `check` until it holds or `limit` passes.
#[allow(dead_code)]
pub async fn wait_until<F: FnMut() -> bool>(limit: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
