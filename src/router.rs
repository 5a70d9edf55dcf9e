// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Router Service
//!
//! Drives one session from attach to disconnect:
//!
//! 1. Mark the user online.
//! 2. Replay undelivered records if the undelivered hint is set.
//! 3. Run the inbound reader and the bus relay until either one sees the
//!    connection end, then clear presence.
//!
//! Every inbound message is forwarded on its own task. A forward publishes
//! to the receiver's bus channel when the receiver looks online and falls
//! back to the durable log otherwise. Store and log failures are logged and
//! never reported to the sender.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::RelayContext;
use crate::error::{AttachError, WriteError};
use crate::message::{frame_bytes, BusPayload, ChatMessage};
use crate::presence::{keys, Received, Subscription};
use crate::session::{Connection, ReadEvent, Session, SessionReader, SessionWriter};
use crate::storage::MessageRecord;

/// Routes messages between attached sessions. Cheap to clone; every clone
/// shares the same stores.
#[derive(Clone)]
pub struct RouterService {
    ctx: RelayContext,
}

impl RouterService {
    pub fn new(ctx: RelayContext) -> Self {
        RouterService { ctx }
    }

    pub fn context(&self) -> &RelayContext {
        &self.ctx
    }

    /// Runs a session for `username` over an already upgraded connection.
    ///
    /// Returns once the connection is gone. An empty username is rejected
    /// before anything is written to the stores.
    pub async fn attach<C: Connection>(&self, username: &str, conn: C) -> Result<(), AttachError> {
        if username.is_empty() {
            return Err(AttachError::MissingUsername);
        }

        let mut session = Session::new(username, conn);
        self.ctx.metrics.connections_total.inc();
        self.ctx.metrics.connections_active.inc();

        self.go_online(&mut session);
        let replayed = self.replay_undelivered(&mut session).await;
        if replayed > 0 {
            info!("[{}] Replayed {} queued messages", session.label(), replayed);
        }
        self.run_active(session).await;

        self.ctx.metrics.connections_active.dec();
        Ok(())
    }

    fn go_online<C: Connection>(&self, session: &mut Session<C>) {
        let key = keys::online(session.username());
        info!("[{}] {} is now online", session.label(), session.username());
        if let Err(e) = self
            .ctx
            .presence
            .set(&key, session.label(), self.ctx.config.presence_ttl())
        {
            self.ctx.metrics.store_errors.inc();
            error!("[{}] Failed to record presence: {}", session.label(), e);
        }
        session.mark_online();
    }

    /// Takes the session offline once. Presence is removed only while it
    /// still carries this session's label, so a newer session for the same
    /// user keeps its entry.
    fn go_offline<C: Connection>(&self, reader: &mut SessionReader<C>, username: &str) {
        if !reader.mark_offline() {
            return;
        }
        let label = reader.label();
        match self.ctx.presence.delete_if(&keys::online(username), label) {
            Ok(true) => {}
            Ok(false) => debug!("[{}] Presence owned by a newer session, leaving it", label),
            Err(e) => {
                self.ctx.metrics.store_errors.inc();
                error!("[{}] Failed to clear presence: {}", label, e);
            }
        }
        info!("[{}] {} is now offline", label, username);
    }

    /// Writes queued records to the connection in log order and marks the
    /// written ones delivered. Returns how many were written.
    ///
    /// The hint is cleared before the lookup, so a message queued while the
    /// replay runs sets it again. It is re-armed unless every fetched record
    /// was written and marked delivered; a failed write stops the loop and
    /// leaves the rest for the next connection.
    async fn replay_undelivered<C: Connection>(&self, session: &mut Session<C>) -> usize {
        let label = session.label().to_string();
        let username = session.username().to_string();
        let hint_key = keys::undelivered(&username);

        match self.ctx.presence.get(&hint_key) {
            Ok(Some(_)) => {}
            Ok(None) => return 0,
            Err(e) => {
                self.ctx.metrics.store_errors.inc();
                error!("[{}] Failed to read undelivered hint: {}", label, e);
                return 0;
            }
        }

        if let Err(e) = self.ctx.presence.delete(&hint_key) {
            self.ctx.metrics.store_errors.inc();
            error!("[{}] Failed to clear undelivered hint: {}", label, e);
        }

        let records = match self.ctx.log.find_undelivered_by_receiver(&username) {
            Ok(records) => records,
            Err(e) => {
                self.ctx.metrics.persistence_errors.inc();
                error!("[{}] Failed to load queued messages: {}", label, e);
                self.arm_hint(&username, self.ctx.clock.now());
                return 0;
            }
        };

        let mut acknowledged = Vec::with_capacity(records.len());
        for record in &records {
            if let Err(e) = session.send(&record.to_chat_message()).await {
                warn!("[{}] Replay interrupted: {}", label, e);
                break;
            }
            acknowledged.push(record.id);
        }

        let now = self.ctx.clock.now();
        if acknowledged.is_empty() {
            self.arm_hint(&username, now);
            return 0;
        }
        self.ctx
            .metrics
            .messages_replayed
            .inc_by(acknowledged.len() as u64);

        if let Err(e) = self.ctx.log.mark_delivered(&acknowledged, now) {
            self.ctx.metrics.persistence_errors.inc();
            error!("[{}] Failed to mark replayed messages: {}", label, e);
            self.arm_hint(&username, now);
        } else if acknowledged.len() < records.len() {
            debug!(
                "[{}] {} queued messages left for the next connection",
                label,
                records.len() - acknowledged.len()
            );
            self.arm_hint(&username, now);
        }
        acknowledged.len()
    }

    async fn run_active<C: Connection>(&self, session: Session<C>) {
        let username = session.username().to_string();
        let (reader, writer) = session.into_active();
        debug!("[{}] state {:?}", reader.label(), reader.state());

        let subscription = match self.ctx.presence.subscribe(&keys::channel(&username)) {
            Ok(sub) => Some(sub),
            Err(e) => {
                self.ctx.metrics.store_errors.inc();
                error!("[{}] Failed to subscribe: {}", reader.label(), e);
                None
            }
        };

        let cancel = CancellationToken::new();
        let relay = tokio::spawn({
            let router = self.clone();
            let cancel = cancel.clone();
            async move { router.relay_bus(writer, subscription, cancel).await }
        });

        self.read_inbound(reader, &username, &cancel).await;

        if let Err(e) = relay.await {
            error!("Bus relay task for {} failed: {}", username, e);
        }
    }

    /// Reads client frames until the connection ends or the relay cancels,
    /// then takes the session offline.
    async fn read_inbound<C: Connection>(
        &self,
        mut reader: SessionReader<C>,
        username: &str,
        cancel: &CancellationToken,
    ) {
        let label = reader.label().to_string();
        let in_flight = Arc::new(Semaphore::new(self.ctx.config.max_in_flight_forwards.max(1)));
        let max_size = self.ctx.config.max_message_size;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("[{}] Relay ended the session", label);
                    break;
                }
                event = reader.next_event() => event,
            };

            let frame = match event {
                ReadEvent::Frame(frame) => frame,
                ReadEvent::PeerClosed => {
                    debug!("[{}] Disconnected", label);
                    break;
                }
                ReadEvent::Failed(e) => {
                    error!("[{}] Cannot read message from client: {}", label, e);
                    break;
                }
            };

            let mut msg = match frame_bytes(frame, max_size)
                .and_then(|data| ChatMessage::decode(&data))
            {
                Ok(msg) => msg,
                Err(e) => {
                    self.ctx.metrics.messages_dropped.inc();
                    warn!("[{}] Dropping invalid message: {}", label, e);
                    continue;
                }
            };
            if msg.sender_id.is_empty() {
                msg.sender_id = username.to_string();
            }
            self.ctx.metrics.messages_received.inc();

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let router = self.clone();
            tokio::spawn(async move {
                router.forward(msg);
                drop(permit);
            });
        }

        self.go_offline(&mut reader, username);
        cancel.cancel();
    }

    /// Routes one client message: live through the bus when the receiver is
    /// online and listening, otherwise into the durable log.
    pub fn forward(&self, msg: ChatMessage) {
        let receiver = msg.receiver_id.as_str();

        match self.ctx.presence.get(&keys::online(receiver)) {
            Ok(Some(_)) => match self.publish(&msg) {
                Ok(received) if received > 0 => {
                    self.ctx.metrics.messages_published.inc();
                    debug!("Published message for {} to {} subscribers", receiver, received);
                    return;
                }
                Ok(_) => info!("No listener on {}, queueing message", keys::channel(receiver)),
                Err(e) => {
                    self.ctx.metrics.store_errors.inc();
                    error!("Failed to publish for {}, queueing message: {}", receiver, e);
                }
            },
            Ok(None) => info!("{} is not online, queueing message", receiver),
            Err(e) => {
                self.ctx.metrics.store_errors.inc();
                error!("Presence lookup for {} failed, queueing message: {}", receiver, e);
            }
        }

        self.queue_offline(&msg);
    }

    fn publish(&self, msg: &ChatMessage) -> Result<usize, String> {
        let payload = BusPayload::Chat(msg.clone())
            .encode()
            .map_err(|e| e.to_string())?;
        self.ctx
            .presence
            .publish(&keys::channel(&msg.receiver_id), &payload)
            .map_err(|e| e.to_string())
    }

    /// Persists `msg` as undelivered and re-arms the receiver's hint.
    fn queue_offline(&self, msg: &ChatMessage) {
        let now = self.ctx.clock.now();
        match self.ctx.log.append(MessageRecord::undelivered(msg, now)) {
            Ok(id) => {
                self.ctx.metrics.messages_queued.inc();
                debug!("Queued message {} for {}", id, msg.receiver_id);
            }
            Err(e) => {
                self.ctx.metrics.persistence_errors.inc();
                error!("Failed to queue message for {}: {}", msg.receiver_id, e);
            }
        }

        self.arm_hint(&msg.receiver_id, now);
    }

    /// Sets the receiver's undelivered hint with a fresh expiry.
    fn arm_hint(&self, receiver: &str, at: DateTime<Utc>) {
        if let Err(e) = self.ctx.presence.set(
            &keys::undelivered(receiver),
            &at.to_rfc3339(),
            self.ctx.config.undelivered_ttl(),
        ) {
            self.ctx.metrics.store_errors.inc();
            error!("Failed to set undelivered hint for {}: {}", receiver, e);
        }
    }

    /// Relays bus payloads to the connection until cancelled or a write
    /// fails. A failed write closes the connection and cancels the reader.
    async fn relay_bus<C: Connection>(
        &self,
        mut writer: SessionWriter<C>,
        subscription: Option<Subscription>,
        cancel: CancellationToken,
    ) {
        let label = writer.label().to_string();
        let Some(mut subscription) = subscription else {
            cancel.cancelled().await;
            return;
        };
        let wait = self.ctx.config.receive_wait();

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = subscription.receive_timeout(wait) => received,
            };

            match received {
                Received::Timeout => continue,
                Received::Closed => {
                    warn!("[{}] Subscription closed by the store", label);
                    break;
                }
                Received::Payload(payload) => {
                    if let Err(e) = self.deliver(&mut writer, &payload).await {
                        warn!("[{}] Failed to deliver live message: {}", label, e);
                        writer.close().await;
                        cancel.cancel();
                        break;
                    }
                }
            }
        }

        debug!("[{}] Stop relaying {}", label, subscription.channel());
        subscription.unsubscribe();
    }

    /// Writes one bus payload to the connection, stamped with the delivery
    /// instant, and records it as already read.
    ///
    /// Only a failed write is an error; undecodable payloads are skipped.
    async fn deliver<C: Connection>(
        &self,
        writer: &mut SessionWriter<C>,
        payload: &str,
    ) -> Result<(), WriteError> {
        let mut msg = match BusPayload::decode(payload) {
            Ok(BusPayload::Chat(msg)) => msg,
            Ok(BusPayload::Unknown) => {
                debug!("[{}] Ignoring unknown bus payload", writer.label());
                return Ok(());
            }
            Err(e) => {
                warn!("[{}] Malformed bus payload: {}", writer.label(), e);
                return Ok(());
            }
        };

        let now = self.ctx.clock.now();
        msg.send_dtm = Some(now);
        writer.send(&msg).await?;
        self.ctx.metrics.messages_delivered_live.inc();

        if let Err(e) = self.ctx.log.append(MessageRecord::delivered(&msg, now)) {
            self.ctx.metrics.persistence_errors.inc();
            error!("[{}] Failed to record delivered message: {}", writer.label(), e);
        }
        Ok(())
    }
}
