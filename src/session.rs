// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Connection Session
//!
//! One live duplex connection for one username. The session writes replayed
//! messages while it is still whole, then splits into a reader half (owned by
//! the inbound loop) and a writer half (owned by the bus relay).

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::error::WriteError;
use crate::message::ChatMessage;

/// Any duplex frame transport the relay can drive. Implemented for
/// `tokio_tungstenite::WebSocketStream` and test doubles alike.
pub trait Connection:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send + 'static
{
}

impl<T> Connection for T where
    T: Stream<Item = Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin
        + Send
        + 'static
{
}

/// Lifecycle of a session. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connecting,
    /// Presence marked; replay may be running.
    Online,
    /// Reader and relay running.
    Active,
    Offline,
}

/// What the reader half saw next.
#[derive(Debug)]
pub enum ReadEvent {
    Frame(Message),
    /// The peer closed the connection (close frame, EOF or reset).
    PeerClosed,
    Failed(WsError),
}

/// Whether a read error means the peer simply went away.
fn is_peer_close(err: &WsError) -> bool {
    matches!(
        err,
        WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake)
    )
}

async fn write_message<S>(sink: &mut S, msg: &ChatMessage) -> Result<(), WriteError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let frame = msg.to_frame()?;
    sink.send(frame).await?;
    Ok(())
}

pub struct Session<C> {
    username: String,
    label: String,
    conn: C,
    state: SessionState,
}

impl<C: Connection> Session<C> {
    pub fn new(username: &str, conn: C) -> Self {
        // Short random label so concurrent sessions can be told apart in logs
        let label = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Session {
            username: username.to_string(),
            label,
            conn,
            state: SessionState::Connecting,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Marks the session online. Called once presence is recorded.
    pub fn mark_online(&mut self) {
        debug_assert_eq!(self.state, SessionState::Connecting);
        self.state = SessionState::Online;
        debug!("[{}] {} online", self.label, self.username);
    }

    /// Writes one message while the session is still whole (replay).
    pub async fn send(&mut self, msg: &ChatMessage) -> Result<(), WriteError> {
        write_message(&mut self.conn, msg).await
    }

    /// Splits into the reader and writer halves of the concurrent phase.
    pub fn into_active(self) -> (SessionReader<C>, SessionWriter<C>) {
        let (sink, stream) = self.conn.split();
        debug!("[{}] {} active", self.label, self.username);
        (
            SessionReader {
                stream,
                label: self.label.clone(),
                state: SessionState::Active,
            },
            SessionWriter {
                sink,
                label: self.label,
            },
        )
    }
}

/// Inbound half, owned by the reader loop. Carries the session state from
/// `Active` onwards.
pub struct SessionReader<C> {
    stream: SplitStream<C>,
    label: String,
    state: SessionState,
}

impl<C: Connection> SessionReader<C> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the session to `Offline`. Returns false if it already was.
    pub fn mark_offline(&mut self) -> bool {
        if self.state == SessionState::Offline {
            return false;
        }
        self.state = SessionState::Offline;
        true
    }

    /// Waits for the next data frame. Ping/pong frames are skipped.
    pub async fn next_event(&mut self) -> ReadEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Close(_))) | None => return ReadEvent::PeerClosed,
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(frame)) => return ReadEvent::Frame(frame),
                Some(Err(e)) if is_peer_close(&e) => return ReadEvent::PeerClosed,
                Some(Err(e)) => return ReadEvent::Failed(e),
            }
        }
    }
}

/// Outbound half, owned by the bus relay.
pub struct SessionWriter<C> {
    sink: SplitSink<C, Message>,
    label: String,
}

impl<C: Connection> SessionWriter<C> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub async fn send(&mut self, msg: &ChatMessage) -> Result<(), WriteError> {
        write_message(&mut self.sink, msg).await
    }

    /// Closes the connection. Errors are ignored; the peer may be gone.
    pub async fn close(&mut self) {
        let _ = self.sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Minimal in-memory connection: inbound frames from a channel,
    /// outbound frames into another.
    struct Pipe {
        inbound: mpsc::UnboundedReceiver<Result<Message, WsError>>,
        outbound: mpsc::UnboundedSender<Message>,
    }

    impl Stream for Pipe {
        type Item = Result<Message, WsError>;

        fn poll_next(
            mut self: std::pin::Pin<&mut Self>,
            cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Option<Self::Item>> {
            self.inbound.poll_recv(cx)
        }
    }

    impl Sink<Message> for Pipe {
        type Error = WsError;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), WsError>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.outbound
                .send(item)
                .map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), WsError>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), WsError>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    fn pipe() -> (
        Pipe,
        mpsc::UnboundedSender<Result<Message, WsError>>,
        mpsc::UnboundedReceiver<Message>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            Pipe {
                inbound: in_rx,
                outbound: out_tx,
            },
            in_tx,
            out_rx,
        )
    }

    #[tokio::test]
    async fn test_state_progression_and_send() {
        let (conn, _in_tx, mut out_rx) = pipe();
        let mut session = Session::new("alice", conn);
        assert_eq!(session.state(), SessionState::Connecting);
        assert_eq!(session.username(), "alice");
        assert_eq!(session.label().len(), 8);

        session.mark_online();
        assert_eq!(session.state(), SessionState::Online);

        session
            .send(&ChatMessage::new("bob", "alice", "hi"))
            .await
            .unwrap();
        match out_rx.recv().await.unwrap() {
            Message::Text(text) => assert!(text.contains("\"msg\":\"hi\"")),
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offline_entered_once() {
        let (conn, _in_tx, _out_rx) = pipe();
        let mut session = Session::new("alice", conn);
        session.mark_online();
        let (mut reader, _writer) = session.into_active();
        assert_eq!(reader.state(), SessionState::Active);

        assert!(reader.mark_offline());
        assert_eq!(reader.state(), SessionState::Offline);
        assert!(!reader.mark_offline());
    }

    #[tokio::test]
    async fn test_reader_skips_control_frames() {
        let (conn, in_tx, _out_rx) = pipe();
        let (mut reader, _writer) = Session::new("alice", conn).into_active();

        in_tx.send(Ok(Message::Ping(vec![1]))).unwrap();
        in_tx
            .send(Ok(Message::Text("payload".into())))
            .unwrap();
        in_tx.send(Ok(Message::Close(None))).unwrap();

        assert!(matches!(
            reader.next_event().await,
            ReadEvent::Frame(Message::Text(t)) if t == "payload"
        ));
        assert!(matches!(reader.next_event().await, ReadEvent::PeerClosed));
    }

    #[tokio::test]
    async fn test_reader_classifies_errors() {
        let (conn, in_tx, _out_rx) = pipe();
        let (mut reader, _writer) = Session::new("alice", conn).into_active();

        in_tx
            .send(Err(WsError::Protocol(
                ProtocolError::ResetWithoutClosingHandshake,
            )))
            .unwrap();
        in_tx.send(Err(WsError::Utf8)).unwrap();

        assert!(matches!(reader.next_event().await, ReadEvent::PeerClosed));
        assert!(matches!(
            reader.next_event().await,
            ReadEvent::Failed(WsError::Utf8)
        ));

        drop(in_tx);
        assert!(matches!(reader.next_event().await, ReadEvent::PeerClosed));
    }

    #[tokio::test]
    async fn test_writer_reports_closed_peer() {
        let (conn, _in_tx, out_rx) = pipe();
        let (_reader, mut writer) = Session::new("alice", conn).into_active();
        drop(out_rx);

        let result = writer.send(&ChatMessage::new("bob", "alice", "hi")).await;
        assert!(matches!(result, Err(WriteError::Connection(_))));
    }
}
