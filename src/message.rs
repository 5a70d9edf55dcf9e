// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire Messages
//!
//! `ChatMessage` is what clients send and receive as JSON text frames.
//! Between relays it travels wrapped in a `BusPayload`, a closed set of
//! tagged kinds decoded once at the subscription boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::error::CodecError;

/// A routed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(rename = "senderId", default)]
    pub sender_id: String,
    #[serde(rename = "receiverId", default)]
    pub receiver_id: String,
    #[serde(default)]
    pub msg: String,
    /// Send time set by the forwarder, overwritten with the receive
    /// instant by the relay that hands it to the recipient.
    #[serde(rename = "send_dtm", default)]
    pub send_dtm: Option<DateTime<Utc>>,
}

impl ChatMessage {
    pub fn new(sender_id: &str, receiver_id: &str, msg: &str) -> Self {
        ChatMessage {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            msg: msg.to_string(),
            send_dtm: None,
        }
    }

    /// Decodes a client frame. Rejects messages without a receiver since
    /// they cannot be routed anywhere.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let msg: ChatMessage = serde_json::from_slice(data)?;
        if msg.receiver_id.is_empty() {
            return Err(CodecError::MissingReceiver);
        }
        Ok(msg)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Encodes into a text frame ready for the connection.
    pub fn to_frame(&self) -> Result<Message, CodecError> {
        Ok(Message::Text(self.encode()?))
    }
}

/// Payloads carried on a user's bus channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BusPayload {
    Chat(ChatMessage),
    #[serde(other)]
    Unknown,
}

impl BusPayload {
    pub fn decode(payload: &str) -> Result<Self, CodecError> {
        Ok(serde_json::from_str(payload)?)
    }

    pub fn encode(&self) -> Result<String, CodecError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Extracts the payload bytes of a data frame, enforcing the size limit.
pub fn frame_bytes(frame: Message, max_size: usize) -> Result<Vec<u8>, CodecError> {
    let data = match frame {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(data) => data,
        _ => return Err(CodecError::UnsupportedFrame),
    };
    if data.len() > max_size {
        return Err(CodecError::TooLarge(data.len()));
    }
    Ok(data)
}
