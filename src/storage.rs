// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Message Log
//!
//! Durable record of chat messages with a delivered flag. Records are
//! appended once and later flipped to delivered; nothing here deletes them.
//! Supports both in-memory (for testing) and SQLite (for production).

use std::path::Path;
use std::sync::{Mutex, RwLock};

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::StorageError;
use crate::message::ChatMessage;

/// A persisted chat message.
///
/// `read_at` is set if and only if `delivered` is true. The constructors
/// below are the only way the relay builds records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Store-assigned id. Zero until appended.
    pub id: i64,
    pub receiver_id: String,
    pub sender_id: String,
    pub msg: String,
    pub delivered: bool,
    pub send_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
}

impl MessageRecord {
    /// A message that could not be handed over live.
    pub fn undelivered(message: &ChatMessage, send_at: DateTime<Utc>) -> Self {
        MessageRecord {
            id: 0,
            receiver_id: message.receiver_id.clone(),
            sender_id: message.sender_id.clone(),
            msg: message.msg.clone(),
            delivered: false,
            send_at: Some(send_at),
            read_at: None,
        }
    }

    /// A message written to the recipient's connection at `at`.
    pub fn delivered(message: &ChatMessage, at: DateTime<Utc>) -> Self {
        MessageRecord {
            id: 0,
            receiver_id: message.receiver_id.clone(),
            sender_id: message.sender_id.clone(),
            msg: message.msg.clone(),
            delivered: true,
            send_at: Some(at),
            read_at: Some(at),
        }
    }

    /// The message a replay sends to the recipient.
    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            sender_id: self.sender_id.clone(),
            receiver_id: self.receiver_id.clone(),
            msg: self.msg.clone(),
            send_dtm: self.send_at,
        }
    }
}

/// Trait for message log backends.
pub trait MessageLog: Send + Sync {
    /// Appends a record and returns its assigned id.
    fn append(&self, record: MessageRecord) -> Result<i64, StorageError>;

    /// All undelivered records for `receiver_id`, oldest first.
    fn find_undelivered_by_receiver(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError>;

    /// Marks the given records delivered at `at` in one batch. Returns the
    /// number of records that changed.
    fn mark_delivered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize, StorageError>;

    fn get(&self, id: i64) -> Result<Option<MessageRecord>, StorageError>;

    /// Total number of records.
    fn record_count(&self) -> usize;
}

// ============================================================================
// In-Memory Log (for testing and development)
// ============================================================================

/// In-memory log kept in insertion order.
#[derive(Default)]
pub struct MemoryMessageLog {
    records: RwLock<Vec<MessageRecord>>,
}

impl MemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every record, in insertion order.
    pub fn all(&self) -> Vec<MessageRecord> {
        self.records.read().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MessageLog for MemoryMessageLog {
    fn append(&self, mut record: MessageRecord) -> Result<i64, StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        record.id = records.len() as i64 + 1;
        let id = record.id;
        records.push(record);
        Ok(id)
    }

    fn find_undelivered_by_receiver(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        Ok(records
            .iter()
            .filter(|r| r.receiver_id == receiver_id && !r.delivered)
            .cloned()
            .collect())
    }

    fn mark_delivered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut records = self.records.write().map_err(|_| StorageError::Poisoned)?;
        let mut changed = 0;
        for record in records.iter_mut() {
            if !record.delivered && ids.contains(&record.id) {
                record.delivered = true;
                record.read_at = Some(at);
                changed += 1;
            }
        }
        Ok(changed)
    }

    fn get(&self, id: i64) -> Result<Option<MessageRecord>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::Poisoned)?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    fn record_count(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }
}

// ============================================================================
// SQLite Log (for production)
// ============================================================================

/// SQLite-backed message log.
pub struct SqliteMessageLog {
    conn: Mutex<Connection>,
}

fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|t| t.timestamp_millis())
}

fn from_millis(id: i64, millis: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    match millis {
        None => Ok(None),
        Some(ms) => DateTime::from_timestamp_millis(ms)
            .map(Some)
            .ok_or(StorageError::BadTimestamp(id)),
    }
}

struct RawRow {
    id: i64,
    receiver_id: String,
    sender_id: String,
    msg: String,
    is_read: bool,
    send_dtm: Option<i64>,
    read_dtm: Option<i64>,
}

impl RawRow {
    const COLUMNS: &'static str =
        "id, receiver_id, sender_id, msg, is_read, send_dtm, read_dtm";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawRow {
            id: row.get(0)?,
            receiver_id: row.get(1)?,
            sender_id: row.get(2)?,
            msg: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            is_read: row.get(4)?,
            send_dtm: row.get(5)?,
            read_dtm: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<MessageRecord, StorageError> {
        Ok(MessageRecord {
            id: self.id,
            send_at: from_millis(self.id, self.send_dtm)?,
            read_at: from_millis(self.id, self.read_dtm)?,
            receiver_id: self.receiver_id,
            sender_id: self.sender_id,
            msg: self.msg,
            delivered: self.is_read,
        })
    }
}

impl SqliteMessageLog {
    /// Opens or creates a SQLite database at the given path and bootstraps
    /// the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;

        // WAL lets replay reads proceed while forwards append
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chat_message (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                receiver_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                msg TEXT,
                is_read INTEGER NOT NULL DEFAULT 0,
                send_dtm INTEGER,
                read_dtm INTEGER
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_message_unread
             ON chat_message(receiver_id, is_read)",
            [],
        )?;

        Ok(SqliteMessageLog {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory SQLite database.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open(":memory:")
    }
}

impl MessageLog for SqliteMessageLog {
    fn append(&self, record: MessageRecord) -> Result<i64, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(
            "INSERT INTO chat_message (receiver_id, sender_id, msg, is_read, send_dtm, read_dtm)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.receiver_id,
                record.sender_id,
                record.msg,
                record.delivered,
                to_millis(record.send_at),
                to_millis(record.read_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn find_undelivered_by_receiver(
        &self,
        receiver_id: &str,
    ) -> Result<Vec<MessageRecord>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM chat_message
             WHERE receiver_id = ?1 AND is_read = 0
             ORDER BY id ASC",
            RawRow::COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![receiver_id], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRow::into_record).collect()
    }

    fn mark_delivered(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let placeholders = (0..ids.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE chat_message SET is_read = 1, read_dtm = ?1
             WHERE is_read = 0 AND id IN ({})",
            placeholders
        );
        let values = std::iter::once(at.timestamp_millis()).chain(ids.iter().copied());

        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(conn.execute(&sql, params_from_iter(values))?)
    }

    fn get(&self, id: i64) -> Result<Option<MessageRecord>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM chat_message WHERE id = ?1", RawRow::COLUMNS),
                params![id],
                RawRow::from_row,
            )
            .optional()?;
        row.map(RawRow::into_record).transpose()
    }

    fn record_count(&self) -> usize {
        let Ok(conn) = self.conn.lock() else {
            return 0;
        };
        conn.query_row("SELECT COUNT(*) FROM chat_message", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap_or(0) as usize
    }
}

// ============================================================================
// Storage Factory
// ============================================================================

/// Message log backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageBackend {
    /// In-memory log (lost on restart).
    Memory,
    /// SQLite persistent log.
    #[default]
    Sqlite,
}

/// Creates a message log for the backend, creating `data_dir` if needed.
pub fn create_message_log(
    backend: StorageBackend,
    data_dir: &Path,
) -> Result<Box<dyn MessageLog>, StorageError> {
    match backend {
        StorageBackend::Memory => Ok(Box::new(MemoryMessageLog::new())),
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(data_dir)?;
            Ok(Box::new(SqliteMessageLog::open(data_dir.join("messages.db"))?))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
