//! Typed realtime events parsed at the transport boundary.
//!
//! The realtime transport delivers row-change payloads as loosely typed JSON:
//!
//! ```json
//! { "table": "messages", "eventType": "INSERT", "new": { ... }, "old": {} }
//! ```
//!
//! [`RealtimeEvent::from_json`] turns a payload into one of three variants, so
//! the reconciliation layer never inspects untyped fields.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::message::{AttachmentRef, Message, MessageId, ThreadId, Timestamp, UserId};

/// Table holding chat messages.
pub const MESSAGES_TABLE: &str = "messages";

/// Table holding one row per (message, user, emoji) reaction.
pub const REACTIONS_TABLE: &str = "message_reactions";

/// Kind of row change reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// Delivery/read fields of an updated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageStatusUpdate {
    /// Message whose status changed.
    pub id: MessageId,
    /// Owning thread.
    pub thread_id: ThreadId,
    /// Delivery time, if delivered.
    pub delivered_at: Option<Timestamp>,
    /// Everyone who has read the message.
    pub read_by: BTreeSet<UserId>,
}

/// A realtime event for a subscribed thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealtimeEvent {
    /// A new message row, including echoes of the viewer's own sends.
    MessageInserted(Message),
    /// Delivery/read receipt change on an existing message.
    MessageUpdated(MessageStatusUpdate),
    /// A reaction was added or removed on a message.
    ReactionChanged {
        /// Message whose reactions changed.
        message_id: MessageId,
        /// Whether the reaction row was added, changed or removed.
        kind: ChangeKind,
    },
}

impl RealtimeEvent {
    /// Parses a raw change payload.
    ///
    /// # Errors
    ///
    /// Returns [`EventParseError`] if the payload is not valid JSON, refers
    /// to an unknown table, is a change kind the layer does not consume, or
    /// lacks the row it needs.
    pub fn from_json(payload: &str) -> Result<Self, EventParseError> {
        let raw: RawChange = serde_json::from_str(payload)?;
        Self::from_change(raw)
    }

    /// Parses an already-decoded change payload.
    ///
    /// # Errors
    ///
    /// Same as [`from_json`](Self::from_json).
    pub fn from_value(payload: Value) -> Result<Self, EventParseError> {
        let raw: RawChange = serde_json::from_value(payload)?;
        Self::from_change(raw)
    }

    /// Thread the event belongs to, when the payload carries it.
    ///
    /// Reaction rows do not reference their thread.
    #[must_use]
    pub const fn thread_id(&self) -> Option<&ThreadId> {
        match self {
            Self::MessageInserted(msg) => Some(&msg.thread_id),
            Self::MessageUpdated(update) => Some(&update.thread_id),
            Self::ReactionChanged { .. } => None,
        }
    }

    fn from_change(raw: RawChange) -> Result<Self, EventParseError> {
        match (raw.table.as_str(), raw.event_type) {
            (MESSAGES_TABLE, ChangeKind::Insert) => {
                let row: MessageRow = take_row(raw.new, MESSAGES_TABLE, raw.event_type)?;
                Ok(Self::MessageInserted(row.into_message()))
            }
            (MESSAGES_TABLE, ChangeKind::Update) => {
                let row: MessageRow = take_row(raw.new, MESSAGES_TABLE, raw.event_type)?;
                Ok(Self::MessageUpdated(MessageStatusUpdate {
                    id: MessageId::new(row.id),
                    thread_id: ThreadId::new(row.thread_id),
                    delivered_at: row.delivered_at.map(to_timestamp),
                    read_by: row
                        .read_by
                        .unwrap_or_default()
                        .into_iter()
                        .map(UserId::new)
                        .collect(),
                }))
            }
            (MESSAGES_TABLE, kind) => Err(EventParseError::Unsupported {
                table: MESSAGES_TABLE,
                kind,
            }),
            (REACTIONS_TABLE, kind) => {
                let source = if kind == ChangeKind::Delete {
                    raw.old
                } else {
                    raw.new
                };
                let row: ReactionKey = take_row(source, REACTIONS_TABLE, kind)?;
                Ok(Self::ReactionChanged {
                    message_id: MessageId::new(row.message_id),
                    kind,
                })
            }
            (other, _) => Err(EventParseError::UnknownTable(other.to_string())),
        }
    }
}

/// Error returned when a realtime payload cannot be turned into an event.
#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
    /// The payload or its row did not match the expected shape.
    #[error("malformed realtime payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The change refers to a table this layer does not subscribe to.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// The change kind is not consumed for this table.
    #[error("unsupported {kind:?} change on {table}")]
    Unsupported {
        /// Table name.
        table: &'static str,
        /// Change kind.
        kind: ChangeKind,
    },

    /// The row needed for this change was absent or empty.
    #[error("{kind:?} change on {table} carries no row")]
    MissingRow {
        /// Table name.
        table: &'static str,
        /// Change kind.
        kind: ChangeKind,
    },
}

#[derive(Debug, Deserialize)]
struct RawChange {
    table: String,
    #[serde(rename = "eventType")]
    event_type: ChangeKind,
    #[serde(default)]
    new: Option<Value>,
    #[serde(default)]
    old: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct MessageRow {
    id: String,
    thread_id: String,
    sender_id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Option<Vec<AttachmentRef>>,
    #[serde(default)]
    reply_to_id: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    read_by: Option<Vec<String>>,
}

impl MessageRow {
    fn into_message(self) -> Message {
        Message {
            id: MessageId::new(self.id),
            thread_id: ThreadId::new(self.thread_id),
            sender_id: UserId::new(self.sender_id),
            sender: None,
            content: self.content,
            attachments: self.attachments.unwrap_or_default(),
            reply_to_id: self.reply_to_id.map(MessageId::new),
            reply_to: None,
            created_at: to_timestamp(self.created_at),
            delivered_at: self.delivered_at.map(to_timestamp),
            read_by: self
                .read_by
                .unwrap_or_default()
                .into_iter()
                .map(UserId::new)
                .collect(),
            reactions: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReactionKey {
    message_id: String,
}

fn take_row<T: for<'de> Deserialize<'de>>(
    row: Option<Value>,
    table: &'static str,
    kind: ChangeKind,
) -> Result<T, EventParseError> {
    match row {
        Some(Value::Object(map)) if !map.is_empty() => {
            Ok(serde_json::from_value(Value::Object(map))?)
        }
        _ => Err(EventParseError::MissingRow { table, kind }),
    }
}

fn to_timestamp(at: DateTime<Utc>) -> Timestamp {
    Timestamp::from_millis(u64::try_from(at.timestamp_millis()).unwrap_or(0))
}
