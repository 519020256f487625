//! Message types shared by the send pipeline, the outbox and the realtime layer.
//!
//! A [`Message`] is identified either by a locally generated temporary id
//! (before the backend confirms the insert) or by the permanent id the backend
//! assigned. Temporary ids always carry [`TEMP_ID_PREFIX`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reaction::ReactionAggregate;

/// Prefix carried by every locally generated message id.
pub const TEMP_ID_PREFIX: &str = "temp-";

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Maximum allowed size of a single attachment in bytes (25 MB).
pub const MAX_ATTACHMENT_SIZE: u64 = 25 * 1024 * 1024;

/// Number of characters kept in a reply-to preview.
pub const REPLY_SNIPPET_CHARS: usize = 100;

/// Identifier of a message, temporary or permanent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an id assigned by the backend.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a fresh temporary id for an optimistic entry.
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Returns `true` if this id was generated locally and never confirmed.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a message thread (a conversation with a fixed participant set).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(String);

impl ThreadId {
    /// Wraps a backend thread id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a user (sender, reader or reactor).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wraps a backend user id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of the id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Millisecond-precision UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        Self(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the timestamp as milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// A file attached to a message, already uploaded to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Storage object id.
    pub id: String,
    /// Original file name.
    pub name: String,
    /// Size of the uploaded object in bytes.
    pub size_bytes: u64,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Display identity of a message sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderProfile {
    /// Name shown next to the message.
    pub display_name: String,
    /// Role within the school (teacher, parent, principal...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Avatar image URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

impl SenderProfile {
    /// Profile shown when the sender's identity could not be resolved.
    #[must_use]
    pub fn placeholder() -> Self {
        Self {
            display_name: "Unknown".to_string(),
            role: None,
            avatar_url: None,
        }
    }
}

/// Inline preview of the message a reply refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplySummary {
    /// The referenced message.
    pub message_id: MessageId,
    /// Leading characters of the referenced content.
    pub content_snippet: String,
    /// Display name of the referenced message's sender.
    pub sender_name: String,
}

impl ReplySummary {
    /// Builds a preview of `message`, truncating its content.
    #[must_use]
    pub fn of(message: &Message) -> Self {
        let sender_name = message.sender.as_ref().map_or_else(
            || SenderProfile::placeholder().display_name,
            |p| p.display_name.clone(),
        );
        Self {
            message_id: message.id.clone(),
            content_snippet: snippet(&message.content),
            sender_name,
        }
    }
}

/// Truncates `content` to [`REPLY_SNIPPET_CHARS`] characters.
fn snippet(content: &str) -> String {
    match content.char_indices().nth(REPLY_SNIPPET_CHARS) {
        Some((idx, _)) => format!("{}...", &content[..idx]),
        None => content.to_string(),
    }
}

/// A chat message as held in a local thread view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Temporary or permanent identity.
    pub id: MessageId,
    /// Owning thread.
    pub thread_id: ThreadId,
    /// Author.
    pub sender_id: UserId,
    /// Resolved display identity of the author.
    #[serde(default)]
    pub sender: Option<SenderProfile>,
    /// Text body.
    pub content: String,
    /// Attached files.
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Message this one replies to.
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    /// Resolved preview of `reply_to_id`.
    #[serde(default)]
    pub reply_to: Option<ReplySummary>,
    /// When the sender composed the message.
    pub created_at: Timestamp,
    /// When the backend confirmed delivery.
    #[serde(default)]
    pub delivered_at: Option<Timestamp>,
    /// Users who have read the message.
    #[serde(default)]
    pub read_by: BTreeSet<UserId>,
    /// Aggregated reactions, recomputed on every reaction change.
    #[serde(default)]
    pub reactions: Vec<ReactionAggregate>,
}

/// Error returned when a draft fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// No text and no attachments.
    #[error("message content is empty")]
    Empty,
    /// Content exceeds [`MAX_CONTENT_SIZE`].
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
    /// An attachment exceeds [`MAX_ATTACHMENT_SIZE`].
    #[error("attachment {name} too large ({size} bytes, max {max} bytes)")]
    AttachmentTooLarge {
        /// File name of the offending attachment.
        name: String,
        /// Actual size in bytes.
        size: u64,
        /// Maximum allowed size in bytes.
        max: u64,
    },
}

/// A message the local user composed and wants to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Target thread.
    pub thread_id: ThreadId,
    /// Text body.
    pub content: String,
    /// Already-uploaded attachments.
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
}

impl OutgoingMessage {
    /// Creates a plain text draft for `thread_id`.
    pub fn text(thread_id: ThreadId, content: impl Into<String>) -> Self {
        Self {
            thread_id,
            content: content.into(),
            attachments: Vec::new(),
            reply_to_id: None,
        }
    }

    /// Attaches `attachment` to the draft.
    #[must_use]
    pub fn with_attachment(mut self, attachment: AttachmentRef) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Marks the draft as a reply to `message_id`.
    #[must_use]
    pub fn replying_to(mut self, message_id: MessageId) -> Self {
        self.reply_to_id = Some(message_id);
        self
    }

    /// Validates the draft before anything is shown or sent.
    ///
    /// Attachment-only messages are allowed; whitespace-only text without
    /// attachments is not.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`], [`ValidationError::TooLarge`] or
    /// [`ValidationError::AttachmentTooLarge`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() && self.attachments.is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.content.len();
        if size > MAX_CONTENT_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }
        if let Some(att) = self
            .attachments
            .iter()
            .find(|a| a.size_bytes > MAX_ATTACHMENT_SIZE)
        {
            return Err(ValidationError::AttachmentTooLarge {
                name: att.name.clone(),
                size: att.size_bytes,
                max: MAX_ATTACHMENT_SIZE,
            });
        }
        Ok(())
    }

    /// Ids of the attached storage objects.
    #[must_use]
    pub fn attachment_ids(&self) -> Vec<String> {
        self.attachments.iter().map(|a| a.id.clone()).collect()
    }

    /// Builds the optimistic local entry shown while the send is in flight.
    #[must_use]
    pub fn to_optimistic(
        &self,
        id: MessageId,
        sender_id: UserId,
        sender: Option<SenderProfile>,
    ) -> Message {
        Message {
            id,
            thread_id: self.thread_id.clone(),
            sender_id,
            sender,
            content: self.content.clone(),
            attachments: self.attachments.clone(),
            reply_to_id: self.reply_to_id.clone(),
            reply_to: None,
            created_at: Timestamp::now(),
            delivered_at: None,
            read_by: BTreeSet::new(),
            reactions: Vec::new(),
        }
    }
}
