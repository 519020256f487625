//! Persisted shape of messages that could not be delivered.
//!
//! The outbox stores a JSON array of [`FailedMessageRecord`]s under a single
//! key. Field names are camelCase so the blob stays readable by the mobile
//! client that shares the same storage key.

use serde::{Deserialize, Serialize};

use crate::message::{MessageId, OutgoingMessage, ThreadId, Timestamp};

/// Retry count at which a record stops being retried automatically.
pub const MAX_AUTO_RETRIES: u32 = 3;

/// A message whose send attempt failed and is awaiting retry or dismissal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessageRecord {
    /// Local (temporary) id of the failed send.
    pub local_id: MessageId,
    /// Thread the message was addressed to.
    pub thread_id: ThreadId,
    /// Content snapshot at the time of failure.
    pub content: String,
    /// Storage ids of attachments, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ids: Option<Vec<String>>,
    /// Message this one replied to. Older blobs do not carry it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// When the first attempt failed.
    pub failed_at: Timestamp,
    /// Number of unsuccessful retries so far.
    pub retry_count: u32,
    /// Description of the most recent failure.
    pub error: String,
}

/// Where a record sits in its retry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Eligible for automatic retry.
    PendingRetry {
        /// Unsuccessful retries so far.
        count: u32,
    },
    /// Automatic retries used up; manual retry still allowed.
    Exhausted,
}

impl FailedMessageRecord {
    /// Records the first failed attempt of `draft`.
    pub fn first_failure(
        local_id: MessageId,
        draft: &OutgoingMessage,
        error: impl Into<String>,
    ) -> Self {
        let attachment_ids = draft.attachment_ids();
        Self {
            local_id,
            thread_id: draft.thread_id.clone(),
            content: draft.content.clone(),
            attachment_ids: (!attachment_ids.is_empty()).then_some(attachment_ids),
            reply_to_id: draft.reply_to_id.clone(),
            failed_at: Timestamp::now(),
            retry_count: 0,
            error: error.into(),
        }
    }

    /// Current lifecycle state given the automatic retry cap.
    #[must_use]
    pub const fn state(&self, max_auto_retries: u32) -> RetryState {
        if self.retry_count >= max_auto_retries {
            RetryState::Exhausted
        } else {
            RetryState::PendingRetry {
                count: self.retry_count,
            }
        }
    }

    /// Whether `retry_all` should still pick this record up.
    #[must_use]
    pub const fn is_auto_retryable(&self, max_auto_retries: u32) -> bool {
        self.retry_count < max_auto_retries
    }

    /// Merges `patch` into this record.
    ///
    /// The retry count never decreases: a patch carrying a lower count than
    /// the stored one leaves the count untouched.
    pub fn apply(&mut self, patch: &FailedMessagePatch) {
        if let Some(count) = patch.retry_count {
            self.retry_count = self.retry_count.max(count);
        }
        if let Some(ref error) = patch.error {
            self.error.clone_from(error);
        }
    }

    /// Rebuilds a sendable draft from the snapshot.
    ///
    /// Attachment metadata other than the storage id is not persisted, so
    /// the rebuilt attachments carry the id as name and a zero size. The
    /// backend resolves attachments by id; size is only checked when the
    /// draft is first validated.
    #[must_use]
    pub fn to_outgoing(&self) -> OutgoingMessage {
        let attachments = self
            .attachment_ids
            .iter()
            .flatten()
            .map(|id| crate::message::AttachmentRef {
                id: id.clone(),
                name: id.clone(),
                size_bytes: 0,
                mime_type: None,
            })
            .collect();
        OutgoingMessage {
            thread_id: self.thread_id.clone(),
            content: self.content.clone(),
            attachments,
            reply_to_id: self.reply_to_id.clone(),
        }
    }
}

/// Partial update applied to a stored record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailedMessagePatch {
    /// New retry count.
    pub retry_count: Option<u32>,
    /// New error description.
    pub error: Option<String>,
}

impl FailedMessagePatch {
    /// Patch recording one more unsuccessful retry of `record`.
    pub fn failed_retry(record: &FailedMessageRecord, error: impl Into<String>) -> Self {
        Self {
            retry_count: Some(record.retry_count.saturating_add(1)),
            error: Some(error.into()),
        }
    }
}
