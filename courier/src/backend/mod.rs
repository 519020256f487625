//! Boundary contracts with the hosted backend.
//!
//! The backend owns authentication, the message/thread/reaction tables and
//! push delivery. This crate only depends on the two traits defined here:
//! - [`MessageSender`]: the authoritative send primitive
//! - [`MessageBackend`]: queries and fire-and-forget side effects used by
//!   the send pipeline and the reconciliation layer
//!
//! [`memory::InMemoryBackend`] implements both for tests.

pub mod memory;

use std::time::Duration;

use courier_proto::message::{Message, MessageId, OutgoingMessage, SenderProfile, ThreadId, UserId};
use courier_proto::reaction::ReactionRow;

/// Errors reported by backend calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The request never reached the backend or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,

    /// The session is not allowed to perform the operation.
    #[error("not authorized: {0}")]
    Unauthorized(String),

    /// The backend rejected the row (constraint or validation failure).
    #[error("rejected by backend: {0}")]
    Rejected(String),

    /// The referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Authoritative write of a new message.
///
/// Retrying an already-delivered message may produce a duplicate row; the
/// backend does not deduplicate and this crate does not try to either.
pub trait MessageSender: Send + Sync {
    /// Insert `draft` as the signed-in user and return the stored message
    /// carrying its permanent id.
    fn send_message(
        &self,
        draft: &OutgoingMessage,
    ) -> impl std::future::Future<Output = Result<Message, BackendError>> + Send;
}

/// Read access and side effects the local layers need from the backend.
pub trait MessageBackend: Send + Sync {
    /// Display identity of `user_id`.
    fn fetch_profile(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<SenderProfile, BackendError>> + Send;

    /// A single message, used to resolve reply-to references.
    fn fetch_message(
        &self,
        message_id: &MessageId,
    ) -> impl std::future::Future<Output = Result<Message, BackendError>> + Send;

    /// Every current reaction row for `message_id`.
    fn fetch_reactions(
        &self,
        message_id: &MessageId,
    ) -> impl std::future::Future<Output = Result<Vec<ReactionRow>, BackendError>> + Send;

    /// Refresh the thread's summary (last message preview, unread counts).
    fn refresh_thread_summary(
        &self,
        thread_id: &ThreadId,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;

    /// Dispatch push notifications about `message` to the other participants.
    fn notify_participants(
        &self,
        message: &Message,
    ) -> impl std::future::Future<Output = Result<(), BackendError>> + Send;
}

/// Run `sender.send_message(draft)`, failing with [`BackendError::Timeout`]
/// if it does not complete within `timeout`.
///
/// # Errors
///
/// Returns the sender's error, or [`BackendError::Timeout`].
pub async fn send_with_timeout<S: MessageSender>(
    sender: &S,
    draft: &OutgoingMessage,
    timeout: Duration,
) -> Result<Message, BackendError> {
    tokio::time::timeout(timeout, sender.send_message(draft))
        .await
        .unwrap_or(Err(BackendError::Timeout))
}
