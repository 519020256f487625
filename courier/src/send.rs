//! Optimistic send pipeline.
//!
//! [`SendPipeline::send`] shows a message the instant the user submits it
//! and reconciles it with the authoritative result afterwards:
//!
//! 1. Validate the draft; invalid drafts never reach the view.
//! 2. Insert an optimistic entry under a fresh `temp-` id.
//! 3. Issue the authoritative write through the [`MessageSender`].
//! 4. On success swap the optimistic entry for the stored message in one
//!    locked update, then spawn the thread-summary refresh and push fan-out
//!    without waiting for them.
//! 5. On failure drop the optimistic entry and hand the draft to the
//!    [`RetryCoordinator`], which persists it as a failed record. If the
//!    realtime echo already replaced the entry the message was delivered,
//!    so the send counts as sent.

use std::sync::Arc;

use courier_proto::failed::FailedMessageRecord;
use courier_proto::message::{
    Message, MessageId, OutgoingMessage, SenderProfile, ThreadId, UserId, ValidationError,
};

use crate::backend::{MessageBackend, MessageSender, send_with_timeout};
use crate::outbox::retry::{RetryCoordinator, RetryOutcome};
use crate::persist::KeyValueStore;
use crate::view::{ConfirmOutcome, ThreadViews, ViewEntry};

/// Result of a send that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Stored by the backend; carries the permanent id.
    Sent(Message),
    /// The write failed and the draft was recorded for retry.
    Failed(FailedMessageRecord),
}

/// One row of a rendered thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderedItem {
    /// A pending or confirmed message.
    Message(ViewEntry),
    /// A message that failed to send, with retry/dismiss affordances.
    Failed(FailedMessageRecord),
}

/// Sends messages optimistically on behalf of the signed-in user.
pub struct SendPipeline<K: KeyValueStore, S: MessageSender, B: MessageBackend> {
    user_id: UserId,
    profile: Option<SenderProfile>,
    views: Arc<ThreadViews>,
    coordinator: Arc<RetryCoordinator<K, S>>,
    backend: Arc<B>,
}

impl<K, S, B> SendPipeline<K, S, B>
where
    K: KeyValueStore,
    S: MessageSender,
    B: MessageBackend + 'static,
{
    /// Creates a pipeline sending as `user_id`.
    ///
    /// Writes go through the coordinator's sender so that first attempts
    /// and retries share one send primitive and timeout.
    pub const fn new(
        user_id: UserId,
        views: Arc<ThreadViews>,
        coordinator: Arc<RetryCoordinator<K, S>>,
        backend: Arc<B>,
    ) -> Self {
        Self {
            user_id,
            profile: None,
            views,
            coordinator,
            backend,
        }
    }

    /// Shows `profile` on optimistic entries.
    #[must_use]
    pub fn with_profile(mut self, profile: SenderProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Thread views this pipeline writes into.
    #[must_use]
    pub const fn views(&self) -> &Arc<ThreadViews> {
        &self.views
    }

    /// Coordinator owning the failed-message store.
    #[must_use]
    pub const fn coordinator(&self) -> &Arc<RetryCoordinator<K, S>> {
        &self.coordinator
    }

    /// Send `draft` optimistically.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if the draft is empty or too large; in
    /// that case the view is left untouched. Send failures are not errors:
    /// they are reported as [`SendOutcome::Failed`].
    pub async fn send(&self, draft: OutgoingMessage) -> Result<SendOutcome, ValidationError> {
        draft.validate()?;

        let temp_id = MessageId::temporary();
        let thread_id = draft.thread_id.clone();
        let optimistic =
            draft.to_optimistic(temp_id.clone(), self.user_id.clone(), self.profile.clone());
        self.views
            .update(&thread_id, |v| v.insert_optimistic(optimistic));
        tracing::debug!(local_id = %temp_id, thread_id = %thread_id, "optimistic entry inserted");

        let timeout = self.coordinator.config().send_timeout;
        match send_with_timeout(&**self.coordinator.sender(), &draft, timeout).await {
            Ok(stored) => {
                let message_id = stored.id.clone();
                let outcome = self
                    .views
                    .update(&thread_id, |v| v.confirm(&temp_id, stored.clone()));
                tracing::debug!(
                    local_id = %temp_id,
                    message_id = %message_id,
                    ?outcome,
                    "optimistic entry confirmed"
                );
                let confirmed = match outcome {
                    ConfirmOutcome::Replaced | ConfirmOutcome::Appended => {
                        self.views.message(&thread_id, &message_id).unwrap_or(stored)
                    }
                    ConfirmOutcome::DroppedOptimistic | ConfirmOutcome::AlreadyConfirmed => stored,
                };
                self.spawn_side_effects(confirmed.clone());
                Ok(SendOutcome::Sent(confirmed))
            }
            Err(e) => {
                let echoed = self.views.update(&thread_id, |v| v.withdraw(&temp_id));
                if let Some(delivered) =
                    echoed.and_then(|id| self.views.message(&thread_id, &id))
                {
                    tracing::info!(
                        local_id = %temp_id,
                        message_id = %delivered.id,
                        error = %e,
                        "send reported failure after its echo arrived, treating as sent"
                    );
                    self.spawn_side_effects(delivered.clone());
                    return Ok(SendOutcome::Sent(delivered));
                }
                let record = self
                    .coordinator
                    .enqueue_failure(temp_id, &draft, e.to_string())
                    .await;
                Ok(SendOutcome::Failed(record))
            }
        }
    }

    /// Retry a failed message by hand and merge the result into the view.
    pub async fn retry(&self, local_id: &MessageId) -> RetryOutcome {
        let outcome = self.coordinator.retry_one(local_id).await;
        if let RetryOutcome::Sent(ref message) = outcome {
            let mut shown = message.clone();
            if shown.sender.is_none() && shown.sender_id == self.user_id {
                shown.sender.clone_from(&self.profile);
            }
            self.views
                .update(&message.thread_id, |v| v.merge_inserted(shown));
            self.spawn_side_effects(message.clone());
        }
        outcome
    }

    /// Give up on a failed message.
    pub async fn dismiss(&self, local_id: &MessageId) -> bool {
        self.coordinator.dismiss(local_id).await
    }

    /// Everything the UI shows for `thread_id`: view entries in order,
    /// followed by the thread's failed records.
    #[must_use]
    pub fn rendered_thread(&self, thread_id: &ThreadId) -> Vec<RenderedItem> {
        let mut items: Vec<RenderedItem> = self
            .views
            .entries(thread_id)
            .into_iter()
            .map(RenderedItem::Message)
            .collect();
        items.extend(
            self.coordinator
                .store()
                .for_thread(thread_id)
                .into_iter()
                .map(RenderedItem::Failed),
        );
        items
    }

    /// Refresh the thread summary and notify participants in the
    /// background. Failures are logged only.
    fn spawn_side_effects(&self, message: Message) {
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            let (summary, push) = tokio::join!(
                backend.refresh_thread_summary(&message.thread_id),
                backend.notify_participants(&message),
            );
            if let Err(e) = summary {
                tracing::warn!(
                    thread_id = %message.thread_id,
                    error = %e,
                    "thread summary refresh failed"
                );
            }
            if let Err(e) = push {
                tracing::warn!(
                    message_id = %message.id,
                    error = %e,
                    "push notification dispatch failed"
                );
            }
        });
    }
}
