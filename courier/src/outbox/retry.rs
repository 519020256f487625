//! Manual and automatic retry of failed messages.
//!
//! [`RetryCoordinator`] re-sends records held by the
//! [`FailedMessageStore`]. Per record the lifecycle is:
//!
//! ```text
//! PendingRetry(0) --fail--> PendingRetry(1) --fail--> PendingRetry(2) --fail--> Exhausted
//!        |                        |                         |                      |
//!        +-------success----------+----------success--------+-------success--------+--> removed
//! ```
//!
//! `Exhausted` records stay visible and can still be retried by hand; they
//! are only skipped by [`retry_all`](RetryCoordinator::retry_all).
//!
//! [`spawn_auto_retry`](RetryCoordinator::spawn_auto_retry) runs one
//! `retry_all` pass each time the realtime connection comes back.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use courier_proto::connection::ConnectionStatus;
use courier_proto::failed::{FailedMessagePatch, FailedMessageRecord, MAX_AUTO_RETRIES};
use courier_proto::message::{Message, MessageId, OutgoingMessage};

use crate::backend::{MessageSender, send_with_timeout};
use crate::config::CourierConfig;
use crate::persist::KeyValueStore;

use super::store::FailedMessageStore;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry count at which a record is no longer retried automatically.
    pub max_auto_retries: u32,
    /// How long a single send attempt may take before it counts as failed.
    pub send_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_auto_retries: MAX_AUTO_RETRIES,
            send_timeout: Duration::from_secs(15),
        }
    }
}

/// Result of a single retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Delivered; the record was removed.
    Sent(Message),
    /// Failed again; the record now carries this count and error.
    Failed {
        /// Retry count after this attempt.
        retry_count: u32,
        /// Description of the failure.
        error: String,
    },
    /// No record with that id (already delivered or dismissed).
    NotFound,
    /// Another retry of the same record is still running.
    InFlight,
}

/// Totals of a [`retry_all`](RetryCoordinator::retry_all) pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    /// Records a send was attempted for.
    pub attempted: usize,
    /// Attempts that succeeded.
    pub succeeded: usize,
    /// Attempts that failed.
    pub failed: usize,
    /// Records skipped because they vanished or were already being retried.
    pub skipped: usize,
}

/// Events emitted by the [`RetryCoordinator`] for UI notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEvent {
    /// A failed message was delivered on retry.
    Resolved {
        /// Local id of the record that was removed.
        local_id: MessageId,
        /// Permanent id assigned by the backend.
        message_id: MessageId,
    },
    /// A retry failed; the record stays in the store.
    RetryFailed {
        /// Local id of the record.
        local_id: MessageId,
        /// Retry count after the attempt.
        retry_count: u32,
        /// Description of the failure.
        error: String,
    },
    /// The record reached the automatic retry cap.
    Exhausted {
        /// Local id of the record.
        local_id: MessageId,
    },
    /// The user gave up on the record.
    Dismissed {
        /// Local id of the record.
        local_id: MessageId,
    },
}

/// Tracks connection status and reports genuine reconnects.
///
/// Reconnects are read from [`ConnectionStatus::connects`], so a
/// disconnect and reconnect that an observer only sees as "still
/// connected" still counts. The status seen at construction is the
/// baseline: starting out connected is not a reconnect. A reconnect seen
/// while the link is already down again is held until it comes back.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectDetector {
    handled: u64,
}

impl ReconnectDetector {
    /// Starts tracking from `initial`.
    #[must_use]
    pub const fn new(initial: ConnectionStatus) -> Self {
        Self {
            handled: initial.connects,
        }
    }

    /// Record `next`; returns `true` if connectivity was re-established
    /// since the last time this returned `true`.
    pub const fn observe(&mut self, next: ConnectionStatus) -> bool {
        if !next.state.is_connected() || next.connects <= self.handled {
            return false;
        }
        self.handled = next.connects;
        true
    }
}

/// Removes a local id from the in-flight set when dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<MessageId>>,
    id: MessageId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Retries failed messages through an injected [`MessageSender`].
///
/// Every operation absorbs send and storage errors: callers observe
/// results through [`RetryOutcome`], [`RetryEvent`]s and the store's
/// watch channel, never through `Err`.
pub struct RetryCoordinator<K: KeyValueStore, S: MessageSender> {
    /// Durable record of failures.
    store: Arc<FailedMessageStore<K>>,
    /// Authoritative send primitive.
    sender: Arc<S>,
    /// Retry cap and timeout.
    config: RetryConfig,
    /// Local ids with a retry currently running.
    in_flight: Mutex<HashSet<MessageId>>,
    /// Channel for emitting retry events to the UI layer.
    event_tx: mpsc::Sender<RetryEvent>,
}

impl<K: KeyValueStore, S: MessageSender> RetryCoordinator<K, S> {
    /// Creates a coordinator.
    ///
    /// Returns the coordinator and a receiver for [`RetryEvent`]s that the
    /// UI layer should consume.
    pub fn new(
        store: Arc<FailedMessageStore<K>>,
        sender: Arc<S>,
        config: RetryConfig,
        event_buffer: usize,
    ) -> (Self, mpsc::Receiver<RetryEvent>) {
        let (event_tx, event_rx) = mpsc::channel(event_buffer);
        let coordinator = Self {
            store,
            sender,
            config,
            in_flight: Mutex::new(HashSet::new()),
            event_tx,
        };
        (coordinator, event_rx)
    }

    /// Creates a coordinator using the retry cap, send timeout and event
    /// buffer from `config`.
    pub fn from_config(
        store: Arc<FailedMessageStore<K>>,
        sender: Arc<S>,
        config: &CourierConfig,
    ) -> (Self, mpsc::Receiver<RetryEvent>) {
        Self::new(store, sender, config.retry_config(), config.event_buffer)
    }

    /// The store this coordinator retries from.
    #[must_use]
    pub const fn store(&self) -> &Arc<FailedMessageStore<K>> {
        &self.store
    }

    /// The send primitive used for retries.
    #[must_use]
    pub const fn sender(&self) -> &Arc<S> {
        &self.sender
    }

    /// The active retry configuration.
    #[must_use]
    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Record a brand-new failure of `draft` (retry count 0).
    pub async fn enqueue_failure(
        &self,
        local_id: MessageId,
        draft: &OutgoingMessage,
        error: impl Into<String>,
    ) -> FailedMessageRecord {
        let record = FailedMessageRecord::first_failure(local_id, draft, error);
        tracing::warn!(
            local_id = %record.local_id,
            thread_id = %record.thread_id,
            error = %record.error,
            "message send failed, queued for retry"
        );
        self.store.append(record.clone()).await;
        record
    }

    /// Retry one record.
    ///
    /// The record is re-read from the store, never taken from a cached
    /// snapshot. On success it is removed; on failure its retry count is
    /// incremented and its error replaced. Works regardless of the
    /// automatic retry cap.
    pub async fn retry_one(&self, local_id: &MessageId) -> RetryOutcome {
        if !self.in_flight.lock().insert(local_id.clone()) {
            tracing::debug!(local_id = %local_id, "retry already in flight");
            return RetryOutcome::InFlight;
        }
        let _guard = InFlightGuard {
            set: &self.in_flight,
            id: local_id.clone(),
        };

        let Some(record) = self.store.get(local_id).await else {
            tracing::debug!(local_id = %local_id, "retry of unknown failed message ignored");
            return RetryOutcome::NotFound;
        };

        match send_with_timeout(&*self.sender, &record.to_outgoing(), self.config.send_timeout)
            .await
        {
            Ok(message) => {
                self.store.remove(local_id).await;
                tracing::info!(
                    local_id = %local_id,
                    message_id = %message.id,
                    attempt = record.retry_count + 1,
                    "failed message delivered on retry"
                );
                let _ = self.event_tx.try_send(RetryEvent::Resolved {
                    local_id: local_id.clone(),
                    message_id: message.id.clone(),
                });
                RetryOutcome::Sent(message)
            }
            Err(e) => {
                let error = e.to_string();
                let patch = FailedMessagePatch::failed_retry(&record, error.clone());
                let retry_count = patch.retry_count.unwrap_or(record.retry_count);
                // Absent if dismissed while the send was in flight.
                self.store.update(local_id, &patch).await;
                tracing::warn!(
                    local_id = %local_id,
                    retry_count,
                    error = %error,
                    "retry failed"
                );
                let _ = self.event_tx.try_send(RetryEvent::RetryFailed {
                    local_id: local_id.clone(),
                    retry_count,
                    error: error.clone(),
                });
                if retry_count == self.config.max_auto_retries {
                    let _ = self.event_tx.try_send(RetryEvent::Exhausted {
                        local_id: local_id.clone(),
                    });
                }
                RetryOutcome::Failed { retry_count, error }
            }
        }
    }

    /// Retry every record still below the automatic retry cap.
    ///
    /// Records are processed strictly one at a time to avoid bursts
    /// against the backend.
    pub async fn retry_all(&self) -> RetrySummary {
        let max = self.config.max_auto_retries;
        let candidates: Vec<MessageId> = self
            .store
            .load()
            .await
            .into_iter()
            .filter(|r| r.is_auto_retryable(max))
            .map(|r| r.local_id)
            .collect();

        let mut summary = RetrySummary::default();
        for local_id in candidates {
            match self.retry_one(&local_id).await {
                RetryOutcome::Sent(_) => {
                    summary.attempted += 1;
                    summary.succeeded += 1;
                }
                RetryOutcome::Failed { .. } => {
                    summary.attempted += 1;
                    summary.failed += 1;
                }
                RetryOutcome::NotFound | RetryOutcome::InFlight => summary.skipped += 1,
            }
        }

        if summary.attempted > 0 {
            tracing::info!(
                attempted = summary.attempted,
                succeeded = summary.succeeded,
                failed = summary.failed,
                "retry pass finished"
            );
        }
        summary
    }

    /// Remove a record without sending it.
    ///
    /// Returns `false` if it was already gone.
    pub async fn dismiss(&self, local_id: &MessageId) -> bool {
        let removed = self.store.remove(local_id).await;
        if removed {
            tracing::info!(local_id = %local_id, "failed message dismissed");
            let _ = self.event_tx.try_send(RetryEvent::Dismissed {
                local_id: local_id.clone(),
            });
        }
        removed
    }

    /// Spawn a background task that runs [`retry_all`](Self::retry_all)
    /// once per transition into
    /// [`Connected`](courier_proto::connection::ConnectionState::Connected).
    ///
    /// The status current when this is called is the baseline and does not
    /// trigger a pass. Reconnects that happen while a pass is running are
    /// picked up when it finishes. The task stops when the status sender is
    /// dropped or the returned handle is aborted.
    pub fn spawn_auto_retry(
        self: &Arc<Self>,
        mut connection: watch::Receiver<ConnectionStatus>,
    ) -> tokio::task::JoinHandle<()>
    where
        K: 'static,
        S: 'static,
    {
        let coordinator = Arc::clone(self);
        let mut detector = ReconnectDetector::new(*connection.borrow_and_update());
        tokio::spawn(async move {
            while connection.changed().await.is_ok() {
                let status = *connection.borrow_and_update();
                if detector.observe(status) {
                    tracing::info!(connects = status.connects, "connection restored, retrying failed messages");
                    coordinator.retry_all().await;
                }
            }
            tracing::debug!("connection state channel closed, auto-retry stopped");
        })
    }
}
