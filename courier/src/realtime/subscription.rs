//! Per-thread realtime subscriptions.
//!
//! Defines the [`RealtimeTransport`] trait delivering raw change payloads,
//! and [`RealtimeHub`] which keeps exactly one thread subscribed at a time
//! and feeds its events, in arrival order, to a [`Reconciler`].

use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use courier_proto::connection::ConnectionStatus;
use courier_proto::event::RealtimeEvent;
use courier_proto::message::ThreadId;

use crate::backend::MessageBackend;

use super::Reconciler;

/// Errors raised when opening a subscription.
#[derive(Debug, thiserror::Error)]
pub enum RealtimeError {
    /// The transport has shut down.
    #[error("realtime transport closed")]
    Closed,

    /// The backend refused the channel join.
    #[error("subscription to thread {thread_id} failed: {reason}")]
    SubscribeFailed {
        /// Thread that could not be joined.
        thread_id: ThreadId,
        /// Description of the refusal.
        reason: String,
    },
}

/// Source of realtime row-change payloads.
///
/// Implementations include:
/// - [`super::loopback::LoopbackRealtime`]: in-process publish/subscribe for testing
pub trait RealtimeTransport: Send + Sync {
    /// Open a stream of raw JSON payloads for changes in `thread_id`.
    ///
    /// Dropping the stream unsubscribes.
    fn subscribe(
        &self,
        thread_id: &ThreadId,
    ) -> impl std::future::Future<Output = Result<BoxStream<'static, String>, RealtimeError>> + Send;

    /// Connection status of the transport. The receiver always holds the
    /// latest status; reconnects are counted even if intermediate states
    /// were never observed.
    fn connection_state(&self) -> watch::Receiver<ConnectionStatus>;
}

/// The thread currently subscribed and the task consuming its stream.
struct ActiveSubscription {
    thread_id: ThreadId,
    task: JoinHandle<()>,
}

/// Keeps the active thread's subscription alive and tears it down on
/// switch, on [`deactivate`](Self::deactivate), and on drop.
pub struct RealtimeHub<T: RealtimeTransport, B: MessageBackend> {
    transport: Arc<T>,
    reconciler: Arc<Reconciler<B>>,
    active: Mutex<Option<ActiveSubscription>>,
}

impl<T, B> RealtimeHub<T, B>
where
    T: RealtimeTransport,
    B: MessageBackend + 'static,
{
    /// Creates a hub with nothing subscribed.
    pub fn new(transport: Arc<T>, reconciler: Arc<Reconciler<B>>) -> Self {
        Self {
            transport,
            reconciler,
            active: Mutex::new(None),
        }
    }

    /// The reconciler events are applied through.
    #[must_use]
    pub const fn reconciler(&self) -> &Arc<Reconciler<B>> {
        &self.reconciler
    }

    /// Thread currently subscribed, if any.
    #[must_use]
    pub fn active_thread(&self) -> Option<ThreadId> {
        self.active.lock().as_ref().map(|a| a.thread_id.clone())
    }

    /// Subscribe to `thread_id`, replacing any previous subscription, and
    /// mark it as the thread on screen.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError`] if the transport cannot open the stream.
    /// The previous subscription is torn down either way, and no thread is
    /// marked active after a failure.
    pub async fn activate(&self, thread_id: ThreadId) -> Result<(), RealtimeError> {
        self.teardown();
        let mut stream = match self.transport.subscribe(&thread_id).await {
            Ok(stream) => stream,
            Err(e) => {
                self.reconciler.presence().clear_active_thread();
                tracing::warn!(thread_id = %thread_id, error = %e, "realtime subscription failed");
                return Err(e);
            }
        };
        self.reconciler.presence().set_active_thread(thread_id.clone());
        let reconciler = Arc::clone(&self.reconciler);
        let subscribed = thread_id.clone();
        let task = tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                match RealtimeEvent::from_json(&payload) {
                    Ok(event) => {
                        reconciler.apply(&subscribed, event).await;
                    }
                    Err(e) => {
                        tracing::warn!(thread_id = %subscribed, error = %e, "dropping realtime payload");
                    }
                }
            }
            tracing::debug!(thread_id = %subscribed, "realtime stream ended");
        });

        tracing::info!(thread_id = %thread_id, "realtime subscription active");
        let previous = self
            .active
            .lock()
            .replace(ActiveSubscription { thread_id, task });
        // A concurrent activate may have slipped in between.
        if let Some(previous) = previous {
            previous.task.abort();
        }
        Ok(())
    }

    /// Tear down the current subscription and clear the active thread.
    pub fn deactivate(&self) {
        self.teardown();
        self.reconciler.presence().clear_active_thread();
    }

    fn teardown(&self) {
        if let Some(previous) = self.active.lock().take() {
            previous.task.abort();
            tracing::info!(thread_id = %previous.thread_id, "realtime subscription closed");
        }
    }
}

impl<T: RealtimeTransport, B: MessageBackend> Drop for RealtimeHub<T, B> {
    fn drop(&mut self) {
        if let Some(active) = self.active.get_mut().take() {
            active.task.abort();
        }
    }
}
