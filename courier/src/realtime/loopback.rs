//! Loopback realtime transport for testing.
//!
//! [`LoopbackRealtime`] is an in-process publish/subscribe hub backed by
//! [`tokio::sync::mpsc`] channels. Tests publish raw JSON payloads to a
//! thread and every open subscription to that thread receives them in
//! order. Connection state is driven by hand through
//! [`set_connection_state`](LoopbackRealtime::set_connection_state).

use std::collections::HashMap;

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use courier_proto::connection::{ConnectionState, ConnectionStatus};
use courier_proto::message::ThreadId;

use crate::config::CourierConfig;

use super::status::ConnectionMonitor;
use super::subscription::{RealtimeError, RealtimeTransport};

/// In-process realtime transport.
pub struct LoopbackRealtime {
    /// Open subscriptions per thread.
    subscribers: Mutex<HashMap<ThreadId, Vec<mpsc::Sender<String>>>>,
    /// Channel capacity of each subscription.
    capacity: usize,
    /// Reported connection state.
    state: ConnectionMonitor,
    /// Once closed, new subscriptions are refused.
    closed: Mutex<bool>,
}

impl LoopbackRealtime {
    /// Creates a connected transport whose subscriptions buffer up to
    /// `capacity` payloads.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            capacity,
            state: ConnectionMonitor::new(ConnectionState::Connected),
            closed: Mutex::new(false),
        }
    }

    /// Creates a connected transport buffering `config.channel_capacity`
    /// payloads per subscription.
    #[must_use]
    pub fn from_config(config: &CourierConfig) -> Self {
        Self::new(config.channel_capacity)
    }

    /// Deliver `payload` to every open subscription of `thread_id`.
    ///
    /// Returns how many subscriptions received it. Subscriptions whose
    /// stream was dropped are pruned; a full subscription drops the payload.
    pub fn publish(&self, thread_id: &ThreadId, payload: impl Into<String>) -> usize {
        let payload = payload.into();
        let mut subscribers = self.subscribers.lock();
        let Some(senders) = subscribers.get_mut(thread_id) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        let mut delivered = 0;
        for tx in senders.iter() {
            match tx.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(thread_id = %thread_id, error = %e, "loopback subscriber lagging, payload dropped");
                }
            }
        }
        delivered
    }

    /// Number of live subscriptions to `thread_id`.
    #[must_use]
    pub fn subscriber_count(&self, thread_id: &ThreadId) -> usize {
        self.subscribers
            .lock()
            .get(thread_id)
            .map_or(0, |senders| senders.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Report a new connection state to observers.
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.state.set(state);
    }

    /// Refuse further subscriptions and end every open stream.
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.subscribers.lock().clear();
        self.state.set(ConnectionState::Disconnected);
    }
}

impl RealtimeTransport for LoopbackRealtime {
    async fn subscribe(&self, thread_id: &ThreadId) -> Result<BoxStream<'static, String>, RealtimeError> {
        if *self.closed.lock() {
            return Err(RealtimeError::Closed);
        }
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .entry(thread_id.clone())
            .or_default()
            .push(tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|payload| (payload, rx))
        })
        .boxed())
    }

    fn connection_state(&self) -> watch::Receiver<ConnectionStatus> {
        self.state.subscribe()
    }
}
