//! Publishing side of a transport's connection state.

use tokio::sync::watch;

use courier_proto::connection::{ConnectionState, ConnectionStatus};

/// Owns the `watch` channel a transport reports its connectivity on.
///
/// Only genuine state changes notify receivers, and every transition into
/// [`ConnectionState::Connected`] is counted in
/// [`ConnectionStatus::connects`].
#[derive(Debug)]
pub struct ConnectionMonitor {
    tx: watch::Sender<ConnectionStatus>,
}

impl ConnectionMonitor {
    /// Starts at `initial`.
    #[must_use]
    pub fn new(initial: ConnectionState) -> Self {
        let (tx, _) = watch::channel(ConnectionStatus::new(initial));
        Self { tx }
    }

    /// Report `state`. Returns `false` if nothing changed.
    pub fn set(&self, state: ConnectionState) -> bool {
        let changed = self.tx.send_if_modified(|status| status.advance(state));
        if changed {
            tracing::debug!(%state, "connection state changed");
        }
        changed
    }

    /// Latest status.
    #[must_use]
    pub fn current(&self) -> ConnectionStatus {
        *self.tx.borrow()
    }

    /// New receiver of status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}
