//! Realtime reconciliation.
//!
//! [`Reconciler`] folds typed [`RealtimeEvent`]s into the local
//! [`ThreadViews`]:
//!
//! - `MessageInserted` resolves the sender's profile and the reply-to
//!   preview, then merges keyed by permanent id. An echo of the viewer's own
//!   optimistic send replaces the pending entry.
//! - `MessageUpdated` patches delivery and read receipts only.
//! - `ReactionChanged` refetches every reaction row of the message and
//!   recomputes the aggregate from scratch.
//!
//! Lookup failures never abort an event: a missing profile becomes a
//! placeholder and an unresolvable reply-to stays unresolved.
//!
//! [`subscription::RealtimeHub`] drives a reconciler from one thread's
//! event stream at a time.

pub mod loopback;
pub mod status;
pub mod subscription;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use courier_proto::event::{ChangeKind, RealtimeEvent};
use courier_proto::message::{Message, MessageId, ReplySummary, SenderProfile, ThreadId, UserId};
use courier_proto::reaction::aggregate_reactions;

use crate::backend::MessageBackend;
use crate::config::CourierConfig;
use crate::view::{MergeOutcome, ThreadViews};

/// Whether the app is on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppState {
    /// Visible and interactive.
    #[default]
    Foreground,
    /// Backgrounded; the OS delivers notifications instead.
    Background,
}

/// Which thread the viewer has open and whether the app is visible.
#[derive(Debug, Default)]
pub struct ViewerPresence {
    state: Mutex<(Option<ThreadId>, AppState)>,
}

impl ViewerPresence {
    /// Creates a presence with no open thread, app in the foreground.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `thread_id` as the thread on screen.
    pub fn set_active_thread(&self, thread_id: ThreadId) {
        self.state.lock().0 = Some(thread_id);
    }

    /// No thread is on screen.
    pub fn clear_active_thread(&self) {
        self.state.lock().0 = None;
    }

    /// Record an app foreground/background transition.
    pub fn set_app_state(&self, app_state: AppState) {
        self.state.lock().1 = app_state;
    }

    /// The thread on screen, if any.
    #[must_use]
    pub fn active_thread(&self) -> Option<ThreadId> {
        self.state.lock().0.clone()
    }

    /// Current app state.
    #[must_use]
    pub fn app_state(&self) -> AppState {
        self.state.lock().1
    }

    /// Whether a new message in `thread_id` warrants an in-app cue: the app
    /// is in the foreground and the viewer is looking at another thread.
    #[must_use]
    pub fn wants_cue_for(&self, thread_id: &ThreadId) -> bool {
        let state = self.state.lock();
        state.1 == AppState::Foreground && state.0.as_ref() != Some(thread_id)
    }
}

/// Request to play a short sound or vibration for a new message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttentionCue {
    /// Thread the message arrived in.
    pub thread_id: ThreadId,
    /// The new message.
    pub message_id: MessageId,
    /// Who sent it.
    pub sender_name: String,
}

/// What [`Reconciler::apply`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new-message event was merged.
    Merged(MergeOutcome),
    /// Receipts were patched; `false` if the message is not in the view.
    StatusPatched(bool),
    /// The reaction aggregate was recomputed with this many emoji groups.
    ReactionsRecomputed(usize),
    /// The reaction rows could not be fetched; the previous aggregate stays.
    ReactionsStale,
    /// The event belongs to another thread.
    Ignored,
}

/// Applies realtime events to local thread views.
pub struct Reconciler<B: MessageBackend> {
    /// The signed-in user; decides `has_reacted` and own-message echoes.
    viewer: UserId,
    backend: Arc<B>,
    views: Arc<ThreadViews>,
    presence: Arc<ViewerPresence>,
    /// Resolved sender profiles. Placeholders are never cached.
    profiles: Mutex<HashMap<UserId, SenderProfile>>,
    cue_tx: mpsc::Sender<AttentionCue>,
}

impl<B: MessageBackend> Reconciler<B> {
    /// Creates a reconciler.
    ///
    /// Returns it with a receiver for [`AttentionCue`]s; cues are dropped
    /// when the receiver falls `cue_buffer` behind.
    pub fn new(
        viewer: UserId,
        backend: Arc<B>,
        views: Arc<ThreadViews>,
        presence: Arc<ViewerPresence>,
        cue_buffer: usize,
    ) -> (Self, mpsc::Receiver<AttentionCue>) {
        let (cue_tx, cue_rx) = mpsc::channel(cue_buffer);
        let reconciler = Self {
            viewer,
            backend,
            views,
            presence,
            profiles: Mutex::new(HashMap::new()),
            cue_tx,
        };
        (reconciler, cue_rx)
    }

    /// Creates a reconciler sized by `config.attention_buffer`.
    pub fn from_config(
        viewer: UserId,
        backend: Arc<B>,
        views: Arc<ThreadViews>,
        presence: Arc<ViewerPresence>,
        config: &CourierConfig,
    ) -> (Self, mpsc::Receiver<AttentionCue>) {
        Self::new(viewer, backend, views, presence, config.attention_buffer)
    }

    /// Views this reconciler writes into.
    #[must_use]
    pub const fn views(&self) -> &Arc<ThreadViews> {
        &self.views
    }

    /// Presence consulted for attention cues.
    #[must_use]
    pub const fn presence(&self) -> &Arc<ViewerPresence> {
        &self.presence
    }

    /// Apply `event` received on the subscription for `thread_id`.
    pub async fn apply(&self, thread_id: &ThreadId, event: RealtimeEvent) -> ApplyOutcome {
        if event.thread_id().is_some_and(|t| t != thread_id) {
            tracing::debug!(
                subscription = %thread_id,
                "realtime event for another thread ignored"
            );
            return ApplyOutcome::Ignored;
        }
        match event {
            RealtimeEvent::MessageInserted(message) => self.on_inserted(thread_id, message).await,
            RealtimeEvent::MessageUpdated(update) => {
                let patched = self.views.update(thread_id, |v| v.patch_status(&update));
                tracing::debug!(message_id = %update.id, patched, "receipts updated");
                ApplyOutcome::StatusPatched(patched)
            }
            RealtimeEvent::ReactionChanged { message_id, kind } => {
                self.on_reaction_changed(thread_id, &message_id, kind).await
            }
        }
    }

    async fn on_inserted(&self, thread_id: &ThreadId, mut message: Message) -> ApplyOutcome {
        if message.sender.is_none() {
            message.sender = Some(self.resolve_profile(&message.sender_id).await);
        }
        if message.reply_to.is_none()
            && let Some(reply_id) = message.reply_to_id.clone()
        {
            message.reply_to = self.resolve_reply(thread_id, &reply_id).await;
        }

        let from_other = message.sender_id != self.viewer;
        let message_id = message.id.clone();
        let sender_name = message
            .sender
            .as_ref()
            .map_or_else(String::new, |p| p.display_name.clone());

        let outcome = self.views.update(thread_id, |v| v.merge_inserted(message));
        tracing::debug!(message_id = %message_id, ?outcome, "realtime insert merged");

        if outcome == MergeOutcome::Inserted && from_other && self.presence.wants_cue_for(thread_id)
        {
            let _ = self.cue_tx.try_send(AttentionCue {
                thread_id: thread_id.clone(),
                message_id,
                sender_name,
            });
        }
        ApplyOutcome::Merged(outcome)
    }

    async fn on_reaction_changed(
        &self,
        thread_id: &ThreadId,
        message_id: &MessageId,
        kind: ChangeKind,
    ) -> ApplyOutcome {
        match self.backend.fetch_reactions(message_id).await {
            Ok(rows) => {
                let aggregate = aggregate_reactions(&rows, &self.viewer);
                let groups = aggregate.len();
                let found = self
                    .views
                    .update(thread_id, |v| v.set_reactions(message_id, aggregate));
                tracing::debug!(message_id = %message_id, ?kind, groups, found, "reactions recomputed");
                ApplyOutcome::ReactionsRecomputed(groups)
            }
            Err(e) => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %e,
                    "reaction refetch failed, keeping previous aggregate"
                );
                ApplyOutcome::ReactionsStale
            }
        }
    }

    /// Cache, then backend, then a placeholder.
    async fn resolve_profile(&self, user_id: &UserId) -> SenderProfile {
        let cached = self.profiles.lock().get(user_id).cloned();
        if let Some(profile) = cached {
            return profile;
        }
        match self.backend.fetch_profile(user_id).await {
            Ok(profile) => {
                self.profiles.lock().insert(user_id.clone(), profile.clone());
                profile
            }
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "sender lookup failed, using placeholder");
                SenderProfile::placeholder()
            }
        }
    }

    /// Local view first, then the backend. `None` if neither has it.
    async fn resolve_reply(&self, thread_id: &ThreadId, reply_id: &MessageId) -> Option<ReplySummary> {
        if let Some(local) = self.views.message(thread_id, reply_id) {
            return Some(ReplySummary::of(&local));
        }
        match self.backend.fetch_message(reply_id).await {
            Ok(mut referenced) => {
                if referenced.sender.is_none() {
                    referenced.sender = Some(self.resolve_profile(&referenced.sender_id).await);
                }
                Some(ReplySummary::of(&referenced))
            }
            Err(e) => {
                tracing::warn!(reply_to_id = %reply_id, error = %e, "reply-to lookup failed");
                None
            }
        }
    }
}
