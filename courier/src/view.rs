//! Local per-thread message lists shared by the send pipeline and the
//! realtime layer.
//!
//! Both writers touch the same list: the pipeline inserts and confirms
//! optimistic entries, the reconciler merges realtime inserts and patches.
//! Every mutation runs as one critical section under a [`parking_lot::Mutex`],
//! so an optimistic entry and its authoritative counterpart are never
//! visible at the same time.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use courier_proto::event::MessageStatusUpdate;
use courier_proto::message::{Message, MessageId, ThreadId};
use courier_proto::reaction::ReactionAggregate;

/// Delivery state of an entry in a thread view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Optimistic entry under a temporary id, write still in flight.
    Pending,
    /// Entry carrying a permanent id.
    Confirmed,
}

/// One message as shown in a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewEntry {
    /// The message.
    pub message: Message,
    /// Whether the backend has confirmed it.
    pub state: EntryState,
}

/// What [`ThreadView::merge_inserted`] did with an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Appended as a new entry.
    Inserted,
    /// Replaced the viewer's pending optimistic entry (realtime echo).
    ReplacedOptimistic,
    /// The permanent id was already present; nothing changed.
    Duplicate,
}

/// What [`ThreadView::confirm`] did with an authoritative send result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The optimistic entry now carries the permanent id.
    Replaced,
    /// The echo had already landed; the optimistic entry was dropped.
    DroppedOptimistic,
    /// Nothing to replace and the permanent id was already present.
    AlreadyConfirmed,
    /// Nothing to replace; the message was appended.
    Appended,
}

/// Ordered message list of one thread.
#[derive(Debug, Clone, Default)]
pub struct ThreadView {
    entries: Vec<ViewEntry>,
    /// Temporary id -> permanent id, for pending entries an echo replaced.
    echoed: HashMap<MessageId, MessageId>,
}

impl ThreadView {
    /// Show `message` immediately as a pending entry.
    pub fn insert_optimistic(&mut self, message: Message) {
        self.entries.push(ViewEntry {
            message,
            state: EntryState::Pending,
        });
    }

    /// Swap the optimistic entry `temp_id` for the authoritative `message`.
    ///
    /// Falls back to a pending entry with the same sender and content when
    /// the temporary id is gone. Display fields the backend does not return
    /// (sender profile, reply preview) are carried over from the optimistic
    /// entry.
    pub fn confirm(&mut self, temp_id: &MessageId, mut message: Message) -> ConfirmOutcome {
        self.echoed.remove(temp_id);
        let permanent = self.position(&message.id);
        let optimistic = self.position(temp_id).or_else(|| {
            permanent
                .is_none()
                .then(|| self.pending_match(&message))
                .flatten()
        });

        match (optimistic, permanent) {
            (Some(idx), Some(_)) => {
                self.entries.remove(idx);
                ConfirmOutcome::DroppedOptimistic
            }
            (Some(idx), None) => {
                let old = &mut self.entries[idx];
                if message.sender.is_none() {
                    message.sender = old.message.sender.take();
                }
                if message.reply_to.is_none() {
                    message.reply_to = old.message.reply_to.take();
                }
                *old = ViewEntry {
                    message,
                    state: EntryState::Confirmed,
                };
                ConfirmOutcome::Replaced
            }
            (None, Some(_)) => ConfirmOutcome::AlreadyConfirmed,
            (None, None) => {
                self.entries.push(ViewEntry {
                    message,
                    state: EntryState::Confirmed,
                });
                ConfirmOutcome::Appended
            }
        }
    }

    /// Merge a message that arrived over realtime, keyed by permanent id.
    pub fn merge_inserted(&mut self, message: Message) -> MergeOutcome {
        if self.position(&message.id).is_some() {
            return MergeOutcome::Duplicate;
        }
        if let Some(idx) = self.pending_match(&message) {
            let permanent = message.id.clone();
            let replaced = std::mem::replace(
                &mut self.entries[idx],
                ViewEntry {
                    message,
                    state: EntryState::Confirmed,
                },
            );
            self.echoed.insert(replaced.message.id, permanent);
            return MergeOutcome::ReplacedOptimistic;
        }
        self.entries.push(ViewEntry {
            message,
            state: EntryState::Confirmed,
        });
        MergeOutcome::Inserted
    }

    /// Take back the optimistic entry `temp_id` after its send failed.
    ///
    /// Returns the permanent id if a realtime echo had already replaced
    /// the entry, in which case the message was delivered and nothing is
    /// removed.
    pub fn withdraw(&mut self, temp_id: &MessageId) -> Option<MessageId> {
        if let Some(permanent) = self.echoed.remove(temp_id) {
            return Some(permanent);
        }
        self.remove(temp_id);
        None
    }

    /// Drop the entry with `id`. Returns `false` if absent.
    pub fn remove(&mut self, id: &MessageId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.message.id != *id);
        self.entries.len() != before
    }

    /// Apply delivery and read receipts. No other field is touched.
    pub fn patch_status(&mut self, update: &MessageStatusUpdate) -> bool {
        let Some(idx) = self.position(&update.id) else {
            return false;
        };
        let msg = &mut self.entries[idx].message;
        msg.delivered_at = update.delivered_at;
        msg.read_by.clone_from(&update.read_by);
        true
    }

    /// Replace the reaction aggregate of `id`.
    pub fn set_reactions(&mut self, id: &MessageId, reactions: Vec<ReactionAggregate>) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        self.entries[idx].message.reactions = reactions;
        true
    }

    /// Entry with `id`, if present.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&ViewEntry> {
        self.entries.iter().find(|e| e.message.id == *id)
    }

    /// All entries in display order.
    #[must_use]
    pub fn entries(&self) -> &[ViewEntry] {
        &self.entries
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.entries.iter().position(|e| e.message.id == *id)
    }

    fn pending_match(&self, message: &Message) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.state == EntryState::Pending
                && e.message.sender_id == message.sender_id
                && e.message.content == message.content
        })
    }
}

/// All open thread views, plus a revision counter observers can watch.
pub struct ThreadViews {
    threads: Mutex<HashMap<ThreadId, ThreadView>>,
    revision: watch::Sender<u64>,
}

impl Default for ThreadViews {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadViews {
    /// Creates an empty set of views.
    #[must_use]
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            threads: Mutex::new(HashMap::new()),
            revision,
        }
    }

    /// Run `f` against the view of `thread_id` as one critical section.
    ///
    /// The view is created on first use. Observers are notified after `f`
    /// returns.
    pub fn update<R>(&self, thread_id: &ThreadId, f: impl FnOnce(&mut ThreadView) -> R) -> R {
        let result = {
            let mut threads = self.threads.lock();
            f(threads.entry(thread_id.clone()).or_default())
        };
        self.revision.send_modify(|r| *r = r.wrapping_add(1));
        result
    }

    /// Copy of the entries of `thread_id`.
    #[must_use]
    pub fn entries(&self, thread_id: &ThreadId) -> Vec<ViewEntry> {
        self.threads
            .lock()
            .get(thread_id)
            .map(|v| v.entries().to_vec())
            .unwrap_or_default()
    }

    /// Copy of one message, if present in the thread's view.
    #[must_use]
    pub fn message(&self, thread_id: &ThreadId, id: &MessageId) -> Option<Message> {
        self.threads
            .lock()
            .get(thread_id)
            .and_then(|v| v.get(id))
            .map(|e| e.message.clone())
    }

    /// Revision counter, bumped after every mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
