//! In-process backend for testing.
//!
//! [`InMemoryBackend`] stores messages, reactions and profiles in memory,
//! assigns permanent ids of the form `srv-N`, and can be switched offline or
//! told to fail a number of upcoming sends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use courier_proto::message::{
    Message, MessageId, OutgoingMessage, SenderProfile, ThreadId, Timestamp, UserId,
};
use courier_proto::reaction::ReactionRow;

use super::{BackendError, MessageBackend, MessageSender};

/// In-memory stand-in for the hosted backend.
pub struct InMemoryBackend {
    /// The signed-in user; every inserted message is authored by them.
    user_id: UserId,
    messages: Mutex<Vec<Message>>,
    reactions: Mutex<Vec<ReactionRow>>,
    profiles: Mutex<HashMap<UserId, SenderProfile>>,
    next_id: AtomicU64,
    online: AtomicBool,
    fail_next: AtomicU32,
    side_effects_fail: AtomicBool,
    send_attempts: AtomicU32,
    summary_refreshes: Mutex<Vec<ThreadId>>,
    notifications: Mutex<Vec<MessageId>>,
}

impl InMemoryBackend {
    /// Creates an online backend whose session belongs to `user_id`.
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            messages: Mutex::new(Vec::new()),
            reactions: Mutex::new(Vec::new()),
            profiles: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            side_effects_fail: AtomicBool::new(false),
            send_attempts: AtomicU32::new(0),
            summary_refreshes: Mutex::new(Vec::new()),
            notifications: Mutex::new(Vec::new()),
        }
    }

    /// Switch the backend on- or offline. Offline sends fail with a network error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Fail the next `n` sends even while online.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make summary refreshes and push dispatch fail.
    pub fn set_side_effects_fail(&self, fail: bool) {
        self.side_effects_fail.store(fail, Ordering::SeqCst);
    }

    /// Register a display profile.
    pub fn put_profile(&self, user_id: UserId, profile: SenderProfile) {
        self.profiles.lock().insert(user_id, profile);
    }

    /// Store a message authored by someone else, assigning it a permanent id.
    pub fn insert_foreign(&self, sender_id: UserId, draft: &OutgoingMessage) -> Message {
        let msg = self.build(sender_id, draft);
        self.messages.lock().push(msg.clone());
        msg
    }

    /// Add a reaction row.
    pub fn add_reaction(&self, message_id: &MessageId, user_id: UserId, emoji: &str) {
        self.reactions.lock().push(ReactionRow {
            message_id: message_id.clone(),
            user_id,
            emoji: emoji.to_string(),
            created_at: Timestamp::now(),
        });
    }

    /// Remove a reaction row.
    pub fn remove_reaction(&self, message_id: &MessageId, user_id: &UserId, emoji: &str) {
        self.reactions.lock().retain(|r| {
            !(r.message_id == *message_id && r.user_id == *user_id && r.emoji == emoji)
        });
    }

    /// Messages stored so far, in insert order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Number of send attempts received, successful or not.
    #[must_use]
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Threads whose summary was refreshed.
    #[must_use]
    pub fn summary_refreshes(&self) -> Vec<ThreadId> {
        self.summary_refreshes.lock().clone()
    }

    /// Messages for which push notifications were dispatched.
    #[must_use]
    pub fn notifications(&self) -> Vec<MessageId> {
        self.notifications.lock().clone()
    }

    fn build(&self, sender_id: UserId, draft: &OutgoingMessage) -> Message {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut msg = draft.to_optimistic(MessageId::new(format!("srv-{n}")), sender_id, None);
        msg.delivered_at = Some(Timestamp::now());
        msg
    }

    fn side_effect(&self) -> Result<(), BackendError> {
        if self.side_effects_fail.load(Ordering::SeqCst) {
            Err(BackendError::Network("side effect failed".into()))
        } else {
            Ok(())
        }
    }
}

impl MessageSender for InMemoryBackend {
    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, BackendError> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(BackendError::Network("network request failed".into()));
        }
        let scripted_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure {
            return Err(BackendError::Network("connection reset".into()));
        }
        let msg = self.build(self.user_id.clone(), draft);
        self.messages.lock().push(msg.clone());
        Ok(msg)
    }
}

impl MessageBackend for InMemoryBackend {
    async fn fetch_profile(&self, user_id: &UserId) -> Result<SenderProfile, BackendError> {
        self.profiles
            .lock()
            .get(user_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("profile {user_id}")))
    }

    async fn fetch_message(&self, message_id: &MessageId) -> Result<Message, BackendError> {
        self.messages
            .lock()
            .iter()
            .find(|m| m.id == *message_id)
            .cloned()
            .ok_or_else(|| BackendError::NotFound(format!("message {message_id}")))
    }

    async fn fetch_reactions(&self, message_id: &MessageId) -> Result<Vec<ReactionRow>, BackendError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(BackendError::Network("network request failed".into()));
        }
        Ok(self
            .reactions
            .lock()
            .iter()
            .filter(|r| r.message_id == *message_id)
            .cloned()
            .collect())
    }

    async fn refresh_thread_summary(&self, thread_id: &ThreadId) -> Result<(), BackendError> {
        self.side_effect()?;
        self.summary_refreshes.lock().push(thread_id.clone());
        Ok(())
    }

    async fn notify_participants(&self, message: &Message) -> Result<(), BackendError> {
        self.side_effect()?;
        self.notifications.lock().push(message.id.clone());
        Ok(())
    }
}
