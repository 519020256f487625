//! Integration tests for realtime reconciliation.
//!
//! Publishes raw change payloads through the loopback transport and checks
//! the resulting thread views: sender and reply-to resolution, receipt
//! patches, reaction recomputation, attention cues and subscription
//! lifecycle.
//!
//! Verification command: `cargo test --test realtime_reconcile`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use courier::backend::memory::InMemoryBackend;
use courier::config::CourierConfig;
use courier::outbox::retry::{RetryConfig, RetryCoordinator};
use courier::outbox::store::FailedMessageStore;
use courier::persist::memory::MemoryKv;
use courier::realtime::loopback::LoopbackRealtime;
use courier::realtime::subscription::{RealtimeHub, RealtimeTransport};
use courier::realtime::{AppState, AttentionCue, Reconciler, ViewerPresence};
use courier::view::ThreadViews;
use courier_proto::connection::ConnectionState;
use courier_proto::event::{ChangeKind, RealtimeEvent};
use courier_proto::message::{Message, MessageId, OutgoingMessage, SenderProfile, ThreadId, UserId};
use courier_proto::reaction::ReactionAggregate;

// =============================================================================
// Test helpers
// =============================================================================

const STAFF: &str = "staff-1";

fn thread() -> ThreadId {
    ThreadId::new("thread-1")
}

struct Harness {
    backend: Arc<InMemoryBackend>,
    transport: Arc<LoopbackRealtime>,
    hub: RealtimeHub<LoopbackRealtime, InMemoryBackend>,
    cues: mpsc::Receiver<AttentionCue>,
}

impl Harness {
    fn views(&self) -> &Arc<ThreadViews> {
        self.hub.reconciler().views()
    }

    fn message(&self, id: &str) -> Option<Message> {
        self.views().message(&thread(), &MessageId::new(id))
    }
}

fn harness() -> Harness {
    let backend = Arc::new(InMemoryBackend::new(UserId::new(STAFF)));
    backend.put_profile(
        UserId::new("parent-a"),
        SenderProfile {
            display_name: "Parent A".into(),
            role: Some("parent".into()),
            avatar_url: None,
        },
    );
    backend.put_profile(
        UserId::new("parent-b"),
        SenderProfile {
            display_name: "Parent B".into(),
            role: Some("parent".into()),
            avatar_url: None,
        },
    );
    let config = CourierConfig {
        attention_buffer: 16,
        channel_capacity: 64,
        ..CourierConfig::default()
    };
    let (reconciler, cues) = Reconciler::from_config(
        UserId::new(STAFF),
        Arc::clone(&backend),
        Arc::new(ThreadViews::new()),
        Arc::new(ViewerPresence::new()),
        &config,
    );
    let transport = Arc::new(LoopbackRealtime::from_config(&config));
    let hub = RealtimeHub::new(Arc::clone(&transport), Arc::new(reconciler));
    Harness {
        backend,
        transport,
        hub,
        cues,
    }
}

fn insert_payload(id: &str, sender: &str, content: &str, reply_to: Option<&str>) -> String {
    json!({
        "table": "messages",
        "eventType": "INSERT",
        "new": {
            "id": id,
            "thread_id": "thread-1",
            "sender_id": sender,
            "content": content,
            "reply_to_id": reply_to,
            "created_at": "2024-05-01T10:00:00Z",
            "delivered_at": null,
            "read_by": []
        },
        "old": {}
    })
    .to_string()
}

fn reaction_payload(message_id: &str, kind: &str) -> String {
    let row = json!({ "message_id": message_id, "user_id": "x", "emoji": "x" });
    let (new, old) = if kind == "DELETE" {
        (json!({}), row)
    } else {
        (row, json!({}))
    };
    json!({ "table": "message_reactions", "eventType": kind, "new": new, "old": old }).to_string()
}

/// Poll `check` until it holds or a second passes.
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// =============================================================================
// New messages
// =============================================================================

#[tokio::test]
async fn inserted_message_gets_sender_profile() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "Good morning", None));

    assert!(eventually(|| h.message("srv-1").is_some()).await);
    let msg = h.message("srv-1").expect("merged");
    assert_eq!(msg.sender.expect("resolved").display_name, "Parent A");
}

#[tokio::test]
async fn unknown_sender_is_shown_with_placeholder() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport
        .publish(&thread(), insert_payload("srv-1", "someone-new", "Hi", None));

    assert!(eventually(|| h.message("srv-1").is_some()).await);
    assert_eq!(
        h.message("srv-1").expect("merged").sender,
        Some(SenderProfile::placeholder())
    );
}

#[tokio::test]
async fn missing_reply_target_still_merges() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport.publish(
        &thread(),
        insert_payload("srv-2", "parent-a", "Re: uniforms", Some("srv-deleted")),
    );

    assert!(eventually(|| h.message("srv-2").is_some()).await);
    let msg = h.message("srv-2").expect("merged");
    assert_eq!(msg.reply_to_id, Some(MessageId::new("srv-deleted")));
    assert!(msg.reply_to.is_none());
}

#[tokio::test]
async fn duplicate_and_malformed_payloads_are_harmless() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "One", None));
    h.transport.publish(&thread(), "{ definitely not json");
    h.transport
        .publish(&thread(), r#"{"table":"attendance","eventType":"INSERT","new":{"id":1}}"#);
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "One", None));
    h.transport
        .publish(&thread(), insert_payload("srv-2", "parent-b", "Two", None));

    assert!(eventually(|| h.message("srv-2").is_some()).await);
    let ids: Vec<MessageId> = h
        .views()
        .entries(&thread())
        .into_iter()
        .map(|e| e.message.id)
        .collect();
    assert_eq!(ids, vec![MessageId::new("srv-1"), MessageId::new("srv-2")]);
}

// =============================================================================
// Receipts
// =============================================================================

#[tokio::test]
async fn status_update_changes_only_receipts() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "Original", None));
    assert!(eventually(|| h.message("srv-1").is_some()).await);
    let before = h.message("srv-1").expect("merged");

    let update = json!({
        "table": "messages",
        "eventType": "UPDATE",
        "new": {
            "id": "srv-1",
            "thread_id": "thread-1",
            "sender_id": "parent-a",
            "content": "Edited content that must not leak",
            "created_at": "2030-01-01T00:00:00Z",
            "delivered_at": "2024-05-01T10:00:03Z",
            "read_by": ["staff-1"]
        }
    });
    h.transport.publish(&thread(), update.to_string());

    assert!(eventually(|| h.message("srv-1").is_some_and(|m| m.delivered_at.is_some())).await);
    let after = h.message("srv-1").expect("still there");
    assert_eq!(after.content, "Original");
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.sender, before.sender);
    assert!(after.read_by.contains(&UserId::new(STAFF)));
}

// =============================================================================
// Reactions
// =============================================================================

#[tokio::test]
async fn two_users_same_emoji_counts_two_in_order() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "Sports day photos", None));
    assert!(eventually(|| h.message("srv-1").is_some()).await);

    let id = MessageId::new("srv-1");
    h.backend.add_reaction(&id, UserId::new("parent-a"), "❤️");
    h.transport.publish(&thread(), reaction_payload("srv-1", "INSERT"));
    h.backend.add_reaction(&id, UserId::new("parent-b"), "❤️");
    h.transport.publish(&thread(), reaction_payload("srv-1", "INSERT"));

    let expected = vec![ReactionAggregate {
        emoji: "❤️".into(),
        count: 2,
        reacted_by_user_ids: vec![UserId::new("parent-a"), UserId::new("parent-b")],
        has_reacted: false,
    }];
    assert!(eventually(|| h.message("srv-1").is_some_and(|m| m.reactions == expected)).await);
}

#[tokio::test]
async fn reaction_removal_recomputes_from_rows() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "Hello", None));
    assert!(eventually(|| h.message("srv-1").is_some()).await);

    let id = MessageId::new("srv-1");
    h.backend.add_reaction(&id, UserId::new(STAFF), "👍");
    h.backend.add_reaction(&id, UserId::new("parent-b"), "👍");
    h.transport.publish(&thread(), reaction_payload("srv-1", "INSERT"));
    assert!(
        eventually(|| h
            .message("srv-1")
            .is_some_and(|m| m.reactions.first().is_some_and(|r| r.count == 2 && r.has_reacted)))
        .await
    );

    h.backend.remove_reaction(&id, &UserId::new(STAFF), "👍");
    h.transport.publish(&thread(), reaction_payload("srv-1", "DELETE"));
    assert!(
        eventually(|| h
            .message("srv-1")
            .is_some_and(|m| m.reactions.first().is_some_and(|r| r.count == 1 && !r.has_reacted)))
        .await
    );
}

#[tokio::test]
async fn repeated_reaction_events_are_idempotent() {
    let h = harness();
    let reconciler = h.hub.reconciler();
    reconciler
        .apply(
            &thread(),
            RealtimeEvent::MessageInserted(OutgoingMessage::text(thread(), "Hi").to_optimistic(
                MessageId::new("srv-1"),
                UserId::new("parent-a"),
                None,
            )),
        )
        .await;
    h.backend
        .add_reaction(&MessageId::new("srv-1"), UserId::new("parent-a"), "🎉");

    let event = RealtimeEvent::ReactionChanged {
        message_id: MessageId::new("srv-1"),
        kind: ChangeKind::Insert,
    };
    reconciler.apply(&thread(), event.clone()).await;
    let once = h.message("srv-1").expect("present").reactions;
    for _ in 0..3 {
        reconciler.apply(&thread(), event.clone()).await;
    }
    let many = h.message("srv-1").expect("present").reactions;
    assert_eq!(once, many);
    assert_eq!(many[0].count, 1);
}

// =============================================================================
// Attention cues
// =============================================================================

#[tokio::test]
async fn cue_for_other_thread_in_foreground_only() {
    let mut h = harness();
    let presence = Arc::clone(h.hub.reconciler().presence());
    let reconciler = h.hub.reconciler();

    // Viewer is reading another thread.
    presence.set_active_thread(ThreadId::new("thread-2"));
    let from_parent = |id: &str| {
        RealtimeEvent::MessageInserted(OutgoingMessage::text(thread(), "Ping").to_optimistic(
            MessageId::new(id),
            UserId::new("parent-b"),
            None,
        ))
    };

    reconciler.apply(&thread(), from_parent("srv-1")).await;
    let cue = h.cues.try_recv().expect("cue raised");
    assert_eq!(cue.thread_id, thread());
    assert_eq!(cue.sender_name, "Parent B");

    // Same message again: duplicate, no cue.
    reconciler.apply(&thread(), from_parent("srv-1")).await;
    assert!(h.cues.try_recv().is_err());

    presence.set_app_state(AppState::Background);
    reconciler.apply(&thread(), from_parent("srv-2")).await;
    assert!(h.cues.try_recv().is_err());

    // Subscribing marks the thread active: no cue while it is on screen.
    presence.set_app_state(AppState::Foreground);
    h.hub.activate(thread()).await.expect("subscribed");
    reconciler.apply(&thread(), from_parent("srv-3")).await;
    assert!(h.cues.try_recv().is_err());
}

// =============================================================================
// Subscription lifecycle
// =============================================================================

#[tokio::test]
async fn switching_threads_tears_down_previous_subscription() {
    let h = harness();
    let other = ThreadId::new("thread-2");

    h.hub.activate(thread()).await.expect("subscribed");
    assert!(eventually(|| h.transport.subscriber_count(&thread()) == 1).await);

    h.hub.activate(other.clone()).await.expect("subscribed");
    assert_eq!(h.hub.active_thread(), Some(other.clone()));
    assert!(eventually(|| h.transport.subscriber_count(&thread()) == 0).await);
    assert_eq!(h.transport.subscriber_count(&other), 1);

    h.hub.deactivate();
    assert!(h.hub.active_thread().is_none());
    assert!(h.hub.reconciler().presence().active_thread().is_none());
    assert!(eventually(|| h.transport.subscriber_count(&other) == 0).await);
}

#[tokio::test]
async fn dropping_hub_unsubscribes() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    let transport = Arc::clone(&h.transport);
    drop(h);
    assert!(eventually(|| transport.subscriber_count(&thread()) == 0).await);
}

#[tokio::test]
async fn failed_subscribe_leaves_no_thread_active() {
    let mut h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    h.transport.close();

    let other = ThreadId::new("thread-2");
    assert!(h.hub.activate(other.clone()).await.is_err());
    assert!(h.hub.active_thread().is_none());
    assert!(h.hub.reconciler().presence().active_thread().is_none());

    // Nothing is on screen, so a new message in the thread still raises a cue.
    let incoming = OutgoingMessage::text(other.clone(), "Are you there?").to_optimistic(
        MessageId::new("srv-5"),
        UserId::new("parent-a"),
        None,
    );
    h.hub
        .reconciler()
        .apply(&other, RealtimeEvent::MessageInserted(incoming))
        .await;
    let cue = h.cues.try_recv().expect("cue raised");
    assert_eq!(cue.thread_id, other);
}

#[tokio::test]
async fn events_on_other_thread_stream_are_ignored() {
    let h = harness();
    h.hub.activate(thread()).await.expect("subscribed");
    let stray = json!({
        "table": "messages",
        "eventType": "INSERT",
        "new": {
            "id": "srv-x", "thread_id": "thread-9", "sender_id": "parent-a",
            "content": "wrong thread", "created_at": "2024-05-01T10:00:00Z"
        }
    });
    h.transport.publish(&thread(), stray.to_string());
    h.transport
        .publish(&thread(), insert_payload("srv-1", "parent-a", "right thread", None));

    assert!(eventually(|| h.message("srv-1").is_some()).await);
    assert_eq!(h.views().entries(&thread()).len(), 1);
    assert!(h.views().entries(&ThreadId::new("thread-9")).is_empty());
}

// =============================================================================
// Connection state drives the outbox
// =============================================================================

#[tokio::test]
async fn transport_reconnect_retries_failed_messages() {
    let h = harness();
    let store = Arc::new(FailedMessageStore::new(MemoryKv::new()));
    let (coordinator, _events) =
        RetryCoordinator::new(store, Arc::clone(&h.backend), RetryConfig::default(), 16);
    let coordinator = Arc::new(coordinator);
    coordinator
        .enqueue_failure(
            MessageId::new("temp-1"),
            &OutgoingMessage::text(thread(), "Sent while offline"),
            "network error: network request failed",
        )
        .await;

    let auto = coordinator.spawn_auto_retry(h.transport.connection_state());
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.transport.set_connection_state(ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_millis(20)).await;
    h.transport.set_connection_state(ConnectionState::Connected);

    assert!(eventually(|| coordinator.store().snapshot().is_empty()).await);
    assert_eq!(h.backend.messages().len(), 1);
    auto.abort();
}
