//! Integration tests for the optimistic send pipeline.
//!
//! Drives `SendPipeline` together with the realtime `Reconciler` to check
//! that a sent message is shown exactly once whichever of the direct
//! response and the realtime echo lands first.
//!
//! Verification command: `cargo test --test optimistic_send`

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use courier::backend::memory::InMemoryBackend;
use courier::backend::{BackendError, MessageSender};
use courier::outbox::retry::{RetryConfig, RetryCoordinator};
use courier::outbox::store::FailedMessageStore;
use courier::persist::memory::MemoryKv;
use courier::realtime::{Reconciler, ViewerPresence};
use courier::send::{RenderedItem, SendOutcome, SendPipeline};
use courier::view::{EntryState, ThreadViews};
use courier_proto::event::RealtimeEvent;
use courier_proto::message::{
    AttachmentRef, MAX_ATTACHMENT_SIZE, Message, MessageId, OutgoingMessage, SenderProfile,
    ThreadId, UserId, ValidationError,
};

// =============================================================================
// Test helpers
// =============================================================================

const STAFF: &str = "staff-1";

fn thread() -> ThreadId {
    ThreadId::new("thread-1")
}

fn staff_profile() -> SenderProfile {
    SenderProfile {
        display_name: "Ms. Naidoo".into(),
        role: Some("teacher".into()),
        avatar_url: None,
    }
}

/// Sender that blocks each send until the test opens the gate.
struct GatedSender {
    inner: Arc<InMemoryBackend>,
    gate: Semaphore,
}

impl MessageSender for GatedSender {
    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, BackendError> {
        self.gate.acquire().await.expect("gate open").forget();
        self.inner.send_message(draft).await
    }
}

/// Sender that forwards straight to the shared in-memory backend.
struct DirectSender(Arc<InMemoryBackend>);

impl MessageSender for DirectSender {
    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, BackendError> {
        self.0.send_message(draft).await
    }
}

/// Sender that delivers the realtime echo before returning the response.
struct EchoFirstSender {
    inner: Arc<InMemoryBackend>,
    reconciler: Arc<Reconciler<InMemoryBackend>>,
}

impl MessageSender for EchoFirstSender {
    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, BackendError> {
        let stored = self.inner.send_message(draft).await?;
        self.reconciler
            .apply(&draft.thread_id, RealtimeEvent::MessageInserted(stored.clone()))
            .await;
        Ok(stored)
    }
}

/// Sender whose write lands and echoes, but whose response is lost.
struct EchoThenTimeoutSender {
    inner: Arc<InMemoryBackend>,
    reconciler: Arc<Reconciler<InMemoryBackend>>,
}

impl MessageSender for EchoThenTimeoutSender {
    async fn send_message(&self, draft: &OutgoingMessage) -> Result<Message, BackendError> {
        let stored = self.inner.send_message(draft).await?;
        self.reconciler
            .apply(&draft.thread_id, RealtimeEvent::MessageInserted(stored))
            .await;
        Err(BackendError::Timeout)
    }
}

struct Harness<S: MessageSender> {
    backend: Arc<InMemoryBackend>,
    views: Arc<ThreadViews>,
    reconciler: Arc<Reconciler<InMemoryBackend>>,
    pipeline: Arc<SendPipeline<MemoryKv, S, InMemoryBackend>>,
}

/// Wire a pipeline and a reconciler over shared views; `make_sender` builds
/// the send primitive from the backend and reconciler.
fn harness<S, F>(make_sender: F) -> Harness<S>
where
    S: MessageSender,
    F: FnOnce(Arc<InMemoryBackend>, Arc<Reconciler<InMemoryBackend>>) -> S,
{
    let backend = Arc::new(InMemoryBackend::new(UserId::new(STAFF)));
    backend.put_profile(UserId::new(STAFF), staff_profile());
    let views = Arc::new(ThreadViews::new());
    let (reconciler, _cues) = Reconciler::new(
        UserId::new(STAFF),
        Arc::clone(&backend),
        Arc::clone(&views),
        Arc::new(ViewerPresence::new()),
        8,
    );
    let reconciler = Arc::new(reconciler);
    let sender = Arc::new(make_sender(Arc::clone(&backend), Arc::clone(&reconciler)));
    let store = Arc::new(FailedMessageStore::new(MemoryKv::new()));
    let (coordinator, _events) = RetryCoordinator::new(store, sender, RetryConfig::default(), 16);
    let pipeline = SendPipeline::new(
        UserId::new(STAFF),
        Arc::clone(&views),
        Arc::new(coordinator),
        Arc::clone(&backend),
    )
    .with_profile(staff_profile());
    Harness {
        backend,
        views,
        reconciler,
        pipeline: Arc::new(pipeline),
    }
}

fn plain() -> Harness<DirectSender> {
    harness(|backend, _| DirectSender(backend))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

// =============================================================================
// Optimistic entry lifecycle
// =============================================================================

#[tokio::test]
async fn temp_entry_is_visible_until_response_then_swapped() {
    let h = harness(|backend, _| GatedSender {
        inner: backend,
        gate: Semaphore::new(0),
    });

    let pipeline = Arc::clone(&h.pipeline);
    let send = tokio::spawn(async move { pipeline.send(OutgoingMessage::text(thread(), "Hello")).await });
    settle().await;

    // In flight: one pending entry under a temporary id.
    let entries = h.views.entries(&thread());
    assert_eq!(entries.len(), 1);
    assert!(entries[0].message.id.is_temporary());
    assert!(entries[0].message.id.as_str().starts_with("temp-"));
    assert_eq!(entries[0].state, EntryState::Pending);
    assert_eq!(entries[0].message.sender, Some(staff_profile()));

    h.pipeline.coordinator().sender().gate.add_permits(1);
    let outcome = send.await.expect("task joined").expect("valid draft");
    assert!(matches!(outcome, SendOutcome::Sent(ref m) if m.id == MessageId::new("srv-1")));

    let entries = h.views.entries(&thread());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, MessageId::new("srv-1"));
    assert_eq!(entries[0].state, EntryState::Confirmed);
}

#[tokio::test]
async fn echo_after_response_is_not_duplicated() {
    let h = harness(|backend, _| GatedSender {
        inner: backend,
        gate: Semaphore::new(1),
    });
    let outcome = h
        .pipeline
        .send(OutgoingMessage::text(thread(), "Hello"))
        .await
        .expect("valid draft");
    let SendOutcome::Sent(stored) = outcome else {
        panic!("expected Sent");
    };

    h.reconciler
        .apply(&thread(), RealtimeEvent::MessageInserted(stored.clone()))
        .await;
    h.reconciler
        .apply(&thread(), RealtimeEvent::MessageInserted(stored))
        .await;

    let entries = h.views.entries(&thread());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, MessageId::new("srv-1"));
}

#[tokio::test]
async fn echo_before_response_is_not_duplicated() {
    let h = harness(|backend, reconciler| EchoFirstSender {
        inner: backend,
        reconciler,
    });
    let outcome = h
        .pipeline
        .send(OutgoingMessage::text(thread(), "Hello"))
        .await
        .expect("valid draft");
    assert!(matches!(outcome, SendOutcome::Sent(_)));

    let entries = h.views.entries(&thread());
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message.id, MessageId::new("srv-1"));
    assert_eq!(entries[0].state, EntryState::Confirmed);
    assert!(entries.iter().all(|e| !e.message.id.is_temporary()));
}

#[tokio::test]
async fn two_identical_messages_stay_two_entries() {
    let h = harness(|backend, reconciler| EchoFirstSender {
        inner: backend,
        reconciler,
    });
    h.pipeline
        .send(OutgoingMessage::text(thread(), "ok"))
        .await
        .expect("valid draft");
    h.pipeline
        .send(OutgoingMessage::text(thread(), "ok"))
        .await
        .expect("valid draft");

    let ids: Vec<MessageId> = h
        .views
        .entries(&thread())
        .into_iter()
        .map(|e| e.message.id)
        .collect();
    assert_eq!(ids, vec![MessageId::new("srv-1"), MessageId::new("srv-2")]);
}

// =============================================================================
// Validation
// =============================================================================

#[tokio::test]
async fn invalid_drafts_never_reach_the_view() {
    let h = plain();

    let empty = h.pipeline.send(OutgoingMessage::text(thread(), " \n")).await;
    assert_eq!(empty, Err(ValidationError::Empty));

    let huge = OutgoingMessage::text(thread(), "see attached").with_attachment(AttachmentRef {
        id: "obj-1".into(),
        name: "video.mp4".into(),
        size_bytes: MAX_ATTACHMENT_SIZE + 1,
        mime_type: Some("video/mp4".into()),
    });
    assert!(matches!(
        h.pipeline.send(huge).await,
        Err(ValidationError::AttachmentTooLarge { .. })
    ));

    assert!(h.views.entries(&thread()).is_empty());
    assert!(h.pipeline.coordinator().store().snapshot().is_empty());
}

#[tokio::test]
async fn attachment_only_message_is_sent() {
    let h = plain();
    let draft = OutgoingMessage::text(thread(), "").with_attachment(AttachmentRef {
        id: "obj-7".into(),
        name: "homework.pdf".into(),
        size_bytes: 2048,
        mime_type: Some("application/pdf".into()),
    });
    let outcome = h.pipeline.send(draft).await.expect("valid draft");
    let SendOutcome::Sent(msg) = outcome else {
        panic!("expected Sent");
    };
    assert_eq!(msg.attachments.len(), 1);
}

// =============================================================================
// Failures and side effects
// =============================================================================

#[tokio::test]
async fn failed_send_renders_as_failed_item() {
    let h = plain();
    h.pipeline
        .send(OutgoingMessage::text(thread(), "Before"))
        .await
        .expect("valid draft");
    h.backend.set_online(false);

    let outcome = h
        .pipeline
        .send(
            OutgoingMessage::text(thread(), "Please bring a hat").with_attachment(AttachmentRef {
                id: "obj-3".into(),
                name: "letter.pdf".into(),
                size_bytes: 10,
                mime_type: None,
            }),
        )
        .await
        .expect("valid draft");
    let SendOutcome::Failed(record) = outcome else {
        panic!("expected Failed");
    };
    assert_eq!(record.attachment_ids, Some(vec!["obj-3".to_string()]));

    let rendered = h.pipeline.rendered_thread(&thread());
    assert_eq!(rendered.len(), 2);
    assert!(matches!(&rendered[0], RenderedItem::Message(e) if e.message.content == "Before"));
    assert!(matches!(&rendered[1], RenderedItem::Failed(r) if r.content == "Please bring a hat"));

    // Dismissing removes the failed row.
    assert!(h.pipeline.dismiss(&record.local_id).await);
    assert_eq!(h.pipeline.rendered_thread(&thread()).len(), 1);
}

#[tokio::test]
async fn lost_response_after_echo_is_not_queued_as_failed() {
    let h = harness(|backend, reconciler| EchoThenTimeoutSender {
        inner: backend,
        reconciler,
    });
    let outcome = h
        .pipeline
        .send(OutgoingMessage::text(thread(), "Hello"))
        .await
        .expect("valid draft");
    let SendOutcome::Sent(msg) = outcome else {
        panic!("expected Sent, got {outcome:?}");
    };
    assert_eq!(msg.id, MessageId::new("srv-1"));

    assert!(h.pipeline.coordinator().store().snapshot().is_empty());
    let rendered = h.pipeline.rendered_thread(&thread());
    assert_eq!(rendered.len(), 1);
    assert!(matches!(&rendered[0], RenderedItem::Message(e) if e.message.id == MessageId::new("srv-1")));
}

#[tokio::test]
async fn side_effect_failures_do_not_roll_back_send() {
    let h = plain();
    h.backend.set_side_effects_fail(true);
    let outcome = h
        .pipeline
        .send(OutgoingMessage::text(thread(), "Hello"))
        .await
        .expect("valid draft");
    assert!(matches!(outcome, SendOutcome::Sent(_)));
    settle().await;

    assert_eq!(h.views.entries(&thread()).len(), 1);
    assert!(h.pipeline.coordinator().store().snapshot().is_empty());
    assert!(h.backend.summary_refreshes().is_empty());
    assert!(h.backend.notifications().is_empty());
}
