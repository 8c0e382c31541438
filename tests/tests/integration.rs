use palaver_foundation::queue::{InMemoryQueue, PersistenceConsumer};
use palaver_kernel::conversation::{ContextTurn, Role};
use palaver_kernel::error::ChatError;
use palaver_testing::harness::{collect, transcript};
use palaver_testing::inference::{backend_error, chunk};
use palaver_testing::{FailingPublisher, RecordingPublisher, TestHarness, assert_load};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MODEL: &str = "qwen";
const A: &str = "10.0.0.1:8083";
const B: &str = "10.0.0.2:8083";
const C: &str = "10.0.0.3:8083";

fn three_backends() -> TestHarness {
    TestHarness::builder()
        .backend(MODEL, "10.0.0.1", 8083)
        .backend(MODEL, "10.0.0.2", 8083)
        .backend(MODEL, "10.0.0.3", 8083)
        .build()
}

fn one_backend() -> TestHarness {
    TestHarness::builder().backend(MODEL, "10.0.0.1", 8083).build()
}

// ============================================================================
// Backend selection
// ============================================================================

#[tokio::test]
async fn idle_backends_are_taken_in_discovery_order() {
    let h = three_backends();

    assert_eq!(h.balancer.select(MODEL).await.unwrap(), A);
    assert_eq!(h.balancer.select(MODEL).await.unwrap(), B);
    assert_eq!(h.balancer.select(MODEL).await.unwrap(), C);

    assert_load!(h.tracker, MODEL, A, 1);
    assert_load!(h.tracker, MODEL, B, 1);
    assert_load!(h.tracker, MODEL, C, 1);
}

#[tokio::test]
async fn busy_backends_fall_back_to_least_loaded() {
    let h = three_backends();
    h.tracker.set_load(MODEL, A, 2.0);
    h.tracker.set_load(MODEL, B, 1.0);
    h.tracker.set_load(MODEL, C, 3.0);

    assert_eq!(h.balancer.select(MODEL).await.unwrap(), B);
    assert_load!(h.tracker, MODEL, B, 2);
}

#[tokio::test]
async fn a_completed_turn_gives_its_load_back() {
    let h = one_backend();

    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;

    assert!(events.last().unwrap().is_finished);
    assert_load!(h.tracker, MODEL, A, 0);
    assert_eq!(h.tracker.acquire_count(), 1);
    assert_eq!(h.tracker.release_count(), 1);
}

#[tokio::test]
async fn concurrent_turns_spread_across_backends() {
    let h = TestHarness::builder()
        .backend(MODEL, "10.0.0.1", 8083)
        .backend(MODEL, "10.0.0.2", 8083)
        .build();
    h.connector.set_frames(vec![chunk("thinking")]);
    h.connector.hang(true);

    let first = CancellationToken::new();
    let second = CancellationToken::new();
    let mut rx1 = h.start("u1", None, "one", MODEL, first.clone()).await.unwrap();
    let mut rx2 = h.start("u2", None, "two", MODEL, second.clone()).await.unwrap();

    let addresses: Vec<String> = h.connector.requests().into_iter().map(|(a, _)| a).collect();
    assert_eq!(addresses, vec![A.to_string(), B.to_string()]);
    assert_load!(h.tracker, MODEL, A, 1);
    assert_load!(h.tracker, MODEL, B, 1);

    first.cancel();
    second.cancel();
    collect(&mut rx1).await;
    collect(&mut rx2).await;
    h.settle().await;

    assert_load!(h.tracker, MODEL, A, 0);
    assert_load!(h.tracker, MODEL, B, 0);
}

#[tokio::test]
async fn no_registered_backend_is_unavailable() {
    let h = TestHarness::builder().build();

    let err = h.chat("u1", None, "hello", MODEL).await.unwrap_err();

    assert!(matches!(err, ChatError::Unavailable(_)));
    assert_eq!(h.tracker.acquire_count(), 0);
    assert_eq!(h.connector.dial_count(), 0);
}

// ============================================================================
// End to end
// ============================================================================

#[tokio::test]
async fn first_turn_creates_a_session_and_stores_both_sides() {
    let h = one_backend();

    let events = h.chat("u1", Some(""), "hello", MODEL).await.unwrap();
    h.settle().await;

    let session_id = events[0].session_id.clone();
    assert!(!session_id.is_empty());
    assert!(events.iter().all(|e| e.session_id == session_id));
    assert!(events.iter().all(|e| !e.is_error()));
    assert!(events.last().unwrap().is_finished);
    assert_eq!(transcript(&events), "Hi there");

    let history = h.orchestrator.get_chat_history(&session_id, 20, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!((history[1].role, history[1].content.as_str()), (Role::User, "hello"));
    assert_eq!(
        (history[0].role, history[0].content.as_str()),
        (Role::Assistant, "Hi there")
    );

    let sessions = h.orchestrator.get_user_sessions("u1", 20, 0).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].title, "hello");
}

#[tokio::test]
async fn follow_up_turns_carry_prior_context_over_one_connection() {
    let h = one_backend();

    let first = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;
    let session_id = first[0].session_id.clone();

    h.connector.reply_with(&["Again"]);
    let second = h.chat("u1", Some(session_id.as_str()), "once more", MODEL).await.unwrap();
    h.settle().await;
    assert_eq!(second[0].session_id, session_id);

    let requests = h.connector.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].1.session_id, session_id);
    let turns: Vec<ContextTurn> = serde_json::from_str(&requests[1].1.message).unwrap();
    let flat: Vec<(Role, &str)> = turns.iter().map(|t| (t.role, t.content.as_str())).collect();
    assert_eq!(
        flat,
        vec![
            (Role::User, "hello"),
            (Role::Assistant, "Hi there"),
            (Role::User, "once more"),
        ]
    );

    assert_eq!(h.connector.dial_count(), 1);
    assert_eq!(h.gateway.pooled().await, 1);
    assert_eq!(
        h.orchestrator.get_chat_history(&session_id, 20, 0).await.unwrap().len(),
        4
    );
}

#[tokio::test]
async fn transport_failure_mid_stream_discards_the_partial_reply() {
    let h = one_backend();
    h.connector.fail_after(&["Hi"], "gpu fault");

    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;

    assert_eq!(events[0].content, "Hi");
    let last = events.last().unwrap();
    assert!(last.is_finished);
    assert!(last.error.as_deref().unwrap().contains("gpu fault"));

    let history = h
        .orchestrator
        .get_chat_history(&last.session_id, 20, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, Role::User);
    assert_load!(h.tracker, MODEL, A, 0);
}

#[tokio::test]
async fn backend_reported_error_ends_the_stream() {
    let h = one_backend();
    h.connector
        .set_frames(vec![chunk("Hi"), backend_error("out of memory"), chunk("late")]);

    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;

    assert_eq!(events.len(), 2);
    assert!(events[1].error.as_deref().unwrap().contains("out of memory"));
    assert_eq!(h.store_data.message_count().await, 1);
    assert_load!(h.tracker, MODEL, A, 0);
}

#[tokio::test]
async fn refused_dial_is_unavailable_and_still_released() {
    let h = one_backend();
    h.connector.refuse_dials(true);

    let err = h.chat("u1", None, "hello", MODEL).await.unwrap_err();
    h.settle().await;

    assert!(matches!(err, ChatError::Unavailable(_)));
    assert_eq!(h.tracker.release_count(), 1);
    assert_load!(h.tracker, MODEL, A, 0);
}

#[tokio::test]
async fn client_cancellation_releases_without_saving_a_reply() {
    let h = one_backend();
    h.connector.set_frames(vec![chunk("Hi")]);
    h.connector.hang(true);

    let cancel = CancellationToken::new();
    let mut rx = h.start("u1", None, "hello", MODEL, cancel.clone()).await.unwrap();
    let first = rx.recv().await.unwrap();
    assert_eq!(first.content, "Hi");

    cancel.cancel();
    collect(&mut rx).await;
    h.settle().await;

    assert_load!(h.tracker, MODEL, A, 0);
    let history = h
        .orchestrator
        .get_chat_history(&first.session_id, 20, 0)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn shutdown_cancels_open_streams() {
    let h = one_backend();
    h.connector.set_frames(vec![chunk("Hi")]);
    h.connector.hang(true);

    let mut rx = h
        .start("u1", None, "hello", MODEL, CancellationToken::new())
        .await
        .unwrap();
    rx.recv().await.unwrap();

    assert!(h.orchestrator.shutdown(Duration::from_secs(5)).await);
    collect(&mut rx).await;
    assert_load!(h.tracker, MODEL, A, 0);
}

// ============================================================================
// Storage tiers
// ============================================================================

#[tokio::test]
async fn reads_prefer_the_cache_and_fall_back_to_the_store() {
    let h = one_backend();
    let session = h.orchestrator.create_session("u1", "Trip planning").await.unwrap();
    h.repository()
        .save_message(&session.id, "u1", Role::User, "where to?")
        .await
        .unwrap();

    let cached = h.orchestrator.get_chat_history(&session.id, 20, 0).await.unwrap();
    assert_eq!(h.store.read_count(), 0);

    h.cache_data.clear().await;
    let stored = h.orchestrator.get_chat_history(&session.id, 20, 0).await.unwrap();
    assert_eq!(stored, cached);
    assert!(h.store.read_count() > 0);

    h.settle().await;
    assert_eq!(h.cache_data.message_count().await, 1);
    assert_eq!(h.cache_data.session_count().await, 1);
}

#[tokio::test]
async fn writes_go_through_when_the_queue_is_down() {
    let h = TestHarness::builder()
        .backend(MODEL, "10.0.0.1", 8083)
        .publisher(Arc::new(FailingPublisher))
        .build();

    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;

    assert!(!events.last().unwrap().is_error());
    assert_eq!(h.store_data.session_count().await, 1);
    assert_eq!(h.store_data.message_count().await, 2);
}

#[tokio::test]
async fn queued_writes_skip_the_store_on_the_hot_path() {
    let publisher = Arc::new(RecordingPublisher::new());
    let h = TestHarness::builder()
        .backend(MODEL, "10.0.0.1", 8083)
        .publisher(publisher.clone())
        .build();

    h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;

    assert_eq!(
        publisher.kinds(),
        vec!["save_session", "save_message", "save_message"]
    );
    assert_eq!(h.store.write_count(), 0);
    assert_eq!(h.cache_data.message_count().await, 2);
}

#[tokio::test]
async fn queue_consumer_commits_to_the_store() {
    let (publisher, worker) = InMemoryQueue::channel(Duration::from_millis(10));
    let h = TestHarness::builder()
        .backend(MODEL, "10.0.0.1", 8083)
        .publisher(Arc::new(publisher))
        .build();
    let stop = CancellationToken::new();
    let consumer = tokio::spawn(worker.run(
        Arc::new(PersistenceConsumer::new(h.store_data.clone())),
        stop.clone(),
    ));

    h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;
    stop.cancel();
    consumer.await.unwrap();

    assert_eq!(h.store_data.session_count().await, 1);
    assert_eq!(h.store_data.message_count().await, 2);
}

#[tokio::test]
async fn a_broken_cache_never_blocks_a_turn() {
    let h = one_backend();
    h.cache.fail_all(true);

    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;

    let session_id = events[0].session_id.clone();
    let history = h.orchestrator.get_chat_history(&session_id, 20, 0).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(h.cache_data.message_count().await, 0);
}

#[tokio::test]
async fn a_failed_store_write_rejects_the_turn_before_selection() {
    let h = one_backend();
    h.store.fail_writes(true);

    let err = h.chat("u1", None, "hello", MODEL).await.unwrap_err();

    assert!(matches!(err, ChatError::Internal(_)));
    assert_eq!(h.tracker.acquire_count(), 0);
}

// ============================================================================
// Deletion and ownership
// ============================================================================

#[tokio::test]
async fn deleting_a_session_removes_its_messages_from_both_tiers() {
    let h = one_backend();
    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;
    let session_id = events[0].session_id.clone();

    h.orchestrator.delete_session(&session_id, "u1").await.unwrap();

    let err = h.orchestrator.get_chat_history(&session_id, 20, 0).await.unwrap_err();
    assert!(matches!(err, ChatError::NotFound(_)));
    assert_eq!(h.store_data.message_count().await, 0);
    assert_eq!(h.cache_data.message_count().await, 0);
    assert!(h.orchestrator.get_user_sessions("u1", 20, 0).await.unwrap().is_empty());

    h.orchestrator.delete_session(&session_id, "u1").await.unwrap();
}

#[tokio::test]
async fn only_the_owner_may_delete_a_session() {
    let h = one_backend();
    let session = h.orchestrator.create_session("u1", "").await.unwrap();
    assert_eq!(session.title, "New Chat");

    let err = h.orchestrator.delete_session(&session.id, "u2").await.unwrap_err();

    assert!(matches!(err, ChatError::PermissionDenied(_)));
    assert_eq!(
        h.orchestrator.get_user_sessions("u1", 20, 0).await.unwrap()[0].id,
        session.id
    );
}

#[tokio::test]
async fn deleting_one_message_leaves_the_rest() {
    let h = one_backend();
    let events = h.chat("u1", None, "hello", MODEL).await.unwrap();
    h.settle().await;
    let session_id = events[0].session_id.clone();

    let history = h.orchestrator.get_chat_history(&session_id, 20, 0).await.unwrap();
    let reply = history.iter().find(|m| m.role == Role::Assistant).unwrap();
    h.orchestrator.delete_message(&reply.id).await.unwrap();

    let remaining = h.orchestrator.get_chat_history(&session_id, 20, 0).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].content, "hello");

    h.orchestrator.delete_message(&reply.id).await.unwrap();
}
