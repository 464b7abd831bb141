//! End-to-end exchanges between relay instances sharing an in-memory store

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use taskrelay::storage::{MemoryStore, PubSubBackend};
use taskrelay::{BoxedError, RelayOptions, SendError, TaskHandler, TaskPayload, TaskRelay};

fn options(topic: &str) -> RelayOptions {
    let mut options = RelayOptions::new(topic);
    options.timeout = Duration::from_millis(800);
    options
}

/// Echoes the task back, marking it as handled
struct MarkHandled;

#[async_trait]
impl TaskHandler for MarkHandled {
    async fn handle(&self, task: TaskPayload) -> Result<TaskPayload, BoxedError> {
        match task {
            TaskPayload::Structured(mut value) => {
                value["handled"] = json!(true);
                Ok(value.into())
            }
            TaskPayload::Text(text) => Ok(format!("{}:handled", text).into()),
        }
    }
}

/// Fails every task with the same application error
struct Failing;

#[async_trait]
impl TaskHandler for Failing {
    async fn handle(&self, _task: TaskPayload) -> Result<TaskPayload, BoxedError> {
        Err("processing blew up".into())
    }
}

/// Echoes tasks while counting its invocations
struct Counting {
    invocations: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for Counting {
    async fn handle(&self, task: TaskPayload) -> Result<TaskPayload, BoxedError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(task)
    }
}

#[tokio::test]
async fn structured_payloads_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let receiver = TaskRelay::new(store.clone(), options("jobs"));
    receiver.setup_receiver(MarkHandled).await.unwrap();

    let sender = TaskRelay::new(store, options("jobs"));
    let result = sender
        .send(TaskPayload::from(json!({ "some": "data", "count": 3 })))
        .await
        .unwrap();

    assert_eq!(
        result,
        TaskPayload::from(json!({ "some": "data", "count": 3, "handled": true }))
    );
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn text_payloads_round_trip() {
    let store = Arc::new(MemoryStore::new());
    let receiver = TaskRelay::new(store.clone(), options("jobs"));
    receiver.setup_receiver(MarkHandled).await.unwrap();

    let sender = TaskRelay::new(store, options("jobs"));
    let result = sender.send("some work").await.unwrap();

    assert_eq!(result, TaskPayload::from("some work:handled"));
}

#[tokio::test]
async fn application_errors_reach_the_sender() {
    let store = Arc::new(MemoryStore::new());
    let receiver = TaskRelay::new(store.clone(), options("jobs"));
    receiver.setup_receiver(Failing).await.unwrap();

    let sender = TaskRelay::new(store, options("jobs"));

    match sender.send("doomed").await {
        Err(SendError::Remote(message)) => assert_eq!(message, "processing blew up"),
        other => panic!("expected a remote error, got {:?}", other),
    }
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_tasks_time_out_within_bounds() {
    let store = Arc::new(MemoryStore::new());
    let sender = TaskRelay::new(store, options("void"));

    let before = tokio::time::Instant::now();
    let result = sender.send("anyone?").await;
    let elapsed = before.elapsed();

    assert!(matches!(result, Err(SendError::Timeout(_))));
    assert!(elapsed >= Duration::from_millis(800));
    assert!(elapsed < Duration::from_millis(900));
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test]
async fn a_broadcast_task_is_processed_by_exactly_one_receiver() {
    let store = Arc::new(MemoryStore::new());
    let invocations = Arc::new(AtomicUsize::new(0));

    let receivers: Vec<_> = (0..3)
        .map(|_| TaskRelay::new(store.clone(), options("contended")))
        .collect();
    for receiver in &receivers {
        receiver
            .setup_receiver(Counting {
                invocations: invocations.clone(),
            })
            .await
            .unwrap();
    }

    let sender = TaskRelay::new(store, options("contended"));
    sender.send("task").await.unwrap();

    // Give the losing receivers time to observe and abandon the task
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stray_responses_are_dropped_silently() {
    let store = Arc::new(MemoryStore::new());
    let receiver = TaskRelay::new(store.clone(), options("jobs"));
    receiver.setup_receiver(MarkHandled).await.unwrap();

    let sender = TaskRelay::new(store.clone(), options("jobs"));
    sender.send("warm up").await.unwrap();

    // A response nobody waits for, plus structurally broken messages
    store
        .publish("inc:jobs", r#"{"i":"unknown-id","p":"x","o":false}"#)
        .await
        .unwrap();
    store.publish("inc:jobs", "not json").await.unwrap();
    store.publish("inc:jobs", r#"{"i":"1"}"#).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    // The relay stays fully operational and its table stays clean
    let result = sender.send("again").await.unwrap();
    assert_eq!(result, TaskPayload::from("again:handled"));
    assert_eq!(sender.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn a_paused_receiver_leaves_tasks_to_time_out() {
    let store = Arc::new(MemoryStore::new());
    let receiver = TaskRelay::new(store.clone(), options("jobs"));
    receiver.setup_receiver(MarkHandled).await.unwrap();
    receiver.pause();

    let sender = TaskRelay::new(store, options("jobs"));
    assert!(matches!(
        sender.send("ignored").await,
        Err(SendError::Timeout(_))
    ));

    receiver.resume();
    let result = sender.send("seen").await.unwrap();
    assert_eq!(result, TaskPayload::from("seen:handled"));
}

#[tokio::test(start_paused = true)]
async fn the_breaker_opens_after_a_burst_of_timeouts_and_recovers() {
    let store = Arc::new(MemoryStore::new());
    let mut options = RelayOptions::new("void");
    options.timeout = Duration::from_millis(800);
    options.circuit_check_interval = Duration::from_millis(2000);
    options.timeout_threshold = 5;
    let sender = Arc::new(TaskRelay::new(store.clone(), options));

    // 8 unanswered tasks, all timing out within the first sampling window
    let sends = (0..8).map(|_| {
        let sender = sender.clone();
        tokio::spawn(async move { sender.send("anyone?").await })
    });
    for outcome in futures::future::join_all(sends).await {
        assert!(matches!(outcome.unwrap(), Err(SendError::Timeout(_))));
    }

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(sender.is_circuit_open());

    // Rejection happens before any network interaction
    let published_before = store.published_count();
    assert!(matches!(
        sender.send("rejected").await,
        Err(SendError::CircuitOpen)
    ));
    assert_eq!(store.published_count(), published_before);

    // One calm window closes the circuit again
    tokio::time::sleep(Duration::from_millis(2000)).await;
    assert!(!sender.is_circuit_open());
}

#[tokio::test]
async fn lockability_flags_are_shared_between_instances() {
    let store = Arc::new(MemoryStore::new());
    let first = TaskRelay::new(store.clone(), options("jobs"));
    let second = TaskRelay::new(store, options("jobs"));

    first.lock().set_lockable("42").await.unwrap();
    assert!(second.lock().is_lockable("42").await);
}
