//! End-to-end flow: registry → output aggregation → subscription bridge.
//!
//! These tests run against a stub `q` binary that ignores the `chat`
//! argument and echoes stdin back line by line, so every `send` produces
//! one output line immediately.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use q_console::config::Config;
use q_console::error::InstanceError;
use q_console::instances::InstanceStatus;
use q_console::server::build_state;

fn stub_config(dir: &TempDir, idle: Duration) -> Config {
    let script = dir.path().join("fake-q");
    std::fs::write(&script, "#!/bin/sh\nexec cat\n").unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();

    Config {
        q_command: script.to_string_lossy().into_owned(),
        max_instances: 3,
        response_idle_timeout: idle,
        read_poll_interval: Duration::from_millis(20),
        bridge_poll_interval: Duration::from_millis(40),
        stop_grace_period: Duration::from_secs(2),
        ..Config::default()
    }
}

/// Poll until `cond` holds or the deadline passes.
async fn wait_for<F, Fut>(mut cond: F, deadline: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn complete_reply_reaches_history_and_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(stub_config(&dir, Duration::from_millis(250)));

    state.manager.create("a").await.unwrap();
    let mut replies = state.bridge.subscribe("a");

    // Two lines inside one idle window frame as a single reply.
    state.manager.send("a", "hi").await.unwrap();
    state.manager.send("a", "there").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("no broadcast within deadline")
        .unwrap();
    assert_eq!(event.instance_id, "a");
    assert_eq!(event.raw_content, "hi\nthere");
    assert!(event.is_markdown);
    assert!(event.content.contains("hi"));

    let history = state.history.chat_history(None);
    assert!(
        history.iter().any(|m| m.sender == "instance a"
            && m.message == "hi\nthere"
            && m.instance_id == "a"),
        "history sink did not receive the reply"
    );

    // Stopping the instance makes further sends fail.
    state.manager.stop("a").await.unwrap();
    let snapshots = state.manager.list().await;
    assert_eq!(snapshots[0].status, InstanceStatus::Stopped);
    assert!(matches!(
        state.manager.send("a", "again").await.unwrap_err(),
        InstanceError::NotRunning(_)
    ));
}

#[tokio::test]
async fn qualifying_pause_splits_replies() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(stub_config(&dir, Duration::from_millis(250)));

    state.manager.create("a").await.unwrap();
    let mut replies = state.bridge.subscribe("a");

    state.manager.send("a", "one").await.unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("first reply missing")
        .unwrap();
    assert_eq!(first.raw_content, "one");

    state.manager.send("a", "two").await.unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("second reply missing")
        .unwrap();
    assert_eq!(second.raw_content, "two");
}

#[tokio::test]
async fn pause_under_threshold_stays_one_reply() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(stub_config(&dir, Duration::from_millis(400)));

    state.manager.create("a").await.unwrap();
    let mut replies = state.bridge.subscribe("a");

    state.manager.send("a", "first").await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    state.manager.send("a", "second").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), replies.recv())
        .await
        .expect("reply missing")
        .unwrap();
    assert_eq!(event.raw_content, "first\nsecond");

    // Nothing further was framed.
    let extra = tokio::time::timeout(Duration::from_secs(1), replies.recv()).await;
    assert!(extra.is_err(), "pause under the threshold split the reply");
}

#[tokio::test]
async fn both_subscribers_receive_the_same_reply() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(stub_config(&dir, Duration::from_millis(250)));

    state.manager.create("a").await.unwrap();
    let mut first = state.bridge.subscribe("a");
    let mut second = state.bridge.subscribe("a");
    assert_eq!(state.bridge.subscriber_count("a"), 2);

    state.manager.send("a", "hello").await.unwrap();

    let event_a = tokio::time::timeout(Duration::from_secs(5), first.recv())
        .await
        .expect("first subscriber missed the reply")
        .unwrap();
    let event_b = tokio::time::timeout(Duration::from_secs(5), second.recv())
        .await
        .expect("second subscriber missed the reply")
        .unwrap();
    assert_eq!(event_a.raw_content, "hello");
    assert_eq!(event_b.raw_content, "hello");
}

#[tokio::test]
async fn last_unsubscribe_halts_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let config = stub_config(&dir, Duration::from_millis(250));
    let poll = config.bridge_poll_interval;
    let state = build_state(config);

    state.manager.create("a").await.unwrap();
    let _replies = state.bridge.subscribe("a");
    state.bridge.unsubscribe("a");
    assert!(!state.bridge.is_active("a"));

    // Let the delivery loop observe the empty room and exit.
    tokio::time::sleep(poll * 4).await;

    // A reply enqueued afterwards stays on the queue.
    state.manager.send("a", "ping").await.unwrap();
    let instance = state.manager.get("a").await.unwrap();
    let queued = wait_for(
        || {
            let instance = Arc::clone(&instance);
            async move { instance.output().len().await == 1 }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(queued, "reply never reached the output queue");

    tokio::time::sleep(poll * 4).await;
    assert_eq!(
        instance.output().len().await,
        1,
        "a stopped delivery loop drained the queue"
    );
}
