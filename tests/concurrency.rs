//! Concurrency invariants: per-session serialization, cross-session
//! parallelism, and the global conversation cap.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{ScriptedBackend, engine, inbound, quiet_settings};
use pocketpaw::prelude::*;

fn slow_script() -> Vec<AgentEvent> {
    vec![
        AgentEvent::Message { content: "ok".into() },
        AgentEvent::Done,
    ]
}

// ─── Same session serializes ─────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_session_messages_serialize() {
    let (backend, factory) =
        ScriptedBackend::factory_with_delay(slow_script(), Duration::from_millis(50));
    let e = engine(quiet_settings(), factory).await;

    let l1 = e.agent_loop.clone();
    let l2 = e.agent_loop.clone();
    let t1 = tokio::spawn(async move {
        l1.process_message(inbound(Channel::Slack, "C", "first")).await;
    });
    let t2 = tokio::spawn(async move {
        l2.process_message(inbound(Channel::Slack, "C", "second")).await;
    });
    t1.await.unwrap();
    t2.await.unwrap();

    assert_eq!(
        backend.max_active.load(Ordering::SeqCst),
        1,
        "second run must not start before the first finishes"
    );

    // The session log is a clean linearization: user/assistant pairs.
    let log = e.memory.get_session_history("slack:C", 10).await.unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log[0].role, Role::User);
    assert_eq!(log[1].role, Role::Assistant);
    assert_eq!(log[2].role, Role::User);
    assert_eq!(log[3].role, Role::Assistant);
}

// ─── Different sessions overlap ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn different_sessions_run_in_parallel() {
    let (backend, factory) =
        ScriptedBackend::factory_with_delay(slow_script(), Duration::from_millis(100));
    let e = engine(quiet_settings(), factory).await;

    let l1 = e.agent_loop.clone();
    let l2 = e.agent_loop.clone();
    let t1 = tokio::spawn(async move {
        l1.process_message(inbound(Channel::Discord, "A", "to A")).await;
    });
    let t2 = tokio::spawn(async move {
        l2.process_message(inbound(Channel::Discord, "B", "to B")).await;
    });
    t1.await.unwrap();
    t2.await.unwrap();

    assert_eq!(
        backend.max_active.load(Ordering::SeqCst),
        2,
        "independent sessions should overlap in time"
    );
}

// ─── Global cap bounds total concurrency ─────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cap_of_one_serializes_even_across_sessions() {
    let (backend, factory) =
        ScriptedBackend::factory_with_delay(slow_script(), Duration::from_millis(50));
    let settings = Settings {
        max_concurrent_conversations: 1,
        ..quiet_settings()
    };
    let e = engine(settings, factory).await;

    let mut handles = Vec::new();
    for chat in ["A", "B", "C"] {
        let loop_ = e.agent_loop.clone();
        let msg = inbound(Channel::Discord, chat, "hello");
        handles.push(tokio::spawn(async move { loop_.process_message(msg).await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(
        backend.max_active.load(Ordering::SeqCst),
        1,
        "cap=1 means one conversation at a time"
    );
    assert_eq!(e.probe.stream_ends().await, 3, "all three turns completed");
}

// ─── Aliased keys share a mutex ──────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn aliased_sessions_serialize_on_the_target() {
    let (backend, factory) =
        ScriptedBackend::factory_with_delay(slow_script(), Duration::from_millis(50));
    let e = engine(quiet_settings(), factory).await;

    // Two different base keys aliased to one target session.
    e.memory
        .set_session_alias("slack:one", "slack:shared")
        .await
        .unwrap();
    e.memory
        .set_session_alias("slack:two", "slack:shared")
        .await
        .unwrap();

    let l1 = e.agent_loop.clone();
    let l2 = e.agent_loop.clone();
    let t1 = tokio::spawn(async move {
        l1.process_message(inbound(Channel::Slack, "one", "from one")).await;
    });
    let t2 = tokio::spawn(async move {
        l2.process_message(inbound(Channel::Slack, "two", "from two")).await;
    });
    t1.await.unwrap();
    t2.await.unwrap();

    assert_eq!(
        backend.max_active.load(Ordering::SeqCst),
        1,
        "alias resolution happens before locking"
    );
    let log = e.memory.get_session_history("slack:shared", 10).await.unwrap();
    assert_eq!(log.len(), 4, "both turns landed in the shared target log");
}

// ─── Bus-driven burst keeps the invariants ───────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn burst_through_the_bus_yields_one_stream_end_each() {
    let (_backend, factory) =
        ScriptedBackend::factory_with_delay(slow_script(), Duration::from_millis(10));
    let e = engine(quiet_settings(), factory).await;

    let runner = tokio::spawn(e.agent_loop.clone().run());
    for i in 0..8 {
        e.bus
            .publish_inbound(inbound(Channel::Websocket, &format!("chat-{i}"), "ping"))
            .await
            .unwrap();
    }
    e.probe.wait_for_stream_ends(8).await;
    assert_eq!(e.probe.stream_ends().await, 8);

    e.agent_loop.shutdown().await;
    runner.abort();
}
