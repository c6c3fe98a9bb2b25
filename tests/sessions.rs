//! Alias-equivalence property: after `set_session_alias(base, t)`,
//! operations addressed to `base` and to `t` are indistinguishable in
//! effect.

mod common;

use std::collections::HashMap;

use common::{ScriptedBackend, engine, inbound, quiet_settings};
use pocketpaw::prelude::*;

#[tokio::test]
async fn turns_on_base_land_in_alias_target() {
    let (_backend, factory) = ScriptedBackend::factory(vec![
        AgentEvent::Message { content: "reply".into() },
        AgentEvent::Done,
    ]);
    let e = engine(quiet_settings(), factory).await;

    e.memory
        .set_session_alias("websocket:c1", "websocket:c1:aaaa1111")
        .await
        .unwrap();

    e.agent_loop
        .process_message(inbound(Channel::Websocket, "c1", "through the alias"))
        .await;

    let target_log = e
        .memory
        .get_session_history("websocket:c1:aaaa1111", 10)
        .await
        .unwrap();
    assert_eq!(target_log.len(), 2);
    assert_eq!(target_log[0].content, "through the alias");
    assert!(
        e.memory
            .get_session_history("websocket:c1", 10)
            .await
            .unwrap()
            .is_empty(),
        "nothing accumulates under the base key"
    );
}

#[tokio::test]
async fn clear_via_base_clears_the_target() {
    let (_backend, factory) = ScriptedBackend::factory(vec![
        AgentEvent::Message { content: "reply".into() },
        AgentEvent::Done,
    ]);
    let e = engine(quiet_settings(), factory).await;

    e.memory
        .set_session_alias("telegram:9", "telegram:9:feedc0de")
        .await
        .unwrap();
    e.agent_loop
        .process_message(inbound(Channel::Telegram, "9", "content"))
        .await;

    // /clear addressed to the base key.
    e.agent_loop
        .process_message(inbound(Channel::Telegram, "9", "/clear"))
        .await;

    assert!(
        e.memory
            .get_session_history("telegram:9:feedc0de", 10)
            .await
            .unwrap()
            .is_empty()
    );
    let cleared_reply = e
        .probe
        .messages()
        .await
        .into_iter()
        .find(|m| m.content.contains("Cleared"))
        .expect("clear reply");
    assert!(cleared_reply.content.contains("2 messages"));
}

#[tokio::test]
async fn direct_store_writes_to_target_are_visible_via_base_listing() {
    let (_backend, factory) = ScriptedBackend::factory(vec![AgentEvent::Done]);
    let e = engine(quiet_settings(), factory).await;

    e.memory
        .set_session_alias("slack:chan", "slack:chan:12345678")
        .await
        .unwrap();
    e.memory
        .add_to_session(
            "slack:chan:12345678",
            Role::User,
            "written directly to the target",
            HashMap::new(),
        )
        .await
        .unwrap();

    let sessions = e.memory.list_sessions_for_chat("slack:chan").await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].is_active);
    assert_eq!(sessions[0].session_key, "slack:chan:12345678");
    assert_eq!(sessions[0].message_count, 1);
}

#[tokio::test]
async fn rename_via_base_renames_the_target() {
    let (_backend, factory) = ScriptedBackend::factory(vec![
        AgentEvent::Message { content: "reply".into() },
        AgentEvent::Done,
    ]);
    let e = engine(quiet_settings(), factory).await;

    e.memory
        .set_session_alias("telegram:7", "telegram:7:cafebabe")
        .await
        .unwrap();
    e.agent_loop
        .process_message(inbound(Channel::Telegram, "7", "seed message"))
        .await;
    e.agent_loop
        .process_message(inbound(Channel::Telegram, "7", "/rename Big Plans"))
        .await;

    let sessions = e.memory.list_sessions_for_chat("telegram:7").await.unwrap();
    assert_eq!(sessions[0].title, "Big Plans");
    assert_eq!(sessions[0].session_key, "telegram:7:cafebabe");
}
