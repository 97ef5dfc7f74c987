// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
/// Integration tests for the public tspark surface using the mock provider.
use std::collections::BTreeMap;

use serde_json::json;
use tempfile::TempDir;
use tspark::{Agent, ChatMessage, Fragment, IncludeMode, SessionOptions};

async fn mock_agent(tmp: &TempDir) -> Agent {
    let agent = Agent::open(tmp.path(), true).await.unwrap();
    agent.install_provider("mock", BTreeMap::new()).unwrap();
    agent
}

#[tokio::test]
async fn full_workspace_round_trip() {
    let tmp = TempDir::new().unwrap();
    let agent = mock_agent(&tmp).await;

    agent.set_system_prompt("You are terse.").unwrap();
    let mut rule = Fragment::new("concise", "Answer in one sentence.");
    rule.include = IncludeMode::Always;
    agent.create_rule(&rule).unwrap();

    let session = agent
        .create_session(
            "chat-1",
            SessionOptions {
                model_provider: Some("mock".into()),
                model_id: Some("mock-model".into()),
                ..SessionOptions::default()
            },
        )
        .await
        .unwrap();

    let update = session.handle_message("hello there").await.unwrap();
    assert_eq!(update.updates.len(), 2);
    assert_eq!(update.rules_in_scope, vec!["concise".to_string()]);

    match update.updates.last().unwrap() {
        ChatMessage::Assistant { reply } => {
            assert_eq!(reply.text(), "MOCK: hello there");
            assert!(reply.pending_tool_calls.is_empty());
        }
        other => panic!("expected assistant reply, got {other:?}"),
    }

    let snapshot = session.get_state().await;
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.last_sync_id, 2);
}

#[tokio::test]
async fn workspace_state_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    {
        let agent = mock_agent(&tmp).await;
        agent.set_setting("maxChatTurns", json!(5)).unwrap();
        agent
            .create_reference(&Fragment::new("api", "prefer the v2 endpoints"))
            .unwrap();
    }

    let agent = Agent::open(tmp.path(), false).await.unwrap();
    assert!(agent.is_provider_installed("mock"));
    assert_eq!(agent.get_setting("maxChatTurns"), Some(json!(5)));
    assert_eq!(agent.get_reference("api").unwrap().text, "prefer the v2 endpoints");
}
