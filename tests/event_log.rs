//! Event Log Integration Tests
//!
//! The log is the source of truth: its line format, ordering guarantees and
//! replay behavior.

mod common;

use chrono::Utc;
use common::*;
use pipeflow::core::EventStore;
use pipeflow::domain::{Envelope, EventType, Execution, Message, PipelineStatus};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

const PIPELINE: &str = r#"
name: logged
steps:
  - name: a
    type: echo
    input: { n: 1 }
  - name: fan
    type: transform
    depends_on: [a]
    for_each: [x, y]
    input: { value: "${{ each.value }}-${{ step.a.n }}" }
"#;

#[tokio::test]
async fn test_log_lines_are_complete_envelopes() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[PIPELINE]);
    let execution = orchestrator.run("logged", Map::new()).await.unwrap();

    let path = EventStore::at(temp.path(), execution.id).events_path().to_path_buf();
    let content = std::fs::read_to_string(path).unwrap();

    let mut lines = 0;
    for line in content.lines() {
        let value: Value = serde_json::from_str(line).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 3, "unexpected envelope fields: {}", line);
        assert!(object["event_type"].as_str().unwrap().parse::<EventType>().is_ok());
        assert!(object["timestamp"].as_str().unwrap().contains('T'));
        assert_eq!(object["payload"]["execution_id"], json!(execution.id));
        lines += 1;
    }
    assert!(lines > 10);
}

#[tokio::test]
async fn test_replay_is_deterministic() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[PIPELINE]);
    let finished = orchestrator.run("logged", Map::new()).await.unwrap();
    settle().await;

    let envelopes = orchestrator.events(finished.id).await.unwrap();
    let first = Execution::from_envelopes(finished.id, &envelopes).unwrap();
    let second = Execution::from_envelopes(finished.id, &envelopes).unwrap();
    assert_eq!(first, second);
    assert_eq!(first, orchestrator.status(finished.id).await.unwrap());

    assert_eq!(
        root(&first).output,
        Some(json!({ "a": { "n": 1 }, "fan": [{ "value": "x-1" }, { "value": "y-1" }] }))
    );
}

#[tokio::test]
async fn test_every_event_follows_its_command() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[PIPELINE]);
    let execution = orchestrator.run("logged", Map::new()).await.unwrap();
    let envelopes = orchestrator.events(execution.id).await.unwrap();

    assert_eq!(envelopes[0].event_type, "pipeline_queue");
    assert_eq!(envelopes[1].event_type, "pipeline_queued");

    for se in execution.step_executions.values() {
        let start = position(&envelopes, "pipeline_step_start", for_step(se.id)).unwrap();
        let started = position(&envelopes, "pipeline_step_started", for_step(se.id)).unwrap();
        let finish = position(&envelopes, "pipeline_step_finish", for_step(se.id)).unwrap();
        let finished = position(&envelopes, "pipeline_step_finished", for_step(se.id)).unwrap();
        assert!(start < started && started < finish && finish < finished);

        assert!(se
            .idempotency_key
            .starts_with(&format!("{}:{}:", execution.id, se.name)));
    }

    let finish = position(&envelopes, "pipeline_finish", |_| true).unwrap();
    let finished = position(&envelopes, "pipeline_finished", |_| true).unwrap();
    assert!(finish < finished);
    assert_eq!(count(&envelopes, "pipeline_finished"), 1);
}

#[tokio::test]
async fn test_unknown_event_types_are_skipped() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[PIPELINE]);
    let execution = orchestrator.run("logged", Map::new()).await.unwrap();
    settle().await;
    let before = orchestrator.status(execution.id).await.unwrap();

    let store = EventStore::at(temp.path(), execution.id);
    store
        .append(&Envelope {
            event_type: "pipeline_audited".to_string(),
            timestamp: Utc::now(),
            payload: json!({ "execution_id": execution.id, "auditor": "ops" }),
        })
        .await
        .unwrap();

    let after = orchestrator.status(execution.id).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(root(&after).status, PipelineStatus::Finished);
}

#[tokio::test]
async fn test_subscribers_see_messages_in_log_order() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &["name: empty\nsteps: []\n"]);
    let mut notifications = orchestrator.subscribe();

    let execution = orchestrator.run("empty", Map::new()).await.unwrap();
    settle().await;

    let mut seen = Vec::new();
    while let Ok(message) = notifications.try_recv() {
        if message.execution_id() == execution.id {
            seen.push(message.event_type().as_str().to_string());
        }
    }
    let logged: Vec<String> = orchestrator
        .events(execution.id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(seen, logged);
    assert!(matches!(
        Message::from_envelope(&orchestrator.events(execution.id).await.unwrap()[0]),
        Ok(Some(Message::PipelineQueue(_)))
    ));
}

#[tokio::test]
async fn test_list_returns_newest_first() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &["name: empty\nsteps: []\n"]);

    let first = orchestrator.run("empty", Map::new()).await.unwrap();
    let second = orchestrator.run("empty", Map::new()).await.unwrap();

    let ids: Vec<_> = orchestrator.list().await.unwrap().iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);
}
