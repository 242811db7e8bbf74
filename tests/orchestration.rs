//! Orchestration Integration Tests
//!
//! End-to-end runs through the engine: dependency gating, failure
//! policies, for-each fan-out, retries, timeouts and nested pipelines.

mod common;

use common::*;
use pipeflow::domain::{PipelineStatus, StepExecutionStatus};
use pipeflow::ErrorKind;
use serde_json::{json, Map};
use tempfile::TempDir;

#[tokio::test]
async fn test_independent_steps_run_before_their_dependent() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: fan_in
steps:
  - name: a
    type: echo
    input: { n: 1 }
  - name: b
    type: echo
    input: { n: 2 }
  - name: c
    type: echo
    depends_on: [a, b]
    input:
      both: ["${{ step.a.n }}", "${{ step.b.n }}"]
"#],
    );

    let execution = orchestrator.run("fan_in", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Finished);
    assert_eq!(
        root.output,
        Some(json!({ "a": { "n": 1 }, "b": { "n": 2 }, "c": { "both": [1, 2] } }))
    );

    let envelopes = orchestrator.events(execution.id).await.unwrap();

    // a and b are planned together, c only once both are done
    let first_plan = position(&envelopes, "pipeline_planned", |_| true).unwrap();
    let planned: Vec<&str> = envelopes[first_plan].payload["next_steps"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["step_name"].as_str().unwrap())
        .collect();
    assert_eq!(planned, vec!["a", "b"]);

    let a = steps(&execution, "a")[0].id;
    let b = steps(&execution, "b")[0].id;
    let c = steps(&execution, "c")[0].id;
    let c_start = position(&envelopes, "pipeline_step_start", for_step(c)).unwrap();
    assert!(position(&envelopes, "pipeline_step_finished", for_step(a)).unwrap() < c_start);
    assert!(position(&envelopes, "pipeline_step_finished", for_step(b)).unwrap() < c_start);
}

const CHAIN: &str = r#"
name: chain
args:
  greeting: hello
steps:
  - name: a
    type: transform
    input: { value: "${{ args.greeting }}" }
  - name: b
    type: transform
    depends_on: [a]
    input: { value: "${{ step.a.value }} world" }
output:
  message: "${{ step.b.value }}"
"#;

#[tokio::test]
async fn test_chain_passes_outputs_forward() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[CHAIN]);

    let execution = orchestrator.run("chain", Map::new()).await.unwrap();
    assert_eq!(root(&execution).output, Some(json!({ "message": "hello world" })));

    let mut args = Map::new();
    args.insert("greeting".to_string(), json!("hi"));
    let execution = orchestrator.run("chain", args).await.unwrap();
    assert_eq!(root(&execution).output, Some(json!({ "message": "hi world" })));
}

#[tokio::test]
async fn test_ignored_failure_satisfies_dependents() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: tolerant
steps:
  - name: optional
    type: fail
    error: { ignore: true }
  - name: after
    type: echo
    depends_on: [optional]
    input: { ran: true }
"#],
    );

    let execution = orchestrator.run("tolerant", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Finished);
    assert!(root.has_step_failures());

    let optional = steps(&execution, "optional")[0];
    assert_eq!(optional.status, StepExecutionStatus::Failed);
    assert_eq!(optional.error.as_ref().unwrap().kind, ErrorKind::PrimitiveFailure);
    assert_eq!(steps(&execution, "after")[0].status, StepExecutionStatus::Finished);
    assert_eq!(
        root.output,
        Some(json!({ "optional": null, "after": { "ran": true } }))
    );
}

#[tokio::test]
async fn test_step_failure_fails_pipeline() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: strict
steps:
  - name: a
    type: fail
    input: { reason: disk full }
  - name: b
    type: echo
    depends_on: [a]
"#],
    );

    let execution = orchestrator.run("strict", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Failed);

    let error = root.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::PrimitiveFailure);
    assert_eq!(error.message, "Step 'a' failed: disk full");

    settle().await;
    let execution = orchestrator.status(execution.id).await.unwrap();
    assert!(steps(&execution, "b").is_empty());
}

#[tokio::test]
async fn test_pipeline_without_steps_finishes() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &["name: empty\nsteps: []\n"]);

    let execution = orchestrator.run("empty", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Finished);
    assert_eq!(root.output, Some(json!({})));
    assert!(execution.step_executions.is_empty());
}

#[tokio::test]
async fn test_for_each_output_keeps_element_order() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: fan_out
steps:
  - name: double
    type: transform
    for_each: [3, 1, 4, 1]
    input: { value: "${{ each.value }}" }
"#],
    );

    let execution = orchestrator.run("fan_out", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Finished);

    let executions = steps(&execution, "double");
    assert_eq!(executions.len(), 4);
    for (i, se) in executions.iter().enumerate() {
        let each = se.for_each.as_ref().unwrap();
        assert_eq!(each.index, i);
        assert_eq!(each.total_count, 4);
    }

    assert_eq!(
        root(&execution).output,
        Some(json!({ "double": [{ "value": 3 }, { "value": 1 }, { "value": 4 }, { "value": 1 }] }))
    );
}

#[tokio::test]
async fn test_for_each_over_step_output_feeds_dependents() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: inventory
steps:
  - name: list
    type: echo
    input: { hosts: [web, db, cache] }
  - name: ping
    type: echo
    depends_on: [list]
    for_each: "${{ step.list.hosts }}"
    input: { host: "${{ each.value }}", of: "${{ total_count }}" }
  - name: summary
    type: echo
    depends_on: [ping]
    input: { results: "${{ step.ping }}" }
"#],
    );

    let execution = orchestrator.run("inventory", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Finished);
    assert_eq!(
        steps(&execution, "summary")[0].output,
        Some(json!({
            "results": [
                { "host": "web", "of": 3 },
                { "host": "db", "of": 3 },
                { "host": "cache", "of": 3 }
            ]
        }))
    );
}

#[tokio::test]
async fn test_empty_for_each_completes_step() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: nothing_to_do
steps:
  - name: each
    type: echo
    for_each: []
  - name: after
    type: echo
    depends_on: [each]
    input: { count: "${{ step.each }}" }
"#],
    );

    let execution = orchestrator.run("nothing_to_do", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Finished);
    assert!(steps(&execution, "each").is_empty());
    assert_eq!(steps(&execution, "after")[0].output, Some(json!({ "count": [] })));
}

#[tokio::test]
async fn test_for_each_over_map_runs_in_key_order() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: regions
steps:
  - name: deploy
    type: echo
    for_each: { us: 2, eu: 1 }
    input: { region: "${{ each.key }}", replicas: "${{ each.value }}" }
"#],
    );

    let execution = orchestrator.run("regions", Map::new()).await.unwrap();
    assert_eq!(
        root(&execution).output,
        Some(json!({
            "deploy": [
                { "region": "eu", "replicas": 1 },
                { "region": "us", "replicas": 2 }
            ]
        }))
    );
}

#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator_with(
        &temp,
        &[r#"
name: retried
steps:
  - name: flaky
    type: flaky
    error: { retries: 2, initial_delay_ms: 1 }
"#],
        registry(2),
    );

    let execution = orchestrator.run("retried", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Finished);

    let se = steps(&execution, "flaky")[0];
    assert_eq!(se.status, StepExecutionStatus::Finished);
    assert_eq!(se.attempt, 3);
    assert_eq!(se.retries_remaining, 0);
    assert_eq!(se.output, Some(json!({ "attempt": 3 })));

    // Intermediate attempts are not recorded as failures
    let envelopes = orchestrator.events(execution.id).await.unwrap();
    assert_eq!(count(&envelopes, "pipeline_step_start"), 3);
    assert_eq!(count(&envelopes, "pipeline_step_failed"), 0);
    assert_eq!(count(&envelopes, "pipeline_step_finished"), 1);
}

#[tokio::test]
async fn test_retry_budget_exhausted_fails_step() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator_with(
        &temp,
        &[r#"
name: hopeless
steps:
  - name: flaky
    type: flaky
    error: { retries: 1, initial_delay_ms: 1 }
"#],
        registry(5),
    );

    let execution = orchestrator.run("hopeless", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Failed);

    let se = steps(&execution, "flaky")[0];
    assert_eq!(se.status, StepExecutionStatus::Failed);
    assert_eq!(se.attempt, 2);
    assert_eq!(se.error.as_ref().unwrap().message, "attempt 2 failed");
}

#[tokio::test]
async fn test_invalid_input_is_not_retried() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: malformed
steps:
  - name: shape
    type: transform
    input: { other: 1 }
    error: { retries: 3, initial_delay_ms: 1 }
"#],
    );

    let execution = orchestrator.run("malformed", Map::new()).await.unwrap();
    let se = steps(&execution, "shape")[0];
    assert_eq!(se.attempt, 1);
    assert_eq!(se.error.as_ref().unwrap().kind, ErrorKind::BadRequest);
    assert_eq!(root(&execution).status, PipelineStatus::Failed);
}

#[tokio::test]
async fn test_step_timeout_fails_step() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: slow
steps:
  - name: wait
    type: sleep
    input: { duration: 30s }
    timeout_seconds: 1
"#],
    );

    let execution = orchestrator.run("slow", Map::new()).await.unwrap();
    let se = steps(&execution, "wait")[0];
    assert_eq!(se.status, StepExecutionStatus::Failed);
    assert_eq!(
        se.error.as_ref().unwrap().message,
        "Step 'wait' timed out after 1s"
    );
}

#[tokio::test]
async fn test_cycle_rejected_at_load() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: loop
steps:
  - name: a
    type: echo
    depends_on: [b]
  - name: b
    type: echo
    depends_on: [a]
"#],
    );

    let execution = orchestrator.run("loop", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Failed);

    let error = root.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::BadRequest);
    assert!(error.message.contains("Cycle detected"));
    assert!(execution.step_executions.is_empty());
}

#[tokio::test]
async fn test_unknown_pipeline_fails_with_not_found() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[]);

    let execution = orchestrator.run("missing", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Failed);
    assert_eq!(root.error.as_ref().unwrap().kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_unknown_step_type_rejected_at_load() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &["name: typo\nsteps:\n  - name: a\n    type: ecko\n"],
    );

    let execution = orchestrator.run("typo", Map::new()).await.unwrap();
    let error = root(&execution).error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::BadRequest);
    assert!(error.message.contains("unknown type 'ecko'"));
}

const PARENT: &str = r#"
name: release
steps:
  - name: prepare
    type: echo
    input: { region: eu }
  - name: deploy
    type: pipeline
    depends_on: [prepare]
    input:
      pipeline: rollout
      args: { region: "${{ step.prepare.region }}" }
  - name: report
    type: transform
    depends_on: [deploy]
    input: { value: "${{ step.deploy.target }}" }
"#;

const CHILD: &str = r#"
name: rollout
steps:
  - name: build
    type: transform
    input: { value: "${{ args.region }}" }
output:
  target: "${{ step.build.value }}"
"#;

#[tokio::test]
async fn test_nested_pipeline_output_flows_to_parent() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(&temp, &[PARENT, CHILD]);

    let execution = orchestrator.run("release", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Finished);
    assert_eq!(execution.pipeline_executions.len(), 2);

    let deploy = steps(&execution, "deploy")[0];
    let child_id = deploy.child_pipeline_execution_id.unwrap();
    let child = execution.pipeline_execution(child_id).unwrap();
    assert_eq!(child.name, "rollout");
    assert_eq!(child.status, PipelineStatus::Finished);
    assert_eq!(child.parent_step_execution_id, Some(deploy.id));
    assert_eq!(child.args["region"], json!("eu"));

    assert_eq!(deploy.output, Some(json!({ "target": "eu" })));
    assert_eq!(steps(&execution, "report")[0].output, Some(json!({ "value": "eu" })));

    // The parent plans again only after the child has finished
    let envelopes = orchestrator.events(execution.id).await.unwrap();
    let child_finished = position(&envelopes, "pipeline_finished", |p| {
        p["pipeline_execution_id"] == json!(child_id)
    })
    .unwrap();
    let parent_id = json!(root.id);
    assert!(envelopes[child_finished..].iter().any(|e| {
        e.event_type == "pipeline_plan" && e.payload["pipeline_execution_id"] == parent_id
    }));
}

#[tokio::test]
async fn test_failed_child_fails_parent_step() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[
            r#"
name: outer
steps:
  - name: inner
    type: pipeline
    input: { pipeline: broken }
"#,
            "name: broken\nsteps:\n  - name: x\n    type: fail\n",
        ],
    );

    let execution = orchestrator.run("outer", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Failed);

    let inner = steps(&execution, "inner")[0];
    assert_eq!(inner.status, StepExecutionStatus::Failed);
    assert_eq!(
        inner.error.as_ref().unwrap().message,
        "Child pipeline 'broken' failed: Step 'x' failed: boom"
    );
}

#[tokio::test]
async fn test_pipeline_step_without_name_fails_step() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &["name: nameless\nsteps:\n  - name: inner\n    type: pipeline\n    input: { args: {} }\n"],
    );

    let execution = orchestrator.run("nameless", Map::new()).await.unwrap();
    let inner = steps(&execution, "inner")[0];
    assert_eq!(inner.status, StepExecutionStatus::Failed);
    assert_eq!(inner.error.as_ref().unwrap().kind, ErrorKind::BadRequest);
    assert_eq!(execution.pipeline_executions.len(), 1);
}

#[tokio::test]
async fn test_panicking_primitive_fails_pipeline() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: fragile
steps:
  - name: explode
    type: panic
"#],
    );

    let execution = orchestrator.run("fragile", Map::new()).await.unwrap();
    let root = root(&execution);
    assert_eq!(root.status, PipelineStatus::Failed);

    let error = root.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::Internal);
    assert!(error.message.contains("primitive blew up"), "{}", error.message);
}

#[tokio::test]
async fn test_oversized_sleep_fails_step() {
    let temp = TempDir::new().unwrap();
    let orchestrator = orchestrator(
        &temp,
        &[r#"
name: forever
steps:
  - name: wait
    type: sleep
    input: { duration: 9999999999999999999h }
"#],
    );

    let execution = orchestrator.run("forever", Map::new()).await.unwrap();
    assert_eq!(root(&execution).status, PipelineStatus::Failed);

    let se = steps(&execution, "wait")[0];
    assert_eq!(se.status, StepExecutionStatus::Failed);
    let error = se.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::BadRequest);
    assert!(error.message.contains("too large"), "{}", error.message);
}
