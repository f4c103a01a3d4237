//! Quantified invariants over full pipeline runs.

use super::common::*;
use forgeflow::pipeline::{CancelFlag, RunOutcome};
use forgeflow::Settings;

#[tokio::test]
async fn test_event_sequence_strictly_increases() {
    let h = harness().await;
    script_happy_slack(&h.model);
    h.sandbox.push_exit(0, "");

    h.runner
        .run(
            "Send a message 'Hello' to Slack channel #general.",
            Some("wf-seq".into()),
            CancelFlag::new(),
        )
        .await
        .unwrap();

    let events = h.sink.events();
    assert!(events.len() > 10, "expected a full event trail");
    for window in events.windows(2) {
        assert!(
            window[1].seq > window[0].seq,
            "seq went from {} to {}",
            window[0].seq,
            window[1].seq
        );
    }
    assert!(events.iter().all(|e| e.correlation_id == "wf-seq"));
}

#[tokio::test]
async fn test_every_stage_emits_start_and_outcome() {
    let h = harness().await;
    script_happy_slack(&h.model);
    h.sandbox.push_exit(0, "");

    h.runner
        .run("hello", Some("wf-stages".into()), CancelFlag::new())
        .await
        .unwrap();

    let started = h.sink.events_of_type("stage.started");
    let completed = h.sink.events_of_type("stage.completed");
    // Ten stages visited on the happy path, minus the skipped self-debug.
    assert_eq!(started.len(), 9);
    assert_eq!(completed.len(), 9);
    for (s, c) in started.iter().zip(&completed) {
        assert_eq!(s.stage, c.stage);
    }
}

#[tokio::test]
async fn test_produced_dag_is_acyclic_and_reference_sound() {
    let h = harness().await;
    script_happy_slack(&h.model);
    h.sandbox.push_exit(0, "");

    h.runner
        .run("hello", Some("wf-dag".into()), CancelFlag::new())
        .await
        .unwrap();

    let handoff = h.packager.received().pop().unwrap();
    assert!(handoff.dag.validate().is_ok());
    for mapping in h.sink.events_of_type("mapping.complete") {
        assert!(mapping.seq > 0);
    }
}

#[tokio::test]
async fn test_deployed_artifact_has_no_credential_literals() {
    let h = harness().await;
    script_happy_slack(&h.model);
    h.sandbox.push_exit(0, "");

    h.runner
        .run("hello", Some("wf-hygiene".into()), CancelFlag::new())
        .await
        .unwrap();

    let handoff = h.packager.received().pop().unwrap();
    let report = forgeflow::codegen::scan(
        &handoff.artifact.code,
        &forgeflow::codegen::ScanConfig::default(),
    );
    assert!(report.safe, "deployed artifact failed re-scan: {:?}", report.findings);
    // The configured secret value itself never leaks into the artifact.
    assert!(!handoff.artifact.code.contains("test-slack-token"));
}

#[tokio::test]
async fn test_confidence_exactly_at_threshold_proceeds() {
    // θ = 1.0 and a fully-specified record scoring exactly 1.0: the gate
    // is >=, so no clarification even though questions were offered.
    let settings = Settings {
        confidence_threshold: 1.0,
        ..Settings::default()
    };
    let h = harness_with_settings(settings).await;

    h.model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "workflow_name": "Hello Slack",
            "description": "Send Hello to #general",
            "actions": [{
                "id": "step_1",
                "description": "Send the message Hello to the Slack channel #general",
                "service_hint": "Slack",
                "parameters": {"channel": "#general", "text": "Hello"},
                "is_trigger": false
            }],
            "triggers": [{"trigger_type": "manual", "description": "Run once"}],
            "clarification_needed": ["Anything else?"],
            "assumed_defaults": []
        }),
    );
    script_selection(&h.model, 0.92, "direct match");
    script_hello_plan(&h.model);
    script_mappings(&h.model, 1);
    script_codegen(&h.model, HELLO_CODE);
    script_scaffold(&h.model);
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .run("hello", Some("wf-theta".into()), CancelFlag::new())
        .await
        .unwrap();
    assert!(
        matches!(outcome, RunOutcome::Deployed { .. }),
        "equality at θ must proceed, got {outcome:?}"
    );
    assert!(h
        .sink
        .events_of_type("conversation.clarification_needed")
        .is_empty());
}

#[tokio::test]
async fn test_debug_budget_is_respected() {
    let h = harness().await;
    script_hello_extraction(&h.model);
    script_selection(&h.model, 0.92, "direct match");
    script_hello_plan(&h.model);
    script_mappings(&h.model, 1);
    script_codegen(&h.model, HELLO_CODE);
    script_scaffold(&h.model);
    // Script more rounds than the budget allows; the runner must stop at 3.
    for _ in 0..5 {
        script_debug_round(&h.model, "LOGIC_ERROR", "wrong", HELLO_CODE);
        h.sandbox.push_exit(1, "ValueError: bad");
    }

    let outcome = h
        .runner
        .run("hello", Some("wf-cap".into()), CancelFlag::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));

    assert_eq!(h.sink.events_of_type("debug.diagnosed").len(), 3);
    assert_eq!(h.sandbox.executions(), 3);
}

#[tokio::test]
async fn test_discovery_miss_drops_action_and_reports_it() {
    let h = harness().await;
    h.model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "workflow_name": "Mixed",
            "description": "post to slack and telegraph the office",
            "actions": [
                {"id": "a1",
                 "description": "Send the message Hello to the Slack channel #general",
                 "service_hint": "Slack",
                 "parameters": {"channel": "#general"},
                 "is_trigger": false},
                {"id": "a2",
                 "description": "Operate the vintage pneumatic tube dispatcher",
                 "service_hint": "TubeSystem",
                 "parameters": {"capsule": "7"},
                 "is_trigger": false}
            ],
            "triggers": [{"trigger_type": "manual", "description": "Run once"}],
            "clarification_needed": [],
            "assumed_defaults": []
        }),
    );
    script_selection(&h.model, 0.92, "direct match");
    script_hello_plan(&h.model);
    script_mappings(&h.model, 1);
    script_codegen(&h.model, HELLO_CODE);
    script_scaffold(&h.model);
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .run("mixed request", Some("wf-miss".into()), CancelFlag::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Deployed { .. }), "{outcome:?}");

    // The unmatchable action produced a miss event, a partial summary,
    // and an assumed-defaults note; the DAG carries only the Slack step.
    assert_eq!(h.sink.events_of_type("discovery.miss").len(), 1);
    assert_eq!(h.sink.events_of_type("discovery.partial").len(), 1);

    let handoff = h.packager.received().pop().unwrap();
    assert!(handoff.dag.step("post_message").is_some());
    assert_eq!(handoff.dag.steps.len(), 2);
}
