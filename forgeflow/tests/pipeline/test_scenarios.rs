//! End-to-end pipeline scenarios against scripted mocks.

use super::common::*;
use forgeflow::models::ErrorCategory;
use forgeflow::pipeline::{CancelFlag, RunOutcome};
use forgeflow_sdk::RunPhase;

const HELLO_REQUEST: &str = "Send a message 'Hello' to Slack channel #general.";

#[tokio::test]
async fn test_happy_slack_post() {
    let h = harness().await;
    script_happy_slack(&h.model);
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .run(HELLO_REQUEST, Some("wf-happy".into()), CancelFlag::new())
        .await
        .unwrap();

    match outcome {
        RunOutcome::Deployed { final_message, .. } => {
            assert!(final_message.contains("deployed"), "{final_message}");
        }
        other => panic!("expected deployment, got {other:?}"),
    }

    // One handoff with the two-step DAG and the bound Slack endpoint.
    let handoffs = h.packager.received();
    assert_eq!(handoffs.len(), 1);
    let dag = &handoffs[0].dag;
    assert_eq!(dag.steps.len(), 2);
    let post = dag.step("post_message").unwrap();
    assert_eq!(
        post.endpoint.as_ref().unwrap().endpoint,
        "/chat.postMessage"
    );
    assert!(handoffs[0].report.debug_history.is_empty());
    assert!(dag.environment_vars.contains(&"SLACK_BOT_TOKEN".to_string()));

    // Exactly one sandbox execution, with only the declared env vars.
    assert_eq!(h.sandbox.executions(), 1);
    let env = &h.sandbox.observed_env()[0];
    assert_eq!(env.len(), 1);
    assert_eq!(env.get("SLACK_BOT_TOKEN").unwrap(), "test-slack-token");

    // Discovery surfaced the endpoint, execution succeeded, deploy event fired.
    assert_eq!(h.sink.events_of_type("api.discovered").len(), 1);
    assert_eq!(h.sink.events_of_type("execution.success").len(), 1);
    assert_eq!(h.sink.events_of_type("workflow.deployed").len(), 1);
    assert!(h.sink.events_of_type("debug.diagnosed").is_empty());
}

#[tokio::test]
async fn test_parallelizable_onboarding() {
    let h = harness().await;

    h.model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "intent": "onboarding",
            "workflow_name": "New hire onboarding",
            "description": "On new hire, send welcome email and create a Slack account",
            "actions": [
                {
                    "id": "a1",
                    "description": "Send a welcome email over SMTP to the new hire recipient",
                    "service_hint": "Gmail",
                    "parameters": {"to": "jane@acme.com", "subject": "Welcome"},
                    "is_trigger": false
                },
                {
                    "id": "a2",
                    "description": "Invite the new hire user to the onboarding Slack channel",
                    "service_hint": "Slack",
                    "parameters": {"channel": "#onboarding"},
                    "is_trigger": false
                }
            ],
            "triggers": [{"trigger_type": "event", "description": "new hire record created",
                          "payload": {"email": "new hire email", "name": "full name"}}],
            "clarification_needed": [],
            "assumed_defaults": []
        }),
    );
    script_selection(&h.model, 0.9, "SMTP send matches the welcome email");
    script_selection(&h.model, 0.85, "conversations.invite adds the user");
    h.model.push_json_for(
        "workflow planner",
        serde_json::json!({
            "name": "New hire onboarding",
            "description": "welcome email and slack invite in parallel",
            "trigger": {"trigger_type": "event", "description": "new hire",
                        "payload": {"email": "new hire email", "name": "full name"}},
            "steps": [
                {"id": "trigger", "name": "New hire", "step_type": "trigger"},
                {
                    "id": "send_email", "name": "Send welcome email", "step_type": "api_call",
                    "api_index": 0, "depends_on": ["trigger"],
                    "outputs": {"ok": "send status"}
                },
                {
                    "id": "create_slack", "name": "Invite to Slack", "step_type": "api_call",
                    "api_index": 1, "depends_on": ["trigger"],
                    "outputs": {"ok": "invite status"}
                }
            ],
            "environment_vars": ["GMAIL_ADDRESS", "GMAIL_APP_PASSWORD", "SLACK_BOT_TOKEN"]
        }),
    );
    script_mappings(&h.model, 2);
    script_codegen(&h.model, ONBOARDING_CODE);
    script_scaffold(&h.model);
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .run(
            "On new hire, send welcome email and create a Slack account",
            Some("wf-onboarding".into()),
            CancelFlag::new(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Deployed { .. }), "{outcome:?}");

    let handoffs = h.packager.received();
    let dag = &handoffs[0].dag;

    // Both actions hang off the trigger at the same depth.
    assert_eq!(dag.depth("send_email"), Some(1));
    assert_eq!(dag.depth("create_slack"), Some(1));

    let groups = dag.parallel_groups();
    assert_eq!(groups.len(), 1);
    let mut group = groups[0].clone();
    group.sort();
    assert_eq!(group, vec!["create_slack", "send_email"]);
}

#[tokio::test]
async fn test_self_debug_recovers_from_import_error() {
    let h = harness().await;
    script_hello_extraction(&h.model);
    script_selection(&h.model, 0.92, "direct match");
    script_hello_plan(&h.model);
    script_mappings(&h.model, 1);
    script_codegen(&h.model, HELLO_CODE_WITH_REQUESTS);
    script_scaffold(&h.model);
    script_debug_round(
        &h.model,
        "IMPORT_ERROR",
        "requests is not installed in the sandbox image",
        HELLO_CODE,
    );

    h.sandbox.push_exit(
        1,
        "Traceback (most recent call last):\n  File \"workflow.py\", line 4, in <module>\n    import requests\nModuleNotFoundError: No module named 'requests'",
    );
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .run(HELLO_REQUEST, Some("wf-debug".into()), CancelFlag::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Deployed { .. }), "{outcome:?}");

    let handoffs = h.packager.received();
    let history = &handoffs[0].report.debug_history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].category, ErrorCategory::ImportError);
    assert_eq!(history[0].attempt, 1);

    // The first-attempt record survives even though the retry succeeded.
    assert!(!handoffs[0].artifact.code.contains("import requests"));
    assert_eq!(h.sandbox.executions(), 2);
    assert_eq!(h.sink.events_of_type("debug.diagnosed").len(), 1);
}

#[tokio::test]
async fn test_budget_exhaustion_after_three_failures() {
    let h = harness().await;
    script_hello_extraction(&h.model);
    script_selection(&h.model, 0.92, "direct match");
    script_hello_plan(&h.model);
    script_mappings(&h.model, 1);
    script_codegen(&h.model, HELLO_CODE);
    script_scaffold(&h.model);
    for _ in 0..3 {
        script_debug_round(
            &h.model,
            "LOGIC_ERROR",
            "the response payload is mishandled",
            HELLO_CODE,
        );
        h.sandbox
            .push_exit(1, "TypeError: 'NoneType' object is not subscriptable");
    }

    let outcome = h
        .runner
        .run(HELLO_REQUEST, Some("wf-budget".into()), CancelFlag::new())
        .await
        .unwrap();

    match outcome {
        RunOutcome::Failed {
            category,
            last_debug,
            ..
        } => {
            assert_eq!(category, ErrorCategory::LogicError);
            let last = last_debug.expect("last debug record surfaced");
            assert_eq!(last.attempt, 3);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // Exactly MAX_DEBUG_ATTEMPTS diagnoses, then terminal failed.
    assert_eq!(h.sink.events_of_type("debug.diagnosed").len(), 3);
    assert_eq!(h.sandbox.executions(), 3);
    assert_eq!(h.sink.events_of_type("pipeline.failed").len(), 1);
}

#[tokio::test]
async fn test_clarification_round_trip() {
    let h = harness().await;

    // First pass: clear intent, no specifics.
    h.model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "intent": "onboarding",
            "workflow_name": "Employee onboarding",
            "description": "Automate employee onboarding",
            "actions": [
                {"id": "a1", "description": "Send a welcome email over SMTP to the new hire",
                 "service_hint": "Gmail", "is_trigger": false},
                {"id": "a2", "description": "Post a welcome message to the team Slack channel",
                 "service_hint": "Slack", "is_trigger": false}
            ],
            "triggers": [{"trigger_type": "event", "description": "new hire"}],
            "clarification_needed": [
                "Which Slack channel should welcome messages go to?",
                "What's the new employee's email address?"
            ],
            "assumed_defaults": ["Channel: not specified", "Email: not specified"]
        }),
    );
    h.model.push_text_for(
        "clarification",
        "I can set that up — which Slack channel should welcome messages go to, and what's the new hire's email?",
    );

    let outcome = h
        .runner
        .run(
            "Automate employee onboarding",
            Some("wf-clarify".into()),
            CancelFlag::new(),
        )
        .await
        .unwrap();

    let questions = match outcome {
        RunOutcome::NeedsClarification {
            correlation_id,
            questions,
            current_plan,
            ..
        } => {
            assert_eq!(correlation_id, "wf-clarify");
            assert!(!questions.is_empty() && questions.len() <= 2);
            assert_eq!(current_plan.len(), 2);
            questions
        }
        other => panic!("expected clarification suspend, got {other:?}"),
    };
    assert!(questions[0].contains("Slack channel"));
    assert_eq!(
        h.sink
            .events_of_type("conversation.clarification_needed")
            .len(),
        1
    );
    assert_eq!(h.sandbox.executions(), 0);

    // Resume with the answers: extraction now has full specifics and the
    // pipeline runs to deployment.
    h.model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "intent": "onboarding",
            "workflow_name": "Employee onboarding",
            "description": "Onboarding with #onboarding and jane@acme.com",
            "actions": [
                {"id": "a1", "description": "Send a welcome email over SMTP to jane@acme.com",
                 "service_hint": "Gmail", "parameters": {"to": "jane@acme.com"}, "is_trigger": false},
                {"id": "a2", "description": "Post a welcome message to the #onboarding Slack channel",
                 "service_hint": "Slack", "parameters": {"channel": "#onboarding"}, "is_trigger": false}
            ],
            "triggers": [{"trigger_type": "event", "description": "new hire"}],
            "clarification_needed": [],
            "assumed_defaults": []
        }),
    );
    script_selection(&h.model, 0.9, "SMTP send");
    script_selection(&h.model, 0.85, "postMessage");
    h.model.push_json_for(
        "workflow planner",
        serde_json::json!({
            "name": "Employee onboarding",
            "trigger": {"trigger_type": "event", "description": "new hire"},
            "steps": [
                {"id": "trigger", "name": "New hire", "step_type": "trigger"},
                {"id": "send_email", "name": "Welcome email", "step_type": "api_call",
                 "api_index": 0, "depends_on": ["trigger"]},
                {"id": "create_slack", "name": "Slack welcome", "step_type": "api_call",
                 "api_index": 1, "depends_on": ["trigger"]}
            ],
            "environment_vars": ["GMAIL_ADDRESS", "GMAIL_APP_PASSWORD", "SLACK_BOT_TOKEN"]
        }),
    );
    script_mappings(&h.model, 2);
    script_codegen(&h.model, ONBOARDING_CODE);
    script_scaffold(&h.model);
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .resume(
            "wf-clarify",
            "Use #onboarding and jane@acme.com",
            None,
            CancelFlag::new(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Deployed { .. }), "{outcome:?}");
    assert_eq!(h.packager.received().len(), 1);
}

#[tokio::test]
async fn test_security_block_then_replacement() {
    let h = harness().await;
    script_hello_extraction(&h.model);
    script_selection(&h.model, 0.92, "direct match");
    script_hello_plan(&h.model);
    script_mappings(&h.model, 1);
    script_codegen(&h.model, SHELL_CODE);
    // Security violations skip the LLM classification; only the patch runs.
    script_patch_only(&h.model, HELLO_CODE);
    h.sandbox.push_exit(0, "");

    let outcome = h
        .runner
        .run(HELLO_REQUEST, Some("wf-security".into()), CancelFlag::new())
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Deployed { .. }), "{outcome:?}");

    let handoffs = h.packager.received();
    let history = &handoffs[0].report.debug_history;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].category, ErrorCategory::SecurityViolation);

    // The deployed artifact no longer contains the shell call.
    assert!(!handoffs[0].artifact.code.contains("os.system"));

    // The scanner reported the violation before the patch.
    let reviews = h.sink.events_of_type("security.complete");
    assert!(reviews
        .iter()
        .any(|e| e.data.as_ref().unwrap()["safe"] == false));
    assert!(reviews
        .iter()
        .any(|e| e.data.as_ref().unwrap()["safe"] == true));
}

#[tokio::test]
async fn test_zero_actions_fails_with_missing_param() {
    let h = harness().await;
    h.model.push_json_for(
        "requirement extractor",
        serde_json::json!({
            "intent": "custom",
            "workflow_name": "Empty",
            "description": "nothing actionable",
            "actions": [],
            "triggers": [],
            "clarification_needed": [],
            "assumed_defaults": []
        }),
    );

    let outcome = h
        .runner
        .run("do nothing", Some("wf-empty".into()), CancelFlag::new())
        .await
        .unwrap();

    match outcome {
        RunOutcome::Failed { category, .. } => {
            assert_eq!(category, ErrorCategory::MissingParam);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_cancelled_before_start_keeps_checkpoint() {
    let h = harness().await;
    let cancel = CancelFlag::new();
    cancel.cancel();

    let outcome = h
        .runner
        .run(HELLO_REQUEST, Some("wf-cancel".into()), cancel)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));

    // Terminal event emitted, checkpoint auditable.
    assert_eq!(h.sink.events_of_type("pipeline.cancelled").len(), 1);
    let events = h.sink.events();
    assert_eq!(events.last().unwrap().phase, RunPhase::Cancelled);
    assert!(h.checkpoints.list_ids(10).unwrap().contains(&"wf-cancel".to_string()));
}
