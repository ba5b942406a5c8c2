use chrono::Utc;
use planwright_foundation::{InMemoryPlanStore, PlanExecutor, PlannerConfig, ReplanPolicyEngine};
use planwright_kernel::{
    Action, ActionResult, BudgetLimits, ExecutionContext, ExecutionPlan, GeneratedPlan,
    HistoryEntry, PlanStatus, PlanningEvent, ReplanCause, ReplanPolicyConfig, ResultKind,
    StepStatus, Storage, ToolUnavailableBehavior,
};
use planwright_testing::{
    FailingTelemetry, MockLLMProvider, MockToolExecutor, RecordingTelemetry,
    ScriptedPlanGenerator, drive, thread_context,
};
use serde_json::{Map, Value, json};
use std::sync::Arc;

fn search_fetch_steps() -> Vec<Value> {
    vec![
        json!({"id": "s1", "description": "Search", "tool": "search", "arguments": {"q": "rust"}}),
        json!({"id": "s2", "description": "Fetch", "tool": "fetch",
               "arguments": {"id": "{{s1.result[0].id}}"}}),
    ]
}

fn executor_for(generator: &ScriptedPlanGenerator, store: &InMemoryPlanStore) -> PlanExecutor {
    PlanExecutor::new(Arc::new(generator.clone()), Arc::new(store.clone()))
}

async fn stored_plan(store: &InMemoryPlanStore, key: &str) -> ExecutionPlan {
    store
        .load(&key.to_string())
        .await
        .unwrap()
        .expect("plan stored for thread")
}

#[tokio::test]
async fn test_search_then_fetch_substitutes_abc() {
    let generator = ScriptedPlanGenerator::with_steps(search_fetch_steps());
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);
    let tools = MockToolExecutor::new();
    tools.stub("search", Ok(json!([{"id": "abc"}]))).await;
    tools.stub("fetch", Ok(json!("doc abc"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "read abc", &["search", "fetch"]), 10).await;

    assert_eq!(run.final_answer(), Some("doc abc"));
    assert_eq!(tools.calls_to("fetch").await[0]["id"], json!("abc"));
    planwright_testing::assert_tool_called!(tools, "search", 1);
    planwright_testing::assert_tool_called!(tools, "fetch", 1);
    assert_eq!(stored_plan(&store, "t1").await.status, PlanStatus::Completed);
}

#[tokio::test]
async fn test_empty_result_requests_input_then_resumes() {
    let generator = ScriptedPlanGenerator::with_steps(search_fetch_steps());
    let store = InMemoryPlanStore::new();
    let telemetry = RecordingTelemetry::new();
    let executor = executor_for(&generator, &store).with_telemetry(Arc::new(telemetry.clone()));
    let tools = MockToolExecutor::new();
    tools.stub("search", Ok(json!([]))).await;
    tools.stub("fetch", Ok(json!("doc abc"))).await;
    let ctx = thread_context("t1", "read abc", &["search", "fetch"]);

    let run = drive(&executor, &tools, ctx.clone(), 10).await;
    assert_eq!(
        run.pending_input(),
        Some(&["{{s1.result[0].id}}".to_string()][..])
    );
    planwright_testing::assert_tool_called!(tools, "fetch", 0);
    assert_eq!(stored_plan(&store, "t1").await.status, PlanStatus::WaitingInput);
    assert_eq!(telemetry.count("awaiting_input").await, 1);

    let mut inputs = Map::new();
    inputs.insert("{{s1.result[0].id}}".into(), json!("abc"));
    assert!(executor.provide_input("t1", inputs).await.unwrap());

    let resumed = drive(&executor, &tools, run.context, 10).await;
    assert_eq!(resumed.final_answer(), Some("doc abc"));
    assert_eq!(tools.calls_to("fetch").await[0]["id"], json!("abc"));
}

#[tokio::test]
async fn test_needs_input_sentinel_is_resolved_from_provided_value() {
    let generator = ScriptedPlanGenerator::with_steps(vec![json!({
        "id": "send",
        "description": "Send the report",
        "tool": "mail",
        "arguments": {"to": "NEEDS-INPUT:recipient", "subject": "Report"}
    })]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);
    let tools = MockToolExecutor::new();
    tools.stub("mail", Ok(json!("sent"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "mail it", &["mail"]), 5).await;
    assert_eq!(run.pending_input(), Some(&["recipient".to_string()][..]));

    let mut inputs = Map::new();
    inputs.insert("recipient".into(), json!("ops@example.com"));
    executor.provide_input("t1", inputs).await.unwrap();

    let resumed = drive(&executor, &tools, run.context, 5).await;
    assert_eq!(resumed.final_answer(), Some("sent"));
    let calls = tools.calls_to("mail").await;
    assert_eq!(calls[0]["to"], json!("ops@example.com"));
    assert_eq!(calls[0]["subject"], json!("Report"));
}

#[tokio::test]
async fn test_replanning_stops_at_cap() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "s1", "description": "Call flaky service", "tool": "flaky"}),
    ]);
    let store = InMemoryPlanStore::new();
    let telemetry = RecordingTelemetry::new();
    let mut config = PlannerConfig::default();
    config.policy = config.policy.with_max_replans(2);
    config.execution = config.execution.with_max_step_retries(0);
    let executor = executor_for(&generator, &store)
        .with_config(config)
        .with_telemetry(Arc::new(telemetry.clone()));
    let tools = MockToolExecutor::new();
    tools.stub("flaky", Err("connection reset".into())).await;

    let run = drive(&executor, &tools, thread_context("t1", "call it", &["flaky"]), 20).await;

    let answer = run.final_answer().expect("run ends with a final answer");
    assert!(answer.contains("Gave up after 2 replans"), "{answer}");
    assert_eq!(generator.call_count().await, 3);
    assert_eq!(telemetry.count("replan_started").await, 2);
    assert_eq!(telemetry.count("replan_completed").await, 2);

    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.status, PlanStatus::Failed);
    assert_eq!(plan.metadata.replan_cause, Some(ReplanCause::MaxReplansExceeded));

    // A finished plan keeps answering the same goal without new plans.
    executor.think(&run.context).await;
    assert_eq!(generator.call_count().await, 3);
}

#[tokio::test]
async fn test_failure_window_triggers_replan() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "s1", "description": "Search", "tool": "search"}),
    ]);
    let store = InMemoryPlanStore::new();
    let telemetry = RecordingTelemetry::new();
    let executor = executor_for(&generator, &store).with_telemetry(Arc::new(telemetry.clone()));

    let healthy = thread_context("ok", "search", &["search"]);
    executor.think(&healthy).await;
    let healthy = healthy.with_history(vec![
        HistoryEntry::new(ResultKind::Error),
        HistoryEntry::new(ResultKind::ToolResult),
        HistoryEntry::new(ResultKind::ToolResult),
    ]);
    executor.think(&healthy).await;
    assert_eq!(telemetry.count("replan_started").await, 0);

    let failing = thread_context("bad", "search", &["search"]);
    executor.think(&failing).await;
    let failing = failing.with_history(vec![
        HistoryEntry::new(ResultKind::ToolResult),
        HistoryEntry::new(ResultKind::Error),
        HistoryEntry::new(ResultKind::Error),
    ]);
    let thought = executor.think(&failing).await;
    assert_eq!(thought.action.kind(), "tool_call");

    let events = telemetry.events().await;
    let cause = events.iter().find_map(|e| match e {
        PlanningEvent::ReplanStarted { thread_key, cause, .. } if thread_key == "bad" => Some(*cause),
        _ => None,
    });
    assert_eq!(cause, Some(ReplanCause::FailWindow));
    assert_eq!(stored_plan(&store, "bad").await.metadata.replans_count, 1);
    assert_eq!(stored_plan(&store, "ok").await.metadata.replans_count, 0);
}

#[tokio::test]
async fn test_budget_exhaustion_triggers_replan() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "s1", "tool": "search"}),
        json!({"id": "s2", "tool": "fetch"}),
    ]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store).with_policy(ReplanPolicyEngine::new(
        ReplanPolicyConfig::default().with_budget(
            BudgetLimits::unlimited().with_max_ms(1_000),
        ),
    ));

    let ctx = thread_context("t1", "search", &["search", "fetch"])
        .with_started_at(Utc::now() - chrono::Duration::seconds(5));
    executor.think(&ctx).await;
    executor
        .analyze_result(&ActionResult::tool_result("search", json!(["hit"])), &ctx)
        .await;
    executor.think(&ctx).await;

    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.metadata.replan_cause, Some(ReplanCause::Budget));
    assert_eq!(plan.metadata.replans_count, 1);
}

#[tokio::test]
async fn test_independent_steps_run_as_one_batch() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "a", "tool": "weather", "arguments": {"city": "Oslo"}}),
        json!({"id": "b", "tool": "news", "arguments": {"topic": "Oslo"}}),
        json!({"id": "c", "description": "Summarize", "dependsOn": ["a", "b"]}),
    ]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);
    let tools = MockToolExecutor::new();
    tools.stub("weather", Ok(json!("sunny"))).await;
    tools.stub("news", Ok(json!("calm"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "brief me", &["weather", "news"]), 10).await;

    match run.thoughts[0].action.clone() {
        Action::ParallelTools {
            calls,
            concurrency,
            fail_fast,
            aggregate_results,
        } => {
            assert_eq!(calls.len(), 2);
            assert_eq!(concurrency, 2);
            assert!(!fail_fast);
            assert!(aggregate_results);
        }
        other => panic!("expected parallel_tools, got {:?}", other),
    }
    assert_eq!(run.final_answer(), Some("Summarize"));
    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.steps[0].result, Some(json!("sunny")));
    assert_eq!(plan.steps[1].result, Some(json!("calm")));
}

#[tokio::test]
async fn test_batch_failure_is_fail_open_and_skips_dependents() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "a", "tool": "weather"}),
        json!({"id": "b", "tool": "news"}),
        json!({"id": "c", "description": "Summarize news", "dependsOn": ["b"]}),
    ]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);
    let tools = MockToolExecutor::new();
    tools.stub("weather", Ok(json!("sunny"))).await;
    tools.stub("news", Err("unauthorized".into())).await;

    let run = drive(&executor, &tools, thread_context("t1", "brief me", &["weather", "news"]), 10).await;

    assert_eq!(run.final_answer(), Some("sunny"));
    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.steps[1].status, StepStatus::Failed);
    assert_eq!(plan.steps[2].status, StepStatus::Skipped);
    assert_eq!(generator.call_count().await, 1);
}

#[tokio::test]
async fn test_array_result_fans_out_one_call_per_element() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "list", "tool": "catalog"}),
        json!({"id": "each", "tool": "lookup", "arguments": {"item": "{{list.result}}", "verbose": true}}),
    ]);
    let store = InMemoryPlanStore::new();
    let telemetry = RecordingTelemetry::new();
    let executor = executor_for(&generator, &store).with_telemetry(Arc::new(telemetry.clone()));
    let tools = MockToolExecutor::new();
    tools.stub("catalog", Ok(json!(["x", "y", "z"]))).await;
    tools
        .queue(
            "lookup",
            vec![Ok(json!("X")), Err("timeout".into()), Ok(json!("Z"))],
        )
        .await;

    let run = drive(&executor, &tools, thread_context("t1", "look up all", &["catalog", "lookup"]), 10).await;

    assert!(run.final_answer().is_some());
    let fan_out = run.actions_of("parallel_tools");
    assert_eq!(fan_out.len(), 1);
    if let Action::ParallelTools { calls, concurrency, .. } = fan_out[0] {
        assert_eq!(calls.len(), 3);
        assert_eq!(*concurrency, 3);
    }

    let items: Vec<Value> = tools
        .calls_to("lookup")
        .await
        .into_iter()
        .map(|args| args["item"].clone())
        .collect();
    assert_eq!(items, vec![json!("x"), json!("y"), json!("z")]);
    assert_eq!(tools.calls_to("lookup").await[0]["verbose"], json!(true));

    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.steps[1].result, Some(json!(["X", null, "Z"])));
    assert!(
        telemetry
            .events()
            .await
            .iter()
            .any(|e| matches!(e, PlanningEvent::BatchDispatched { invocations: 3, .. }))
    );
}

#[tokio::test]
async fn test_missing_tool_replans_by_default() {
    let generator = ScriptedPlanGenerator::new(vec![
        GeneratedPlan::new(vec![json!({"id": "w", "tool": "weather"})]),
        GeneratedPlan::new(vec![json!({"id": "f", "tool": "forecast"})]),
    ]);
    let store = InMemoryPlanStore::new();
    let telemetry = RecordingTelemetry::new();
    let executor = executor_for(&generator, &store).with_telemetry(Arc::new(telemetry.clone()));
    let tools = MockToolExecutor::new();
    tools.stub("forecast", Ok(json!("rain"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "weather?", &["forecast"]), 10).await;

    assert_eq!(run.final_answer(), Some("rain"));
    let causes: Vec<ReplanCause> = telemetry
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            PlanningEvent::ReplanStarted { cause, .. } => Some(cause),
            _ => None,
        })
        .collect();
    assert_eq!(causes, vec![ReplanCause::ToolMissing]);

    let request = generator.last_request().await.unwrap();
    assert!(request.user_prompt.contains("tool-missing"));
    assert!(request.user_prompt.contains("Tool not found: weather"));
}

#[tokio::test]
async fn test_missing_tool_fails_when_configured() {
    let generator = ScriptedPlanGenerator::with_steps(vec![json!({"id": "w", "tool": "weather"})]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store).with_policy(ReplanPolicyEngine::new(
        ReplanPolicyConfig::default().with_tool_unavailable(ToolUnavailableBehavior::Fail),
    ));
    let tools = MockToolExecutor::new();

    let run = drive(&executor, &tools, thread_context("t1", "weather?", &[]), 10).await;

    assert_eq!(run.final_answer(), Some("Tool not found: weather"));
    let last = run.analyses.last().unwrap();
    assert!(last.is_complete && !last.is_successful);
    assert_eq!(generator.call_count().await, 1);
}

#[tokio::test]
async fn test_unrecoverable_error_is_never_replanned() {
    let generator = ScriptedPlanGenerator::with_steps(vec![json!({"id": "s1", "tool": "vault"})]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);
    let tools = MockToolExecutor::new();
    tools.stub("vault", Err("Permission denied".into())).await;

    let run = drive(&executor, &tools, thread_context("t1", "open vault", &["vault"]), 10).await;

    assert_eq!(run.final_answer(), Some("Permission denied"));
    planwright_testing::assert_tool_called!(tools, "vault", 1);
    assert_eq!(generator.call_count().await, 1);
}

#[tokio::test]
async fn test_failing_telemetry_is_not_fatal() {
    let generator = ScriptedPlanGenerator::with_steps(search_fetch_steps());
    let store = InMemoryPlanStore::new();
    let telemetry = FailingTelemetry::new();
    let executor = executor_for(&generator, &store).with_telemetry(Arc::new(telemetry.clone()));
    let tools = MockToolExecutor::new();
    tools.stub("search", Ok(json!([{"id": "abc"}]))).await;
    tools.stub("fetch", Ok(json!("doc abc"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "read abc", &["search", "fetch"]), 10).await;

    assert_eq!(run.final_answer(), Some("doc abc"));
    assert!(telemetry.attempts() >= 3);
}

#[tokio::test]
async fn test_cyclic_plan_is_rejected_with_diagnostic() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "a", "tool": "t", "dependsOn": ["c"]}),
        json!({"id": "b", "tool": "t", "dependsOn": ["a"]}),
        json!({"id": "c", "tool": "t", "arguments": {"x": "{{b.result}}"}}),
    ]);
    let store = InMemoryPlanStore::new();
    let telemetry = RecordingTelemetry::new();
    let executor = executor_for(&generator, &store).with_telemetry(Arc::new(telemetry.clone()));
    let tools = MockToolExecutor::new();

    let run = drive(&executor, &tools, thread_context("t1", "loop", &["t"]), 5).await;

    let answer = run.final_answer().unwrap();
    assert!(answer.contains("dependency cycle"), "{answer}");
    assert!(tools.history().await.is_empty());

    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.steps.len(), 1);
    assert_eq!(plan.steps[0].status, StepStatus::Failed);
    assert!(telemetry.events().await.iter().any(|e| matches!(
        e,
        PlanningEvent::PlanCreated { valid: false, .. }
    )));
}

#[tokio::test]
async fn test_dangling_reference_is_rejected() {
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "s1", "tool": "fetch", "arguments": {"id": "{{ghost.result.id}}"}}),
    ]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);
    let tools = MockToolExecutor::new();

    let run = drive(&executor, &tools, thread_context("t1", "fetch", &["fetch"]), 5).await;

    let answer = run.final_answer().unwrap();
    assert!(answer.contains("unknown step"), "{answer}");
    assert!(tools.history().await.is_empty());
}

#[tokio::test]
async fn test_llm_collaborators_end_to_end() {
    let provider = MockLLMProvider::new();
    provider.add_mock_response("Template:", "ACME");
    provider.add_mock_response(
        "Goal:",
        r#"```json
{"reasoning": "search then fetch",
 "steps": [
   {"id": "s1", "description": "Search", "tool": "search", "arguments": {"q": "rust"}},
   {"id": "s2", "description": "Fetch", "tool": "fetch",
    "arguments": {"publisher": "{{s1.result.publisher}}"}}
 ]}
```"#,
    );
    let provider = Arc::new(provider);
    let config = PlannerConfig::default();
    let store = InMemoryPlanStore::new();
    let executor = PlanExecutor::new(
        Arc::new(config.llm.plan_generator(provider.clone())),
        Arc::new(store.clone()),
    )
    .with_extractor(Arc::new(config.llm.value_extractor(provider.clone())))
    .with_config(config);
    let tools = MockToolExecutor::new();
    tools.stub("search", Ok(json!({"title": "Rust 2024"}))).await;
    tools.stub("fetch", Ok(json!("catalog page"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "who publishes rust", &["search", "fetch"]), 10).await;

    assert_eq!(run.final_answer(), Some("catalog page"));
    assert_eq!(tools.calls_to("fetch").await[0]["publisher"], json!("ACME"));
    assert_eq!(provider.call_count(), 2);
    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.metadata.reasoning.as_deref(), Some("search then fetch"));
}

#[tokio::test]
async fn test_yaml_config_announces_plans_and_caps_concurrency() {
    let config = PlannerConfig::from_yaml_str(
        r#"
execution:
  announce_plans: true
  max_concurrency: 1
policy:
  max_replans_per_plan: 1
"#,
    )
    .unwrap();
    let generator = ScriptedPlanGenerator::with_steps(vec![
        json!({"id": "a", "tool": "weather"}),
        json!({"id": "b", "tool": "news"}),
    ]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store).with_config(config);
    let tools = MockToolExecutor::new();
    tools.stub("weather", Ok(json!("sunny"))).await;
    tools.stub("news", Ok(json!("calm"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "brief me", &["weather", "news"]), 10).await;

    let plan_id = stored_plan(&store, "t1").await.id;
    assert_eq!(run.thoughts[0].action, Action::ExecutePlan { plan_id });
    match &run.thoughts[1].action {
        Action::ParallelTools { concurrency, .. } => assert_eq!(*concurrency, 1),
        other => panic!("expected parallel_tools, got {:?}", other),
    }
    assert_eq!(run.final_answer(), Some("calm"));
}

#[tokio::test]
async fn test_threads_keep_separate_plans() {
    let generator = ScriptedPlanGenerator::with_steps(vec![json!({"id": "s1", "tool": "search"})]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store);

    let first = executor.think(&thread_context("t1", "one", &["search"])).await;
    let second = executor
        .think(&ExecutionContext::new("two").with_correlation_id("corr-2"))
        .await;
    let third = executor.think(&ExecutionContext::new("three")).await;

    assert_eq!(first.action.kind(), "tool_call");
    assert_eq!(second.action.kind(), "tool_call");
    assert_eq!(third.action.kind(), "tool_call");
    assert_eq!(
        store.list().await.unwrap(),
        vec!["corr-2".to_string(), "default".to_string(), "t1".to_string()]
    );
    assert_ne!(first.metadata["plan_id"], second.metadata["plan_id"]);
}

#[tokio::test]
async fn test_missing_tool_question_feeds_the_next_plan() {
    let generator = ScriptedPlanGenerator::new(vec![
        GeneratedPlan::new(vec![json!({"id": "w", "tool": "weather", "arguments": {"city": "Oslo"}})]),
        GeneratedPlan::new(vec![json!({"id": "f", "tool": "forecast", "arguments": {"city": "Oslo"}})]),
    ]);
    let store = InMemoryPlanStore::new();
    let executor = executor_for(&generator, &store).with_policy(ReplanPolicyEngine::new(
        ReplanPolicyConfig::default().with_tool_unavailable(ToolUnavailableBehavior::AskUser),
    ));
    let tools = MockToolExecutor::new();
    tools.stub("forecast", Ok(json!("rain"))).await;

    let run = drive(&executor, &tools, thread_context("t1", "weather?", &["forecast"]), 10).await;
    assert_eq!(run.pending_input(), Some(&["weather".to_string()][..]));
    let suggestion = run.analyses.last().and_then(|a| a.suggested_next_action.clone());
    assert!(matches!(suggestion, Some(Action::NeedInput { .. })));
    assert_eq!(generator.call_count().await, 1);

    let mut inputs = Map::new();
    inputs.insert("weather".into(), json!("use forecast"));
    assert!(executor.provide_input("t1", inputs).await.unwrap());

    let resumed = drive(&executor, &tools, run.context, 10).await;
    assert_eq!(resumed.final_answer(), Some("rain"));
    assert_eq!(generator.call_count().await, 2);
    let request = generator.last_request().await.unwrap();
    assert!(request.user_prompt.contains("use forecast"));
    let plan = stored_plan(&store, "t1").await;
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.metadata.replan_cause, Some(ReplanCause::ToolMissing));
}
