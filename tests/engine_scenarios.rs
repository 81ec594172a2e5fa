//! 执行引擎端到端场景

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use stepwise::actions::{
    register_filesystem_handlers, Action, ActionCall, ActionDispatcher, ActionType,
    CapabilityHandler, CapabilityRegistry,
};
use stepwise::core::{
    task_from_plan_text, ActionFailure, ChannelApproval, EngineConfig, EventSink, ExecutionControl,
    ExecutionEngine, ExecutionEvent, RetryPolicy, Step, StepResult, StepStatus, Task, TaskSession,
    TaskStatus,
};
use stepwise::llm::{Collaborator, LlmClient, ScriptedLlmClient};
use stepwise::memory::{
    ProblemSignature, SqliteSnapshotStore, StrategyMemory, StrategyMemoryConfig, StrategyPattern,
    TaskSnapshotStore,
};
use stepwise::planning::{ConfidencePlanner, FallbackPlan, RiskLevel};
use stepwise::react::{AttemptSource, MetacognitionConfig};
use stepwise::transaction::{
    AppliedChange, Change, ChangeApplier, Compensation, Transaction,
};

type Behavior = dyn Fn(&ActionCall, u32) -> Result<StepResult, ActionFailure> + Send + Sync;

/// 行为可编程的测试处理器，记录调用次数
struct TestHandler {
    kind: ActionType,
    calls: Arc<AtomicU32>,
    behavior: Box<Behavior>,
}

impl TestHandler {
    fn new(
        kind: ActionType,
        behavior: impl Fn(&ActionCall, u32) -> Result<StepResult, ActionFailure> + Send + Sync + 'static,
    ) -> (Self, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        (
            Self {
                kind,
                calls: Arc::clone(&calls),
                behavior: Box::new(behavior),
            },
            calls,
        )
    }
}

#[async_trait]
impl CapabilityHandler for TestHandler {
    fn action_type(&self) -> ActionType {
        self.kind
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        (self.behavior)(call, n)
    }
}

fn ok_handler(kind: ActionType) -> (TestHandler, Arc<AtomicU32>) {
    TestHandler::new(kind, |_, n| Ok(StepResult::ok(format!("call {}", n))))
}

fn failing_handler(kind: ActionType, error: &'static str) -> (TestHandler, Arc<AtomicU32>) {
    TestHandler::new(kind, move |_, _| {
        Err(ActionFailure::handler(kind_name(kind), error))
    })
}

fn kind_name(kind: ActionType) -> &'static str {
    kind.as_str()
}

fn memory() -> Arc<Mutex<StrategyMemory>> {
    Arc::new(Mutex::new(StrategyMemory::in_memory(
        StrategyMemoryConfig::default(),
    )))
}

fn engine_with(registry: CapabilityRegistry) -> ExecutionEngine {
    ExecutionEngine::new(Arc::new(ActionDispatcher::new(registry, 5)), memory())
        .with_retry_policy(RetryPolicy::immediate())
}

fn collaborator(llm: &Arc<ScriptedLlmClient>) -> Arc<Collaborator> {
    let client: Arc<dyn LlmClient> = Arc::clone(llm) as Arc<dyn LlmClient>;
    Arc::new(Collaborator::new(client))
}

fn search(id: &str) -> Step {
    Step::new(
        id,
        format!("Search {}", id),
        Action::new(ActionType::SearchCodebase, json!({"query": "fn main"})),
    )
}

fn analyze(id: &str, path: &str) -> Step {
    Step::new(
        id,
        "Analyze module",
        Action::new(ActionType::AnalyzeCode, json!({"path": path})),
    )
    .with_description("Inspect the module for dead code")
}

fn observed_session() -> (TaskSession, mpsc::UnboundedReceiver<ExecutionEvent>) {
    let (events, rx) = EventSink::channel();
    (TaskSession::default().with_events(events), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut out = Vec::new();
    while let Ok(e) = rx.try_recv() {
        out.push(e);
    }
    out
}

fn count(events: &[ExecutionEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}

#[tokio::test]
async fn test_zero_step_task_fires_only_task_complete() {
    let engine = engine_with(CapabilityRegistry::new());
    let (session, mut rx) = observed_session();
    let done = engine
        .execute_task(Task::new("empty", "Nothing to do"), &session)
        .await;
    assert_eq!(done.status, TaskStatus::Completed);
    let names: Vec<_> = drain(&mut rx).iter().map(|e| e.name()).collect();
    assert_eq!(names, vec!["task_complete"]);
}

#[tokio::test]
async fn test_exhausted_step_fires_single_step_error() {
    let mut registry = CapabilityRegistry::new();
    let (handler, calls) = failing_handler(ActionType::AnalyzeCode, "connection refused");
    registry.register(handler);
    let engine = engine_with(registry);
    let (session, mut rx) = observed_session();

    let task = Task::new("t", "Analyze").with_step(analyze("s1", "src/lib.rs"));
    let done = engine.execute_task(task, &session).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.steps[0].status, StepStatus::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let events = drain(&mut rx);
    assert_eq!(count(&events, "step_error"), 1);
    let final_error = events.iter().find_map(|e| match e {
        ExecutionEvent::StepError {
            error, attempts, ..
        } => Some((error.clone(), *attempts)),
        _ => None,
    });
    let (error, attempts) = final_error.unwrap();
    assert_eq!(attempts, 3);
    assert!(error.contains("after 3 attempts"));
    assert!(error.contains("connection refused"));
    assert_eq!(count(&events, "task_error"), 1);
    assert_eq!(count(&events, "task_complete"), 0);
}

#[tokio::test]
async fn test_approval_denial_cancels_without_invoking_handler() {
    let mut registry = CapabilityRegistry::new();
    let (first, first_calls) = ok_handler(ActionType::SearchCodebase);
    let (guarded, guarded_calls) = ok_handler(ActionType::GitCommit);
    registry.register(first);
    registry.register(guarded);
    let engine = engine_with(registry);

    let (gate, mut requests) = ChannelApproval::channel();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            assert_eq!(request.step_id, "commit");
            request.deny();
        }
    });
    let (events, mut rx) = EventSink::channel();
    let session = TaskSession::default()
        .with_approval(gate)
        .with_events(events);

    let task = Task::new("t", "Ship it")
        .with_step(search("s1"))
        .with_step(
            Step::new(
                "commit",
                "Commit",
                Action::new(ActionType::GitCommit, json!({"message": "wip"})),
            )
            .with_approval(),
        )
        .with_step(search("s3"));
    let done = engine.execute_task(task, &session).await;

    assert_eq!(done.status, TaskStatus::Cancelled);
    assert_eq!(done.steps[1].status, StepStatus::Rejected);
    assert_eq!(done.steps[2].status, StepStatus::Pending);
    assert_eq!(guarded_calls.load(Ordering::SeqCst), 0);
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    let events = drain(&mut rx);
    assert_eq!(count(&events, "approval_requested"), 1);
    assert_eq!(count(&events, "step_error"), 0);
    assert_eq!(count(&events, "rolled_back"), 0);
}

#[tokio::test]
async fn test_strategy_query_is_stable() {
    let mut memory = StrategyMemory::in_memory(StrategyMemoryConfig::default());
    for (goal, rate) in [
        ("analyze parser module", 0.9),
        ("analyze lexer module", 0.5),
        ("analyze parser tests", 0.7),
    ] {
        memory.record_success(
            ProblemSignature::new(goal, "analyze_code", "rust"),
            format!("approach for {}", goal),
            None,
            rate,
        );
    }
    let probe = ProblemSignature::new("analyze parser module", "analyze_code", "rust");
    let first: Vec<_> = memory
        .query(&probe)
        .into_iter()
        .map(|m| (m.pattern.key(), m.score, m.relevance))
        .collect();
    let second: Vec<_> = memory
        .query(&probe)
        .into_iter()
        .map(|m| (m.pattern.key(), m.score, m.relevance))
        .collect();
    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_confidence_score_is_clipped_and_bucketed() {
    let planner = ConfidencePlanner::default();
    let params = [json!({}), json!({"path": ""}), json!({"query": "x", "bogus": 1})];
    for kind in ActionType::ALL {
        for p in &params {
            let step = Step::new("s", "Step", Action::new(kind, p.clone()));
            let a = planner.assess(&step, &[]);
            assert!((0.0..=100.0).contains(&a.score), "{} out of range", a.score);
            assert_eq!(a.risk_level, RiskLevel::from_score(a.score));
        }
    }
}

fn pattern(goal: &str, rate: f64, usage: u32, days_ago: i64) -> StrategyPattern {
    let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let mut p = StrategyPattern::new(
        ProblemSignature::new(goal, "read_file", "docs"),
        format!("approach {}", goal),
        None,
        rate,
    );
    p.usage_count = usage;
    p.last_used = base - chrono::Duration::days(days_ago);
    p.created_at = p.last_used;
    p
}

#[tokio::test]
async fn test_prune_keeps_exactly_capacity_and_drops_lowest_score() {
    let patterns = vec![
        pattern("read changelog entries", 0.9, 8, 1),
        pattern("read license header", 0.8, 5, 2),
        pattern("read readme badges", 0.1, 1, 90),
        pattern("read contributing guide", 0.7, 3, 3),
    ];

    let mut reference = StrategyMemory::in_memory(StrategyMemoryConfig {
        capacity: 10,
        ..StrategyMemoryConfig::default()
    });
    for p in &patterns {
        reference.upsert(p.clone());
    }
    let (lowest, _) = reference
        .retention_scores()
        .into_iter()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap();

    let mut bounded = StrategyMemory::in_memory(StrategyMemoryConfig {
        capacity: 3,
        ..StrategyMemoryConfig::default()
    });
    let mut evicted = Vec::new();
    for p in patterns {
        evicted.extend(bounded.upsert(p));
    }
    assert_eq!(bounded.len(), 3);
    assert_eq!(evicted, vec![lowest]);
}

/// 记录补偿顺序的变更应用器；id 为 "boom" 的变更失败
#[derive(Default)]
struct RecordingApplier {
    compensated: StdMutex<Vec<String>>,
}

#[async_trait]
impl ChangeApplier for RecordingApplier {
    async fn apply(&self, change: &Change) -> Result<AppliedChange, ActionFailure> {
        if change.id == "boom" {
            return Err(ActionFailure::handler("write_file", "disk full"));
        }
        Ok(AppliedChange {
            change_id: change.id.clone(),
            result: StepResult::ok("applied"),
            compensation: Compensation {
                change_id: change.id.clone(),
                description: format!("undo {}", change.id),
                undo: None,
            },
        })
    }

    async fn compensate(&self, compensation: &Compensation) -> Result<(), String> {
        self.compensated
            .lock()
            .unwrap()
            .push(compensation.change_id.clone());
        if compensation.change_id == "c2" {
            return Err("undo failed".to_string());
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_rollback_runs_k_compensations_in_reverse() {
    let applier = RecordingApplier::default();
    let action = Action::new(ActionType::WriteFile, json!({"path": "a", "content": "x"}));
    let mut tx = Transaction::begin();
    for id in ["c1", "c2", "c3"] {
        tx.apply(&applier, &Change::new(id, id, action.clone()))
            .await
            .unwrap();
    }
    assert!(tx
        .apply(&applier, &Change::new("boom", "boom", action.clone()))
        .await
        .is_err());
    assert!(tx.commit().is_err());

    let report = tx.rollback(&applier).await;
    assert_eq!(
        *applier.compensated.lock().unwrap(),
        vec!["c3".to_string(), "c2".to_string(), "c1".to_string()]
    );
    assert_eq!(report.compensated, vec!["c3".to_string(), "c1".to_string()]);
    assert_eq!(report.failures.len(), 1);
}

#[tokio::test]
async fn test_three_step_task_recovers_with_generated_alternative() {
    let mut registry = CapabilityRegistry::new();
    let (searcher, _) = ok_handler(ActionType::SearchCodebase);
    let (analyzer, analyzer_calls) = TestHandler::new(ActionType::AnalyzeCode, |call, _| {
        match call {
            ActionCall::AnalyzeCode { path, .. } if path == "src/parser/mod.rs" => {
                Ok(StepResult::ok("analysis complete"))
            }
            ActionCall::AnalyzeCode { path, .. } => Err(ActionFailure::InvalidPath {
                path: path.clone(),
            }),
            _ => unreachable!(),
        }
    });
    registry.register(searcher);
    registry.register(analyzer);

    let llm = Arc::new(
        ScriptedLlmClient::new()
            .on(
                "self_correction",
                r#"{"no_alternative": true, "reasoning": "transient"}"#,
            )
            .on(
                "self_correction",
                r#"```json
{"action": {"type": "analyze_code", "params": {"path": "src/parser/mod.rs"}}, "reasoning": "module moved into a directory"}
```"#,
            ),
    );
    let engine = engine_with(registry).with_collaborator(collaborator(&llm));
    let (session, mut rx) = observed_session();

    let task = Task::new("t", "Refresh parser")
        .with_step(search("s1"))
        .with_step(analyze("s2", "src/parser.rs"))
        .with_step(search("s3"));
    let done = engine.execute_task(task, &session).await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(analyzer_calls.load(Ordering::SeqCst), 3);
    let step = &done.steps[1];
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.retry_count, 2);
    let cycle = step.react_cycle.as_ref().unwrap();
    let sources: Vec<_> = cycle.attempts.iter().map(|a| a.source).collect();
    assert_eq!(
        sources,
        vec![
            AttemptSource::Original,
            AttemptSource::Retry,
            AttemptSource::Correction
        ]
    );
    let outcomes: Vec<_> = cycle.attempts.iter().map(|a| a.success).collect();
    assert_eq!(outcomes, vec![false, false, true]);
    assert!(cycle.succeeded);
    assert!(cycle.recovered());
    assert!(cycle.reflection.is_some());
    assert_eq!(llm.count("self_correction"), 2);
    let usage = &done.metadata["token_usage"];
    assert!(usage["total_tokens"].as_u64().unwrap() > 0);
    assert_eq!(
        usage["total_tokens"].as_u64(),
        Some(llm.token_usage().2)
    );

    let events = drain(&mut rx);
    assert_eq!(count(&events, "step_error"), 0);
    assert_eq!(count(&events, "attempt_failed"), 2);
    assert_eq!(count(&events, "task_complete"), 1);
}

#[tokio::test]
async fn test_repeated_error_escalates_within_cap() {
    let mut registry = CapabilityRegistry::new();
    let (handler, _) = failing_handler(ActionType::AnalyzeCode, "lock held by pid 4242");
    registry.register(handler);
    let engine = engine_with(registry).with_metacognition(MetacognitionConfig {
        max_escalations: 2,
        ..MetacognitionConfig::default()
    });
    let (session, mut rx) = observed_session();

    let task = Task::new("t", "Analyze").with_step(analyze("s1", "src/lib.rs").with_max_retries(5));
    let done = engine.execute_task(task, &session).await;

    let events = drain(&mut rx);
    let escalations = count(&events, "escalation");
    assert!(escalations >= 1);
    assert!(escalations <= 2);
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("Escalation limit reached"));
}

#[tokio::test]
async fn test_default_cap_never_exceeded_on_three_identical_failures() {
    let mut registry = CapabilityRegistry::new();
    let (handler, _) = failing_handler(ActionType::AnalyzeCode, "timeout after 30s");
    registry.register(handler);
    let engine = engine_with(registry);
    let (session, mut rx) = observed_session();

    let task = Task::new("t", "Analyze").with_step(analyze("s1", "src/lib.rs"));
    let done = engine.execute_task(task, &session).await;

    let escalations = count(&drain(&mut rx), "escalation");
    assert!((1..=3).contains(&escalations));
    assert_eq!(done.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_memory_backed_step_has_higher_confidence() {
    let step = analyze("s1", "src/lib.rs");
    let task = Task::new("t", "Analyze").with_step(step.clone());
    let signature = ProblemSignature::for_step(&step, &task);

    let mut memory = StrategyMemory::in_memory(StrategyMemoryConfig::default());
    memory.record_success(
        signature.clone(),
        "analyze with focus on exports",
        Some(step.action.clone()),
        0.9,
    );
    let matches = memory.query(&signature);
    assert_eq!(matches.len(), 1);

    let planner = ConfidencePlanner::default();
    let backed = planner.assess(&step, &matches);
    let plain = planner.assess(&step, &[]);
    assert!(backed.memory_backed);
    assert!(!plain.memory_backed);
    assert!(backed.score > plain.score);
}

#[tokio::test]
async fn test_learned_strategy_backs_next_execution() {
    let mut registry = CapabilityRegistry::new();
    let (handler, _) = ok_handler(ActionType::AnalyzeCode);
    registry.register(handler);
    let engine = engine_with(registry);

    let first = engine
        .execute_task(
            Task::new("t1", "Analyze").with_step(analyze("s1", "src/lib.rs")),
            &TaskSession::default(),
        )
        .await;
    let second = engine
        .execute_task(
            Task::new("t2", "Analyze").with_step(analyze("s1", "src/lib.rs")),
            &TaskSession::default(),
        )
        .await;

    let before = first.steps[0].confidence.as_ref().unwrap();
    let after = second.steps[0].confidence.as_ref().unwrap();
    assert!(!before.memory_backed);
    assert!(after.memory_backed);
    assert!(!first.metadata.contains_key("token_usage"));
    assert!(after.score > before.score);
    assert_eq!(second.insights.as_ref().unwrap().memory_backed_steps, 1);
}

#[tokio::test]
async fn test_skippable_step_is_skipped_and_task_continues() {
    let mut registry = CapabilityRegistry::new();
    let (failing, _) = failing_handler(ActionType::AnalyzeCode, "parser crashed");
    let (searcher, search_calls) = ok_handler(ActionType::SearchCodebase);
    registry.register(failing);
    registry.register(searcher);
    let engine = engine_with(registry);
    let (session, mut rx) = observed_session();

    let task = Task::new("t", "Best effort")
        .with_step(analyze("s1", "src/lib.rs").with_max_retries(1).skippable())
        .with_step(search("s2"));
    let done = engine.execute_task(task, &session).await;

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.steps[0].status, StepStatus::Skipped);
    assert!(done.steps[0].result.as_ref().unwrap().skipped);
    assert_eq!(search_calls.load(Ordering::SeqCst), 1);
    let progress = done.progress();
    assert_eq!((progress.completed, progress.skipped), (1, 1));
    let events = drain(&mut rx);
    assert_eq!(count(&events, "step_error"), 1);
    assert_eq!(count(&events, "task_complete"), 1);
}

#[tokio::test]
async fn test_failure_rolls_back_committed_changes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("config.toml"), "version = 1\n").unwrap();

    let mut registry = CapabilityRegistry::new();
    register_filesystem_handlers(&mut registry, dir.path());
    let (failing, _) = failing_handler(ActionType::RunTests, "3 tests failed");
    registry.register(failing);
    let engine = engine_with(registry).with_config(EngineConfig {
        react_enabled: false,
        ..EngineConfig::default()
    });
    let (session, mut rx) = observed_session();

    let task = Task::new("t", "Bump version")
        .with_step(Step::new(
            "edit",
            "Bump version",
            Action::new(
                ActionType::EditFile,
                json!({"path": "config.toml", "old_text": "version = 1", "new_text": "version = 2"}),
            ),
        ))
        .with_step(Step::new(
            "notes",
            "Write release notes",
            Action::new(
                ActionType::WriteFile,
                json!({"path": "NOTES.md", "content": "v2\n"}),
            ),
        ))
        .with_step(
            Step::new("test", "Run tests", Action::new(ActionType::RunTests, json!({})))
                .with_max_retries(0),
        );
    let done = engine.execute_task(task, &session).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("config.toml")).unwrap(),
        "version = 1\n"
    );
    assert!(!dir.path().join("NOTES.md").exists());
    let events = drain(&mut rx);
    let rolled_back = events.iter().find_map(|e| match e {
        ExecutionEvent::RolledBack {
            compensated,
            failures,
            ..
        } => Some((*compensated, *failures)),
        _ => None,
    });
    assert_eq!(rolled_back, Some((2, 0)));
    assert!(done.metadata.contains_key("rollback"));
}

#[tokio::test]
async fn test_cancellation_does_not_roll_back() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = CapabilityRegistry::new();
    register_filesystem_handlers(&mut registry, dir.path());
    let engine = engine_with(registry);

    let (gate, mut requests) = ChannelApproval::channel();
    let control = ExecutionControl::new();
    let canceller = control.clone();
    tokio::spawn(async move {
        if let Some(_request) = requests.recv().await {
            canceller.cancel();
        }
    });
    let (events, mut rx) = EventSink::channel();
    let session = TaskSession::default()
        .with_approval(gate)
        .with_control(control)
        .with_events(events);

    let task = Task::new("t", "Write then delete")
        .with_step(Step::new(
            "write",
            "Write file",
            Action::new(ActionType::WriteFile, json!({"path": "keep.txt", "content": "x"})),
        ))
        .with_step(
            Step::new(
                "delete",
                "Delete file",
                Action::new(ActionType::DeleteFile, json!({"path": "keep.txt"})),
            )
            .with_approval(),
        );
    let done = engine.execute_task(task, &session).await;

    assert_eq!(done.status, TaskStatus::Cancelled);
    assert!(dir.path().join("keep.txt").exists());
    assert_eq!(count(&drain(&mut rx), "rolled_back"), 0);
}

#[tokio::test]
async fn test_amendment_group_applies_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = CapabilityRegistry::new();
    register_filesystem_handlers(&mut registry, dir.path());
    let (failing, failing_calls) = failing_handler(ActionType::RunTests, "compile error");
    registry.register(failing);
    let engine = engine_with(registry);

    let task = Task::new("t", "Add module")
        .with_step(
            Step::new(
                "module",
                "Write module",
                Action::new(ActionType::WriteFile, json!({"path": "m.rs", "content": "pub fn f() {}"})),
            )
            .linked_to(&["check"]),
        )
        .with_step(
            Step::new("check", "Check build", Action::new(ActionType::RunTests, json!({})))
                .with_max_retries(1),
        );
    let done = engine.execute_task(task, &TaskSession::default()).await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.steps[0].status, StepStatus::Failed);
    assert_eq!(done.steps[1].status, StepStatus::Failed);
    assert_eq!(failing_calls.load(Ordering::SeqCst), 2);
    assert!(!dir.path().join("m.rs").exists());
}

#[tokio::test]
async fn test_fallback_plan_is_tried_before_literal_retry() {
    let mut registry = CapabilityRegistry::new();
    let (analyzer, _) = TestHandler::new(ActionType::AnalyzeCode, |call, _| match call {
        ActionCall::AnalyzeCode { path, .. } if path == "lib.rs" => Ok(StepResult::ok("ok")),
        _ => Err(ActionFailure::handler("analyze_code", "no such module")),
    });
    registry.register(analyzer);
    let engine = engine_with(registry).with_config(EngineConfig {
        confidence_enabled: false,
        ..EngineConfig::default()
    });

    let mut step = analyze("s1", "src/lib.rs");
    step.fallbacks.push(FallbackPlan {
        id: "s1-fallback-1".to_string(),
        trigger: "module missing".to_string(),
        reasoning: "crate root may be flat".to_string(),
        confidence: 55.0,
        action: Action::new(ActionType::AnalyzeCode, json!({"path": "lib.rs"})),
        used: false,
    });
    let done = engine
        .execute_task(Task::new("t", "Analyze").with_step(step), &TaskSession::default())
        .await;

    assert_eq!(done.status, TaskStatus::Completed);
    let step = &done.steps[0];
    assert!(step.fallbacks[0].used);
    let sources: Vec<_> = step
        .react_cycle
        .as_ref()
        .unwrap()
        .attempts
        .iter()
        .map(|a| a.source)
        .collect();
    assert_eq!(sources, vec![AttemptSource::Original, AttemptSource::Fallback]);
}

#[tokio::test]
async fn test_recover_resumes_unfinished_task() {
    let mut registry = CapabilityRegistry::new();
    let (searcher, search_calls) = ok_handler(ActionType::SearchCodebase);
    registry.register(searcher);
    let store: Arc<dyn TaskSnapshotStore> = Arc::new(SqliteSnapshotStore::in_memory().unwrap());
    let engine = engine_with(registry).with_snapshots(Arc::clone(&store));

    let mut task = Task::new("crashed", "Resume me")
        .with_step(search("s1"))
        .with_step(search("s2"));
    task.status = TaskStatus::InProgress;
    task.steps[0].status = StepStatus::Completed;
    task.steps[0].result = Some(StepResult::ok("done before crash"));
    task.steps[1].status = StepStatus::InProgress;
    store.save(&task).unwrap();
    assert_eq!(store.unfinished().unwrap(), vec!["crashed".to_string()]);

    let done = engine
        .recover("crashed", &TaskSession::default())
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(search_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        done.steps[0].result.as_ref().unwrap().message,
        "done before crash"
    );
    assert!(store.unfinished().unwrap().is_empty());
    assert!(engine.recover("missing", &TaskSession::default()).await.is_err());
}

#[tokio::test]
async fn test_pause_holds_execution_until_resume() {
    let mut registry = CapabilityRegistry::new();
    let (searcher, calls) = ok_handler(ActionType::SearchCodebase);
    registry.register(searcher);
    let engine = Arc::new(engine_with(registry));

    let control = ExecutionControl::new();
    control.pause();
    let session = TaskSession::default().with_control(control.clone());
    let runner = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            let task = Task::new("t", "Paused").with_step(search("s1"));
            engine.execute_task(task, &session).await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    control.resume();
    let done = runner.await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unparseable_plan_degrades_to_single_read_only_step() {
    let task = task_from_plan_text("here is my plan: step one, do stuff", "fix flaky test");
    assert_eq!(task.steps.len(), 1);
    assert_eq!(task.steps[0].action.action_type(), Some(ActionType::SearchCodebase));
    assert!(task.metadata.contains_key("plan_error"));

    let mut registry = CapabilityRegistry::new();
    let (searcher, _) = ok_handler(ActionType::SearchCodebase);
    registry.register(searcher);
    let done = engine_with(registry)
        .execute_task(task, &TaskSession::default())
        .await;
    assert_eq!(done.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_riskier_alternative_requires_approval() {
    let mut registry = CapabilityRegistry::new();
    let (reader, reader_calls) = failing_handler(ActionType::ReadFile, "permission denied");
    let (deleter, deleter_calls) = ok_handler(ActionType::DeleteFile);
    registry.register(reader);
    registry.register(deleter);

    let llm = Arc::new(ScriptedLlmClient::new().on(
        "self_correction",
        r#"{"action": {"type": "delete_file", "params": {"path": "config/settings.toml"}}, "reasoning": "recreate it later"}"#,
    ));
    let engine = engine_with(registry).with_collaborator(collaborator(&llm));

    let asked = Arc::new(StdMutex::new(Vec::new()));
    let (gate, mut requests) = ChannelApproval::channel();
    let seen = Arc::clone(&asked);
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            let kind = request.action.kind.clone();
            seen.lock().unwrap().push(kind.clone());
            request.respond(kind != "delete_file");
        }
    });
    let (events, mut rx) = EventSink::channel();
    let session = TaskSession::default().with_approval(gate).with_events(events);

    let step = Step::new(
        "s1",
        "Read settings",
        Action::new(ActionType::ReadFile, json!({"path": "config/settings.toml"})),
    );
    let done = engine
        .execute_task(Task::new("t", "Inspect config").with_step(step), &session)
        .await;

    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(deleter_calls.load(Ordering::SeqCst), 0);
    assert_eq!(reader_calls.load(Ordering::SeqCst), 3);
    assert_eq!(*asked.lock().unwrap(), vec!["delete_file".to_string()]);
    let sources: Vec<_> = done.steps[0]
        .react_cycle
        .as_ref()
        .unwrap()
        .attempts
        .iter()
        .map(|a| a.source)
        .collect();
    assert_eq!(
        sources,
        vec![AttemptSource::Original, AttemptSource::Retry, AttemptSource::Retry]
    );
    let events = drain(&mut rx);
    assert_eq!(count(&events, "approval_requested"), 1);
}
