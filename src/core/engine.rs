//! 执行引擎：步骤主循环
//!
//! 严格按顺序执行步骤；审批挂起、暂停/取消只在步骤边界检查。单步失败时先自我纠错，
//! 再尝试预生成的回退方案，最后按退避策略原样重试；所有尝试共享同一重试预算。
//! 任务失败时逆序回放本次执行中已提交变更的补偿动作（尽力而为）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::actions::Action;
use crate::core::{
    impact_summary, EngineError, ExecutionEvent, RetryPolicy, Step, StepResult, StepStatus,
    Task, TaskSession, TaskStatus,
};
use crate::llm::Collaborator;
use crate::memory::{ProblemSignature, StrategyMatch, StrategyMemory, TaskSnapshotStore};
use crate::planning::ConfidencePlanner;
use crate::react::{
    request_guidance, AttemptRecord, AttemptSource, Correction, CorrectionContext, Escalation,
    MetacognitionConfig, MetacognitiveMonitor, ReactCycle, ReactRunner, Recommendation,
    SelfCorrector, StuckSignal,
};
use crate::transaction::{
    linked_groups, unwind, Change, ChangeApplier, Compensation, Transaction, TransactionError,
};

/// 引擎特性开关
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 每步包裹 Thought / Observe / Reflect
    pub react_enabled: bool,
    /// 执行前做信心评估并生成回退方案
    pub confidence_enabled: bool,
    /// 成功后写入策略记忆
    pub learning_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            react_enabled: true,
            confidence_enabled: true,
            learning_enabled: true,
        }
    }
}

/// 单次执行的可变状态：元认知计时器与已提交变更的补偿日志
struct RunState {
    monitor: MetacognitiveMonitor,
    committed: Vec<Compensation>,
}

impl RunState {
    fn new(config: MetacognitionConfig) -> Self {
        Self {
            monitor: MetacognitiveMonitor::new(config),
            committed: Vec::new(),
        }
    }
}

/// 步骤（或修订组）的结局
enum StepOutcome {
    Completed,
    Skipped,
    Failed(EngineError),
    Cancelled(EngineError),
}

/// 升级或求助后中止尝试循环
enum Halt {
    /// 任务失败（升级上限、协作方建议终止）
    Fail(EngineError),
    /// 任务取消（求助被拒、外部取消）
    Cancel(EngineError),
}

enum AttemptEnd<T> {
    Success(T),
    Exhausted(String),
    Halted(Halt),
}

pub struct ExecutionEngine {
    applier: Arc<dyn ChangeApplier>,
    collaborator: Option<Arc<Collaborator>>,
    memory: Arc<Mutex<StrategyMemory>>,
    snapshots: Option<Arc<dyn TaskSnapshotStore>>,
    retry: RetryPolicy,
    metacognition: MetacognitionConfig,
    config: EngineConfig,
    capabilities: String,
    workspace_root: Option<std::path::PathBuf>,
}

impl ExecutionEngine {
    pub fn new(applier: Arc<dyn ChangeApplier>, memory: Arc<Mutex<StrategyMemory>>) -> Self {
        Self {
            applier,
            collaborator: None,
            memory,
            snapshots: None,
            retry: RetryPolicy::default(),
            metacognition: MetacognitionConfig::default(),
            config: EngineConfig::default(),
            capabilities: String::new(),
            workspace_root: None,
        }
    }

    pub fn with_collaborator(mut self, collaborator: Arc<Collaborator>) -> Self {
        self.collaborator = Some(collaborator);
        self
    }

    pub fn with_snapshots(mut self, store: Arc<dyn TaskSnapshotStore>) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn with_metacognition(mut self, config: MetacognitionConfig) -> Self {
        self.metacognition = config;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 可用能力描述，随纠错请求一并发给协作方
    pub fn with_capabilities(mut self, description: impl Into<String>) -> Self {
        self.capabilities = description.into();
        self
    }

    /// 目标存在性启发式的基准目录
    pub fn with_workspace_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    pub fn memory(&self) -> Arc<Mutex<StrategyMemory>> {
        Arc::clone(&self.memory)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn planner(&self) -> ConfidencePlanner {
        ConfidencePlanner::new(self.collaborator.clone(), self.workspace_root.clone())
    }

    fn corrector(&self) -> SelfCorrector {
        SelfCorrector::new(self.collaborator.clone(), self.capabilities.clone())
    }

    fn react(&self) -> ReactRunner {
        ReactRunner::new(self.collaborator.clone())
    }

    /// 执行任务直到终态（completed / failed / cancelled）
    ///
    /// 本次执行消耗的协作方 token 写入 metadata["token_usage"]。
    pub async fn execute_task(&self, task: Task, session: &TaskSession) -> Task {
        let before = self.token_usage();
        let mut task = self.run_task(task, session).await;
        let (prompt, completion, total) = self.token_usage();
        let used = (
            prompt.saturating_sub(before.0),
            completion.saturating_sub(before.1),
            total.saturating_sub(before.2),
        );
        if used.2 > 0 {
            info!(
                task_id = %task.id,
                prompt_tokens = used.0,
                completion_tokens = used.1,
                total_tokens = used.2,
                "collaborator token usage"
            );
            task.metadata.insert(
                "token_usage".to_string(),
                json!({
                    "prompt_tokens": used.0,
                    "completion_tokens": used.1,
                    "total_tokens": used.2,
                }),
            );
            self.snapshot(&task);
        }
        task
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.collaborator
            .as_ref()
            .map_or((0, 0, 0), |c| c.token_usage())
    }

    async fn run_task(&self, mut task: Task, session: &TaskSession) -> Task {
        if task.status.is_terminal() {
            warn!(task_id = %task.id, status = task.status.as_str(), "task already terminal, not executing");
            return task;
        }
        if task.steps.is_empty() {
            info!(task_id = %task.id, "task has no steps, completed immediately");
            task.status = TaskStatus::Completed;
            self.snapshot(&task);
            session.events.send(ExecutionEvent::TaskComplete {
                task_id: task.id.clone(),
            });
            return task;
        }

        task.status = TaskStatus::InProgress;
        info!(task_id = %task.id, steps = task.steps.len(), "task started");

        if self.config.confidence_enabled && task.insights.is_none() {
            self.annotate(&mut task).await;
        }

        let groups = linked_groups(&task.steps);
        let mut group_of: HashMap<usize, usize> = HashMap::new();
        for (g, members) in groups.iter().enumerate() {
            for &m in members {
                group_of.insert(m, g);
            }
        }

        let mut run = RunState::new(self.metacognition.clone());
        self.snapshot(&task);

        for idx in 0..task.steps.len() {
            if !session.control.wait_if_paused().await || session.control.is_cancelled() {
                return self.finish_cancelled(task, EngineError::Cancelled, session);
            }
            if task.steps[idx].status.is_settled() {
                continue;
            }
            let outcome = match group_of.get(&idx).map(|&g| &groups[g]) {
                Some(members) if members[0] == idx => {
                    self.run_group(&mut task, members, session, &mut run).await
                }
                Some(_) => continue,
                None => self.run_step(&mut task, idx, session, &mut run).await,
            };
            match outcome {
                StepOutcome::Completed | StepOutcome::Skipped => {
                    let progress = task.progress();
                    session.events.send(ExecutionEvent::TaskProgress {
                        task_id: task.id.clone(),
                        completed: progress.completed,
                        skipped: progress.skipped,
                        total: progress.total,
                    });
                    self.snapshot(&task);
                }
                StepOutcome::Failed(err) => {
                    return self.finish_failed(task, err, session, run).await;
                }
                StepOutcome::Cancelled(err) => return self.finish_cancelled(task, err, session),
            }
        }

        task.status = TaskStatus::Completed;
        task.error = None;
        let progress = task.progress();
        info!(
            task_id = %task.id,
            completed = progress.completed,
            skipped = progress.skipped,
            "task completed"
        );
        self.snapshot(&task);
        session.events.send(ExecutionEvent::TaskComplete {
            task_id: task.id.clone(),
        });
        task
    }

    /// 从快照恢复未完成的任务：已完成 / 已跳过的步骤不再执行
    pub async fn recover(&self, task_id: &str, session: &TaskSession) -> Result<Task, EngineError> {
        let store = self
            .snapshots
            .as_ref()
            .ok_or_else(|| EngineError::Persistence("no snapshot store configured".to_string()))?;
        let mut task = store
            .load(task_id)?
            .ok_or_else(|| EngineError::Persistence(format!("no snapshot for task {}", task_id)))?;
        if task.status.is_terminal() {
            info!(task_id, status = task.status.as_str(), "snapshot is terminal, nothing to recover");
            return Ok(task);
        }
        for step in task.steps.iter_mut() {
            if matches!(step.status, StepStatus::InProgress | StepStatus::AwaitingApproval) {
                step.status = StepStatus::Pending;
            }
        }
        let progress = task.progress();
        info!(
            task_id,
            completed = progress.completed,
            total = progress.total,
            "recovering task from snapshot"
        );
        Ok(self.execute_task(task, session).await)
    }

    async fn annotate(&self, task: &mut Task) {
        let matches: Vec<Vec<StrategyMatch>> = {
            let memory = self.memory.lock().await;
            task.steps
                .iter()
                .map(|s| memory.query(&ProblemSignature::for_step(s, task)))
                .collect()
        };
        let insights = self.planner().annotate(task, &matches).await;
        info!(
            task_id = %task.id,
            overall_confidence = insights.overall_confidence,
            memory_backed = insights.memory_backed_steps,
            fallbacks = insights.fallback_count,
            high_risk = insights.high_risk_steps,
            "plan annotated"
        );
    }

    /// 为 members 中需要审批的步骤依次请求审批；返回 Some 表示任务应当取消
    async fn approve(
        &self,
        task: &mut Task,
        members: &[usize],
        session: &TaskSession,
    ) -> Option<StepOutcome> {
        for &idx in members {
            let step = &task.steps[idx];
            if !step.requires_approval || step.status == StepStatus::Approved {
                continue;
            }
            let summary = impact_summary(step);
            let step_id = step.id.clone();
            task.steps[idx].status = StepStatus::AwaitingApproval;
            task.status = TaskStatus::AwaitingApproval;
            info!(task_id = %task.id, step_id = %step_id, "awaiting approval");
            self.snapshot(task);
            session.events.send(ExecutionEvent::ApprovalRequested {
                task_id: task.id.clone(),
                step_id: step_id.clone(),
                impact_summary: summary.clone(),
            });

            let step = task.steps[idx].clone();
            let cancel = session.control.token();
            let decision = tokio::select! {
                approved = session.approval.request(&step, task, &summary) => Some(approved),
                _ = cancel.cancelled() => None,
            };
            task.status = TaskStatus::InProgress;
            match decision {
                Some(true) => {
                    info!(task_id = %task.id, step_id = %step_id, "step approved");
                    task.steps[idx].status = StepStatus::Approved;
                }
                Some(false) => {
                    warn!(task_id = %task.id, step_id = %step_id, "step rejected");
                    let err = EngineError::ApprovalDenied { step_id };
                    task.steps[idx].status = StepStatus::Rejected;
                    task.steps[idx].error = Some(err.to_string());
                    return Some(StepOutcome::Cancelled(err));
                }
                None => {
                    task.steps[idx].status = StepStatus::Pending;
                    return Some(StepOutcome::Cancelled(EngineError::Cancelled));
                }
            }
        }
        None
    }

    async fn run_step(
        &self,
        task: &mut Task,
        idx: usize,
        session: &TaskSession,
        run: &mut RunState,
    ) -> StepOutcome {
        if let Some(outcome) = self.approve(task, &[idx], session).await {
            return outcome;
        }

        let task_id = task.id.clone();
        let step_id = task.steps[idx].id.clone();
        let budget = task.steps[idx].attempt_budget();
        let signature = ProblemSignature::for_step(&task.steps[idx], task);
        let hint = self.memory.lock().await.query(&signature).into_iter().next();

        {
            let step = &mut task.steps[idx];
            step.status = StepStatus::InProgress;
            step.error = None;
            step.result = None;
        }
        info!(task_id = %task_id, step_id = %step_id, budget, "step started");
        session.events.send(ExecutionEvent::StepStart {
            task_id: task_id.clone(),
            step_id: step_id.clone(),
            title: task.steps[idx].title.clone(),
            attempt_budget: budget,
        });
        run.monitor.step_started(&step_id);

        let react = self.react();
        let mut cycle = if self.config.react_enabled {
            let number = task.steps[idx]
                .react_cycle
                .as_ref()
                .map_or(1, |c| c.cycle_number + 1);
            let thought = react.think(&task.steps[idx], task, hint.as_ref()).await;
            debug!(task_id = %task_id, step_id = %step_id, confidence = thought.confidence, "thought");
            Some(ReactCycle::new(number, thought))
        } else {
            None
        };

        let mut current = task.steps[idx].action.clone();
        let mut source = AttemptSource::Original;
        let mut tried: Vec<Action> = Vec::new();
        let mut guidance: Option<String> = None;
        let mut literal_only = false;
        let mut attempt = 0u32;

        let end = loop {
            attempt += 1;
            let started = Instant::now();
            let outcome = self.apply_once(&step_id, attempt, &current, run).await;
            if let Some(c) = cycle.as_mut() {
                c.record(AttemptRecord {
                    attempt,
                    source,
                    action: current.clone(),
                    success: outcome.is_ok(),
                    error: outcome.as_ref().err().map(|e| e.to_string()),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
            }
            tried.push(current.clone());

            let error = match outcome {
                Ok(result) => {
                    run.monitor.record_success();
                    break AttemptEnd::Success(result);
                }
                Err(e) => e.to_string(),
            };
            warn!(task_id = %task_id, step_id = %step_id, attempt, error = %error, "attempt failed");

            if let Some(signal) = run.monitor.record_failure(&step_id, &error) {
                match self.escalate(task, idx, signal, &error, session, run).await {
                    Ok(escalation) => {
                        literal_only = escalation.recommendation == Recommendation::Retry;
                        if escalation.guidance.is_some() {
                            guidance = escalation.guidance;
                        }
                    }
                    Err(halt) => break AttemptEnd::Halted(halt),
                }
            }

            if attempt >= budget {
                break AttemptEnd::Exhausted(error);
            }
            if session.control.is_cancelled() {
                break AttemptEnd::Halted(Halt::Cancel(EngineError::Cancelled));
            }

            task.steps[idx].retry_count += 1;
            let (mut next, mut next_source) = self
                .next_action(task, idx, &current, &error, &tried, guidance.as_deref(), literal_only)
                .await;
            literal_only = false;
            if next_source != AttemptSource::Retry
                && needs_substitute_approval(&task.steps[idx], &next)
            {
                match self.approve_substitute(task, idx, &next, session).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tried.push(next);
                        next = task.steps[idx].action.clone();
                        next_source = AttemptSource::Retry;
                    }
                    Err(halt) => break AttemptEnd::Halted(halt),
                }
            }
            session.events.send(ExecutionEvent::AttemptFailed {
                task_id: task_id.clone(),
                step_id: step_id.clone(),
                attempt,
                error,
                next: source_label(next_source).to_string(),
            });
            if next_source == AttemptSource::Retry {
                let delay = self.retry.delay_for(task.steps[idx].retry_count);
                if !delay.is_zero() {
                    debug!(task_id = %task_id, step_id = %step_id, delay_ms = delay.as_millis() as u64, "backing off before retry");
                    tokio::time::sleep(delay).await;
                }
            }
            current = next;
            source = next_source;
        };

        match end {
            AttemptEnd::Success(result) => {
                if let Some(mut c) = cycle.take() {
                    c.succeeded = true;
                    c.observation = Some(react.observe(&c, Ok(&result)));
                    c.reflection = Some(react.reflect(&task.steps[idx], &c).await);
                    task.steps[idx].react_cycle = Some(c);
                }
                let approach = task.steps[idx]
                    .react_cycle
                    .as_ref()
                    .and_then(|c| c.reflection.as_ref())
                    .map(|r| r.knowledge_gained.clone())
                    .filter(|k| !k.trim().is_empty());
                self.learn(task, idx, &current, attempt, approach).await;

                let step = &mut task.steps[idx];
                step.status = StepStatus::Completed;
                step.result = Some(result.clone());
                info!(task_id = %task_id, step_id = %step_id, attempts = attempt, "step completed");
                session.events.send(ExecutionEvent::StepComplete {
                    task_id,
                    step_id,
                    result,
                    attempts: attempt,
                });
                StepOutcome::Completed
            }
            AttemptEnd::Exhausted(last_error) => {
                self.close_failed_cycle(&react, task, idx, cycle, &last_error).await;
                self.penalize(&signature, hint.as_ref()).await;
                let err = EngineError::RetryExhausted {
                    step_id: step_id.clone(),
                    attempts: attempt,
                    last_error,
                };
                self.settle_failure(task, &[idx], &err, attempt, session, true)
            }
            AttemptEnd::Halted(Halt::Fail(err)) => {
                self.close_failed_cycle(&react, task, idx, cycle, &err.to_string())
                    .await;
                self.penalize(&signature, hint.as_ref()).await;
                self.settle_failure(task, &[idx], &err, attempt, session, false)
            }
            AttemptEnd::Halted(Halt::Cancel(err)) => {
                if let Some(mut c) = cycle.take() {
                    let message = err.to_string();
                    c.observation = Some(react.observe(&c, Err(message.as_str())));
                    task.steps[idx].react_cycle = Some(c);
                }
                let step = &mut task.steps[idx];
                step.status = StepStatus::Rejected;
                step.error = Some(err.to_string());
                StepOutcome::Cancelled(err)
            }
        }
    }

    /// 修订组：所有成员在同一事务中应用，任一失败整组回滚；只做原样重试
    async fn run_group(
        &self,
        task: &mut Task,
        members: &[usize],
        session: &TaskSession,
        run: &mut RunState,
    ) -> StepOutcome {
        if let Some(outcome) = self.approve(task, members, session).await {
            return outcome;
        }

        let task_id = task.id.clone();
        let ids: Vec<String> = members.iter().map(|&i| task.steps[i].id.clone()).collect();
        let leader = ids[0].clone();
        let budget = members
            .iter()
            .map(|&i| task.steps[i].attempt_budget())
            .min()
            .unwrap_or(1);
        info!(task_id = %task_id, group = ?ids, budget, "executing amendment group atomically");

        for &idx in members {
            let step = &mut task.steps[idx];
            step.status = StepStatus::InProgress;
            step.error = None;
            step.result = None;
            session.events.send(ExecutionEvent::StepStart {
                task_id: task_id.clone(),
                step_id: step.id.clone(),
                title: step.title.clone(),
                attempt_budget: budget,
            });
        }
        run.monitor.step_started(&leader);

        let mut attempt = 0u32;
        let end = loop {
            attempt += 1;
            let mut tx = Transaction::begin();
            let mut results = Vec::with_capacity(members.len());
            let mut failure = None;
            for &idx in members {
                let step = &task.steps[idx];
                let change = Change::new(
                    format!("{}#{}", step.id, attempt),
                    step.title.clone(),
                    step.action.clone(),
                );
                match tx.apply(self.applier.as_ref(), &change).await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        failure = Some(format!("{}: {}", step.id, transaction_error(e)));
                        break;
                    }
                }
            }
            let failure = match failure {
                Some(f) => Some(f),
                None => tx.commit().err().map(|e| transaction_error(e).to_string()),
            };
            let Some(error) = failure else {
                run.committed.extend(tx.compensations().iter().cloned());
                run.monitor.record_success();
                break AttemptEnd::Success(results);
            };

            let report = tx.rollback(self.applier.as_ref()).await;
            if !report.is_clean() {
                warn!(task_id = %task_id, failures = report.failures.len(), "group rollback incomplete");
            }
            warn!(task_id = %task_id, step_id = %leader, attempt, error = %error, "amendment group attempt failed");

            if let Some(signal) = run.monitor.record_failure(&leader, &error) {
                if let Err(halt) = self.escalate(task, members[0], signal, &error, session, run).await {
                    break AttemptEnd::Halted(halt);
                }
            }
            if attempt >= budget {
                break AttemptEnd::Exhausted(error);
            }
            if session.control.is_cancelled() {
                break AttemptEnd::Halted(Halt::Cancel(EngineError::Cancelled));
            }
            for &idx in members {
                task.steps[idx].retry_count += 1;
            }
            session.events.send(ExecutionEvent::AttemptFailed {
                task_id: task_id.clone(),
                step_id: leader.clone(),
                attempt,
                error,
                next: source_label(AttemptSource::Retry).to_string(),
            });
            let delay = self.retry.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        };

        match end {
            AttemptEnd::Success(results) => {
                for (&idx, result) in members.iter().zip(results) {
                    let action = task.steps[idx].action.clone();
                    self.learn(task, idx, &action, attempt, None).await;
                    let step = &mut task.steps[idx];
                    step.status = StepStatus::Completed;
                    step.result = Some(result.clone());
                    session.events.send(ExecutionEvent::StepComplete {
                        task_id: task_id.clone(),
                        step_id: step.id.clone(),
                        result,
                        attempts: attempt,
                    });
                }
                info!(task_id = %task_id, group = ?ids, attempts = attempt, "amendment group committed");
                StepOutcome::Completed
            }
            AttemptEnd::Exhausted(last_error) => {
                let err = EngineError::RetryExhausted {
                    step_id: ids.join(","),
                    attempts: attempt,
                    last_error,
                };
                self.settle_failure(task, members, &err, attempt, session, true)
            }
            AttemptEnd::Halted(Halt::Fail(err)) => {
                self.settle_failure(task, members, &err, attempt, session, false)
            }
            AttemptEnd::Halted(Halt::Cancel(err)) => {
                for &idx in members {
                    task.steps[idx].status = StepStatus::Rejected;
                    task.steps[idx].error = Some(err.to_string());
                }
                StepOutcome::Cancelled(err)
            }
        }
    }

    /// 单次尝试在独立事务中执行；成功则把补偿动作并入任务级回滚日志
    async fn apply_once(
        &self,
        step_id: &str,
        attempt: u32,
        action: &Action,
        run: &mut RunState,
    ) -> Result<StepResult, EngineError> {
        let change = Change::new(format!("{}#{}", step_id, attempt), step_id, action.clone());
        let mut tx = Transaction::begin();
        let result = tx
            .apply(self.applier.as_ref(), &change)
            .await
            .map_err(transaction_error)?;
        tx.commit().map_err(transaction_error)?;
        run.committed.extend(tx.compensations().iter().cloned());
        Ok(result)
    }

    /// 下一次尝试的动作：纠错备选 > 未用过的回退方案 > 原样重试
    #[allow(clippy::too_many_arguments)]
    async fn next_action(
        &self,
        task: &mut Task,
        idx: usize,
        failed: &Action,
        error: &str,
        tried: &[Action],
        guidance: Option<&str>,
        literal_only: bool,
    ) -> (Action, AttemptSource) {
        if !literal_only {
            let step = &task.steps[idx];
            let ctx = CorrectionContext {
                failed_action: failed.clone(),
                error: error.to_string(),
                step_title: step.title.clone(),
                step_description: step.description.clone(),
                task_context: task.context_summary(),
                guidance: guidance.map(str::to_string),
                previous_attempts: tried.to_vec(),
            };
            match self.corrector().propose(&ctx).await {
                Correction::Alternative { action, reasoning } => {
                    info!(task_id = %task.id, step_id = %step.id, action = %action.summary(), reasoning = %reasoning, "self-correction proposed alternative");
                    return (action, AttemptSource::Correction);
                }
                Correction::NoBetterAlternative { reasoning } => {
                    debug!(task_id = %task.id, step_id = %step.id, reasoning = %reasoning, "no better alternative");
                }
                Correction::Rejected { reason } => {
                    debug!(task_id = %task.id, step_id = %step.id, reason = %reason, "correction rejected");
                }
                Correction::Unavailable => {}
            }

            let task_id = task.id.clone();
            let step = &mut task.steps[idx];
            if let Some(fallback) = step
                .fallbacks
                .iter_mut()
                .find(|f| !f.used && !tried.contains(&f.action))
            {
                fallback.used = true;
                info!(task_id = %task_id, step_id = %step.id, fallback_id = %fallback.id, "trying fallback plan");
                return (fallback.action.clone(), AttemptSource::Fallback);
            }
        }
        (task.steps[idx].action.clone(), AttemptSource::Retry)
    }

    /// 替代动作审批；拒绝时返回 false，由调用方改为字面重试
    async fn approve_substitute(
        &self,
        task: &Task,
        idx: usize,
        substitute: &Action,
        session: &TaskSession,
    ) -> Result<bool, Halt> {
        let mut proposed = task.steps[idx].clone();
        proposed.action = substitute.clone();
        let summary = format!(
            "Replacement for failed action {}: {}",
            task.steps[idx].action.summary(),
            impact_summary(&proposed)
        );
        info!(task_id = %task.id, step_id = %proposed.id, action = %substitute.summary(), "awaiting approval for replacement action");
        session.events.send(ExecutionEvent::ApprovalRequested {
            task_id: task.id.clone(),
            step_id: proposed.id.clone(),
            impact_summary: summary.clone(),
        });
        let cancel = session.control.token();
        let decision = tokio::select! {
            approved = session.approval.request(&proposed, task, &summary) => Some(approved),
            _ = cancel.cancelled() => None,
        };
        match decision {
            Some(approved) => {
                if !approved {
                    warn!(task_id = %task.id, step_id = %proposed.id, action = %substitute.summary(), "replacement action rejected");
                }
                Ok(approved)
            }
            None => Err(Halt::Cancel(EngineError::Cancelled)),
        }
    }

    /// 卡住信号升级：受每任务上限约束；协作方的建议决定后续走向
    async fn escalate(
        &self,
        task: &Task,
        idx: usize,
        signal: StuckSignal,
        error: &str,
        session: &TaskSession,
        run: &mut RunState,
    ) -> Result<Escalation, Halt> {
        let step = &task.steps[idx];
        warn!(
            task_id = %task.id,
            step_id = %step.id,
            kind = ?signal.kind,
            evidence = %signal.evidence,
            "stuck signal detected"
        );
        let Some(count) = run.monitor.try_escalate() else {
            let limit = run.monitor.config().max_escalations;
            warn!(task_id = %task.id, step_id = %step.id, limit, "escalation limit reached");
            return Err(Halt::Fail(EngineError::EscalationLimitReached {
                step_id: step.id.clone(),
                limit,
            }));
        };

        let context = json!({
            "task": task.context_summary(),
            "step": { "id": step.id, "title": step.title, "description": step.description },
            "action": step.action,
            "last_error": error,
            "attempts": step.retry_count + 1,
            "escalations": count,
        });
        let escalation = request_guidance(self.collaborator.as_ref(), signal, context, count).await;
        info!(
            task_id = %task.id,
            step_id = %step.id,
            count,
            recommendation = escalation.recommendation.as_str(),
            "escalated"
        );
        session.events.send(ExecutionEvent::Escalation {
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            signal: escalation.signal.clone(),
            recommendation: escalation.recommendation,
            guidance: escalation.guidance.clone(),
            count,
        });

        match escalation.recommendation {
            Recommendation::Abort => Err(Halt::Fail(EngineError::Aborted {
                step_id: step.id.clone(),
                reason: escalation
                    .guidance
                    .clone()
                    .unwrap_or_else(|| escalation.signal.evidence.clone()),
            })),
            Recommendation::SeekHelp => {
                let mut summary = format!(
                    "Execution is stuck on '{}': {}.",
                    step.title, escalation.signal.evidence
                );
                if let Some(g) = &escalation.guidance {
                    summary.push_str(&format!(" Suggested: {}.", g));
                }
                summary.push_str(" Continue retrying?");
                session.events.send(ExecutionEvent::ApprovalRequested {
                    task_id: task.id.clone(),
                    step_id: step.id.clone(),
                    impact_summary: summary.clone(),
                });
                let cancel = session.control.token();
                let decision = tokio::select! {
                    approved = session.approval.request(step, task, &summary) => Some(approved),
                    _ = cancel.cancelled() => None,
                };
                match decision {
                    Some(true) => Ok(escalation),
                    Some(false) => Err(Halt::Cancel(EngineError::ApprovalDenied {
                        step_id: step.id.clone(),
                    })),
                    None => Err(Halt::Cancel(EngineError::Cancelled)),
                }
            }
            Recommendation::Retry | Recommendation::Alternative => Ok(escalation),
        }
    }

    async fn close_failed_cycle(
        &self,
        react: &ReactRunner,
        task: &mut Task,
        idx: usize,
        cycle: Option<ReactCycle>,
        error: &str,
    ) {
        let Some(mut c) = cycle else {
            return;
        };
        c.succeeded = false;
        c.observation = Some(react.observe(&c, Err(error)));
        c.reflection = Some(react.reflect(&task.steps[idx], &c).await);
        task.steps[idx].react_cycle = Some(c);
    }

    /// 步骤最终失败：StepError 每个步骤只触发一次；可跳过的步骤在重试耗尽后转为 skipped
    fn settle_failure(
        &self,
        task: &mut Task,
        members: &[usize],
        err: &EngineError,
        attempts: u32,
        session: &TaskSession,
        exhausted: bool,
    ) -> StepOutcome {
        let skip = exhausted && members.iter().all(|&i| task.steps[i].skippable);
        for &idx in members {
            let step = &mut task.steps[idx];
            step.error = Some(err.to_string());
            if skip {
                step.status = StepStatus::Skipped;
                step.result = Some(StepResult::skipped(format!(
                    "skipped after {} attempts",
                    attempts
                )));
            } else {
                step.status = StepStatus::Failed;
                step.result = Some(StepResult::failed(err.to_string()));
            }
            session.events.send(ExecutionEvent::StepError {
                task_id: task.id.clone(),
                step_id: step.id.clone(),
                error: err.to_string(),
                attempts,
            });
        }
        if skip {
            warn!(task_id = %task.id, error = %err, "skippable step exhausted retries, skipped");
            StepOutcome::Skipped
        } else {
            warn!(task_id = %task.id, error = %err, "step failed");
            StepOutcome::Failed(err.clone())
        }
    }

    async fn finish_failed(
        &self,
        mut task: Task,
        err: EngineError,
        session: &TaskSession,
        run: RunState,
    ) -> Task {
        task.status = TaskStatus::Failed;
        task.error = Some(err.to_string());
        warn!(task_id = %task.id, error = %err, "task failed");

        if !run.committed.is_empty() {
            let total = run.committed.len();
            let report = unwind(self.applier.as_ref(), run.committed).await;
            info!(
                task_id = %task.id,
                compensated = report.compensated.len(),
                failures = report.failures.len(),
                total,
                "rolled back committed changes"
            );
            task.metadata.insert(
                "rollback".to_string(),
                json!({
                    "compensated": report.compensated,
                    "failures": report.failures.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
                }),
            );
            session.events.send(ExecutionEvent::RolledBack {
                task_id: task.id.clone(),
                compensated: report.compensated.len(),
                failures: report.failures.len(),
            });
        }

        self.snapshot(&task);
        session.events.send(ExecutionEvent::TaskError {
            task_id: task.id.clone(),
            error: err.to_string(),
        });
        task
    }

    fn finish_cancelled(&self, mut task: Task, err: EngineError, session: &TaskSession) -> Task {
        task.status = TaskStatus::Cancelled;
        task.error = Some(err.to_string());
        info!(task_id = %task.id, reason = %err, "task cancelled");
        self.snapshot(&task);
        session.events.send(ExecutionEvent::TaskError {
            task_id: task.id.clone(),
            error: err.to_string(),
        });
        task
    }

    async fn learn(
        &self,
        task: &Task,
        idx: usize,
        action: &Action,
        attempts: u32,
        approach: Option<String>,
    ) {
        if !self.config.learning_enabled {
            return;
        }
        let step = &task.steps[idx];
        let signature = ProblemSignature::for_step(step, task);
        let approach =
            approach.unwrap_or_else(|| format!("{} via {}", step.title, action.summary()));
        let rate = 1.0 / attempts.max(1) as f64;
        let evicted =
            self.memory
                .lock()
                .await
                .record_success(signature, approach, Some(action.clone()), rate);
        if !evicted.is_empty() {
            debug!(task_id = %task.id, evicted = evicted.len(), "strategy memory pruned");
        }
    }

    /// 只惩罚与本步骤签名完全相同的模式；相似但不同的模式不受影响
    async fn penalize(&self, signature: &ProblemSignature, hint: Option<&StrategyMatch>) {
        if !self.config.learning_enabled {
            return;
        }
        if let Some(m) = hint.filter(|m| m.pattern.key() == signature.key()) {
            self.memory.lock().await.penalize(&m.pattern.signature);
        }
    }

    fn snapshot(&self, task: &Task) {
        if let Some(store) = &self.snapshots {
            if let Err(e) = store.save(task) {
                warn!(task_id = %task.id, error = %e, "failed to snapshot task");
            }
        }
    }
}

/// 替代动作风险高于原动作，或步骤本身需要审批
fn needs_substitute_approval(step: &Step, substitute: &Action) -> bool {
    step.requires_approval || substitute.risk() > step.action.risk()
}

fn transaction_error(e: TransactionError) -> EngineError {
    match e {
        TransactionError::Change(f) => EngineError::Action(f),
        other => EngineError::Action(crate::core::ActionFailure::handler(
            "transaction",
            other.to_string(),
        )),
    }
}

fn source_label(source: AttemptSource) -> &'static str {
    match source {
        AttemptSource::Original => "original",
        AttemptSource::Retry => "retry",
        AttemptSource::Correction => "alternative",
        AttemptSource::Fallback => "fallback",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{
        ActionCall, ActionDispatcher, ActionType, CapabilityHandler, CapabilityRegistry,
    };
    use crate::core::{ActionFailure, EventSink, Step};
    use crate::memory::StrategyMemoryConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 fail_times 次调用失败的 search_codebase 处理器
    struct FlakySearch {
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    #[async_trait]
    impl CapabilityHandler for FlakySearch {
        fn action_type(&self) -> ActionType {
            ActionType::SearchCodebase
        }
        fn description(&self) -> &str {
            "flaky search"
        }
        async fn execute(&self, _call: &ActionCall) -> Result<StepResult, ActionFailure> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_times {
                Err(ActionFailure::handler("search_codebase", format!("index busy {}", n)))
            } else {
                Ok(StepResult::ok("found"))
            }
        }
    }

    fn engine(fail_times: u32) -> (ExecutionEngine, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = CapabilityRegistry::new();
        registry.register(FlakySearch {
            calls: Arc::clone(&calls),
            fail_times,
        });
        let dispatcher = ActionDispatcher::new(registry, 5);
        let memory = Arc::new(Mutex::new(StrategyMemory::in_memory(
            StrategyMemoryConfig::default(),
        )));
        let engine = ExecutionEngine::new(Arc::new(dispatcher), memory)
            .with_retry_policy(RetryPolicy::immediate());
        (engine, calls)
    }

    fn search_step(id: &str) -> Step {
        Step::new(
            id,
            "Search",
            Action::new(ActionType::SearchCodebase, json!({"query": "fn main"})),
        )
    }

    #[tokio::test]
    async fn test_literal_retry_recovers() {
        let (engine, calls) = engine(1);
        let task = Task::new("t1", "demo").with_step(search_step("s1"));
        let done = engine.execute_task(task, &TaskSession::default()).await;
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let step = &done.steps[0];
        assert_eq!(step.retry_count, 1);
        let cycle = step.react_cycle.as_ref().unwrap();
        assert!(cycle.recovered());
        assert_eq!(cycle.attempts[1].source, AttemptSource::Retry);
    }

    #[tokio::test]
    async fn test_success_is_learned() {
        let (engine, _) = engine(0);
        let task = Task::new("t1", "demo").with_step(search_step("s1"));
        engine.execute_task(task, &TaskSession::default()).await;
        assert_eq!(engine.memory().lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_learning_disabled_keeps_memory_empty() {
        let (engine, _) = engine(0);
        let engine = engine.with_config(EngineConfig {
            learning_enabled: false,
            ..EngineConfig::default()
        });
        let task = Task::new("t1", "demo").with_step(search_step("s1"));
        engine.execute_task(task, &TaskSession::default()).await;
        assert!(engine.memory().lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_task_is_returned_untouched() {
        let (engine, calls) = engine(0);
        let mut task = Task::new("t1", "demo").with_step(search_step("s1"));
        task.status = TaskStatus::Cancelled;
        let done = engine.execute_task(task, &TaskSession::default()).await;
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let (engine, calls) = engine(0);
        let (events, mut rx) = EventSink::channel();
        let session = TaskSession::default().with_events(events);
        session.control.cancel();
        let task = Task::new("t1", "demo").with_step(search_step("s1"));
        let done = engine.execute_task(task, &session).await;
        assert_eq!(done.status, TaskStatus::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let mut names = Vec::new();
        while let Ok(e) = rx.try_recv() {
            names.push(e.name());
        }
        assert_eq!(names, vec!["task_error"]);
    }

    #[tokio::test]
    async fn test_failure_only_penalizes_its_own_pattern() {
        let (engine, _) = engine(u32::MAX);
        let related = ProblemSignature::new("Search index", "search_codebase", "demo");
        engine
            .memory()
            .lock()
            .await
            .record_success(related.clone(), "rebuild the index first", None, 1.0);

        let task = Task::new("t1", "demo").with_step(search_step("s1"));
        let done = engine.execute_task(task, &TaskSession::default()).await;
        assert_eq!(done.status, TaskStatus::Failed);

        let memory = engine.memory();
        let memory = memory.lock().await;
        assert_eq!(memory.get(&related).unwrap().success_rate, 1.0);
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(source_label(AttemptSource::Correction), "alternative");
        assert_eq!(source_label(AttemptSource::Retry), "retry");
    }
}
