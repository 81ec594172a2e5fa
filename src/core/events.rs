//! 执行事件：进度回调以事件流形式投递（fire-and-forget，不阻塞引擎）

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::StepResult;
use crate::react::{Recommendation, StuckSignal};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    StepStart {
        task_id: String,
        step_id: String,
        title: String,
        attempt_budget: u32,
    },
    StepComplete {
        task_id: String,
        step_id: String,
        result: StepResult,
        attempts: u32,
    },
    /// 只在步骤最终失败（或重试耗尽后跳过）时触发一次
    StepError {
        task_id: String,
        step_id: String,
        error: String,
        attempts: u32,
    },
    /// 单次尝试失败，next 为下一步动作来源（alternative / fallback / retry / none）
    AttemptFailed {
        task_id: String,
        step_id: String,
        attempt: u32,
        error: String,
        next: String,
    },
    TaskProgress {
        task_id: String,
        completed: usize,
        skipped: usize,
        total: usize,
    },
    TaskComplete {
        task_id: String,
    },
    TaskError {
        task_id: String,
        error: String,
    },
    ApprovalRequested {
        task_id: String,
        step_id: String,
        impact_summary: String,
    },
    Escalation {
        task_id: String,
        step_id: String,
        signal: StuckSignal,
        recommendation: Recommendation,
        guidance: Option<String>,
        count: u32,
    },
    RolledBack {
        task_id: String,
        compensated: usize,
        failures: usize,
    },
}

impl ExecutionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionEvent::StepStart { .. } => "step_start",
            ExecutionEvent::StepComplete { .. } => "step_complete",
            ExecutionEvent::StepError { .. } => "step_error",
            ExecutionEvent::AttemptFailed { .. } => "attempt_failed",
            ExecutionEvent::TaskProgress { .. } => "task_progress",
            ExecutionEvent::TaskComplete { .. } => "task_complete",
            ExecutionEvent::TaskError { .. } => "task_error",
            ExecutionEvent::ApprovalRequested { .. } => "approval_requested",
            ExecutionEvent::Escalation { .. } => "escalation",
            ExecutionEvent::RolledBack { .. } => "rolled_back",
        }
    }
}

/// 事件出口；没有订阅者时静默丢弃
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
