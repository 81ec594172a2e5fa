//! 审批门
//!
//! 需要审批的步骤执行前挂起，等待外部的布尔决定。ChannelApproval 为每个请求创建一个 oneshot，
//! 决定直接唤醒引擎（无轮询，无隐式超时）；请求被丢弃或无人监听视为拒绝。

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::actions::{Action, ActionRisk};
use crate::core::{Step, Task};

/// 审批门：返回 true 表示批准
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn request(&self, step: &Step, task: &Task, impact_summary: &str) -> bool;
}

/// 全部自动批准
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn request(&self, step: &Step, _task: &Task, _impact_summary: &str) -> bool {
        tracing::debug!(step_id = %step.id, "auto-approved");
        true
    }
}

/// 待决的审批请求
#[derive(Debug)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub step_id: String,
    pub step_title: String,
    pub action: Action,
    pub impact_summary: String,
    responder: oneshot::Sender<bool>,
}

impl ApprovalRequest {
    pub fn respond(self, approved: bool) {
        let _ = self.responder.send(approved);
    }

    pub fn approve(self) {
        self.respond(true);
    }

    pub fn deny(self) {
        self.respond(false);
    }
}

/// 通过通道把审批请求交给外部（UI、CLI、测试）
#[derive(Clone)]
pub struct ChannelApproval {
    tx: mpsc::UnboundedSender<ApprovalRequest>,
}

impl ChannelApproval {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ApprovalRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ApprovalGate for ChannelApproval {
    async fn request(&self, step: &Step, task: &Task, impact_summary: &str) -> bool {
        let (responder, decision) = oneshot::channel();
        let request = ApprovalRequest {
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            step_title: step.title.clone(),
            action: step.action.clone(),
            impact_summary: impact_summary.to_string(),
            responder,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!(step_id = %step.id, "no approval listener, treating as denied");
            return false;
        }
        decision.await.unwrap_or(false)
    }
}

/// 审批提示：风险、动作摘要、信心
pub fn impact_summary(step: &Step) -> String {
    let risk = match step.action.risk() {
        ActionRisk::ReadOnly => "read-only",
        ActionRisk::Mutating => "modifies files",
        ActionRisk::Destructive => "destructive",
    };
    let mut summary = format!("[{}] {}: {}", risk, step.title, step.action.summary());
    if let Some(c) = &step.confidence {
        summary.push_str(&format!(" (confidence {:.0}, {:?} risk)", c.score, c.risk_level));
    }
    if !step.description.is_empty() {
        summary.push_str(" - ");
        summary.push_str(&step.description);
    }
    summary
}
