//! 引擎错误类型
//!
//! ActionFailure：能力处理器或参数校验失败（单次尝试级别，可重试 / 可纠错）；
//! EngineError：任务级错误分类（审批拒绝、计划解析失败、重试耗尽、升级上限、回滚失败等）。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 单次动作执行失败（处理器拒绝、参数缺失、路径非法、权限、超时）
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionFailure {
    #[error("Unknown action type: {action}")]
    UnknownActionType { action: String },

    #[error("Missing parameter '{param}' for {action}")]
    MissingParameter { action: String, param: String },

    #[error("Unexpected parameter '{param}' for {action}")]
    UnexpectedParameter { action: String, param: String },

    #[error("Invalid parameters for {action}: {reason}")]
    InvalidParameter { action: String, reason: String },

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Permission denied: {detail}")]
    PermissionDenied { detail: String },

    #[error("Action {action} timed out after {secs}s")]
    Timeout { action: String, secs: u64 },

    #[error("No handler registered for {action}")]
    NoHandler { action: String },

    #[error("{action} failed: {reason}")]
    Handler { action: String, reason: String },
}

impl ActionFailure {
    /// 处理器内部失败的便捷构造
    pub fn handler(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Handler {
            action: action.into(),
            reason: reason.into(),
        }
    }

    /// 参数类错误：纠错时可以直接修正参数
    pub fn is_parameter_error(&self) -> bool {
        matches!(
            self,
            Self::MissingParameter { .. }
                | Self::UnexpectedParameter { .. }
                | Self::InvalidParameter { .. }
                | Self::UnknownActionType { .. }
        )
    }
}

/// 任务级错误：通过回调上报，并决定任务终态
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error(transparent)]
    Action(#[from] ActionFailure),

    /// 审批被拒绝：任务直接取消，处理器不会被调用
    #[error("Approval denied for step {step_id}")]
    ApprovalDenied { step_id: String },

    #[error("Plan parse error: {0}")]
    PlanningParse(String),

    #[error("Step {step_id} failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        step_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Escalation limit reached ({limit}) while executing step {step_id}")]
    EscalationLimitReached { step_id: String, limit: u32 },

    /// 升级后协作方建议终止
    #[error("Step {step_id} aborted after escalation: {reason}")]
    Aborted { step_id: String, reason: String },

    /// 补偿动作本身失败：只记录，不再向上升级
    #[error("Rollback of {change_id} failed: {detail}")]
    RollbackFailure { change_id: String, detail: String },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Reasoning collaborator error: {0}")]
    Collaborator(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}
