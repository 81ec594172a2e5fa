//! 变更与补偿动作
//!
//! 每个 Change 由外部 ChangeApplier 应用，应用时同时给出一个 Compensation（撤销该变更的补偿动作），
//! 压入事务的回滚栈。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::core::{ActionFailure, StepResult};

/// 一次待应用的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: String,
    pub description: String,
    pub action: Action,
}

impl Change {
    pub fn new(id: impl Into<String>, description: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            action,
        }
    }
}

/// 补偿动作；undo 为 None 表示该变更无需撤销（如只读动作）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Compensation {
    pub change_id: String,
    pub description: String,
    pub undo: Option<Action>,
}

/// 已应用的变更
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub change_id: String,
    pub result: StepResult,
    pub compensation: Compensation,
}

/// 变更应用方：应用变更（同时给出补偿）与执行补偿
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    async fn apply(&self, change: &Change) -> Result<AppliedChange, ActionFailure>;

    async fn compensate(&self, compensation: &Compensation) -> Result<(), String>;
}
