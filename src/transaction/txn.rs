//! 事务：一组必须同时成功或同时失败的变更
//!
//! begin() 创建 in_progress 事务；apply() 委托给 ChangeApplier 并把补偿动作压栈；
//! commit() 仅在全部变更成功时成立；rollback() 严格逆序回放补偿栈，
//! 单个补偿失败只记录并跳过，不会中断其余回滚。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ActionFailure, EngineError, StepResult};
use crate::transaction::{AppliedChange, Change, ChangeApplier, Compensation};

/// 事务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    InProgress,
    Committed,
    RolledBack,
}

/// 事务操作错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransactionError {
    #[error("Transaction {id} is {status:?}, expected InProgress")]
    NotInProgress {
        id: String,
        status: TransactionStatus,
    },

    #[error("Transaction {id} has a failed change: {reason}")]
    Poisoned { id: String, reason: String },

    #[error(transparent)]
    Change(#[from] ActionFailure),
}

/// 回滚结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RollbackReport {
    /// 成功执行的补偿（按执行顺序的 change id）
    pub compensated: Vec<String>,
    /// 失败的补偿（已记录日志，不再向上传播）
    pub failures: Vec<EngineError>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub status: TransactionStatus,
    pub applied: Vec<AppliedChange>,
    rollback_stack: Vec<Compensation>,
    failure: Option<String>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: TransactionStatus::Pending,
            applied: Vec::new(),
            rollback_stack: Vec::new(),
            failure: None,
        }
    }

    /// 创建并开始事务
    pub fn begin() -> Self {
        let mut tx = Self::new();
        tx.status = TransactionStatus::InProgress;
        tracing::debug!(tx_id = %tx.id, "transaction begin");
        tx
    }

    /// 应用一个变更；失败后事务被标记，commit 将被拒绝
    pub async fn apply(
        &mut self,
        applier: &dyn ChangeApplier,
        change: &Change,
    ) -> Result<StepResult, TransactionError> {
        self.ensure_in_progress()?;
        if let Some(reason) = &self.failure {
            return Err(TransactionError::Poisoned {
                id: self.id.clone(),
                reason: reason.clone(),
            });
        }
        match applier.apply(change).await {
            Ok(applied) => {
                let result = applied.result.clone();
                self.rollback_stack.push(applied.compensation.clone());
                self.applied.push(applied);
                Ok(result)
            }
            Err(e) => {
                tracing::debug!(tx_id = %self.id, change_id = %change.id, error = %e, "change failed");
                self.failure = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    pub fn commit(&mut self) -> Result<(), TransactionError> {
        self.ensure_in_progress()?;
        if let Some(reason) = &self.failure {
            return Err(TransactionError::Poisoned {
                id: self.id.clone(),
                reason: reason.clone(),
            });
        }
        self.status = TransactionStatus::Committed;
        tracing::debug!(tx_id = %self.id, changes = self.applied.len(), "transaction committed");
        Ok(())
    }

    /// 已提交事务的补偿动作（按应用顺序），交给任务级回滚日志
    pub fn compensations(&self) -> &[Compensation] {
        &self.rollback_stack
    }

    /// 逆序回放补偿栈
    pub async fn rollback(&mut self, applier: &dyn ChangeApplier) -> RollbackReport {
        let stack = std::mem::take(&mut self.rollback_stack);
        let report = unwind(applier, stack).await;
        self.status = TransactionStatus::RolledBack;
        report
    }

    fn ensure_in_progress(&self) -> Result<(), TransactionError> {
        if self.status == TransactionStatus::InProgress {
            Ok(())
        } else {
            Err(TransactionError::NotInProgress {
                id: self.id.clone(),
                status: self.status,
            })
        }
    }
}

/// 严格逆序执行补偿；失败的补偿记录为 RollbackFailure 后继续
pub async fn unwind(applier: &dyn ChangeApplier, mut stack: Vec<Compensation>) -> RollbackReport {
    let mut report = RollbackReport::default();
    while let Some(comp) = stack.pop() {
        match applier.compensate(&comp).await {
            Ok(()) => report.compensated.push(comp.change_id.clone()),
            Err(detail) => {
                tracing::warn!(change_id = %comp.change_id, error = %detail, "compensating action failed, continuing rollback");
                report.failures.push(EngineError::RollbackFailure {
                    change_id: comp.change_id.clone(),
                    detail,
                });
            }
        }
    }
    report
}
