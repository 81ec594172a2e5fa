//! 动作分发器
//!
//! 持有 CapabilityRegistry 与全局超时：dispatch(action) 先按参数表校验，再在超时内调用对应处理器，
//! 结果映射为 ActionFailure；每次调用输出结构化审计日志（JSON）。
//! 分发器同时是默认的 ChangeApplier：应用变更前向处理器索取补偿动作。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;

use crate::actions::{Action, ActionCall, ActionRisk, CapabilityHandler, CapabilityRegistry};
use crate::core::{ActionFailure, StepResult};
use crate::transaction::{AppliedChange, Change, ChangeApplier, Compensation};

/// 动作分发器：校验 + 超时 + 审计
pub struct ActionDispatcher {
    registry: CapabilityRegistry,
    timeout: Duration,
}

impl ActionDispatcher {
    pub fn new(registry: CapabilityRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// 校验并执行动作；处理器返回 success=false 也视为失败
    pub async fn dispatch(&self, action: &Action) -> Result<StepResult, ActionFailure> {
        let (call, handler) = match self.resolve(action) {
            Ok(resolved) => resolved,
            Err(e) => {
                audit(action, false, "invalid", 0);
                return Err(e);
            }
        };
        self.run(action, &call, handler.as_ref()).await
    }

    fn resolve(
        &self,
        action: &Action,
    ) -> Result<(ActionCall, Arc<dyn CapabilityHandler>), ActionFailure> {
        let call = action.validate()?;
        let handler = self
            .registry
            .get(call.action_type())
            .ok_or_else(|| ActionFailure::NoHandler {
                action: call.action_type().as_str().to_string(),
            })?;
        Ok((call, handler))
    }

    async fn run(
        &self,
        action: &Action,
        call: &ActionCall,
        handler: &dyn CapabilityHandler,
    ) -> Result<StepResult, ActionFailure> {
        let start = Instant::now();
        let result = timeout(self.timeout, handler.execute(call)).await;

        let outcome = match &result {
            Ok(Ok(r)) if r.success || r.skipped => "ok",
            Ok(Ok(_)) => "unsuccessful",
            Ok(Err(_)) => "error",
            Err(_) => "timeout",
        };
        audit(
            action,
            outcome == "ok",
            outcome,
            start.elapsed().as_millis() as u64,
        );

        match result {
            Ok(Ok(r)) if r.success || r.skipped => Ok(r),
            Ok(Ok(r)) => Err(ActionFailure::handler(action.kind.clone(), r.message)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ActionFailure::Timeout {
                action: action.kind.clone(),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

fn audit(action: &Action, ok: bool, outcome: &str, duration_ms: u64) {
    let audit = serde_json::json!({
        "event": "action_audit",
        "action": action.kind,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": duration_ms,
        "params_preview": params_preview(action),
    });
    tracing::info!(audit = %audit.to_string(), "action");
}

fn params_preview(action: &Action) -> String {
    let s = serde_json::Value::Object(action.params.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[async_trait]
impl ChangeApplier for ActionDispatcher {
    async fn apply(&self, change: &Change) -> Result<AppliedChange, ActionFailure> {
        let (call, handler) = match self.resolve(&change.action) {
            Ok(resolved) => resolved,
            Err(e) => {
                audit(&change.action, false, "invalid", 0);
                return Err(e);
            }
        };
        // 补偿必须在执行前取得（需要变更前的状态）
        let undo = handler.compensation(&call).await;
        let result = self.run(&change.action, &call, handler.as_ref()).await?;
        if undo.is_none() && change.action.risk() != ActionRisk::ReadOnly {
            tracing::warn!(change_id = %change.id, action = %change.action.summary(), "change has no compensating action and will survive rollback");
        }
        Ok(AppliedChange {
            change_id: change.id.clone(),
            result,
            compensation: Compensation {
                change_id: change.id.clone(),
                description: format!("undo {}", change.description),
                undo,
            },
        })
    }

    async fn compensate(&self, compensation: &Compensation) -> Result<(), String> {
        match &compensation.undo {
            Some(undo) => {
                tracing::info!(change_id = %compensation.change_id, action = %undo.summary(), "running compensating action");
                self.dispatch(undo).await.map(|_| ()).map_err(|e| e.to_string())
            }
            None => {
                tracing::debug!(change_id = %compensation.change_id, "no compensating action recorded, change left in place");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionType;
    use serde_json::json;

    struct Slow;

    #[async_trait]
    impl CapabilityHandler for Slow {
        fn action_type(&self) -> ActionType {
            ActionType::RunTests
        }

        async fn execute(&self, _call: &ActionCall) -> Result<StepResult, ActionFailure> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StepResult::ok("done"))
        }
    }

    struct Unsuccessful;

    #[async_trait]
    impl CapabilityHandler for Unsuccessful {
        fn action_type(&self) -> ActionType {
            ActionType::AnalyzeCode
        }

        async fn execute(&self, _call: &ActionCall) -> Result<StepResult, ActionFailure> {
            Ok(StepResult::failed("could not parse file"))
        }

        async fn compensation(&self, _call: &ActionCall) -> Option<Action> {
            Some(Action::new(ActionType::RunTests, json!({})))
        }
    }

    fn dispatcher(timeout_secs: u64) -> ActionDispatcher {
        let mut registry = CapabilityRegistry::new();
        registry.register(Slow);
        registry.register(Unsuccessful);
        ActionDispatcher::new(registry, timeout_secs)
    }

    #[tokio::test]
    async fn test_missing_parameter_never_reaches_handler() {
        let d = dispatcher(1);
        let err = d
            .dispatch(&Action::new(ActionType::AnalyzeCode, json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionFailure::MissingParameter { ref param, .. } if param == "path"));
    }

    #[tokio::test]
    async fn test_unregistered_type_reports_no_handler() {
        let d = dispatcher(1);
        let err = d
            .dispatch(&Action::new(ActionType::GitCommit, json!({"message": "m"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionFailure::NoHandler { .. }));
    }

    #[tokio::test]
    async fn test_timeout() {
        let d = dispatcher(1);
        let err = d
            .dispatch(&Action::new(ActionType::RunTests, json!({})))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ActionFailure::Timeout {
                action: "run_tests".to_string(),
                secs: 1
            }
        );
    }

    #[tokio::test]
    async fn test_unsuccessful_result_is_failure() {
        let d = dispatcher(1);
        let change = Change::new(
            "c1",
            "analyze",
            Action::new(ActionType::AnalyzeCode, json!({"path": "a.rs"})),
        );
        let err = d.apply(&change).await.unwrap_err();
        assert_eq!(err.to_string(), "analyze_code failed: could not parse file");
    }
}
