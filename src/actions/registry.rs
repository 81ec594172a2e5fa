//! 能力注册表
//!
//! 所有能力处理器实现 CapabilityHandler（action_type / description / execute / compensation），
//! 由 CapabilityRegistry 按动作类型注册与查找；注册表在引擎构造时注入，不使用进程级单例。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::actions::{Action, ActionCall, ActionType};
use crate::core::{ActionFailure, StepResult};

/// 能力处理器：执行一种动作类型；可选地在执行前给出补偿动作（用于事务回滚）
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// 处理的动作类型
    fn action_type(&self) -> ActionType;

    /// 能力描述（写入提示词）
    fn description(&self) -> &str {
        ""
    }

    /// 执行动作
    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure>;

    /// 执行前调用：返回撤销该动作的补偿动作（None 表示无需或无法补偿）
    async fn compensation(&self, _call: &ActionCall) -> Option<Action> {
        None
    }
}

/// 能力注册表：按类型存储 Arc<dyn CapabilityHandler>
#[derive(Default, Clone)]
pub struct CapabilityRegistry {
    handlers: BTreeMap<ActionType, Arc<dyn CapabilityHandler>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器；同类型重复注册时后者覆盖前者
    pub fn register(&mut self, handler: impl CapabilityHandler + 'static) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn CapabilityHandler>) {
        let action_type = handler.action_type();
        if self.handlers.insert(action_type, handler).is_some() {
            tracing::debug!(action = %action_type, "capability handler replaced");
        }
    }

    pub fn get(&self, action_type: ActionType) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&action_type).cloned()
    }

    pub fn supports(&self, action_type: ActionType) -> bool {
        self.handlers.contains_key(&action_type)
    }

    pub fn action_types(&self) -> Vec<ActionType> {
        self.handlers.keys().copied().collect()
    }

    /// 返回 "type: description" 列表，用于拼入纠错提示词
    pub fn describe(&self) -> String {
        self.handlers
            .iter()
            .map(|(t, h)| {
                let schema = t.schema();
                format!(
                    "- {} (required: [{}], optional: [{}]) {}",
                    t,
                    schema.required.join(", "),
                    schema.optional.join(", "),
                    h.description()
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
