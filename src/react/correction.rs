//! 自我纠错
//!
//! 步骤失败时把 {失败动作, 错误, 步骤描述, 任务上下文} 交给推理协作方，期望得到一个替代动作
//! 或明确的「没有更好的替代」。替代动作必须通过动作类型参数表校验（缺参 / 多参即拒绝），
//! 并且不能重复已尝试过的动作。替代尝试与字面重试共用同一重试预算。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::actions::{action_schema_json, Action};
use crate::llm::{Collaborator, RequestKind};

/// 纠错上下文
#[derive(Debug, Clone, Serialize)]
pub struct CorrectionContext {
    pub failed_action: Action,
    pub error: String,
    pub step_title: String,
    pub step_description: String,
    pub task_context: String,
    /// 元认知升级得到的指导
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
    pub previous_attempts: Vec<Action>,
}

/// 纠错结果
#[derive(Debug, Clone, PartialEq)]
pub enum Correction {
    Alternative { action: Action, reasoning: String },
    NoBetterAlternative { reasoning: String },
    /// 建议未通过校验或与已尝试动作重复
    Rejected { reason: String },
    /// 无协作方或回复无法解析
    Unavailable,
}

#[derive(Debug, Deserialize)]
struct CorrectionReply {
    #[serde(default)]
    action: Option<Action>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    no_alternative: bool,
}

/// 自我纠错器
#[derive(Clone, Default)]
pub struct SelfCorrector {
    collaborator: Option<Arc<Collaborator>>,
    /// 可用能力说明（拼入提示词）
    capabilities: String,
}

impl SelfCorrector {
    pub fn new(collaborator: Option<Arc<Collaborator>>, capabilities: impl Into<String>) -> Self {
        Self {
            collaborator,
            capabilities: capabilities.into(),
        }
    }

    pub async fn propose(&self, ctx: &CorrectionContext) -> Correction {
        let Some(collaborator) = &self.collaborator else {
            return Correction::Unavailable;
        };
        let request = json!({
            "failure": ctx,
            "capabilities": self.capabilities,
            "action_schema": action_schema_json(),
        });
        let Some(reply) = collaborator
            .ask::<CorrectionReply>(RequestKind::SelfCorrection, &request)
            .await
        else {
            return Correction::Unavailable;
        };
        let action = match reply.action {
            Some(action) if !reply.no_alternative => action,
            _ => {
                return Correction::NoBetterAlternative {
                    reasoning: reply.reasoning,
                }
            }
        };
        if let Err(e) = action.validate() {
            tracing::debug!(suggestion = %action.summary(), error = %e, "correction rejected by schema");
            return Correction::Rejected {
                reason: e.to_string(),
            };
        }
        if action == ctx.failed_action || ctx.previous_attempts.contains(&action) {
            return Correction::Rejected {
                reason: format!("{} was already attempted", action.summary()),
            };
        }
        Correction::Alternative {
            action,
            reasoning: reply.reasoning,
        }
    }
}
