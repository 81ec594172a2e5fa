//! ReAct 周期：Thought → Act → Observe → Reflect
//!
//! 每个步骤一次周期记录：执行前向协作方询问打算的做法、信心与风险（Thought），
//! 执行（可能经过纠错的）动作并记录每次尝试（Act），把实际结果与 Thought 的预期比较（Observe），
//! 最后总结经验（Reflect，协作方或本地启发式）。只有最终成功的周期才会进入策略记忆。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::actions::{Action, ActionRisk};
use crate::core::{Step, StepResult, Task};
use crate::llm::{Collaborator, RequestKind};
use crate::memory::StrategyMatch;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub reasoning: String,
    /// [0, 100]
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub risks: Vec<String>,
    #[serde(default)]
    pub expected_outcome: String,
}

fn default_confidence() -> f64 {
    50.0
}

impl Thought {
    /// 信心过半即预期成功
    pub fn expects_success(&self) -> bool {
        self.confidence >= 50.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Match,
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub expected: String,
    pub actual: String,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    #[serde(default)]
    pub knowledge_gained: String,
    #[serde(default)]
    pub what_worked: Vec<String>,
    #[serde(default)]
    pub what_failed: Vec<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
}

/// 尝试来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptSource {
    Original,
    Retry,
    Correction,
    Fallback,
}

/// Act 阶段的一次尝试
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub source: AttemptSource,
    pub action: Action,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactCycle {
    pub cycle_number: u32,
    pub thought: Thought,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<Reflection>,
    #[serde(default)]
    pub succeeded: bool,
}

impl ReactCycle {
    pub fn new(cycle_number: u32, thought: Thought) -> Self {
        Self {
            cycle_number,
            thought,
            attempts: Vec::new(),
            observation: None,
            reflection: None,
            succeeded: false,
        }
    }

    pub fn record(&mut self, record: AttemptRecord) {
        self.attempts.push(record);
    }

    /// 先失败后成功（含纠错后成功）
    pub fn recovered(&self) -> bool {
        self.succeeded && self.attempts.iter().any(|a| !a.success)
    }

    /// 最终成功的那次尝试
    pub fn winning_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.iter().rev().find(|a| a.success)
    }
}

/// ReAct 周期驱动：持有可选的推理协作方，没有协作方时使用本地启发式
#[derive(Clone, Default)]
pub struct ReactRunner {
    collaborator: Option<Arc<Collaborator>>,
}

impl ReactRunner {
    pub fn new(collaborator: Option<Arc<Collaborator>>) -> Self {
        Self { collaborator }
    }

    /// Thought：执行前的预期
    pub async fn think(&self, step: &Step, task: &Task, hint: Option<&StrategyMatch>) -> Thought {
        let local = local_thought(step, hint);
        let Some(collaborator) = &self.collaborator else {
            return local;
        };
        let ctx = json!({
            "task": task.context_summary(),
            "step": { "id": step.id, "title": step.title, "description": step.description },
            "action": step.action,
            "confidence": step.confidence.as_ref().map(|c| c.score),
            "memory_hint": hint.map(|m| json!({ "approach": m.pattern.approach, "relevance": m.relevance })),
        });
        match collaborator.ask::<Thought>(RequestKind::Thought, &ctx).await {
            Some(mut thought) => {
                thought.confidence = thought.confidence.clamp(0.0, 100.0);
                if thought.approach.is_empty() {
                    thought.approach = local.approach;
                }
                if thought.expected_outcome.is_empty() {
                    thought.expected_outcome = local.expected_outcome;
                }
                thought
            }
            None => local,
        }
    }

    /// Observe：实际结果与预期比较
    pub fn observe(&self, cycle: &ReactCycle, outcome: Result<&StepResult, &str>) -> Observation {
        let (actual, succeeded) = match outcome {
            Ok(result) => (result.message.clone(), true),
            Err(error) => (format!("failed: {}", error), false),
        };
        let verdict = if succeeded == cycle.thought.expects_success() && !cycle.recovered() {
            Verdict::Match
        } else {
            Verdict::Mismatch
        };
        Observation {
            expected: cycle.thought.expected_outcome.clone(),
            actual,
            verdict,
        }
    }

    /// Reflect：总结经验
    pub async fn reflect(&self, step: &Step, cycle: &ReactCycle) -> Reflection {
        let local = local_reflection(step, cycle);
        let Some(collaborator) = &self.collaborator else {
            return local;
        };
        let ctx = json!({
            "step": { "id": step.id, "title": step.title, "description": step.description },
            "thought": cycle.thought,
            "attempts": cycle.attempts,
            "observation": cycle.observation,
            "succeeded": cycle.succeeded,
        });
        match collaborator
            .ask::<Reflection>(RequestKind::Reflection, &ctx)
            .await
        {
            Some(reflection) if !reflection.knowledge_gained.trim().is_empty() => reflection,
            _ => local,
        }
    }
}

fn local_thought(step: &Step, hint: Option<&StrategyMatch>) -> Thought {
    let mut risks = Vec::new();
    match step.action.risk() {
        ActionRisk::Destructive => risks.push(format!("{} is destructive", step.action.kind)),
        ActionRisk::Mutating => risks.push(format!("{} modifies the workspace", step.action.kind)),
        ActionRisk::ReadOnly => {}
    }
    if let Some(assessment) = &step.confidence {
        risks.extend(
            assessment
                .factors
                .iter()
                .filter(|f| f.impact < 0.0)
                .map(|f| f.description.clone()),
        );
    }
    let (approach, reasoning) = match hint {
        Some(m) => (
            m.pattern.approach.clone(),
            format!("Reusing a learned strategy: {}", m.relevance),
        ),
        None => (
            format!("Execute {} as planned", step.action.summary()),
            "No prior strategy for this kind of step".to_string(),
        ),
    };
    Thought {
        approach,
        reasoning,
        confidence: step.confidence.as_ref().map(|c| c.score).unwrap_or(50.0),
        risks,
        expected_outcome: format!("{} succeeds", step.action.summary()),
    }
}

fn local_reflection(step: &Step, cycle: &ReactCycle) -> Reflection {
    let what_worked: Vec<String> = cycle
        .attempts
        .iter()
        .filter(|a| a.success)
        .map(|a| format!("{:?} attempt {}: {}", a.source, a.attempt, a.action.summary()))
        .collect();
    let mut what_failed: Vec<String> = Vec::new();
    for a in cycle.attempts.iter().filter(|a| !a.success) {
        let line = format!(
            "{}: {}",
            a.action.summary(),
            a.error.as_deref().unwrap_or("unknown error")
        );
        if !what_failed.contains(&line) {
            what_failed.push(line);
        }
    }
    let last_error = cycle
        .attempts
        .iter()
        .rev()
        .find_map(|a| a.error.clone());

    let knowledge_gained = match (cycle.succeeded, cycle.winning_attempt()) {
        (true, Some(win)) if cycle.recovered() => format!(
            "'{}' recovered after {} failed attempt(s) using {}",
            step.title,
            cycle.attempts.len() - 1,
            win.action.summary()
        ),
        (true, Some(win)) => format!("'{}' succeeded directly with {}", step.title, win.action.summary()),
        _ => format!(
            "'{}' failed after {} attempt(s)",
            step.title,
            cycle.attempts.len()
        ),
    };
    Reflection {
        knowledge_gained,
        what_worked,
        what_failed,
        root_cause: if cycle.succeeded && !cycle.recovered() {
            None
        } else {
            last_error
        },
    }
}
