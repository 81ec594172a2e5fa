//! 信心评估与备选计划
//!
//! 执行开始前为每个步骤计算 ConfidenceAssessment，信号包括：策略记忆命中（+）、
//! 文件类动作的目标存在性（±）、动作风险分级（破坏性 / 只读）、参数歧义。
//! 分数裁剪到 [0, 100] 后按阈值分桶；medium / high 风险步骤向协作方索取 1-3 个备选计划。

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::actions::{action_schema_json, Action, ActionRisk, ActionType};
use crate::core::{Step, Task};
use crate::llm::{Collaborator, RequestKind};
use crate::memory::StrategyMatch;

/// 无任何信号时的基础分
const BASE_SCORE: f64 = 60.0;
const MAX_FALLBACKS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// low: > 70，medium: 40-70，high: < 40
    pub fn from_score(score: f64) -> Self {
        if score > 70.0 {
            RiskLevel::Low
        } else if score >= 40.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceFactor {
    pub description: String,
    /// 带符号的分数影响
    pub impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub score: f64,
    pub risk_level: RiskLevel,
    pub factors: Vec<ConfidenceFactor>,
    pub memory_backed: bool,
}

/// 预生成的备选动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackPlan {
    pub id: String,
    pub trigger: String,
    pub reasoning: String,
    pub confidence: f64,
    pub action: Action,
    #[serde(default)]
    pub used: bool,
}

/// 任务级汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInsights {
    pub overall_confidence: f64,
    pub estimated_success_rate: f64,
    pub memory_backed_steps: usize,
    pub fallback_count: usize,
    pub high_risk_steps: usize,
}

impl TaskInsights {
    /// 成功率估计：每步按信心分作为单次成功概率，考虑重试次数后连乘
    pub fn from_steps(steps: &[Step]) -> Self {
        let scored: Vec<(&Step, &ConfidenceAssessment)> = steps
            .iter()
            .filter_map(|s| s.confidence.as_ref().map(|c| (s, c)))
            .collect();
        let overall_confidence = if scored.is_empty() {
            100.0
        } else {
            scored.iter().map(|(_, c)| c.score).sum::<f64>() / scored.len() as f64
        };
        let estimated_success_rate = scored
            .iter()
            .map(|(s, c)| {
                let p = (c.score / 100.0).clamp(0.0, 1.0);
                1.0 - (1.0 - p).powi(s.attempt_budget() as i32)
            })
            .product::<f64>();
        Self {
            overall_confidence,
            estimated_success_rate,
            memory_backed_steps: scored.iter().filter(|(_, c)| c.memory_backed).count(),
            fallback_count: steps.iter().map(|s| s.fallbacks.len()).sum(),
            high_risk_steps: scored
                .iter()
                .filter(|(_, c)| c.risk_level == RiskLevel::High)
                .count(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FallbackReply {
    #[serde(default)]
    fallbacks: Vec<FallbackProposal>,
}

#[derive(Debug, Deserialize)]
struct FallbackProposal {
    #[serde(default)]
    trigger: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: f64,
    action: Action,
}

/// 信心评估器
#[derive(Clone, Default)]
pub struct ConfidencePlanner {
    collaborator: Option<Arc<Collaborator>>,
    workspace_root: Option<PathBuf>,
}

impl ConfidencePlanner {
    pub fn new(collaborator: Option<Arc<Collaborator>>, workspace_root: Option<PathBuf>) -> Self {
        Self {
            collaborator,
            workspace_root,
        }
    }

    /// 计算单个步骤的信心；matches 为该步骤签名的策略记忆查询结果
    pub fn assess(&self, step: &Step, matches: &[StrategyMatch]) -> ConfidenceAssessment {
        let mut factors = Vec::new();

        let memory_backed = match matches.first() {
            Some(best) => {
                let impact = 5.0 + 25.0 * best.pattern.success_rate * best.similarity / 100.0;
                factors.push(ConfidenceFactor {
                    description: format!("Strategy memory match: {}", best.relevance),
                    impact,
                });
                true
            }
            None => false,
        };

        if let Some(factor) = self.target_factor(step) {
            factors.push(factor);
        }

        match step.action.action_type() {
            None => factors.push(ConfidenceFactor {
                description: format!("Unknown action type '{}'", step.action.kind),
                impact: -30.0,
            }),
            Some(t) => match t.risk() {
                ActionRisk::ReadOnly => factors.push(ConfidenceFactor {
                    description: format!("{} is read-only", t),
                    impact: 10.0,
                }),
                ActionRisk::Destructive => factors.push(ConfidenceFactor {
                    description: format!("{} is destructive", t),
                    impact: -20.0,
                }),
                ActionRisk::Mutating => {}
            },
        }

        factors.extend(ambiguity_factors(step));

        let score = (BASE_SCORE + factors.iter().map(|f| f.impact).sum::<f64>()).clamp(0.0, 100.0);
        ConfidenceAssessment {
            score,
            risk_level: RiskLevel::from_score(score),
            factors,
            memory_backed,
        }
    }

    fn target_factor(&self, step: &Step) -> Option<ConfidenceFactor> {
        let root = self.workspace_root.as_ref()?;
        let action_type = step.action.action_type()?;
        if !action_type.touches_files() {
            return None;
        }
        let path = step.action.target_path()?;
        let exists = root.join(path).exists();
        let (description, impact) = match (action_type, exists) {
            (ActionType::WriteFile | ActionType::CreateDirectory, true) => {
                (format!("{} already exists and will be overwritten", path), -5.0)
            }
            (ActionType::WriteFile | ActionType::CreateDirectory, false) => {
                (format!("{} does not exist yet", path), 5.0)
            }
            (_, true) => (format!("{} exists", path), 10.0),
            (_, false) => (format!("{} does not exist", path), -25.0),
        };
        Some(ConfidenceFactor {
            description,
            impact,
        })
    }

    /// 为任务每个步骤标注信心与备选计划，返回任务级汇总；matches 与 task.steps 一一对应
    pub async fn annotate(&self, task: &mut Task, matches: &[Vec<StrategyMatch>]) -> TaskInsights {
        for (idx, step) in task.steps.iter_mut().enumerate() {
            let step_matches = matches.get(idx).map(Vec::as_slice).unwrap_or(&[]);
            let assessment = self.assess(step, step_matches);
            tracing::debug!(
                step_id = %step.id,
                score = assessment.score,
                risk = ?assessment.risk_level,
                "step confidence assessed"
            );
            let risky = assessment.risk_level != RiskLevel::Low;
            step.confidence = Some(assessment);
            if risky && step.fallbacks.is_empty() {
                step.fallbacks = self.fallback_plans(step, &task.title).await;
            }
        }
        let insights = TaskInsights::from_steps(&task.steps);
        tracing::info!(
            task_id = %task.id,
            overall_confidence = insights.overall_confidence,
            estimated_success_rate = insights.estimated_success_rate,
            high_risk_steps = insights.high_risk_steps,
            "task confidence annotated"
        );
        task.insights = Some(insights.clone());
        insights
    }

    async fn fallback_plans(&self, step: &Step, task_title: &str) -> Vec<FallbackPlan> {
        let Some(collaborator) = &self.collaborator else {
            return Vec::new();
        };
        let ctx = json!({
            "task": task_title,
            "step": { "id": step.id, "title": step.title, "description": step.description },
            "action": step.action,
            "confidence": step.confidence,
            "action_schema": action_schema_json(),
        });
        let Some(reply) = collaborator
            .ask::<FallbackReply>(RequestKind::FallbackPlans, &ctx)
            .await
        else {
            return Vec::new();
        };
        reply
            .fallbacks
            .into_iter()
            .filter(|p| match p.action.validate() {
                Ok(_) => p.action != step.action,
                Err(e) => {
                    tracing::debug!(step_id = %step.id, error = %e, "fallback plan rejected");
                    false
                }
            })
            .take(MAX_FALLBACKS)
            .enumerate()
            .map(|(i, p)| FallbackPlan {
                id: format!("{}-fallback-{}", step.id, i + 1),
                trigger: if p.trigger.is_empty() {
                    "primary action fails".to_string()
                } else {
                    p.trigger
                },
                reasoning: p.reasoning,
                confidence: p.confidence.clamp(0.0, 100.0),
                action: p.action,
                used: false,
            })
            .collect()
    }
}

/// 参数歧义：校验失败、空字符串参数、缺少描述、复合命令
fn ambiguity_factors(step: &Step) -> Vec<ConfidenceFactor> {
    let mut factors = Vec::new();
    if let Err(e) = step.action.validate() {
        factors.push(ConfidenceFactor {
            description: format!("Parameters do not validate: {}", e),
            impact: -30.0,
        });
    }
    let blank = step
        .action
        .params
        .iter()
        .filter(|(_, v)| v.as_str().is_some_and(|s| s.trim().is_empty()))
        .count();
    if blank > 0 {
        factors.push(ConfidenceFactor {
            description: format!("{} blank parameter(s)", blank),
            impact: -10.0 * blank.min(2) as f64,
        });
    }
    if step.description.trim().is_empty() && step.title.split_whitespace().count() < 3 {
        factors.push(ConfidenceFactor {
            description: "Step has no description".to_string(),
            impact: -5.0,
        });
    }
    if let Some(command) = step.action.str_param("command") {
        if ["&&", "||", ";", "|"].iter().any(|op| command.contains(op)) {
            factors.push(ConfidenceFactor {
                description: "Compound shell command".to_string(),
                impact: -5.0,
            });
        }
    }
    factors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::{ProblemSignature, StrategyPattern};

    fn step(id: &str, action: Action) -> Step {
        Step::new(id, "Update the parser module", action).with_description("apply fix")
    }

    fn edit() -> Action {
        Action::new(
            ActionType::EditFile,
            json!({"path": "src/parser.rs", "old_text": "a", "new_text": "b"}),
        )
    }

    fn memory_match(rate: f64) -> StrategyMatch {
        StrategyMatch {
            pattern: StrategyPattern::new(
                ProblemSignature::new("update parser module", "edit_file", ""),
                "edit in place",
                None,
                rate,
            ),
            similarity: 100.0,
            score: 0.9,
            relevance: "100% similar".to_string(),
        }
    }

    #[test]
    fn test_risk_level_buckets() {
        assert_eq!(RiskLevel::from_score(70.1), RiskLevel::Low);
        assert_eq!(RiskLevel::from_score(70.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(40.0), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(39.9), RiskLevel::High);
    }

    #[test]
    fn test_memory_match_raises_confidence() {
        let planner = ConfidencePlanner::default();
        let plain = planner.assess(&step("a", edit()), &[]);
        let backed = planner.assess(&step("b", edit()), &[memory_match(0.9)]);
        assert!(backed.score > plain.score);
        assert!(backed.memory_backed);
        assert!(!plain.memory_backed);
    }

    #[test]
    fn test_score_is_clipped() {
        let planner = ConfidencePlanner::default();
        let mut bad = Action::new(ActionType::RunCommand, json!({"command": " "}));
        bad.params.insert("bogus".to_string(), json!(""));
        let s = Step::new("x", "rm", bad);
        let a = planner.assess(&s, &[]);
        assert!((0.0..=100.0).contains(&a.score));
        assert_eq!(a.risk_level, RiskLevel::from_score(a.score));
        assert_eq!(a.risk_level, RiskLevel::High);

        let read = Action::new(ActionType::ReadFile, json!({"path": "a.rs"}));
        let matches: Vec<StrategyMatch> = (0..3).map(|_| memory_match(1.0)).collect();
        let a = planner.assess(&step("r", read), &matches);
        assert!(a.score <= 100.0);
    }

    #[test]
    fn test_target_existence_heuristic() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("present.rs"), "").unwrap();
        let planner = ConfidencePlanner::new(None, Some(dir.path().to_path_buf()));
        let present = planner.assess(
            &step("p", Action::new(ActionType::ReadFile, json!({"path": "present.rs"}))),
            &[],
        );
        let missing = planner.assess(
            &step("m", Action::new(ActionType::ReadFile, json!({"path": "missing.rs"}))),
            &[],
        );
        assert!(present.score > missing.score);
    }

    #[tokio::test]
    async fn test_risky_steps_get_validated_fallbacks() {
        let llm = ScriptedLlmClient::new().on(
            "fallback_plans",
            r#"{"fallbacks": [
                {"trigger": "command fails", "reasoning": "use tests", "confidence": 65,
                 "action": {"type": "run_tests", "params": {}}},
                {"trigger": "bad", "reasoning": "invalid", "confidence": 10,
                 "action": {"type": "read_file", "params": {}}}
            ]}"#,
        );
        let planner = ConfidencePlanner::new(Some(Arc::new(Collaborator::new(Arc::new(llm)))), None);
        let mut task = Task::new("t", "demo")
            .with_step(step(
                "s1",
                Action::new(ActionType::RunCommand, json!({"command": "cargo build"})),
            ))
            .with_step(step("s2", Action::new(ActionType::ReadFile, json!({"path": "a.rs"}))));
        let insights = planner.annotate(&mut task, &[]).await;

        assert_eq!(task.steps[0].fallbacks.len(), 1);
        assert_eq!(task.steps[0].fallbacks[0].id, "s1-fallback-1");
        assert!(task.steps[1].fallbacks.is_empty());
        assert_eq!(insights.fallback_count, 1);
        assert!(insights.estimated_success_rate > 0.0 && insights.estimated_success_rate <= 1.0);
        assert!(task.insights.is_some());
    }

    #[tokio::test]
    async fn test_truncated_fallback_reply_yields_no_plans() {
        let llm = ScriptedLlmClient::new().on(
            "fallback_plans",
            r#"{"fallbacks": [{"trigger": "build fails", "reasoning": "shrink", "confidence": 60,
                "action": {"type": "run_command", "params": {"command": "cargo bu"#,
        );
        let planner = ConfidencePlanner::new(Some(Arc::new(Collaborator::new(Arc::new(llm)))), None);
        let mut task = Task::new("t", "demo").with_step(step(
            "s1",
            Action::new(ActionType::RunCommand, json!({"command": "cargo build"})),
        ));
        let insights = planner.annotate(&mut task, &[]).await;
        assert!(task.steps[0].fallbacks.is_empty());
        assert_eq!(insights.fallback_count, 0);
    }
}
