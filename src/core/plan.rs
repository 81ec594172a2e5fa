//! 计划输入解析
//!
//! 外部规划器给出 `{task_id, title, description, steps: [...]}`；解析时容忍 Markdown 代码块包裹。
//! 计划格式错误（PlanningParseError）不会让引擎崩溃，而是降级为安全的单步只读任务。

use serde::Deserialize;
use serde_json::{json, Value};

use crate::actions::{Action, ActionType};
use crate::core::{EngineError, Step, Task};
use crate::llm::extract_json;

/// 步骤未声明 max_retries 时的默认值
pub const DEFAULT_MAX_RETRIES: u32 = 2;

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// 计划输入（外部接口格式）
#[derive(Debug, Clone, Deserialize)]
pub struct PlanInput {
    #[serde(default)]
    pub task_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub steps: Vec<PlanStep>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub action: Action,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub skippable: bool,
    #[serde(default)]
    pub links: Vec<String>,
}

impl PlanInput {
    /// 转为 Task；缺失的任务 id 用 uuid 生成，缺失的步骤 id 用 step-N
    pub fn into_task(self) -> Task {
        let id = self
            .task_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut task = Task::new(id, self.title).with_description(self.description);
        for (idx, ps) in self.steps.into_iter().enumerate() {
            let step_id = resolved_step_id(idx, ps.id.as_deref());
            let mut step = Step::new(step_id, ps.title, ps.action)
                .with_description(ps.description)
                .with_max_retries(ps.max_retries);
            step.requires_approval = ps.requires_approval;
            step.skippable = ps.skippable;
            step.links = ps.links;
            task = task.with_step(step);
        }
        task
    }
}

/// 未声明 id 的步骤按位置生成 step-N
fn resolved_step_id(idx: usize, id: Option<&str>) -> String {
    match id {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => format!("step-{}", idx + 1),
    }
}

/// 解析计划文本（可被 ```json 包裹或夹杂说明文字）；被截断的计划不接受
pub fn parse_plan(raw: &str) -> Result<PlanInput, EngineError> {
    let extracted = extract_json(raw)
        .ok_or_else(|| EngineError::PlanningParse("no JSON object found in plan".to_string()))?;
    if extracted.repaired {
        return Err(EngineError::PlanningParse(
            "plan JSON is truncated".to_string(),
        ));
    }
    let plan: PlanInput = serde_json::from_str(&extracted.json)
        .map_err(|e| EngineError::PlanningParse(e.to_string()))?;
    let mut seen = std::collections::HashSet::new();
    for (idx, step) in plan.steps.iter().enumerate() {
        let id = resolved_step_id(idx, step.id.as_deref());
        if !seen.insert(id.clone()) {
            return Err(EngineError::PlanningParse(format!(
                "duplicate step id: {}",
                id
            )));
        }
    }
    Ok(plan)
}

/// 解析计划；失败时降级为单步只读任务（在代码库中检索任务描述），并在 metadata 中记录解析错误
pub fn task_from_plan_text(raw: &str, goal: &str) -> Task {
    match parse_plan(raw) {
        Ok(plan) => plan.into_task(),
        Err(e) => {
            tracing::warn!(error = %e, "plan parse failed, falling back to single-step task");
            safe_default_task(goal, &e)
        }
    }
}

fn safe_default_task(goal: &str, err: &EngineError) -> Task {
    let goal = goal.trim();
    let title = if goal.is_empty() { "Investigate request" } else { goal };
    let action = Action::new(ActionType::SearchCodebase, json!({ "query": title }));
    let step = Step::new("step-1", format!("Search codebase for: {}", title), action)
        .with_description("Fallback step generated because the upstream plan could not be parsed")
        .with_max_retries(1);
    let mut task = Task::new(uuid::Uuid::new_v4().to_string(), title)
        .with_description(goal)
        .with_step(step);
    task.metadata
        .insert("plan_fallback".to_string(), Value::Bool(true));
    task.metadata
        .insert("plan_error".to_string(), Value::String(err.to_string()));
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskStatus;

    const PLAN: &str = r#"{
        "task_id": "t-42",
        "title": "Add logging",
        "description": "Add tracing to the parser",
        "steps": [
            {"id": "s1", "title": "Read parser", "action": {"type": "read_file", "params": {"path": "src/parser.rs"}}},
            {"title": "Write parser", "action": {"type": "write_file", "params": {"path": "src/parser.rs", "content": "x"}},
             "requires_approval": true, "max_retries": 4}
        ]
    }"#;

    #[test]
    fn test_parse_plan_into_task() {
        let task = parse_plan(PLAN).unwrap().into_task();
        assert_eq!(task.id, "t-42");
        assert_eq!(task.status, TaskStatus::Planning);
        assert_eq!(task.steps.len(), 2);
        assert_eq!(task.steps[0].max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(task.steps[1].id, "step-2");
        assert!(task.steps[1].requires_approval);
        assert_eq!(task.steps[1].max_retries, 4);
    }

    #[test]
    fn test_parse_plan_in_markdown_fence() {
        let wrapped = format!("Here is the plan:\n```json\n{}\n```\nGood luck!", PLAN);
        let plan = parse_plan(&wrapped).unwrap();
        assert_eq!(plan.title, "Add logging");
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let raw = r#"{"title": "x", "steps": [
            {"id": "a", "title": "1", "action": {"type": "run_tests", "params": {}}},
            {"id": "a", "title": "2", "action": {"type": "run_tests", "params": {}}}
        ]}"#;
        assert!(matches!(parse_plan(raw), Err(EngineError::PlanningParse(_))));
    }

    #[test]
    fn test_explicit_id_colliding_with_generated_id_rejected() {
        let raw = r#"{"title": "x", "steps": [
            {"title": "1", "action": {"type": "run_tests", "params": {}}},
            {"id": "step-1", "title": "2", "action": {"type": "run_tests", "params": {}}}
        ]}"#;
        assert!(matches!(parse_plan(raw), Err(EngineError::PlanningParse(_))));
    }

    #[test]
    fn test_truncated_plan_degrades_to_single_step() {
        let raw = r#"{"title": "Migrate schema", "steps": [
            {"title": "Read schema", "action": {"type": "read_file", "params": {"path": "db/schema.sql"}}},
            {"title": "Write schema", "action": {"type": "write_file", "params": {"path": "db/schema.sql", "content": "CREATE TA"#;
        assert!(matches!(parse_plan(raw), Err(EngineError::PlanningParse(_))));
        let task = task_from_plan_text(raw, "migrate schema");
        assert_eq!(task.steps.len(), 1);
        assert_eq!(task.steps[0].action.kind, "search_codebase");
        assert_eq!(task.metadata.get("plan_fallback"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_malformed_plan_degrades_to_single_step() {
        let task = task_from_plan_text("I could not come up with a plan", "fix the build");
        assert_eq!(task.steps.len(), 1);
        assert_eq!(task.steps[0].action.kind, "search_codebase");
        assert_eq!(task.steps[0].action.str_param("query"), Some("fix the build"));
        assert_eq!(task.metadata.get("plan_fallback"), Some(&Value::Bool(true)));
        assert!(task.steps[0].action.validate().is_ok());
    }
}
