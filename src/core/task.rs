//! 任务与步骤数据模型
//!
//! Task 由外部规划器创建，只由执行引擎修改；进入 completed / failed / cancelled 后即为终态。
//! Step 归属于唯一的父 Task。skipped 是独立终态，进度统计中不得与 completed 混淆。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::actions::Action;
use crate::planning::{ConfidenceAssessment, FallbackPlan, TaskInsights};
use crate::react::ReactCycle;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    AwaitingApproval,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Planning => "planning",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// 已有结论（恢复执行时跳过）
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed | StepStatus::Rejected
        )
    }
}

/// 步骤执行结果；data 对引擎不透明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default)]
    pub skipped: bool,
}

impl StepResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            skipped: false,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            skipped: false,
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            skipped: true,
        }
    }
}

/// 计划中的单个步骤
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub action: Action,
    pub status: StepStatus,
    pub order: usize,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default)]
    pub requires_approval: bool,
    /// 重试耗尽后记为 skipped 而不是让任务失败
    #[serde(default)]
    pub skippable: bool,
    /// 与之构成原子修订组的其他步骤 id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<ConfidenceAssessment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallbacks: Vec<FallbackPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub react_cycle: Option<ReactCycle>,
}

impl Step {
    pub fn new(id: impl Into<String>, title: impl Into<String>, action: Action) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            action,
            status: StepStatus::Pending,
            order: 0,
            retry_count: 0,
            max_retries: super::plan::DEFAULT_MAX_RETRIES,
            requires_approval: false,
            skippable: false,
            links: Vec::new(),
            confidence: None,
            fallbacks: Vec::new(),
            result: None,
            error: None,
            react_cycle: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn skippable(mut self) -> Self {
        self.skippable = true;
        self
    }

    pub fn linked_to(mut self, ids: &[&str]) -> Self {
        self.links = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    /// 总尝试次数上限：首次 + max_retries 次重试
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// 进度统计（completed 与 skipped 分开计数）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TaskProgress {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total: usize,
}

/// 任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insights: Option<TaskInsights>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            steps: Vec::new(),
            status: TaskStatus::Planning,
            created_at: Utc::now(),
            metadata: Map::new(),
            error: None,
            insights: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// 追加步骤，order 按插入顺序编号
    pub fn with_step(mut self, mut step: Step) -> Self {
        step.order = self.steps.len();
        self.steps.push(step);
        self
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn progress(&self) -> TaskProgress {
        let mut progress = TaskProgress {
            total: self.steps.len(),
            ..TaskProgress::default()
        };
        for step in &self.steps {
            match step.status {
                StepStatus::Completed => progress.completed += 1,
                StepStatus::Skipped => progress.skipped += 1,
                StepStatus::Failed => progress.failed += 1,
                _ => {}
            }
        }
        progress
    }

    /// 给纠错 / 升级提示词使用的任务上下文
    pub fn context_summary(&self) -> String {
        let steps: Vec<String> = self
            .steps
            .iter()
            .map(|s| format!("{}. [{:?}] {}", s.order + 1, s.status, s.title))
            .collect();
        format!(
            "Task: {}\n{}\nSteps:\n{}",
            self.title,
            self.description,
            steps.join("\n")
        )
    }
}
