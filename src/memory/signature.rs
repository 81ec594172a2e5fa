//! 问题签名
//!
//! 由步骤目标（标题 + 描述）、动作类型与上下文（任务标题、目标文件扩展名）归一化得到，
//! 用作策略记忆的索引键与相似度计算的输入。

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::{Step, Task};

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "into", "that", "this", "then", "than", "are", "was",
    "use", "all", "any", "its", "our", "your", "new", "add", "via", "per", "not", "but", "file",
    "step",
];

/// 相似度权重：动作类型 / 目标词 / 上下文词，合计 100
const ACTION_WEIGHT: f64 = 40.0;
const GOAL_WEIGHT: f64 = 45.0;
const CONTEXT_WEIGHT: f64 = 15.0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemSignature {
    pub action_type: String,
    pub goal_terms: BTreeSet<String>,
    pub context_terms: BTreeSet<String>,
}

impl ProblemSignature {
    pub fn new(goal: &str, action_type: &str, context: &str) -> Self {
        Self {
            action_type: action_type.trim().to_lowercase(),
            goal_terms: terms(goal),
            context_terms: terms(context),
        }
    }

    /// 从任务中的步骤派生签名
    pub fn for_step(step: &Step, task: &Task) -> Self {
        let goal = format!("{} {}", step.title, step.description);
        let mut context = task.title.clone();
        if let Some(ext) = step
            .action
            .target_path()
            .and_then(|p| std::path::Path::new(p).extension())
            .and_then(|e| e.to_str())
        {
            context.push_str(" ext_");
            context.push_str(ext);
        }
        Self::new(&goal, &step.action.kind, &context)
    }

    /// 存储键：同一签名的成功只会更新，不会重复插入
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.action_type,
            self.goal_terms.iter().cloned().collect::<Vec<_>>().join(","),
            self.context_terms.iter().cloned().collect::<Vec<_>>().join(",")
        )
    }

    /// 相似度 [0, 100]；目标词不相交时为 0，动作与上下文相同也不算匹配
    pub fn similarity(&self, other: &ProblemSignature) -> f64 {
        let goal_overlap = jaccard(&self.goal_terms, &other.goal_terms);
        if goal_overlap == 0.0 {
            return 0.0;
        }
        let action = if self.action_type == other.action_type {
            ACTION_WEIGHT
        } else {
            0.0
        };
        let goal = GOAL_WEIGHT * goal_overlap;
        let context = CONTEXT_WEIGHT * jaccard(&self.context_terms, &other.context_terms);
        (action + goal + context).clamp(0.0, 100.0)
    }
}

fn terms(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| !t.chars().all(|c| c.is_ascii_digit()))
        .filter(|t| !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

/// 两个空集合视为完全相同
fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let inter = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}
