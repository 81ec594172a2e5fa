//! 策略记忆：问题 → 方案 的跨会话学习
//!
//! - query：返回相似度严格超过接受阈值的前 N 个模式，按 相似度 / 成功率 / 新近度 综合排序，
//!   每个匹配附带可读的相关性说明；查询是存储内容的纯函数（新近度相对于库中最新模式计算）。
//! - upsert：签名已存在则按加权滚动平均更新成功率并增加使用次数，否则插入。
//! - 超过容量时淘汰保留分最低的模式（使用少、成功率低、最久未用）。
//! - 每次修改后写回 PatternStore；写失败只记录日志。

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::actions::Action;
use crate::memory::{PatternStore, ProblemSignature};

/// 排序权重：相似度 / 成功率 / 新近度
const RANK_SIMILARITY: f64 = 0.6;
const RANK_SUCCESS: f64 = 0.25;
const RANK_RECENCY: f64 = 0.15;

/// 保留分权重：使用次数 / 成功率 / 新近度
const KEEP_USAGE: f64 = 0.4;
const KEEP_SUCCESS: f64 = 0.4;
const KEEP_RECENCY: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct StrategyMemoryConfig {
    pub capacity: usize,
    /// 相似度必须严格超过该值（0-100）
    pub acceptance_threshold: f64,
    pub top_n: usize,
    /// 新观测在滚动平均中的权重
    pub rolling_weight: f64,
    pub recency_half_life_days: f64,
}

impl Default for StrategyMemoryConfig {
    fn default() -> Self {
        Self {
            capacity: 500,
            acceptance_threshold: 30.0,
            top_n: 5,
            rolling_weight: 0.3,
            recency_half_life_days: 30.0,
        }
    }
}

/// 已学到的策略模式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPattern {
    pub signature: ProblemSignature,
    pub approach: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// [0, 1]
    pub success_rate: f64,
    pub usage_count: u32,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StrategyPattern {
    pub fn new(
        signature: ProblemSignature,
        approach: impl Into<String>,
        action: Option<Action>,
        success_rate: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            signature,
            approach: approach.into(),
            action,
            success_rate: success_rate.clamp(0.0, 1.0),
            usage_count: 1,
            last_used: now,
            created_at: now,
        }
    }

    pub fn key(&self) -> String {
        self.signature.key()
    }
}

/// 查询结果
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyMatch {
    pub pattern: StrategyPattern,
    /// [0, 100]
    pub similarity: f64,
    pub score: f64,
    pub relevance: String,
}

pub struct StrategyMemory {
    config: StrategyMemoryConfig,
    patterns: BTreeMap<String, StrategyPattern>,
    store: Option<Box<dyn PatternStore>>,
}

impl StrategyMemory {
    pub fn in_memory(config: StrategyMemoryConfig) -> Self {
        Self {
            config,
            patterns: BTreeMap::new(),
            store: None,
        }
    }

    /// 从存储加载；加载后若超过容量立即裁剪
    pub fn open(config: StrategyMemoryConfig, store: Box<dyn PatternStore>) -> anyhow::Result<Self> {
        let loaded = store.load()?;
        let mut memory = Self {
            config,
            patterns: BTreeMap::new(),
            store: Some(store),
        };
        for pattern in loaded {
            memory.patterns.insert(pattern.key(), pattern);
        }
        tracing::info!(patterns = memory.patterns.len(), "strategy memory loaded");
        if !memory.prune().is_empty() {
            memory.persist();
        }
        Ok(memory)
    }

    pub fn config(&self) -> &StrategyMemoryConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn get(&self, signature: &ProblemSignature) -> Option<&StrategyPattern> {
        self.patterns.get(&signature.key())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &StrategyPattern> {
        self.patterns.values()
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        self.patterns.values().map(|p| p.last_used).max()
    }

    /// 相对于 newest 的新近度 (0, 1]，半衰期指数衰减
    fn recency(&self, pattern: &StrategyPattern, newest: DateTime<Utc>) -> f64 {
        let age_days = (newest - pattern.last_used).num_seconds().max(0) as f64 / 86_400.0;
        let half_life = self.config.recency_half_life_days.max(f64::EPSILON);
        0.5_f64.powf(age_days / half_life)
    }

    pub fn query(&self, signature: &ProblemSignature) -> Vec<StrategyMatch> {
        let Some(newest) = self.newest() else {
            return Vec::new();
        };
        let mut matches: Vec<(String, StrategyMatch)> = self
            .patterns
            .iter()
            .filter_map(|(key, p)| {
                let similarity = signature.similarity(&p.signature);
                if similarity <= self.config.acceptance_threshold {
                    return None;
                }
                let recency = self.recency(p, newest);
                let score = RANK_SIMILARITY * similarity / 100.0
                    + RANK_SUCCESS * p.success_rate
                    + RANK_RECENCY * recency;
                let relevance = format!(
                    "{:.0}% similar to a past {} step; {:.0}% success over {} use{}; last used {}",
                    similarity,
                    p.signature.action_type,
                    p.success_rate * 100.0,
                    p.usage_count,
                    if p.usage_count == 1 { "" } else { "s" },
                    p.last_used.format("%Y-%m-%d")
                );
                Some((
                    key.clone(),
                    StrategyMatch {
                        pattern: p.clone(),
                        similarity,
                        score,
                        relevance,
                    },
                ))
            })
            .collect();
        matches.sort_by(|(ka, a), (kb, b)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ka.cmp(kb))
        });
        matches
            .into_iter()
            .take(self.config.top_n)
            .map(|(_, m)| m)
            .collect()
    }

    /// 记录一次成功：observed_rate 为本次观测到的成功率（如 1/尝试次数）
    pub fn record_success(
        &mut self,
        signature: ProblemSignature,
        approach: impl Into<String>,
        action: Option<Action>,
        observed_rate: f64,
    ) -> Vec<String> {
        self.upsert(StrategyPattern::new(signature, approach, action, observed_rate))
    }

    /// 插入或更新；返回因超出容量被淘汰的键
    pub fn upsert(&mut self, pattern: StrategyPattern) -> Vec<String> {
        let key = pattern.key();
        let w = self.config.rolling_weight.clamp(0.0, 1.0);
        match self.patterns.get_mut(&key) {
            Some(existing) => {
                existing.success_rate =
                    (existing.success_rate * (1.0 - w) + pattern.success_rate * w).clamp(0.0, 1.0);
                existing.usage_count = existing.usage_count.saturating_add(1);
                existing.last_used = existing.last_used.max(pattern.last_used);
                existing.approach = pattern.approach;
                if pattern.action.is_some() {
                    existing.action = pattern.action;
                }
                tracing::debug!(key = %key, success_rate = existing.success_rate, "strategy pattern updated");
            }
            None => {
                tracing::debug!(key = %key, "strategy pattern learned");
                self.patterns.insert(key, pattern);
            }
        }
        let evicted = self.prune();
        self.persist();
        evicted
    }

    /// 记忆支撑的步骤最终失败：以 0 作为观测值更新成功率
    pub fn penalize(&mut self, signature: &ProblemSignature) -> bool {
        let w = self.config.rolling_weight.clamp(0.0, 1.0);
        let Some(existing) = self.patterns.get_mut(&signature.key()) else {
            return false;
        };
        existing.success_rate = (existing.success_rate * (1.0 - w)).clamp(0.0, 1.0);
        tracing::debug!(key = %signature.key(), success_rate = existing.success_rate, "strategy pattern penalized");
        self.persist();
        true
    }

    /// 保留分（越低越先被淘汰），按键排序
    pub fn retention_scores(&self) -> Vec<(String, f64)> {
        let Some(newest) = self.newest() else {
            return Vec::new();
        };
        let max_usage = self
            .patterns
            .values()
            .map(|p| p.usage_count)
            .max()
            .unwrap_or(0);
        let usage_norm = (1.0 + max_usage as f64).ln();
        self.patterns
            .iter()
            .map(|(key, p)| {
                let usage = if usage_norm > 0.0 {
                    (1.0 + p.usage_count as f64).ln() / usage_norm
                } else {
                    0.0
                };
                let score = KEEP_USAGE * usage
                    + KEEP_SUCCESS * p.success_rate
                    + KEEP_RECENCY * self.recency(p, newest);
                (key.clone(), score)
            })
            .collect()
    }

    /// 淘汰到容量以内；分数在淘汰前一次性计算
    fn prune(&mut self) -> Vec<String> {
        let capacity = self.config.capacity;
        if self.patterns.len() <= capacity {
            return Vec::new();
        }
        let excess = self.patterns.len() - capacity;
        let mut scores = self.retention_scores();
        scores.sort_by(|(ka, a), (kb, b)| {
            a.partial_cmp(b)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ka.cmp(kb))
        });
        let evicted: Vec<String> = scores.into_iter().take(excess).map(|(k, _)| k).collect();
        for key in &evicted {
            self.patterns.remove(key);
        }
        tracing::info!(evicted = evicted.len(), capacity, "strategy memory pruned");
        evicted
    }

    fn persist(&self) {
        if let Some(store) = &self.store {
            let snapshot: Vec<StrategyPattern> = self.patterns.values().cloned().collect();
            if let Err(e) = store.save(&snapshot) {
                tracing::warn!(error = %e, "failed to persist strategy memory");
            }
        }
    }

    /// 导出全部模式（备份）
    pub fn export_json(&self) -> anyhow::Result<String> {
        let patterns: Vec<&StrategyPattern> = self.patterns.values().collect();
        Ok(serde_json::to_string_pretty(&patterns)?)
    }

    /// 导入备份：同签名保留 last_used 较新的一条；返回新增或替换的数量
    pub fn import_json(&mut self, json: &str) -> anyhow::Result<usize> {
        let incoming: Vec<StrategyPattern> = serde_json::from_str(json)?;
        let mut changed = 0;
        for pattern in incoming {
            let key = pattern.key();
            let newer = self
                .patterns
                .get(&key)
                .map_or(true, |existing| pattern.last_used > existing.last_used);
            if newer {
                self.patterns.insert(key, pattern);
                changed += 1;
            }
        }
        self.prune();
        self.persist();
        Ok(changed)
    }
}
