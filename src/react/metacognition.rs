//! 元认知监控
//!
//! 被动观察每个步骤的开始时间与每次失败尝试的（归一化）错误文本，三个检测器各自足以触发升级：
//! - repeated_error：同一步骤内同一归一化错误出现 ≥ 阈值次
//! - timeout：步骤墙钟时间超过阈值仍未解决（在尝试边界检查）
//! - no_progress：跨步骤连续失败尝试 ≥ 阈值次（不论错误是否相同）
//!
//! 每次观察最多产生一个信号（优先级 repeated_error > timeout > no_progress），触发后对应计数清零。
//! 每个任务的升级次数有硬上限，达到上限后再出现的信号使任务失败而不是继续循环。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{Collaborator, RequestKind};

/// 错误归一化规则：去掉每次都会变化的部分（uuid、十六进制地址、数字）
static NORMALIZERS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (
            r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
            "<id>",
        ),
        (r"0x[0-9a-fA-F]+", "<hex>"),
        (r"\d+(\.\d+)?", "<n>"),
        (r"\s+", " "),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// 归一化错误文本
pub fn normalize_error(error: &str) -> String {
    let mut text = error.trim().to_lowercase();
    for (re, replacement) in NORMALIZERS.iter() {
        text = re.replace_all(&text, *replacement).into_owned();
    }
    text.trim().to_string()
}

#[derive(Debug, Clone)]
pub struct MetacognitionConfig {
    pub repeated_error_threshold: u32,
    pub step_timeout: Duration,
    pub no_progress_threshold: u32,
    pub max_escalations: u32,
}

impl Default for MetacognitionConfig {
    fn default() -> Self {
        Self {
            repeated_error_threshold: 3,
            step_timeout: Duration::from_secs(30),
            no_progress_threshold: 3,
            max_escalations: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckKind {
    RepeatedError,
    Timeout,
    NoProgress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Retry,
    Alternative,
    SeekHelp,
    Abort,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::Retry => "retry",
            Recommendation::Alternative => "alternative",
            Recommendation::SeekHelp => "seek_help",
            Recommendation::Abort => "abort",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "retry" => Some(Self::Retry),
            "alternative" => Some(Self::Alternative),
            "seek_help" | "help" => Some(Self::SeekHelp),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }
}

/// 卡住信号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckSignal {
    pub kind: StuckKind,
    pub step_id: String,
    pub evidence: String,
    pub recommendation: Recommendation,
}

/// 升级结果：协作方的建议与指导（用于引导下一次纠错）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Escalation {
    pub signal: StuckSignal,
    pub recommendation: Recommendation,
    pub guidance: Option<String>,
    /// 本任务第几次升级
    pub count: u32,
}

pub struct MetacognitiveMonitor {
    config: MetacognitionConfig,
    step_id: Option<String>,
    step_started: Option<Instant>,
    timeout_flagged: bool,
    step_errors: HashMap<String, u32>,
    consecutive_failures: u32,
    escalations: u32,
}

impl MetacognitiveMonitor {
    pub fn new(config: MetacognitionConfig) -> Self {
        Self {
            config,
            step_id: None,
            step_started: None,
            timeout_flagged: false,
            step_errors: HashMap::new(),
            consecutive_failures: 0,
            escalations: 0,
        }
    }

    pub fn config(&self) -> &MetacognitionConfig {
        &self.config
    }

    pub fn step_started(&mut self, step_id: &str) {
        self.step_id = Some(step_id.to_string());
        self.step_started = Some(Instant::now());
        self.timeout_flagged = false;
        self.step_errors.clear();
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// 记录一次失败尝试；最多返回一个信号
    pub fn record_failure(&mut self, step_id: &str, error: &str) -> Option<StuckSignal> {
        if self.step_id.as_deref() != Some(step_id) {
            self.step_started(step_id);
        }
        let normalized = normalize_error(error);
        let count = self.step_errors.entry(normalized.clone()).or_insert(0);
        *count += 1;
        let repeated = *count;
        self.consecutive_failures += 1;

        if repeated >= self.config.repeated_error_threshold {
            self.step_errors.remove(&normalized);
            return Some(StuckSignal {
                kind: StuckKind::RepeatedError,
                step_id: step_id.to_string(),
                evidence: format!("same error {} times: {}", repeated, normalized),
                recommendation: Recommendation::Alternative,
            });
        }

        if let Some(elapsed) = self.step_started.map(|s| s.elapsed()) {
            if !self.timeout_flagged && elapsed > self.config.step_timeout {
                self.timeout_flagged = true;
                return Some(StuckSignal {
                    kind: StuckKind::Timeout,
                    step_id: step_id.to_string(),
                    evidence: format!(
                        "step running for {}s (threshold {}s)",
                        elapsed.as_secs(),
                        self.config.step_timeout.as_secs()
                    ),
                    recommendation: Recommendation::Retry,
                });
            }
        }

        if self.consecutive_failures >= self.config.no_progress_threshold {
            let failures = self.consecutive_failures;
            self.consecutive_failures = 0;
            return Some(StuckSignal {
                kind: StuckKind::NoProgress,
                step_id: step_id.to_string(),
                evidence: format!("{} consecutive failed attempts", failures),
                recommendation: Recommendation::SeekHelp,
            });
        }
        None
    }

    pub fn escalations(&self) -> u32 {
        self.escalations
    }

    /// 申请一次升级；已达上限返回 None
    pub fn try_escalate(&mut self) -> Option<u32> {
        if self.escalations >= self.config.max_escalations {
            return None;
        }
        self.escalations += 1;
        Some(self.escalations)
    }
}

#[derive(Debug, Deserialize)]
struct EscalationReply {
    #[serde(default)]
    recommendation: String,
    #[serde(default)]
    guidance: Option<String>,
}

/// 带着完整卡住上下文向协作方求助；无协作方或回复无法解析时沿用信号自带的建议
pub async fn request_guidance(
    collaborator: Option<&Arc<Collaborator>>,
    signal: StuckSignal,
    context: Value,
    count: u32,
) -> Escalation {
    let reply = match collaborator {
        Some(c) => {
            let request = serde_json::json!({ "signal": signal, "context": context });
            c.ask::<EscalationReply>(RequestKind::Escalation, &request)
                .await
        }
        None => None,
    };
    let (recommendation, guidance) = match reply {
        Some(r) => (
            Recommendation::parse(&r.recommendation).unwrap_or(signal.recommendation),
            r.guidance.filter(|g| !g.trim().is_empty()),
        ),
        None => (signal.recommendation, None),
    };
    Escalation {
        signal,
        recommendation,
        guidance,
        count,
    }
}
