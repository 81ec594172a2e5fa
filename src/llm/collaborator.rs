//! 推理协作方适配器
//!
//! 自我纠错、元认知升级、ReAct 思考/反思、备选计划生成都通过同一个窄接口（prompt 进，文本出）调用 LLM，
//! 引擎逻辑不与具体模型或传输耦合。回复解析是防御性的：容忍 Markdown 包裹、前后说明文字与截断，
//! 解析失败一律视为「没有建议」，绝不让引擎崩溃。

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::timeout;

use crate::core::EngineError;
use crate::llm::{LlmClient, Message};

const DEFAULT_SYSTEM_PROMPT: &str = "You are the reasoning collaborator of an autonomous task \
execution engine. Answer every request with a single JSON object in the requested format and \
nothing else.";

/// 协作请求类型（决定提示词中的回复格式说明）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Thought,
    Reflection,
    SelfCorrection,
    Escalation,
    FallbackPlans,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Thought => "thought",
            RequestKind::Reflection => "reflection",
            RequestKind::SelfCorrection => "self_correction",
            RequestKind::Escalation => "escalation",
            RequestKind::FallbackPlans => "fallback_plans",
        }
    }

    /// 回复是否会直接变成可执行动作；这类回复被截断时不做补全
    pub fn yields_actions(&self) -> bool {
        matches!(self, RequestKind::SelfCorrection | RequestKind::FallbackPlans)
    }

    fn instructions(&self) -> &'static str {
        match self {
            RequestKind::Thought => {
                "Before the step is executed, state how you expect it to go. Respond with JSON: \
                 {\"approach\": string, \"reasoning\": string, \"confidence\": 0-100, \
                 \"risks\": [string], \"expected_outcome\": string}"
            }
            RequestKind::Reflection => {
                "Reflect on the finished step. Respond with JSON: {\"knowledge_gained\": string, \
                 \"what_worked\": [string], \"what_failed\": [string], \"root_cause\": string or null}"
            }
            RequestKind::SelfCorrection => {
                "The action failed. Propose ONE alternative action using exactly the parameter \
                 names of its type. Respond with JSON: {\"action\": {\"type\": string, \"params\": \
                 object}, \"reasoning\": string}. If there is no better alternative respond with \
                 {\"no_alternative\": true, \"reasoning\": string}"
            }
            RequestKind::Escalation => {
                "Execution appears to be stuck. Respond with JSON: {\"recommendation\": \
                 \"retry\" | \"alternative\" | \"seek_help\" | \"abort\", \"guidance\": string}"
            }
            RequestKind::FallbackPlans => {
                "The step is risky. Propose 1-3 fallback actions. Respond with JSON: \
                 {\"fallbacks\": [{\"trigger\": string, \"reasoning\": string, \"confidence\": \
                 0-100, \"action\": {\"type\": string, \"params\": object}}]}"
            }
        }
    }
}

/// 推理协作方：持有 LLM 传输、system prompt 与单次调用超时
pub struct Collaborator {
    llm: Arc<dyn LlmClient>,
    system_prompt: String,
    timeout: Duration,
}

impl Collaborator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// 底层 LLM 累计 token 使用 (prompt, completion, total)
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 发送结构化上下文，返回原始文本
    pub async fn send(&self, kind: RequestKind, context: &Value) -> Result<String, EngineError> {
        let body = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
        let prompt = format!(
            "REQUEST: {}\n{}\n\nContext:\n{}",
            kind.as_str(),
            kind.instructions(),
            body
        );
        let messages = [
            Message::system(self.system_prompt.clone()),
            Message::user(prompt),
        ];
        match timeout(self.timeout, self.llm.complete(&messages)).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(EngineError::Collaborator(e)),
            Err(_) => Err(EngineError::Collaborator(format!(
                "{} request timed out after {}s",
                kind.as_str(),
                self.timeout.as_secs()
            ))),
        }
    }

    /// 发送并解析为结构化回复；任何失败都返回 None
    pub async fn ask<T: DeserializeOwned>(&self, kind: RequestKind, context: &Value) -> Option<T> {
        match self.send(kind, context).await {
            Ok(text) => {
                let parsed = if kind.yields_actions() {
                    parse_complete_reply(&text)
                } else {
                    parse_reply(&text)
                };
                if parsed.is_none() {
                    tracing::debug!(request = kind.as_str(), reply = %preview(&text), "unparseable collaborator reply");
                }
                parsed
            }
            Err(e) => {
                tracing::warn!(request = kind.as_str(), error = %e, "collaborator request failed");
                None
            }
        }
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > 200 {
        format!("{}...", text.chars().take(200).collect::<String>())
    } else {
        text.to_string()
    }
}

/// 提取出的 JSON 文本；repaired 表示原文被截断、括号是补全的
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedJson {
    pub json: String,
    pub repaired: bool,
}

/// 从回复文本中提取 JSON 并反序列化（接受补全后的截断回复）
pub fn parse_reply<T: DeserializeOwned>(text: &str) -> Option<T> {
    let extracted = extract_json(text)?;
    serde_json::from_str(&extracted.json).ok()
}

/// 同 parse_reply，但截断的回复视为解析失败
pub fn parse_complete_reply<T: DeserializeOwned>(text: &str) -> Option<T> {
    let extracted = extract_json(text)?;
    if extracted.repaired {
        tracing::debug!(reply = %preview(text), "truncated reply rejected");
        return None;
    }
    serde_json::from_str(&extracted.json).ok()
}

/// 提取回复中的 JSON（```json 代码块、夹杂文字的对象、被截断的对象）
pub fn extract_json(text: &str) -> Option<ExtractedJson> {
    let trimmed = text.trim();
    let body = match trimmed.find("```") {
        Some(fence) => {
            let rest = &trimmed[fence + 3..];
            // 跳过语言标记（json / JSON / 空）
            let rest = match rest.find('\n') {
                Some(nl) if !rest[..nl].contains('{') => &rest[nl + 1..],
                _ => rest,
            };
            rest.find("```").map(|end| &rest[..end]).unwrap_or(rest)
        }
        None => trimmed,
    };

    let start = body.find(['{', '['])?;
    let candidate = &body[start..];
    match balanced_end(candidate) {
        Some(end) => Some(ExtractedJson {
            json: candidate[..end].to_string(),
            repaired: false,
        }),
        None => repair_truncated(candidate).map(|json| ExtractedJson {
            json,
            repaired: true,
        }),
    }
}

/// 找到与首个括号配对的结束位置（字节偏移，含结束括号）
fn balanced_end(s: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

/// 补全被截断的 JSON：闭合字符串与未闭合的括号
fn repair_truncated(s: &str) -> Option<String> {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in s.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }
    let mut repaired = s.trim_end().to_string();
    if escaped {
        repaired.pop();
    }
    if in_string {
        repaired.push('"');
    }
    let trimmed = repaired.trim_end();
    if trimmed.ends_with(',') {
        repaired = trimmed.trim_end_matches(',').to_string();
    } else if trimmed.ends_with(':') {
        repaired = format!("{} null", trimmed);
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    serde_json::from_str::<Value>(&repaired).ok().map(|_| repaired)
}
