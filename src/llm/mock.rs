//! Scripted LLM 客户端（用于测试与离线运行，无需 API）
//!
//! 按请求类型（prompt 首行 `REQUEST: <kind>`）排队预设回复；队列为空时返回默认回复，
//! 并记录收到的全部 prompt，便于断言引擎何时调用了协作方。token 用量按空白分词粗略计数。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, Message, Role, TokenUsage};

/// 预设回复客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    queues: Mutex<HashMap<String, VecDeque<String>>>,
    default_reply: String,
    prompts: Mutex<Vec<String>>,
    usage: TokenUsage,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self {
            default_reply: "NONE".to_string(),
            ..Self::default()
        }
    }

    /// 为某类请求追加一条回复（先进先出）
    pub fn on(self, kind: &str, reply: impl Into<String>) -> Self {
        if let Ok(mut queues) = self.queues.lock() {
            queues
                .entry(kind.to_string())
                .or_default()
                .push_back(reply.into());
        }
        self
    }

    pub fn with_default_reply(mut self, reply: impl Into<String>) -> Self {
        self.default_reply = reply.into();
        self
    }

    /// 已收到的 prompt（按时间顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// 某类请求被调用的次数
    pub fn count(&self, kind: &str) -> usize {
        self.prompts()
            .iter()
            .filter(|p| request_kind(p) == Some(kind))
            .count()
    }
}

fn request_kind(prompt: &str) -> Option<&str> {
    prompt
        .lines()
        .next()
        .and_then(|l| l.strip_prefix("REQUEST:"))
        .map(str::trim)
}

fn word_count(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.clone())
            .unwrap_or_default();
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(last_user.clone());
        }
        let reply = request_kind(&last_user).and_then(|kind| {
            self.queues
                .lock()
                .ok()
                .and_then(|mut q| q.get_mut(kind).and_then(|queue| queue.pop_front()))
        });
        let reply = reply.unwrap_or_else(|| self.default_reply.clone());
        let prompt_words: u64 = messages.iter().map(|m| word_count(&m.content)).sum();
        self.usage.add(prompt_words, word_count(&reply));
        Ok(reply)
    }
}
