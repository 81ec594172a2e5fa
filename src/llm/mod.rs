//! LLM 层：客户端抽象、实现（OpenAI 兼容 / Scripted）与推理协作方适配器

pub mod collaborator;
pub mod mock;
pub mod openai;
pub mod traits;

pub use collaborator::{
    extract_json, parse_complete_reply, parse_reply, Collaborator, ExtractedJson, RequestKind,
};
pub use mock::ScriptedLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, Message, Role};
