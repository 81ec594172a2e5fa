//! stepwise - Rust 自主多步任务执行引擎
//!
//! 模块划分：
//! - **actions**: 动作模型与参数校验、能力注册表、分发器、参考处理器（沙箱文件系统 / 白名单命令）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务模型、计划解析、审批与执行控制、事件流、执行引擎
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Scripted）、推理协作方适配器
//! - **memory**: 策略记忆（跨会话学习）与任务快照
//! - **planning**: 执行前信心评估与备选计划
//! - **react**: ReAct 周期、自我纠错、元认知监控
//! - **transaction**: 事务性修订（原子应用、逆序回滚、修订分组）

pub mod actions;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod planning;
pub mod react;
pub mod transaction;

pub use crate::core::{EngineBuilder, ExecutionEngine, Task, TaskSession};
