//! 记忆层：问题签名、策略记忆（跨会话学习）、模式存储、任务快照

pub mod signature;
pub mod snapshot;
pub mod store;
pub mod strategy;

pub use signature::ProblemSignature;
pub use snapshot::{SqliteSnapshotStore, TaskSnapshotStore};
pub use store::{InMemoryStore, JsonFileStore, PatternStore};
pub use strategy::{StrategyMatch, StrategyMemory, StrategyMemoryConfig, StrategyPattern};
