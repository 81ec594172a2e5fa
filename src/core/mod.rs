//! 核心执行层：任务模型与错误、计划解析、审批与执行控制、事件流、执行引擎与构建器

pub mod approval;
pub mod backoff;
pub mod builder;
pub mod control;
pub mod engine;
pub mod error;
pub mod events;
pub mod plan;
pub mod session;
pub mod task;

pub use approval::{impact_summary, ApprovalGate, ApprovalRequest, AutoApprove, ChannelApproval};
pub use backoff::{BackoffKind, RetryPolicy};
pub use builder::EngineBuilder;
pub use control::ExecutionControl;
pub use engine::{EngineConfig, ExecutionEngine};
pub use error::{ActionFailure, EngineError};
pub use events::{EventSink, ExecutionEvent};
pub use plan::{parse_plan, task_from_plan_text, PlanInput, PlanStep, DEFAULT_MAX_RETRIES};
pub use session::TaskSession;
pub use task::{Step, StepResult, StepStatus, Task, TaskProgress, TaskStatus};
