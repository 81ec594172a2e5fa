//! 动作层：动作模型与校验、能力注册表、分发器、参考能力处理器

pub mod action;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;
pub mod shell;

pub use action::{Action, ActionCall, ActionRisk, ActionType, ParamSchema};
pub use executor::ActionDispatcher;
pub use filesystem::{register_filesystem_handlers, Sandbox};
pub use registry::{CapabilityHandler, CapabilityRegistry};
pub use schema::action_schema_json;
pub use shell::{CommandGuard, RunCommandHandler, RunTestsHandler};
