//! 命令执行能力：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串；
//! 通过 sh -c / cmd /C 在沙箱目录内执行，带超时。run_tests 复用同一套检查。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tokio::process::Command;

use crate::actions::{ActionCall, ActionType, CapabilityHandler, Sandbox};
use crate::core::{ActionFailure, StepResult};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:",
];

/// 命令替换与重定向一律拒绝
const FORBIDDEN_SYNTAX: &[&str] = &["`", "$(", "${", ">", "<"];

/// 命令串联符：拆开后每一段的首词都要在白名单内
static CHAIN_OPERATORS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"&&|\|\||[;|&\n]").ok());

/// 输出截断长度（写入 StepResult.data）
const OUTPUT_LIMIT: usize = 8 * 1024;

/// 命令守卫：白名单 + 禁止子串
#[derive(Debug, Clone)]
pub struct CommandGuard {
    allowed_commands: HashSet<String>,
}

impl CommandGuard {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self {
            allowed_commands: allowed_commands
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect(),
        }
    }

    pub fn check(&self, raw: &str) -> Result<(), ActionFailure> {
        let raw_lower = raw.to_lowercase();
        if let Some(forbidden) = FORBIDDEN_SUBSTR.iter().find(|f| raw_lower.contains(*f)) {
            return Err(ActionFailure::PermissionDenied {
                detail: format!("forbidden pattern: {}", forbidden),
            });
        }
        if let Some(syntax) = FORBIDDEN_SYNTAX.iter().find(|f| raw_lower.contains(*f)) {
            return Err(ActionFailure::PermissionDenied {
                detail: format!("shell syntax not allowed: {}", syntax),
            });
        }
        if raw_lower.trim().is_empty() {
            return Err(ActionFailure::InvalidParameter {
                action: "run_command".to_string(),
                reason: "empty command".to_string(),
            });
        }
        let Some(chain) = CHAIN_OPERATORS.as_ref() else {
            return Err(ActionFailure::PermissionDenied {
                detail: "command parser unavailable".to_string(),
            });
        };
        for segment in chain.split(&raw_lower) {
            let name = segment.split_whitespace().next().unwrap_or("");
            if name.is_empty() {
                return Err(ActionFailure::InvalidParameter {
                    action: "run_command".to_string(),
                    reason: "empty command segment".to_string(),
                });
            }
            if !self.allowed_commands.contains(name) {
                return Err(ActionFailure::PermissionDenied {
                    detail: format!("command '{}' not in allowlist", name),
                });
            }
        }
        Ok(())
    }
}

fn truncate(s: &str) -> String {
    if s.len() > OUTPUT_LIMIT {
        let mut end = OUTPUT_LIMIT;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated]", &s[..end])
    } else {
        s.to_string()
    }
}

/// 在 cwd 内执行命令，非零退出码视为失败
async fn run_shell(
    action: ActionType,
    command: &str,
    cwd: &std::path::Path,
    timeout_secs: u64,
) -> Result<StepResult, ActionFailure> {
    let mut cmd = if cfg!(target_os = "windows") {
        let mut c = Command::new("cmd");
        c.args(["/C", command]);
        c
    } else {
        let mut c = Command::new("sh");
        c.args(["-c", command]);
        c
    };
    cmd.current_dir(cwd).kill_on_drop(true);

    tracing::info!(command = %command, cwd = %cwd.display(), "shell execute");
    let output = tokio::time::timeout(Duration::from_secs(timeout_secs), cmd.output())
        .await
        .map_err(|_| ActionFailure::Timeout {
            action: action.as_str().to_string(),
            secs: timeout_secs,
        })?
        .map_err(|e| ActionFailure::handler(action.as_str(), format!("spawn failed: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code();
    if !output.status.success() {
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ActionFailure::handler(
            action.as_str(),
            format!("exit {:?}: {}", exit_code, tail.trim()),
        ));
    }
    Ok(StepResult::ok(format!("`{}` exited successfully", command)).with_data(json!({
        "exit_code": exit_code,
        "stdout": truncate(&stdout),
        "stderr": truncate(&stderr),
    })))
}

/// run_command 处理器
pub struct RunCommandHandler {
    fs: Sandbox,
    guard: CommandGuard,
    timeout_secs: u64,
}

impl RunCommandHandler {
    pub fn new(fs: Sandbox, guard: CommandGuard, timeout_secs: u64) -> Self {
        Self {
            fs,
            guard,
            timeout_secs,
        }
    }
}

#[async_trait]
impl CapabilityHandler for RunCommandHandler {
    fn action_type(&self) -> ActionType {
        ActionType::RunCommand
    }

    fn description(&self) -> &str {
        "Run an allow-listed shell command inside the workspace"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::RunCommand {
            command,
            cwd,
            timeout_secs,
        } = call
        else {
            return Err(ActionFailure::InvalidParameter {
                action: "run_command".to_string(),
                reason: format!("handler received {}", call.action_type()),
            });
        };
        let command = command.trim();
        self.guard.check(command)?;
        let dir = match cwd {
            Some(cwd) => self.fs.resolve(cwd)?,
            None => self.fs.root().to_path_buf(),
        };
        let secs = timeout_secs.unwrap_or(self.timeout_secs).min(self.timeout_secs);
        run_shell(ActionType::RunCommand, command, &dir, secs).await
    }
}

/// run_tests 处理器：默认命令 + 可选过滤参数
pub struct RunTestsHandler {
    fs: Sandbox,
    guard: CommandGuard,
    default_command: String,
    timeout_secs: u64,
}

impl RunTestsHandler {
    pub fn new(
        fs: Sandbox,
        guard: CommandGuard,
        default_command: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            fs,
            guard,
            default_command: default_command.into(),
            timeout_secs,
        }
    }
}

#[async_trait]
impl CapabilityHandler for RunTestsHandler {
    fn action_type(&self) -> ActionType {
        ActionType::RunTests
    }

    fn description(&self) -> &str {
        "Run the project test command, optionally filtered"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::RunTests { command, filter } = call else {
            return Err(ActionFailure::InvalidParameter {
                action: "run_tests".to_string(),
                reason: format!("handler received {}", call.action_type()),
            });
        };
        let base = command.as_deref().unwrap_or(&self.default_command).trim();
        let full = match filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
            Some(f) => format!("{} {}", base, f),
            None => base.to_string(),
        };
        self.guard.check(&full)?;
        run_shell(ActionType::RunTests, &full, self.fs.root(), self.timeout_secs).await
    }
}
