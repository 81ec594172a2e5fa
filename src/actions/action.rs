//! 动作模型
//!
//! 计划中的动作以线格式 `{"type": "...", "params": {...}}` 出现（Action），
//! 分发前按动作类型的参数表（ParamSchema）校验：缺参、多参、类型错误都会得到明确的 ActionFailure，
//! 校验通过后转换为封闭的强类型联合 ActionCall 交给能力处理器。

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::ActionFailure;

/// 能力类型（固定但可扩展的集合）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ReadFile,
    WriteFile,
    EditFile,
    DeleteFile,
    CreateDirectory,
    RunCommand,
    SearchCodebase,
    AnalyzeCode,
    RefactorCode,
    GenerateCode,
    RunTests,
    GitCommit,
}

/// 动作风险分级：只读 < 修改 < 破坏性
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionRisk {
    ReadOnly,
    Mutating,
    Destructive,
}

/// 某一动作类型的参数名表
#[derive(Debug, Clone, Copy)]
pub struct ParamSchema {
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

impl ParamSchema {
    pub fn allows(&self, name: &str) -> bool {
        self.required.contains(&name) || self.optional.contains(&name)
    }
}

impl ActionType {
    pub const ALL: [ActionType; 12] = [
        ActionType::ReadFile,
        ActionType::WriteFile,
        ActionType::EditFile,
        ActionType::DeleteFile,
        ActionType::CreateDirectory,
        ActionType::RunCommand,
        ActionType::SearchCodebase,
        ActionType::AnalyzeCode,
        ActionType::RefactorCode,
        ActionType::GenerateCode,
        ActionType::RunTests,
        ActionType::GitCommit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::ReadFile => "read_file",
            ActionType::WriteFile => "write_file",
            ActionType::EditFile => "edit_file",
            ActionType::DeleteFile => "delete_file",
            ActionType::CreateDirectory => "create_directory",
            ActionType::RunCommand => "run_command",
            ActionType::SearchCodebase => "search_codebase",
            ActionType::AnalyzeCode => "analyze_code",
            ActionType::RefactorCode => "refactor_code",
            ActionType::GenerateCode => "generate_code",
            ActionType::RunTests => "run_tests",
            ActionType::GitCommit => "git_commit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|t| t.as_str().eq_ignore_ascii_case(s))
    }

    pub fn schema(&self) -> ParamSchema {
        let (required, optional): (&'static [&'static str], &'static [&'static str]) = match self {
            ActionType::ReadFile => (&["path"], &["encoding"]),
            ActionType::WriteFile => (&["path", "content"], &["create_dirs"]),
            ActionType::EditFile => (&["path", "old_text", "new_text"], &["replace_all"]),
            ActionType::DeleteFile => (&["path"], &[]),
            ActionType::CreateDirectory => (&["path"], &["recursive"]),
            ActionType::RunCommand => (&["command"], &["cwd", "timeout_secs"]),
            ActionType::SearchCodebase => (&["query"], &["path", "file_pattern"]),
            ActionType::AnalyzeCode => (&["path"], &["focus"]),
            ActionType::RefactorCode => (&["path", "instructions"], &[]),
            ActionType::GenerateCode => (&["description"], &["path", "language"]),
            ActionType::RunTests => (&[], &["command", "filter"]),
            ActionType::GitCommit => (&["message"], &["files"]),
        };
        ParamSchema { required, optional }
    }

    pub fn risk(&self) -> ActionRisk {
        match self {
            ActionType::ReadFile | ActionType::SearchCodebase | ActionType::AnalyzeCode => {
                ActionRisk::ReadOnly
            }
            ActionType::DeleteFile | ActionType::RunCommand | ActionType::GitCommit => {
                ActionRisk::Destructive
            }
            _ => ActionRisk::Mutating,
        }
    }

    /// 是否直接读写某个文件/目录（用于目标存在性启发）
    pub fn touches_files(&self) -> bool {
        matches!(
            self,
            ActionType::ReadFile
                | ActionType::WriteFile
                | ActionType::EditFile
                | ActionType::DeleteFile
                | ActionType::CreateDirectory
                | ActionType::AnalyzeCode
                | ActionType::RefactorCode
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 线格式动作：类型标签 + 参数表（计划输入与纠错建议都使用这一格式）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Action {
    /// 动作类型，如 read_file、write_file、run_command
    #[serde(rename = "type")]
    pub kind: String,
    /// 参数，字段名由动作类型决定
    #[serde(default)]
    pub params: Map<String, Value>,
}

impl Action {
    pub fn new(kind: ActionType, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            kind: kind.as_str().to_string(),
            params,
        }
    }

    pub fn action_type(&self) -> Option<ActionType> {
        ActionType::parse(&self.kind)
    }

    pub fn risk(&self) -> ActionRisk {
        self.action_type()
            .map(|t| t.risk())
            .unwrap_or(ActionRisk::Destructive)
    }

    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.params.get(name).and_then(|v| v.as_str())
    }

    /// 动作作用的路径（若有）
    pub fn target_path(&self) -> Option<&str> {
        self.str_param("path")
    }

    /// 按参数表校验并转换为强类型 ActionCall
    pub fn validate(&self) -> Result<ActionCall, ActionFailure> {
        let action_type = self
            .action_type()
            .ok_or_else(|| ActionFailure::UnknownActionType {
                action: self.kind.clone(),
            })?;
        let schema = action_type.schema();
        let name = action_type.as_str().to_string();

        for param in schema.required {
            match self.params.get(*param) {
                None | Some(Value::Null) => {
                    return Err(ActionFailure::MissingParameter {
                        action: name,
                        param: param.to_string(),
                    })
                }
                _ => {}
            }
        }
        // 稳定顺序，保证错误信息可复现
        let mut keys: Vec<&String> = self.params.keys().collect();
        keys.sort();
        if let Some(extra) = keys.into_iter().find(|k| !schema.allows(k)) {
            return Err(ActionFailure::UnexpectedParameter {
                action: name,
                param: extra.clone(),
            });
        }

        let tagged = serde_json::json!({
            "type": name,
            "params": Value::Object(self.params.clone()),
        });
        serde_json::from_value(tagged).map_err(|e| ActionFailure::InvalidParameter {
            action: action_type.as_str().to_string(),
            reason: e.to_string(),
        })
    }

    /// 简短描述（日志、提示词用）
    pub fn summary(&self) -> String {
        match self.target_path().or_else(|| self.str_param("command")) {
            Some(target) => format!("{} {}", self.kind, target),
            None => self.kind.clone(),
        }
    }
}

impl From<ActionCall> for Action {
    fn from(call: ActionCall) -> Self {
        match serde_json::to_value(&call) {
            Ok(Value::Object(mut map)) => {
                let params = match map.remove("params") {
                    Some(Value::Object(p)) => p,
                    _ => Map::new(),
                };
                Action {
                    kind: call.action_type().as_str().to_string(),
                    params,
                }
            }
            _ => Action {
                kind: call.action_type().as_str().to_string(),
                params: Map::new(),
            },
        }
    }
}

/// 已校验的强类型动作（封闭联合），能力处理器只接收这一类型
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "snake_case")]
pub enum ActionCall {
    ReadFile {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },
    WriteFile {
        path: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        create_dirs: Option<bool>,
    },
    EditFile {
        path: String,
        old_text: String,
        new_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replace_all: Option<bool>,
    },
    DeleteFile {
        path: String,
    },
    CreateDirectory {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        recursive: Option<bool>,
    },
    RunCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    SearchCodebase {
        query: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_pattern: Option<String>,
    },
    AnalyzeCode {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        focus: Option<String>,
    },
    RefactorCode {
        path: String,
        instructions: String,
    },
    GenerateCode {
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    RunTests {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter: Option<String>,
    },
    GitCommit {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        files: Option<Vec<String>>,
    },
}

impl ActionCall {
    pub fn action_type(&self) -> ActionType {
        match self {
            ActionCall::ReadFile { .. } => ActionType::ReadFile,
            ActionCall::WriteFile { .. } => ActionType::WriteFile,
            ActionCall::EditFile { .. } => ActionType::EditFile,
            ActionCall::DeleteFile { .. } => ActionType::DeleteFile,
            ActionCall::CreateDirectory { .. } => ActionType::CreateDirectory,
            ActionCall::RunCommand { .. } => ActionType::RunCommand,
            ActionCall::SearchCodebase { .. } => ActionType::SearchCodebase,
            ActionCall::AnalyzeCode { .. } => ActionType::AnalyzeCode,
            ActionCall::RefactorCode { .. } => ActionType::RefactorCode,
            ActionCall::GenerateCode { .. } => ActionType::GenerateCode,
            ActionCall::RunTests { .. } => ActionType::RunTests,
            ActionCall::GitCommit { .. } => ActionType::GitCommit,
        }
    }
}
