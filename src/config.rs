//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STEPWISE__*` 覆盖（双下划线表示嵌套，如 `STEPWISE__RETRY__BASE_DELAY_MS=100`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::{BackoffKind, EngineConfig, RetryPolicy};
use crate::memory::StrategyMemoryConfig;
use crate::react::MetacognitionConfig;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub retry: RetrySection,
    pub metacognition: MetacognitionSection,
    pub memory: MemorySection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录、数据目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    /// 沙箱根目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
    /// 策略记忆与任务快照所在目录
    pub data_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "stepwise".to_string(),
            workspace_root: None,
            data_dir: PathBuf::from(".stepwise"),
        }
    }
}

/// [llm] 段：推理协作方（OpenAI 兼容接口）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 关闭后所有推理走本地启发式
    pub enabled: bool,
    pub model: String,
    pub base_url: String,
    /// 存放 API Key 的环境变量名
    pub api_key_env: String,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            request_timeout_secs: 60,
        }
    }
}

impl LlmSection {
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

/// [engine] 段：特性开关
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub react: bool,
    pub confidence: bool,
    pub learning: bool,
    /// 单次能力调用超时（秒）
    pub action_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            react: true,
            confidence: true,
            learning: true,
            action_timeout_secs: 30,
        }
    }
}

impl From<&EngineSection> for EngineConfig {
    fn from(s: &EngineSection) -> Self {
        EngineConfig {
            react_enabled: s.react,
            confidence_enabled: s.confidence,
            learning_enabled: s.learning,
        }
    }
}

/// [retry] 段：退避策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub backoff: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(s: &RetrySection) -> Self {
        RetryPolicy {
            kind: s.backoff,
            base_delay: Duration::from_millis(s.base_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms.max(s.base_delay_ms)),
            multiplier: s.multiplier,
            jitter: s.jitter,
        }
    }
}

/// [metacognition] 段：卡住检测阈值与升级上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetacognitionSection {
    pub repeated_error_threshold: u32,
    pub step_timeout_secs: u64,
    pub no_progress_threshold: u32,
    pub max_escalations: u32,
}

impl Default for MetacognitionSection {
    fn default() -> Self {
        Self {
            repeated_error_threshold: 3,
            step_timeout_secs: 30,
            no_progress_threshold: 3,
            max_escalations: 3,
        }
    }
}

impl From<&MetacognitionSection> for MetacognitionConfig {
    fn from(s: &MetacognitionSection) -> Self {
        MetacognitionConfig {
            repeated_error_threshold: s.repeated_error_threshold,
            step_timeout: Duration::from_secs(s.step_timeout_secs),
            no_progress_threshold: s.no_progress_threshold,
            max_escalations: s.max_escalations,
        }
    }
}

/// [memory] 段：策略记忆容量与排序参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub capacity: usize,
    pub acceptance_threshold: f64,
    pub top_n: usize,
    pub rolling_weight: f64,
    pub recency_half_life_days: f64,
    /// 相对 data_dir 的文件名
    pub patterns_file: String,
    pub snapshots_file: String,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            capacity: 500,
            acceptance_threshold: 30.0,
            top_n: 5,
            rolling_weight: 0.3,
            recency_half_life_days: 30.0,
            patterns_file: "strategies.json".to_string(),
            snapshots_file: "snapshots.db".to_string(),
        }
    }
}

impl From<&MemorySection> for StrategyMemoryConfig {
    fn from(s: &MemorySection) -> Self {
        StrategyMemoryConfig {
            capacity: s.capacity.max(1),
            acceptance_threshold: s.acceptance_threshold,
            top_n: s.top_n,
            rolling_weight: s.rolling_weight,
            recency_half_life_days: s.recency_half_life_days,
        }
    }
}

/// [tools] 段：Shell 白名单与测试命令
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 允许执行的命令名（仅首词，如 ls、grep、cargo）
    pub allowed_commands: Vec<String>,
    pub test_command: String,
    pub command_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            test_command: "cargo test".to_string(),
            command_timeout_secs: 120,
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    ["ls", "grep", "cat", "head", "tail", "wc", "find", "cargo", "rustc", "git"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// 从 config 目录加载配置，环境变量 STEPWISE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STEPWISE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STEPWISE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        let memory = StrategyMemoryConfig::from(&cfg.memory);
        assert_eq!(memory.capacity, 500);
        assert_eq!(memory.top_n, 5);
        assert!((memory.acceptance_threshold - 30.0).abs() < f64::EPSILON);
        let meta = MetacognitionConfig::from(&cfg.metacognition);
        assert_eq!(meta.max_escalations, 3);
        assert_eq!(meta.step_timeout, Duration::from_secs(30));
        let retry = RetryPolicy::from(&cfg.retry);
        assert_eq!(retry.kind, BackoffKind::Exponential);
    }

    #[test]
    fn test_file_overrides_partial_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[retry]\nbackoff = \"constant\"\nbase_delay_ms = 100\n\n[engine]\nreact = false").unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.retry.backoff, BackoffKind::Constant);
        assert_eq!(cfg.retry.base_delay_ms, 100);
        assert_eq!(cfg.retry.max_delay_ms, 10_000);
        assert!(!EngineConfig::from(&cfg.engine).react_enabled);
        assert!(cfg.engine.confidence);
    }
}
