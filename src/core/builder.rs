//! 引擎构建器：从配置统一装配能力处理器、推理协作方、策略记忆与快照存储

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::actions::{
    register_filesystem_handlers, ActionDispatcher, CapabilityRegistry, CommandGuard,
    RunCommandHandler, RunTestsHandler, Sandbox,
};
use crate::config::AppConfig;
use crate::core::{EngineConfig, ExecutionEngine, RetryPolicy};
use crate::llm::{Collaborator, LlmClient, OpenAiClient};
use crate::memory::{
    JsonFileStore, SqliteSnapshotStore, StrategyMemory, StrategyMemoryConfig, TaskSnapshotStore,
};
use crate::react::MetacognitionConfig;

const COLLABORATOR_PROMPT: &str = "You are the reasoning collaborator of an autonomous task \
execution engine. Answer every request with a single JSON value in the requested format and \
nothing else.";

pub struct EngineBuilder {
    config: AppConfig,
    workspace: PathBuf,
    llm: Option<Arc<dyn LlmClient>>,
    persistent: bool,
}

impl EngineBuilder {
    pub fn new(config: AppConfig, workspace: impl Into<PathBuf>) -> Self {
        Self {
            config,
            workspace: workspace.into(),
            llm: None,
            persistent: true,
        }
    }

    /// 指定 LLM 客户端（覆盖配置中的 OpenAI 兼容后端）
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    /// 策略记忆与快照只保存在内存中
    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// 参考能力集：沙箱文件系统 + 白名单命令
    pub fn build_registry(&self) -> CapabilityRegistry {
        let tools = &self.config.tools;
        let mut registry = CapabilityRegistry::new();
        register_filesystem_handlers(&mut registry, &self.workspace);
        let fs = Sandbox::new(&self.workspace);
        let guard = CommandGuard::new(tools.allowed_commands.clone());
        registry.register(RunCommandHandler::new(
            fs.clone(),
            guard.clone(),
            tools.command_timeout_secs,
        ));
        registry.register(RunTestsHandler::new(
            fs,
            guard,
            tools.test_command.clone(),
            tools.command_timeout_secs,
        ));
        registry
    }

    /// 推理协作方；未启用或缺少 API Key 时返回 None，引擎退回本地启发式
    pub fn build_collaborator(&self) -> Option<Arc<Collaborator>> {
        let llm_cfg = &self.config.llm;
        let llm = match &self.llm {
            Some(llm) => Arc::clone(llm),
            None => {
                if !llm_cfg.enabled {
                    return None;
                }
                let Some(key) = llm_cfg.api_key() else {
                    tracing::warn!(env = %llm_cfg.api_key_env, "no API key, reasoning collaborator disabled");
                    return None;
                };
                Arc::new(OpenAiClient::new(
                    Some(&llm_cfg.base_url),
                    &llm_cfg.model,
                    Some(&key),
                ))
            }
        };
        Some(Arc::new(
            Collaborator::new(llm)
                .with_timeout(Duration::from_secs(llm_cfg.request_timeout_secs.max(1)))
                .with_system_prompt(COLLABORATOR_PROMPT),
        ))
    }

    fn data_dir(&self) -> PathBuf {
        let dir = &self.config.app.data_dir;
        if dir.is_absolute() {
            dir.clone()
        } else {
            self.workspace.join(dir)
        }
    }

    pub fn open_memory(&self) -> anyhow::Result<StrategyMemory> {
        let cfg = StrategyMemoryConfig::from(&self.config.memory);
        if !self.persistent {
            return Ok(StrategyMemory::in_memory(cfg));
        }
        let path = self.data_dir().join(&self.config.memory.patterns_file);
        StrategyMemory::open(cfg, Box::new(JsonFileStore::new(path)))
    }

    pub fn open_snapshots(&self) -> anyhow::Result<Arc<dyn TaskSnapshotStore>> {
        let store = if self.persistent {
            let dir = self.data_dir();
            std::fs::create_dir_all(&dir)?;
            SqliteSnapshotStore::open(dir.join(&self.config.memory.snapshots_file))?
        } else {
            SqliteSnapshotStore::in_memory()?
        };
        Ok(Arc::new(store))
    }

    pub fn build(self) -> anyhow::Result<ExecutionEngine> {
        let registry = self.build_registry();
        let capabilities = registry.describe();
        let dispatcher = ActionDispatcher::new(registry, self.config.engine.action_timeout_secs);
        let memory = Arc::new(Mutex::new(self.open_memory()?));
        let snapshots = self.open_snapshots()?;

        let mut engine = ExecutionEngine::new(Arc::new(dispatcher), memory)
            .with_snapshots(snapshots)
            .with_retry_policy(RetryPolicy::from(&self.config.retry))
            .with_metacognition(MetacognitionConfig::from(&self.config.metacognition))
            .with_config(EngineConfig::from(&self.config.engine))
            .with_capabilities(capabilities)
            .with_workspace_root(self.workspace.clone());
        if let Some(collaborator) = self.build_collaborator() {
            engine = engine.with_collaborator(collaborator);
        }
        tracing::info!(workspace = %self.workspace.display(), "execution engine ready");
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionType;
    use crate::llm::ScriptedLlmClient;

    #[test]
    fn test_registry_covers_reference_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EngineBuilder::new(AppConfig::default(), dir.path()).build_registry();
        for t in [
            ActionType::ReadFile,
            ActionType::WriteFile,
            ActionType::EditFile,
            ActionType::DeleteFile,
            ActionType::CreateDirectory,
            ActionType::RunCommand,
            ActionType::RunTests,
        ] {
            assert!(registry.supports(t), "missing handler for {}", t.as_str());
        }
        assert!(!registry.supports(ActionType::GitCommit));
    }

    #[test]
    fn test_collaborator_requires_key_or_explicit_client() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.llm.api_key_env = "STEPWISE_TEST_KEY_THAT_IS_NOT_SET".to_string();
        let builder = EngineBuilder::new(config.clone(), dir.path());
        assert!(builder.build_collaborator().is_none());

        let builder = EngineBuilder::new(config, dir.path())
            .with_llm(Arc::new(ScriptedLlmClient::new()));
        assert!(builder.build_collaborator().is_some());
    }

    #[tokio::test]
    async fn test_build_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.llm.enabled = false;
        let engine = EngineBuilder::new(config, dir.path()).build().unwrap();
        assert!(dir.path().join(".stepwise").join("snapshots.db").exists());
        assert!(engine.memory().lock().await.is_empty());
    }
}
