//! 策略模式持久化
//!
//! PatternStore 抽象存储后端：JsonFileStore 单文件 JSON（写临时文件后 rename，避免写一半的文件），
//! InMemoryStore 用于测试与不需要跨进程的场景。

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::memory::StrategyPattern;

/// 策略模式存储后端
pub trait PatternStore: Send + Sync {
    fn load(&self) -> anyhow::Result<Vec<StrategyPattern>>;

    fn save(&self, patterns: &[StrategyPattern]) -> anyhow::Result<()>;
}

/// JSON 文件存储
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PatternStore for JsonFileStore {
    /// 文件不存在时返回空 Vec
    fn load(&self) -> anyhow::Result<Vec<StrategyPattern>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&data)?)
    }

    /// 父目录不存在时自动创建
    fn save(&self, patterns: &[StrategyPattern]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(patterns)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// 内存存储
#[derive(Debug, Default)]
pub struct InMemoryStore {
    patterns: Mutex<Vec<StrategyPattern>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PatternStore for InMemoryStore {
    fn load(&self) -> anyhow::Result<Vec<StrategyPattern>> {
        self.patterns
            .lock()
            .map(|p| p.clone())
            .map_err(|e| anyhow::anyhow!("pattern store poisoned: {}", e))
    }

    fn save(&self, patterns: &[StrategyPattern]) -> anyhow::Result<()> {
        let mut guard = self
            .patterns
            .lock()
            .map_err(|e| anyhow::anyhow!("pattern store poisoned: {}", e))?;
        *guard = patterns.to_vec();
        Ok(())
    }
}
