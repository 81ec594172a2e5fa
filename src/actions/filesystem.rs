//! 沙箱文件系统能力
//!
//! Sandbox 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 逃逸与根外绝对路径）；
//! read_file / write_file / edit_file / delete_file / create_directory 处理器基于 Sandbox，
//! 修改类处理器在执行前读取原状态并给出补偿动作。

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::json;

use crate::actions::{Action, ActionCall, ActionType, CapabilityHandler, CapabilityRegistry};
use crate::core::{ActionFailure, StepResult};

/// 单个文件读取上限
const MAX_READ_BYTES: u64 = 10 * 1024 * 1024;

/// 沙箱：绑定根目录，resolve 校验路径在根下
#[derive(Debug, Clone)]
pub struct Sandbox {
    root_dir: PathBuf,
}

impl Sandbox {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析路径（目标可以尚不存在）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ActionFailure> {
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return Err(ActionFailure::InvalidPath {
                path: path.to_string(),
            });
        }
        let rel = Path::new(trimmed.trim_start_matches("./"));
        if rel.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(ActionFailure::InvalidPath {
                path: path.to_string(),
            }); // 如 ../../etc/passwd
        }
        let full = if rel.is_absolute() {
            rel.to_path_buf()
        } else {
            self.root_dir.join(rel)
        };
        if !full.starts_with(&self.root_dir) {
            return Err(ActionFailure::InvalidPath {
                path: path.to_string(),
            });
        }
        // 符号链接：规范化最深的已存在祖先，再接回尚不存在的部分
        let (existing, rest) = split_existing(&full);
        let canonical = existing.canonicalize().map_err(|_| ActionFailure::InvalidPath {
            path: path.to_string(),
        })?;
        if !canonical.starts_with(&self.root_dir) {
            tracing::warn!(path = %path, resolved = %canonical.display(), "path escapes sandbox");
            return Err(ActionFailure::InvalidPath {
                path: path.to_string(),
            });
        }
        Ok(rest.into_iter().fold(canonical, |acc, part| acc.join(part)))
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.is_dir()).unwrap_or(false)
    }

    /// 目标是否存在（路径非法时视为不存在）
    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    async fn read_existing(&self, path: &str) -> Option<String> {
        let full = self.resolve(path).ok()?;
        tokio::fs::read_to_string(full).await.ok()
    }
}

/// 拆成最深的已存在祖先（不跟随符号链接判断存在性）与其后尚不存在的各级名称
fn split_existing(full: &Path) -> (&Path, Vec<&OsStr>) {
    let mut rest = Vec::new();
    let mut current = full;
    while std::fs::symlink_metadata(current).is_err() {
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name);
                current = parent;
            }
            _ => break,
        }
    }
    rest.reverse();
    (current, rest)
}

fn io_failure(action: ActionType, path: &str, e: std::io::Error) -> ActionFailure {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => ActionFailure::PermissionDenied {
            detail: format!("{}: {}", path, e),
        },
        std::io::ErrorKind::NotFound => ActionFailure::InvalidPath {
            path: path.to_string(),
        },
        _ => ActionFailure::handler(action.as_str(), format!("{}: {}", path, e)),
    }
}

fn unexpected(expected: ActionType, call: &ActionCall) -> ActionFailure {
    ActionFailure::InvalidParameter {
        action: expected.as_str().to_string(),
        reason: format!("handler received {}", call.action_type()),
    }
}

/// 写回原内容的补偿；原文件不存在时补偿为删除
fn restore_or_delete(path: &str, previous: Option<String>) -> Action {
    match previous {
        Some(content) => Action::new(
            ActionType::WriteFile,
            json!({ "path": path, "content": content }),
        ),
        None => Action::new(ActionType::DeleteFile, json!({ "path": path })),
    }
}

pub struct ReadFileHandler {
    fs: Sandbox,
}

impl ReadFileHandler {
    pub fn new(fs: Sandbox) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl CapabilityHandler for ReadFileHandler {
    fn action_type(&self) -> ActionType {
        ActionType::ReadFile
    }

    fn description(&self) -> &str {
        "Read a UTF-8 file inside the workspace"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::ReadFile { path, .. } = call else {
            return Err(unexpected(ActionType::ReadFile, call));
        };
        let full = self.fs.resolve(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| io_failure(ActionType::ReadFile, path, e))?;
        if meta.len() > MAX_READ_BYTES {
            return Err(ActionFailure::handler(
                "read_file",
                format!("{} is too large ({} bytes)", path, meta.len()),
            ));
        }
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| io_failure(ActionType::ReadFile, path, e))?;
        tracing::debug!(path = %path, bytes = content.len(), "read_file");
        Ok(StepResult::ok(format!("Read {} ({} bytes)", path, content.len()))
            .with_data(json!({ "content": content })))
    }
}

pub struct WriteFileHandler {
    fs: Sandbox,
}

impl WriteFileHandler {
    pub fn new(fs: Sandbox) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl CapabilityHandler for WriteFileHandler {
    fn action_type(&self) -> ActionType {
        ActionType::WriteFile
    }

    fn description(&self) -> &str {
        "Create or overwrite a file inside the workspace"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::WriteFile {
            path,
            content,
            create_dirs,
        } = call
        else {
            return Err(unexpected(ActionType::WriteFile, call));
        };
        let full = self.fs.resolve(path)?;
        if create_dirs.unwrap_or(true) {
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_failure(ActionType::WriteFile, path, e))?;
            }
        }
        tokio::fs::write(&full, content)
            .await
            .map_err(|e| io_failure(ActionType::WriteFile, path, e))?;
        Ok(StepResult::ok(format!("Wrote {} ({} bytes)", path, content.len())))
    }

    async fn compensation(&self, call: &ActionCall) -> Option<Action> {
        let ActionCall::WriteFile { path, .. } = call else {
            return None;
        };
        Some(restore_or_delete(path, self.fs.read_existing(path).await))
    }
}

pub struct EditFileHandler {
    fs: Sandbox,
}

impl EditFileHandler {
    pub fn new(fs: Sandbox) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl CapabilityHandler for EditFileHandler {
    fn action_type(&self) -> ActionType {
        ActionType::EditFile
    }

    fn description(&self) -> &str {
        "Replace an exact text fragment in an existing file"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::EditFile {
            path,
            old_text,
            new_text,
            replace_all,
        } = call
        else {
            return Err(unexpected(ActionType::EditFile, call));
        };
        if old_text.is_empty() {
            return Err(ActionFailure::InvalidParameter {
                action: "edit_file".to_string(),
                reason: "old_text must not be empty".to_string(),
            });
        }
        let full = self.fs.resolve(path)?;
        let content = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| io_failure(ActionType::EditFile, path, e))?;
        let occurrences = content.matches(old_text.as_str()).count();
        if occurrences == 0 {
            return Err(ActionFailure::handler(
                "edit_file",
                format!("old_text not found in {}", path),
            ));
        }
        let replace_all = replace_all.unwrap_or(false);
        if occurrences > 1 && !replace_all {
            return Err(ActionFailure::handler(
                "edit_file",
                format!(
                    "old_text occurs {} times in {}; set replace_all or add context",
                    occurrences, path
                ),
            ));
        }
        let updated = if replace_all {
            content.replace(old_text.as_str(), new_text)
        } else {
            content.replacen(old_text.as_str(), new_text, 1)
        };
        tokio::fs::write(&full, updated)
            .await
            .map_err(|e| io_failure(ActionType::EditFile, path, e))?;
        Ok(StepResult::ok(format!(
            "Edited {} ({} replacement{})",
            path,
            occurrences,
            if occurrences == 1 { "" } else { "s" }
        )))
    }

    async fn compensation(&self, call: &ActionCall) -> Option<Action> {
        let ActionCall::EditFile { path, .. } = call else {
            return None;
        };
        let previous = self.fs.read_existing(path).await?;
        Some(restore_or_delete(path, Some(previous)))
    }
}

pub struct DeleteFileHandler {
    fs: Sandbox,
}

impl DeleteFileHandler {
    pub fn new(fs: Sandbox) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl CapabilityHandler for DeleteFileHandler {
    fn action_type(&self) -> ActionType {
        ActionType::DeleteFile
    }

    fn description(&self) -> &str {
        "Delete a file or an empty directory inside the workspace"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::DeleteFile { path } = call else {
            return Err(unexpected(ActionType::DeleteFile, call));
        };
        let full = self.fs.resolve(path)?;
        let removed = if self.fs.is_dir(path) {
            tokio::fs::remove_dir(&full).await
        } else {
            tokio::fs::remove_file(&full).await
        };
        removed.map_err(|e| io_failure(ActionType::DeleteFile, path, e))?;
        Ok(StepResult::ok(format!("Deleted {}", path)))
    }

    async fn compensation(&self, call: &ActionCall) -> Option<Action> {
        let ActionCall::DeleteFile { path } = call else {
            return None;
        };
        if self.fs.is_dir(path) {
            return Some(Action::new(
                ActionType::CreateDirectory,
                json!({ "path": path, "recursive": false }),
            ));
        }
        let previous = self.fs.read_existing(path).await?;
        Some(restore_or_delete(path, Some(previous)))
    }
}

pub struct CreateDirectoryHandler {
    fs: Sandbox,
}

impl CreateDirectoryHandler {
    pub fn new(fs: Sandbox) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl CapabilityHandler for CreateDirectoryHandler {
    fn action_type(&self) -> ActionType {
        ActionType::CreateDirectory
    }

    fn description(&self) -> &str {
        "Create a directory inside the workspace"
    }

    async fn execute(&self, call: &ActionCall) -> Result<StepResult, ActionFailure> {
        let ActionCall::CreateDirectory { path, recursive } = call else {
            return Err(unexpected(ActionType::CreateDirectory, call));
        };
        let full = self.fs.resolve(path)?;
        let created = if recursive.unwrap_or(true) {
            tokio::fs::create_dir_all(&full).await
        } else {
            tokio::fs::create_dir(&full).await
        };
        created.map_err(|e| io_failure(ActionType::CreateDirectory, path, e))?;
        Ok(StepResult::ok(format!("Created directory {}", path)))
    }

    /// 仅当只新建了最后一级目录时可撤销（删除该空目录）；多级新建不补偿
    async fn compensation(&self, call: &ActionCall) -> Option<Action> {
        let ActionCall::CreateDirectory { path, .. } = call else {
            return None;
        };
        let full = self.fs.resolve(path).ok()?;
        if full.exists() {
            return None;
        }
        if !full.parent().is_some_and(Path::is_dir) {
            tracing::warn!(path = %path, "nested directories cannot be compensated");
            return None;
        }
        Some(Action::new(ActionType::DeleteFile, json!({ "path": path })))
    }
}

/// 注册全部文件系统处理器
pub fn register_filesystem_handlers(registry: &mut CapabilityRegistry, root_dir: impl AsRef<Path>) {
    let fs = Sandbox::new(root_dir);
    registry.register(ReadFileHandler::new(fs.clone()));
    registry.register(WriteFileHandler::new(fs.clone()));
    registry.register(EditFileHandler::new(fs.clone()));
    registry.register(DeleteFileHandler::new(fs.clone()));
    registry.register(CreateDirectoryHandler::new(fs));
}
