//! 任务执行快照（崩溃恢复）
//!
//! 引擎在每个步骤边界把完整 Task 以 JSON 写入快照存储，按任务 id 覆盖；
//! 进程重启后可按 id 读取未结束的任务并继续执行。

use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::core::{EngineError, Task};

/// 快照存储
pub trait TaskSnapshotStore: Send + Sync {
    fn save(&self, task: &Task) -> Result<(), EngineError>;

    fn load(&self, task_id: &str) -> Result<Option<Task>, EngineError>;

    fn remove(&self, task_id: &str) -> Result<(), EngineError>;

    /// 未进入终态的任务 id（按更新时间升序）
    fn unfinished(&self) -> Result<Vec<String>, EngineError>;
}

/// SQLite 快照存储
pub struct SqliteSnapshotStore {
    conn: Mutex<Connection>,
}

const TERMINAL: [&str; 3] = ["completed", "failed", "cancelled"];

impl SqliteSnapshotStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, EngineError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, EngineError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS task_snapshots (
                task_id    TEXT PRIMARY KEY,
                status     TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                body       TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|e| EngineError::Persistence(format!("snapshot store poisoned: {}", e)))
    }
}

impl TaskSnapshotStore for SqliteSnapshotStore {
    fn save(&self, task: &Task) -> Result<(), EngineError> {
        let body = serde_json::to_string(task)?;
        self.conn()?.execute(
            "INSERT INTO task_snapshots (task_id, status, updated_at, body)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(task_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                body = excluded.body",
            params![task.id, task.status.as_str(), Utc::now().to_rfc3339(), body],
        )?;
        Ok(())
    }

    fn load(&self, task_id: &str) -> Result<Option<Task>, EngineError> {
        let body: Option<String> = self
            .conn()?
            .query_row(
                "SELECT body FROM task_snapshots WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn remove(&self, task_id: &str) -> Result<(), EngineError> {
        self.conn()?.execute(
            "DELETE FROM task_snapshots WHERE task_id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    fn unfinished(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id FROM task_snapshots
             WHERE status NOT IN (?1, ?2, ?3)
             ORDER BY updated_at ASC",
        )?;
        let ids = stmt
            .query_map(params![TERMINAL[0], TERMINAL[1], TERMINAL[2]], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}
