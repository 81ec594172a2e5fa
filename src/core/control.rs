//! 执行控制：暂停 / 恢复 / 取消
//!
//! 暂停只在步骤边界生效；取消是协作式的，正在执行的处理器调用会运行完毕。

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 可克隆的控制句柄，调用方与引擎各持一份
#[derive(Clone)]
pub struct ExecutionControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(tx),
        }
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
        tracing::info!("execution paused");
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
        tracing::info!("execution resumed");
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// 暂停期间挂起；返回 false 表示等待中被取消
    pub async fn wait_if_paused(&self) -> bool {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }
}
