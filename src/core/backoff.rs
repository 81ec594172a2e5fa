//! 重试退避策略
//!
//! 默认指数退避 + 抖动；也支持固定间隔。delay_for(n) 为第 n 次重试（从 1 开始）前的等待时间。

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Constant,
    Exponential,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub kind: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 抖动比例 [0, 1]：实际等待在 delay × (1 ± jitter) 内均匀分布
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// 不等待（测试用）
    pub fn immediate() -> Self {
        Self {
            kind: BackoffKind::Constant,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let raw = match self.kind {
            BackoffKind::Constant => self.base_delay.as_secs_f64(),
            BackoffKind::Exponential => {
                self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent)
            }
        };
        let capped = raw.min(self.max_delay.as_secs_f64()).max(0.0);
        let jitter = self.jitter.clamp(0.0, 1.0);
        let secs = if jitter > 0.0 && capped > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
            capped * factor
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}
