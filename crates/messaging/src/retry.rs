//! 重试策略
//!
//! 只有同时满足以下条件的消息才会被重新投递：
//! 重试已开启、消息类型在允许列表中、`retry_count` 严格小于上限。
//! 未知类型一律不重试。

use crate::envelope::Envelope;
use config::{BrokerConfig, RetryBackoff};
use std::collections::HashSet;
use std::time::Duration;

/// 重试延迟
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backoff {
    Fixed { delay: Duration },
    Exponential { base: Duration },
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base }
    }

    /// 第 `attempt` 次重投（从 1 开始）前的等待时间
    pub fn delay_at(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base } => {
                let exp = std::cmp::min(attempt.saturating_sub(1), 20);
                let factor = 1u32 << exp;
                base.saturating_mul(factor)
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    enabled: bool,
    max_retries: u32,
    backoff: Backoff,
    retry_types: HashSet<String>,
}

impl RetryPolicy {
    pub fn new(
        enabled: bool,
        max_retries: u32,
        backoff: Backoff,
        retry_types: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            enabled,
            max_retries,
            backoff,
            retry_types: retry_types.into_iter().collect(),
        }
    }

    /// 从代理配置构建，启动时创建一次
    pub fn from_config(config: &BrokerConfig) -> Self {
        let backoff = match config.retry_backoff {
            RetryBackoff::Fixed => Backoff::fixed(config.retry_delay()),
            RetryBackoff::Exponential => Backoff::exponential(config.retry_delay()),
        };
        Self::new(
            config.enable_retry,
            config.max_retries,
            backoff,
            config.retry_types.iter().cloned(),
        )
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, Backoff::fixed(Duration::ZERO), Vec::new())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn should_retry(&self, envelope: &Envelope) -> bool {
        self.enabled
            && self.retry_types.contains(&envelope.kind)
            && envelope.retry_count < self.max_retries
    }

    /// 生成下一次投递的消息，`retry_count` 加一
    pub fn next_attempt(&self, mut envelope: Envelope) -> Envelope {
        envelope.retry_count = envelope.retry_count.saturating_add(1);
        envelope
    }

    /// 投递第 `retry_count` 次重试前的等待时间
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.backoff.delay_at(retry_count)
    }
}
