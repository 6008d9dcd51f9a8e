use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::duration::to_chrono;

/// 带抖动的指数退避，封顶于 `max`
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// 第 `attempt` 次（从1开始）重试前的等待上限，不含抖动
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// 在 `[ceiling/2, ceiling]` 内取随机值
    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        if spread == 0 {
            return ceiling;
        }
        half + Duration::from_millis(rand::rng().random_range(0..=spread))
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureState {
    consecutive: u32,
    skip_until: DateTime<Utc>,
}

/// 连续失败计数：失败越多，跳过该条目的时间越长
#[derive(Debug)]
pub struct ConsecutiveFailures<K> {
    backoff: ExponentialBackoff,
    states: HashMap<K, FailureState>,
}

impl<K: Eq + Hash + Clone> ConsecutiveFailures<K> {
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            states: HashMap::new(),
        }
    }

    /// 记录一次失败，返回当前连续失败次数
    pub fn record_failure(&mut self, key: &K, now: DateTime<Utc>) -> u32 {
        let consecutive = self.states.get(key).map_or(0, |s| s.consecutive) + 1;
        let skip = to_chrono(self.backoff.ceiling(consecutive));
        self.states.insert(
            key.clone(),
            FailureState {
                consecutive,
                skip_until: now + skip,
            },
        );
        consecutive
    }

    pub fn record_success(&mut self, key: &K) {
        self.states.remove(key);
    }

    pub fn should_skip(&self, key: &K, now: DateTime<Utc>) -> bool {
        self.states.get(key).is_some_and(|s| s.skip_until > now)
    }

    pub fn consecutive(&self, key: &K) -> u32 {
        self.states.get(key).map_or(0, |s| s.consecutive)
    }
}
