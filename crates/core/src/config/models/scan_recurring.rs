use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use scheduler_domain::{validate_id, StaticScheduleDefinition};

/// 周期性恢复扫描配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub batch_size: usize,
    /// 全体Worker合计扫完一遍积压的目标时间
    pub coverage_window_seconds: u64,
    pub claim_ttl_seconds: u64,
    pub contention_backoff_ms: u64,
    pub dead_worker_interval_seconds: u64,
    pub retention_interval_seconds: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            coverage_window_seconds: 30,
            claim_ttl_seconds: 120,
            contention_backoff_ms: 500,
            dead_worker_interval_seconds: 10,
            retention_interval_seconds: 3600,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow::anyhow!("扫描批量必须大于0"));
        }

        if self.coverage_window_seconds == 0 {
            return Err(anyhow::anyhow!("扫描覆盖窗口必须大于0"));
        }

        if self.claim_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("认领有效期必须大于0"));
        }

        Ok(())
    }

    pub fn coverage_window(&self) -> Duration {
        Duration::from_secs(self.coverage_window_seconds)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_seconds)
    }

    pub fn contention_backoff(&self) -> Duration {
        Duration::from_millis(self.contention_backoff_ms)
    }

    pub fn dead_worker_interval(&self) -> Duration {
        Duration::from_secs(self.dead_worker_interval_seconds)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention_interval_seconds)
    }
}

/// 周期计划配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringConfig {
    /// 每次计划向前物化的时间范围
    pub horizon_seconds: u64,
    /// 计划扫描的最长间隔，同时决定单次最多物化的次数
    pub max_runner_interval_seconds: u64,
    pub static_orphan_threshold_seconds: u64,
    /// 本节点声明的静态计划所属 profile
    pub profile_id: String,
    pub static_schedules: Vec<StaticScheduleDefinition>,
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            horizon_seconds: 300,
            max_runner_interval_seconds: 60,
            static_orphan_threshold_seconds: 24 * 3600,
            profile_id: "default".to_string(),
            static_schedules: Vec::new(),
        }
    }
}

impl RecurringConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.horizon_seconds == 0 {
            return Err(anyhow::anyhow!("计划范围必须大于0"));
        }

        if self.max_runner_interval_seconds == 0 {
            return Err(anyhow::anyhow!("计划扫描间隔必须大于0"));
        }

        if self.horizon_seconds < self.max_runner_interval_seconds {
            return Err(anyhow::anyhow!("计划范围不能小于计划扫描间隔"));
        }

        validate_id(&self.profile_id).map_err(|e| anyhow::anyhow!("profile id 无效: {e}"))?;
        let mut seen = HashSet::new();
        for definition in &self.static_schedules {
            validate_id(&definition.definition_id)
                .map_err(|e| anyhow::anyhow!("静态计划 id 无效: {e}"))?;
            if !seen.insert(definition.definition_id.as_str()) {
                return Err(anyhow::anyhow!(
                    "静态计划 id 重复: {}",
                    definition.definition_id
                ));
            }
        }

        Ok(())
    }

    pub fn horizon(&self) -> Duration {
        Duration::from_secs(self.horizon_seconds)
    }

    pub fn max_runner_interval(&self) -> Duration {
        Duration::from_secs(self.max_runner_interval_seconds)
    }

    pub fn static_orphan_threshold(&self) -> Duration {
        Duration::from_secs(self.static_orphan_threshold_seconds)
    }
}

/// 分布式锁配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub clock_skew_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self { clock_skew_ms: 2_000 }
    }
}

impl LockConfig {
    pub fn clock_skew(&self) -> Duration {
        Duration::from_millis(self.clock_skew_ms)
    }
}
