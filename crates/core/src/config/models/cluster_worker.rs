use std::time::Duration;

use serde::{Deserialize, Serialize};

use scheduler_domain::{validate_id, ClusterConfiguration, ClusterMode, JobPriority, WorkerMode};

/// 集群配置：集群标识与主存储中缺省的集群参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub id: String,
    pub agent_connection_id: String,
    pub mode: ClusterMode,
    pub timezone: String,
    pub transient_threshold_seconds: i64,
    pub max_message_bytes: usize,
    pub data_retention_ttl_seconds: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: "default".to_string(),
            agent_connection_id: "agent-default".to_string(),
            mode: ClusterMode::Active,
            timezone: "UTC".to_string(),
            transient_threshold_seconds: 60,
            max_message_bytes: 256 * 1024,
            data_retention_ttl_seconds: 7 * 24 * 3600,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        validate_id(&self.id).map_err(|e| anyhow::anyhow!("集群id无效: {e}"))?;
        validate_id(&self.agent_connection_id)
            .map_err(|e| anyhow::anyhow!("agent连接id无效: {e}"))?;

        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(anyhow::anyhow!("无效的时区: {}", self.timezone));
        }

        if self.max_message_bytes == 0 {
            return Err(anyhow::anyhow!("最大消息大小必须大于0"));
        }

        if self.data_retention_ttl_seconds <= 0 {
            return Err(anyhow::anyhow!("数据保留时间必须大于0"));
        }

        Ok(())
    }

    /// 主存储中尚无集群配置时使用的缺省值
    pub fn default_configuration(&self) -> ClusterConfiguration {
        let mut configuration = ClusterConfiguration::new(self.id.clone());
        configuration.mode = self.mode;
        configuration.timezone = self.timezone.clone();
        configuration.transient_threshold_seconds = self.transient_threshold_seconds;
        configuration.max_message_bytes = self.max_message_bytes;
        configuration.data_retention_ttl_seconds = self.data_retention_ttl_seconds;
        configuration
    }
}

/// 心跳阈值与失联宽限期的上限（24 小时）
pub const MAX_LIVENESS_WINDOW_MS: u64 = 24 * 60 * 60 * 1000;

/// Worker节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// 为空时由启动程序使用主机名
    pub id: Option<String>,
    pub lane: Option<String>,
    pub mode: WorkerMode,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_threshold_ms: u64,
    pub dead_worker_grace_ms: u64,
    /// 启动时为每个优先级创建一个 Bucket
    pub bucket_priorities: Vec<JobPriority>,
    pub parallelism_factor: usize,
    /// 短路派发的 on-boarding 窗口
    pub onboarding_window_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_batch_size: usize,
    pub stop_poll_interval_ms: u64,
    pub friendly_stop_grace_ms: u64,
    pub drain_poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            id: None,
            lane: None,
            mode: WorkerMode::Normal,
            heartbeat_interval_ms: 5_000,
            heartbeat_threshold_ms: 30_000,
            dead_worker_grace_ms: 30_000,
            bucket_priorities: JobPriority::ALL.to_vec(),
            parallelism_factor: 1,
            onboarding_window_ms: 5_000,
            poll_interval_ms: 1_000,
            poll_batch_size: 20,
            stop_poll_interval_ms: 2_000,
            friendly_stop_grace_ms: 30_000,
            drain_poll_interval_ms: 1_000,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(id) = &self.id {
            validate_id(id).map_err(|e| anyhow::anyhow!("Worker id无效: {e}"))?;
        }
        if let Some(lane) = &self.lane {
            validate_id(lane).map_err(|e| anyhow::anyhow!("lane无效: {e}"))?;
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_threshold_ms <= self.heartbeat_interval_ms {
            return Err(anyhow::anyhow!("心跳阈值必须大于心跳间隔"));
        }

        if self.heartbeat_threshold_ms > MAX_LIVENESS_WINDOW_MS
            || self.dead_worker_grace_ms > MAX_LIVENESS_WINDOW_MS
        {
            return Err(anyhow::anyhow!(
                "心跳阈值与失联宽限期不能超过 {} 毫秒",
                MAX_LIVENESS_WINDOW_MS
            ));
        }

        if self.bucket_priorities.is_empty() {
            return Err(anyhow::anyhow!("至少需要一个Bucket优先级"));
        }

        if self.parallelism_factor == 0 {
            return Err(anyhow::anyhow!("并行系数必须大于0"));
        }

        if self.poll_batch_size == 0 {
            return Err(anyhow::anyhow!("拉取批量必须大于0"));
        }

        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_threshold_ms)
    }

    pub fn dead_worker_grace(&self) -> Duration {
        Duration::from_millis(self.dead_worker_grace_ms)
    }

    pub fn onboarding_window(&self) -> Duration {
        Duration::from_millis(self.onboarding_window_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn friendly_stop_grace(&self) -> Duration {
        Duration::from_millis(self.friendly_stop_grace_ms)
    }

    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms)
    }
}

/// 本地执行队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskQueueConfig {
    pub tick_interval_ms: u64,
    pub timeout_sweep_interval_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            timeout_sweep_interval_ms: 1_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl TaskQueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 || self.timeout_sweep_interval_ms == 0 {
            return Err(anyhow::anyhow!("执行队列的tick间隔必须大于0"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn timeout_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.timeout_sweep_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
