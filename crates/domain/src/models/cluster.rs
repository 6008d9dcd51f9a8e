use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use scheduler_errors::SchedulerError;

/// 集群运行模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterMode {
    Active,
    /// 只接收作业并留存在主存储，不向 Bucket 派发
    Passive,
    Archived,
}

impl ClusterMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterMode::Active => "ACTIVE",
            ClusterMode::Passive => "PASSIVE",
            ClusterMode::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for ClusterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(ClusterMode::Active),
            "PASSIVE" => Ok(ClusterMode::Passive),
            "ARCHIVED" => Ok(ClusterMode::Archived),
            _ => Err(SchedulerError::config_error(format!("无效的集群模式: {s}"))),
        }
    }
}

/// 集群配置（读多写少）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterConfiguration {
    pub cluster_id: String,
    pub mode: ClusterMode,
    pub transient_threshold_seconds: i64,
    pub max_message_bytes: usize,
    pub data_retention_ttl_seconds: i64,
    pub timezone: String,
    pub updated_at: DateTime<Utc>,
}

impl ClusterConfiguration {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            mode: ClusterMode::Active,
            transient_threshold_seconds: 60,
            max_message_bytes: 256 * 1024,
            data_retention_ttl_seconds: 7 * 24 * 3600,
            timezone: "UTC".to_string(),
            updated_at: Utc::now(),
        }
    }

    pub fn data_retention_ttl(&self) -> Duration {
        Duration::seconds(self.data_retention_ttl_seconds)
    }

    pub fn transient_threshold(&self) -> Duration {
        Duration::seconds(self.transient_threshold_seconds)
    }

    pub fn dispatch_enabled(&self) -> bool {
        self.mode == ClusterMode::Active
    }
}
