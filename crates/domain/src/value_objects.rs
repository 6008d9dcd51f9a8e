use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 标识符最大长度
pub const MAX_ID_LENGTH: usize = 255;

const ID_SEPARATORS: [char; 4] = ['_', '.', ':', '-'];

/// 校验集群、Worker、Bucket、处理器等字符串标识符
///
/// 允许的字符为 `[A-Za-z0-9_.:-]`，长度不超过255，且不允许连续出现分隔符。
pub fn validate_id(id: &str) -> SchedulerResult<()> {
    let invalid = |reason: &str| SchedulerError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("标识符不能为空"));
    }
    if id.len() > MAX_ID_LENGTH {
        return Err(invalid("标识符长度超过255"));
    }

    let mut previous_was_separator = false;
    for c in id.chars() {
        let is_separator = ID_SEPARATORS.contains(&c);
        if !c.is_ascii_alphanumeric() && !is_separator {
            return Err(invalid("包含非法字符"));
        }
        if is_separator && previous_was_separator {
            return Err(invalid("不允许连续的分隔符"));
        }
        previous_was_separator = is_separator;
    }
    Ok(())
}

/// 传输层去重使用的关联 id：实体 UUID 的32位十六进制形式
pub fn correlation_id(entity_id: Uuid) -> String {
    entity_id.simple().to_string()
}

/// 作业优先级，决定执行槽位数量与 Bucket 路由
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
}

impl JobPriority {
    pub const ALL: [JobPriority; 5] = [
        JobPriority::Lowest,
        JobPriority::Low,
        JobPriority::Normal,
        JobPriority::High,
        JobPriority::Highest,
    ];

    /// 单个并行系数下的运行槽位数（2–6）
    pub fn base_slots(&self) -> usize {
        match self {
            JobPriority::Lowest => 2,
            JobPriority::Low => 3,
            JobPriority::Normal => 4,
            JobPriority::High => 5,
            JobPriority::Highest => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobPriority::Lowest => "LOWEST",
            JobPriority::Low => "LOW",
            JobPriority::Normal => "NORMAL",
            JobPriority::High => "HIGH",
            JobPriority::Highest => "HIGHEST",
        }
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        JobPriority::Normal
    }
}

impl fmt::Display for JobPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOWEST" => Ok(JobPriority::Lowest),
            "LOW" => Ok(JobPriority::Low),
            "NORMAL" => Ok(JobPriority::Normal),
            "HIGH" => Ok(JobPriority::High),
            "HIGHEST" => Ok(JobPriority::Highest),
            _ => Err(SchedulerError::validation_error(format!("无效的优先级: {s}"))),
        }
    }
}

/// 实体与 Bucket 的绑定关系
///
/// 三个字段要么同时存在（已分配），要么整体为 `None`（留存在主存储）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketAssignment {
    pub bucket_id: String,
    pub agent_connection_id: String,
    pub worker_id: String,
}

/// 扫描认领标记：分区锁 id 与过期时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionClaim {
    pub lock_id: i64,
    pub expires_at: DateTime<Utc>,
}

impl PartitionClaim {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}
