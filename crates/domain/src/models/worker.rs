use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use scheduler_errors::SchedulerError;

/// Worker运行模式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMode {
    Normal,
    /// 专门承接失联 Bucket 的排空工作
    Drain,
}

impl WorkerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerMode::Normal => "NORMAL",
            WorkerMode::Drain => "DRAIN",
        }
    }
}

impl fmt::Display for WorkerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerMode {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "NORMAL" => Ok(WorkerMode::Normal),
            "DRAIN" => Ok(WorkerMode::Drain),
            _ => Err(SchedulerError::validation_error(format!("无效的Worker模式: {s}"))),
        }
    }
}

/// Worker节点信息
///
/// 存活状态不落库，由最后心跳时间推导。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Worker {
    pub id: String,
    pub cluster_id: String,
    pub agent_connection_id: String,
    pub lane: Option<String>,
    pub mode: WorkerMode,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(
        cluster_id: impl Into<String>,
        id: impl Into<String>,
        agent_connection_id: impl Into<String>,
        lane: Option<String>,
        mode: WorkerMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            cluster_id: cluster_id.into(),
            agent_connection_id: agent_connection_id.into(),
            lane,
            mode,
            last_heartbeat: now,
            created_at: now,
        }
    }

    /// `now - last_heartbeat < threshold`
    pub fn is_alive(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_heartbeat < threshold
    }

    /// 超过心跳阈值加宽限期仍无心跳即判定死亡
    pub fn is_dead(&self, now: DateTime<Utc>, threshold: Duration, grace: Duration) -> bool {
        now - self.last_heartbeat >= threshold + grace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_is_derived_from_heartbeat() {
        let now = Utc::now();
        let mut worker = Worker::new("c1", "w1", "a1", None, WorkerMode::Normal);
        worker.last_heartbeat = now - Duration::seconds(10);

        assert!(worker.is_alive(now, Duration::seconds(30)));
        assert!(!worker.is_alive(now, Duration::seconds(10)));
        assert!(!worker.is_dead(now, Duration::seconds(5), Duration::seconds(10)));
        assert!(worker.is_dead(now, Duration::seconds(5), Duration::seconds(5)));
    }
}
