use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::worker::Worker;
use crate::value_objects::{BucketAssignment, JobPriority};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// Bucket 状态
///
/// `Active → Completing → Draining → ReadyToDrain → (删除)`；
/// 属主失联时进入 `Lost`，重新分配后直接进入 `ReadyToDrain`。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketStatus {
    Active,
    Completing,
    Draining,
    ReadyToDrain,
    Lost,
}

impl BucketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketStatus::Active => "ACTIVE",
            BucketStatus::Completing => "COMPLETING",
            BucketStatus::Draining => "DRAINING",
            BucketStatus::ReadyToDrain => "READY_TO_DRAIN",
            BucketStatus::Lost => "LOST",
        }
    }

    pub fn can_transition_to(&self, next: BucketStatus) -> bool {
        use BucketStatus::*;
        matches!(
            (self, next),
            (Active, Completing)
                | (Completing, Draining)
                | (Draining, ReadyToDrain)
                | (Lost, ReadyToDrain)
                | (Active, Lost)
                | (Completing, Lost)
                | (Draining, Lost)
                | (ReadyToDrain, Lost)
        )
    }
}

impl fmt::Display for BucketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACTIVE" => Ok(BucketStatus::Active),
            "COMPLETING" => Ok(BucketStatus::Completing),
            "DRAINING" => Ok(BucketStatus::Draining),
            "READY_TO_DRAIN" => Ok(BucketStatus::ReadyToDrain),
            "LOST" => Ok(BucketStatus::Lost),
            _ => Err(SchedulerError::validation_error(format!(
                "Invalid bucket status: {s}"
            ))),
        }
    }
}

/// 容量分片，同一时刻只属于一个 Worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bucket {
    pub id: String,
    pub cluster_id: String,
    pub agent_connection_id: String,
    pub worker_id: String,
    pub priority: JobPriority,
    pub lane: Option<String>,
    pub status: BucketStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    /// 为 Worker 创建一个指定优先级的新 Bucket
    pub fn new(worker: &Worker, priority: JobPriority) -> Self {
        let now = Utc::now();
        Self {
            id: format!("b-{}", Uuid::new_v4().simple()),
            cluster_id: worker.cluster_id.clone(),
            agent_connection_id: worker.agent_connection_id.clone(),
            worker_id: worker.id.clone(),
            priority,
            lane: worker.lane.clone(),
            status: BucketStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn assignment(&self) -> BucketAssignment {
        BucketAssignment {
            bucket_id: self.id.clone(),
            agent_connection_id: self.agent_connection_id.clone(),
            worker_id: self.worker_id.clone(),
        }
    }

    pub fn accepts_new_work(&self) -> bool {
        self.status == BucketStatus::Active
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }

    pub fn transition(&mut self, next: BucketStatus, now: DateTime<Utc>) -> SchedulerResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(SchedulerError::invalid_transition("Bucket", self.status, next));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// 把失联的 Bucket 交给同一 agent 连接下的存活 Worker 排空
    pub fn reassign_lost(&mut self, worker: &Worker, now: DateTime<Utc>) -> SchedulerResult<()> {
        if self.status != BucketStatus::Lost {
            return Err(SchedulerError::invalid_transition(
                "Bucket",
                self.status,
                BucketStatus::ReadyToDrain,
            ));
        }
        if worker.agent_connection_id != self.agent_connection_id {
            return Err(SchedulerError::validation_error(format!(
                "Worker {} 不属于 agent 连接 {}",
                worker.id, self.agent_connection_id
            )));
        }
        self.worker_id = worker.id.clone();
        self.transition(BucketStatus::ReadyToDrain, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::worker::WorkerMode;

    fn worker(id: &str, agent: &str) -> Worker {
        Worker::new("c1", id, agent, None, WorkerMode::Normal)
    }

    #[test]
    fn test_bucket_lifecycle_transitions() {
        let now = Utc::now();
        let mut bucket = Bucket::new(&worker("w1", "a1"), JobPriority::Normal);
        assert!(bucket.accepts_new_work());
        bucket.transition(BucketStatus::Completing, now).unwrap();
        assert!(!bucket.accepts_new_work());
        bucket.transition(BucketStatus::Draining, now).unwrap();
        bucket.transition(BucketStatus::ReadyToDrain, now).unwrap();
        assert!(bucket.transition(BucketStatus::Active, now).is_err());
    }

    #[test]
    fn test_active_cannot_skip_to_ready_to_drain() {
        let mut bucket = Bucket::new(&worker("w1", "a1"), JobPriority::Normal);
        assert!(bucket
            .transition(BucketStatus::ReadyToDrain, Utc::now())
            .is_err());
    }

    #[test]
    fn test_reassign_lost_bucket() {
        let now = Utc::now();
        let mut bucket = Bucket::new(&worker("w1", "a1"), JobPriority::High);
        assert!(bucket.reassign_lost(&worker("w2", "a1"), now).is_err());

        bucket.transition(BucketStatus::Lost, now).unwrap();
        assert!(bucket.reassign_lost(&worker("w3", "other"), now).is_err());
        bucket.reassign_lost(&worker("w2", "a1"), now).unwrap();
        assert_eq!(bucket.status, BucketStatus::ReadyToDrain);
        assert_eq!(bucket.worker_id, "w2");
    }
}
