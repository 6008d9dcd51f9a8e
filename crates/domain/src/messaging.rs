use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Bucket;
use scheduler_errors::SchedulerResult;

/// Bucket 下的队列种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueKind {
    /// 新派发、尚未被 Worker 接收的作业
    SavePending,
    /// 已被 Worker 接收但本地执行队列暂时放不下的作业
    Processing,
    /// 待激活的周期计划
    RecurringSave,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [
        QueueKind::SavePending,
        QueueKind::Processing,
        QueueKind::RecurringSave,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::SavePending => "save-pending",
            QueueKind::Processing => "processing",
            QueueKind::RecurringSave => "recurring-save",
        }
    }
}

/// 传输层寻址：集群 + Bucket + 队列
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketAddress {
    pub cluster_id: String,
    pub bucket_id: String,
    pub queue: QueueKind,
}

impl BucketAddress {
    pub fn new(cluster_id: impl Into<String>, bucket_id: impl Into<String>, queue: QueueKind) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            bucket_id: bucket_id.into(),
            queue,
        }
    }

    pub fn for_bucket(bucket: &Bucket, queue: QueueKind) -> Self {
        Self::new(bucket.cluster_id.clone(), bucket.id.clone(), queue)
    }

    /// 该 Bucket 的全部队列地址
    pub fn all_for_bucket(bucket: &Bucket) -> Vec<Self> {
        QueueKind::ALL
            .iter()
            .map(|queue| Self::for_bucket(bucket, *queue))
            .collect()
    }
}

impl fmt::Display for BucketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.cluster_id, self.bucket_id, self.queue.as_str())
    }
}

/// 传输层投递的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub id: String,
    pub correlation_id: String,
    pub payload: Vec<u8>,
    pub reference_time: DateTime<Utc>,
}

/// 队列消息体：只携带实体 id，实体本身从主存储读取
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEnvelope {
    Job { job_id: Uuid },
    Schedule { schedule_id: Uuid },
}

impl DispatchEnvelope {
    pub fn to_bytes(&self) -> SchedulerResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> SchedulerResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Agent 传输接口（SQL 队列或流式 broker）
///
/// 投递语义为至少一次；`publish` 超时必须返回 `AmbiguousPublish`，
/// 其中的 supposed id 与成功时返回的消息 id 相同。
#[async_trait]
pub trait AgentTransport: Send + Sync {
    fn agent_connection_id(&self) -> &str;

    /// 自动出队的传输上 `dequeue` 不做任何事
    fn is_auto_dequeuing(&self) -> bool {
        false
    }

    async fn publish(
        &self,
        address: &BucketAddress,
        payload: &[u8],
        reference_time: DateTime<Utc>,
        correlation_id: &str,
    ) -> SchedulerResult<String>;

    /// 取出最多 `count` 条消息；`schedule_to` 存在时只取参考时间不晚于它的消息
    async fn dequeue(
        &self,
        address: &BucketAddress,
        count: usize,
        schedule_to: Option<DateTime<Utc>>,
    ) -> SchedulerResult<Vec<TransportMessage>>;

    async fn has_pending(&self, address: &BucketAddress) -> SchedulerResult<bool>;

    async fn create_address(&self, address: &BucketAddress) -> SchedulerResult<()>;

    async fn destroy_address(&self, address: &BucketAddress) -> SchedulerResult<()>;
}
