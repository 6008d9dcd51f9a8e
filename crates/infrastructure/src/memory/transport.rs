use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use scheduler_domain::{
    AgentTransport, BucketAddress, SchedulerError, SchedulerResult, TransportMessage,
};

/// 内存 Agent 传输
///
/// 每个地址一个 FIFO 队列；同一 agent 连接下的所有 Worker 共享同一个实例。
/// 发布到未创建的地址会失败，与 SQL 队列的行为一致。
#[derive(Debug)]
pub struct InMemoryTransport {
    agent_connection_id: String,
    queues: Mutex<HashMap<BucketAddress, VecDeque<TransportMessage>>>,
}

impl InMemoryTransport {
    pub fn new(agent_connection_id: impl Into<String>) -> Self {
        Self {
            agent_connection_id: agent_connection_id.into(),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub async fn pending_count(&self, address: &BucketAddress) -> usize {
        self.queues
            .lock()
            .await
            .get(address)
            .map_or(0, |queue| queue.len())
    }

    pub async fn address_exists(&self, address: &BucketAddress) -> bool {
        self.queues.lock().await.contains_key(address)
    }
}

#[async_trait]
impl AgentTransport for InMemoryTransport {
    fn agent_connection_id(&self) -> &str {
        &self.agent_connection_id
    }

    async fn publish(
        &self,
        address: &BucketAddress,
        payload: &[u8],
        reference_time: DateTime<Utc>,
        correlation_id: &str,
    ) -> SchedulerResult<String> {
        let mut queues = self.queues.lock().await;
        let queue = queues
            .get_mut(address)
            .ok_or_else(|| SchedulerError::transport(format!("地址不存在: {address}")))?;

        let id = Uuid::new_v4().simple().to_string();
        queue.push_back(TransportMessage {
            id: id.clone(),
            correlation_id: correlation_id.to_string(),
            payload: payload.to_vec(),
            reference_time,
        });
        debug!("消息已发布到 {}: {}", address, id);
        Ok(id)
    }

    async fn dequeue(
        &self,
        address: &BucketAddress,
        count: usize,
        schedule_to: Option<DateTime<Utc>>,
    ) -> SchedulerResult<Vec<TransportMessage>> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(address) else {
            return Ok(Vec::new());
        };

        let mut taken = Vec::new();
        let mut remaining = VecDeque::with_capacity(queue.len());
        while let Some(message) = queue.pop_front() {
            let due = schedule_to.map_or(true, |limit| message.reference_time <= limit);
            if taken.len() < count && due {
                taken.push(message);
            } else {
                remaining.push_back(message);
            }
        }
        *queue = remaining;
        Ok(taken)
    }

    async fn has_pending(&self, address: &BucketAddress) -> SchedulerResult<bool> {
        Ok(self.pending_count(address).await > 0)
    }

    async fn create_address(&self, address: &BucketAddress) -> SchedulerResult<()> {
        self.queues
            .lock()
            .await
            .entry(address.clone())
            .or_default();
        Ok(())
    }

    async fn destroy_address(&self, address: &BucketAddress) -> SchedulerResult<()> {
        self.queues.lock().await.remove(address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use scheduler_domain::QueueKind;

    #[tokio::test]
    async fn test_publish_requires_address() {
        let transport = InMemoryTransport::new("a1");
        let address = BucketAddress::new("c1", "b-1", QueueKind::SavePending);
        assert!(transport.publish(&address, b"x", Utc::now(), "c").await.is_err());

        transport.create_address(&address).await.unwrap();
        let id = transport.publish(&address, b"x", Utc::now(), "c").await.unwrap();
        assert!(transport.has_pending(&address).await.unwrap());

        let messages = transport.dequeue(&address, 10, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, id);
        assert!(!transport.has_pending(&address).await.unwrap());
    }

    #[tokio::test]
    async fn test_dequeue_respects_schedule_to() {
        let transport = InMemoryTransport::new("a1");
        let address = BucketAddress::new("c1", "b-1", QueueKind::SavePending);
        transport.create_address(&address).await.unwrap();
        let now = Utc::now();
        transport.publish(&address, b"later", now + Duration::minutes(5), "c1").await.unwrap();
        transport.publish(&address, b"now", now, "c2").await.unwrap();

        let messages = transport.dequeue(&address, 10, Some(now)).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, b"now".to_vec());
        assert_eq!(transport.pending_count(&address).await, 1);
    }
}
