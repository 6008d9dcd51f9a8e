use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply};
use redis::{Client, RedisError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use scheduler_domain::{
    AgentTransport, BucketAddress, SchedulerError, SchedulerResult, TransportMessage,
};

use super::config::RedisStreamConfig;

const FIELD_ID: &str = "id";
const FIELD_CORRELATION: &str = "correlation";
const FIELD_REFERENCE_TIME: &str = "reference_time";
const FIELD_PAYLOAD: &str = "payload";

fn transport_error(context: &str, error: RedisError) -> SchedulerError {
    SchedulerError::transport(format!("{context}: {error}"))
}

/// Redis Stream 传输
///
/// 出队采用 `XRANGE` 读取后 `XDEL` 删除，只有删除成功（返回1）的消息才交给调用方，
/// 多个消费者并发出队时同一消息只会被一方取得。
#[derive(Clone)]
pub struct RedisStreamTransport {
    connection: ConnectionManager,
    config: RedisStreamConfig,
}

impl RedisStreamTransport {
    pub async fn connect(config: RedisStreamConfig) -> SchedulerResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| transport_error("创建Redis客户端失败", e))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| transport_error("连接Redis失败", e))?;

        info!(
            "已连接Redis Stream传输 (agent {})",
            config.agent_connection_id
        );
        Ok(Self { connection, config })
    }

    fn stream_key(&self, address: &BucketAddress) -> String {
        self.config.stream_key(&address.to_string())
    }

    async fn address_registered(&self, address: &BucketAddress) -> SchedulerResult<bool> {
        let mut conn = self.connection.clone();
        redis::cmd("SISMEMBER")
            .arg(self.config.addresses_key())
            .arg(address.to_string())
            .query_async::<bool>(&mut conn)
            .await
            .map_err(|e| transport_error("查询地址失败", e))
    }

    fn parse_entry(entry: &StreamId) -> Option<TransportMessage> {
        let id: String = entry.get(FIELD_ID)?;
        let correlation_id: String = entry.get(FIELD_CORRELATION)?;
        let millis: i64 = entry.get(FIELD_REFERENCE_TIME)?;
        let payload: Vec<u8> = entry.get(FIELD_PAYLOAD)?;
        let reference_time = Utc.timestamp_millis_opt(millis).single()?;
        Some(TransportMessage {
            id,
            correlation_id,
            payload,
            reference_time,
        })
    }
}

#[async_trait]
impl AgentTransport for RedisStreamTransport {
    fn agent_connection_id(&self) -> &str {
        &self.config.agent_connection_id
    }

    async fn publish(
        &self,
        address: &BucketAddress,
        payload: &[u8],
        reference_time: DateTime<Utc>,
        correlation_id: &str,
    ) -> SchedulerResult<String> {
        if !self.address_registered(address).await? {
            return Err(SchedulerError::transport(format!("地址不存在: {address}")));
        }

        let message_id = Uuid::new_v4().simple().to_string();
        let mut conn = self.connection.clone();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.stream_key(address))
            .arg("*")
            .arg(FIELD_ID)
            .arg(&message_id)
            .arg(FIELD_CORRELATION)
            .arg(correlation_id)
            .arg(FIELD_REFERENCE_TIME)
            .arg(reference_time.timestamp_millis())
            .arg(FIELD_PAYLOAD)
            .arg(payload);

        let start = Instant::now();
        let timeout = Duration::from_millis(self.config.publish_timeout_ms);
        match tokio::time::timeout(timeout, cmd.query_async::<String>(&mut conn)).await {
            Ok(Ok(_)) => {
                metrics::histogram!("scheduler_transport_publish_seconds")
                    .record(start.elapsed().as_secs_f64());
                debug!("消息已发布到 {}: {}", address, message_id);
                Ok(message_id)
            }
            Ok(Err(e)) => Err(transport_error("发布消息失败", e)),
            // 超时后无法确认消息是否已写入
            Err(_) => {
                warn!("发布到 {} 超时，结果未知: {}", address, message_id);
                Err(SchedulerError::AmbiguousPublish {
                    supposed_id: message_id,
                    message: format!("publish to {address} timed out after {timeout:?}"),
                })
            }
        }
    }

    async fn dequeue(
        &self,
        address: &BucketAddress,
        count: usize,
        schedule_to: Option<DateTime<Utc>>,
    ) -> SchedulerResult<Vec<TransportMessage>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let key = self.stream_key(address);
        let mut conn = self.connection.clone();
        // 延迟消息可能排在前面，多读一些以便过滤
        let reply: StreamRangeReply = redis::cmd("XRANGE")
            .arg(&key)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count.saturating_mul(4))
            .query_async(&mut conn)
            .await
            .map_err(|e| transport_error("读取消息失败", e))?;

        let mut taken = Vec::new();
        for entry in &reply.ids {
            if taken.len() >= count {
                break;
            }
            let Some(message) = Self::parse_entry(entry) else {
                warn!("丢弃无法解析的消息 {} ({})", entry.id, key);
                let _: i64 = redis::cmd("XDEL")
                    .arg(&key)
                    .arg(&entry.id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| transport_error("删除消息失败", e))?;
                continue;
            };
            if schedule_to.is_some_and(|limit| message.reference_time > limit) {
                continue;
            }

            let removed: i64 = redis::cmd("XDEL")
                .arg(&key)
                .arg(&entry.id)
                .query_async(&mut conn)
                .await
                .map_err(|e| transport_error("删除消息失败", e))?;
            if removed == 1 {
                taken.push(message);
            }
        }

        if !taken.is_empty() {
            debug!("从 {} 取出 {} 条消息", address, taken.len());
        }
        Ok(taken)
    }

    async fn has_pending(&self, address: &BucketAddress) -> SchedulerResult<bool> {
        let mut conn = self.connection.clone();
        let len: u64 = redis::cmd("XLEN")
            .arg(self.stream_key(address))
            .query_async(&mut conn)
            .await
            .map_err(|e| transport_error("查询队列长度失败", e))?;
        Ok(len > 0)
    }

    async fn create_address(&self, address: &BucketAddress) -> SchedulerResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("SADD")
            .arg(self.config.addresses_key())
            .arg(address.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| transport_error("创建地址失败", e))?;
        debug!("已创建地址 {}", address);
        Ok(())
    }

    async fn destroy_address(&self, address: &BucketAddress) -> SchedulerResult<()> {
        let mut conn = self.connection.clone();
        let _: i64 = redis::cmd("DEL")
            .arg(self.stream_key(address))
            .query_async(&mut conn)
            .await
            .map_err(|e| transport_error("删除地址失败", e))?;
        let _: i64 = redis::cmd("SREM")
            .arg(self.config.addresses_key())
            .arg(address.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| transport_error("删除地址失败", e))?;
        debug!("已删除地址 {}", address);
        Ok(())
    }
}
