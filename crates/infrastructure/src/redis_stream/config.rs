use serde::{Deserialize, Serialize};

/// Redis Stream 传输配置
///
/// 每个 Bucket 地址对应一个 stream：`{key_prefix}:{cluster}:{bucket}:{queue}`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStreamConfig {
    pub url: String,
    pub key_prefix: String,
    pub agent_connection_id: String,
    pub publish_timeout_ms: u64,
}

impl Default for RedisStreamConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "scheduler".to_string(),
            agent_connection_id: "agent-default".to_string(),
            publish_timeout_ms: 5000,
        }
    }
}

impl RedisStreamConfig {
    pub fn new(url: impl Into<String>, agent_connection_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent_connection_id: agent_connection_id.into(),
            ..Default::default()
        }
    }

    /// 地址集合的键
    pub fn addresses_key(&self) -> String {
        format!("{}:{}:addresses", self.key_prefix, self.agent_connection_id)
    }

    pub fn stream_key(&self, address: &str) -> String {
        format!("{}:{}:{}", self.key_prefix, self.agent_connection_id, address)
    }
}
