use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 主存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

/// 主存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub url: Option<String>,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            url: None,
            max_connections: 10,
            connection_timeout_seconds: 30,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == StorageBackend::Postgres {
            let url = self
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("postgres后端需要数据库URL"))?;
            if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                return Err(anyhow::anyhow!("数据库URL必须是PostgreSQL格式"));
            }
            if self.max_connections == 0 {
                return Err(anyhow::anyhow!("最大连接数必须大于0"));
            }
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }
}

/// Agent传输后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportBackend {
    Memory,
    Redis,
}

/// Agent传输配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub backend: TransportBackend,
    pub url: Option<String>,
    pub publish_timeout_ms: u64,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub max_publish_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backend: TransportBackend::Memory,
            url: None,
            publish_timeout_ms: 5_000,
            retry_base_ms: 200,
            retry_max_ms: 5_000,
            max_publish_attempts: 3,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.backend == TransportBackend::Redis {
            let url = self
                .url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redis传输需要URL"))?;
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(anyhow::anyhow!("Redis URL格式无效"));
            }
        }

        if self.publish_timeout_ms == 0 {
            return Err(anyhow::anyhow!("发布超时必须大于0"));
        }

        if self.retry_base_ms > self.retry_max_ms {
            return Err(anyhow::anyhow!("重试基础间隔不能大于最大间隔"));
        }

        if self.max_publish_attempts == 0 {
            return Err(anyhow::anyhow!("发布尝试次数必须大于0"));
        }

        Ok(())
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: String,
    /// 设置后在该地址暴露 Prometheus 指标
    pub metrics_bind: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_bind: None,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!("无效的日志级别: {}", self.log_level));
        }

        if !["json", "pretty"].contains(&self.log_format.as_str()) {
            return Err(anyhow::anyhow!("不支持的日志格式: {}", self.log_format));
        }

        if let Some(bind) = &self.metrics_bind {
            bind.parse::<std::net::SocketAddr>()
                .map_err(|_| anyhow::anyhow!("无效的指标监听地址: {bind}"))?;
        }

        Ok(())
    }
}
