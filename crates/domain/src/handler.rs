use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::value_objects::{validate_id, JobPriority};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 处理器静态元数据，启动时随处理器一起注册
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerMetadata {
    pub handler_id: String,
    pub priority: JobPriority,
    pub timeout_seconds: i64,
    pub max_retries: i32,
    pub lane: Option<String>,
}

impl HandlerMetadata {
    pub fn new(handler_id: impl Into<String>) -> Self {
        Self {
            handler_id: handler_id.into(),
            priority: JobPriority::Normal,
            timeout_seconds: 300,
            max_retries: 3,
            lane: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: i64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_lane(mut self, lane: impl Into<String>) -> Self {
        self.lane = Some(lane.into());
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        validate_id(&self.handler_id)?;
        if let Some(lane) = &self.lane {
            validate_id(lane)?;
        }
        if self.timeout_seconds <= 0 {
            return Err(SchedulerError::validation_error(format!(
                "处理器 {} 的超时时间必须大于0",
                self.handler_id
            )));
        }
        if self.max_retries < 0 {
            return Err(SchedulerError::validation_error(format!(
                "处理器 {} 的重试次数不能为负数",
                self.handler_id
            )));
        }
        Ok(())
    }
}

/// 周期计划产生的作业附带的上下文
#[derive(Debug, Clone)]
pub struct RecurringContext {
    pub schedule_id: Uuid,
    pub expression: String,
    pub occurrence: DateTime<Utc>,
}

/// 处理器的只读执行上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: Uuid,
    pub handler_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub priority: JobPriority,
    pub failure_count: i32,
    pub payload: serde_json::Value,
    pub metadata: HashMap<String, String>,
    pub recurring: Option<RecurringContext>,
    /// 协作式取消信号；超时清扫会在此之后强制中止
    pub cancellation: CancellationToken,
}

/// 作业处理器
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_validation() {
        assert!(HandlerMetadata::new("emails.send").validate().is_ok());
        assert!(HandlerMetadata::new("emails send").validate().is_err());
        assert!(HandlerMetadata::new("h")
            .with_timeout_seconds(0)
            .validate()
            .is_err());
        assert!(HandlerMetadata::new("h")
            .with_max_retries(-1)
            .validate()
            .is_err());
        assert!(HandlerMetadata::new("h")
            .with_lane("bad lane")
            .validate()
            .is_err());
    }
}
