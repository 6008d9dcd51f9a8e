use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use scheduler_core::HandlerRegistry;
use scheduler_domain::{ExecutionContext, HandlerMetadata, JobHandler, SchedulerResult};

pub const LOG_HANDLER_ID: &str = "builtin.log";
pub const NOOP_HANDLER_ID: &str = "builtin.noop";

/// 把负载写入日志
pub struct LogPayloadHandler;

#[async_trait]
impl JobHandler for LogPayloadHandler {
    async fn handle(&self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        match &ctx.recurring {
            Some(recurring) => info!(
                job_id = %ctx.job_id,
                schedule_id = %recurring.schedule_id,
                occurrence = %recurring.occurrence,
                "周期作业负载: {}",
                ctx.payload
            ),
            None => info!(job_id = %ctx.job_id, "作业负载: {}", ctx.payload),
        }
        Ok(())
    }
}

pub struct NoopHandler;

#[async_trait]
impl JobHandler for NoopHandler {
    async fn handle(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 二进制默认注册的处理器
pub fn builtin_handlers() -> SchedulerResult<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(
        HandlerMetadata::new(LOG_HANDLER_ID).with_timeout_seconds(30),
        Arc::new(LogPayloadHandler),
    )?;
    registry.register(
        HandlerMetadata::new(NOOP_HANDLER_ID)
            .with_timeout_seconds(30)
            .with_max_retries(0),
        Arc::new(NoopHandler),
    )?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_handlers_registered() {
        let registry = builtin_handlers().unwrap();
        assert_eq!(registry.handler_ids(), vec![LOG_HANDLER_ID, NOOP_HANDLER_ID]);
        assert_eq!(registry.metadata(NOOP_HANDLER_ID).unwrap().max_retries, 0);
    }
}
