use std::collections::HashMap;
use std::sync::Arc;

use scheduler_domain::{HandlerMetadata, JobHandler, SchedulerError, SchedulerResult};

/// 已注册的处理器及其静态元数据
#[derive(Clone)]
pub struct RegisteredHandler {
    pub metadata: HandlerMetadata,
    pub handler: Arc<dyn JobHandler>,
}

/// 启动时构建的处理器表：handler id → (元数据, 处理器)
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        metadata: HandlerMetadata,
        handler: Arc<dyn JobHandler>,
    ) -> SchedulerResult<()> {
        metadata.validate()?;
        if self.handlers.contains_key(&metadata.handler_id) {
            return Err(SchedulerError::already_exists(format!(
                "处理器 {}",
                metadata.handler_id
            )));
        }
        self.handlers.insert(
            metadata.handler_id.clone(),
            RegisteredHandler { metadata, handler },
        );
        Ok(())
    }

    pub fn get(&self, handler_id: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(handler_id)
    }

    pub fn metadata(&self, handler_id: &str) -> SchedulerResult<&HandlerMetadata> {
        self.handlers
            .get(handler_id)
            .map(|registered| &registered.metadata)
            .ok_or_else(|| SchedulerError::not_found("Handler", handler_id))
    }

    pub fn handler_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handlers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scheduler_domain::ExecutionContext;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn handle(&self, _ctx: &ExecutionContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(HandlerMetadata::new("emails.send"), Arc::new(Noop))
            .unwrap();
        assert_eq!(registry.metadata("emails.send").unwrap().timeout_seconds, 300);
        assert!(registry.get("missing").is_none());
        assert!(matches!(
            registry.metadata("missing"),
            Err(SchedulerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_and_invalid_metadata_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(HandlerMetadata::new("a"), Arc::new(Noop))
            .unwrap();
        assert!(matches!(
            registry.register(HandlerMetadata::new("a"), Arc::new(Noop)),
            Err(SchedulerError::AlreadyExists(_))
        ));
        assert!(registry
            .register(
                HandlerMetadata::new("b").with_timeout_seconds(0),
                Arc::new(Noop)
            )
            .is_err());
        assert_eq!(registry.len(), 1);
    }
}
