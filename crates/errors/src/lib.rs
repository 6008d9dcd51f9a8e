use thiserror::Error;

/// 协调器统一错误类型
///
/// 锁竞争与行认领失败不属于错误：前者返回 `None`，后者返回受影响行数 0。
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("数据库操作错误: {0}")]
    DatabaseOperation(String),
    #[error("记录已存在: {0}")]
    AlreadyExists(String),
    #[error("{kind}未找到: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("消息发布结果未知 (supposed id: {supposed_id}): {message}")]
    AmbiguousPublish { supposed_id: String, message: String },
    #[error("消息传输错误: {0}")]
    Transport(String),
    #[error("消息大小超出上限: {size} > {limit} 字节")]
    CapacityExceeded { size: usize, limit: usize },
    #[error("执行队列已满: {0}")]
    QueueFull(String),
    #[error("组件正在关闭")]
    ShuttingDown,
    #[error("作业 {job_id} 即将开始执行，拒绝取消")]
    CancellationRefused { job_id: String },
    #[error("非法状态迁移: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("锁租约过长: {requested_secs}s > {max_secs}s")]
    LeaseTooLong { requested_secs: i64, max_secs: i64 },
    #[error("无效的标识符 '{id}': {reason}")]
    InvalidId { id: String, reason: String },
    #[error("无效的周期表达式: {expr} - {message}")]
    InvalidExpression { expr: String, message: String },
    #[error("无效的时区: {0}")]
    InvalidTimezone(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn database_error<S: Into<String>>(msg: S) -> Self {
        Self::DatabaseOperation(msg.into())
    }
    pub fn not_found<S: Into<String>>(kind: &'static str, id: S) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }
    pub fn already_exists<S: Into<String>>(what: S) -> Self {
        Self::AlreadyExists(what.into())
    }
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn invalid_transition(
        entity: &'static str,
        from: impl std::fmt::Debug,
        to: impl std::fmt::Debug,
    ) -> Self {
        Self::InvalidTransition {
            entity,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// 传输超时时由传输层预先分配的消息 id
    pub fn supposed_published_id(&self) -> Option<&str> {
        match self {
            SchedulerError::AmbiguousPublish { supposed_id, .. } => Some(supposed_id),
            _ => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, SchedulerError::AmbiguousPublish { .. })
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_) | SchedulerError::Configuration(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Database(_)
                | SchedulerError::DatabaseOperation(_)
                | SchedulerError::Transport(_)
                | SchedulerError::AmbiguousPublish { .. }
                | SchedulerError::Timeout(_)
                | SchedulerError::QueueFull(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests;
