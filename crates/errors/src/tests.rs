use crate::*;

#[test]
fn test_scheduler_error_display() {
    let db_op_error = SchedulerError::DatabaseOperation("Connection failed".to_string());
    assert_eq!(db_op_error.to_string(), "数据库操作错误: Connection failed");

    let not_found = SchedulerError::not_found("作业", "abc");
    assert_eq!(not_found.to_string(), "作业未找到: abc");

    let capacity = SchedulerError::CapacityExceeded {
        size: 2048,
        limit: 1024,
    };
    assert_eq!(capacity.to_string(), "消息大小超出上限: 2048 > 1024 字节");

    let lease = SchedulerError::LeaseTooLong {
        requested_secs: 200_000,
        max_secs: 176_400,
    };
    assert_eq!(lease.to_string(), "锁租约过长: 200000s > 176400s");
}

#[test]
fn test_ambiguous_publish_carries_supposed_id() {
    let err = SchedulerError::AmbiguousPublish {
        supposed_id: "msg-42".to_string(),
        message: "publish timed out".to_string(),
    };
    assert!(err.is_ambiguous());
    assert!(err.is_retryable());
    assert_eq!(err.supposed_published_id(), Some("msg-42"));

    let other = SchedulerError::transport("broken pipe");
    assert_eq!(other.supposed_published_id(), None);
    assert!(!other.is_ambiguous());
}

#[test]
fn test_error_classification() {
    assert!(SchedulerError::Timeout("lock".into()).is_retryable());
    assert!(SchedulerError::QueueFull("bucket-1".into()).is_retryable());
    assert!(!SchedulerError::already_exists("job 1").is_retryable());
    assert!(!SchedulerError::ValidationError("bad".into()).is_retryable());

    assert!(SchedulerError::Internal("boom".into()).is_fatal());
    assert!(SchedulerError::config_error("missing").is_fatal());
    assert!(!SchedulerError::ShuttingDown.is_fatal());
}

#[test]
fn test_invalid_transition_formats_states() {
    #[derive(Debug)]
    enum S {
        Succeeded,
        Processing,
    }
    let err = SchedulerError::invalid_transition("Job", S::Succeeded, S::Processing);
    assert_eq!(err.to_string(), "非法状态迁移: Job Succeeded -> Processing");
}

#[test]
fn test_from_serde_json_error() {
    let parse = serde_json::from_str::<serde_json::Value>("{not json");
    let err: SchedulerError = parse.unwrap_err().into();
    assert!(matches!(err, SchedulerError::Serialization(_)));
}
