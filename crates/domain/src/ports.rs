use async_trait::async_trait;
use uuid::Uuid;

use crate::models::Job;
use scheduler_errors::SchedulerResult;

/// 本地执行引擎端口
///
/// 派发服务通过它判断能否短路派发（跳过传输层直接交给本进程的 Worker），
/// 取消传播扫描器通过它中止正在本地执行的作业。
#[async_trait]
pub trait LocalExecutionEngine: Send + Sync {
    fn worker_id(&self) -> &str;

    /// 指定 Bucket 的本地执行队列是否还有空间
    fn has_capacity(&self, bucket_id: &str) -> bool;

    /// 直接把已持久化分配的作业交给本地执行队列
    async fn inject(&self, bucket_id: &str, job: Job) -> SchedulerResult<()>;

    /// 中止本地正在执行或排队的作业，返回是否找到
    async fn abort(&self, job_id: Uuid) -> bool;
}
