//! 本地执行队列
//!
//! 每个 Bucket 一个队列：固定数量的运行槽位加上容量为槽位 5 倍的等待队列。
//! 入队按 id 去重，队列满或正在关闭时拒绝；tick 回收已结束的槽位并启动等待项；
//! 超时巡检取消运行超时的项，超过宽限期仍未退出的强制中止。

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use scheduler_domain::{JobPriority, SchedulerError, SchedulerResult};

/// 等待队列容量相对于槽位数的倍数
pub const WAITING_QUEUE_FACTOR: usize = 5;

/// 超时后协作取消未生效时，再等待这么久强制中止
const FORCE_ABORT_AFTER: Duration = Duration::from_secs(5);

/// 启动一个队列项，返回其执行 future
pub type TaskStarter<T> = Arc<dyn Fn(T, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

/// 入队前的准入检查
pub type AdmissionCheck<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// 同一 id 已在排队或运行，入队是无操作的成功
    AlreadyQueued,
}

struct WaitingItem<T> {
    id: Uuid,
    item: T,
    timeout: Duration,
}

struct RunningItem {
    started: Instant,
    timeout: Duration,
    cancellation: CancellationToken,
    handle: JoinHandle<()>,
}

struct QueueState<T> {
    waiting: VecDeque<WaitingItem<T>>,
    running: HashMap<Uuid, RunningItem>,
    shutting_down: bool,
}

pub struct TaskQueueControl<T> {
    name: String,
    slots: usize,
    capacity: usize,
    starter: TaskStarter<T>,
    admission: Option<AdmissionCheck<T>>,
    state: Mutex<QueueState<T>>,
}

impl<T: Send + 'static> TaskQueueControl<T> {
    pub fn new(name: impl Into<String>, slots: usize, starter: TaskStarter<T>) -> Self {
        let slots = slots.max(1);
        Self {
            name: name.into(),
            slots,
            capacity: slots * WAITING_QUEUE_FACTOR,
            starter,
            admission: None,
            state: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                running: HashMap::new(),
                shutting_down: false,
            }),
        }
    }

    /// 槽位数 = 优先级基础槽位 × 并行系数
    pub fn for_priority(
        name: impl Into<String>,
        priority: JobPriority,
        parallelism_factor: usize,
        starter: TaskStarter<T>,
    ) -> Self {
        Self::new(name, priority.base_slots() * parallelism_factor.max(1), starter)
    }

    pub fn with_admission(mut self, admission: AdmissionCheck<T>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn queue_capacity(&self) -> usize {
        self.capacity
    }

    fn state(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.state().waiting.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        state.running.is_empty() && state.waiting.is_empty()
    }

    /// 等待队列还能容纳的项数
    pub fn available(&self) -> usize {
        let state = self.state();
        if state.shutting_down {
            return 0;
        }
        self.capacity.saturating_sub(state.waiting.len())
    }

    pub fn has_capacity(&self) -> bool {
        self.available() > 0
    }

    pub fn contains(&self, id: Uuid) -> bool {
        let state = self.state();
        state.running.contains_key(&id) || state.waiting.iter().any(|w| w.id == id)
    }

    pub fn enqueue(&self, id: Uuid, item: T, timeout: Duration) -> SchedulerResult<EnqueueOutcome> {
        {
            let mut state = self.state();
            if state.shutting_down {
                return Err(SchedulerError::ShuttingDown);
            }
            if state.running.contains_key(&id) || state.waiting.iter().any(|w| w.id == id) {
                return Ok(EnqueueOutcome::AlreadyQueued);
            }
            if let Some(admission) = &self.admission {
                if !admission(&item) {
                    return Err(SchedulerError::validation_error(format!(
                        "队列 {} 拒绝了 {}",
                        self.name, id
                    )));
                }
            }
            if state.waiting.len() >= self.capacity {
                metrics::counter!("scheduler_task_queue_rejected_total").increment(1);
                return Err(SchedulerError::QueueFull(self.name.clone()));
            }
            state.waiting.push_back(WaitingItem { id, item, timeout });
        }

        self.tick();
        Ok(EnqueueOutcome::Enqueued)
    }

    /// 回收已结束的槽位并启动等待项，返回本次启动的数量
    pub fn tick(&self) -> usize {
        let mut state = self.state();
        state.running.retain(|_, running| !running.handle.is_finished());
        if state.shutting_down {
            return 0;
        }

        let mut started = 0;
        while state.running.len() < self.slots {
            let Some(next) = state.waiting.pop_front() else {
                break;
            };
            let cancellation = CancellationToken::new();
            let handle = tokio::spawn((self.starter)(next.item, cancellation.clone()));
            state.running.insert(
                next.id,
                RunningItem {
                    started: Instant::now(),
                    timeout: next.timeout,
                    cancellation,
                    handle,
                },
            );
            started += 1;
        }
        started
    }

    /// 取消运行超时的项，返回本次新取消的 id
    pub fn sweep_timeouts(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let state = self.state();
        let mut cancelled = Vec::new();
        for (id, running) in state.running.iter() {
            let elapsed = now.duration_since(running.started);
            if elapsed <= running.timeout {
                continue;
            }
            if !running.cancellation.is_cancelled() {
                warn!("队列 {} 中的 {} 运行 {:?} 超时，取消执行", self.name, id, elapsed);
                running.cancellation.cancel();
                cancelled.push(*id);
            } else if elapsed > running.timeout + FORCE_ABORT_AFTER {
                warn!("队列 {} 中的 {} 未响应取消，强制中止", self.name, id);
                running.handle.abort();
            }
        }
        cancelled
    }

    /// 中止一个项：运行中的发出取消信号，排队中的直接移除
    pub fn abort(&self, id: Uuid) -> bool {
        let mut state = self.state();
        if let Some(running) = state.running.get(&id) {
            running.cancellation.cancel();
            return true;
        }
        let before = state.waiting.len();
        state.waiting.retain(|w| w.id != id);
        before != state.waiting.len()
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.state().running.keys().copied().collect()
    }

    /// 停止接收新项，返回尚未启动的项；运行中的项取消后最多等待 `grace`，随后强制中止
    pub async fn shutdown(&self, grace: Duration) -> Vec<(Uuid, T)> {
        let (queued, running) = {
            let mut state = self.state();
            state.shutting_down = true;
            let queued: Vec<(Uuid, T)> = state.waiting.drain(..).map(|w| (w.id, w.item)).collect();
            let running: Vec<RunningItem> = state.running.drain().map(|(_, r)| r).collect();
            (queued, running)
        };

        if !running.is_empty() {
            debug!("队列 {} 关闭，等待 {} 个运行项退出", self.name, running.len());
            let aborts: Vec<AbortHandle> = running.iter().map(|r| r.handle.abort_handle()).collect();
            for item in &running {
                item.cancellation.cancel();
            }
            let handles = running.into_iter().map(|r| r.handle);
            if tokio::time::timeout(grace, join_all(handles)).await.is_err() {
                warn!("队列 {} 的运行项未在 {:?} 内退出，强制中止", self.name, grace);
                for abort in aborts {
                    abort.abort();
                }
            }
        }
        queued
    }
}
