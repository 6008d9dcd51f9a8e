//! 周期计划物化
//!
//! 把周期表达式展开为滚动时间范围内的具体作业。上一次计划失败时，
//! 先读回窗口内已物化的作业建立按秒去重集合（±1s），避免重复物化。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use scheduler_core::{to_chrono, ClusterContext, RecurringConfig};
use scheduler_domain::{
    HandlerMetadata, Job, RecurringSchedule, ScheduleScanKind, SchedulerError, SchedulerResult,
};

use crate::expression::CompiledExpression;
use crate::scan_planner::ScanLane;
use crate::scan_targets::ScheduleProcessor;

/// 相邻两次触发的最小间隔（秒）
const MIN_SPACING_SECONDS: i64 = 1;

/// 每秒可计划次数上限相对于计划扫描间隔的倍数
const OCCURRENCES_PER_RUNNER_SECOND: u64 = 10;

/// 一次计划的输入
#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub schedule_id: Uuid,
    pub expression: &'a CompiledExpression,
    pub base_time: DateTime<Utc>,
    pub horizon: chrono::Duration,
    pub end_before: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
    pub had_failed_last_plan: bool,
    /// 窗口内已物化作业的原始计划时间，仅在上次计划失败时使用
    pub existing: &'a [DateTime<Utc>],
    pub max_occurrences: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanResult {
    /// 本次计划后应记录的覆盖边界
    pub new_coverage_until: DateTime<Utc>,
    pub occurrences: Vec<DateTime<Utc>>,
    /// `min(now + horizon, end_before)`
    pub horizon_used: DateTime<Utc>,
    /// 表达式已永久结束（不再有下一次触发）
    pub expression_ended: bool,
}

/// 计算 `(base_time, stop_at]` 内的触发时间
pub fn plan_next_dates(request: &PlanRequest<'_>) -> PlanResult {
    let mut stop_at = request.now + request.horizon;
    if let Some(end) = request.end_before {
        stop_at = stop_at.min(end);
    }

    let mut dedup: HashSet<i64> = HashSet::new();
    if request.had_failed_last_plan {
        dedup.extend(request.existing.iter().map(|t| t.timestamp()));
    }
    let collides = |set: &HashSet<i64>, at: DateTime<Utc>| {
        let s = at.timestamp();
        set.contains(&(s - 1)) || set.contains(&s) || set.contains(&(s + 1))
    };

    let mut occurrences = Vec::new();
    let mut cursor = request.base_time;
    let mut last_emitted: Option<DateTime<Utc>> = None;
    let mut expression_ended = false;
    let mut hit_limit = false;

    loop {
        let Some(next) = request.expression.next_after(cursor) else {
            expression_ended = true;
            break;
        };
        // 表达式不再前进
        if next <= cursor {
            break;
        }
        if request.end_before.is_some_and(|end| next >= end) {
            expression_ended = true;
            break;
        }
        if next > stop_at {
            break;
        }
        cursor = next;

        let too_close = last_emitted
            .is_some_and(|last| (next - last).num_seconds() < MIN_SPACING_SECONDS);
        if too_close || collides(&dedup, next) {
            debug!("周期计划 {} 跳过重复的触发时间 {}", request.schedule_id, next);
            continue;
        }

        occurrences.push(next);
        last_emitted = Some(next);
        if occurrences.len() >= request.max_occurrences {
            hit_limit = true;
            break;
        }
    }

    let new_coverage_until = if hit_limit {
        cursor
    } else {
        stop_at.max(request.base_time)
    };

    PlanResult {
        new_coverage_until,
        occurrences,
        horizon_used: stop_at,
        expression_ended,
    }
}

/// 周期计划参数
#[derive(Debug, Clone)]
pub struct RecurringSettings {
    pub horizon: Duration,
    pub max_runner_interval: Duration,
}

impl RecurringSettings {
    pub fn from_config(config: &RecurringConfig) -> Self {
        Self {
            horizon: config.horizon(),
            max_runner_interval: config.max_runner_interval(),
        }
    }

    pub fn max_occurrences(&self) -> usize {
        (self.max_runner_interval.as_secs().max(1) * OCCURRENCES_PER_RUNNER_SECOND) as usize
    }

    fn horizon_chrono(&self) -> chrono::Duration {
        to_chrono(self.horizon)
    }

    /// 覆盖边界早于该时间的计划需要再次计划
    pub fn planning_due_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let slack = to_chrono(self.max_runner_interval);
        now + self.horizon_chrono() - slack
    }
}

impl Default for RecurringSettings {
    fn default() -> Self {
        Self::from_config(&RecurringConfig::default())
    }
}

/// 周期计划的物化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterializeOutcome {
    Materialized { jobs: usize, coverage_until: DateTime<Utc> },
    CoverageAdvanced { coverage_until: DateTime<Utc> },
    Completed,
    /// 计划已被其他节点修改或不再可计划
    Skipped,
}

pub struct RecurringPlanner {
    context: Arc<ClusterContext>,
    settings: RecurringSettings,
}

impl RecurringPlanner {
    pub fn new(context: Arc<ClusterContext>, settings: RecurringSettings) -> Self {
        Self { context, settings }
    }

    pub fn compile(schedule: &RecurringSchedule) -> SchedulerResult<CompiledExpression> {
        let anchor = schedule.start_after.unwrap_or(schedule.created_at);
        CompiledExpression::compile(&schedule.expression, &schedule.timezone, anchor)
    }

    /// 计算下一批触发时间；上次计划失败时读回已物化的作业参与去重
    pub async fn plan(
        &self,
        schedule: &RecurringSchedule,
        now: DateTime<Utc>,
    ) -> SchedulerResult<PlanResult> {
        let expression = Self::compile(schedule)?;
        let base_time = schedule.planning_base();
        let horizon = self.settings.horizon_chrono();

        let existing: Vec<DateTime<Utc>> = if schedule.has_failed_on_last_plan {
            let mut stop_at = now + horizon;
            if let Some(end) = schedule.end_before {
                stop_at = stop_at.min(end);
            }
            self.context
                .jobs()
                .list_by_recurring_schedule(&schedule.cluster_id, schedule.id, base_time, stop_at)
                .await?
                .into_iter()
                .map(|job| job.original_scheduled_at)
                .collect()
        } else {
            Vec::new()
        };

        Ok(plan_next_dates(&PlanRequest {
            schedule_id: schedule.id,
            expression: &expression,
            base_time,
            horizon,
            end_before: schedule.end_before,
            now,
            had_failed_last_plan: schedule.has_failed_on_last_plan,
            existing: &existing,
            max_occurrences: self.settings.max_occurrences(),
        }))
    }

    /// 计划并把触发时间批量物化为留存在主存储的作业
    pub async fn materialize(
        &self,
        mut schedule: RecurringSchedule,
        now: DateTime<Utc>,
    ) -> SchedulerResult<MaterializeOutcome> {
        if !schedule.is_plannable() {
            return Ok(MaterializeOutcome::Skipped);
        }

        let plan = self.plan(&schedule, now).await?;

        if plan.occurrences.is_empty() {
            if plan.expression_ended {
                schedule.complete(now)?;
                if !self.context.schedules().update(&mut schedule).await? {
                    return Ok(MaterializeOutcome::Skipped);
                }
                info!("周期计划 {} 的表达式已结束，标记为完成", schedule.id);
                return Ok(MaterializeOutcome::Completed);
            }

            schedule.advance_coverage(plan.new_coverage_until);
            schedule.has_failed_on_last_plan = false;
            schedule.last_executed_plan = Some(now);
            schedule.updated_at = now;
            if !self.context.schedules().update(&mut schedule).await? {
                return Ok(MaterializeOutcome::Skipped);
            }
            return Ok(MaterializeOutcome::CoverageAdvanced {
                coverage_until: plan.new_coverage_until,
            });
        }

        // 失败标记在插入前置位，覆盖边界前移后才清除
        schedule.has_failed_on_last_plan = true;
        if !self.context.schedules().update(&mut schedule).await? {
            return Ok(MaterializeOutcome::Skipped);
        }

        let jobs = self.build_jobs(&schedule, &plan.occurrences)?;
        self.context.jobs().insert_batch(&jobs).await?;

        schedule.has_failed_on_last_plan = false;
        schedule.advance_coverage(plan.new_coverage_until);
        schedule.last_executed_plan = Some(now);
        schedule.updated_at = now;
        if !self.context.schedules().update(&mut schedule).await? {
            return Err(SchedulerError::database_error(format!(
                "周期计划 {} 物化后更新覆盖边界时版本冲突",
                schedule.id
            )));
        }

        debug!(
            "周期计划 {} 物化 {} 个作业，覆盖至 {}",
            schedule.id,
            jobs.len(),
            plan.new_coverage_until
        );
        metrics::counter!("scheduler_recurring_jobs_materialized_total").increment(jobs.len() as u64);
        Ok(MaterializeOutcome::Materialized {
            jobs: jobs.len(),
            coverage_until: plan.new_coverage_until,
        })
    }

    fn build_jobs(
        &self,
        schedule: &RecurringSchedule,
        occurrences: &[DateTime<Utc>],
    ) -> SchedulerResult<Vec<Job>> {
        let metadata = HandlerMetadata {
            handler_id: schedule.handler_id.clone(),
            priority: schedule.priority,
            timeout_seconds: schedule.timeout_seconds,
            max_retries: schedule.max_retries,
            lane: schedule.lane.clone(),
        };

        occurrences
            .iter()
            .map(|occurrence| {
                let mut job = Job::new(
                    schedule.cluster_id.clone(),
                    &metadata,
                    schedule.payload.clone(),
                    *occurrence,
                );
                job.metadata = schedule.metadata.clone();
                job.recurring_schedule_id = Some(schedule.id);
                job.hold_on_master()?;
                Ok(job)
            })
            .collect()
    }
}

/// 扫描到期的 `Active` 周期计划并物化
pub struct RecurringPlanProcessor {
    planner: RecurringPlanner,
}

impl RecurringPlanProcessor {
    pub fn new(planner: RecurringPlanner) -> Self {
        Self { planner }
    }
}

#[async_trait]
impl ScheduleProcessor for RecurringPlanProcessor {
    fn name(&self) -> &'static str {
        "recurring-planner"
    }

    fn lane(&self) -> ScanLane {
        ScanLane::RecurringPlanning
    }

    fn kind(&self, now: DateTime<Utc>) -> ScheduleScanKind {
        ScheduleScanKind::PlanningDue {
            horizon: self.planner.settings.planning_due_before(now),
        }
    }

    async fn process(&self, schedule: RecurringSchedule, now: DateTime<Utc>) -> SchedulerResult<()> {
        self.planner.materialize(schedule, now).await.map(|_| ())
    }
}
