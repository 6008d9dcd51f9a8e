//! profile 声明的静态周期计划
//!
//! 每次启动时重新确认 profile 中的全部定义并盖上确认时间戳；
//! 超过阈值仍未被重新确认的静态计划由孤儿扫描停用。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use scheduler_core::to_chrono;
use scheduler_domain::{
    RecurringSchedule, RecurringScheduleStatus, ScheduleScanKind, SchedulerResult,
    StaticScheduleDefinition,
};

use crate::dispatch_service::DispatchService;
use crate::recurring_planner::RecurringPlanner;
use crate::scan_planner::ScanLane;
use crate::scan_targets::ScheduleProcessor;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnsureReport {
    pub created: usize,
    pub updated: usize,
    pub reactivated: usize,
    pub unchanged: usize,
    /// 已取消或已完成的定义不会被重新创建
    pub skipped: usize,
}

pub struct StaticScheduleKeeper {
    dispatcher: Arc<DispatchService>,
}

impl StaticScheduleKeeper {
    pub fn new(dispatcher: Arc<DispatchService>) -> Self {
        Self { dispatcher }
    }

    /// 确认 profile 的全部静态计划
    pub async fn ensure(
        &self,
        profile_id: &str,
        definitions: &[StaticScheduleDefinition],
    ) -> SchedulerResult<EnsureReport> {
        let context = self.dispatcher.context();
        let cluster_timezone = context.configuration().await?.timezone;
        let mut report = EnsureReport::default();

        for definition in definitions {
            let timezone = definition
                .timezone
                .clone()
                .unwrap_or_else(|| cluster_timezone.clone());
            let now = Utc::now();

            let existing = context
                .schedules()
                .get_static(context.cluster_id(), profile_id, &definition.definition_id)
                .await?;

            let Some(mut schedule) = existing else {
                let schedule = self.build(profile_id, definition, &timezone, now)?;
                let outcome = self.dispatcher.schedule_recurring(schedule).await?;
                debug!("静态计划 {}/{} 已创建: {:?}", profile_id, definition.definition_id, outcome);
                report.created += 1;
                continue;
            };

            match schedule.status {
                RecurringScheduleStatus::Canceled | RecurringScheduleStatus::Completed => {
                    report.skipped += 1;
                    continue;
                }
                RecurringScheduleStatus::Inactive => {
                    schedule.reactivate(now)?;
                    apply_definition(&mut schedule, definition, &timezone);
                    report.reactivated += 1;
                }
                RecurringScheduleStatus::PendingSave | RecurringScheduleStatus::Active => {
                    if apply_definition(&mut schedule, definition, &timezone) {
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
            }

            RecurringPlanner::compile(&schedule)?;
            schedule.static_last_ensured = Some(now);
            schedule.updated_at = now;
            if !context.schedules().update(&mut schedule).await? {
                warn!(
                    "静态计划 {}/{} 确认时版本冲突",
                    profile_id, definition.definition_id
                );
            }
        }

        info!(
            "profile {} 的静态计划已确认: 新建 {}, 更新 {}, 恢复 {}, 未变 {}, 跳过 {}",
            profile_id,
            report.created,
            report.updated,
            report.reactivated,
            report.unchanged,
            report.skipped
        );
        Ok(report)
    }

    fn build(
        &self,
        profile_id: &str,
        definition: &StaticScheduleDefinition,
        timezone: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<RecurringSchedule> {
        let context = self.dispatcher.context();
        let handler = context.handlers().metadata(&definition.handler_id)?;
        let mut schedule = RecurringSchedule::new(
            context.cluster_id(),
            handler,
            definition.expression.clone(),
            timezone,
            definition.payload.clone(),
        );
        schedule.start_after = definition.start_after;
        schedule.end_before = definition.end_before;
        schedule.profile_id = Some(profile_id.to_string());
        schedule.static_definition_id = Some(definition.definition_id.clone());
        schedule.static_last_ensured = Some(now);
        Ok(schedule)
    }
}

/// 把定义写回已有计划；表达式或时区变化时下一次计划走去重路径
fn apply_definition(
    schedule: &mut RecurringSchedule,
    definition: &StaticScheduleDefinition,
    timezone: &str,
) -> bool {
    let recurrence_changed = schedule.expression != definition.expression || schedule.timezone != timezone;
    let changed = recurrence_changed
        || schedule.handler_id != definition.handler_id
        || schedule.payload != definition.payload
        || schedule.start_after != definition.start_after
        || schedule.end_before != definition.end_before;

    if changed {
        schedule.handler_id = definition.handler_id.clone();
        schedule.expression = definition.expression.clone();
        schedule.timezone = timezone.to_string();
        schedule.payload = definition.payload.clone();
        schedule.start_after = definition.start_after;
        schedule.end_before = definition.end_before;
    }
    if recurrence_changed {
        schedule.has_failed_on_last_plan = true;
    }
    changed
}

/// 停用超过阈值未被重新确认的静态计划
pub struct StaticOrphanProcessor {
    dispatcher: Arc<DispatchService>,
    threshold: chrono::Duration,
}

impl StaticOrphanProcessor {
    pub fn new(dispatcher: Arc<DispatchService>, threshold: Duration) -> Self {
        Self {
            dispatcher,
            threshold: to_chrono(threshold),
        }
    }
}

#[async_trait]
impl ScheduleProcessor for StaticOrphanProcessor {
    fn name(&self) -> &'static str {
        "static-orphans"
    }

    fn lane(&self) -> ScanLane {
        ScanLane::StaticOrphan
    }

    fn kind(&self, now: DateTime<Utc>) -> ScheduleScanKind {
        ScheduleScanKind::StaticOrphaned {
            ensured_before: now - self.threshold,
        }
    }

    async fn process(&self, mut schedule: RecurringSchedule, now: DateTime<Utc>) -> SchedulerResult<()> {
        schedule.deactivate(now)?;
        if self.dispatcher.context().schedules().update(&mut schedule).await? {
            info!(
                "静态计划 {}/{} 长期未确认，已停用",
                schedule.profile_id.as_deref().unwrap_or_default(),
                schedule.static_definition_id.as_deref().unwrap_or_default()
            );
        }
        Ok(())
    }
}
