//! 周期表达式的编译与求值
//!
//! cron 表达式在计划的 IANA 时区内求值后换算为 UTC；
//! 固定间隔表达式以锚点时间为起点，不受时区影响。

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use cron::Schedule;

use scheduler_domain::{ExpressionKind, RecurrenceExpression, SchedulerError, SchedulerResult};

#[derive(Debug, Clone)]
enum Recurrence {
    Cron(Box<Schedule>),
    Interval { every: Duration, anchor: DateTime<Utc> },
}

/// 已编译、可求值的周期表达式
#[derive(Debug, Clone)]
pub struct CompiledExpression {
    text: String,
    timezone: Tz,
    recurrence: Recurrence,
}

impl CompiledExpression {
    /// 编译表达式；`anchor` 只对固定间隔表达式有意义
    pub fn compile(
        expression: &RecurrenceExpression,
        timezone: &str,
        anchor: DateTime<Utc>,
    ) -> SchedulerResult<Self> {
        let tz = parse_timezone(timezone)?;
        let recurrence = match expression.kind {
            ExpressionKind::Cron => Recurrence::Cron(Box::new(parse_cron(&expression.text)?)),
            ExpressionKind::Interval => Recurrence::Interval {
                every: parse_interval(&expression.text)?,
                anchor,
            },
        };
        Ok(Self {
            text: expression.text.clone(),
            timezone: tz,
            recurrence,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// 严格晚于 `after` 的下一次触发时间；表达式永久结束时返回 `None`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.recurrence {
            Recurrence::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|local| local.with_timezone(&Utc)),
            Recurrence::Interval { every, anchor } => {
                let step = every.num_milliseconds();
                let elapsed = (after - *anchor).num_milliseconds();
                let k = if elapsed < 0 { 1 } else { elapsed / step + 1 };
                anchor.checked_add_signed(Duration::milliseconds(step.checked_mul(k)?))
            }
        }
    }
}

pub fn parse_timezone(timezone: &str) -> SchedulerResult<Tz> {
    timezone
        .parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(timezone.to_string()))
}

/// 5 段表达式按“秒=0”补齐为 6 段
fn parse_cron(text: &str) -> SchedulerResult<Schedule> {
    let trimmed = text.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidExpression {
        expr: text.to_string(),
        message: e.to_string(),
    })
}

/// `every N second(s)|minute(s)|hour(s)`，大小写不敏感，N 必须大于 0
fn parse_interval(text: &str) -> SchedulerResult<Duration> {
    let invalid = |message: &str| SchedulerError::InvalidExpression {
        expr: text.to_string(),
        message: message.to_string(),
    };

    let lowered = text.trim().to_ascii_lowercase();
    let parts: Vec<&str> = lowered.split_whitespace().collect();
    let [every, amount, unit] = parts.as_slice() else {
        return Err(invalid("格式应为 'every N seconds|minutes|hours'"));
    };
    if *every != "every" {
        return Err(invalid("必须以 'every' 开头"));
    }

    let amount: i64 = amount.parse().map_err(|_| invalid("间隔必须是正整数"))?;
    if amount <= 0 {
        return Err(invalid("间隔必须大于0"));
    }

    let seconds_per_unit = match *unit {
        "second" | "seconds" => 1,
        "minute" | "minutes" => 60,
        "hour" | "hours" => 3600,
        _ => return Err(invalid("不支持的时间单位")),
    };

    amount
        .checked_mul(seconds_per_unit)
        .filter(|secs| *secs <= i64::MAX / 1000)
        .map(Duration::seconds)
        .ok_or_else(|| invalid("间隔过大"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_interval_is_anchored() {
        let anchor = at(10, 0, 0);
        let expr = CompiledExpression::compile(
            &RecurrenceExpression::interval("every 5 seconds"),
            "UTC",
            anchor,
        )
        .unwrap();

        assert_eq!(expr.next_after(anchor), Some(at(10, 0, 5)));
        assert_eq!(expr.next_after(at(10, 0, 4)), Some(at(10, 0, 5)));
        assert_eq!(expr.next_after(at(10, 0, 5)), Some(at(10, 0, 10)));
        assert_eq!(expr.next_after(at(9, 0, 0)), Some(at(10, 0, 5)));
    }

    #[test]
    fn test_interval_parsing() {
        let anchor = at(0, 0, 0);
        for (text, secs) in [("every 1 second", 1), ("Every 2 Minutes", 120), ("every 3 hours", 10_800)] {
            let expr = CompiledExpression::compile(&RecurrenceExpression::interval(text), "UTC", anchor).unwrap();
            assert_eq!(expr.next_after(anchor), Some(anchor + Duration::seconds(secs)));
        }
        for bad in ["every 0 seconds", "every -1 seconds", "each 5 seconds", "every 5 days", "every five seconds", "every 5"] {
            assert!(matches!(
                CompiledExpression::compile(&RecurrenceExpression::interval(bad), "UTC", anchor),
                Err(SchedulerError::InvalidExpression { .. })
            ));
        }
    }

    #[test]
    fn test_cron_evaluated_in_timezone() {
        // 每天 09:00 上海时间 = 01:00 UTC
        let expr = CompiledExpression::compile(
            &RecurrenceExpression::cron("0 0 9 * * *"),
            "Asia/Shanghai",
            at(0, 0, 0),
        )
        .unwrap();
        assert_eq!(expr.next_after(at(0, 30, 0)), Some(at(1, 0, 0)));
        assert_eq!(
            expr.next_after(at(1, 0, 0)),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 1, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_five_field_cron_gets_seconds() {
        let expr = CompiledExpression::compile(
            &RecurrenceExpression::cron("*/15 * * * *"),
            "UTC",
            at(0, 0, 0),
        )
        .unwrap();
        assert_eq!(expr.next_after(at(10, 1, 0)), Some(at(10, 15, 0)));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            CompiledExpression::compile(&RecurrenceExpression::cron("not a cron"), "UTC", at(0, 0, 0)),
            Err(SchedulerError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CompiledExpression::compile(&RecurrenceExpression::cron("0 * * * * *"), "Mars/Olympus", at(0, 0, 0)),
            Err(SchedulerError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_cron_with_past_year_has_ended() {
        let expr = CompiledExpression::compile(
            &RecurrenceExpression::cron("0 0 0 1 1 * 2020"),
            "UTC",
            at(0, 0, 0),
        )
        .unwrap();
        assert_eq!(expr.next_after(at(0, 0, 0)), None);
    }
}
