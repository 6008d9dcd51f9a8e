use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ObservabilityConfig;

/// 依赖库的日志默认压到 warn
const QUIET_DEPENDENCIES: [&str; 3] = ["sqlx=warn", "redis=warn", "hyper=warn"];

fn build_filter(log_level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let mut filter = EnvFilter::try_new(log_level.to_lowercase())
        .with_context(|| format!("无效的日志级别: {log_level}"))?;
    for directive in QUIET_DEPENDENCIES {
        filter = filter.add_directive(directive.parse().context("解析日志过滤指令失败")?);
    }
    Ok(filter)
}

/// 初始化全局日志
///
/// `RUST_LOG` 存在时优先于配置的级别。
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let registry = tracing_subscriber::registry().with(build_filter(&config.log_level)?);

    match config.log_format.as_str() {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true).with_target(true))
            .try_init()
            .context("初始化JSON日志失败"),
        "pretty" => registry
            .with(fmt::layer().pretty().with_thread_names(true))
            .try_init()
            .context("初始化Pretty日志失败"),
        other => Err(anyhow::anyhow!("不支持的日志格式: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_format_is_rejected() {
        let config = ObservabilityConfig {
            log_format: "xml".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn test_filter_accepts_configured_levels() {
        for level in ["trace", "DEBUG", "info", "warn", "error"] {
            assert!(build_filter(level).is_ok(), "{level}");
        }
    }
}
