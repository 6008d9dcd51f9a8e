use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info, warn};

use fleet_scheduler::{builtin_handlers, wait_for_shutdown_signal, Application};
use scheduler_core::{init_logging, AppConfig};
use scheduler_dispatcher::StopKind;

fn cli() -> Command {
    Command::new("fleet-scheduler")
        .version(env!("CARGO_PKG_VERSION"))
        .about("分布式作业调度与执行协调器")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("配置文件路径（缺省时按默认路径查找）"),
        )
        .arg(
            Arg::new("cluster")
                .long("cluster")
                .value_name("ID")
                .global(true)
                .help("集群ID，覆盖配置中的 cluster.id"),
        )
        .arg(
            Arg::new("worker-id")
                .long("worker-id")
                .value_name("ID")
                .global(true)
                .help("Worker ID，缺省为主机名加随机后缀"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("日志级别")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .global(true)
                .help("日志格式")
                .value_parser(["json", "pretty"]),
        )
        .subcommand(
            Command::new("request-stop")
                .about("请求指定Worker停止")
                .arg(
                    Arg::new("kind")
                        .long("kind")
                        .value_name("KIND")
                        .help("停止方式")
                        .value_parser(["friendly", "immediate"])
                        .default_value("friendly"),
                )
                .arg(
                    Arg::new("lease-seconds")
                        .long("lease-seconds")
                        .value_name("SECONDS")
                        .help("停止锁租期")
                        .value_parser(value_parser!(u64))
                        .default_value("3600"),
                ),
        )
}

/// 命令行参数覆盖配置文件与环境变量
fn apply_overrides(config: &mut AppConfig, matches: &ArgMatches) -> Result<()> {
    if let Some(cluster) = matches.get_one::<String>("cluster") {
        config.cluster.id = cluster.clone();
    }
    if let Some(id) = matches.get_one::<String>("worker-id") {
        config.worker.id = Some(id.clone());
    }
    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.clone();
    }
    config.validate()
}

fn install_metrics_exporter(config: &AppConfig) -> Result<()> {
    if let Some(bind) = &config.observability.metrics_bind {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("无效的指标监听地址: {bind}"))?;
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("安装Prometheus指标导出器失败")?;
        info!("Prometheus指标监听于 {}", addr);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let mut config = AppConfig::load(config_path).with_context(|| match config_path {
        Some(path) => format!("加载配置文件失败: {path}"),
        None => "加载配置失败".to_string(),
    })?;
    apply_overrides(&mut config, &matches)?;

    init_logging(&config.observability)?;
    info!("启动 fleet-scheduler (集群 {})", config.cluster.id);
    install_metrics_exporter(&config)?;

    let app = Application::build(config.clone(), builtin_handlers()?).await?;

    if let Some(sub) = matches.subcommand_matches("request-stop") {
        let worker_id = config
            .worker
            .id
            .as_deref()
            .context("request-stop 需要 --worker-id")?;
        let kind = match sub.get_one::<String>("kind").map(String::as_str) {
            Some("immediate") => StopKind::Immediate,
            _ => StopKind::Friendly,
        };
        let lease = Duration::from_secs(sub.get_one::<u64>("lease-seconds").copied().unwrap_or(3600));
        if app.request_stop(worker_id, kind, lease).await? {
            info!("已向Worker {} 发出{}请求", worker_id, kind);
        } else {
            warn!("Worker {} 已有未过期的{}请求", worker_id, kind);
        }
        return Ok(());
    }

    if let Err(e) = app.run(wait_for_shutdown_signal()).await {
        error!("Worker节点运行失败: {e:#}");
        return Err(e);
    }

    info!("fleet-scheduler 已退出");
    Ok(())
}
