use tracing::{info, warn};

use scheduler_dispatcher::StopKind;

/// 等待进程信号
///
/// SIGTERM 触发友好停止（先排空 Bucket），Ctrl+C 立即停止。
pub async fn wait_for_shutdown_signal() -> StopKind {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("安装Ctrl+C信号处理器失败: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("安装SIGTERM信号处理器失败: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到Ctrl+C信号");
            StopKind::Immediate
        }
        _ = terminate => {
            info!("收到SIGTERM信号");
            StopKind::Friendly
        }
    }
}
