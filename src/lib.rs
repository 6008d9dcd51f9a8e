//! fleet-scheduler 进程组装：后端选择、内置处理器与信号处理

pub mod app;
pub mod handlers;
pub mod shutdown;

pub use app::Application;
pub use handlers::builtin_handlers;
pub use shutdown::wait_for_shutdown_signal;
