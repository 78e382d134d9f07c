//! 日志初始化
//!
//! 库本身只通过 `tracing` 宏输出事件，由可执行程序决定是否安装订阅者。
//!
//! ```no_run
//! spindle::logger::init();
//! tracing::info!("fiber runtime ready");
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// 每次切换都输出
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

/// 以 INFO 级别初始化
pub fn init() {
    init_with_level(LogLevel::Info);
}

/// 以指定级别初始化；已经安装过订阅者时保持原样
pub fn init_with_level(level: LogLevel) {
    let filter = tracing_subscriber::filter::LevelFilter::from_level(level.into());

    // 显示线程名，便于区分各线程上的纤程
    let layer = tracing_subscriber::fmt::layer()
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(false)
        .compact()
        .with_filter(filter);

    let _ = Registry::default().with(layer).try_init();
}
