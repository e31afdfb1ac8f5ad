//! 工具模块

pub mod logger;

pub use logger::{init_logger, LogLevel, LoggerConfig, LoggerConfigBuilder};

/// 当前UTC时间（秒）
pub fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// 当前UTC时间（毫秒），用作探测器时间戳
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
