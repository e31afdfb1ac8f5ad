//! 日志模块
//!
//! 封装rat_logger日志库，提供统一的日志接口和配置。

use crate::error::{ClassifierError, Result};
use once_cell::sync::OnceCell;
use rat_logger::handler::term::TermConfig;
use rat_logger::{FileConfig, FormatConfig, LevelFilter, LoggerBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::PoisonError;

/// 日志配置
#[derive(Debug, Clone)]
pub struct LoggerConfig {
    /// 是否启用日志
    pub enabled: bool,
    /// 日志级别
    pub level: LogLevel,
    /// 是否显示时间戳
    pub show_timestamp: bool,
    /// 是否显示模块路径
    pub show_module: bool,
    /// 输出目标
    pub target: LogTarget,
}

/// 日志级别
///
/// 顺序由严重到详细，`Trace`最详细。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// 错误
    Error,
    /// 警告
    Warn,
    /// 信息
    Info,
    /// 调试
    Debug,
    /// 跟踪
    Trace,
}

/// 日志输出目标
#[derive(Debug, Clone)]
pub enum LogTarget {
    /// 标准输出
    Stdout,
    /// 标准错误
    ///
    /// rat_logger的终端处理器只写终端，此目标按无颜色终端输出处理。
    Stderr,
    /// 文件，参数为日志目录
    File(String),
    /// 无输出（禁用）
    None,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: LogLevel::Info,
            show_timestamp: true,
            show_module: true,
            target: LogTarget::Stdout,
        }
    }
}

/// 日志器
#[derive(Debug)]
pub struct Logger {
    config: LoggerConfig,
}

impl Logger {
    /// 创建新的日志器
    pub fn new(config: LoggerConfig) -> Self {
        Self { config }
    }

    /// 获取配置
    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    /// 检查是否启用了指定级别的日志
    pub fn is_enabled(&self, level: &LogLevel) -> bool {
        self.config.enabled
            && !matches!(self.config.target, LogTarget::None)
            && level <= &self.config.level
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LoggerConfig::default())
    }
}

/// 全局日志器实例
static GLOBAL_LOGGER: OnceCell<Logger> = OnceCell::new();

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

fn format_config(config: &LoggerConfig) -> FormatConfig {
    let template = match (config.show_timestamp, config.show_module) {
        (true, true) => "{timestamp} [{level}] {target}:{line} - {message}",
        (true, false) => "{timestamp} [{level}] {message}",
        (false, true) => "[{level}] {target}:{line} - {message}",
        (false, false) => "[{level}] {message}",
    };
    FormatConfig {
        format_template: template.to_string(),
        ..FormatConfig::default()
    }
}

/// rat_logger后端是否已安装
pub fn backend_installed() -> bool {
    rat_logger::core::LOGGER
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
}

fn install_backend(config: &LoggerConfig) -> Result<()> {
    if !config.enabled || backend_installed() {
        return Ok(());
    }
    let format = format_config(config);
    let builder = LoggerBuilder::new().with_level(config.level.into());
    let builder = match &config.target {
        LogTarget::None => return Ok(()),
        LogTarget::Stdout => builder.add_terminal_with_config(TermConfig {
            enable_color: true,
            format: Some(format),
            color: None,
        }),
        LogTarget::Stderr => builder.add_terminal_with_config(TermConfig {
            enable_color: false,
            format: Some(format),
            color: None,
        }),
        LogTarget::File(dir) => builder.add_file(FileConfig {
            log_dir: PathBuf::from(dir),
            format: Some(format),
            ..FileConfig::default()
        }),
    };
    builder
        .init_global_logger()
        .map_err(|e| ClassifierError::internal_error(format!("logger backend: {}", e)))
}

/// 初始化全局日志器
///
/// 按配置安装rat_logger后端（终端或文件）。只有第一次调用生效，
/// 返回值表示本次调用是否完成了初始化。
pub fn init_logger(config: LoggerConfig) -> Result<bool> {
    let mut initialized = false;
    GLOBAL_LOGGER.get_or_try_init(|| {
        install_backend(&config)?;
        initialized = true;
        Ok::<_, ClassifierError>(Logger::new(config))
    })?;
    Ok(initialized)
}

/// 获取全局日志器
pub fn get_logger() -> Option<&'static Logger> {
    GLOBAL_LOGGER.get()
}

/// 错误日志
#[macro_export]
macro_rules! flow_error {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::utils::logger::get_logger() {
            if logger.is_enabled(&$crate::utils::logger::LogLevel::Error) {
                rat_logger::error!($($arg)*);
            }
        }
    };
}

/// 警告日志
#[macro_export]
macro_rules! flow_warn {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::utils::logger::get_logger() {
            if logger.is_enabled(&$crate::utils::logger::LogLevel::Warn) {
                rat_logger::warn!($($arg)*);
            }
        }
    };
}

/// 信息日志
#[macro_export]
macro_rules! flow_info {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::utils::logger::get_logger() {
            if logger.is_enabled(&$crate::utils::logger::LogLevel::Info) {
                rat_logger::info!($($arg)*);
            }
        }
    };
}

/// 调试日志
#[macro_export]
macro_rules! flow_debug {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::utils::logger::get_logger() {
            if logger.is_enabled(&$crate::utils::logger::LogLevel::Debug) {
                rat_logger::debug!($($arg)*);
            }
        }
    };
}

/// 跟踪日志
#[macro_export]
macro_rules! flow_trace {
    ($($arg:tt)*) => {
        if let Some(logger) = $crate::utils::logger::get_logger() {
            if logger.is_enabled(&$crate::utils::logger::LogLevel::Trace) {
                rat_logger::trace!($($arg)*);
            }
        }
    };
}

/// 构建器模式的日志配置
#[derive(Debug)]
pub struct LoggerConfigBuilder {
    config: LoggerConfig,
}

impl LoggerConfigBuilder {
    /// 创建新的配置构建器
    pub fn new() -> Self {
        Self {
            config: LoggerConfig::default(),
        }
    }

    /// 设置是否启用日志
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// 设置日志级别
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    /// 设置是否显示时间戳
    pub fn show_timestamp(mut self, show: bool) -> Self {
        self.config.show_timestamp = show;
        self
    }

    /// 设置是否显示模块路径
    pub fn show_module(mut self, show: bool) -> Self {
        self.config.show_module = show;
        self
    }

    /// 设置输出目标
    pub fn target(mut self, target: LogTarget) -> Self {
        self.config.target = target;
        self
    }

    /// 构建配置
    pub fn build(self) -> LoggerConfig {
        self.config
    }

    /// 构建并初始化全局日志器
    pub fn init(self) -> Result<bool> {
        init_logger(self.config)
    }
}

impl Default for LoggerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 创建禁用日志的配置
pub fn disabled_config() -> LoggerConfig {
    LoggerConfig {
        enabled: false,
        ..Default::default()
    }
}

/// 创建开发环境的日志配置
pub fn dev_config() -> LoggerConfig {
    LoggerConfigBuilder::new()
        .level(LogLevel::Debug)
        .show_timestamp(true)
        .show_module(true)
        .target(LogTarget::Stdout)
        .build()
}

/// 创建生产环境的日志配置
pub fn prod_config() -> LoggerConfig {
    LoggerConfigBuilder::new()
        .level(LogLevel::Warn)
        .show_timestamp(true)
        .show_module(false)
        .target(LogTarget::Stderr)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_gate() {
        let logger = Logger::new(LoggerConfigBuilder::new().level(LogLevel::Info).build());
        assert!(logger.is_enabled(&LogLevel::Error));
        assert!(logger.is_enabled(&LogLevel::Info));
        assert!(!logger.is_enabled(&LogLevel::Debug));

        let silent = Logger::new(disabled_config());
        assert!(!silent.is_enabled(&LogLevel::Error));
    }

    #[test]
    fn test_format_template_follows_flags() {
        let bare = LoggerConfigBuilder::new()
            .show_timestamp(false)
            .show_module(false)
            .build();
        assert_eq!(format_config(&bare).format_template, "[{level}] {message}");

        let full = format_config(&LoggerConfig::default()).format_template;
        assert!(full.starts_with("{timestamp}"));
        assert!(full.contains("{target}"));
        assert_eq!(LevelFilter::from(LogLevel::Trace), LevelFilter::Trace);
    }
}
