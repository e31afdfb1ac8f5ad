//! 错误处理模块
//!
//! 定义流分类引擎中使用的所有错误类型。
//!
//! 报文级错误（例如分配失败）只影响当前报文，调用方将其降级为"未知协议"；
//! 管理会话级错误会导致整个暂存状态被丢弃，在线表保持不变。

use thiserror::Error;

/// 分类引擎的结果类型
pub type Result<T> = std::result::Result<T, ClassifierError>;

/// 分类引擎错误类型
#[derive(Error, Debug)]
pub enum ClassifierError {
    /// 资源分配失败（端点上下文、流状态等）
    #[error("Allocation failure: {resource}")]
    AllocationFailure {
        /// 分配失败的资源
        resource: String,
    },

    /// 管理命令语法错误
    #[error("Syntax error at line {line}: {message}")]
    ConfigSyntax {
        /// 出错的命令行号（从1开始，0表示未知）
        line: usize,
        /// 错误消息
        message: String,
    },

    /// 一致性冲突（例如在激活后禁用协议）
    #[error("Consistency conflict: {message}")]
    ConsistencyConflict {
        /// 错误消息
        message: String,
    },

    /// 结构不变量被破坏（例如冲突的主机模式）
    #[error("Structural violation: {message}")]
    StructuralViolation {
        /// 错误消息
        message: String,
    },

    /// 已有会话处于打开状态
    #[error("Session busy: {channel}")]
    SessionBusy {
        /// 管理通道名称
        channel: String,
    },

    /// 会话已关闭或只读
    #[error("Session closed: {channel}")]
    SessionClosed {
        /// 管理通道名称
        channel: String,
    },

    /// 未知协议
    #[error("Unknown protocol: {protocol}")]
    UnknownProtocol {
        /// 协议名称或编号
        protocol: String,
    },

    /// 配置错误
    #[error("Configuration error: {message}")]
    ConfigError {
        /// 错误消息
        message: String,
    },

    /// I/O错误
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// 内部错误
    #[error("Internal error: {message}")]
    InternalError {
        /// 错误消息
        message: String,
    },
}

impl ClassifierError {
    /// 创建分配失败错误
    pub fn allocation_failure<S: Into<String>>(resource: S) -> Self {
        Self::AllocationFailure {
            resource: resource.into(),
        }
    }

    /// 创建语法错误
    pub fn syntax<S: Into<String>>(line: usize, message: S) -> Self {
        Self::ConfigSyntax {
            line,
            message: message.into(),
        }
    }

    /// 创建一致性冲突错误
    pub fn consistency_conflict<S: Into<String>>(message: S) -> Self {
        Self::ConsistencyConflict {
            message: message.into(),
        }
    }

    /// 创建结构不变量错误
    pub fn structural_violation<S: Into<String>>(message: S) -> Self {
        Self::StructuralViolation {
            message: message.into(),
        }
    }

    /// 创建会话忙错误
    pub fn session_busy<S: Into<String>>(channel: S) -> Self {
        Self::SessionBusy {
            channel: channel.into(),
        }
    }

    /// 创建会话关闭错误
    pub fn session_closed<S: Into<String>>(channel: S) -> Self {
        Self::SessionClosed {
            channel: channel.into(),
        }
    }

    /// 创建未知协议错误
    pub fn unknown_protocol<S: Into<String>>(protocol: S) -> Self {
        Self::UnknownProtocol {
            protocol: protocol.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error<S: Into<String>>(message: S) -> Self {
        Self::ConfigError {
            message: message.into(),
        }
    }

    /// 创建内部错误
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// 为语法错误补充行号，其他错误原样返回
    pub fn at_line(self, line: usize) -> Self {
        match self {
            Self::ConfigSyntax { line: 0, message } => Self::ConfigSyntax { line, message },
            other => other,
        }
    }

    /// 检查是否为可恢复错误
    ///
    /// 可恢复错误只影响当前报文或当前命令。
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::AllocationFailure { .. } | Self::SessionBusy { .. }
        )
    }

    /// 检查是否为配置相关错误
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::ConfigSyntax { .. }
                | Self::ConfigError { .. }
                | Self::UnknownProtocol { .. }
                | Self::ConsistencyConflict { .. }
                | Self::StructuralViolation { .. }
        )
    }

    /// 获取错误代码
    pub fn error_code(&self) -> u32 {
        match self {
            Self::AllocationFailure { .. } => 1001,
            Self::ConfigSyntax { .. } => 1002,
            Self::ConsistencyConflict { .. } => 1003,
            Self::StructuralViolation { .. } => 1004,
            Self::SessionBusy { .. } => 1005,
            Self::SessionClosed { .. } => 1006,
            Self::UnknownProtocol { .. } => 1007,
            Self::ConfigError { .. } => 1008,
            Self::IoError(_) => 1009,
            Self::InternalError { .. } => 1999,
        }
    }
}

/// 从anyhow::Error转换
impl From<anyhow::Error> for ClassifierError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal_error(err.to_string())
    }
}

/// 从serde_json::Error转换
impl From<serde_json::Error> for ClassifierError {
    fn from(err: serde_json::Error) -> Self {
        Self::config_error(format!("JSON error: {}", err))
    }
}
