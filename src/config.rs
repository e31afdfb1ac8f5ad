//! 引擎配置模块
//!
//! 所有字段都有默认值，可以从JSON加载，缺失的字段使用默认值。

use crate::core::protocol::L4Proto;
use crate::error::{ClassifierError, Result};
use crate::gc::MAX_HASH_KB;
use crate::utils::logger::LogLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 引擎配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// TCP流未识别时最多处理的报文数
    pub max_unknown_tcp: u32,
    /// UDP流未识别时最多处理的报文数
    pub max_unknown_udp: u32,
    /// 其他流未识别时最多处理的报文数
    pub max_unknown_other: u32,
    /// 端口范围猜测只在前N个报文上尝试
    pub guess_packet_limit: u32,
    /// 非连续负载超过该长度时跳过
    pub mtu: usize,
    /// 端点上下文数量上限，0表示不限
    pub max_endpoints: usize,
    /// 同时存在的探测器流状态上限，0表示不限
    pub max_flow_states: usize,
    /// 临时子流哈希表大小（K），0表示禁用
    pub ephemeral_hash_kb: usize,
    /// 临时子流超时（秒）
    pub ephemeral_timeout_secs: u64,
    /// 回收定时器间隔（毫秒）
    pub gc_tick_ms: u64,
    /// 完整扫描一遍需要的周期数
    pub gc_slices: usize,
    /// 日志级别
    pub log_level: LogLevel,
    /// 实例ID
    pub instance_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_unknown_tcp: 20,
            max_unknown_udp: 20,
            max_unknown_other: 20,
            guess_packet_limit: 3,
            mtu: 48000,
            max_endpoints: 0,     // 不限
            max_flow_states: 0,   // 不限
            ephemeral_hash_kb: 0, // 默认不启用
            ephemeral_timeout_secs: 1200,
            gc_tick_ms: 500,
            gc_slices: 128, // 500ms * 128 ≈ 64秒扫完一遍
            log_level: LogLevel::Info,
            instance_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl EngineConfig {
    /// 从JSON文本加载
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// 序列化为JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.mtu == 0 {
            return Err(ClassifierError::config_error("mtu must be greater than 0"));
        }
        if self.gc_tick_ms == 0 {
            return Err(ClassifierError::config_error("gc_tick_ms must be greater than 0"));
        }
        if self.gc_slices == 0 {
            return Err(ClassifierError::config_error("gc_slices must be greater than 0"));
        }
        if self.ephemeral_hash_kb > MAX_HASH_KB {
            return Err(ClassifierError::config_error(format!(
                "ephemeral_hash_kb must be at most {}",
                MAX_HASH_KB
            )));
        }
        if self.ephemeral_hash_kb > 0 && self.ephemeral_timeout_secs == 0 {
            return Err(ClassifierError::config_error(
                "ephemeral_timeout_secs must be greater than 0",
            ));
        }
        if self.instance_id.is_empty() {
            return Err(ClassifierError::config_error("instance_id must not be empty"));
        }
        Ok(())
    }

    /// 按传输层协议取未知阈值
    pub fn max_unknown(&self, l4: L4Proto) -> u32 {
        match l4 {
            L4Proto::Tcp => self.max_unknown_tcp,
            L4Proto::Udp => self.max_unknown_udp,
            _ => self.max_unknown_other,
        }
    }

    /// 回收定时器间隔
    pub fn gc_tick(&self) -> Duration {
        Duration::from_millis(self.gc_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json(r#"{"max_unknown_udp": 8, "log_level": "debug"}"#).unwrap();
        assert_eq!(config.max_unknown_udp, 8);
        assert_eq!(config.max_unknown_tcp, 20);
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(!config.instance_id.is_empty());
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = EngineConfig::from_json(r#"{"gc_slices": 0}"#).unwrap_err();
        assert!(err.is_config_error());
        assert!(EngineConfig::from_json(r#"{"ephemeral_hash_kb": 4096}"#).is_err());
        assert!(EngineConfig::from_json("not json").is_err());
    }
}
