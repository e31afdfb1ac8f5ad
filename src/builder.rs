//! 引擎构造器模块
//!
//! 提供流畅的链式API来构建和配置分类引擎。

use crate::config::EngineConfig;
use crate::core::detector::ProtocolDetector;
use crate::core::magic::SignatureDetector;
use crate::engine::ClassificationEngine;
use crate::error::{ClassifierError, Result};
use crate::host::HostTable;
use crate::probe::{FallbackProbe, ProbeAggregator};
use crate::utils::logger::LogLevel;
use crate::{flow_info, flow_warn};
use std::sync::Arc;
use std::time::Duration;

/// 引擎构造器
///
/// # 示例
///
/// ```rust
/// use psi_flow::EngineBuilder;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = EngineBuilder::new()
///     .with_max_unknown_udp(10)
///     .add_port_ranges("10.0.0.0/8 udp:53:dns tcp:80-81:http")
///     .add_host_rule("tls", "example.org")
///     .build()?;
/// assert_eq!(engine.port_ranges().len(), 1);
/// # Ok(())
/// # }
/// ```
pub struct EngineBuilder {
    config: EngineConfig,
    detector: Option<Arc<dyn ProtocolDetector>>,
    port_range_lines: Vec<String>,
    host_rules: Vec<(String, String)>,
    custom_protocols: Vec<String>,
    custom_probes: Vec<Box<dyn FallbackProbe>>,
    default_probes: bool,
    gc_thread: bool,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    /// 创建新的构造器
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            detector: None,
            port_range_lines: Vec::new(),
            host_rules: Vec::new(),
            custom_protocols: Vec::new(),
            custom_probes: Vec::new(),
            default_probes: true,
            gc_thread: true,
        }
    }

    /// 使用现成的配置
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// 设置探测器
    pub fn with_detector(mut self, detector: Arc<dyn ProtocolDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// 设置TCP未识别阈值
    pub fn with_max_unknown_tcp(mut self, packets: u32) -> Self {
        self.config.max_unknown_tcp = packets;
        self
    }

    /// 设置UDP未识别阈值
    pub fn with_max_unknown_udp(mut self, packets: u32) -> Self {
        self.config.max_unknown_udp = packets;
        self
    }

    /// 设置其他传输层协议的未识别阈值
    pub fn with_max_unknown_other(mut self, packets: u32) -> Self {
        self.config.max_unknown_other = packets;
        self
    }

    /// 设置MTU
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.config.mtu = mtu;
        self
    }

    /// 设置端点上下文上限
    pub fn with_max_endpoints(mut self, max: usize) -> Self {
        self.config.max_endpoints = max;
        self
    }

    /// 设置探测器流状态上限
    pub fn with_max_flow_states(mut self, max: usize) -> Self {
        self.config.max_flow_states = max;
        self
    }

    /// 启用临时子流哈希表
    pub fn with_ephemeral_hash(mut self, size_kb: usize, timeout: Duration) -> Self {
        self.config.ephemeral_hash_kb = size_kb;
        self.config.ephemeral_timeout_secs = timeout.as_secs();
        self
    }

    /// 设置回收定时器间隔
    pub fn with_gc_tick(mut self, tick: Duration) -> Self {
        self.config.gc_tick_ms = tick.as_millis() as u64;
        self
    }

    /// 不启动回收线程（由调用方驱动回收）
    pub fn without_gc_thread(mut self) -> Self {
        self.gc_thread = false;
        self
    }

    /// 设置日志级别
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.config.log_level = level;
        self
    }

    /// 设置实例ID
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.config.instance_id = instance_id.into();
        self
    }

    /// 追加一行端口范围命令
    pub fn add_port_ranges(mut self, line: impl Into<String>) -> Self {
        self.port_range_lines.push(line.into());
        self
    }

    /// 追加一条初始主机名规则
    pub fn add_host_rule(mut self, protocol: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.host_rules.push((protocol.into(), pattern.into()));
        self
    }

    /// 定义自定义协议
    pub fn add_custom_protocol(mut self, name: impl Into<String>) -> Self {
        self.custom_protocols.push(name.into());
        self
    }

    /// 追加兜底探测
    pub fn add_fallback_probe(mut self, probe: Box<dyn FallbackProbe>) -> Self {
        self.custom_probes.push(probe);
        self
    }

    /// 不使用内置的端口启发式
    pub fn disable_default_probes(mut self) -> Self {
        self.default_probes = false;
        self
    }

    /// 高性能配置
    ///
    /// 较小的未识别阈值，尽早释放探测器状态。
    pub fn high_performance(mut self) -> Self {
        self.config.max_unknown_tcp = 8;
        self.config.max_unknown_udp = 4;
        self.config.max_unknown_other = 2;
        self.config.guess_packet_limit = 1;
        self
    }

    /// 保守配置
    ///
    /// 更多报文参与探测，限制资源占用。
    pub fn conservative(mut self) -> Self {
        self.config.max_unknown_tcp = 40;
        self.config.max_unknown_udp = 40;
        self.config.max_unknown_other = 20;
        self.config.max_endpoints = 65536;
        self.config.max_flow_states = 65536;
        self
    }

    /// 构建引擎
    pub fn build(self) -> Result<ClassificationEngine> {
        self.config.validate()?;

        let detector = self
            .detector
            .unwrap_or_else(|| Arc::new(SignatureDetector::new()));

        let mut fallback = if self.default_probes {
            ProbeAggregator::with_defaults()
        } else {
            ProbeAggregator::new()
        };
        for probe in self.custom_probes {
            fallback.add_probe(probe);
        }

        let engine = ClassificationEngine::with_parts(self.config, detector, fallback, self.gc_thread)?;

        for name in &self.custom_protocols {
            engine.rules().add_custom(name)?;
        }

        if !self.port_range_lines.is_empty() {
            let mut session = engine.port_ranges().open_session(engine.rules().registry())?;
            for line in &self.port_range_lines {
                session.apply_line(line)?;
            }
            session.commit()?;
        }

        if !self.host_rules.is_empty() {
            let registry = engine.rules().registry();
            let mut table = HostTable::new();
            for (protocol, pattern) in &self.host_rules {
                let id = registry
                    .lookup(protocol)
                    .ok_or_else(|| ClassifierError::unknown_protocol(protocol.as_str()))?;
                if !table.add(pattern, id)? {
                    flow_warn!("duplicate host rule {}:{}", protocol, pattern);
                }
            }
            let version = engine.hosts().install(table)?;
            flow_info!("initial host rules installed as generation {}", version);
        }

        Ok(engine)
    }
}
