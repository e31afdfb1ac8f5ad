//! # PSI-Flow: 可在线更新的逐流协议分类引擎
//!
//! 在外部深度包检测器之上维护每条连接的分类记录，并提供多级兜底：
//! 主机名/证书规则、按地址前缀的端口范围表、通用端口启发式。
//! 规则表、端口范围和主机名规则都可以通过管理会话在线更新，
//! 更新是全有或全无的，查找路径不会看到半成品。
//!
//! ## 特性
//!
//! - **报文令牌**: 同一报文重复查询直接命中
//! - **共享端点**: 按地址引用计数的端点上下文
//! - **双缓冲自动机**: 主机名规则替换期间查找无锁
//! - **增量回收**: 临时子流哈希表按时间片回收
//!
//! ## 快速开始
//!
//! ```rust
//! use psi_flow::{EngineBuilder, FlowClassification, L4Proto, PacketInfo, PerPacketToken};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = EngineBuilder::new()
//!     .add_port_ranges("0.0.0.0/0 udp:443:tls")
//!     .build()?;
//!
//! let flow = FlowClassification::new(L4Proto::Udp);
//! let client = ("10.0.0.2".parse()?, 50000);
//! let server = ("10.0.0.1".parse()?, 443);
//! let packet = PacketInfo::new(client, server, L4Proto::Udp, b"\x00\x01");
//!
//! let outcome = engine.classify(&flow, &packet, &mut PerPacketToken::new());
//! assert_eq!(engine.rules().protocol_name(outcome.pair.app), "tls");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_inception)]

// 核心模块
pub mod core;
pub mod error;

// 工具模块
pub mod utils;

// 配置与构造器
pub mod builder;
pub mod config;

// 功能模块
pub mod admin;
pub mod engine;
pub mod gc;
pub mod host;
pub mod pipeline;
pub mod portrange;
pub mod probe;
pub mod rules;
pub mod verdict;

// 重新导出核心类型
pub use crate::core::{
    detector::{Direction, FlowState, NullDetector, ProtocolDetector},
    endpoint::{EndpointAddr, EndpointCache, EndpointContext},
    magic::SignatureDetector,
    protocol::{ids, L4Proto, ProtocolBitmask, ProtocolId, ProtocolPair, ProtocolRegistry},
};

pub use crate::admin::{AdminChannel, AdminSession};
pub use crate::builder::EngineBuilder;
pub use crate::config::EngineConfig;
pub use crate::engine::{ClassificationEngine, EngineStats, EngineStatsSnapshot, HostProtocols};
pub use crate::error::{ClassifierError, Result};
pub use crate::gc::{EphemeralSummary, EphemeralTable, GcTimer};
pub use crate::host::{HostAutomaton, HostTable};
pub use crate::pipeline::{
    Classification, FlowClassification, FlowId, PacketInfo, Payload, PerPacketToken, ResultSource,
};
pub use crate::portrange::{PortRange, PortRangeClassifier, Prefix, RangeOp};
pub use crate::probe::{CanonicalTuple, FallbackProbe, PortHeuristic, ProbeAggregator};
pub use crate::rules::{MarkMode, RuleTable};
pub use crate::verdict::{HostScope, MatchField, ProtocolMatch};

/// 库版本信息
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 库名称
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// 库描述
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
