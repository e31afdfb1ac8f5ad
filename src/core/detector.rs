//! 探测器接口模块
//!
//! 深度包检测本身由外部探测器完成，引擎只负责为每条流分配、释放探测状态，
//! 并在合适的时机调用探测器。本模块定义探测器trait和它读写的流状态。

use crate::core::endpoint::EndpointContext;
use crate::core::protocol::{ProtocolBitmask, ProtocolPair};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 报文方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    /// 与连接发起方向一致
    #[default]
    Original,
    /// 应答方向
    Reply,
}

impl Direction {
    /// 是否为应答方向
    pub fn is_reply(self) -> bool {
        self == Self::Reply
    }
}

/// 探测器的每流状态
///
/// 由流水线按需分配，在流完成分类或拆除时释放。探测器只读写其中的字段。
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    /// 已处理的报文数（调用探测器前由流水线递增）
    pub packet_counter: u32,
    /// 当前报文方向
    pub packet_direction: Direction,
    /// 探测器解析出的服务器主机名（HTTP Host / TLS SNI）
    pub host_server_name: Option<String>,
    /// 探测器解析出的服务器证书名
    pub server_certificate: Option<String>,
    /// 结果不可缓存，后续报文仍需探测
    pub no_cache: bool,
    /// 探测器认为已无需更多报文
    pub detection_complete: bool,
    /// 探测器内部解析过的行数
    pub parsed_lines: u32,
}

impl FlowState {
    /// 创建新的流状态
    pub fn new() -> Self {
        Self::default()
    }
}

/// 协议探测器trait
///
/// 输入为报文负载和按方向排列的两个端点上下文，返回协议对。
/// 实现必须是线程安全的；同一条流的调用由流水线串行化。
pub trait ProtocolDetector: Send + Sync + fmt::Debug {
    /// 对一个报文进行分类
    fn classify(
        &self,
        state: &mut FlowState,
        payload: &[u8],
        timestamp: u64,
        src: &EndpointContext,
        dst: &EndpointContext,
    ) -> ProtocolPair;

    /// 设置参与探测的协议集合
    fn set_enabled_protocols(&self, _enabled: &ProtocolBitmask) {}

    /// 获取探测器名称
    fn name(&self) -> &str;
}

/// 永远返回未知协议的探测器
///
/// 用于只依赖端口范围和主机规则的部署。
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDetector;

impl ProtocolDetector for NullDetector {
    fn classify(
        &self,
        _state: &mut FlowState,
        _payload: &[u8],
        _timestamp: u64,
        _src: &EndpointContext,
        _dst: &EndpointContext,
    ) -> ProtocolPair {
        ProtocolPair::UNKNOWN
    }

    fn name(&self) -> &str {
        "null"
    }
}
