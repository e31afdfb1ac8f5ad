//! 兜底探测模块
//!
//! 探测器和端口范围都没有结果时，流水线按顺序执行这里的兜底探测。
//! 兜底探测只能看到规范化后的五元组，拿不到负载。

pub mod heuristic;

pub use heuristic::PortHeuristic;

use crate::core::endpoint::EndpointAddr;
use crate::core::protocol::{L4Proto, ProtocolPair};
use std::fmt;
use std::net::IpAddr;

/// 规范化五元组
///
/// 地址和端口分别独立排序，较小者为 `low`，因此结果与报文方向无关。
/// 非TCP/UDP流的端口为0。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalTuple {
    /// 传输层协议
    pub l4: L4Proto,
    /// 较小的地址
    pub low_ip: IpAddr,
    /// 较小的端口
    pub low_port: u16,
    /// 较大的地址
    pub high_ip: IpAddr,
    /// 较大的端口
    pub high_port: u16,
}

impl CanonicalTuple {
    /// 由任意方向的两端构造
    pub fn new(l4: L4Proto, a_ip: IpAddr, a_port: u16, b_ip: IpAddr, b_port: u16) -> Self {
        let (a_port, b_port) = match l4 {
            L4Proto::Tcp | L4Proto::Udp => (a_port, b_port),
            _ => (0, 0),
        };
        let (low_ip, high_ip) = if EndpointAddr::from(a_ip) <= EndpointAddr::from(b_ip) {
            (a_ip, b_ip)
        } else {
            (b_ip, a_ip)
        };
        Self {
            l4,
            low_ip,
            low_port: a_port.min(b_port),
            high_ip,
            high_port: a_port.max(b_port),
        }
    }
}

/// 兜底探测trait
pub trait FallbackProbe: Send + Sync + fmt::Debug {
    /// 猜测协议，无法判断时返回未知
    fn guess(&self, tuple: &CanonicalTuple) -> ProtocolPair;

    /// 探测类型
    fn probe_type(&self) -> ProbeType;
}

/// 探测类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeType {
    /// 按端口猜测
    Port,
    /// 按传输层协议猜测
    Transport,
    /// 调用方提供
    Custom,
}

/// 兜底探测链
#[derive(Debug, Default)]
pub struct ProbeAggregator {
    probes: Vec<Box<dyn FallbackProbe>>,
}

impl ProbeAggregator {
    /// 创建空的探测链
    pub fn new() -> Self {
        Self { probes: Vec::new() }
    }

    /// 带默认端口启发式的探测链
    pub fn with_defaults() -> Self {
        let mut chain = Self::new();
        chain.add_probe(Box::new(PortHeuristic::new()));
        chain
    }

    /// 追加探测
    pub fn add_probe(&mut self, probe: Box<dyn FallbackProbe>) {
        self.probes.push(probe);
    }

    /// 探测数量
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// 按顺序执行，返回第一个非未知结果
    pub fn guess(&self, tuple: &CanonicalTuple) -> ProtocolPair {
        self.probes
            .iter()
            .map(|probe| probe.guess(tuple))
            .find(|pair| !pair.is_unknown())
            .unwrap_or(ProtocolPair::UNKNOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_order_is_independent() {
        let a: IpAddr = "10.0.0.9".parse().unwrap();
        let b: IpAddr = "10.0.0.1".parse().unwrap();
        let forward = CanonicalTuple::new(L4Proto::Tcp, a, 80, b, 40000);
        let reverse = CanonicalTuple::new(L4Proto::Tcp, b, 40000, a, 80);
        assert_eq!(forward, reverse);
        // 地址和端口各自排序，不保持配对
        assert_eq!(forward.low_ip, b);
        assert_eq!(forward.low_port, 80);
    }

    #[test]
    fn test_ports_ignored_for_other_l4() {
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let tuple = CanonicalTuple::new(L4Proto::Other(47), a, 1, a, 2);
        assert_eq!((tuple.low_port, tuple.high_port), (0, 0));
    }
}
