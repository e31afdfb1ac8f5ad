//! 分类流水线的数据类型
//!
//! 每条被跟踪的连接对应一个 [`FlowClassification`]，内部状态由一把短临界区的
//! 互斥锁保护，同一连接同一时刻最多只有一次探测器调用。
//! 报文本身以 [`PacketInfo`] 描述，[`PerPacketToken`] 随报文传递，
//! 让同一报文的重复查询直接命中。

use crate::core::detector::{Direction, FlowState};
use crate::core::endpoint::EndpointContext;
use crate::core::protocol::{L4Proto, ProtocolId, ProtocolPair};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

static NEXT_FLOW_ID: AtomicU64 = AtomicU64::new(1);

/// 进程内唯一的连接标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowId(u64);

impl FlowId {
    fn next() -> Self {
        Self(NEXT_FLOW_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 数值
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 连接记录内部状态
#[derive(Debug, Default)]
pub(crate) struct FlowRecord {
    pub(crate) state: Option<FlowState>,
    pub(crate) src: Option<Arc<EndpointContext>>,
    pub(crate) dst: Option<Arc<EndpointContext>>,
    pub(crate) pair: ProtocolPair,
    pub(crate) finalized: bool,
    pub(crate) no_cache: bool,
    pub(crate) already_guessed: bool,
    pub(crate) counted: bool,
    /// 最后一次探测时的报文计数，流状态释放后仍保留
    pub(crate) packets: u32,
    pub(crate) host: Option<MemoizedName>,
    pub(crate) certificate: Option<MemoizedName>,
}

/// 记忆的名称及其主机名规则匹配结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MemoizedName {
    pub(crate) name: String,
    pub(crate) protocol: Option<ProtocolId>,
}

/// 单条连接的分类记录
#[derive(Debug)]
pub struct FlowClassification {
    id: FlowId,
    l4: L4Proto,
    inner: Mutex<FlowRecord>,
}

impl FlowClassification {
    /// 为一条新连接创建记录
    pub fn new(l4: L4Proto) -> Self {
        Self {
            id: FlowId::next(),
            l4,
            inner: Mutex::new(FlowRecord::default()),
        }
    }

    /// 连接标识
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// 连接的传输层协议
    pub fn l4(&self) -> L4Proto {
        self.l4
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FlowRecord> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前协议对
    pub fn pair(&self) -> ProtocolPair {
        self.lock().pair
    }

    /// 是否已完成分类
    pub fn is_finalized(&self) -> bool {
        self.lock().finalized
    }

    /// 是否被标记为不可缓存
    pub fn is_no_cache(&self) -> bool {
        self.lock().no_cache
    }

    /// 是否仍持有探测器流状态
    pub fn has_flow_state(&self) -> bool {
        self.lock().state.is_some()
    }

    /// 已交给探测器的报文数
    pub fn packets(&self) -> u32 {
        self.lock().packets
    }

    /// 记忆的服务器主机名
    pub fn host_name(&self) -> Option<String> {
        self.lock().host.as_ref().map(|m| m.name.clone())
    }

    /// 记忆的证书名
    pub fn certificate_name(&self) -> Option<String> {
        self.lock().certificate.as_ref().map(|m| m.name.clone())
    }
}

/// 报文级缓存令牌
///
/// 同一报文多次经过匹配规则时，令牌记住上一次解析的连接和结果。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerPacketToken {
    last_flow: Option<FlowId>,
    packed: u32,
    error: bool,
}

impl PerPacketToken {
    /// 新报文的空令牌
    pub fn new() -> Self {
        Self::default()
    }

    /// 上一次解析的连接
    pub fn last_flow(&self) -> Option<FlowId> {
        self.last_flow
    }

    /// 打包的协议对
    pub fn packed(&self) -> u32 {
        self.packed
    }

    /// 是否带错误标记
    pub fn is_error(&self) -> bool {
        self.error
    }

    pub(crate) fn fill(&mut self, flow: FlowId, pair: &ProtocolPair) {
        self.last_flow = Some(flow);
        self.packed = pair.pack();
    }

    pub(crate) fn mark_error(&mut self) {
        self.error = true;
        self.packed = 0;
    }
}

/// 报文负载
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    /// 连续缓冲区
    Contiguous(&'a [u8]),
    /// 分段缓冲区，探测前需要拼接
    Segmented(&'a [Bytes]),
}

impl Payload<'_> {
    /// 总长度
    pub fn len(&self) -> usize {
        match self {
            Self::Contiguous(data) => data.len(),
            Self::Segmented(parts) => parts.iter().map(Bytes::len).sum(),
        }
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否为分段负载
    pub fn is_segmented(&self) -> bool {
        matches!(self, Self::Segmented(_))
    }

    /// 拼接为连续缓冲区
    pub fn linearize(&self) -> Bytes {
        match self {
            Self::Contiguous(data) => Bytes::copy_from_slice(data),
            Self::Segmented(parts) => {
                let mut buf = BytesMut::with_capacity(self.len());
                for part in parts.iter() {
                    buf.extend_from_slice(part);
                }
                buf.freeze()
            }
        }
    }
}

/// 一个待分类的报文
#[derive(Debug, Clone, Copy)]
pub struct PacketInfo<'a> {
    /// 源地址
    pub src_ip: IpAddr,
    /// 源端口
    pub src_port: u16,
    /// 目的地址
    pub dst_ip: IpAddr,
    /// 目的端口
    pub dst_port: u16,
    /// 报文自身的传输层协议
    pub l4: L4Proto,
    /// 相对连接的方向
    pub direction: Direction,
    /// 时间戳（毫秒）
    pub timestamp: u64,
    /// 负载
    pub payload: Payload<'a>,
}

impl<'a> PacketInfo<'a> {
    /// 原方向报文
    pub fn new(src: (IpAddr, u16), dst: (IpAddr, u16), l4: L4Proto, payload: &'a [u8]) -> Self {
        Self {
            src_ip: src.0,
            src_port: src.1,
            dst_ip: dst.0,
            dst_port: dst.1,
            l4,
            direction: Direction::Original,
            timestamp: crate::utils::now_millis(),
            payload: Payload::Contiguous(payload),
        }
    }

    /// 设置方向
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// 设置时间戳
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// 设置分段负载
    pub fn with_segments(mut self, parts: &'a [Bytes]) -> Self {
        self.payload = Payload::Segmented(parts);
        self
    }

    /// 连接原方向的 `(源, 目的)` 端点
    pub fn original_tuple(&self) -> ((IpAddr, u16), (IpAddr, u16)) {
        let src = (self.src_ip, self.src_port);
        let dst = (self.dst_ip, self.dst_port);
        if self.direction.is_reply() {
            (dst, src)
        } else {
            (src, dst)
        }
    }
}

/// 结果来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ResultSource {
    /// 报文令牌命中
    Cached,
    /// 连接已完成分类
    Finalized,
    /// 探测器
    Detector,
    /// 主机名规则
    HostMatch,
    /// 端口范围
    PortRange,
    /// 兜底启发式
    Heuristic,
    /// 不可缓存连接本次未识别，沿用之前的结果
    Retained,
    /// 仍未识别
    Unknown,
    /// 非ICMP连接上的ICMP报文
    L4Mismatch,
    /// 超长分段报文被跳过
    Oversized,
    /// 处理出错
    Error,
}

/// 一次分类的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// 协议对
    pub pair: ProtocolPair,
    /// 来源
    pub source: ResultSource,
}

impl Classification {
    pub(crate) fn new(pair: ProtocolPair, source: ResultSource) -> Self {
        Self { pair, source }
    }

    pub(crate) fn error() -> Self {
        Self::new(ProtocolPair::UNKNOWN, ResultSource::Error)
    }

    /// 是否为处理错误（包括跳过的超长报文）
    pub fn is_error(&self) -> bool {
        matches!(self.source, ResultSource::Error | ResultSource::Oversized)
    }

    /// 是否未识别
    pub fn is_unknown(&self) -> bool {
        self.pair.is_unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_ids_are_unique() {
        let a = FlowClassification::new(L4Proto::Tcp);
        let b = FlowClassification::new(L4Proto::Tcp);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_linearize_segments() {
        let parts = [Bytes::from_static(b"GET / "), Bytes::from_static(b"HTTP/1.1")];
        let payload = Payload::Segmented(&parts);
        assert_eq!(payload.len(), 14);
        assert_eq!(&payload.linearize()[..], b"GET / HTTP/1.1");
    }

    #[test]
    fn test_reply_original_tuple() {
        let client: IpAddr = "10.0.0.2".parse().unwrap();
        let server: IpAddr = "10.0.0.1".parse().unwrap();
        let packet = PacketInfo::new((server, 443), (client, 50000), L4Proto::Tcp, b"")
            .with_direction(Direction::Reply);
        let (src, dst) = packet.original_tuple();
        assert_eq!(src, (client, 50000));
        assert_eq!(dst, (server, 443));
    }
}
