//! 分类引擎
//!
//! [`ClassificationEngine`] 持有一个命名空间内的全部状态：端点缓存、规则表、
//! 端口范围分类器、主机名自动机、兜底探测链和临时子流哈希表。
//! 报文处理全部是同步的，每一步都只持有很短的锁。

use crate::config::EngineConfig;
use crate::core::detector::{FlowState, ProtocolDetector};
use crate::core::endpoint::EndpointCache;
use crate::core::protocol::{ids, L4Proto, ProtocolId, ProtocolPair};
use crate::error::{ClassifierError, Result};
use crate::gc::{EphemeralSummary, EphemeralTable, GcTimer};
use crate::host::HostAutomaton;
use crate::pipeline::{
    Classification, FlowClassification, FlowRecord, MemoizedName, PacketInfo, Payload, PerPacketToken,
    ResultSource,
};
use crate::portrange::PortRangeClassifier;
use crate::probe::{CanonicalTuple, ProbeAggregator};
use crate::rules::{MarkMode, RuleTable};
use crate::utils::logger::{init_logger, LoggerConfig};
use crate::verdict::{HostScope, ProtocolMatch};
use crate::{flow_debug, flow_info, flow_trace, flow_warn};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// 引擎运行统计
#[derive(Debug, Default)]
pub struct EngineStats {
    packets: AtomicU64,
    cache_hits: AtomicU64,
    finalized_hits: AtomicU64,
    detector_calls: AtomicU64,
    detector_hits: AtomicU64,
    host_matches: AtomicU64,
    port_range_hits: AtomicU64,
    heuristic_hits: AtomicU64,
    retained: AtomicU64,
    unknown: AtomicU64,
    l4_mismatch: AtomicU64,
    l4_mismatch_bytes: AtomicU64,
    oversized: AtomicU64,
    linearized: AtomicU64,
    alloc_failures: AtomicU64,
    errors: AtomicU64,
    flows_finalized: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    /// 创建空统计
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次成功返回的结果
    pub fn record_success(&self, source: ResultSource) {
        let counter = match source {
            ResultSource::Cached => &self.cache_hits,
            ResultSource::Finalized => &self.finalized_hits,
            ResultSource::Detector => &self.detector_hits,
            ResultSource::HostMatch => &self.host_matches,
            ResultSource::PortRange => &self.port_range_hits,
            ResultSource::Heuristic => &self.heuristic_hits,
            ResultSource::Retained => &self.retained,
            ResultSource::Unknown => &self.unknown,
            ResultSource::L4Mismatch => &self.l4_mismatch,
            ResultSource::Oversized => &self.oversized,
            ResultSource::Error => &self.errors,
        };
        bump(counter);
    }

    /// 记录一次失败
    pub fn record_failure(&self) {
        bump(&self.errors);
    }

    fn record_alloc_failure(&self) {
        bump(&self.alloc_failures);
        bump(&self.errors);
    }

    /// 统计快照
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            packets: load(&self.packets),
            cache_hits: load(&self.cache_hits),
            finalized_hits: load(&self.finalized_hits),
            detector_calls: load(&self.detector_calls),
            detector_hits: load(&self.detector_hits),
            host_matches: load(&self.host_matches),
            port_range_hits: load(&self.port_range_hits),
            heuristic_hits: load(&self.heuristic_hits),
            retained: load(&self.retained),
            unknown: load(&self.unknown),
            l4_mismatch: load(&self.l4_mismatch),
            l4_mismatch_bytes: load(&self.l4_mismatch_bytes),
            oversized: load(&self.oversized),
            linearized: load(&self.linearized),
            alloc_failures: load(&self.alloc_failures),
            errors: load(&self.errors),
            flows_finalized: load(&self.flows_finalized),
            endpoints: 0,
            flow_states: 0,
            ephemeral_entries: 0,
        }
    }
}

/// 可序列化的统计快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    /// 进入流水线的报文数
    pub packets: u64,
    /// 报文令牌命中
    pub cache_hits: u64,
    /// 已完成连接的命中
    pub finalized_hits: u64,
    /// 探测器调用次数
    pub detector_calls: u64,
    /// 探测器给出结果的次数
    pub detector_hits: u64,
    /// 主机名规则改写结果的次数
    pub host_matches: u64,
    /// 端口范围命中
    pub port_range_hits: u64,
    /// 兜底启发式命中
    pub heuristic_hits: u64,
    /// 不可缓存连接沿用旧结果的次数
    pub retained: u64,
    /// 未识别
    pub unknown: u64,
    /// 非ICMP连接上的ICMP报文
    pub l4_mismatch: u64,
    /// 上述报文的字节数
    pub l4_mismatch_bytes: u64,
    /// 跳过的超长分段报文
    pub oversized: u64,
    /// 拼接过的分段报文
    pub linearized: u64,
    /// 分配失败
    pub alloc_failures: u64,
    /// 错误结果
    pub errors: u64,
    /// 完成分类的连接数
    pub flows_finalized: u64,
    /// 当前端点上下文数量
    pub endpoints: usize,
    /// 当前探测器流状态数量
    pub flow_states: usize,
    /// 临时子流表记录数
    pub ephemeral_entries: usize,
}

impl EngineStatsSnapshot {
    /// 序列化为JSON
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 无需调用探测器即返回的比例
    pub fn fast_path_rate(&self) -> f64 {
        if self.packets == 0 {
            0.0
        } else {
            (self.cache_hits + self.finalized_hits) as f64 / self.packets as f64
        }
    }
}

/// 连接的主机名规则匹配结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostProtocols {
    /// 服务器主机名匹配到的协议
    pub host: Option<ProtocolId>,
    /// 证书名匹配到的协议
    pub certificate: Option<ProtocolId>,
}

/// 分类引擎
#[derive(Debug)]
pub struct ClassificationEngine {
    config: EngineConfig,
    detector: Arc<dyn ProtocolDetector>,
    endpoints: EndpointCache,
    rules: RuleTable,
    port_ranges: PortRangeClassifier,
    hosts: HostAutomaton,
    fallback: ProbeAggregator,
    ephemeral: Option<Arc<EphemeralTable>>,
    gc_timer: Mutex<Option<GcTimer>>,
    flow_states: AtomicUsize,
    stats: EngineStats,
}

impl ClassificationEngine {
    /// 使用默认兜底探测链创建引擎，并按配置启动回收线程
    pub fn new(config: EngineConfig, detector: Arc<dyn ProtocolDetector>) -> Result<Self> {
        Self::with_parts(config, detector, ProbeAggregator::with_defaults(), true)
    }

    pub(crate) fn with_parts(
        config: EngineConfig,
        detector: Arc<dyn ProtocolDetector>,
        fallback: ProbeAggregator,
        spawn_gc: bool,
    ) -> Result<Self> {
        config.validate()?;

        // 全局日志器只初始化一次，后创建的引擎沿用已有级别
        init_logger(LoggerConfig {
            level: config.log_level,
            ..LoggerConfig::default()
        })?;

        let ephemeral = EphemeralTable::with_size_kb(
            config.ephemeral_hash_kb,
            config.ephemeral_timeout_secs,
            config.gc_slices,
        )
        .map(Arc::new);

        let gc_timer = match (&ephemeral, spawn_gc) {
            (Some(table), true) => Some(GcTimer::start(
                Arc::clone(table),
                config.gc_tick(),
                crate::utils::now_secs,
            )?),
            _ => None,
        };

        flow_info!(
            "classification engine {} created: detector '{}', ephemeral hash {} buckets",
            config.instance_id,
            detector.name(),
            ephemeral.as_ref().map(|t| t.size()).unwrap_or(0)
        );

        Ok(Self {
            endpoints: EndpointCache::new(config.max_endpoints),
            rules: RuleTable::new(),
            port_ranges: PortRangeClassifier::new(),
            hosts: HostAutomaton::new(),
            fallback,
            ephemeral,
            gc_timer: Mutex::new(gc_timer),
            flow_states: AtomicUsize::new(0),
            stats: EngineStats::new(),
            config,
            detector,
        })
    }

    /// 配置
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 探测器
    pub fn detector(&self) -> &Arc<dyn ProtocolDetector> {
        &self.detector
    }

    /// 端点缓存
    pub fn endpoints(&self) -> &EndpointCache {
        &self.endpoints
    }

    /// 规则表
    pub fn rules(&self) -> &RuleTable {
        &self.rules
    }

    /// 端口范围分类器
    pub fn port_ranges(&self) -> &PortRangeClassifier {
        &self.port_ranges
    }

    /// 主机名自动机
    pub fn hosts(&self) -> &HostAutomaton {
        &self.hosts
    }

    /// 临时子流哈希表（未启用时为 `None`）
    pub fn ephemeral(&self) -> Option<&Arc<EphemeralTable>> {
        self.ephemeral.as_ref()
    }

    /// 运行统计
    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// 统计快照，附带当前资源占用
    pub fn stats_snapshot(&self) -> EngineStatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        snapshot.endpoints = self.endpoints.len();
        snapshot.flow_states = self.flow_states.load(Ordering::Relaxed);
        snapshot.ephemeral_entries = self.ephemeral.as_ref().map(|t| t.occupancy()).unwrap_or(0);
        snapshot
    }

    /// 当前存在的探测器流状态数量
    pub fn live_flow_states(&self) -> usize {
        self.flow_states.load(Ordering::Relaxed)
    }

    /// 对一个报文进行分类
    ///
    /// 报文级错误不会向上传播，而是以 [`ResultSource::Error`] 返回未知协议对。
    pub fn classify(
        &self,
        flow: &FlowClassification,
        packet: &PacketInfo<'_>,
        token: &mut PerPacketToken,
    ) -> Classification {
        if token.is_error() {
            self.stats.record_failure();
            return Classification::error();
        }

        let len = packet.payload.len();
        if packet.payload.is_segmented() && len > self.config.mtu {
            let outcome = Classification::new(ProtocolPair::UNKNOWN, ResultSource::Oversized);
            self.stats.record_success(outcome.source);
            return outcome;
        }
        bump(&self.stats.packets);

        // 拼接在加锁之前完成
        let linear;
        let data: &[u8] = match packet.payload {
            Payload::Contiguous(data) => data,
            Payload::Segmented(_) => {
                bump(&self.stats.linearized);
                linear = packet.payload.linearize();
                &linear[..]
            }
        };

        self.rules.activate(self.detector.as_ref());

        let mut record = flow.lock();

        if token.last_flow() == Some(flow.id()) {
            let outcome = Classification::new(record.pair, ResultSource::Cached);
            self.stats.record_success(outcome.source);
            return outcome;
        }

        if packet.l4.is_icmp() && packet.l4 != flow.l4() {
            let id = if packet.l4 == L4Proto::Icmp { ids::ICMP } else { ids::ICMPV6 };
            self.stats
                .l4_mismatch_bytes
                .fetch_add(len as u64, Ordering::Relaxed);
            let outcome = Classification::new(ProtocolPair::new(id, id), ResultSource::L4Mismatch);
            self.stats.record_success(outcome.source);
            return outcome;
        }

        if record.finalized {
            token.fill(flow.id(), &record.pair);
            let outcome = Classification::new(record.pair, ResultSource::Finalized);
            self.stats.record_success(outcome.source);
            return outcome;
        }

        let outcome = match self.process(flow, &mut record, packet, data) {
            Ok(outcome) => outcome,
            Err(err) => {
                flow_debug!("flow {} classification failed: {}", flow.id().get(), err);
                if matches!(err, ClassifierError::AllocationFailure { .. }) {
                    self.stats.record_alloc_failure();
                } else {
                    self.stats.record_failure();
                }
                token.mark_error();
                return Classification::error();
            }
        };
        drop(record);

        token.fill(flow.id(), &outcome.pair);
        self.stats.record_success(outcome.source);
        self.trace_outcome(flow, &outcome);
        outcome
    }

    /// 持锁执行探测和兜底
    fn process(
        &self,
        flow: &FlowClassification,
        rec: &mut FlowRecord,
        packet: &PacketInfo<'_>,
        data: &[u8],
    ) -> Result<Classification> {
        let ((src_ip, src_port), (dst_ip, dst_port)) = packet.original_tuple();
        self.ensure_contexts(rec, src_ip, dst_ip)?;
        self.ensure_flow_state(rec)?;

        let (Some(state), Some(src), Some(dst)) = (rec.state.as_mut(), rec.src.as_deref(), rec.dst.as_deref())
        else {
            return Err(ClassifierError::internal_error("flow record without state"));
        };

        state.packet_counter += 1;
        state.packet_direction = packet.direction;
        let (a, b) = if packet.direction.is_reply() { (dst, src) } else { (src, dst) };
        let detected = self.detector.classify(state, data, packet.timestamp, a, b);
        bump(&self.stats.detector_calls);

        let packets = state.packet_counter;
        let complete = state.detection_complete;
        rec.no_cache = state.no_cache;
        let host_name = state.host_server_name.clone();
        let cert_name = state.server_certificate.clone();
        rec.packets = packets;
        self.memoize_names(rec, host_name, cert_name);

        let mut pair = detected;
        let mut source = if detected.is_unknown() {
            ResultSource::Unknown
        } else {
            ResultSource::Detector
        };

        let host_proto = rec
            .host
            .as_ref()
            .and_then(|m| m.protocol)
            .or_else(|| rec.certificate.as_ref().and_then(|m| m.protocol));
        if let Some(proto) = host_proto {
            if pair.app != proto {
                let master = if detected.app.is_unknown() { detected.master } else { detected.app };
                pair = ProtocolPair::new(proto, master);
                source = ResultSource::HostMatch;
            }
        }

        if pair.is_unknown() && packets <= self.config.guess_packet_limit && !rec.already_guessed {
            let mut guess = self.port_ranges.lookup(dst_ip, dst_port, flow.l4());
            if guess.is_unknown() {
                guess = self.port_ranges.lookup(src_ip, src_port, flow.l4());
            }
            if !guess.is_unknown() {
                rec.already_guessed = true;
                pair = ProtocolPair::app_only(guess);
                source = ResultSource::PortRange;
            }
        }

        if pair.is_unknown() {
            let tuple = CanonicalTuple::new(flow.l4(), src_ip, src_port, dst_ip, dst_port);
            let guess = self.fallback.guess(&tuple);
            if !guess.is_unknown() {
                pair = guess;
                source = ResultSource::Heuristic;
            }
        }

        let past_threshold = packets > self.config.max_unknown(flow.l4());
        let weak = matches!(source, ResultSource::Unknown | ResultSource::Heuristic);

        if weak && rec.no_cache && !rec.pair.is_unknown() {
            return Ok(Classification::new(rec.pair, ResultSource::Retained));
        }

        let finalize = match source {
            ResultSource::Detector | ResultSource::HostMatch => complete && !rec.no_cache,
            ResultSource::PortRange => !rec.no_cache,
            _ => past_threshold,
        };

        if !pair.is_unknown() {
            rec.pair = pair;
            // 启发式结果只在成为最终结果时计数
            if !rec.counted && (source != ResultSource::Heuristic || finalize) {
                rec.counted = true;
                self.rules.record_resolution(&pair);
            }
        }

        if finalize {
            self.finalize(rec);
        }

        Ok(Classification::new(pair, source))
    }

    fn ensure_contexts(&self, rec: &mut FlowRecord, src_ip: IpAddr, dst_ip: IpAddr) -> Result<()> {
        if rec.src.is_none() {
            rec.src = Some(self.endpoints.insert_or_get(src_ip)?);
        }
        if rec.dst.is_none() {
            rec.dst = Some(self.endpoints.insert_or_get(dst_ip)?);
        }
        Ok(())
    }

    fn ensure_flow_state(&self, rec: &mut FlowRecord) -> Result<()> {
        if rec.state.is_some() {
            return Ok(());
        }
        let max = self.config.max_flow_states;
        self.flow_states
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map_err(|_| ClassifierError::allocation_failure("detector flow state"))?;
        rec.state = Some(FlowState::new());
        Ok(())
    }

    fn free_flow_state(&self, rec: &mut FlowRecord) {
        if rec.state.take().is_some() {
            self.flow_states.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn finalize(&self, rec: &mut FlowRecord) {
        rec.finalized = true;
        self.free_flow_state(rec);
        bump(&self.stats.flows_finalized);
    }

    /// 记忆名称，每个字段只查一次主机名自动机
    fn memoize_names(&self, rec: &mut FlowRecord, host: Option<String>, cert: Option<String>) {
        if rec.host.is_none() {
            if let Some(name) = host.filter(|n| !n.is_empty()) {
                let protocol = self.hosts.lookup(&name);
                rec.host = Some(MemoizedName { name, protocol });
            }
        }
        if rec.certificate.is_none() {
            if let Some(name) = cert.filter(|n| !n.is_empty()) {
                let protocol = self.hosts.lookup(&name);
                rec.certificate = Some(MemoizedName { name, protocol });
            }
        }
    }

    fn trace_outcome(&self, flow: &FlowClassification, outcome: &Classification) {
        let level = outcome
            .pair
            .known_ids()
            .map(|id| self.rules.debug_level(id))
            .max()
            .unwrap_or(0);
        if level == 0 {
            return;
        }
        flow_debug!(
            "flow {} {} -> {}/{} via {:?}",
            flow.id().get(),
            flow.l4(),
            self.rules.protocol_name(outcome.pair.app),
            self.rules.protocol_name(outcome.pair.master),
            outcome.source
        );
        if level > 1 {
            flow_trace!("flow {} packets {}", flow.id().get(), flow.packets());
        }
    }

    /// 连接拆除：释放端点引用、名称记忆和探测器流状态
    pub fn release_flow(&self, flow: &FlowClassification) {
        let mut rec = flow.lock();
        for ctx in [rec.src.take(), rec.dst.take()].into_iter().flatten() {
            self.endpoints.release(&ctx);
        }
        rec.host = None;
        rec.certificate = None;
        self.free_flow_state(&mut rec);
    }

    /// 清除完成状态，让连接重新分类
    ///
    /// 计数器不会再次累加。
    pub fn reset_flow(&self, flow: &FlowClassification) {
        let mut rec = flow.lock();
        rec.finalized = false;
        rec.already_guessed = false;
        rec.no_cache = false;
        rec.pair = ProtocolPair::UNKNOWN;
        rec.host = None;
        rec.certificate = None;
        self.free_flow_state(&mut rec);
    }

    /// 连接的主机名规则匹配结果
    pub fn flow_host_protocols(&self, flow: &FlowClassification) -> HostProtocols {
        let rec = flow.lock();
        HostProtocols {
            host: rec.host.as_ref().and_then(|m| m.protocol),
            certificate: rec.certificate.as_ref().and_then(|m| m.protocol),
        }
    }

    /// 在记忆的主机名/证书名上做子串匹配
    ///
    /// 证书名只在连接涉及TLS时参与。
    pub fn host_match(&self, flow: &FlowClassification, needle: &str, scope: HostScope) -> bool {
        let rec = flow.lock();
        let contains = |memo: &Option<MemoizedName>| {
            memo.as_ref().map(|m| m.name.contains(needle)).unwrap_or(false)
        };
        if scope.includes_host() && contains(&rec.host) {
            return true;
        }
        scope.includes_certificate() && rec.pair.involves(ids::TLS) && contains(&rec.certificate)
    }

    /// 在分类结果上求值匹配规则
    pub fn evaluate(&self, rule: &ProtocolMatch, flow: &FlowClassification, outcome: &Classification) -> bool {
        let host_ok = match rule.host_condition() {
            Some((needle, scope)) => self.host_match(flow, needle, scope),
            None => true,
        };
        rule.matches(&outcome.pair, outcome.is_error(), host_ok)
    }

    /// 按分类结果改写标记值
    pub fn apply_mark(&self, value: u32, outcome: &Classification, mode: MarkMode) -> u32 {
        self.rules.apply_mark(value, &outcome.pair, mode)
    }

    /// 记录一个临时子流，返回命中次数；表未启用时返回 `None`
    pub fn track_ephemeral(&self, addr: IpAddr, port: u16, flag: u32) -> Option<u32> {
        self.track_ephemeral_at(addr, port, flag, crate::utils::now_secs())
    }

    /// 同上，使用指定时间
    pub fn track_ephemeral_at(&self, addr: IpAddr, port: u16, flag: u32, now: u64) -> Option<u32> {
        self.ephemeral.as_ref().map(|t| t.touch(addr, port, flag, now))
    }

    /// 临时子流表概要
    pub fn ephemeral_summary(&self) -> Option<EphemeralSummary> {
        self.ephemeral.as_ref().map(|t| t.summary())
    }

    /// 规则表和计数器的文本输出
    pub fn rules_dump(&self) -> String {
        self.rules.dump()
    }

    /// 端口范围表的文本输出
    pub fn port_range_dump(&self) -> String {
        self.port_ranges.dump(&self.rules.registry())
    }

    /// 主机名规则的文本输出
    pub fn host_listing(&self) -> String {
        self.hosts.listing(&self.rules.registry())
    }

    fn stop_gc(&self) {
        let timer = self
            .gc_timer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut timer) = timer {
            timer.stop();
            flow_debug!("gc timer of engine {} stopped", self.config.instance_id);
        }
    }

    /// 停止回收线程并清空端点缓存
    pub fn shutdown(&self) {
        self.stop_gc();
        let endpoints = self.endpoints.len();
        if endpoints > 0 {
            flow_warn!("engine shutdown with {} endpoint contexts still referenced", endpoints);
        }
        self.endpoints.clear();
    }
}

impl Drop for ClassificationEngine {
    fn drop(&mut self) {
        self.stop_gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::NullDetector;

    fn engine() -> ClassificationEngine {
        ClassificationEngine::new(EngineConfig::default(), Arc::new(NullDetector)).unwrap()
    }

    #[test]
    fn test_flow_state_limit() {
        let config = EngineConfig {
            max_flow_states: 1,
            ..EngineConfig::default()
        };
        let engine = ClassificationEngine::new(config, Arc::new(NullDetector)).unwrap();
        let a = FlowClassification::new(L4Proto::Tcp);
        let b = FlowClassification::new(L4Proto::Tcp);
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "10.0.0.2".parse().unwrap();
        let packet = PacketInfo::new((src, 40000), (dst, 40001), L4Proto::Tcp, b"x");

        let first = engine.classify(&a, &packet, &mut PerPacketToken::new());
        assert!(!first.is_error());
        let second = engine.classify(&b, &packet, &mut PerPacketToken::new());
        assert!(second.is_error());
        assert_eq!(engine.stats_snapshot().alloc_failures, 1);

        engine.release_flow(&a);
        assert_eq!(engine.live_flow_states(), 0);
        assert!(!engine.classify(&b, &packet, &mut PerPacketToken::new()).is_error());
    }

    #[test]
    fn test_release_flow_drops_endpoints() {
        let engine = engine();
        let flow = FlowClassification::new(L4Proto::Udp);
        let src: IpAddr = "10.0.0.1".parse().unwrap();
        let dst: IpAddr = "10.0.0.2".parse().unwrap();
        let packet = PacketInfo::new((src, 5000), (dst, 5001), L4Proto::Udp, b"?");
        engine.classify(&flow, &packet, &mut PerPacketToken::new());
        assert_eq!(engine.endpoints().len(), 2);
        engine.release_flow(&flow);
        assert!(engine.endpoints().is_empty());
    }
}
