//! 端口范围分类器
//!
//! 前缀树上的每个节点可以带一个默认协议和两张端口范围表（UDP、TCP）。
//! 探测器无法识别时，流水线用 `(地址, 端口, 传输层)` 在这里做静态分类。
//!
//! 管理会话在在线树的副本上执行命令，提交时整体替换，读者只会看到完整的旧树或新树。

pub mod command;
pub mod range;
pub mod tree;

pub use command::{L4Selector, ProtoTarget, RangeCommand, RangeRule};
pub use range::{PortRange, RangeOp, RangeTable};
pub use tree::{PortRangeNode, Prefix, PrefixTree};

use crate::core::protocol::{L4Proto, ProtocolId, ProtocolRegistry};
use crate::error::{ClassifierError, Result};
use crate::flow_debug;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

/// 端口范围分类器
#[derive(Debug, Default)]
pub struct PortRangeClassifier {
    tree: RwLock<PrefixTree>,
    session_open: AtomicBool,
}

impl PortRangeClassifier {
    /// 创建空分类器
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, PrefixTree> {
        self.tree.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 按地址、端口和传输层协议查找
    pub fn lookup(&self, addr: IpAddr, port: u16, l4: L4Proto) -> ProtocolId {
        self.read()
            .best_match(addr)
            .map(|(_, node)| node.lookup(port, l4))
            .unwrap_or(ProtocolId::UNKNOWN)
    }

    /// 直接更新一个前缀的端口范围
    ///
    /// 管理会话打开期间拒绝直接更新，否则会被会话提交的副本覆盖。
    pub fn update(&self, prefix: &Prefix, l4: L4Proto, range: PortRange, op: RangeOp) -> Result<bool> {
        if !matches!(l4, L4Proto::Tcp | L4Proto::Udp) {
            return Err(ClassifierError::syntax(0, format!("port ranges need tcp or udp, got {}", l4)));
        }
        let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
        // 持写锁检查，会话的副本要么已包含本次更新，要么本次被拒绝
        if self.session_open.load(Ordering::Acquire) {
            return Err(ClassifierError::session_busy("port ranges"));
        }
        let changed = match op {
            RangeOp::Insert => tree.entry(prefix).update(l4, range, op),
            RangeOp::Delete { .. } => tree
                .get_mut(prefix)
                .map(|node| node.update(l4, range, op))
                .unwrap_or(false),
        };
        if tree.get(prefix).map(PortRangeNode::is_empty).unwrap_or(false) {
            tree.remove(prefix);
        }
        Ok(changed)
    }

    /// 节点快照
    pub fn node(&self, prefix: &Prefix) -> Option<PortRangeNode> {
        self.read().get(prefix).cloned()
    }

    /// 前缀数量
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// 输出整张表
    pub fn dump(&self, registry: &ProtocolRegistry) -> String {
        dump_tree(&self.read(), registry)
    }

    /// 打开管理会话
    pub fn open_session(&self, registry: ProtocolRegistry) -> Result<PortRangeSession<'_>> {
        if self.session_open.swap(true, Ordering::AcqRel) {
            return Err(ClassifierError::session_busy("port ranges"));
        }
        Ok(PortRangeSession {
            classifier: self,
            staging: self.read().clone(),
            registry,
            lines: 0,
        })
    }
}

fn dump_tree(tree: &PrefixTree, registry: &ProtocolRegistry) -> String {
    let mut out = String::from("#ip              proto\n");
    for (prefix, node) in tree.iter_sorted() {
        let prefix = prefix.to_string();
        if let Some(proto) = node.default_proto {
            let _ = writeln!(out, "{:<16} {}", prefix, registry.display_name(proto));
        }
        if node.udp.is_empty() && node.tcp.is_empty() {
            continue;
        }
        let ranges: Vec<String> = [("udp", &node.udp), ("tcp", &node.tcp)]
            .into_iter()
            .flat_map(|(l4, table)| {
                table.ranges().iter().map(move |r| {
                    let name = registry.display_name(r.proto);
                    if r.start == r.end {
                        format!("{}:{}:{}", l4, r.start, name)
                    } else {
                        format!("{}:{}-{}:{}", l4, r.start, r.end, name)
                    }
                })
            })
            .collect();
        let _ = writeln!(out, "{:<16} {}", prefix, ranges.join(" "));
    }
    out
}

/// 端口范围管理会话
#[derive(Debug)]
pub struct PortRangeSession<'a> {
    classifier: &'a PortRangeClassifier,
    staging: PrefixTree,
    registry: ProtocolRegistry,
    lines: usize,
}

impl PortRangeSession<'_> {
    /// 执行一行命令
    pub fn apply_line(&mut self, line: &str) -> Result<()> {
        self.lines += 1;
        let line_no = self.lines;
        let Some(cmd) = command::parse_line(line, &self.registry).map_err(|e| e.at_line(line_no))? else {
            return Ok(());
        };
        for rule in &cmd.rules {
            command::apply_rule(&mut self.staging, &cmd.prefix, rule).map_err(|e| e.at_line(line_no))?;
        }
        Ok(())
    }

    /// 在暂存树上查找
    pub fn lookup(&self, addr: IpAddr, port: u16, l4: L4Proto) -> ProtocolId {
        self.staging
            .best_match(addr)
            .map(|(_, node)| node.lookup(port, l4))
            .unwrap_or(ProtocolId::UNKNOWN)
    }

    /// 暂存树的输出
    pub fn dump(&self) -> String {
        dump_tree(&self.staging, &self.registry)
    }

    /// 提交：用暂存树整体替换在线树
    pub fn commit(mut self) -> Result<()> {
        let staging = std::mem::take(&mut self.staging);
        *self
            .classifier
            .tree
            .write()
            .unwrap_or_else(PoisonError::into_inner) = staging;
        flow_debug!("port range session committed ({} lines)", self.lines);
        Ok(())
    }

    /// 放弃会话
    pub fn abort(self) {}
}

impl Drop for PortRangeSession<'_> {
    fn drop(&mut self) {
        self.classifier.session_open.store(false, Ordering::Release);
    }
}
