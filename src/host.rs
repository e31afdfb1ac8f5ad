//! 主机名/证书自动机（双缓冲）
//!
//! 在线代（live）是一个不可变的 `Arc<HostGeneration>`，查找时只需克隆指针，
//! 匹配过程不持有任何锁。管理会话在暂存表上修改，提交时构建新的
//! Aho-Corasick自动机，然后在一次写锁内替换指针；任何一条命令出错都会使
//! 整个会话作废，在线代保持不变。
//!
//! 命令语法：
//!
//! ```text
//! reset
//! proto:host[,host...][[ \t;]proto:host[,host...]]
//! -proto:host[,host...]
//! ```

use crate::core::protocol::{ProtocolId, ProtocolRegistry};
use crate::error::{ClassifierError, Result};
use crate::{flow_info, flow_warn};
use aho_corasick::{AhoCorasick, MatchKind};
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// 单个模式的最大长度（不含）
pub const MAX_PATTERN_LEN: usize = 255;

/// 列表输出的换行宽度
const LISTING_WIDTH: usize = 80;

/// 主机名表：协议到模式列表的映射
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTable {
    by_proto: BTreeMap<ProtocolId, Vec<String>>,
    index: HashMap<String, ProtocolId>,
}

impl HostTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 模式总数
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// 添加模式
    ///
    /// 同一协议下的重复模式被忽略（返回 `Ok(false)`）；
    /// 已绑定到其他协议的模式返回 [`ClassifierError::StructuralViolation`]。
    pub fn add(&mut self, pattern: &str, proto: ProtocolId) -> Result<bool> {
        let pattern = normalize_pattern(pattern)?;
        match self.index.get(&pattern) {
            Some(existing) if *existing == proto => Ok(false),
            Some(existing) => Err(ClassifierError::structural_violation(format!(
                "host '{}' already bound to protocol {}",
                pattern, existing
            ))),
            None => {
                self.by_proto.entry(proto).or_default().push(pattern.clone());
                self.index.insert(pattern, proto);
                Ok(true)
            }
        }
    }

    /// 删除模式，返回是否存在
    pub fn remove(&mut self, pattern: &str, proto: ProtocolId) -> bool {
        let pattern = pattern.trim().to_ascii_lowercase();
        if self.index.get(&pattern) != Some(&proto) {
            return false;
        }
        self.index.remove(&pattern);
        if let Some(list) = self.by_proto.get_mut(&proto) {
            list.retain(|p| *p != pattern);
            if list.is_empty() {
                self.by_proto.remove(&proto);
            }
        }
        true
    }

    /// 清空
    pub fn clear(&mut self) {
        self.by_proto.clear();
        self.index.clear();
    }

    /// 模式绑定的协议
    pub fn protocol_of(&self, pattern: &str) -> Option<ProtocolId> {
        self.index.get(&pattern.to_ascii_lowercase()).copied()
    }

    /// 按协议遍历
    pub fn iter(&self) -> impl Iterator<Item = (ProtocolId, &[String])> {
        self.by_proto.iter().map(|(id, list)| (*id, list.as_slice()))
    }

    /// 生成列表文本
    pub fn listing(&self, registry: &ProtocolRegistry) -> String {
        let mut out = String::from("#Proto:host\n");
        for (proto, hosts) in self.iter() {
            let name = registry.display_name(proto);
            let mut line = String::new();
            for host in hosts {
                if !line.is_empty() && line.len() + host.len() + 1 > LISTING_WIDTH {
                    out.push_str(&line);
                    out.push('\n');
                    line.clear();
                }
                if line.is_empty() {
                    let _ = write!(line, "{}:{}", name, host);
                } else {
                    let _ = write!(line, ",{}", host);
                }
            }
            if !line.is_empty() {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }
}

fn normalize_pattern(pattern: &str) -> Result<String> {
    let pattern = pattern.trim();
    if pattern.is_empty() {
        return Err(ClassifierError::syntax(0, "empty host pattern"));
    }
    if pattern.len() >= MAX_PATTERN_LEN {
        return Err(ClassifierError::syntax(
            0,
            format!("host pattern longer than {} bytes", MAX_PATTERN_LEN - 1),
        ));
    }
    Ok(pattern.to_ascii_lowercase())
}

/// 自动机的一代：完整且内部一致的快照
pub struct HostGeneration {
    version: u64,
    table: HostTable,
    matcher: Option<AhoCorasick>,
    protocols: Vec<ProtocolId>,
}

impl fmt::Debug for HostGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostGeneration")
            .field("version", &self.version)
            .field("patterns", &self.table.len())
            .finish()
    }
}

impl HostGeneration {
    /// 由主机名表构建一代
    pub fn build(table: HostTable, version: u64) -> Result<Self> {
        let mut patterns = Vec::with_capacity(table.len());
        let mut protocols = Vec::with_capacity(table.len());
        for (proto, hosts) in table.iter() {
            for host in hosts {
                patterns.push(host.clone());
                protocols.push(proto);
            }
        }

        let matcher = if patterns.is_empty() {
            None
        } else {
            let ac = AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .match_kind(MatchKind::LeftmostLongest)
                .build(&patterns)
                .map_err(|e| ClassifierError::internal_error(format!("host automaton: {}", e)))?;
            Some(ac)
        };

        Ok(Self {
            version,
            table,
            matcher,
            protocols,
        })
    }

    /// 空的一代
    pub fn empty() -> Self {
        Self {
            version: 0,
            table: HostTable::new(),
            matcher: None,
            protocols: Vec::new(),
        }
    }

    /// 代号
    pub fn version(&self) -> u64 {
        self.version
    }

    /// 主机名表
    pub fn table(&self) -> &HostTable {
        &self.table
    }

    /// 子串匹配，返回最左最长命中的协议
    pub fn lookup(&self, name: &str) -> Option<ProtocolId> {
        let matcher = self.matcher.as_ref()?;
        matcher
            .find(name)
            .and_then(|m| self.protocols.get(m.pattern().as_usize()).copied())
    }
}

/// 双缓冲主机名自动机
#[derive(Debug)]
pub struct HostAutomaton {
    live: RwLock<Arc<HostGeneration>>,
    session_open: AtomicBool,
    next_version: AtomicU64,
    errors: AtomicU64,
}

impl Default for HostAutomaton {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAutomaton {
    /// 创建空自动机
    pub fn new() -> Self {
        Self {
            live: RwLock::new(Arc::new(HostGeneration::empty())),
            session_open: AtomicBool::new(false),
            next_version: AtomicU64::new(1),
            errors: AtomicU64::new(0),
        }
    }

    /// 当前在线代
    pub fn current(&self) -> Arc<HostGeneration> {
        Arc::clone(&self.live.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// 在在线代上查找
    pub fn lookup(&self, name: &str) -> Option<ProtocolId> {
        self.current().lookup(name)
    }

    /// 在线代的列表文本
    pub fn listing(&self, registry: &ProtocolRegistry) -> String {
        self.current().table().listing(registry)
    }

    /// 命令错误累计
    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// 直接安装一张主机名表（初始化时使用）
    pub fn install(&self, table: HostTable) -> Result<u64> {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let generation = Arc::new(HostGeneration::build(table, version)?);
        self.swap(generation);
        Ok(version)
    }

    fn swap(&self, generation: Arc<HostGeneration>) -> Arc<HostGeneration> {
        let mut live = self.live.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *live, generation)
    }

    /// 打开会话
    ///
    /// 深拷贝在线主机名表作为暂存；同一时间只允许一个会话。
    pub fn open(&self, writable: bool, registry: ProtocolRegistry) -> Result<HostSession<'_>> {
        if self.session_open.swap(true, Ordering::AcqRel) {
            return Err(ClassifierError::session_busy("hosts"));
        }
        Ok(HostSession {
            automaton: self,
            staging: self.current().table().clone(),
            writable,
            registry,
            errors: 0,
            first_error: None,
            lines: 0,
        })
    }
}

/// 主机名自动机会话
#[derive(Debug)]
pub struct HostSession<'a> {
    automaton: &'a HostAutomaton,
    staging: HostTable,
    writable: bool,
    registry: ProtocolRegistry,
    errors: usize,
    first_error: Option<(usize, String)>,
    lines: usize,
}

impl HostSession<'_> {
    /// 暂存表
    pub fn staging(&self) -> &HostTable {
        &self.staging
    }

    /// 会话是否可写
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// 暂存表的列表文本
    pub fn listing(&self) -> String {
        self.staging.listing(&self.registry)
    }

    /// 执行一行命令
    pub fn apply_line(&mut self, line: &str) -> Result<()> {
        self.lines += 1;
        if !self.writable {
            return Err(ClassifierError::session_closed("hosts (read-only)"));
        }
        let result = self.apply_groups(line).map_err(|e| e.at_line(self.lines));
        if let Err(err) = &result {
            self.errors += 1;
            self.automaton.errors.fetch_add(1, Ordering::Relaxed);
            if self.first_error.is_none() {
                self.first_error = Some((self.lines, err.to_string()));
            }
        }
        result
    }

    fn apply_groups(&mut self, line: &str) -> Result<()> {
        for group in line.split([' ', '\t', ';']).filter(|g| !g.is_empty()) {
            if group.starts_with('#') {
                break;
            }
            if group == "reset" {
                self.staging.clear();
                continue;
            }

            let (delete, group) = match group.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, group),
            };
            let (name, hosts) = group
                .split_once(':')
                .filter(|(name, _)| !name.is_empty())
                .ok_or_else(|| ClassifierError::syntax(0, format!("expected proto:host, got '{}'", group)))?;
            let proto = self
                .registry
                .lookup(name)
                .filter(|id| !id.is_unknown())
                .ok_or_else(|| ClassifierError::unknown_protocol(name))?;

            for host in hosts.split(',').filter(|h| !h.is_empty()) {
                if delete {
                    self.staging.remove(host, proto);
                } else {
                    self.staging.add(host, proto)?;
                }
            }
        }
        Ok(())
    }

    /// 提交会话
    ///
    /// 只有没有任何错误时才构建新一代并替换在线代；否则返回带首个出错行号的语法错误。
    pub fn close(self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        if let Some((line, message)) = &self.first_error {
            flow_warn!("host session discarded: {} errors", self.errors);
            return Err(ClassifierError::syntax(
                *line,
                format!("host rules not updated, {} errors, first: {}", self.errors, message),
            ));
        }
        let version = self.automaton.next_version.fetch_add(1, Ordering::Relaxed);
        let generation = Arc::new(HostGeneration::build(self.staging.clone(), version)?);
        let previous = self.automaton.swap(generation);
        flow_info!(
            "host automaton generation {} installed ({} patterns), replaced generation {}",
            version,
            self.staging.len(),
            previous.version()
        );
        Ok(())
    }

    /// 放弃会话
    pub fn abort(self) {}
}

impl Drop for HostSession<'_> {
    fn drop(&mut self) {
        self.automaton.session_open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ids;

    #[test]
    fn test_listing_wraps() {
        let registry = ProtocolRegistry::new();
        let mut table = HostTable::new();
        for i in 0..12 {
            table.add(&format!("host{:02}.example.com", i), ids::HTTP).unwrap();
        }
        let listing = table.listing(&registry);
        let lines: Vec<&str> = listing.lines().collect();
        assert_eq!(lines[0], "#Proto:host");
        assert!(lines.len() > 2);
        for line in &lines[1..] {
            assert!(line.starts_with("http:"));
            assert!(line.len() <= LISTING_WIDTH);
        }
    }

    #[test]
    fn test_pattern_limits() {
        let mut table = HostTable::new();
        assert!(table.add("", ids::HTTP).is_err());
        assert!(table.add(&"a".repeat(MAX_PATTERN_LEN), ids::HTTP).is_err());
        assert!(table.add(&"a".repeat(MAX_PATTERN_LEN - 1), ids::HTTP).is_ok());
    }
}
