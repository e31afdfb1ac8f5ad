//! 规则表模块
//!
//! 每个协议编号对应一组 `(mark, mask)` 与调试级别。`(0, 0)` 表示该协议被禁用。
//! 第一次激活时根据规则表计算一次协议位图并推送给探测器，此后禁用协议或定义
//! 自定义协议都会被拒绝，以免计数器语义失效。
//!
//! 管理命令语法：
//!
//! ```text
//! <hexid|name|all|any> <hexmark>[/<hexmask>]
//! <hexid|name|all|any> debug <0..4>
//! <hexid|name> disable
//! init
//! add_custom <name>
//! # 注释
//! ```

use crate::core::detector::ProtocolDetector;
use crate::core::protocol::{ProtocolBitmask, ProtocolId, ProtocolPair, ProtocolRegistry, MAX_PROTOCOLS};
use crate::error::{ClassifierError, Result};
use crate::{flow_debug, flow_info};
use once_cell::sync::OnceCell;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

/// 默认掩码
pub const DEFAULT_MASK: u32 = 0x1ff;

/// 最大调试级别
pub const MAX_DEBUG_LEVEL: u8 = 4;

/// 自定义协议名称中不允许出现的字符
const FORBIDDEN_NAME_CHARS: &str = "/&^:;\\\"'";

/// 单个协议的规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RuleEntry {
    /// 标记值
    pub mark: u32,
    /// 标记掩码
    pub mask: u32,
    /// 调试级别 0..=4
    pub debug_level: u8,
}

impl RuleEntry {
    /// 是否参与匹配
    pub fn is_enabled(&self) -> bool {
        self.mark != 0 || self.mask != 0
    }
}

/// 标记写入模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkMode {
    /// 只使用主协议的规则
    Master,
    /// 只使用应用协议的规则
    App,
    /// 主协议写低16位，应用协议写高16位
    Any,
}

/// 规则集合：协议注册表加每个编号的规则
#[derive(Debug, Clone)]
pub struct RuleSet {
    registry: ProtocolRegistry,
    entries: Vec<RuleEntry>,
}

impl Default for RuleSet {
    fn default() -> Self {
        let mut set = Self {
            registry: ProtocolRegistry::new(),
            entries: vec![RuleEntry::default(); MAX_PROTOCOLS],
        };
        set.reset_defaults();
        set
    }
}

impl RuleSet {
    /// 协议注册表
    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    /// 获取规则
    pub fn entry(&self, id: ProtocolId) -> Option<&RuleEntry> {
        self.registry.contains(id).then(|| &self.entries[id.index()])
    }

    /// 所有已注册协议恢复默认规则：`mark = id`, `mask = 0x1ff`
    pub fn reset_defaults(&mut self) {
        for (id, _) in self.registry.iter() {
            let entry = &mut self.entries[id.index()];
            entry.mark = id.0 as u32;
            entry.mask = DEFAULT_MASK;
        }
    }

    fn set_rule(&mut self, id: ProtocolId, mark: u32, mask: Option<u32>) {
        let entry = &mut self.entries[id.index()];
        entry.mark = mark;
        if let Some(mask) = mask {
            entry.mask = mask;
        }
    }

    /// 计算启用位图
    pub fn enabled_bitmask(&self) -> ProtocolBitmask {
        let mut mask = ProtocolBitmask::new();
        for (id, _) in self.registry.iter() {
            if self.entries[id.index()].is_enabled() {
                mask.set(id);
            }
        }
        mask
    }

    /// 解析协议标识：先按名称，再按十六进制编号
    ///
    /// 名称优先，`cafe` 这类同时是合法十六进制数的协议名也能被选中。
    fn resolve_target(&self, token: &str) -> Option<ProtocolId> {
        if let Some(id) = self.registry.lookup(token) {
            return Some(id);
        }
        let id = ProtocolId(u16::from_str_radix(token, 16).ok()?);
        self.registry.contains(id).then_some(id)
    }

    /// 执行一条管理命令
    ///
    /// `activated` 表示规则表是否已经被在线流量激活。
    pub fn apply_command(&mut self, line: &str, activated: bool) -> Result<()> {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(());
        }

        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };

        if rest.is_empty() {
            if head == "init" {
                self.reset_defaults();
                return Ok(());
            }
            return Err(ClassifierError::syntax(0, format!("missing argument for '{}'", head)));
        }

        if head == "add_custom" {
            let name = rest.split_whitespace().next().unwrap_or(rest);
            self.add_custom(name, activated)?;
            return Ok(());
        }

        let any = head == "any";
        let all = head == "all";
        let target = if any || all {
            None
        } else {
            Some(
                self.resolve_target(head)
                    .ok_or_else(|| ClassifierError::unknown_protocol(head))?,
            )
        };

        if let Some(level) = rest.strip_prefix("debug") {
            let level = parse_debug_level(level)?;
            match target {
                Some(id) => self.entries[id.index()].debug_level = level,
                None => {
                    for (id, _) in self.registry.iter() {
                        self.entries[id.index()].debug_level = level;
                    }
                }
            }
            return Ok(());
        }

        let (mark, mask) = if rest == "disable" {
            if target.is_none() {
                return Err(ClassifierError::syntax(0, "can't disable all protocols"));
            }
            (0, Some(0))
        } else {
            parse_mark_mask(rest)?
        };

        if activated && mark == 0 && mask == Some(0) {
            return Err(ClassifierError::consistency_conflict(
                "classification is active, can't disable protocol",
            ));
        }

        match target {
            Some(id) => self.set_rule(id, mark, mask),
            None => {
                let ids: Vec<ProtocolId> = self
                    .registry
                    .iter()
                    .map(|(id, _)| id)
                    .filter(|id| !(any && id.is_unknown()))
                    .collect();
                for id in ids {
                    self.set_rule(id, mark, mask);
                }
            }
        }
        Ok(())
    }

    /// 定义自定义协议
    ///
    /// 名称已存在时直接返回已有编号。
    pub fn add_custom(&mut self, name: &str, activated: bool) -> Result<ProtocolId> {
        if let Some(bad) = name
            .chars()
            .find(|c| (*c as u32) < 0x20 || FORBIDDEN_NAME_CHARS.contains(*c))
        {
            return Err(ClassifierError::syntax(
                0,
                format!("can't use {:?} in protocol name", bad),
            ));
        }
        if let Some(existing) = self.registry.lookup(name) {
            return Ok(existing);
        }
        if activated {
            return Err(ClassifierError::consistency_conflict(
                "classification is active, can't create custom protocol",
            ));
        }
        let id = self
            .registry
            .register(name)
            .ok_or_else(|| ClassifierError::allocation_failure("protocol id space exhausted"))?;
        self.entries[id.index()] = RuleEntry {
            mark: id.0 as u32,
            mask: DEFAULT_MASK,
            debug_level: 0,
        };
        Ok(id)
    }
}

fn parse_hex(token: &str, what: &str) -> Result<u32> {
    u32::from_str_radix(token.trim_start_matches("0x"), 16)
        .map_err(|_| ClassifierError::syntax(0, format!("bad {} '{}'", what, token)))
}

fn parse_mark_mask(spec: &str) -> Result<(u32, Option<u32>)> {
    let spec = spec.split_whitespace().next().unwrap_or(spec);
    match spec.split_once('/') {
        Some((mark, mask)) => Ok((parse_hex(mark, "mark")?, Some(parse_hex(mask, "mask")?))),
        None => Ok((parse_hex(spec, "mark")?, None)),
    }
}

fn parse_debug_level(rest: &str) -> Result<u8> {
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return Err(ClassifierError::syntax(0, "invalid debug settings"));
    }
    match rest.trim().parse::<u8>() {
        Ok(level) if level <= MAX_DEBUG_LEVEL => Ok(level),
        _ => Err(ClassifierError::syntax(0, "debug level must be 0..4")),
    }
}

/// 规则表
///
/// 在线规则集合由读写锁保护；每协议计数器是无锁原子量。
#[derive(Debug)]
pub struct RuleTable {
    live: RwLock<RuleSet>,
    counters: Vec<AtomicU64>,
    activation: OnceCell<ProtocolBitmask>,
    session_open: AtomicBool,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleTable {
    /// 创建默认规则表
    pub fn new() -> Self {
        Self {
            live: RwLock::new(RuleSet::default()),
            counters: (0..MAX_PROTOCOLS).map(|_| AtomicU64::new(0)).collect(),
            activation: OnceCell::new(),
            session_open: AtomicBool::new(false),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RuleSet> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// 设置协议的 `(mark, mask)`
    pub fn set_rule(&self, id: ProtocolId, mark: u32, mask: u32) -> Result<()> {
        let mut set = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if !set.registry.contains(id) {
            return Err(ClassifierError::unknown_protocol(id.to_string()));
        }
        if mark == 0 && mask == 0 && self.is_activated() {
            return Err(ClassifierError::consistency_conflict(
                "classification is active, can't disable protocol",
            ));
        }
        set.set_rule(id, mark, Some(mask));
        Ok(())
    }

    /// 获取协议规则
    pub fn rule(&self, id: ProtocolId) -> Option<RuleEntry> {
        self.read().entry(id).copied()
    }

    /// 设置协议的调试级别
    pub fn set_debug_level(&self, id: ProtocolId, level: u8) -> Result<()> {
        if level > MAX_DEBUG_LEVEL {
            return Err(ClassifierError::syntax(0, "debug level must be 0..4"));
        }
        let mut set = self.live.write().unwrap_or_else(PoisonError::into_inner);
        if !set.registry.contains(id) {
            return Err(ClassifierError::unknown_protocol(id.to_string()));
        }
        set.entries[id.index()].debug_level = level;
        Ok(())
    }

    /// 协议的调试级别
    pub fn debug_level(&self, id: ProtocolId) -> u8 {
        self.rule(id).map(|entry| entry.debug_level).unwrap_or(0)
    }

    /// 恢复默认规则
    pub fn reset_defaults(&self) {
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_defaults();
    }

    /// 定义自定义协议
    pub fn add_custom(&self, name: &str) -> Result<ProtocolId> {
        let activated = self.is_activated();
        self.live
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .add_custom(name, activated)
    }

    /// 协议注册表快照
    pub fn registry(&self) -> ProtocolRegistry {
        self.read().registry.clone()
    }

    /// 按名称查找协议
    pub fn lookup(&self, name: &str) -> Option<ProtocolId> {
        self.read().registry.lookup(name)
    }

    /// 协议名称
    pub fn protocol_name(&self, id: ProtocolId) -> String {
        self.read().registry.display_name(id)
    }

    /// 激活规则表
    ///
    /// 只有第一次调用会计算位图并推送给探测器，之后直接返回同一位图。
    pub fn activate(&self, detector: &dyn ProtocolDetector) -> &ProtocolBitmask {
        self.activation.get_or_init(|| {
            let mask = self.read().enabled_bitmask();
            detector.set_enabled_protocols(&mask);
            flow_info!(
                "rule table activated: {} protocols enabled for detector '{}'",
                mask.count(),
                detector.name()
            );
            mask
        })
    }

    /// 是否已激活
    pub fn is_activated(&self) -> bool {
        self.activation.get().is_some()
    }

    /// 激活时计算的位图
    pub fn enabled_protocols(&self) -> Option<&ProtocolBitmask> {
        self.activation.get()
    }

    /// 协议是否参与探测
    ///
    /// 激活前按当前规则判断。
    pub fn is_enabled(&self, id: ProtocolId) -> bool {
        match self.activation.get() {
            Some(mask) => mask.is_set(id),
            None => self.rule(id).map(|entry| entry.is_enabled()).unwrap_or(false),
        }
    }

    /// 记录一次首次分类结果，已知字段各计数一次
    pub fn record_resolution(&self, pair: &ProtocolPair) {
        for id in pair.known_ids() {
            if let Some(counter) = self.counters.get(id.index()) {
                counter.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// 协议计数
    pub fn counter(&self, id: ProtocolId) -> u64 {
        self.counters
            .get(id.index())
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 按协议规则改写标记值
    pub fn apply_mark(&self, value: u32, pair: &ProtocolPair, mode: MarkMode) -> u32 {
        let set = self.read();
        let rule = |id: ProtocolId| set.entry(id).copied();
        let mut value = value;
        match mode {
            MarkMode::Master => {
                if let Some(r) = rule(pair.master) {
                    value = (value & !r.mask) | r.mark;
                }
            }
            MarkMode::App => {
                if let Some(r) = rule(pair.app) {
                    value = (value & !r.mask) | r.mark;
                }
            }
            MarkMode::Any => {
                if !pair.master.is_unknown() {
                    if let Some(r) = rule(pair.master) {
                        value = (value & !r.mask) | r.mark;
                    }
                }
                if !pair.app.is_unknown() {
                    if let Some(r) = rule(pair.app) {
                        value = (value & !(r.mask << 16)) | (r.mark << 16);
                    }
                }
            }
        }
        value
    }

    /// 输出规则表和计数器
    pub fn dump(&self) -> String {
        let set = self.read();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "#id     mark ~mask     name   # count #version {}",
            crate::VERSION
        );
        for (id, name) in set.registry.iter() {
            let entry = &set.entries[id.index()];
            let count = self.counter(id);
            if entry.is_enabled() {
                let _ = writeln!(
                    out,
                    "{:02x}  {:8x}/{:08x} {:<16} # {} debug={}",
                    id.0, entry.mark, entry.mask, name, count, entry.debug_level
                );
            } else {
                let _ = writeln!(out, "{:02x}  {:>17} {:<16} # {}", id.0, "disabled", name, count);
            }
        }
        out
    }

    /// 打开管理会话
    ///
    /// 会话在一份规则集合副本上执行命令，提交时整体替换。
    pub fn open_session(&self) -> Result<RuleSession<'_>> {
        if self.session_open.swap(true, Ordering::AcqRel) {
            return Err(ClassifierError::session_busy("rules"));
        }
        Ok(RuleSession {
            table: self,
            staging: self.read().clone(),
            lines: 0,
        })
    }
}

/// 规则表管理会话
#[derive(Debug)]
pub struct RuleSession<'a> {
    table: &'a RuleTable,
    staging: RuleSet,
    lines: usize,
}

impl RuleSession<'_> {
    /// 执行一条命令
    pub fn apply_line(&mut self, line: &str) -> Result<()> {
        self.lines += 1;
        let activated = self.table.is_activated();
        self.staging
            .apply_command(line, activated)
            .map_err(|e| e.at_line(self.lines))
    }

    /// 暂存的规则集合
    pub fn staging(&self) -> &RuleSet {
        &self.staging
    }

    /// 提交会话
    pub fn commit(self) -> Result<()> {
        let mut live = self.table.live.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(active) = self.table.activation.get() {
            if self.staging.registry.len() != live.registry.len() {
                return Err(ClassifierError::consistency_conflict(
                    "classification became active, custom protocols rejected",
                ));
            }
            let disabled = live
                .registry
                .iter()
                .any(|(id, _)| active.is_set(id) && !self.staging.entries[id.index()].is_enabled());
            if disabled {
                return Err(ClassifierError::consistency_conflict(
                    "classification became active, can't disable protocol",
                ));
            }
        }
        *live = self.staging.clone();
        flow_debug!("rule session committed ({} lines)", self.lines);
        Ok(())
    }

    /// 放弃会话
    pub fn abort(self) {}
}

impl Drop for RuleSession<'_> {
    fn drop(&mut self) {
        self.table.session_open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ids;

    #[test]
    fn test_mark_without_mask_keeps_mask() {
        let mut set = RuleSet::default();
        set.apply_command("http 10", false).unwrap();
        let entry = set.entry(ids::HTTP).unwrap();
        assert_eq!(entry.mark, 0x10);
        assert_eq!(entry.mask, DEFAULT_MASK);

        set.apply_command("dns 5/ff # comment", false).unwrap();
        let entry = set.entry(ids::DNS).unwrap();
        assert_eq!((entry.mark, entry.mask), (5, 0xff));
    }

    #[test]
    fn test_any_skips_unknown() {
        let mut set = RuleSet::default();
        set.apply_command("any 7/ff", false).unwrap();
        assert_eq!(set.entry(ProtocolId::UNKNOWN).unwrap().mark, 0);
        assert_eq!(set.entry(ids::TLS).unwrap().mark, 7);

        set.apply_command("all 3/ff", false).unwrap();
        assert_eq!(set.entry(ProtocolId::UNKNOWN).unwrap().mark, 3);
    }

    #[test]
    fn test_hex_looking_name_resolves_by_name() {
        let mut set = RuleSet::default();
        let cafe = set.add_custom("cafe", false).unwrap();
        set.apply_command("cafe 42/ff", false).unwrap();
        assert_eq!(set.entry(cafe).unwrap().mark, 0x42);

        // 未注册为名称的十六进制仍按编号解析
        let hex = format!("{:x} 9/ff", ids::DNS.0);
        set.apply_command(&hex, false).unwrap();
        assert_eq!(set.entry(ids::DNS).unwrap().mark, 9);
        assert!(set.apply_command("ffff 1", false).is_err());
    }
}
