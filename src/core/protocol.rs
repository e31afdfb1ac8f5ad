//! 协议定义模块
//!
//! 定义协议编号、协议对（应用协议 + 主协议）、传输层协议以及协议名称注册表。

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 协议编号空间上限（含自定义协议）
pub const MAX_PROTOCOLS: usize = 512;

/// 协议编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct ProtocolId(pub u16);

impl ProtocolId {
    /// 未知协议
    pub const UNKNOWN: ProtocolId = ProtocolId(0);

    /// 是否为未知协议
    pub fn is_unknown(self) -> bool {
        self.0 == 0
    }

    /// 作为表下标
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// 协议对：应用协议与主（隧道）协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct ProtocolPair {
    /// 应用协议
    pub app: ProtocolId,
    /// 主协议
    pub master: ProtocolId,
}

impl ProtocolPair {
    /// 两个字段都未知的协议对
    pub const UNKNOWN: ProtocolPair = ProtocolPair {
        app: ProtocolId::UNKNOWN,
        master: ProtocolId::UNKNOWN,
    };

    /// 创建协议对
    pub fn new(app: ProtocolId, master: ProtocolId) -> Self {
        Self { app, master }
    }

    /// 只有应用协议的协议对
    pub fn app_only(app: ProtocolId) -> Self {
        Self {
            app,
            master: ProtocolId::UNKNOWN,
        }
    }

    /// 两个字段是否都未知
    pub fn is_unknown(&self) -> bool {
        self.app.is_unknown() && self.master.is_unknown()
    }

    /// 打包为 `app << 16 | master`
    pub fn pack(&self) -> u32 {
        ((self.app.0 as u32) << 16) | self.master.0 as u32
    }

    /// 从打包值还原
    pub fn unpack(packed: u32) -> Self {
        Self {
            app: ProtocolId((packed >> 16) as u16),
            master: ProtocolId((packed & 0xffff) as u16),
        }
    }

    /// 是否包含指定协议（任一字段）
    pub fn involves(&self, id: ProtocolId) -> bool {
        self.app == id || self.master == id
    }

    /// 已知字段，去重
    pub fn known_ids(&self) -> impl Iterator<Item = ProtocolId> {
        let app = (!self.app.is_unknown()).then_some(self.app);
        let master = (!self.master.is_unknown() && self.master != self.app).then_some(self.master);
        app.into_iter().chain(master)
    }
}

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Proto {
    /// TCP
    Tcp,
    /// UDP
    Udp,
    /// ICMP
    Icmp,
    /// ICMPv6
    Icmpv6,
    /// 其他IP协议号
    Other(u8),
}

impl L4Proto {
    /// 由IP协议号转换
    pub fn from_number(n: u8) -> Self {
        match n {
            6 => Self::Tcp,
            17 => Self::Udp,
            1 => Self::Icmp,
            58 => Self::Icmpv6,
            other => Self::Other(other),
        }
    }

    /// IP协议号
    pub fn number(self) -> u8 {
        match self {
            Self::Tcp => 6,
            Self::Udp => 17,
            Self::Icmp => 1,
            Self::Icmpv6 => 58,
            Self::Other(n) => n,
        }
    }

    /// 是否为ICMP族
    pub fn is_icmp(self) -> bool {
        matches!(self, Self::Icmp | Self::Icmpv6)
    }
}

impl fmt::Display for L4Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Icmp => write!(f, "icmp"),
            Self::Icmpv6 => write!(f, "icmpv6"),
            Self::Other(n) => write!(f, "ip{}", n),
        }
    }
}

/// 内置协议名称表，下标即协议编号
const BUILTIN_NAMES: &[&str] = &[
    "unknown", "ftp", "pop3", "smtp", "imap", "dns", "ipp", "http", "mdns", "ntp",
    "netbios", "nfs", "ssdp", "bgp", "snmp", "xdmcp", "smb", "syslog", "dhcp", "postgres",
    "mysql", "ssh", "telnet", "sip", "rtp", "rdp", "vnc", "bittorrent", "quic", "mqtt",
    "ldap", "kerberos", "radius", "openvpn", "ipsec", "gre", "icmp", "igmp", "icmpv6", "tls",
    "stun", "redis", "mongodb", "amqp", "coap", "http_proxy", "dot", "dhcpv6", "rtsp", "irc",
];

/// 内置协议编号常量
pub mod ids {
    use super::ProtocolId;

    /// FTP
    pub const FTP: ProtocolId = ProtocolId(1);
    /// SMTP
    pub const SMTP: ProtocolId = ProtocolId(3);
    /// DNS
    pub const DNS: ProtocolId = ProtocolId(5);
    /// HTTP
    pub const HTTP: ProtocolId = ProtocolId(7);
    /// NTP
    pub const NTP: ProtocolId = ProtocolId(9);
    /// SSH
    pub const SSH: ProtocolId = ProtocolId(21);
    /// QUIC
    pub const QUIC: ProtocolId = ProtocolId(28);
    /// MQTT
    pub const MQTT: ProtocolId = ProtocolId(29);
    /// IPsec
    pub const IPSEC: ProtocolId = ProtocolId(34);
    /// GRE
    pub const GRE: ProtocolId = ProtocolId(35);
    /// ICMP
    pub const ICMP: ProtocolId = ProtocolId(36);
    /// IGMP
    pub const IGMP: ProtocolId = ProtocolId(37);
    /// ICMPv6
    pub const ICMPV6: ProtocolId = ProtocolId(38);
    /// TLS
    pub const TLS: ProtocolId = ProtocolId(39);
}

static BUILTIN_REGISTRY: Lazy<ProtocolRegistry> = Lazy::new(|| {
    let mut registry = ProtocolRegistry {
        names: Vec::with_capacity(BUILTIN_NAMES.len()),
        by_name: HashMap::with_capacity(BUILTIN_NAMES.len()),
        builtin: BUILTIN_NAMES.len(),
    };
    for (i, name) in BUILTIN_NAMES.iter().enumerate() {
        registry.names.push((*name).to_string());
        registry.by_name.insert((*name).to_string(), ProtocolId(i as u16));
    }
    registry
});

/// 协议名称注册表
///
/// 内置协议占据低位编号，`add_custom`定义的协议依次追加，
/// 总数不超过 [`MAX_PROTOCOLS`]。
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    names: Vec<String>,
    by_name: HashMap<String, ProtocolId>,
    builtin: usize,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        BUILTIN_REGISTRY.clone()
    }
}

impl ProtocolRegistry {
    /// 创建只含内置协议的注册表
    pub fn new() -> Self {
        Self::default()
    }

    /// 已注册的协议数量
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// 注册表是否为空
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// 内置协议数量
    pub fn builtin_count(&self) -> usize {
        self.builtin
    }

    /// 按名称查找（不区分大小写）
    pub fn lookup(&self, name: &str) -> Option<ProtocolId> {
        self.by_name
            .get(name)
            .or_else(|| self.by_name.get(&name.to_ascii_lowercase()))
            .copied()
    }

    /// 按名称或十六进制编号解析
    pub fn resolve(&self, token: &str) -> Option<ProtocolId> {
        if let Some(id) = self.lookup(token) {
            return Some(id);
        }
        let hex = token.trim_start_matches("0x");
        u16::from_str_radix(hex, 16)
            .ok()
            .map(ProtocolId)
            .filter(|id| self.contains(*id))
    }

    /// 编号是否已注册
    pub fn contains(&self, id: ProtocolId) -> bool {
        id.index() < self.names.len()
    }

    /// 协议名称
    pub fn name(&self, id: ProtocolId) -> Option<&str> {
        self.names.get(id.index()).map(String::as_str)
    }

    /// 协议名称，未注册时返回十六进制编号
    pub fn display_name(&self, id: ProtocolId) -> String {
        self.name(id)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:#x}", id.0))
    }

    /// 注册自定义协议
    ///
    /// 名称已存在或编号空间耗尽时返回 `None`。
    pub fn register(&mut self, name: &str) -> Option<ProtocolId> {
        if self.lookup(name).is_some() || self.names.len() >= MAX_PROTOCOLS {
            return None;
        }
        let id = ProtocolId(self.names.len() as u16);
        self.names.push(name.to_string());
        self.by_name.insert(name.to_ascii_lowercase(), id);
        Some(id)
    }

    /// 遍历所有协议
    pub fn iter(&self) -> impl Iterator<Item = (ProtocolId, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, name)| (ProtocolId(i as u16), name.as_str()))
    }
}

/// 协议位图，记录哪些协议参与探测
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolBitmask {
    words: Vec<u64>,
}

impl Default for ProtocolBitmask {
    fn default() -> Self {
        Self {
            words: vec![0; MAX_PROTOCOLS / 64],
        }
    }
}

impl ProtocolBitmask {
    /// 创建空位图
    pub fn new() -> Self {
        Self::default()
    }

    /// 置位
    pub fn set(&mut self, id: ProtocolId) {
        if let Some(word) = self.words.get_mut(id.index() / 64) {
            *word |= 1u64 << (id.index() % 64);
        }
    }

    /// 清位
    pub fn clear(&mut self, id: ProtocolId) {
        if let Some(word) = self.words.get_mut(id.index() / 64) {
            *word &= !(1u64 << (id.index() % 64));
        }
    }

    /// 是否置位
    pub fn is_set(&self, id: ProtocolId) -> bool {
        self.words
            .get(id.index() / 64)
            .map(|word| word & (1u64 << (id.index() % 64)) != 0)
            .unwrap_or(false)
    }

    /// 置位数量
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let pair = ProtocolPair::new(ids::TLS, ids::QUIC);
        assert_eq!(pair.pack(), (39 << 16) | 28);
        assert_eq!(ProtocolPair::unpack(pair.pack()), pair);
    }

    #[test]
    fn test_builtin_names_match_ids() {
        let registry = ProtocolRegistry::new();
        assert_eq!(registry.lookup("tls"), Some(ids::TLS));
        assert_eq!(registry.lookup("icmp"), Some(ids::ICMP));
        assert_eq!(registry.lookup("icmpv6"), Some(ids::ICMPV6));
        assert_eq!(registry.lookup("http"), Some(ids::HTTP));
        assert_eq!(registry.lookup("dns"), Some(ids::DNS));
        assert_eq!(registry.resolve("27"), Some(ids::TLS));
        assert_eq!(registry.resolve("HTTP"), Some(ids::HTTP));
    }
}
