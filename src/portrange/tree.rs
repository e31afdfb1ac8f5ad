//! 前缀树
//!
//! 按前缀长度分层保存节点：更新时精确匹配，分类时最长前缀匹配。

use super::range::{PortRange, RangeOp, RangeTable};
use crate::core::protocol::{L4Proto, ProtocolId};
use ipnetwork::IpNetwork;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

/// 规范化后的前缀
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Prefix {
    /// 网络地址（已按前缀长度屏蔽主机位）
    pub network: IpAddr,
    /// 前缀长度
    pub len: u8,
}

impl Prefix {
    /// 由 `ipnetwork` 网络构造，屏蔽主机位
    pub fn from_network(net: IpNetwork) -> Self {
        Self {
            network: net.network(),
            len: net.prefix(),
        }
    }

    /// 解析 `addr[/len]`
    pub fn parse(text: &str) -> Option<Self> {
        text.parse::<IpNetwork>().ok().map(Self::from_network)
    }

    /// 地址族的最大前缀长度
    pub fn max_len(&self) -> u8 {
        match self.network {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        }
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.len < self.max_len() {
            write!(f, "{}/{}", self.network, self.len)
        } else {
            write!(f, "{}", self.network)
        }
    }
}

/// 前缀树节点上的端口范围数据
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRangeNode {
    /// 整个前缀的默认协议（`any:proto`）
    pub default_proto: Option<ProtocolId>,
    /// UDP端口范围
    pub udp: RangeTable,
    /// TCP端口范围
    pub tcp: RangeTable,
}

impl PortRangeNode {
    /// 节点是否已无内容
    pub fn is_empty(&self) -> bool {
        self.default_proto.is_none() && self.udp.is_empty() && self.tcp.is_empty()
    }

    /// 对应传输层协议的范围表
    pub fn table(&self, l4: L4Proto) -> Option<&RangeTable> {
        match l4 {
            L4Proto::Tcp => Some(&self.tcp),
            L4Proto::Udp => Some(&self.udp),
            _ => None,
        }
    }

    /// 对应传输层协议的可变范围表
    pub fn table_mut(&mut self, l4: L4Proto) -> Option<&mut RangeTable> {
        match l4 {
            L4Proto::Tcp => Some(&mut self.tcp),
            L4Proto::Udp => Some(&mut self.udp),
            _ => None,
        }
    }

    /// 更新指定传输层协议的范围表
    pub fn update(&mut self, l4: L4Proto, range: PortRange, op: RangeOp) -> bool {
        self.table_mut(l4)
            .map(|table| table.update(range, op))
            .unwrap_or(false)
    }

    /// 按端口查找：先查范围表，未命中时使用默认协议
    pub fn lookup(&self, port: u16, l4: L4Proto) -> ProtocolId {
        let hit = self
            .table(l4)
            .map(|table| table.lookup(port))
            .unwrap_or(ProtocolId::UNKNOWN);
        if hit.is_unknown() {
            self.default_proto.unwrap_or(ProtocolId::UNKNOWN)
        } else {
            hit
        }
    }
}

/// 按前缀长度分层的前缀树
#[derive(Debug, Clone, Default)]
pub struct PrefixTree {
    v4: BTreeMap<u8, HashMap<u32, PortRangeNode>>,
    v6: BTreeMap<u8, HashMap<u128, PortRangeNode>>,
}

fn mask_v4(addr: u32, len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        addr & (u32::MAX << (32 - len as u32))
    }
}

fn mask_v6(addr: u128, len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        addr & (u128::MAX << (128 - len as u32))
    }
}

impl PrefixTree {
    /// 创建空树
    pub fn new() -> Self {
        Self::default()
    }

    /// 节点数量
    pub fn len(&self) -> usize {
        self.v4.values().map(HashMap::len).sum::<usize>()
            + self.v6.values().map(HashMap::len).sum::<usize>()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 精确查找
    pub fn get(&self, prefix: &Prefix) -> Option<&PortRangeNode> {
        match prefix.network {
            IpAddr::V4(a) => self.v4.get(&prefix.len)?.get(&u32::from(a)),
            IpAddr::V6(a) => self.v6.get(&prefix.len)?.get(&u128::from(a)),
        }
    }

    /// 精确查找（可变）
    pub fn get_mut(&mut self, prefix: &Prefix) -> Option<&mut PortRangeNode> {
        match prefix.network {
            IpAddr::V4(a) => self.v4.get_mut(&prefix.len)?.get_mut(&u32::from(a)),
            IpAddr::V6(a) => self.v6.get_mut(&prefix.len)?.get_mut(&u128::from(a)),
        }
    }

    /// 精确查找，不存在时创建
    pub fn entry(&mut self, prefix: &Prefix) -> &mut PortRangeNode {
        match prefix.network {
            IpAddr::V4(a) => self
                .v4
                .entry(prefix.len)
                .or_default()
                .entry(u32::from(a))
                .or_default(),
            IpAddr::V6(a) => self
                .v6
                .entry(prefix.len)
                .or_default()
                .entry(u128::from(a))
                .or_default(),
        }
    }

    /// 删除节点
    pub fn remove(&mut self, prefix: &Prefix) -> Option<PortRangeNode> {
        match prefix.network {
            IpAddr::V4(a) => {
                let level = self.v4.get_mut(&prefix.len)?;
                let node = level.remove(&u32::from(a));
                if level.is_empty() {
                    self.v4.remove(&prefix.len);
                }
                node
            }
            IpAddr::V6(a) => {
                let level = self.v6.get_mut(&prefix.len)?;
                let node = level.remove(&u128::from(a));
                if level.is_empty() {
                    self.v6.remove(&prefix.len);
                }
                node
            }
        }
    }

    /// 最长前缀匹配
    pub fn best_match(&self, addr: IpAddr) -> Option<(Prefix, &PortRangeNode)> {
        match addr {
            IpAddr::V4(a) => {
                let bits = u32::from(a);
                self.v4.iter().rev().find_map(|(len, level)| {
                    let net = mask_v4(bits, *len);
                    level.get(&net).map(|node| {
                        let prefix = Prefix {
                            network: IpAddr::V4(net.into()),
                            len: *len,
                        };
                        (prefix, node)
                    })
                })
            }
            IpAddr::V6(a) => {
                let bits = u128::from(a);
                self.v6.iter().rev().find_map(|(len, level)| {
                    let net = mask_v6(bits, *len);
                    level.get(&net).map(|node| {
                        let prefix = Prefix {
                            network: IpAddr::V6(net.into()),
                            len: *len,
                        };
                        (prefix, node)
                    })
                })
            }
        }
    }

    /// 按前缀排序遍历所有节点
    pub fn iter_sorted(&self) -> Vec<(Prefix, &PortRangeNode)> {
        let mut nodes: Vec<(Prefix, &PortRangeNode)> = self
            .v4
            .iter()
            .flat_map(|(len, level)| {
                level.iter().map(move |(net, node)| {
                    (
                        Prefix {
                            network: IpAddr::V4((*net).into()),
                            len: *len,
                        },
                        node,
                    )
                })
            })
            .chain(self.v6.iter().flat_map(|(len, level)| {
                level.iter().map(move |(net, node)| {
                    (
                        Prefix {
                            network: IpAddr::V6((*net).into()),
                            len: *len,
                        },
                        node,
                    )
                })
            }))
            .collect();
        nodes.sort_by(|a, b| a.0.cmp(&b.0));
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_longest_prefix_wins() {
        let mut tree = PrefixTree::new();
        tree.entry(&Prefix::parse("10.0.0.0/8").unwrap()).default_proto = Some(ProtocolId(5));
        tree.entry(&Prefix::parse("10.1.0.0/16").unwrap()).default_proto = Some(ProtocolId(7));

        let (prefix, node) = tree.best_match("10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(prefix.len, 16);
        assert_eq!(node.default_proto, Some(ProtocolId(7)));

        let (prefix, _) = tree.best_match("10.2.0.1".parse().unwrap()).unwrap();
        assert_eq!(prefix.len, 8);
        assert!(tree.best_match("192.168.0.1".parse().unwrap()).is_none());
    }

    #[test]
    fn test_host_bits_are_masked() {
        let prefix = Prefix::parse("192.168.1.77/24").unwrap();
        assert_eq!(prefix.to_string(), "192.168.1.0/24");
        assert_eq!(Prefix::parse("2001:db8::1").unwrap().to_string(), "2001:db8::1");
    }
}
