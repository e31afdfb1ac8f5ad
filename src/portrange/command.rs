//! 端口范围管理命令
//!
//! ```text
//! [-|+]prefix rule [rule ...]
//! rule := [-][[(tcp|udp|any):]port[-port]:]protocol
//! ```

use super::range::{PortRange, RangeOp};
use super::tree::{Prefix, PrefixTree};
use crate::core::protocol::{L4Proto, ProtocolId, ProtocolRegistry};
use crate::error::{ClassifierError, Result};

/// 规则中的传输层选择
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Selector {
    /// 仅TCP
    Tcp,
    /// 仅UDP
    Udp,
    /// TCP和UDP
    Any,
}

impl L4Selector {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    fn protocols(self) -> &'static [L4Proto] {
        match self {
            Self::Tcp => &[L4Proto::Tcp],
            Self::Udp => &[L4Proto::Udp],
            Self::Any => &[L4Proto::Udp, L4Proto::Tcp],
        }
    }
}

/// 协议目标：具体协议或 `any`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoTarget {
    /// 具体协议
    Id(ProtocolId),
    /// 任意协议（只用于删除）
    Any,
}

/// 解析后的单条规则
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRule {
    /// 是否删除
    pub delete: bool,
    /// 传输层选择
    pub l4: L4Selector,
    /// 端口范围，`None` 表示 `any`
    pub ports: Option<(u16, u16)>,
    /// 是否显式给出了端口部分
    pub has_ports: bool,
    /// 协议
    pub proto: ProtoTarget,
}

/// 解析后的一行命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCommand {
    /// 前缀
    pub prefix: Prefix,
    /// 规则列表
    pub rules: Vec<RangeRule>,
}

fn syntax<S: Into<String>>(message: S) -> ClassifierError {
    ClassifierError::syntax(0, message)
}

fn parse_port(token: &str) -> Result<u16> {
    let value: u32 = token
        .parse()
        .map_err(|_| syntax(format!("bad port '{}'", token)))?;
    u16::try_from(value).map_err(|_| syntax(format!("port {} out of range", value)))
}

/// 解析 `port`、`port-port` 或 `any`
fn parse_port_range(token: &str) -> Result<Option<(u16, u16)>> {
    if token == "any" {
        return Ok(None);
    }
    let (start, end) = match token.split_once('-') {
        Some((a, b)) => (parse_port(a)?, parse_port(b)?),
        None => {
            let p = parse_port(token)?;
            (p, p)
        }
    };
    Ok(Some(if start <= end { (start, end) } else { (end, start) }))
}

fn parse_proto(token: &str, registry: &ProtocolRegistry) -> Result<ProtoTarget> {
    if token.is_empty() {
        return Err(syntax("missing protocol"));
    }
    if token == "any" {
        return Ok(ProtoTarget::Any);
    }
    registry
        .lookup(token)
        .map(ProtoTarget::Id)
        .ok_or_else(|| ClassifierError::unknown_protocol(token))
}

/// 解析单条规则
pub fn parse_rule(token: &str, prefix_delete: bool, registry: &ProtocolRegistry) -> Result<RangeRule> {
    let (delete, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (prefix_delete, token),
    };

    let parts: Vec<&str> = body.split(':').collect();
    let (l4, ports, has_ports, proto) = match parts.as_slice() {
        [proto] => (L4Selector::Any, None, false, *proto),
        [first, proto] => match parse_port_range(first) {
            Ok(ports) => (L4Selector::Any, ports, true, *proto),
            Err(port_err) => {
                // l4:proto 覆盖整个端口空间
                let l4 = L4Selector::parse(first).ok_or(port_err)?;
                (l4, Some((1, u16::MAX)), true, *proto)
            }
        },
        [l4, ports, proto] => {
            let l4 = L4Selector::parse(l4)
                .ok_or_else(|| syntax(format!("bad l4 protocol '{}'", l4)))?;
            (l4, parse_port_range(ports)?, true, *proto)
        }
        _ => return Err(syntax(format!("bad rule '{}'", token))),
    };

    Ok(RangeRule {
        delete,
        l4,
        ports,
        has_ports,
        proto: parse_proto(proto, registry)?,
    })
}

/// 解析一行命令，注释和空行返回 `None`
pub fn parse_line(line: &str, registry: &ProtocolRegistry) -> Result<Option<RangeCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let (prefix_delete, line) = match line.as_bytes()[0] {
        b'-' => (true, &line[1..]),
        b'+' => (false, &line[1..]),
        _ => (false, line),
    };

    let mut tokens = line.split_whitespace();
    let addr = tokens.next().ok_or_else(|| syntax("missing prefix"))?;
    let prefix = Prefix::parse(addr).ok_or_else(|| syntax(format!("bad prefix '{}'", addr)))?;

    let rules = tokens
        .map(|token| parse_rule(token, prefix_delete, registry))
        .collect::<Result<Vec<_>>>()?;
    if rules.is_empty() {
        return Err(syntax(format!("no rules for prefix {}", prefix)));
    }

    Ok(Some(RangeCommand { prefix, rules }))
}

/// 在前缀树上执行一条规则
pub fn apply_rule(tree: &mut PrefixTree, prefix: &Prefix, rule: &RangeRule) -> Result<()> {
    if rule.delete {
        apply_delete(tree, prefix, rule);
        return Ok(());
    }

    let proto = match rule.proto {
        ProtoTarget::Id(id) if !id.is_unknown() => id,
        _ => return Err(syntax("insert requires a known protocol")),
    };

    let node = tree.entry(prefix);
    match (rule.ports, rule.has_ports, rule.l4) {
        // proto 或 any:any:proto 设置前缀默认协议
        (None, false, _) | (None, true, L4Selector::Any) => {
            node.default_proto = Some(proto);
        }
        (ports, _, l4) => {
            let (start, end) = ports.unwrap_or((1, u16::MAX));
            let range = PortRange::new(start, end, proto);
            for l4 in l4.protocols() {
                node.update(*l4, range, RangeOp::Insert);
            }
        }
    }
    Ok(())
}

fn apply_delete(tree: &mut PrefixTree, prefix: &Prefix, rule: &RangeRule) {
    let Some(node) = tree.get_mut(prefix) else {
        return;
    };

    match (rule.ports, rule.has_ports, rule.proto) {
        // -prefix any：删除整个节点
        (None, false, ProtoTarget::Any) => {
            tree.remove(prefix);
            return;
        }
        // -prefix proto：清除匹配的默认协议
        (None, false, ProtoTarget::Id(id)) => {
            if node.default_proto == Some(id) {
                node.default_proto = None;
            }
        }
        (None, true, proto) if rule.l4 == L4Selector::Any => {
            let matches = match proto {
                ProtoTarget::Any => true,
                ProtoTarget::Id(id) => node.default_proto == Some(id),
            };
            if matches {
                node.default_proto = None;
            }
        }
        (ports, _, proto) => {
            let (start, end) = ports.unwrap_or((1, u16::MAX));
            let (id, any_protocol) = match proto {
                ProtoTarget::Id(id) => (id, false),
                ProtoTarget::Any => (ProtocolId::UNKNOWN, true),
            };
            let range = PortRange::new(start, end, id);
            for l4 in rule.l4.protocols() {
                node.update(*l4, range, RangeOp::Delete { any_protocol });
            }
        }
    }

    if tree.get(prefix).map(|node| node.is_empty()).unwrap_or(false) {
        tree.remove(prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::ids;

    #[test]
    fn test_rule_forms() {
        let registry = ProtocolRegistry::new();

        let rule = parse_rule("tcp:80-81:http", false, &registry).unwrap();
        assert_eq!(rule.l4, L4Selector::Tcp);
        assert_eq!(rule.ports, Some((80, 81)));
        assert_eq!(rule.proto, ProtoTarget::Id(ids::HTTP));

        let rule = parse_rule("443:tls", false, &registry).unwrap();
        assert_eq!(rule.l4, L4Selector::Any);
        assert_eq!(rule.ports, Some((443, 443)));

        let rule = parse_rule("udp:dns", false, &registry).unwrap();
        assert_eq!(rule.ports, Some((1, 65535)));

        let rule = parse_rule("-54-53:dns", false, &registry).unwrap();
        assert!(rule.delete);
        assert_eq!(rule.ports, Some((53, 54)));

        let rule = parse_rule("ssh", false, &registry).unwrap();
        assert!(!rule.has_ports);
    }

    #[test]
    fn test_rule_errors() {
        let registry = ProtocolRegistry::new();
        assert!(parse_rule("tcp:70000:http", false, &registry).is_err());
        assert!(parse_rule("sctp:80:http", false, &registry).is_err());
        assert!(parse_rule("80:nosuchproto", false, &registry).is_err());
        assert!(parse_rule("a:b:c:d", false, &registry).is_err());
        assert!(parse_line("10.0.0.1", &registry).is_err());
        assert!(parse_line("not-an-ip 80:http", &registry).is_err());
        assert_eq!(parse_line("# comment", &registry).unwrap(), None);
    }
}
