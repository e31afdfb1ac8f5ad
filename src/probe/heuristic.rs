//! 端口启发式
//!
//! 按知名端口和传输层协议号猜测协议。只在探测器和端口范围都没有结果时使用，
//! 结果仅作参考：流水线会在未知阈值之后把它当作最终结果。

use super::{CanonicalTuple, FallbackProbe, ProbeType};
use crate::core::protocol::{ids, L4Proto, ProtocolId, ProtocolPair, ProtocolRegistry};
use std::collections::HashMap;

/// 知名端口表：(传输层, 端口, 协议名)
const WELL_KNOWN_PORTS: &[(L4Proto, u16, &str)] = &[
    (L4Proto::Tcp, 21, "ftp"),
    (L4Proto::Tcp, 22, "ssh"),
    (L4Proto::Tcp, 23, "telnet"),
    (L4Proto::Tcp, 25, "smtp"),
    (L4Proto::Tcp, 53, "dns"),
    (L4Proto::Udp, 53, "dns"),
    (L4Proto::Udp, 67, "dhcp"),
    (L4Proto::Udp, 68, "dhcp"),
    (L4Proto::Tcp, 80, "http"),
    (L4Proto::Tcp, 88, "kerberos"),
    (L4Proto::Udp, 88, "kerberos"),
    (L4Proto::Tcp, 110, "pop3"),
    (L4Proto::Udp, 123, "ntp"),
    (L4Proto::Udp, 137, "netbios"),
    (L4Proto::Udp, 138, "netbios"),
    (L4Proto::Tcp, 139, "netbios"),
    (L4Proto::Tcp, 143, "imap"),
    (L4Proto::Udp, 161, "snmp"),
    (L4Proto::Udp, 162, "snmp"),
    (L4Proto::Udp, 177, "xdmcp"),
    (L4Proto::Tcp, 179, "bgp"),
    (L4Proto::Tcp, 194, "irc"),
    (L4Proto::Tcp, 389, "ldap"),
    (L4Proto::Tcp, 443, "tls"),
    (L4Proto::Udp, 443, "quic"),
    (L4Proto::Tcp, 445, "smb"),
    (L4Proto::Udp, 500, "ipsec"),
    (L4Proto::Udp, 514, "syslog"),
    (L4Proto::Udp, 546, "dhcpv6"),
    (L4Proto::Udp, 547, "dhcpv6"),
    (L4Proto::Tcp, 554, "rtsp"),
    (L4Proto::Tcp, 631, "ipp"),
    (L4Proto::Tcp, 853, "dot"),
    (L4Proto::Tcp, 1194, "openvpn"),
    (L4Proto::Udp, 1194, "openvpn"),
    (L4Proto::Udp, 1812, "radius"),
    (L4Proto::Udp, 1813, "radius"),
    (L4Proto::Tcp, 1883, "mqtt"),
    (L4Proto::Udp, 1900, "ssdp"),
    (L4Proto::Tcp, 2049, "nfs"),
    (L4Proto::Udp, 2049, "nfs"),
    (L4Proto::Tcp, 3128, "http_proxy"),
    (L4Proto::Tcp, 3306, "mysql"),
    (L4Proto::Tcp, 3389, "rdp"),
    (L4Proto::Udp, 3478, "stun"),
    (L4Proto::Udp, 4500, "ipsec"),
    (L4Proto::Udp, 5060, "sip"),
    (L4Proto::Tcp, 5060, "sip"),
    (L4Proto::Tcp, 5432, "postgres"),
    (L4Proto::Udp, 5353, "mdns"),
    (L4Proto::Udp, 5683, "coap"),
    (L4Proto::Tcp, 5672, "amqp"),
    (L4Proto::Tcp, 5900, "vnc"),
    (L4Proto::Tcp, 6379, "redis"),
    (L4Proto::Tcp, 6881, "bittorrent"),
    (L4Proto::Udp, 6881, "bittorrent"),
    (L4Proto::Tcp, 8080, "http_proxy"),
    (L4Proto::Tcp, 27017, "mongodb"),
];

/// 端口启发式探测
#[derive(Debug, Clone)]
pub struct PortHeuristic {
    tcp: HashMap<u16, ProtocolId>,
    udp: HashMap<u16, ProtocolId>,
}

impl PortHeuristic {
    /// 使用内置知名端口表创建
    pub fn new() -> Self {
        let registry = ProtocolRegistry::new();
        let mut heuristic = Self {
            tcp: HashMap::new(),
            udp: HashMap::new(),
        };
        for (l4, port, name) in WELL_KNOWN_PORTS {
            if let Some(id) = registry.lookup(name) {
                heuristic.add_port(*l4, *port, id);
            }
        }
        heuristic
    }

    /// 添加或覆盖一个端口
    pub fn add_port(&mut self, l4: L4Proto, port: u16, proto: ProtocolId) {
        match l4 {
            L4Proto::Tcp => {
                self.tcp.insert(port, proto);
            }
            L4Proto::Udp => {
                self.udp.insert(port, proto);
            }
            _ => {}
        }
    }

    /// 查端口表
    fn by_port(&self, l4: L4Proto, port: u16) -> Option<ProtocolId> {
        let table = match l4 {
            L4Proto::Tcp => &self.tcp,
            L4Proto::Udp => &self.udp,
            _ => return None,
        };
        table.get(&port).copied()
    }

    /// 按传输层协议号猜测
    fn by_transport(l4: L4Proto) -> Option<ProtocolId> {
        match l4 {
            L4Proto::Icmp => Some(ids::ICMP),
            L4Proto::Icmpv6 => Some(ids::ICMPV6),
            L4Proto::Other(2) => Some(ids::IGMP),
            L4Proto::Other(47) => Some(ids::GRE),
            L4Proto::Other(50) | L4Proto::Other(51) => Some(ids::IPSEC),
            _ => None,
        }
    }
}

impl Default for PortHeuristic {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackProbe for PortHeuristic {
    fn guess(&self, tuple: &CanonicalTuple) -> ProtocolPair {
        let guessed = Self::by_transport(tuple.l4)
            .or_else(|| self.by_port(tuple.l4, tuple.low_port))
            .or_else(|| self.by_port(tuple.l4, tuple.high_port));
        guessed.map(ProtocolPair::app_only).unwrap_or(ProtocolPair::UNKNOWN)
    }

    fn probe_type(&self) -> ProbeType {
        ProbeType::Port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn tuple(l4: L4Proto, a: u16, b: u16) -> CanonicalTuple {
        let x: IpAddr = "192.168.1.10".parse().unwrap();
        let y: IpAddr = "8.8.8.8".parse().unwrap();
        CanonicalTuple::new(l4, x, a, y, b)
    }

    #[test]
    fn test_low_port_wins() {
        let probe = PortHeuristic::new();
        let pair = probe.guess(&tuple(L4Proto::Tcp, 50000, 22));
        assert_eq!(pair.app, ids::SSH);
        let pair = probe.guess(&tuple(L4Proto::Udp, 443, 53));
        assert_eq!(pair.app, ids::DNS);
    }

    #[test]
    fn test_transport_guess() {
        let probe = PortHeuristic::new();
        assert_eq!(probe.guess(&tuple(L4Proto::Other(47), 0, 0)).app, ids::GRE);
        assert_eq!(probe.guess(&tuple(L4Proto::Other(50), 0, 0)).app, ids::IPSEC);
        assert!(probe.guess(&tuple(L4Proto::Tcp, 40000, 40001)).is_unknown());
    }

    #[test]
    fn test_custom_port() {
        let mut probe = PortHeuristic::new();
        probe.add_port(L4Proto::Tcp, 9999, ids::HTTP);
        assert_eq!(probe.guess(&tuple(L4Proto::Tcp, 9999, 60000)).app, ids::HTTP);
    }
}
