//! 协议核心模块测试

use psi_flow::core::protocol::*;

#[test]
fn test_pair_pack_layout() {
    let pair = ProtocolPair::new(ids::HTTP, ids::TLS);
    let packed = pair.pack();
    assert_eq!(ProtocolPair::unpack(packed), pair);
    assert_eq!(ProtocolPair::UNKNOWN.pack(), 0);
}

#[test]
fn test_pair_properties() {
    let pair = ProtocolPair::app_only(ids::DNS);
    assert!(!pair.is_unknown());
    assert!(pair.involves(ids::DNS));
    assert!(!pair.involves(ids::TLS));
    assert_eq!(pair.known_ids().collect::<Vec<_>>(), vec![ids::DNS]);

    let both = ProtocolPair::new(ids::HTTP, ids::TLS);
    assert_eq!(both.known_ids().count(), 2);
}

#[test]
fn test_registry_lookup() {
    let registry = ProtocolRegistry::new();
    assert_eq!(registry.lookup("tls"), Some(ids::TLS));
    assert_eq!(registry.lookup("TLS"), Some(ids::TLS));
    assert_eq!(registry.resolve("27"), Some(ids::TLS));
    assert_eq!(registry.resolve("0x7"), Some(ids::HTTP));
    assert_eq!(registry.lookup("nope"), None);
    assert_eq!(registry.name(ids::DNS), Some("dns"));
    assert_eq!(registry.display_name(ProtocolId(500)), "0x1f4");
}

#[test]
fn test_registry_custom_protocols() {
    let mut registry = ProtocolRegistry::new();
    let builtin = registry.builtin_count();
    let id = registry.register("Video").unwrap();
    assert_eq!(id.index(), builtin);
    assert_eq!(registry.lookup("video"), Some(id));
    assert!(registry.register("video").is_none());
    assert!(registry.contains(id));
    assert_eq!(registry.len(), builtin + 1);
}

#[test]
fn test_bitmask() {
    let mut mask = ProtocolBitmask::new();
    assert_eq!(mask.count(), 0);
    mask.set(ids::HTTP);
    mask.set(ids::TLS);
    mask.set(ProtocolId((MAX_PROTOCOLS - 1) as u16));
    assert!(mask.is_set(ids::HTTP));
    assert_eq!(mask.count(), 3);
    mask.clear(ids::HTTP);
    assert!(!mask.is_set(ids::HTTP));
}

#[test]
fn test_l4_numbers() {
    assert_eq!(L4Proto::from_number(6), L4Proto::Tcp);
    assert_eq!(L4Proto::from_number(17), L4Proto::Udp);
    assert!(L4Proto::from_number(1).is_icmp());
    assert!(L4Proto::from_number(58).is_icmp());
    assert_eq!(L4Proto::from_number(47).number(), 47);
}
