//! 管理会话测试

use psi_flow::*;
use std::net::IpAddr;
use std::sync::Arc;

fn engine() -> ClassificationEngine {
    EngineBuilder::new()
        .with_detector(Arc::new(NullDetector))
        .without_gc_thread()
        .build()
        .unwrap()
}

fn activate(engine: &ClassificationEngine) {
    let ip: IpAddr = "10.0.0.1".parse().unwrap();
    let flow = FlowClassification::new(L4Proto::Udp);
    let packet = PacketInfo::new((ip, 1000), (ip, 2000), L4Proto::Udp, b"x");
    engine.classify(&flow, &packet, &mut PerPacketToken::new());
    engine.release_flow(&flow);
}

#[test]
fn test_partial_writes_are_buffered() {
    let engine = engine();
    let mut session = engine.open_admin(AdminChannel::PortRanges).unwrap();
    session.write(b"10.0.0.0/8 udp:5").unwrap();
    assert_eq!(session.lines(), 0);
    session.write(b"3:dns\n10.1.0.0/16 tcp:80:ht").unwrap();
    assert_eq!(session.lines(), 1);
    session.write(b"tp\0").unwrap();
    assert_eq!(session.lines(), 2);
    session.write(b"192.168.0.0/16 ssh").unwrap();
    session.commit().unwrap();

    let ports = engine.port_ranges();
    assert_eq!(ports.lookup("10.9.9.9".parse().unwrap(), 53, L4Proto::Udp), ids::DNS);
    assert_eq!(ports.lookup("10.1.2.3".parse().unwrap(), 80, L4Proto::Tcp), ids::HTTP);
    assert_eq!(ports.lookup("192.168.1.1".parse().unwrap(), 9, L4Proto::Tcp), ids::SSH);
    assert!(engine.port_range_dump().contains("udp:53:dns"));
}

#[test]
fn test_failed_session_leaves_live_tables() {
    let engine = engine();
    let mut session = engine.open_admin(AdminChannel::Hosts).unwrap();
    session.write(b"http:a.test\nbogus\nhttp:b.test\n").unwrap_err();
    assert!(session.is_failed());
    assert!(matches!(session.commit(), Err(ClassifierError::SessionClosed { .. })));
    assert_eq!(engine.hosts().lookup("a.test"), None);

    let mut session = engine.open_admin(AdminChannel::Hosts).unwrap();
    session.apply_line("http:a.test").unwrap();
    session.commit().unwrap();
    assert_eq!(engine.hosts().lookup("a.test"), Some(ids::HTTP));
    assert!(engine.host_listing().contains("http:a.test"));
}

#[test]
fn test_abort_discards_staging() {
    let engine = engine();
    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    session.apply_line("http 77").unwrap();
    session.abort();
    assert_eq!(engine.rules().rule(ids::HTTP).unwrap().mark, ids::HTTP.0 as u32);
}

#[test]
fn test_one_session_per_channel() {
    let engine = engine();
    let rules = engine.open_admin(AdminChannel::Rules).unwrap();
    assert!(matches!(
        engine.open_admin(AdminChannel::Rules),
        Err(ClassifierError::SessionBusy { .. })
    ));
    let hosts = engine.open_admin(AdminChannel::Hosts).unwrap();
    assert_eq!(hosts.channel(), AdminChannel::Hosts);
    rules.abort();
    assert!(engine.open_admin(AdminChannel::Rules).is_ok());
}

#[test]
fn test_rule_commands() {
    let engine = engine();
    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    session
        .write(b"http 100/ff00\ndns debug 2\n# comment\nssh disable\nadd_custom video\n")
        .unwrap();
    session.commit().unwrap();

    let rules = engine.rules();
    let http = rules.rule(ids::HTTP).unwrap();
    assert_eq!((http.mark, http.mask), (0x100, 0xff00));
    assert_eq!(rules.debug_level(ids::DNS), 2);
    assert!(!rules.rule(ids::SSH).unwrap().is_enabled());
    assert!(rules.lookup("video").is_some());

    let dump = engine.rules_dump();
    assert!(dump.starts_with("#id"));
    assert!(dump.contains("disabled"));
    assert!(dump.contains("video"));

    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    session.apply_line("init").unwrap();
    session.commit().unwrap();
    assert!(engine.rules().rule(ids::SSH).unwrap().is_enabled());
}

#[test]
fn test_rule_syntax_errors() {
    let engine = engine();
    for line in ["http", "http zz", "http debug 9", "nosuch 10", "all disable", "add_custom bad:name"] {
        let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
        assert!(session.apply_line(line).is_err(), "accepted {:?}", line);
        session.abort();
    }
}

#[test]
fn test_activation_is_idempotent_and_freezes_rules() {
    let engine = engine();
    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    session.apply_line("ssh disable").unwrap();
    session.commit().unwrap();

    assert!(!engine.rules().is_activated());
    activate(&engine);
    activate(&engine);
    let enabled = engine.rules().enabled_protocols().unwrap().clone();
    assert!(!enabled.is_set(ids::SSH));
    assert!(enabled.is_set(ids::HTTP));

    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    assert!(matches!(
        session.apply_line("http disable"),
        Err(ClassifierError::ConsistencyConflict { .. })
    ));
    session.abort();

    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    assert!(matches!(
        session.apply_line("add_custom late"),
        Err(ClassifierError::ConsistencyConflict { .. })
    ));
    session.abort();

    // 改写标记仍然允许
    let mut session = engine.open_admin(AdminChannel::Rules).unwrap();
    session.apply_line("http 55").unwrap();
    session.commit().unwrap();
    assert_eq!(engine.rules().rule(ids::HTTP).unwrap().mark, 0x55);
    assert_eq!(engine.rules().enabled_protocols(), Some(&enabled));
    assert!(engine.rules().set_rule(ids::DNS, 0, 0).is_err());
}
