//! 查找路径基准

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use psi_flow::core::protocol::{ids, L4Proto, ProtocolRegistry};
use psi_flow::host::{HostAutomaton, HostTable};
use psi_flow::portrange::PortRangeClassifier;
use psi_flow::{EngineBuilder, FlowClassification, PacketInfo, PerPacketToken};
use std::net::IpAddr;

fn port_range_classifier(prefixes: u32) -> PortRangeClassifier {
    let classifier = PortRangeClassifier::new();
    let mut session = classifier.open_session(ProtocolRegistry::new()).unwrap();
    for i in 0..prefixes {
        let line = format!(
            "10.{}.{}.0/24 tcp:{}-{}:http udp:53:dns",
            i / 256,
            i % 256,
            1000 + i % 100,
            1100 + i % 100
        );
        session.apply_line(&line).unwrap();
    }
    session.commit().unwrap();
    classifier
}

fn port_range_lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("port_range_lookup");

    for size in [16u32, 1024, 16384].iter() {
        let classifier = port_range_classifier(*size);
        let addr: IpAddr = "10.0.7.9".parse().unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| black_box(classifier.lookup(black_box(addr), black_box(1050), L4Proto::Tcp)))
        });
    }

    group.finish();
}

fn host_lookup_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_lookup");

    for size in [16usize, 1024, 16384].iter() {
        let automaton = HostAutomaton::new();
        let mut table = HostTable::new();
        for i in 0..*size {
            table.add(&format!("svc{}.example.net", i), ids::TLS).unwrap();
        }
        automaton.install(table).unwrap();

        group.bench_with_input(BenchmarkId::new("hit", size), size, |b, _| {
            b.iter(|| black_box(automaton.lookup(black_box("edge.svc7.example.net"))))
        });
        group.bench_with_input(BenchmarkId::new("miss", size), size, |b, _| {
            b.iter(|| black_box(automaton.lookup(black_box("static.cdn.example.org"))))
        });
    }

    group.finish();
}

fn classify_fast_path_benchmark(c: &mut Criterion) {
    let engine = EngineBuilder::new()
        .add_port_ranges("0.0.0.0/0 udp:443:tls")
        .build()
        .unwrap();
    let flow = FlowClassification::new(L4Proto::Udp);
    let client: IpAddr = "10.0.0.2".parse().unwrap();
    let server: IpAddr = "10.0.0.1".parse().unwrap();
    let packet = PacketInfo::new((client, 50000), (server, 443), L4Proto::Udp, b"payload");
    engine.classify(&flow, &packet, &mut PerPacketToken::new());

    c.bench_function("classify_finalized", |b| {
        b.iter(|| black_box(engine.classify(&flow, &packet, &mut PerPacketToken::new())))
    });
}

criterion_group!(
    benches,
    port_range_lookup_benchmark,
    host_lookup_benchmark,
    classify_fast_path_benchmark
);
criterion_main!(benches);
