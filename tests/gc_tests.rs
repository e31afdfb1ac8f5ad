//! 临时子流表与回收测试

use psi_flow::gc::{EphemeralTable, GcTimer};
use psi_flow::{EngineBuilder, NullDetector};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn peer(i: u32) -> (IpAddr, u16) {
    (IpAddr::from((0x0a00_0000u32 + i / 7).to_be_bytes()), 1024 + (i % 7) as u16)
}

#[test]
fn test_full_cycle_evicts_expired() {
    let table = EphemeralTable::with_size_kb(1, 10, 128).unwrap();
    let start = 1_000;
    for i in 0..1000 {
        let (addr, port) = peer(i);
        table.touch(addr, port, 0, start);
    }
    assert_eq!(table.occupancy(), 1000);

    // 未超时的记录保留
    table.sweep_full_cycle(start + 10);
    assert_eq!(table.occupancy(), 1000);

    let removed = table.sweep_full_cycle(start + 11);
    assert_eq!(removed, 1000);
    assert_eq!(table.occupancy(), 0);
    assert_eq!(table.evicted(), 1000);
}

#[test]
fn test_touch_refreshes_entry() {
    let table = EphemeralTable::with_buckets(64, 10, 8);
    let (addr, port) = peer(1);
    assert_eq!(table.touch(addr, port, 0x1, 100), 1);
    assert_eq!(table.touch(addr, port, 0x2, 105), 2);
    let entry = table.get(addr, port).unwrap();
    assert_eq!(entry.flag, 0x2);
    assert_eq!(entry.last_change, 105);

    table.sweep_full_cycle(112);
    assert_eq!(table.occupancy(), 1);
    table.sweep_full_cycle(116);
    assert!(table.get(addr, port).is_none());
}

#[test]
fn test_incremental_sweep_visits_slices() {
    let table = EphemeralTable::with_buckets(100, 1, 10);
    assert_eq!(table.buckets_per_tick(), 10);
    assert_eq!(table.ticks_per_cycle(), 10);
    for i in 0..500 {
        let (addr, port) = peer(i);
        table.touch(addr, port, 0, 0);
    }
    let first = table.sweep_tick(5);
    assert!(first < 500);
    let rest: usize = (1..10).map(|_| table.sweep_tick(5)).sum();
    assert_eq!(first + rest, 500);
}

#[test]
fn test_summary_and_dumps() {
    let table = EphemeralTable::with_buckets(16, 30, 4);
    let (addr, port) = peer(3);
    table.touch(addr, port, 0xab, 50);

    let summary = table.summary();
    assert_eq!(summary.size, 16);
    assert_eq!(summary.count, 1);
    assert_eq!(summary.max_bucket, 1);
    let text = summary.to_string();
    assert!(text.starts_with("hash_size 16 hash timeout 30s count 1"));

    let histogram = table.histogram(0).unwrap();
    assert!(histogram.starts_with("0:\t"));
    let index = (0..16)
        .find(|i| table.bucket_dump(*i, 60).unwrap().contains("len 1"))
        .unwrap();
    let dump = table.bucket_dump(index, 60).unwrap();
    assert!(dump.contains(&format!("{}:{} 10 ab 1", addr, port)));
    assert!(table.bucket_dump(16, 60).is_none());
}

#[test]
fn test_timer_drives_sweeps() {
    let table = Arc::new(EphemeralTable::with_buckets(8, 1, 2));
    let (addr, port) = peer(9);
    table.touch(addr, port, 0, 0);

    let clock = Arc::new(AtomicU64::new(100));
    let ticks = Arc::clone(&clock);
    let mut timer = GcTimer::start(Arc::clone(&table), Duration::from_millis(5), move || {
        ticks.load(Ordering::Relaxed)
    })
    .unwrap();
    assert!(timer.is_running());

    let deadline = Instant::now() + Duration::from_secs(5);
    while table.occupancy() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(table.occupancy(), 0);
    timer.stop();
    assert!(!timer.is_running());
}

#[test]
fn test_engine_tracks_ephemeral_peers() {
    let engine = EngineBuilder::new()
        .with_detector(Arc::new(NullDetector))
        .with_ephemeral_hash(1, Duration::from_secs(10))
        .without_gc_thread()
        .build()
        .unwrap();
    let (addr, port) = peer(0);
    assert_eq!(engine.track_ephemeral_at(addr, port, 1, 100), Some(1));
    assert_eq!(engine.track_ephemeral_at(addr, port, 1, 101), Some(2));
    assert_eq!(engine.stats_snapshot().ephemeral_entries, 1);

    let table = engine.ephemeral().unwrap();
    table.sweep_full_cycle(200);
    assert_eq!(engine.ephemeral_summary().unwrap().gc_count, 1);

    let disabled = EngineBuilder::new().without_gc_thread().build().unwrap();
    assert_eq!(disabled.track_ephemeral(addr, port, 1), None);
}

#[cfg(feature = "runtime-tokio")]
#[tokio::test]
async fn test_tokio_gc_task() {
    let table = Arc::new(EphemeralTable::with_buckets(4, 1, 1));
    let (addr, port) = peer(2);
    table.touch(addr, port, 0, 0);

    let handle = psi_flow::gc::task::spawn_gc_task(Arc::clone(&table), Duration::from_millis(5), || 100);
    for _ in 0..200 {
        if table.occupancy() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(table.occupancy(), 0);
    handle.stop().await;
}
