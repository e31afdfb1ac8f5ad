//! 端点上下文缓存测试

use psi_flow::core::endpoint::{EndpointAddr, EndpointCache};
use rayon::prelude::*;
use std::net::IpAddr;
use std::sync::Arc;

fn addr(text: &str) -> IpAddr {
    text.parse().unwrap()
}

#[test]
fn test_concurrent_insert_shares_context() {
    let cache = EndpointCache::new(0);
    let a = addr("192.0.2.10");
    let contexts: Vec<_> = (0..64)
        .into_par_iter()
        .map(|_| cache.insert_or_get(a).unwrap())
        .collect();

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.refcount(a), 64);
    assert!(contexts.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

    let removed: usize = contexts
        .par_iter()
        .map(|ctx| usize::from(cache.release(ctx)))
        .sum();
    assert_eq!(removed, 1);
    assert!(cache.is_empty());
    assert_eq!(cache.refcount(a), 0);
}

#[test]
fn test_concurrent_distinct_addresses() {
    let cache = EndpointCache::new(0);
    (0..200u32).into_par_iter().for_each(|i| {
        let ip = IpAddr::from([10, 0, (i / 100) as u8, (i % 100) as u8]);
        cache.insert_or_get(ip).unwrap();
        cache.insert_or_get(ip).unwrap();
    });
    assert_eq!(cache.len(), 200);
    assert_eq!(cache.refcount(addr("10.0.1.5")), 2);
}

#[test]
fn test_capacity_limit() {
    let cache = EndpointCache::new(2);
    cache.insert_or_get(addr("10.0.0.1")).unwrap();
    cache.insert_or_get(addr("10.0.0.2")).unwrap();
    let err = cache.insert_or_get(addr("10.0.0.3")).unwrap_err();
    assert!(err.is_recoverable());
    assert_eq!(err.error_code(), 1001);

    // 已存在的地址不受上限影响
    assert!(cache.insert_or_get(addr("10.0.0.1")).is_ok());
    assert_eq!(cache.refcount(addr("10.0.0.1")), 2);
}

#[test]
fn test_v4_and_v6_keys() {
    let cache = EndpointCache::new(0);
    let v4 = cache.insert_or_get(addr("10.0.0.1")).unwrap();
    let v6 = cache.insert_or_get(addr("2001:db8::1")).unwrap();
    assert!(!Arc::ptr_eq(&v4, &v6));
    assert_eq!(v4.addr(), EndpointAddr::from(addr("10.0.0.1")));
    assert_eq!(v4.addr().ip(), addr("10.0.0.1"));
    assert_eq!(cache.len(), 2);
}

#[test]
fn test_stale_release_is_ignored() {
    let cache = EndpointCache::new(0);
    let first = cache.insert_or_get(addr("10.0.0.1")).unwrap();
    assert!(cache.release(&first));
    let second = cache.insert_or_get(addr("10.0.0.1")).unwrap();
    assert!(!cache.release(&first));
    assert_eq!(cache.refcount(addr("10.0.0.1")), 1);
    assert!(cache.release(&second));
}
