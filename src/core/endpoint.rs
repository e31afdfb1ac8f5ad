//! 端点上下文缓存
//!
//! 每个IP地址对应一个端点上下文，由所有引用该地址的流共享。
//! 缓存是按地址字节序排列的有序树，首次引用时创建，引用计数归零时销毁。

use crate::error::{ClassifierError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// 端点地址的规范字节形式
///
/// IPv4地址以IPv4映射的IPv6形式存放，保证两族地址可以统一按字节比较。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointAddr([u8; 16]);

impl EndpointAddr {
    /// 原始字节
    pub fn octets(&self) -> [u8; 16] {
        self.0
    }

    /// 还原为IP地址
    pub fn ip(&self) -> IpAddr {
        let v6 = std::net::Ipv6Addr::from(self.0);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }
}

impl From<IpAddr> for EndpointAddr {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self(v4.to_ipv6_mapped().octets()),
            IpAddr::V6(v6) => Self(v6.octets()),
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ip())
    }
}

/// 探测器在端点上保存的状态
///
/// 对引擎而言是不透明的，仅由探测器读写。
#[derive(Debug, Clone, Default)]
pub struct EndpointState {
    /// 最后一次见到该端点的时间戳
    pub last_seen: u64,
    /// 经过该端点的报文数
    pub packets: u64,
    /// 探测器记录的协议提示
    pub hints: Vec<u16>,
}

/// 端点上下文
#[derive(Debug)]
pub struct EndpointContext {
    addr: EndpointAddr,
    state: Mutex<EndpointState>,
}

impl EndpointContext {
    fn new(addr: EndpointAddr) -> Self {
        Self {
            addr,
            state: Mutex::new(EndpointState::default()),
        }
    }

    /// 端点地址
    pub fn addr(&self) -> EndpointAddr {
        self.addr
    }

    /// 锁定探测器状态
    pub fn state(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Slot {
    ctx: Arc<EndpointContext>,
    refs: usize,
}

/// 端点上下文缓存
pub struct EndpointCache {
    inner: Mutex<BTreeMap<EndpointAddr, Slot>>,
    /// 上下文数量上限，0表示不限
    max_endpoints: usize,
}

impl fmt::Debug for EndpointCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointCache")
            .field("len", &self.len())
            .field("max_endpoints", &self.max_endpoints)
            .finish()
    }
}

impl Default for EndpointCache {
    fn default() -> Self {
        Self::new(0)
    }
}

impl EndpointCache {
    /// 创建缓存
    pub fn new(max_endpoints: usize) -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
            max_endpoints,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<EndpointAddr, Slot>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 查找或插入端点上下文
    ///
    /// 已存在时引用计数加一；不存在时以引用计数1插入。
    /// 达到容量上限时返回 [`ClassifierError::AllocationFailure`]。
    pub fn insert_or_get(&self, addr: impl Into<EndpointAddr>) -> Result<Arc<EndpointContext>> {
        let addr = addr.into();
        let mut tree = self.lock();
        if let Some(slot) = tree.get_mut(&addr) {
            slot.refs += 1;
            return Ok(Arc::clone(&slot.ctx));
        }
        if self.max_endpoints != 0 && tree.len() >= self.max_endpoints {
            return Err(ClassifierError::allocation_failure(format!(
                "endpoint context for {}",
                addr
            )));
        }
        let ctx = Arc::new(EndpointContext::new(addr));
        tree.insert(
            addr,
            Slot {
                ctx: Arc::clone(&ctx),
                refs: 1,
            },
        );
        Ok(ctx)
    }

    /// 释放一次引用，引用计数归零时从缓存移除
    ///
    /// 返回上下文是否已被移除。
    pub fn release(&self, ctx: &Arc<EndpointContext>) -> bool {
        let mut tree = self.lock();
        let remove = match tree.get_mut(&ctx.addr) {
            Some(slot) if Arc::ptr_eq(&slot.ctx, ctx) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs == 0
            }
            _ => false,
        };
        if remove {
            tree.remove(&ctx.addr);
        }
        remove
    }

    /// 地址当前的引用计数
    pub fn refcount(&self, addr: impl Into<EndpointAddr>) -> usize {
        self.lock().get(&addr.into()).map(|slot| slot.refs).unwrap_or(0)
    }

    /// 缓存中的上下文数量
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// 缓存是否为空
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 清空缓存（引擎销毁时使用）
    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_v4_mapped_roundtrip() {
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        let addr = EndpointAddr::from(ip);
        assert_eq!(addr.ip(), ip);
    }

    #[test]
    fn test_release_foreign_context_ignored() {
        let cache = EndpointCache::new(0);
        let other = EndpointCache::new(0);
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        let ctx = cache.insert_or_get(ip).unwrap();
        let foreign = other.insert_or_get(ip).unwrap();

        assert!(!cache.release(&foreign));
        assert_eq!(cache.refcount(ip), 1);
        assert!(cache.release(&ctx));
        assert!(cache.is_empty());
    }
}
