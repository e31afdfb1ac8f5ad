//! 临时子流哈希表与增量垃圾回收
//!
//! 固定大小的桶数组保存对端 `(地址, 端口)` 记录。定时器每个周期只扫描
//! `size / slices` 个桶，游标跨周期轮转，一个完整周期覆盖全部桶。
//! 超过超时时间未更新的记录被回收，回收总数单调递增。

use crate::flow_debug;
use std::collections::hash_map::DefaultHasher;
use std::fmt::Write as _;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// 桶数量上限（以K计）
pub const MAX_HASH_KB: usize = 512;

/// 直方图每行的桶数
const HISTOGRAM_ROW: usize = 12;

/// 直方图每页的桶数
const HISTOGRAM_PAGE: usize = 144;

/// 临时子流记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EphemeralEntry {
    /// 对端地址
    pub addr: IpAddr,
    /// 对端端口
    pub port: u16,
    /// 最后更新时间（秒）
    pub last_change: u64,
    /// 标志位
    pub flag: u32,
    /// 命中次数
    pub count: u32,
}

/// 表的概要信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct EphemeralSummary {
    /// 桶数量
    pub size: usize,
    /// 超时时间（秒）
    pub timeout_secs: u64,
    /// 记录数
    pub count: usize,
    /// 非空桶的最短长度
    pub min_bucket: usize,
    /// 最长桶长度
    pub max_bucket: usize,
    /// 回收总数
    pub gc_count: u64,
}

impl std::fmt::Display for EphemeralSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "hash_size {} hash timeout {}s count {} min {} max {} gc {}",
            self.size, self.timeout_secs, self.count, self.min_bucket, self.max_bucket, self.gc_count
        )
    }
}

#[derive(Debug)]
struct Buckets {
    slots: Vec<Vec<EphemeralEntry>>,
    cursor: usize,
    count: usize,
}

/// 临时子流哈希表
#[derive(Debug)]
pub struct EphemeralTable {
    inner: Mutex<Buckets>,
    timeout_secs: u64,
    per_tick: usize,
    evicted: AtomicU64,
}

impl EphemeralTable {
    /// 按K为单位的大小创建，上限512K；0返回 `None`（表被禁用）
    pub fn with_size_kb(size_kb: usize, timeout_secs: u64, slices: usize) -> Option<Self> {
        if size_kb == 0 {
            return None;
        }
        Some(Self::with_buckets(size_kb.min(MAX_HASH_KB) * 1024, timeout_secs, slices))
    }

    /// 按精确的桶数量创建
    pub fn with_buckets(buckets: usize, timeout_secs: u64, slices: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            inner: Mutex::new(Buckets {
                slots: vec![Vec::new(); buckets],
                cursor: 0,
                count: 0,
            }),
            timeout_secs,
            per_tick: (buckets / slices.max(1)).max(1),
            evicted: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket_of(addr: &IpAddr, port: u16, size: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        port.hash(&mut hasher);
        (hasher.finish() % size as u64) as usize
    }

    /// 桶数量
    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    /// 超时时间（秒）
    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// 每个周期扫描的桶数
    pub fn buckets_per_tick(&self) -> usize {
        self.per_tick
    }

    /// 扫描完整个表需要的周期数
    pub fn ticks_per_cycle(&self) -> usize {
        self.size().div_ceil(self.per_tick)
    }

    /// 插入或更新记录，返回更新后的命中次数
    pub fn touch(&self, addr: IpAddr, port: u16, flag: u32, now: u64) -> u32 {
        let mut buckets = self.lock();
        let index = Self::bucket_of(&addr, port, buckets.slots.len());
        let bucket = &mut buckets.slots[index];
        if let Some(entry) = bucket.iter_mut().find(|e| e.addr == addr && e.port == port) {
            entry.last_change = now;
            entry.flag = flag;
            entry.count = entry.count.saturating_add(1);
            return entry.count;
        }
        bucket.push(EphemeralEntry {
            addr,
            port,
            last_change: now,
            flag,
            count: 1,
        });
        buckets.count += 1;
        1
    }

    /// 查找记录
    pub fn get(&self, addr: IpAddr, port: u16) -> Option<EphemeralEntry> {
        let buckets = self.lock();
        let index = Self::bucket_of(&addr, port, buckets.slots.len());
        buckets.slots[index]
            .iter()
            .find(|e| e.addr == addr && e.port == port)
            .cloned()
    }

    /// 执行一个周期的增量回收，返回本次回收数量
    pub fn sweep_tick(&self, now: u64) -> usize {
        let mut buckets = self.lock();
        let size = buckets.slots.len();
        let mut removed = 0;
        for _ in 0..self.per_tick {
            let index = buckets.cursor;
            let bucket = &mut buckets.slots[index];
            if !bucket.is_empty() {
                let before = bucket.len();
                bucket.retain(|e| now.saturating_sub(e.last_change) <= self.timeout_secs);
                removed += before - bucket.len();
            }
            buckets.cursor = (index + 1) % size;
        }
        buckets.count -= removed;
        drop(buckets);

        if removed > 0 {
            self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            flow_debug!("ephemeral gc evicted {} entries", removed);
        }
        removed
    }

    /// 扫描一个完整周期
    pub fn sweep_full_cycle(&self, now: u64) -> usize {
        (0..self.ticks_per_cycle()).map(|_| self.sweep_tick(now)).sum()
    }

    /// 记录数
    pub fn occupancy(&self) -> usize {
        self.lock().count
    }

    /// 回收总数
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    /// 概要信息
    pub fn summary(&self) -> EphemeralSummary {
        let buckets = self.lock();
        let max_bucket = buckets.slots.iter().map(Vec::len).max().unwrap_or(0);
        let min_bucket = buckets
            .slots
            .iter()
            .map(Vec::len)
            .filter(|len| *len > 0)
            .min()
            .unwrap_or(0);
        EphemeralSummary {
            size: buckets.slots.len(),
            timeout_secs: self.timeout_secs,
            count: buckets.count,
            min_bucket,
            max_bucket,
            gc_count: self.evicted(),
        }
    }

    /// 桶长度直方图的一页（从0开始），超出范围返回 `None`
    pub fn histogram(&self, page: usize) -> Option<String> {
        let buckets = self.lock();
        let start = page * HISTOGRAM_PAGE;
        if start >= buckets.slots.len() {
            return None;
        }
        let end = (start + HISTOGRAM_PAGE).min(buckets.slots.len());
        let mut out = String::new();
        for (i, bucket) in buckets.slots[start..end].iter().enumerate() {
            if i % HISTOGRAM_ROW == 0 {
                let _ = write!(out, "{}:\t", start + i);
            }
            let sep = if i % HISTOGRAM_ROW == HISTOGRAM_ROW - 1 { '\n' } else { ' ' };
            let _ = write!(out, "{:5}{}", bucket.len(), sep);
        }
        Some(out)
    }

    /// 输出单个桶的记录
    pub fn bucket_dump(&self, index: usize, now: u64) -> Option<String> {
        let buckets = self.lock();
        let bucket = buckets.slots.get(index)?;
        let mut out = format!("index {} len {}\n", index, bucket.len());
        for e in bucket {
            let endpoint = match e.addr {
                IpAddr::V4(a) => format!("{}:{}", a, e.port),
                IpAddr::V6(a) => format!("[{}]:{}", a, e.port),
            };
            let _ = writeln!(
                out,
                "{} {} {:x} {}",
                endpoint,
                now.saturating_sub(e.last_change),
                e.flag,
                e.count
            );
        }
        Some(out)
    }
}

/// 回收定时器：专用线程按固定间隔驱动增量回收
#[derive(Debug)]
pub struct GcTimer {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl GcTimer {
    /// 启动定时器，`clock` 提供当前秒数
    pub fn start<F>(table: Arc<EphemeralTable>, tick: Duration, clock: F) -> std::io::Result<Self>
    where
        F: Fn() -> u64 + Send + 'static,
    {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let handle = std::thread::Builder::new()
            .name("psi-flow-gc".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(tick) {
                    Err(RecvTimeoutError::Timeout) => {
                        table.sweep_tick(clock());
                    }
                    _ => break,
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// 是否仍在运行
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// 同步停止并等待线程退出
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GcTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// tokio任务形式的回收定时器
#[cfg(feature = "runtime-tokio")]
pub mod task {
    use super::EphemeralTable;
    use std::sync::Arc;
    use std::time::Duration;

    /// 回收任务句柄
    #[derive(Debug)]
    pub struct GcTaskHandle {
        handle: tokio::task::JoinHandle<()>,
    }

    /// 在当前tokio运行时上启动回收任务
    pub fn spawn_gc_task<F>(table: Arc<EphemeralTable>, tick: Duration, clock: F) -> GcTaskHandle
    where
        F: Fn() -> u64 + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                interval.tick().await;
                table.sweep_tick(clock());
            }
        });
        GcTaskHandle { handle }
    }

    impl GcTaskHandle {
        /// 停止任务并等待其结束
        pub async fn stop(self) {
            self.handle.abort();
            let _ = self.handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_reaches_last_bucket() {
        let table = EphemeralTable::with_buckets(10, 5, 10);
        let addr: IpAddr = "10.0.0.1".parse().unwrap();
        for port in 0..200u16 {
            table.touch(addr, port, 0, 0);
        }
        assert_eq!(table.ticks_per_cycle(), 10);
        assert_eq!(table.sweep_full_cycle(100), 200);
        assert_eq!(table.occupancy(), 0);
    }

    #[test]
    fn test_histogram_pages() {
        let table = EphemeralTable::with_buckets(150, 5, 10);
        let page = table.histogram(0).unwrap();
        assert!(page.starts_with("0:\t"));
        assert_eq!(page.lines().count(), HISTOGRAM_PAGE / HISTOGRAM_ROW);
        assert!(table.histogram(1).unwrap().starts_with("144:\t"));
        assert!(table.histogram(2).is_none());
    }
}
