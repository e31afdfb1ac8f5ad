//! 端口范围表
//!
//! 一个有序、互不重叠、最大合并的 `(start, end) -> protocol` 数组。

use crate::core::protocol::ProtocolId;
use serde::{Deserialize, Serialize};

/// 端口范围
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    /// 起始端口（含）
    pub start: u16,
    /// 结束端口（含）
    pub end: u16,
    /// 协议编号
    pub proto: ProtocolId,
}

impl PortRange {
    /// 创建端口范围，起止颠倒时自动交换
    pub fn new(start: u16, end: u16, proto: ProtocolId) -> Self {
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        Self { start, end, proto }
    }

    /// 单个端口
    pub fn single(port: u16, proto: ProtocolId) -> Self {
        Self::new(port, port, proto)
    }

    /// 是否包含端口
    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// 更新操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeOp {
    /// 插入，新范围覆盖重叠部分
    Insert,
    /// 删除完全相同的范围；`any_protocol` 为真时忽略协议比较
    Delete {
        /// 是否匹配任意协议
        any_protocol: bool,
    },
}

/// 端口范围表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeTable {
    ranges: Vec<PortRange>,
}

/// 追加一个范围，与前一个相邻或重叠且协议相同时合并
fn push_coalesced(out: &mut Vec<PortRange>, range: PortRange) {
    if let Some(last) = out.last_mut() {
        if last.proto == range.proto && last.end as u32 + 1 >= range.start as u32 {
            last.end = last.end.max(range.end);
            return;
        }
    }
    out.push(range);
}

impl RangeTable {
    /// 创建空表
    pub fn new() -> Self {
        Self::default()
    }

    /// 范围数量
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// 有序范围切片
    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    /// 更新范围表，返回是否发生变化
    ///
    /// 插入时一次遍历完成：复制重叠之前的区间，裁剪被覆盖的区间并放入新区间，
    /// 再复制尾部，过程中合并相邻的同协议区间。新数组完整构建后才替换旧数组。
    pub fn update(&mut self, new: PortRange, op: RangeOp) -> bool {
        match op {
            RangeOp::Insert => self.insert(new),
            RangeOp::Delete { any_protocol } => self.delete(new, any_protocol),
        }
    }

    fn insert(&mut self, new: PortRange) -> bool {
        let mut out = Vec::with_capacity(self.ranges.len() + 2);
        let mut placed = false;

        for r in &self.ranges {
            if r.end < new.start {
                push_coalesced(&mut out, *r);
                continue;
            }
            if r.start > new.end {
                if !placed {
                    push_coalesced(&mut out, new);
                    placed = true;
                }
                push_coalesced(&mut out, *r);
                continue;
            }
            // 与新区间重叠：保留左右两侧的剩余部分
            if r.start < new.start {
                push_coalesced(&mut out, PortRange { end: new.start - 1, ..*r });
            }
            if !placed {
                push_coalesced(&mut out, new);
                placed = true;
            }
            if r.end > new.end {
                push_coalesced(&mut out, PortRange { start: new.end + 1, ..*r });
            }
        }
        if !placed {
            push_coalesced(&mut out, new);
        }

        if out == self.ranges {
            return false;
        }
        self.ranges = out;
        true
    }

    fn delete(&mut self, target: PortRange, any_protocol: bool) -> bool {
        let found = self
            .ranges
            .binary_search_by(|r| (r.start, r.end).cmp(&(target.start, target.end)))
            .ok()
            .filter(|&i| any_protocol || self.ranges[i].proto == target.proto);
        match found {
            Some(i) => {
                self.ranges.remove(i);
                true
            }
            None => false,
        }
    }

    /// 查找包含端口的范围，返回协议编号
    pub fn lookup(&self, port: u16) -> ProtocolId {
        let i = self.ranges.partition_point(|r| r.end < port);
        match self.ranges.get(i) {
            Some(r) if r.contains(port) => r.proto,
            _ => ProtocolId::UNKNOWN,
        }
    }

    /// 检查不变量：有序、不重叠、相邻同协议已合并
    pub fn is_well_formed(&self) -> bool {
        self.ranges.iter().all(|r| r.start <= r.end)
            && self.ranges.windows(2).all(|w| {
                w[0].end < w[1].start
                    && !(w[0].proto == w[1].proto && w[0].end as u32 + 1 == w[1].start as u32)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: ProtocolId = ProtocolId(7);
    const Q: ProtocolId = ProtocolId(39);

    #[test]
    fn test_new_range_overwrites_both_neighbours() {
        let mut table = RangeTable::new();
        table.update(PortRange::new(10, 20, P), RangeOp::Insert);
        table.update(PortRange::new(30, 40, P), RangeOp::Insert);
        table.update(PortRange::new(15, 35, Q), RangeOp::Insert);

        assert_eq!(
            table.ranges(),
            &[
                PortRange::new(10, 14, P),
                PortRange::new(15, 35, Q),
                PortRange::new(36, 40, P),
            ]
        );
        assert!(table.is_well_formed());
    }

    #[test]
    fn test_boundary_ports() {
        let mut table = RangeTable::new();
        table.update(PortRange::new(0, 65535, P), RangeOp::Insert);
        table.update(PortRange::single(65535, Q), RangeOp::Insert);
        table.update(PortRange::single(0, Q), RangeOp::Insert);

        assert_eq!(table.lookup(0), Q);
        assert_eq!(table.lookup(1), P);
        assert_eq!(table.lookup(65534), P);
        assert_eq!(table.lookup(65535), Q);
        assert!(table.is_well_formed());
    }
}
