// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The best-fit pool (spec §4.2): a length-keyed index over an extent map
//! supporting best-fit allocation.

use std::collections::{BTreeMap, VecDeque};

use crate::extent::{Extent, ExtentMap, Tag};

/// A multiset keyed by extent length, holding back-references (physical
/// keys) into an underlying [`ExtentMap`].
#[derive(Debug, Default)]
pub struct BestFitPool {
    by_length: BTreeMap<u64, VecDeque<u64>>,
    map: ExtentMap,
}

impl BestFitPool {
    pub fn new() -> Self {
        BestFitPool {
            by_length: BTreeMap::new(),
            map: ExtentMap::new(),
        }
    }

    /// Populates the pool by scanning `map` once. Extents of equal length
    /// are queued in physical order, so the smallest-physical extent of a
    /// given length is popped first (spec §4.2).
    pub fn build(map: ExtentMap) -> Self {
        let mut by_length: BTreeMap<u64, VecDeque<u64>> = BTreeMap::new();
        let mut physicals: Vec<(u64, u64)> = map.iter().map(|e| (e.length, e.physical)).collect();
        physicals.sort_by_key(|&(_, physical)| physical);
        for (length, physical) in physicals {
            by_length.entry(length).or_default().push_back(physical);
        }
        BestFitPool { by_length, map }
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        self.map.total_length()
    }

    fn pop_smallest_at_least(&mut self, length: u64) -> Option<Extent> {
        let key = *self.by_length.range(length..).next()?.0;
        let queue = self.by_length.get_mut(&key).unwrap();
        let physical = queue.pop_front().unwrap();
        if queue.is_empty() {
            self.by_length.remove(&key);
        }
        let extent = self.map.get(physical).copied();
        if let Some(e) = extent {
            self.map.remove_range(e.physical, e.length).ok();
        }
        extent
    }

    fn push(&mut self, extent: Extent) {
        self.by_length
            .entry(extent.length)
            .or_default()
            .push_back(extent.physical);
        self.map.insert(extent).expect("pool extents never overlap");
    }

    /// Removes `target.length` bytes worth of space from the pool for
    /// `target`, splitting it as needed to consume multiple smaller
    /// buckets when no single hole fits. Appends the renumbered
    /// (new-`logical`, same-`physical`) fragments to `allocated_out`.
    pub fn allocate(&mut self, target: Extent, allocated_out: &mut Vec<Extent>) -> u64 {
        let mut remaining = target.length;
        let mut physical_cursor = target.physical;
        while remaining > 0 {
            let hole = match self.pop_smallest_at_least(remaining) {
                Some(h) => h,
                None => break,
            };
            if hole.length > remaining {
                // split: consume `remaining` from the front of the hole,
                // return the rest to the pool.
                let used = Extent::new(hole.physical, hole.logical, remaining, hole.tag);
                let rest = Extent::new(
                    hole.physical + remaining,
                    hole.logical + remaining,
                    hole.length - remaining,
                    hole.tag,
                );
                self.push(rest);
                allocated_out.push(Extent::new(
                    physical_cursor,
                    used.logical,
                    used.length,
                    Tag::Default,
                ));
                physical_cursor += used.length;
                remaining -= used.length;
            } else {
                allocated_out.push(Extent::new(
                    physical_cursor,
                    hole.logical,
                    hole.length,
                    Tag::Default,
                ));
                physical_cursor += hole.length;
                remaining -= hole.length;
            }
        }
        target.length - remaining
    }

    /// Repeatedly allocates every extent of `source_map` until either map
    /// is empty. Returns the extents of `source_map` that could not be
    /// allocated (if the pool ran out first).
    pub fn allocate_all(
        &mut self,
        source_map: &ExtentMap,
        allocated_out: &mut Vec<Extent>,
    ) -> Vec<Extent> {
        let mut residual = Vec::new();
        for target in source_map.iter() {
            let allocated_len = self.allocate(*target, allocated_out);
            if allocated_len < target.length {
                residual.push(Extent::new(
                    target.physical + allocated_len,
                    target.logical + allocated_len,
                    target.length - allocated_len,
                    target.tag,
                ));
                if self.is_empty() {
                    break;
                }
            }
        }
        residual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::Tag;

    fn ext(p: u64, l: u64, len: u64) -> Extent {
        Extent::new(p, l, len, Tag::Default)
    }

    #[test]
    fn allocate_splits_multiple_buckets() {
        // Scenario D from spec §8: one 5-block extent renumbered into
        // three loop-holes (5,5),(7,7),(9,9) taken from holes of length 2,2,1.
        let mut holes = ExtentMap::new();
        holes.insert(ext(5, 5, 2)).unwrap();
        holes.insert(ext(7, 7, 2)).unwrap();
        holes.insert(ext(9, 9, 1)).unwrap();
        let mut pool = BestFitPool::build(holes);

        let target = ext(0, 0, 5); // physical is irrelevant to the hole search
        let mut allocated = Vec::new();
        let got = pool.allocate(target, &mut allocated);
        assert_eq!(got, 5);
        assert_eq!(allocated.len(), 3);
        assert_eq!(
            allocated.iter().map(|e| e.length).sum::<u64>(),
            5
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn allocate_all_respects_both_totals() {
        let mut holes = ExtentMap::new();
        holes.insert(ext(0, 0, 3)).unwrap();
        let pool_total = holes.total_length();
        let mut pool = BestFitPool::build(holes);

        let mut src = ExtentMap::new();
        src.insert(ext(100, 100, 10)).unwrap();
        let src_total = src.total_length();

        let mut allocated = Vec::new();
        let residual = pool.allocate_all(&src, &mut allocated);
        let allocated_total: u64 = allocated.iter().map(|e| e.length).sum();
        assert_eq!(allocated_total, pool_total.min(src_total));
        assert_eq!(residual.iter().map(|e| e.length).sum::<u64>(), src_total - pool_total);
    }
}
