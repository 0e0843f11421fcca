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

//! The extent algebra (spec §4.1): sorted maps/vectors of `(physical,
//! logical, length)` triples with merge, intersect, complement, shift and
//! transpose. All coordinates here are block indices, already divided by
//! the effective block size `B`.

use std::collections::BTreeMap;
use std::fmt;

use crate::errors::Error;

/// Distinguishes what an extent's content is known to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Default,
    /// The source extent is known to contain only zeros (an "unwritten"
    /// allocation).
    Zeroed,
}

impl Tag {
    /// Parses the `user_data` field of an extent-dump line (spec §6). Any
    /// value outside the known tag set is rejected rather than silently
    /// widened (spec §9 Open Question on `user_data` versioning).
    pub fn from_user_data(v: u64) -> Result<Self, Error> {
        match v {
            0 => Ok(Tag::Default),
            1 => Ok(Tag::Zeroed),
            other => Err(Error::InvalidArgument(format!(
                "unknown extent user_data tag {other}"
            ))),
        }
    }

    pub fn to_user_data(self) -> u64 {
        match self {
            Tag::Default => 0,
            Tag::Zeroed => 1,
        }
    }
}

/// Direction of a copy operation. `STORAGE -> STORAGE` is made
/// unrepresentable by construction rather than rejected at runtime (spec
/// §4.1/original `fr_dir` is a bitmask that happens to make that
/// combination representable; see `DESIGN.md`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    DevToDev,
    DevToStorage,
    StorageToDev,
}

/// A contiguous run of `length` blocks, known at physical offset `physical`
/// and destined for (or originating from) logical offset `logical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub physical: u64,
    pub logical: u64,
    pub length: u64,
    pub tag: Tag,
}

/// Disjoint/touching/intersecting relationship between two extents sharing
/// the same alignment (`logical - physical`) and tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelativePosition {
    Before,
    TouchBefore,
    Intersect,
    TouchAfter,
    After,
    /// Unaligned (different `logical - physical` shift, or different tag):
    /// only Before/Intersect/After are meaningful.
    Unaligned(UnalignedPosition),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnalignedPosition {
    Before,
    Intersect,
    After,
}

impl Extent {
    pub fn new(physical: u64, logical: u64, length: u64, tag: Tag) -> Self {
        debug_assert!(length > 0, "extent length must be > 0");
        Extent {
            physical,
            logical,
            length,
            tag,
        }
    }

    pub fn physical_end(&self) -> u64 {
        self.physical + self.length
    }

    pub fn logical_end(&self) -> u64 {
        self.logical + self.length
    }

    pub fn shift(self) -> i128 {
        self.logical as i128 - self.physical as i128
    }

    /// Swaps physical and logical. The caller is responsible for
    /// re-sorting any container this extent lived in (spec §4.1).
    pub fn transpose(&self) -> Extent {
        Extent {
            physical: self.logical,
            logical: self.physical,
            length: self.length,
            tag: self.tag,
        }
    }

    /// Classifies the relative position of `self` and `other`, both keyed
    /// by physical offset with `self` assumed to come first in physical
    /// order.
    pub fn relative_position(&self, other: &Extent) -> RelativePosition {
        let aligned = self.tag == other.tag && self.shift() == other.shift();
        if self.physical_end() <= other.physical {
            if aligned {
                if self.physical_end() == other.physical {
                    RelativePosition::TouchBefore
                } else {
                    RelativePosition::Before
                }
            } else {
                RelativePosition::Unaligned(UnalignedPosition::Before)
            }
        } else if other.physical_end() <= self.physical {
            if aligned {
                if other.physical_end() == self.physical {
                    RelativePosition::TouchAfter
                } else {
                    RelativePosition::After
                }
            } else {
                RelativePosition::Unaligned(UnalignedPosition::After)
            }
        } else if aligned {
            RelativePosition::Intersect
        } else {
            RelativePosition::Unaligned(UnalignedPosition::Intersect)
        }
    }

    /// Two extents are mergeable iff they touch exactly in both physical
    /// and logical space and share a tag (spec §3).
    pub fn mergeable_with(&self, other: &Extent) -> bool {
        matches!(
            self.relative_position(other),
            RelativePosition::TouchBefore | RelativePosition::TouchAfter
        )
    }

    fn merge(&self, other: &Extent) -> Extent {
        let (first, second) = if self.physical <= other.physical {
            (self, other)
        } else {
            (other, self)
        };
        Extent {
            physical: first.physical,
            logical: first.logical,
            length: first.length + second.length,
            tag: first.tag,
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.physical,
            self.logical,
            self.length,
            self.tag.to_user_data()
        )
    }
}

/// How to combine the logical/physical coordinates of two intersecting
/// extents from two different maps (spec §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntersectMode {
    /// Overlap of physical ranges; logical inherited from the first operand.
    Physical1,
    /// Overlap of physical ranges; logical inherited from the second operand.
    Physical2,
    /// Overlap in both physical and logical with equal shift; empty otherwise.
    Both,
}

/// An ordered collection of extents keyed by `physical`, with the
/// invariant that no two extents intersect or are mergeable: every insert
/// that would create such a pair merges, transitively.
#[derive(Debug, Clone, Default)]
pub struct ExtentMap {
    by_physical: BTreeMap<u64, Extent>,
}

impl ExtentMap {
    pub fn new() -> Self {
        ExtentMap {
            by_physical: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_physical.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_physical.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.by_physical.values()
    }

    pub fn total_length(&self) -> u64 {
        self.by_physical.values().map(|e| e.length).sum()
    }

    pub fn get(&self, physical: u64) -> Option<&Extent> {
        self.by_physical.get(&physical)
    }

    /// Returns the extent (if any) whose physical range contains `physical`.
    pub fn find_containing(&self, physical: u64) -> Option<&Extent> {
        self.by_physical
            .range(..=physical)
            .next_back()
            .map(|(_, e)| e)
            .filter(|e| physical < e.physical_end())
    }

    fn neighbors(&self, physical: u64) -> (Option<u64>, Option<u64>) {
        let pred = self
            .by_physical
            .range(..physical)
            .next_back()
            .map(|(k, _)| *k);
        let succ = self
            .by_physical
            .range(physical..)
            .next()
            .map(|(k, _)| *k);
        (pred, succ)
    }

    /// Inserts `extent`, merging transitively with any touching neighbor.
    /// Inserting an extent that intersects an existing one is a fatal
    /// invariant violation (spec §4.1).
    pub fn insert(&mut self, extent: Extent) -> Result<(), Error> {
        if extent.length == 0 {
            return Ok(());
        }
        let mut merged = extent;
        loop {
            let (pred, succ) = self.neighbors(merged.physical);
            let mut changed = false;
            if let Some(pred_key) = pred {
                let pred_extent = self.by_physical[&pred_key];
                match pred_extent.relative_position(&merged) {
                    RelativePosition::TouchBefore => {
                        self.by_physical.remove(&pred_key);
                        merged = pred_extent.merge(&merged);
                        changed = true;
                    }
                    RelativePosition::Intersect => {
                        return Err(Error::InternalInvariant(format!(
                            "extent {merged} intersects existing extent {pred_extent}"
                        )));
                    }
                    RelativePosition::Unaligned(UnalignedPosition::Intersect) => {
                        return Err(Error::InternalInvariant(format!(
                            "extent {merged} intersects existing extent {pred_extent}"
                        )));
                    }
                    _ => {}
                }
            }
            if !changed {
                if let Some(succ_key) = succ {
                    let succ_extent = self.by_physical[&succ_key];
                    match merged.relative_position(&succ_extent) {
                        RelativePosition::TouchBefore => {
                            self.by_physical.remove(&succ_key);
                            merged = merged.merge(&succ_extent);
                            changed = true;
                        }
                        RelativePosition::Intersect => {
                            return Err(Error::InternalInvariant(format!(
                                "extent {merged} intersects existing extent {succ_extent}"
                            )));
                        }
                        RelativePosition::Unaligned(UnalignedPosition::Intersect) => {
                            return Err(Error::InternalInvariant(format!(
                                "extent {merged} intersects existing extent {succ_extent}"
                            )));
                        }
                        _ => {}
                    }
                }
            }
            if !changed {
                break;
            }
        }
        self.by_physical.insert(merged.physical, merged);
        Ok(())
    }

    /// Removes the sub-range `[physical, physical+length)`, splitting a
    /// held extent into two halves if the removed range falls in its
    /// interior.
    pub fn remove_range(&mut self, physical: u64, length: u64) -> Result<(), Error> {
        if length == 0 {
            return Ok(());
        }
        let end = physical + length;
        let overlapping: Vec<Extent> = self
            .by_physical
            .range(..end)
            .filter(|(_, e)| e.physical_end() > physical)
            .map(|(_, e)| *e)
            .collect();
        for e in overlapping {
            self.by_physical.remove(&e.physical);
            let lo = physical.max(e.physical);
            let hi = end.min(e.physical_end());
            if lo > e.physical {
                let left = Extent::new(e.physical, e.logical, lo - e.physical, e.tag);
                self.by_physical.insert(left.physical, left);
            }
            if hi < e.physical_end() {
                let shift = e.shift();
                let right = Extent::new(
                    hi,
                    (hi as i128 + shift) as u64,
                    e.physical_end() - hi,
                    e.tag,
                );
                self.by_physical.insert(right.physical, right);
            }
        }
        Ok(())
    }

    /// Shrinks the map by removing `length` blocks from the very front
    /// (lowest physical offset).
    pub fn remove_front(&mut self, length: u64) -> Result<(), Error> {
        if length == 0 {
            return Ok(());
        }
        let front = match self.by_physical.values().next() {
            Some(e) => *e,
            None => {
                return Err(Error::InternalInvariant(
                    "remove_front on empty map".into(),
                ))
            }
        };
        self.remove_range(front.physical, length)
    }

    /// Removes and returns the smallest extent whose length is >= `min_length`.
    pub fn best_fit(&mut self, min_length: u64) -> Option<Extent> {
        let found = self
            .by_physical
            .values()
            .filter(|e| e.length >= min_length)
            .min_by_key(|e| (e.length, e.physical))
            .copied();
        if let Some(e) = found {
            self.by_physical.remove(&e.physical);
        }
        found
    }

    /// Intersects `self` and `other`, producing a new map per `mode`. The
    /// smaller map drives the outer loop (spec §4.1: "the smaller map is
    /// the outer loop").
    pub fn intersect(&self, other: &ExtentMap, mode: IntersectMode) -> Result<ExtentMap, Error> {
        let (outer, inner, swapped) = if self.len() <= other.len() {
            (self, other, false)
        } else {
            (other, self, true)
        };
        let mut out = ExtentMap::new();
        for a in outer.iter() {
            for b in inner
                .by_physical
                .range(..a.physical_end())
                .map(|(_, e)| e)
                .filter(|b| b.physical_end() > a.physical)
            {
                let lo = a.physical.max(b.physical);
                let hi = a.physical_end().min(b.physical_end());
                if lo >= hi {
                    continue;
                }
                // `a` is drawn from `outer`, which is `other` when `swapped`.
                // Normalize so "first operand" always means `self`.
                let (first, second) = if swapped { (b, a) } else { (a, b) };
                let effective_mode = if swapped {
                    match mode {
                        IntersectMode::Physical1 => IntersectMode::Physical2,
                        IntersectMode::Physical2 => IntersectMode::Physical1,
                        IntersectMode::Both => IntersectMode::Both,
                    }
                } else {
                    mode
                };
                let logical = match effective_mode {
                    IntersectMode::Physical1 => lo as i128 + first.shift(),
                    IntersectMode::Physical2 => lo as i128 + second.shift(),
                    IntersectMode::Both => {
                        if first.shift() != second.shift() {
                            continue;
                        }
                        lo as i128 + first.shift()
                    }
                };
                if logical < 0 {
                    return Err(Error::Overflow("negative logical offset".into()));
                }
                let tag = if effective_mode == IntersectMode::Physical2 {
                    second.tag
                } else {
                    first.tag
                };
                out.insert(Extent::new(lo, logical as u64, hi - lo, tag))?;
            }
        }
        Ok(out)
    }

    /// Physical gaps of `self` within `[0, device_length)`, expressed with
    /// `logical = physical`.
    pub fn complement_physical(&self, device_length: u64) -> ExtentMap {
        let mut out = ExtentMap::new();
        let mut cursor = 0u64;
        for e in self.iter() {
            if e.physical > cursor {
                out.by_physical.insert(
                    cursor,
                    Extent::new(cursor, cursor, e.physical - cursor, Tag::Default),
                );
            }
            cursor = cursor.max(e.physical_end());
        }
        if cursor < device_length {
            out.by_physical.insert(
                cursor,
                Extent::new(cursor, cursor, device_length - cursor, Tag::Default),
            );
        }
        out
    }

    /// Same as [`Self::complement_physical`] but over logical coordinates
    /// (the map is reinterpreted as keyed by logical offset first).
    pub fn complement_logical(&self, device_length: u64) -> ExtentMap {
        let mut by_logical: Vec<Extent> = self.iter().copied().collect();
        by_logical.sort_by_key(|e| e.logical);
        let mut out = ExtentMap::new();
        let mut cursor = 0u64;
        for e in &by_logical {
            if e.logical > cursor {
                out.by_physical.insert(
                    cursor,
                    Extent::new(cursor, cursor, e.logical - cursor, Tag::Default),
                );
            }
            cursor = cursor.max(e.logical_end());
        }
        if cursor < device_length {
            out.by_physical.insert(
                cursor,
                Extent::new(cursor, cursor, device_length - cursor, Tag::Default),
            );
        }
        out
    }

    /// Transposes every extent (physical <-> logical) and re-sorts by the
    /// new physical (old logical) key, as the caller is required to do
    /// after a raw transpose (spec §4.1).
    pub fn transpose(&self) -> ExtentMap {
        let mut out = ExtentMap::new();
        for e in self.iter() {
            let t = e.transpose();
            out.by_physical.insert(t.physical, t);
        }
        out
    }

    pub fn to_vec(&self) -> ExtentVec {
        ExtentVec {
            extents: self.iter().copied().collect(),
        }
    }
}

/// Same tuples as [`ExtentMap`] but unsorted-with-explicit-sort, as used by
/// enumeration results before they're folded into a map (spec §3).
#[derive(Debug, Clone, Default)]
pub struct ExtentVec {
    extents: Vec<Extent>,
}

impl ExtentVec {
    pub fn new() -> Self {
        ExtentVec {
            extents: Vec::new(),
        }
    }

    pub fn from_vec(extents: Vec<Extent>) -> Self {
        ExtentVec { extents }
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.extents.iter()
    }

    pub fn into_vec(self) -> Vec<Extent> {
        self.extents
    }

    pub fn total_length(&self) -> u64 {
        self.extents.iter().map(|e| e.length).sum()
    }

    /// Appends `extent`, attempting an O(1) tail-merge against the last
    /// element only (spec §3: no full re-scan).
    pub fn append(&mut self, extent: Extent) {
        if let Some(last) = self.extents.last_mut() {
            if last.mergeable_with(&extent) {
                *last = last.merge(&extent);
                return;
            }
        }
        self.extents.push(extent);
    }

    pub fn sort_by_physical(&mut self) {
        self.extents.sort_by_key(|e| e.physical);
    }

    pub fn sort_by_logical(&mut self) {
        self.extents.sort_by_key(|e| e.logical);
    }

    pub fn sort_by_reverse_length(&mut self) {
        self.extents.sort_by(|a, b| b.length.cmp(&a.length));
    }

    pub fn transpose(&mut self) {
        for e in &mut self.extents {
            *e = e.transpose();
        }
    }

    /// Truncates the vector (assumed sorted by logical) so that no extent
    /// extends past `logical_limit`, splitting the last surviving extent
    /// if it straddles the limit.
    pub fn truncate_at_logical(&mut self, logical_limit: u64) {
        let mut kept = Vec::with_capacity(self.extents.len());
        for e in self.extents.drain(..) {
            if e.logical >= logical_limit {
                continue;
            }
            if e.logical_end() > logical_limit {
                kept.push(Extent::new(
                    e.physical,
                    e.logical,
                    logical_limit - e.logical,
                    e.tag,
                ));
            } else {
                kept.push(e);
            }
        }
        self.extents = kept;
    }

    pub fn to_map(&self) -> Result<ExtentMap, Error> {
        let mut map = ExtentMap::new();
        for e in &self.extents {
            map.insert(*e)?;
        }
        Ok(map)
    }
}

/// Composes two maps that share a common coordinate space `C`:
/// `a_to_c` (sorted by `C`, physical == A, logical == C) and
/// `b_to_c` (sorted by `C`, physical == B, logical == C) are walked in
/// lock-step over `C` to produce an `A <-> B` map (spec §4.1). Any
/// sub-range of `B` not covered by `A` is returned as the second element
/// ("unmapped").
pub fn compose(a_to_c: &ExtentMap, b_to_c: &ExtentMap) -> Result<(ExtentMap, ExtentVec), Error> {
    let a_by_c = a_to_c.transpose();
    let b_by_c = b_to_c.transpose();

    let mut out = ExtentMap::new();
    let mut unmapped = ExtentVec::new();

    for b in b_by_c.iter() {
        let mut cursor = b.physical; // physical of b_by_c == coordinate C
        let end = b.physical_end();
        while cursor < end {
            match a_by_c.find_containing(cursor) {
                Some(a) => {
                    let seg_end = end.min(a.physical_end());
                    let offset_in_a = cursor - a.physical;
                    let a_value = a.logical + offset_in_a; // A's own coordinate
                    let offset_in_b = cursor - b.physical;
                    let b_value = b.logical + offset_in_b; // B's own coordinate
                    out.insert(Extent::new(a_value, b_value, seg_end - cursor, b.tag))?;
                    cursor = seg_end;
                }
                None => {
                    // gap in A's coverage of C: find where A picks back up
                    // (if at all) within this b extent.
                    let next_start = a_by_c
                        .iter()
                        .map(|a| a.physical)
                        .find(|&p| p > cursor && p < end);
                    let gap_end = next_start.unwrap_or(end);
                    let offset_in_b = cursor - b.physical;
                    unmapped.append(Extent::new(
                        0,
                        b.logical + offset_in_b,
                        gap_end - cursor,
                        b.tag,
                    ));
                    cursor = gap_end;
                }
            }
        }
    }

    // A extending past B's coverage is a hard failure.
    if let (Some(last_a), Some(last_b)) = (
        a_by_c.iter().map(|e| e.physical_end()).max(),
        b_by_c.iter().map(|e| e.physical_end()).max(),
    ) {
        if last_a > last_b {
            return Err(Error::InvalidFilesystem(
                "A covers a range of C that extends past the end of B's coverage".into(),
            ));
        }
    }

    Ok((out, unmapped))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(p: u64, l: u64, len: u64) -> Extent {
        Extent::new(p, l, len, Tag::Default)
    }

    #[test]
    fn merge_is_commutative_and_associative() {
        let a = ext(0, 0, 2);
        let b = ext(2, 2, 2);
        let c = ext(4, 4, 2);
        let ab = a.merge(&b);
        let bc = b.merge(&c);
        assert_eq!(ab.merge(&c), a.merge(&bc));
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn insert_merges_transitively() {
        let mut m = ExtentMap::new();
        m.insert(ext(0, 0, 2)).unwrap();
        m.insert(ext(4, 4, 2)).unwrap();
        m.insert(ext(2, 2, 2)).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.iter().next().unwrap().length, 6);
    }

    #[test]
    fn insert_intersecting_is_fatal() {
        let mut m = ExtentMap::new();
        m.insert(ext(0, 0, 4)).unwrap();
        let err = m.insert(ext(2, 2, 4)).unwrap_err();
        assert!(matches!(err, Error::InternalInvariant(_)));
    }

    #[test]
    fn complement_physical_covers_exactly() {
        let mut v = ExtentVec::new();
        v.append(ext(2, 0, 2));
        let m = v.to_map().unwrap();
        let complement = m.complement_physical(4);
        // complement covers [0,2) and [4,4) i.e. just [0,2)
        assert_eq!(complement.total_length(), 2);
        assert_eq!(complement.total_length() + m.total_length(), 4);
    }

    #[test]
    fn transpose_round_trips() {
        let mut m = ExtentMap::new();
        m.insert(ext(0, 2, 2)).unwrap();
        m.insert(ext(2, 0, 2)).unwrap();
        let t = m.transpose();
        let tt = t.transpose();
        assert_eq!(m.total_length(), tt.total_length());
        for e in tt.iter() {
            assert!(m.find_containing(e.physical).is_some());
        }
    }

    #[test]
    fn best_fit_pops_smallest_large_enough() {
        let mut m = ExtentMap::new();
        m.insert(ext(0, 0, 2)).unwrap();
        m.insert(ext(10, 10, 5)).unwrap();
        m.insert(ext(20, 20, 3)).unwrap();
        let got = m.best_fit(3).unwrap();
        assert_eq!(got.length, 3);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn intersect_physical1_inherits_first_logical() {
        let mut a = ExtentMap::new();
        a.insert(Extent::new(0, 100, 10, Tag::Default)).unwrap();
        let mut b = ExtentMap::new();
        b.insert(Extent::new(5, 200, 10, Tag::Default)).unwrap();
        let i = a.intersect(&b, IntersectMode::Physical1).unwrap();
        assert_eq!(i.len(), 1);
        let e = i.iter().next().unwrap();
        assert_eq!(e.physical, 5);
        assert_eq!(e.length, 5);
        assert_eq!(e.logical, 105); // inherited from a's shift (100)
    }

    #[test]
    fn vector_append_tail_merges() {
        let mut v = ExtentVec::new();
        v.append(ext(0, 0, 2));
        v.append(ext(2, 2, 2));
        assert_eq!(v.len(), 1);
        v.append(ext(10, 10, 2));
        assert_eq!(v.len(), 2);
    }
}
