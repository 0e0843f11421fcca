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

//! The relocation engine (spec §4.5 / C6): wires the analysis pass
//! (`analyze`) and the storage provisioner (`storage::provision`) into a
//! single `Engine`, which `engine::mover` then drains.

pub mod analyze;
pub mod mover;

use std::marker::PhantomData;

use crate::errors::Error;
use crate::extent::{ExtentMap, ExtentVec};
use crate::storage::{self, ExactSizes, Provisioned};

/// Picks the narrowest integer type that can index every block on the
/// device, mirroring `fr_dispatch::main`'s "smallest representable `T`"
/// selection (`original_source/fsremap/src/dispatch.hh`) without its
/// compile-time enumeration of candidate types — this crate only ever
/// needs `u32` (fits devices up to 2^32 blocks, i.e. 16 TiB at a 4 KiB
/// block size) or `u64` (anything larger).
pub trait BlockIndex: Copy + Ord + std::fmt::Display + Send + Sync + 'static {
    fn from_u64(value: u64) -> Result<Self, Error>;
    fn to_u64(self) -> u64;
}

impl BlockIndex for u32 {
    fn from_u64(value: u64) -> Result<Self, Error> {
        u32::try_from(value)
            .map_err(|_| Error::Overflow(format!("block index {value} does not fit in u32")))
    }

    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl BlockIndex for u64 {
    fn from_u64(value: u64) -> Result<Self, Error> {
        Ok(value)
    }

    fn to_u64(self) -> u64 {
        self
    }
}

/// Selects the narrowest `BlockIndex` that can represent `device_length_blocks`.
pub fn select_narrow_or_wide(device_length_blocks: u64) -> &'static str {
    if u32::from_u64(device_length_blocks).is_ok() {
        "u32"
    } else {
        "u64"
    }
}

/// The three clearing policies (spec §4.5.3), chosen at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearPolicy {
    /// Zero every block still in `to_clear_map`: the union of device free
    /// space and all loop holes.
    All,
    /// Zero only primary-storage blocks, device blocks vacated by
    /// relocation, and `ZEROED`-tagged blocks.
    Minimal,
    /// Zero only `ZEROED`-tagged blocks.
    None,
}

/// The relocation engine's full working state: the maps `analyze()`
/// produced, the storage the provisioner selected, and running statistics.
/// Parameterized over `Idx` purely for documentation/future narrow-index
/// plumbing (spec.md §9); block offsets are tracked as `u64` throughout —
/// see DESIGN.md for why a parallel narrow-index code path was not built.
pub struct Engine<Idx: BlockIndex> {
    pub dev_map: ExtentMap,
    pub dev_transpose: ExtentMap,
    pub dev_free: ExtentMap,
    pub to_clear_map: ExtentMap,
    pub device_vacated: ExtentMap,
    pub storage_map: ExtentMap,
    pub storage_transpose: ExtentMap,
    pub storage_free: ExtentMap,
    pub stats: analyze::AnalysisStats,
    pub clear_policy: ClearPolicy,
    pub storage_capacity_blocks: u64,
    pub ram_buffer_bytes: u64,
    pub block_size: u64,
    _idx: PhantomData<Idx>,
}

impl<Idx: BlockIndex> Engine<Idx> {
    /// Runs the analysis pass, then provisions storage from its output, and
    /// assembles the engine ready for `engine::mover::run`.
    pub fn build(
        loop_extents: ExtentVec,
        free_extents: ExtentVec,
        zero_extents: ExtentVec,
        device_length_blocks: u64,
        block_size: u64,
        clear_policy: ClearPolicy,
        exact_sizes: Option<ExactSizes>,
    ) -> Result<Self, Error> {
        Idx::from_u64(device_length_blocks)?;

        let analysis = analyze::analyze(
            loop_extents,
            free_extents,
            zero_extents,
            device_length_blocks,
        )?;

        let Provisioned {
            primary,
            primary_bytes,
            secondary_bytes,
            ram_buffer_bytes,
        } = storage::provision(
            &analysis.dev_free,
            &analysis.loop_holes,
            block_size,
            analysis.stats.work_total,
            exact_sizes,
        )?;

        // Primary storage is carved out of device free space: it must be
        // removed from dev_free (it's no longer "free" once claimed as
        // storage) and it joins to_clear_map so CLEAR_MINIMAL/CLEAR_ALL
        // zero it once it's done holding staged data.
        let mut dev_free = analysis.dev_free;
        let mut to_clear_map = analysis.to_clear_map;
        for e in primary.iter() {
            dev_free.remove_range(e.physical, e.length)?;
            to_clear_map.insert(*e)?;
        }

        let primary_blocks = primary_bytes / block_size.max(1);
        let secondary_blocks = secondary_bytes / block_size.max(1);
        let storage_capacity_blocks = primary_blocks + secondary_blocks;

        // `storage_free` is keyed in the unified storage-address space
        // (`io::mod` doc comment): addresses below `device_length_blocks`
        // are real device blocks (the primary extents, re-keyed with
        // `logical == physical` since their loop-hole `logical` from
        // provisioning was only needed to pick them, not to place data in
        // them), addresses at or above it are the secondary spill file.
        let mut storage_free = ExtentMap::new();
        for e in primary.iter() {
            storage_free.insert(crate::extent::Extent::new(
                e.physical,
                e.physical,
                e.length,
                e.tag,
            ))?;
        }
        if secondary_blocks > 0 {
            storage_free.insert(crate::extent::Extent::new(
                device_length_blocks,
                device_length_blocks,
                secondary_blocks,
                crate::extent::Tag::Default,
            ))?;
        }

        Ok(Engine {
            dev_map: analysis.dev_map,
            dev_transpose: analysis.dev_transpose,
            dev_free,
            to_clear_map,
            device_vacated: analysis.device_vacated,
            storage_map: ExtentMap::new(),
            storage_transpose: ExtentMap::new(),
            storage_free,
            stats: analysis.stats,
            clear_policy,
            storage_capacity_blocks,
            ram_buffer_bytes,
            block_size,
            _idx: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_index_rejects_oversized_device() {
        assert!(u32::from_u64(1).is_ok());
        assert!(u32::from_u64(u64::from(u32::MAX) + 1).is_err());
        assert!(u64::from_u64(u64::MAX).is_ok());
    }

    #[test]
    fn select_narrow_or_wide_picks_u32_when_it_fits() {
        assert_eq!(select_narrow_or_wide(1_000), "u32");
        assert_eq!(select_narrow_or_wide(u64::from(u32::MAX) + 1), "u64");
    }
}
