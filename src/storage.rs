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

//! The storage provisioner (spec §4.4): sizes and selects the auxiliary
//! "storage" the engine needs, split between primary (device-resident
//! free-and-hole blocks) and secondary (a spill file or mmap'd region)
//! space. Free RAM and page size are queried with `nix`, the same crate
//! the teacher uses for its own POSIX glue in `blockdev.rs`.

use nix::sys::sysinfo::sysinfo;
use nix::unistd::{sysconf, SysconfVar};

use crate::errors::Error;
use crate::extent::{ExtentMap, IntersectMode};

/// Exact sizes for a provisioning request, overriding the default sizing
/// policy (spec §4.4: "Exact-size mode", used on replay from a journal
/// that already recorded sizes, or via explicit CLI flags).
#[derive(Debug, Clone, Copy)]
pub struct ExactSizes {
    pub primary_bytes: u64,
    pub secondary_bytes: u64,
}

/// Result of provisioning: the primary extents selected from device free
/// space, plus the secondary byte count the I/O backend should allocate.
#[derive(Debug, Clone)]
pub struct Provisioned {
    pub primary: ExtentMap,
    pub primary_bytes: u64,
    pub secondary_bytes: u64,
    pub ram_buffer_bytes: u64,
}

fn page_size() -> Result<u64, Error> {
    sysconf(SysconfVar::PAGE_SIZE)
        .map_err(|e| Error::IoError(std::io::Error::from(e)))?
        .map(|v| v as u64)
        .ok_or_else(|| Error::InternalInvariant("sysconf(_SC_PAGESIZE) returned no value".into()))
}

fn free_ram_bytes() -> Result<u64, Error> {
    let info = sysinfo().map_err(|e| Error::IoError(std::io::Error::from(e)))?;
    Ok(info.ram_unused())
}

fn round_down(value: u64, multiple: u64) -> u64 {
    if multiple == 0 {
        value
    } else {
        (value / multiple) * multiple
    }
}

/// Computes the default RAM-buffer and total-storage byte counts (spec
/// §4.4's sizing policy), given `work_bytes` (the total bytes the engine
/// must relocate) and the effective block size `block_size`.
fn default_sizes(work_bytes: u64, block_size: u64) -> Result<(u64, u64), Error> {
    let free_ram = free_ram_bytes()?;
    let page = page_size()?;
    let alignment = block_size.max(page);

    let ram_buffer = round_down((free_ram / 4).min(work_bytes), alignment);
    let total_storage = round_down((free_ram / 2).min(work_bytes / 8), alignment);
    Ok((ram_buffer, total_storage))
}

/// Selects primary-storage extents from the intersection of device free
/// space (physical) and loop-file holes (logical), per spec §4.4:
/// - discard candidates smaller than `max(page_size, work_blocks / 1024)`
/// - align surviving extents to the page size, trimming both ends
/// - sort by descending length and trim the tail until `primary_quota` is
///   met exactly
fn select_primary_extents(
    free_physical: &ExtentMap,
    loop_holes_logical: &ExtentMap,
    block_size: u64,
    work_blocks: u64,
    primary_quota_blocks: u64,
) -> Result<(ExtentMap, u64), Error> {
    let candidates = free_physical.intersect(loop_holes_logical, IntersectMode::Both)?;

    let page_blocks = (page_size()? / block_size.max(1)).max(1);
    let min_len = page_blocks.max(work_blocks / 1024);

    let mut aligned: Vec<_> = candidates
        .iter()
        .filter(|e| e.length >= min_len)
        .filter_map(|e| {
            let start_aligned = ((e.physical + page_blocks - 1) / page_blocks) * page_blocks;
            let end_aligned = (e.physical_end() / page_blocks) * page_blocks;
            if end_aligned <= start_aligned {
                None
            } else {
                let length = end_aligned - start_aligned;
                let logical = start_aligned as i128 + e.shift();
                Some(crate::extent::Extent::new(
                    start_aligned,
                    logical as u64,
                    length,
                    e.tag,
                ))
            }
        })
        .collect();

    aligned.sort_by(|a, b| b.length.cmp(&a.length));

    let mut chosen = ExtentMap::new();
    let mut remaining = primary_quota_blocks;
    for e in aligned {
        if remaining == 0 {
            break;
        }
        let take = e.length.min(remaining);
        let trimmed = crate::extent::Extent::new(e.physical, e.logical, take, e.tag);
        chosen.insert(trimmed)?;
        remaining -= take;
    }
    let chosen_blocks = primary_quota_blocks - remaining;
    Ok((chosen, chosen_blocks))
}

/// Provisions storage for a run moving `work_blocks` blocks of `block_size`
/// bytes each, drawing primary space from `free_physical` ∩ `loop_holes_logical`
/// and falling back to secondary (spill-file) space for the rest.
///
/// If `exact` is `Some`, the sizing policy above is bypassed entirely: the
/// caller's sizes are used as-is and insufficient free space is a hard
/// `NoSpace` failure rather than a smaller allocation (spec §4.4
/// "Exact-size mode").
pub fn provision(
    free_physical: &ExtentMap,
    loop_holes_logical: &ExtentMap,
    block_size: u64,
    work_blocks: u64,
    exact: Option<ExactSizes>,
) -> Result<Provisioned, Error> {
    let work_bytes = work_blocks
        .checked_mul(block_size)
        .ok_or_else(|| Error::Overflow("work_blocks * block_size overflowed".into()))?;

    match exact {
        Some(sizes) => {
            let primary_blocks = sizes.primary_bytes / block_size.max(1);
            let (primary, chosen_blocks) = select_primary_extents(
                free_physical,
                loop_holes_logical,
                block_size,
                work_blocks,
                primary_blocks,
            )?;
            if chosen_blocks * block_size < sizes.primary_bytes {
                return Err(Error::NoSpace(format!(
                    "exact primary size {} bytes requested, only {} bytes available",
                    sizes.primary_bytes,
                    chosen_blocks * block_size
                )));
            }
            Ok(Provisioned {
                primary,
                primary_bytes: sizes.primary_bytes,
                secondary_bytes: sizes.secondary_bytes,
                ram_buffer_bytes: 0,
            })
        }
        None => {
            let (ram_buffer, total_storage) = default_sizes(work_bytes, block_size)?;
            let total_blocks = total_storage / block_size.max(1);

            let (primary, primary_blocks) = select_primary_extents(
                free_physical,
                loop_holes_logical,
                block_size,
                work_blocks,
                total_blocks,
            )?;
            let secondary_blocks = total_blocks - primary_blocks;

            Ok(Provisioned {
                primary,
                primary_bytes: primary_blocks * block_size,
                secondary_bytes: secondary_blocks * block_size,
                ram_buffer_bytes: ram_buffer,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Extent, Tag};

    fn ext(p: u64, l: u64, len: u64) -> Extent {
        Extent::new(p, l, len, Tag::Default)
    }

    #[test]
    fn select_primary_extents_caps_at_quota() {
        let mut free = ExtentMap::new();
        free.insert(ext(0, 0, 1000)).unwrap();
        let mut holes = ExtentMap::new();
        holes.insert(ext(0, 0, 1000)).unwrap();

        let (chosen, blocks) =
            select_primary_extents(&free, &holes, 1, 1_000_000, 10).unwrap();
        assert_eq!(blocks, 10);
        assert_eq!(chosen.total_length(), 10);
    }

    #[test]
    fn exact_mode_fails_with_no_space_when_insufficient() {
        let mut free = ExtentMap::new();
        free.insert(ext(0, 0, 5)).unwrap();
        let mut holes = ExtentMap::new();
        holes.insert(ext(0, 0, 5)).unwrap();

        // min_len floor from work_blocks/1024 is tiny here so the 5-block
        // extent survives filtering; page-size alignment in the test
        // environment may still trim it below the requested 1000 bytes.
        let err = provision(
            &free,
            &holes,
            1,
            10,
            Some(ExactSizes {
                primary_bytes: 1000,
                secondary_bytes: 0,
            }),
        )
        .unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
    }
}
