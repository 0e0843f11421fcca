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

//! An in-memory `IoBackend` simulator. Used by the engine's own unit tests
//! and as the underlying device/storage model for the `--test` and
//! `--self-test` CLI backends (spec §4.3: "an in-memory simulator").

use crate::errors::Error;
use crate::extent::{Direction, ExtentVec};
use crate::io::{DeviceInfo, IoBackend, OpenArgs};

/// One block's worth of content, for test assertions. We track content by
/// block rather than by byte; callers that need finer granularity should
/// set `block_size` to 1 (as every concrete scenario in spec §8 does).
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    block_size: u64,
    device: Vec<u8>,
    secondary: Vec<u8>,
    loop_extents: ExtentVec,
    free_extents: ExtentVec,
    zero_extents: ExtentVec,
    copy_count: u64,
    zero_count: u64,
    last_dir: Option<Direction>,
    flush_count: u64,
}

impl MemoryBackend {
    /// Builds a backend over `device`, one byte per block (`block_size`
    /// blocks' worth of content already laid out in `device`).
    pub fn new(
        device: Vec<u8>,
        block_size: u64,
        loop_extents: ExtentVec,
        free_extents: ExtentVec,
        zero_extents: ExtentVec,
    ) -> Self {
        MemoryBackend {
            block_size,
            device,
            secondary: Vec::new(),
            loop_extents,
            free_extents,
            zero_extents,
            copy_count: 0,
            zero_count: 0,
            last_dir: None,
            flush_count: 0,
        }
    }

    pub fn device_blocks(&self) -> &[u8] {
        &self.device
    }

    pub fn copy_count(&self) -> u64 {
        self.copy_count
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    fn device_length_blocks(&self) -> u64 {
        self.device.len() as u64
    }

    fn slot(&mut self, physical: u64) -> Result<&mut u8, Error> {
        let dev_len = self.device_length_blocks();
        if physical < dev_len {
            Ok(&mut self.device[physical as usize])
        } else {
            let idx = (physical - dev_len) as usize;
            if idx >= self.secondary.len() {
                return Err(Error::InternalInvariant(format!(
                    "storage offset {physical} out of range"
                )));
            }
            Ok(&mut self.secondary[idx])
        }
    }

    fn read_slot(&self, physical: u64) -> Result<u8, Error> {
        let dev_len = self.device_length_blocks();
        if physical < dev_len {
            Ok(self.device[physical as usize])
        } else {
            let idx = (physical - dev_len) as usize;
            self.secondary
                .get(idx)
                .copied()
                .ok_or_else(|| Error::InternalInvariant(format!("storage offset {physical} out of range")))
        }
    }
}

impl IoBackend for MemoryBackend {
    fn open(&mut self, _args: &OpenArgs) -> Result<DeviceInfo, Error> {
        Ok(DeviceInfo {
            device_length: self.device_length_blocks(),
            loop_file_length: self.loop_extents.iter().map(|e| e.logical_end()).max().unwrap_or(0),
            block_size: self.block_size,
        })
    }

    fn read_extents(&mut self) -> Result<(ExtentVec, ExtentVec, ExtentVec), Error> {
        Ok((
            self.loop_extents.clone(),
            self.free_extents.clone(),
            self.zero_extents.clone(),
        ))
    }

    fn create_storage(&mut self, secondary_bytes: u64, _buffer_bytes: u64) -> Result<(), Error> {
        let blocks = secondary_bytes / self.block_size.max(1);
        self.secondary = vec![0u8; blocks as usize];
        Ok(())
    }

    fn copy(
        &mut self,
        dir: Direction,
        from_physical: u64,
        to_physical: u64,
        length: u64,
    ) -> Result<(), Error> {
        if self.last_dir.is_some() && self.last_dir != Some(dir) {
            self.flush()?;
        }
        self.last_dir = Some(dir);
        for i in 0..length {
            let v = self.read_slot(from_physical + i)?;
            *self.slot(to_physical + i)? = v;
        }
        self.copy_count += 1;
        Ok(())
    }

    fn zero(&mut self, physical: u64, length: u64) -> Result<(), Error> {
        if physical == 0 {
            return Err(Error::InternalInvariant(
                "refusing to zero block 0 of the device".into(),
            ));
        }
        for i in 0..length {
            *self.slot(physical + i)? = 0;
        }
        self.zero_count += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.flush_count += 1;
        self.last_dir = None;
        Ok(())
    }

    fn umount_dev(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close_storage(&mut self) -> Result<(), Error> {
        self.secondary.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extent::{Extent, Tag};

    #[test]
    fn copy_moves_content_and_refuses_block_zero_zero() {
        let mut be = MemoryBackend::new(
            vec![10, 20, 30, 40],
            1,
            ExtentVec::from_vec(vec![Extent::new(0, 0, 4, Tag::Default)]),
            ExtentVec::new(),
            ExtentVec::new(),
        );
        be.copy(Direction::DevToDev, 0, 2, 1).unwrap();
        assert_eq!(be.device_blocks(), &[10, 20, 10, 40]);
        assert!(be.zero(0, 1).is_err());
    }

    #[test]
    fn storage_addressing_overlays_device_then_secondary() {
        let mut be = MemoryBackend::new(vec![1, 2, 3, 4], 1, ExtentVec::new(), ExtentVec::new(), ExtentVec::new());
        be.create_storage(2, 1).unwrap();
        be.copy(Direction::DevToStorage, 0, 4, 1).unwrap(); // storage offset 4 == secondary[0]
        assert_eq!(be.read_slot(4).unwrap(), 1);
    }
}
