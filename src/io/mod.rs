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

//! The I/O abstraction (spec §4.3): a trait exposing device/loop/free-space
//! extent enumeration, block copy, zero-fill, flush, and storage lifecycle.
//! Unlike the original C++ inheritance hierarchy, per-backend state is
//! completely distinct and no shared base class is needed (spec §9).
//!
//! **Storage addressing convention.** A "storage physical" block offset
//! passed to [`IoBackend::copy`]/[`IoBackend::zero`] is a single numeric
//! space that overlays the device's own address space: offsets below
//! `DeviceInfo::device_length` name a primary-storage block (an ordinary,
//! currently-free device block — so a `DevToStorage` copy landing there is,
//! at the backend level, just another in-place device write), and offsets
//! at or above it name an index into the secondary spill file, computed as
//! `offset - device_length`. This lets primary/secondary placement be a
//! pure bookkeeping concern of the storage provisioner (§4.4) without a
//! separate channel to tell backends which physical blocks are "really"
//! primary — the reserve-then-`MAP_FIXED`-stitch scheme of spec §5 falls
//! out of this addressing directly: the backend mmaps one contiguous
//! anonymous region of `device_length + secondary_bytes` and replaces the
//! `[0, device_length)` prefix with a view of the real device and the
//! suffix with a view of the spill file.

pub mod memory;
pub mod posix;
pub mod replay;
pub mod selftest;

use crate::errors::Error;
use crate::extent::{Direction, ExtentVec};

/// Arguments needed to open a backend (spec §4.3/§6).
#[derive(Debug, Clone)]
pub struct OpenArgs {
    pub device_path: String,
    pub loop_file_path: String,
    pub zero_file_path: Option<String>,
    pub force_run: bool,
    pub simulate_run: bool,
}

/// Device/loop-file geometry discovered at `open()` time.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub device_length: u64,
    pub loop_file_length: u64,
    pub block_size: u64,
}

/// The eight operations every I/O backend must provide.
pub trait IoBackend {
    /// Acquires handles, refuses to proceed if the device appears mounted
    /// writable, records device length, loop-file length, effective block
    /// size.
    fn open(&mut self, args: &OpenArgs) -> Result<DeviceInfo, Error>;

    /// Enumerates loop-file extents, device free extents and (optionally)
    /// zero-filled extents. Vectors are sorted by `logical`.
    fn read_extents(&mut self) -> Result<(ExtentVec, ExtentVec, ExtentVec), Error>;

    /// Allocates the auxiliary storage (spec §4.4).
    fn create_storage(&mut self, secondary_bytes: u64, buffer_bytes: u64) -> Result<(), Error>;

    /// Queues a copy; the backend may coalesce with neighbors in direction
    /// `dir` but must flush when the direction changes or the queue is
    /// full.
    fn copy(
        &mut self,
        dir: Direction,
        from_physical: u64,
        to_physical: u64,
        length: u64,
    ) -> Result<(), Error>;

    /// Queues a zeroing write.
    fn zero(&mut self, physical: u64, length: u64) -> Result<(), Error>;

    /// Drains the copy queue, drains any write-back buffer, fsyncs/msyncs
    /// as appropriate.
    fn flush(&mut self) -> Result<(), Error>;

    /// Unmounts the target device (and any intermediate loop device)
    /// before the destructive phase.
    fn umount_dev(&mut self) -> Result<(), Error>;

    /// Releases mapped memory, deletes the spill file.
    fn close_storage(&mut self) -> Result<(), Error>;

    /// Releases handles.
    fn close(&mut self) -> Result<(), Error>;
}
