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

//! A deterministic "replay-from-file" backend (spec §4.3): extent
//! enumeration is read from a plain-text dump (one `physical logical length
//! user_data` line per extent, spec §6) instead of querying the filesystem
//! live, while `copy`/`zero` still perform real `pread`/`pwrite` against a
//! backing device file and a backing storage file. Used to replay a
//! previously-captured scenario bit-for-bit, and as the `--self-test`
//! backend's ingestion format. The header/line-validation approach is
//! ported from `osmet/file.rs`'s `osmet_file_read_header`, which rejects a
//! malformed or truncated header outright rather than trying to recover.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::errors::Error;
use crate::extent::{Direction, Extent, ExtentVec, Tag};
use crate::io::{DeviceInfo, IoBackend, OpenArgs};

const MAGIC: &str = "FSREMAP-REPLAY-1";

/// Parses one dump section (terminated by a blank line or EOF) into an
/// [`ExtentVec`], in the `physical logical length user_data` text format
/// documented at spec §6.
fn parse_section<R: BufRead>(reader: &mut R) -> Result<ExtentVec, Error> {
    let mut v = ExtentVec::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(Error::IoError)?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 4 {
            return Err(Error::InvalidArgument(format!(
                "malformed extent line: {line:?}"
            )));
        }
        let parse = |s: &str| -> Result<u64, Error> {
            s.parse::<u64>()
                .map_err(|e| Error::InvalidArgument(format!("bad integer {s:?}: {e}")))
        };
        let physical = parse(fields[0])?;
        let logical = parse(fields[1])?;
        let length = parse(fields[2])?;
        let tag = Tag::from_user_data(parse(fields[3])?)?;
        if length == 0 {
            return Err(Error::InvalidArgument("zero-length extent in dump".into()));
        }
        v.append(Extent::new(physical, logical, length, tag));
    }
    Ok(v)
}

/// Parsed contents of a replay dump file: device/storage geometry plus the
/// three extent sections `read_extents` would otherwise discover live.
struct Dump {
    device_length: u64,
    block_size: u64,
    loop_extents: ExtentVec,
    free_extents: ExtentVec,
    zero_extents: ExtentVec,
}

fn read_dump(path: &Path) -> Result<Dump, Error> {
    let file = File::open(path).map_err(Error::IoError)?;
    let mut reader = BufReader::new(file);

    let mut header = String::new();
    reader.read_line(&mut header).map_err(Error::IoError)?;
    if header.trim() != MAGIC {
        return Err(Error::InvalidArgument(format!(
            "not a replay dump (bad magic {:?})",
            header.trim()
        )));
    }

    let mut geometry = String::new();
    reader.read_line(&mut geometry).map_err(Error::IoError)?;
    let fields: Vec<&str> = geometry.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(Error::InvalidArgument(
            "malformed geometry line in replay dump".into(),
        ));
    }
    let device_length: u64 = fields[0]
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("bad device_length: {e}")))?;
    let block_size: u64 = fields[1]
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("bad block_size: {e}")))?;

    // Consume the separating blank line, if present.
    let mut blank = String::new();
    reader.read_line(&mut blank).map_err(Error::IoError)?;

    let loop_extents = parse_section(&mut reader)?;
    let free_extents = parse_section(&mut reader)?;
    let zero_extents = parse_section(&mut reader)?;

    Ok(Dump {
        device_length,
        block_size,
        loop_extents,
        free_extents,
        zero_extents,
    })
}

pub struct ReplayBackend {
    dump_path: PathBuf,
    device_file: Option<File>,
    storage_file: Option<File>,
    storage_path: Option<PathBuf>,
    device_length: u64,
    block_size: u64,
    free_extents: ExtentVec,
    zero_extents: ExtentVec,
    /// Cache of extents already returned by `read_extents`, kept so a
    /// second call (the engine never makes one, but tests may) replays
    /// identically rather than re-reading the file.
    cache: HashMap<&'static str, ExtentVec>,
    last_dir: Option<Direction>,
}

impl ReplayBackend {
    pub fn new(dump_path: PathBuf) -> Self {
        ReplayBackend {
            dump_path,
            device_file: None,
            storage_file: None,
            storage_path: None,
            device_length: 0,
            block_size: 0,
            free_extents: ExtentVec::new(),
            zero_extents: ExtentVec::new(),
            cache: HashMap::new(),
            last_dir: None,
        }
    }

    fn rw_target(&mut self, physical: u64) -> Result<(&mut File, u64), Error> {
        if physical < self.device_length {
            let f = self
                .device_file
                .as_mut()
                .ok_or_else(|| Error::InternalInvariant("device file not open".into()))?;
            Ok((f, physical * self.block_size))
        } else {
            let f = self
                .storage_file
                .as_mut()
                .ok_or_else(|| Error::InternalInvariant("storage file not open".into()))?;
            Ok((f, (physical - self.device_length) * self.block_size))
        }
    }
}

impl IoBackend for ReplayBackend {
    fn open(&mut self, args: &OpenArgs) -> Result<DeviceInfo, Error> {
        let dump = read_dump(&self.dump_path)?;
        self.device_length = dump.device_length;
        self.block_size = dump.block_size;
        self.free_extents = dump.free_extents;
        self.zero_extents = dump.zero_extents;
        self.cache.insert("loop", dump.loop_extents);

        let device_file = OpenOptions::new()
            .read(true)
            .write(!args.simulate_run)
            .create(true)
            .truncate(false)
            .open(&args.device_path)
            .map_err(Error::IoError)?;
        device_file
            .set_len(dump.device_length * dump.block_size)
            .map_err(Error::IoError)?;
        self.device_file = Some(device_file);

        let loop_file_length = self
            .cache
            .get("loop")
            .and_then(|v| v.iter().map(|e| e.logical_end()).max())
            .unwrap_or(0);

        Ok(DeviceInfo {
            device_length: dump.device_length,
            loop_file_length,
            block_size: dump.block_size,
        })
    }

    fn read_extents(&mut self) -> Result<(ExtentVec, ExtentVec, ExtentVec), Error> {
        let loop_extents = self
            .cache
            .get("loop")
            .cloned()
            .ok_or_else(|| Error::InternalInvariant("open() was not called".into()))?;
        Ok((loop_extents, self.free_extents.clone(), self.zero_extents.clone()))
    }

    fn create_storage(&mut self, secondary_bytes: u64, _buffer_bytes: u64) -> Result<(), Error> {
        let path = self
            .dump_path
            .with_extension("storage");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(Error::IoError)?;
        file.set_len(secondary_bytes).map_err(Error::IoError)?;
        self.storage_file = Some(file);
        self.storage_path = Some(path);
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

        let block_size = self.block_size;
        let mut buf = vec![0u8; (length * block_size) as usize];
        {
            let (f, off) = self.rw_target(from_physical)?;
            f.seek(SeekFrom::Start(off)).map_err(Error::IoError)?;
            f.read_exact(&mut buf).map_err(Error::IoError)?;
        }
        {
            let (f, off) = self.rw_target(to_physical)?;
            f.seek(SeekFrom::Start(off)).map_err(Error::IoError)?;
            f.write_all(&buf).map_err(Error::IoError)?;
        }
        Ok(())
    }

    fn zero(&mut self, physical: u64, length: u64) -> Result<(), Error> {
        if physical == 0 {
            return Err(Error::InternalInvariant(
                "refusing to zero block 0 of the device".into(),
            ));
        }
        let block_size = self.block_size;
        let buf = vec![0u8; (length * block_size) as usize];
        let (f, off) = self.rw_target(physical)?;
        f.seek(SeekFrom::Start(off)).map_err(Error::IoError)?;
        f.write_all(&buf).map_err(Error::IoError)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.last_dir = None;
        if let Some(f) = self.device_file.as_ref() {
            f.sync_data().map_err(Error::IoError)?;
        }
        if let Some(f) = self.storage_file.as_ref() {
            f.sync_data().map_err(Error::IoError)?;
        }
        Ok(())
    }

    fn umount_dev(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn close_storage(&mut self) -> Result<(), Error> {
        self.storage_file = None;
        if let Some(path) = self.storage_path.take() {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), Error> {
        self.device_file = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn parses_well_formed_dump_and_rejects_bad_magic() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "NOT-THE-MAGIC").unwrap();
        writeln!(tmp, "10 1").unwrap();
        assert!(read_dump(tmp.path()).is_err());

        let mut tmp2 = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp2, "{MAGIC}").unwrap();
        writeln!(tmp2, "10 1").unwrap();
        writeln!(tmp2).unwrap();
        writeln!(tmp2, "0 0 4 0").unwrap();
        writeln!(tmp2).unwrap();
        writeln!(tmp2, "5 5 2 0").unwrap();
        writeln!(tmp2).unwrap();
        let dump = read_dump(tmp2.path()).unwrap();
        assert_eq!(dump.device_length, 10);
        assert_eq!(dump.block_size, 1);
        assert_eq!(dump.loop_extents.len(), 1);
        assert_eq!(dump.free_extents.len(), 1);
        assert_eq!(dump.zero_extents.len(), 0);
    }
}
