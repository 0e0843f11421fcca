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

//! The persistence journal (spec §4.6): an append-only text file that
//! makes the destructive relocation phase crash-safe, provided the journal
//! lives on an unaffected filesystem. Line 1 records the run mode ("real
//! job" / "simulated job"); line 2 the exact primary/secondary storage
//! sizes chosen at provisioning time; every subsequent line a
//! `(remaining_on_device, remaining_in_storage)` progress tuple appended
//! after a significant move is flushed.
//!
//! On restart, a matching journal puts the journal in [`JournalState::Replaying`]:
//! every tuple the engine would produce is checked against the next
//! recorded tuple instead of being written, until the file is exhausted, at
//! which point the journal flips to [`JournalState::Recording`] and
//! subsequent calls append. This two-state design is named directly in
//! `original_source/fsremap/src/io/persist.cc`'s `do_read`/`do_write`/
//! `this_replaying` split.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::errors::Error;

const REAL_JOB_HEADER: &str = "real job";
const SIMULATED_JOB_HEADER: &str = "simulated job";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMode {
    Real,
    Simulated,
}

impl JobMode {
    fn header(self) -> &'static str {
        match self {
            JobMode::Real => REAL_JOB_HEADER,
            JobMode::Simulated => SIMULATED_JOB_HEADER,
        }
    }

    fn from_header(line: &str) -> Result<Self, Error> {
        match line {
            REAL_JOB_HEADER => Ok(JobMode::Real),
            SIMULATED_JOB_HEADER => Ok(JobMode::Simulated),
            other => Err(Error::ReplayMismatch(format!(
                "persistence file has unrecognized header {other:?}"
            ))),
        }
    }
}

/// Exact primary/secondary storage sizes, recorded once on line 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageSizes {
    pub primary_bytes: u64,
    pub secondary_bytes: u64,
}

/// A progress tuple: blocks remaining on the device vs. in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub remaining_on_device: u64,
    pub remaining_in_storage: u64,
}

#[derive(Debug)]
enum JournalState {
    /// Still reading back previously-recorded lines; `lines` holds the
    /// unread remainder in order.
    Replaying { lines: Vec<String> },
    Recording,
}

pub struct Journal {
    file: File,
    mode: JobMode,
    state: JournalState,
    sizes: Option<StorageSizes>,
}

impl Journal {
    /// Opens (or creates) the persistence file at `path`. If the file is
    /// new, writes the header for `mode` and enters [`JournalState::Recording`]
    /// immediately (spec §8 property 9: "empty loop file ... persistence
    /// records only the header and exact-sizes line"). If the file already
    /// exists, validates the header matches `mode` exactly and enters
    /// [`JournalState::Replaying`] over its remaining content.
    pub fn open(path: &Path, mode: JobMode) -> Result<Self, Error> {
        let existed = path.exists();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::IoError)?;
        }

        if !existed {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(Error::IoError)?;
            writeln!(file, "{}", mode.header()).map_err(Error::IoError)?;
            file.sync_data().map_err(Error::IoError)?;
            return Ok(Journal {
                file,
                mode,
                state: JournalState::Recording,
                sizes: None,
            });
        }

        let existing = File::open(path).map_err(Error::IoError)?;
        let mut reader = BufReader::new(existing);
        let mut header = String::new();
        reader.read_line(&mut header).map_err(Error::IoError)?;
        let recorded_mode = JobMode::from_header(header.trim())?;
        if recorded_mode != mode {
            return Err(Error::ReplayMismatch(format!(
                "persistence file was recorded for {:?}, but this run is {:?}",
                recorded_mode, mode
            )));
        }

        let mut sizes = None;
        let mut sizes_line = String::new();
        let n = reader.read_line(&mut sizes_line).map_err(Error::IoError)?;
        if n > 0 && !sizes_line.trim().is_empty() {
            sizes = Some(parse_sizes_line(&sizes_line)?);
        }

        let mut lines = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(Error::IoError)?;
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }

        let file = OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(Error::IoError)?;

        Ok(Journal {
            file,
            mode,
            state: JournalState::Replaying { lines },
            sizes,
        })
    }

    pub fn mode(&self) -> JobMode {
        self.mode
    }

    pub fn is_replaying(&self) -> bool {
        matches!(self.state, JournalState::Replaying { .. })
    }

    pub fn storage_sizes(&self) -> Option<StorageSizes> {
        self.sizes
    }

    /// Records the exact primary/secondary sizes chosen at provisioning
    /// time. Called at most once per run, immediately after provisioning.
    /// While replaying, this is a no-op validation against the recorded
    /// line rather than a write.
    pub fn record_storage_sizes(&mut self, sizes: StorageSizes) -> Result<(), Error> {
        match &mut self.state {
            JournalState::Recording => {
                writeln!(self.file, "{} {}", sizes.primary_bytes, sizes.secondary_bytes)
                    .map_err(Error::IoError)?;
                self.file.sync_data().map_err(Error::IoError)?;
                self.sizes = Some(sizes);
                Ok(())
            }
            JournalState::Replaying { .. } => {
                let recorded = self.sizes.ok_or_else(|| {
                    Error::ReplayMismatch("journal has no exact-sizes line to replay".into())
                })?;
                if recorded != sizes {
                    return Err(Error::ReplayMismatch(format!(
                        "replayed storage sizes {recorded:?} do not match computed {sizes:?}"
                    )));
                }
                Ok(())
            }
        }
    }

    /// The engine's single entry point after every significant move (spec
    /// §4.6: "`next(progress1, progress2)`"). While replaying, compares
    /// `progress` against the next recorded tuple and fails with
    /// [`Error::ReplayMismatch`] on any difference; once the recorded
    /// lines are exhausted, transparently flips to [`JournalState::Recording`]
    /// and this call (and all subsequent ones) append instead.
    pub fn next(&mut self, progress: Progress) -> Result<(), Error> {
        if let JournalState::Replaying { lines } = &mut self.state {
            if !lines.is_empty() {
                let line = lines.remove(0);
                let recorded = parse_progress_line(&line)?;
                if recorded != progress {
                    return Err(Error::ReplayMismatch(format!(
                        "replayed progress {recorded:?} does not match computed {progress:?}"
                    )));
                }
                return Ok(());
            }
            self.state = JournalState::Recording;
        }
        writeln!(
            self.file,
            "{} {}",
            progress.remaining_on_device, progress.remaining_in_storage
        )
        .map_err(Error::IoError)?;
        self.file.sync_data().map_err(Error::IoError)?;
        Ok(())
    }
}

fn parse_two_u64(line: &str) -> Result<(u64, u64), Error> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() != 2 {
        return Err(Error::ReplayMismatch(format!(
            "malformed persistence line: {line:?}"
        )));
    }
    let a = fields[0]
        .parse::<u64>()
        .map_err(|e| Error::ReplayMismatch(format!("bad integer in persistence line: {e}")))?;
    let b = fields[1]
        .parse::<u64>()
        .map_err(|e| Error::ReplayMismatch(format!("bad integer in persistence line: {e}")))?;
    Ok((a, b))
}

fn parse_sizes_line(line: &str) -> Result<StorageSizes, Error> {
    let (a, b) = parse_two_u64(line)?;
    Ok(StorageSizes {
        primary_bytes: a,
        secondary_bytes: b,
    })
}

fn parse_progress_line(line: &str) -> Result<Progress, Error> {
    let (a, b) = parse_two_u64(line)?;
    Ok(Progress {
        remaining_on_device: a,
        remaining_in_storage: b,
    })
}

/// Default persistence file path for job `id` under `dir` (spec §6:
/// `<dir>/.fsremap/job.<id>/fsremap.persist`).
pub fn default_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(".fsremap").join(format!("job.{id}")).join("fsremap.persist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_journal_records_header_only_and_enters_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsremap.persist");
        let journal = Journal::open(&path, JobMode::Real).unwrap();
        assert!(!journal.is_replaying());
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "real job\n");
    }

    #[test]
    fn mismatched_mode_on_restart_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsremap.persist");
        drop(Journal::open(&path, JobMode::Real).unwrap());
        let err = Journal::open(&path, JobMode::Simulated).unwrap_err();
        assert!(matches!(err, Error::ReplayMismatch(_)));
    }

    #[test]
    fn replay_then_record_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsremap.persist");

        {
            let mut journal = Journal::open(&path, JobMode::Real).unwrap();
            journal
                .record_storage_sizes(StorageSizes {
                    primary_bytes: 100,
                    secondary_bytes: 50,
                })
                .unwrap();
            journal
                .next(Progress {
                    remaining_on_device: 10,
                    remaining_in_storage: 5,
                })
                .unwrap();
            journal
                .next(Progress {
                    remaining_on_device: 5,
                    remaining_in_storage: 2,
                })
                .unwrap();
        }

        let mut journal = Journal::open(&path, JobMode::Real).unwrap();
        assert!(journal.is_replaying());
        journal
            .record_storage_sizes(StorageSizes {
                primary_bytes: 100,
                secondary_bytes: 50,
            })
            .unwrap();
        journal
            .next(Progress {
                remaining_on_device: 10,
                remaining_in_storage: 5,
            })
            .unwrap();
        assert!(journal.is_replaying());

        let err = journal
            .next(Progress {
                remaining_on_device: 999,
                remaining_in_storage: 999,
            })
            .unwrap_err();
        assert!(matches!(err, Error::ReplayMismatch(_)));
    }

    #[test]
    fn replay_exhausts_then_flips_to_recording_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fsremap.persist");

        {
            let mut journal = Journal::open(&path, JobMode::Real).unwrap();
            journal
                .record_storage_sizes(StorageSizes {
                    primary_bytes: 1,
                    secondary_bytes: 1,
                })
                .unwrap();
            journal
                .next(Progress {
                    remaining_on_device: 1,
                    remaining_in_storage: 1,
                })
                .unwrap();
        }

        let mut journal = Journal::open(&path, JobMode::Real).unwrap();
        journal
            .record_storage_sizes(StorageSizes {
                primary_bytes: 1,
                secondary_bytes: 1,
            })
            .unwrap();
        journal
            .next(Progress {
                remaining_on_device: 1,
                remaining_in_storage: 1,
            })
            .unwrap();
        assert!(journal.is_replaying());
        journal
            .next(Progress {
                remaining_on_device: 0,
                remaining_in_storage: 0,
            })
            .unwrap();
        assert!(!journal.is_replaying());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "real job\n1 1\n1 1\n0 0\n");
    }
}
