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

//! The error taxonomy for the relocation engine and its I/O backends.
//!
//! Leaf I/O failures and engine-level invariant violations both funnel
//! through [`Error`]. Most call sites still use `anyhow::Result` and attach
//! context the way the rest of this crate does; `Error` is the type the
//! engine needs to be able to match on (`NoSpace` vs `FileTooLarge` vs a
//! plain `IoError`, for instance, get different exit codes and different
//! retry/force-run semantics).

use std::cell::Cell;
use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("permission denied: {0}")]
    NoPermission(String),

    #[error("device is busy: {0}")]
    DeviceBusy(String),

    #[error("inconsistent enumeration: {0}")]
    InconsistentEnumeration(String),

    #[error("invalid filesystem: {0}")]
    InvalidFilesystem(String),

    #[error("file too large: {0}")]
    FileTooLarge(String),

    #[error("no space: {0}")]
    NoSpace(String),

    #[error("overflow: {0}")]
    Overflow(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("replay mismatch: {0}")]
    ReplayMismatch(String),

    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

impl Error {
    /// Positive errno-style process exit code, per the CLI contract (spec §6/§7).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::NoPermission(_) => libc::EACCES,
            Error::DeviceBusy(_) => libc::EBUSY,
            Error::InconsistentEnumeration(_) => libc::EINVAL,
            Error::InvalidFilesystem(_) => libc::EINVAL,
            Error::FileTooLarge(_) => libc::EFBIG,
            Error::NoSpace(_) => libc::ENOSPC,
            Error::Overflow(_) => libc::EOVERFLOW,
            Error::IoError(_) => libc::EIO,
            Error::ReplayMismatch(_) => libc::EINVAL,
            Error::InternalInvariant(_) => libc::EFAULT,
        }
    }

    /// `InternalInvariant` is always fatal and is always logged at FATAL
    /// with full context (spec §7); callers that can degrade other errors
    /// to warnings under `--force-run` must never do so for this variant.
    pub fn is_internal_invariant(&self) -> bool {
        matches!(self, Error::InternalInvariant(_))
    }
}

/// Marks an error as already having been logged to the user, so that outer
/// layers don't re-log it (spec §7: "a sign-bit convention in the source").
/// Rust errors aren't plain integers, so instead of stealing a bit we wrap
/// the error in a small `Cell`-backed flag.
#[derive(Debug)]
pub struct Reported<E> {
    inner: E,
    reported: Cell<bool>,
}

impl<E> Reported<E> {
    pub fn new(inner: E) -> Self {
        Reported {
            inner,
            reported: Cell::new(false),
        }
    }

    pub fn mark_reported(&self) {
        self.reported.set(true);
    }

    pub fn is_reported(&self) -> bool {
        self.reported.get()
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

impl<E: fmt::Display> fmt::Display for Reported<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl<E: std::error::Error + 'static> std::error::Error for Reported<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_stable() {
        assert_eq!(Error::NoSpace("x".into()).exit_code(), libc::ENOSPC);
        assert_eq!(Error::FileTooLarge("x".into()).exit_code(), libc::EFBIG);
        assert!(Error::InternalInvariant("x".into()).is_internal_invariant());
        assert!(!Error::NoSpace("x".into()).is_internal_invariant());
    }

    #[test]
    fn reported_flag_round_trips() {
        let r = Reported::new(Error::NoSpace("x".into()));
        assert!(!r.is_reported());
        r.mark_reported();
        assert!(r.is_reported());
    }
}
