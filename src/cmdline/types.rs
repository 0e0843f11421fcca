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

//! Miscellaneous helper types for the CLI surface.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Error, Result};

use crate::engine::ClearPolicy;
use crate::util::parse_byte_size;

/// A byte count parsed from a `k|M|G|T|P|E|Z|Y`-suffixed string (spec §6's
/// `-m`/`-s`/`-xp`/`-xs`), e.g. `4M`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSize(pub u64);

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_byte_size(s).map(ByteSize).map_err(Error::from)
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which I/O backend to use (spec §6's `--posix | --test | --self-test`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Posix,
    Test,
    SelfTest,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "posix" => Ok(Backend::Posix),
            "test" => Ok(Backend::Test),
            "self-test" => Ok(Backend::SelfTest),
            other => Err(anyhow!("unknown backend {other:?}")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Backend::Posix => "posix",
            Backend::Test => "test",
            Backend::SelfTest => "self-test",
        };
        write!(f, "{s}")
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::Posix
    }
}

/// Wraps [`ClearPolicy`] so it can be selected by one of three exclusive
/// flags (spec §6's `--clear-all | --clear-minimal | --clear-none`)
/// instead of a single valued option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearPolicyArg(pub ClearPolicy);

impl Default for ClearPolicyArg {
    fn default() -> Self {
        ClearPolicyArg(ClearPolicy::All)
    }
}
