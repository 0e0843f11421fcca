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

//! `fsremap`: relocates the blocks of a device in place so that a loop file
//! currently straddling them can be converted to occupy the whole device,
//! or vice versa, without an external backup (spec §1).

pub mod cmdline;
pub mod engine;
pub mod errors;
pub mod extent;
pub mod io;
pub mod journal;
pub mod pool;
pub mod progress;
pub mod storage;
pub mod util;
