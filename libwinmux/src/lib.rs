// Copyright 2024 WinMux Contributors
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

//! The winmux daemon's session core: a pseudoconsole-backed session state
//! machine, a ring-buffered output fan-out, and the named-pipe RPC server
//! that winmux clients talk to.
//!
//! This crate is the "hard engineering" half of winmux. CLI argument
//! parsing, the attach-mode TUI, and daemon auto-spawn live in the
//! `winmux` binary crate and only ever talk to the daemon through the wire
//! protocol in `winmux-protocol`.

pub mod config;
pub mod consts;
pub mod framing;
pub mod pty;
pub mod registry;
pub mod ring_buffer;
pub mod security;
pub mod server;
pub mod session;

pub use config::Config;
pub use registry::SessionRegistry;
pub use server::Server;
