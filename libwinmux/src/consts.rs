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

use std::time::Duration;

/// The well-known name the daemon listens on, rooted under `\\.\pipe\`.
pub const PIPE_NAME: &str = r"\\.\pipe\winmuxd";

/// Size of the scratch buffer used by a session's PTY read loop.
pub const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Default per-session output ring buffer capacity in bytes, used when the
/// config doesn't set `bufferSize`. The literal configuration default from
/// the external JSON schema (4 KiB) rather than the larger figure floated
/// elsewhere as a rule of thumb for warm-attach replay windows; an operator
/// who wants a bigger replay window sets `bufferSize` explicitly.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default pseudoconsole dimensions for a newly created session.
pub const DEFAULT_COLS: u16 = 120;
pub const DEFAULT_ROWS: u16 = 30;

/// Default values for the external JSON config.
pub const DEFAULT_SHELL: &str = "pwsh.exe";
pub const DEFAULT_CWD: &str = "%USERPROFILE%";
pub const DEFAULT_MAX_SESSIONS: usize = 50;

/// Grace period the connection disposal path waits for the writer task to
/// drain before giving up on a clean join.
pub const WRITER_JOIN_GRACE: Duration = Duration::from_millis(500);

/// Number of simultaneous pending pipe instances we keep prepared so a new
/// connection can always be accepted while earlier ones are still served.
/// Windows named pipes cap this; we stay well under `PIPE_UNLIMITED_INSTANCES`.
pub const MAX_PENDING_INSTANCES: u32 = 254;
