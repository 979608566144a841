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

//! A thin, owned wrapper around the Win32 ConPTY (pseudoconsole) API.
//!
//! This mirrors the shape of `alacritty_terminal`'s own Windows ConPTY
//! backend (dynamically-loaded `CreatePseudoConsole`/`ResizePseudoConsole`/
//! `ClosePseudoConsole`, a `STARTUPINFOEXW` with a one-attribute process
//! thread attribute list) but built on the `windows` crate's typed bindings
//! instead of raw `winapi` + `GetProcAddress`, and exposes the pipe ends as
//! plain `tokio::fs::File`s rather than anonymous-pipe mio sources, since
//! the session core here is tokio-based rather than mio-based.

use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::FromRawHandle;

use thiserror::Error;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, COORD, HPCON,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CreateProcessW, DeleteProcThreadAttributeList, GetExitCodeProcess,
    InitializeProcThreadAttributeList, UpdateProcThreadAttribute, WaitForSingleObject,
    EXTENDED_STARTUPINFO_PRESENT, INFINITE, LPPROC_THREAD_ATTRIBUTE_LIST, PROCESS_INFORMATION,
    STARTUPINFOEXW,
};

/// Undocumented-by-header attribute id for binding a pseudoconsole handle
/// into a process's thread attribute list. Matches the constant every
/// ConPTY integration (including Windows Terminal itself) hardcodes, since
/// the `windows` metadata crate doesn't expose it as a named item.
const PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE: usize = 0x00020016;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("ConPTY API call failed: {0}")]
    Win32(#[from] windows::core::Error),
    #[error("failed to spawn child process: {0}")]
    Spawn(windows::core::Error),
}

/// The pseudoconsole handle on its own, separate from the pipe ends, so a
/// session can hold it behind a plain (non-async) mutex for `resize` while
/// the output pipe is read exclusively by the read-loop task and the input
/// pipe is written from async request handlers.
pub struct PseudoConsole(HPCON);

unsafe impl Send for PseudoConsole {}

impl Drop for PseudoConsole {
    fn drop(&mut self) {
        unsafe { ClosePseudoConsole(self.0) };
    }
}

impl PseudoConsole {
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let size = COORD { X: cols as i16, Y: rows as i16 };
        unsafe { ResizePseudoConsole(self.0, size)? };
        Ok(())
    }
}

/// A freshly opened pseudoconsole plus the two pipe ends the spawned child
/// will be wired up to.
pub struct Pty {
    pub console: PseudoConsole,
    pub input: tokio::fs::File,
    pub output: tokio::fs::File,
}

impl Pty {
    /// Create a new pseudoconsole sized `cols` x `rows`.
    pub fn new(cols: u16, rows: u16) -> Result<Self, PtyError> {
        let mut pty_side_in = HANDLE::default();
        let mut our_side_out = HANDLE::default();
        unsafe { CreatePipe(&mut pty_side_in, &mut our_side_out, None, 0)? };

        let mut our_side_in = HANDLE::default();
        let mut pty_side_out = HANDLE::default();
        unsafe { CreatePipe(&mut pty_side_out, &mut our_side_in, None, 0)? };

        let size = COORD { X: cols as i16, Y: rows as i16 };
        let handle = unsafe { CreatePseudoConsole(size, pty_side_in, pty_side_out, 0)? };

        // The daemon's own ends of the pipes were duplicated into the
        // pseudoconsole; close our copies of the child-facing ends.
        unsafe {
            let _ = CloseHandle(pty_side_in);
            let _ = CloseHandle(pty_side_out);
        }

        let input = unsafe { tokio::fs::File::from_raw_handle(our_side_in.0 as *mut _) };
        let output = unsafe { tokio::fs::File::from_raw_handle(our_side_out.0 as *mut _) };

        Ok(Pty { console: PseudoConsole(handle), input, output })
    }

    /// Launch `command_line` attached to this pseudoconsole, in `cwd` (or
    /// the daemon's own cwd if `None`), with `extra_env` appended to the
    /// daemon's own environment block.
    pub fn spawn(
        &self,
        command_line: &str,
        cwd: Option<&str>,
        extra_env: &[(String, String)],
    ) -> Result<ChildProcess, PtyError> {
        let mut attr_list_size = 0usize;
        unsafe {
            // Expected to "fail" with ERROR_INSUFFICIENT_BUFFER; this call's
            // purpose is only to learn the buffer size to allocate.
            let _ = InitializeProcThreadAttributeList(
                LPPROC_THREAD_ATTRIBUTE_LIST::default(),
                1,
                None,
                &mut attr_list_size,
            );
        }

        let mut attr_list_buf = vec![0u8; attr_list_size];
        let attr_list = LPPROC_THREAD_ATTRIBUTE_LIST(attr_list_buf.as_mut_ptr() as *mut _);
        unsafe {
            InitializeProcThreadAttributeList(attr_list, 1, None, &mut attr_list_size)
                .map_err(PtyError::Spawn)?;
        }

        let mut startup_info = STARTUPINFOEXW::default();
        startup_info.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        startup_info.lpAttributeList = attr_list;

        unsafe {
            UpdateProcThreadAttribute(
                attr_list,
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
                Some(&self.console.0 as *const HPCON as *const _),
                std::mem::size_of::<HPCON>(),
                None,
                None,
            )
            .map_err(PtyError::Spawn)?;
        }

        let mut cmdline_wide = to_wide(command_line);
        let cwd_wide = cwd.map(to_wide);
        let env_block = extra_env_block(extra_env);

        let mut process_info = PROCESS_INFORMATION::default();
        let result = unsafe {
            CreateProcessW(
                None,
                PWSTR(cmdline_wide.as_mut_ptr()),
                None,
                None,
                false,
                EXTENDED_STARTUPINFO_PRESENT,
                env_block.as_ref().map(|b| b.as_ptr() as *const _),
                cwd_wide.as_ref().map(|w| PCWSTR(w.as_ptr())).unwrap_or_default(),
                &startup_info.StartupInfo,
                &mut process_info,
            )
        };

        unsafe { DeleteProcThreadAttributeList(attr_list) };

        result.map_err(PtyError::Spawn)?;
        unsafe {
            let _ = CloseHandle(process_info.hThread);
        }

        Ok(ChildProcess { process_handle: process_info.hProcess, pid: process_info.dwProcessId })
    }
}

/// A handle to the spawned shell process, independent of the pseudoconsole
/// it was launched against.
pub struct ChildProcess {
    process_handle: HANDLE,
    pub pid: u32,
}

unsafe impl Send for ChildProcess {}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.process_handle);
        }
    }
}

impl ChildProcess {
    /// The raw handle value, valid for as long as this `ChildProcess` is
    /// alive. Used to hand a `Send`-able, non-owning handle to a
    /// `spawn_blocking` waiter without closing it twice.
    pub fn raw_handle(&self) -> isize {
        self.process_handle.0
    }
}

/// Block the current (blocking-pool) thread until `handle` signals, then
/// return its exit code. `handle` is borrowed conceptually: this function
/// never closes it.
pub fn wait_for_exit(handle: isize) -> Option<i32> {
    let handle = HANDLE(handle);
    unsafe {
        WaitForSingleObject(handle, INFINITE);
        let mut code = 0u32;
        if GetExitCodeProcess(handle, &mut code).is_ok() {
            Some(code as i32)
        } else {
            None
        }
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
}

/// Build a `KEY=VALUE\0...\0\0` wide-string environment block that extends
/// the daemon's own environment, or `None` when there's nothing to add (so
/// the child simply inherits the daemon's block unmodified).
fn extra_env_block(extra_env: &[(String, String)]) -> Option<Vec<u16>> {
    if extra_env.is_empty() {
        return None;
    }
    let mut block = Vec::new();
    for (key, value) in std::env::vars().chain(extra_env.iter().cloned()) {
        block.extend(to_wide(&format!("{key}={value}")));
    }
    block.push(0);
    Some(block)
}
