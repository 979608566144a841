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

//! The session state machine: one pseudoconsole, one child process, an
//! output ring buffer, and a listener set, matching the teacher's
//! `daemon/shell.rs` in shape (a read loop task plus a waiter task sharing
//! an `Arc`-wrapped inner struct) even though the primitives underneath are
//! tokio tasks instead of OS threads.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;
use winmux_protocol::SessionState as WireSessionState;
use winmux_protocol::SessionSummary;

use crate::config::Config;
use crate::consts;
use crate::pty::{ChildProcess, PseudoConsole, Pty, PtyError};
use crate::ring_buffer::RingBuffer;

/// Receives the two kinds of notification a session's listeners care
/// about. Kept as a trait object (a "sink", per the design note preferring
/// an abstract capability over a raw function pointer) so the fan-out can
/// be exercised in tests without a connection or a pipe.
pub trait OutputSink: Send + Sync {
    fn on_output(&self, data: Bytes);
    fn on_exit(&self, code: Option<i32>);
}

struct ListenerEntry {
    id: u64,
    sink: std::sync::Arc<dyn OutputSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLifecycle {
    Running,
    Exited,
}

impl From<SessionLifecycle> for WireSessionState {
    fn from(value: SessionLifecycle) -> Self {
        match value {
            SessionLifecycle::Running => WireSessionState::Running,
            SessionLifecycle::Exited => WireSessionState::Exited,
        }
    }
}

pub struct Session {
    id: String,
    name: String,
    shell: String,
    cwd: String,
    cols: AtomicU16,
    rows: AtomicU16,
    pid: AtomicU32,
    created_at: DateTime<FixedOffset>,
    last_active_at: Mutex<DateTime<FixedOffset>>,
    lifecycle: Mutex<SessionLifecycle>,
    console: Mutex<Option<PseudoConsole>>,
    input: tokio::sync::Mutex<Option<tokio::fs::File>>,
    child: Mutex<Option<ChildProcess>>,
    ring_buffer: Mutex<RingBuffer>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener_id: AtomicU32,
    cancel: CancellationToken,
}

pub struct CreateSessionRequest {
    pub name: String,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<Vec<(String, String)>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

impl Session {
    /// Open a pseudoconsole, spawn the configured shell under it, and start
    /// the read loop and exit waiter. Returns the session already in the
    /// `Running` state.
    #[instrument(skip(request, config), fields(session_id, session_name = %request.name))]
    pub fn create(
        request: CreateSessionRequest,
        config: &Config,
    ) -> Result<std::sync::Arc<Session>, PtyError> {
        let id = Uuid::new_v4().simple().to_string();
        tracing::Span::current().record("session_id", &id.as_str());

        let name = if request.name.is_empty() { id[..6].to_string() } else { request.name };
        let cols = request.cols.unwrap_or(consts::DEFAULT_COLS);
        let rows = request.rows.unwrap_or(consts::DEFAULT_ROWS);
        let shell = config.resolve_shell(request.shell.as_deref());
        let cwd = config.resolve_cwd(request.cwd.as_deref());
        let env = request.env.unwrap_or_default();

        let mut env_overlay = env;
        env_overlay.push(("WMUX".to_string(), "1".to_string()));
        env_overlay.push(("WMUX_SESSION".to_string(), name.clone()));

        let pty = Pty::new(cols, rows)?;
        let child = pty.spawn(&shell, Some(&cwd), &env_overlay)?;
        let pid = child.pid;
        debug!(pid, "spawned shell under pseudoconsole");

        let Pty { console, input, output } = pty;

        let now: DateTime<FixedOffset> = Utc::now().into();
        let session = std::sync::Arc::new(Session {
            id,
            name,
            shell,
            cwd,
            cols: AtomicU16::new(cols),
            rows: AtomicU16::new(rows),
            pid: AtomicU32::new(pid),
            created_at: now,
            last_active_at: Mutex::new(now),
            lifecycle: Mutex::new(SessionLifecycle::Running),
            console: Mutex::new(Some(console)),
            input: tokio::sync::Mutex::new(Some(input)),
            child: Mutex::new(Some(child)),
            ring_buffer: Mutex::new(RingBuffer::new(config.buffer_size)),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        });

        Session::spawn_read_loop(session.clone(), output);
        Session::spawn_waiter(session.clone());
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn created_at(&self) -> DateTime<FixedOffset> {
        self.created_at
    }

    pub fn lifecycle(&self) -> SessionLifecycle {
        *self.lifecycle.lock().unwrap()
    }

    /// Write `data` to the PTY input handle under the per-session input
    /// lock. A no-op once the session has exited.
    #[instrument(skip(self, data), fields(session_id = %self.id))]
    pub async fn write_input(&self, data: &[u8]) {
        let mut guard = self.input.lock().await;
        let Some(file) = guard.as_mut() else { return };
        if let Err(err) = file.write_all(data).await {
            warn!(error = %err, "write_input failed");
            return;
        }
        if let Err(err) = file.flush().await {
            warn!(error = %err, "write_input flush failed");
            return;
        }
        *self.last_active_at.lock().unwrap() = Utc::now().into();
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        self.cols.store(cols, Ordering::SeqCst);
        self.rows.store(rows, Ordering::SeqCst);
        if let Some(console) = self.console.lock().unwrap().as_ref() {
            if let Err(err) = console.resize(cols, rows) {
                warn!(error = %err, "resize failed");
            }
        }
    }

    /// Register a listener. If the ring buffer already holds output, `sink`
    /// receives that tail synchronously, before this call returns and
    /// before any subsequently produced chunk reaches any listener.
    pub fn add_listener(&self, sink: std::sync::Arc<dyn OutputSink>) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst) as u64;
        let mut listeners = self.listeners.lock().unwrap();
        let tail = self.ring_buffer.lock().unwrap().snapshot();
        listeners.push(ListenerEntry { id, sink: sink.clone() });
        drop(listeners);
        if !tail.is_empty() {
            sink.on_output(tail);
        }
        id
    }

    pub fn remove_listener(&self, id: u64) {
        self.listeners.lock().unwrap().retain(|entry| entry.id != id);
    }

    /// Best-effort terminate the process tree rooted at the child's pid.
    /// Errors are swallowed; the actual state transition happens through
    /// the waiter once the process has actually exited.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn kill(&self) {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        let result = std::process::Command::new("taskkill.exe")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output();
        if let Err(err) = result {
            warn!(error = %err, pid, "taskkill failed");
        }
    }

    pub fn summary(&self) -> SessionSummary {
        let pid = self.pid.load(Ordering::SeqCst);
        SessionSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            state: self.lifecycle().into(),
            cols: self.cols.load(Ordering::SeqCst),
            rows: self.rows.load(Ordering::SeqCst),
            shell: self.shell.clone(),
            cwd: self.cwd.clone(),
            pid: if pid == 0 { None } else { Some(pid) },
            created_at: self.created_at,
            last_active_at: *self.last_active_at.lock().unwrap(),
        }
    }

    /// Repeatedly read from the PTY output handle, fan each chunk out to
    /// the listener set, and feed the ring buffer. `output` is owned
    /// exclusively by this task; closing the pseudoconsole in `finish`
    /// breaks the pipe out from under an in-flight read, which is what
    /// turns a kill/exit into an EOF here.
    fn spawn_read_loop(session: std::sync::Arc<Session>, mut output: tokio::fs::File) {
        tokio::spawn(async move {
            let mut scratch = vec![0u8; consts::READ_CHUNK_SIZE];
            loop {
                match output.read(&mut scratch).await {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&scratch[..n]);
                        session.ring_buffer.lock().unwrap().push(&chunk);
                        *session.last_active_at.lock().unwrap() = Utc::now().into();
                        let listeners: Vec<_> = session
                            .listeners
                            .lock()
                            .unwrap()
                            .iter()
                            .map(|entry| entry.sink.clone())
                            .collect();
                        for sink in listeners {
                            let chunk = chunk.clone();
                            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                                sink.on_output(chunk)
                            }))
                            .is_err()
                            {
                                warn!("listener panicked in on_output, ignoring");
                            }
                        }
                    }
                    Err(err) => {
                        debug!(error = %err, "pty read loop terminating on I/O error");
                        break;
                    }
                }
            }
            session.finish(None);
        });
    }

    fn spawn_waiter(session: std::sync::Arc<Session>) {
        let Some(handle) = session.child.lock().unwrap().as_ref().map(ChildProcess::raw_handle)
        else {
            return;
        };
        let cancel = session.cancel.clone();
        tokio::spawn(async move {
            let code = tokio::select! {
                _ = cancel.cancelled() => None,
                result = tokio::task::spawn_blocking(move || crate::pty::wait_for_exit(handle)) => {
                    result.unwrap_or(None)
                }
            };
            session.finish(code);
        });
    }

    /// Idempotent terminal cleanup: release the pseudoconsole and the input
    /// handle exactly once, flip lifecycle to `Exited`, and notify every
    /// listener of the exit exactly once. The output handle is released by
    /// the read loop task itself once this closes the console out from
    /// under it.
    fn finish(&self, code: Option<i32>) {
        {
            let mut lifecycle = self.lifecycle.lock().unwrap();
            if *lifecycle == SessionLifecycle::Exited {
                return;
            }
            *lifecycle = SessionLifecycle::Exited;
        }
        self.cancel.cancel();
        self.console.lock().unwrap().take();
        if let Ok(mut guard) = self.input.try_lock() {
            guard.take();
        }
        self.child.lock().unwrap().take();

        let listeners: Vec<_> =
            self.listeners.lock().unwrap().iter().map(|entry| entry.sink.clone()).collect();
        for sink in listeners {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sink.on_exit(code)))
                .is_err()
            {
                warn!("listener panicked in on_exit, ignoring");
            }
        }
    }
}

#[cfg(test)]
impl Session {
    /// A session with no pseudoconsole, input, or child — enough state to
    /// exercise the registry and the ring buffer/listener fan-out (the part
    /// of `Session` the `OutputSink` trait exists to make testable without
    /// spawning a real process) directly. Used by this module's own tests
    /// and by `registry`'s.
    pub(crate) fn new_bare_for_test(id: &str, name: &str, buffer_size: usize) -> std::sync::Arc<Session> {
        let now: DateTime<FixedOffset> = Utc::now().into();
        std::sync::Arc::new(Session {
            id: id.to_string(),
            name: name.to_string(),
            shell: "test.exe".to_string(),
            cwd: ".".to_string(),
            cols: AtomicU16::new(80),
            rows: AtomicU16::new(24),
            pid: AtomicU32::new(0),
            created_at: now,
            last_active_at: Mutex::new(now),
            lifecycle: Mutex::new(SessionLifecycle::Running),
            console: Mutex::new(None),
            input: tokio::sync::Mutex::new(None),
            child: Mutex::new(None),
            ring_buffer: Mutex::new(RingBuffer::new(buffer_size)),
            listeners: Mutex::new(Vec::new()),
            next_listener_id: AtomicU32::new(0),
            cancel: CancellationToken::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn bare_session(buffer_size: usize) -> Arc<Session> {
        Session::new_bare_for_test("test-id", "test-name", buffer_size)
    }

    #[derive(Default)]
    struct RecordingSink {
        output: Mutex<Vec<Bytes>>,
        exits: Mutex<Vec<Option<i32>>>,
    }

    impl OutputSink for RecordingSink {
        fn on_output(&self, data: Bytes) {
            self.output.lock().unwrap().push(data);
        }
        fn on_exit(&self, code: Option<i32>) {
            self.exits.lock().unwrap().push(code);
        }
    }

    /// Testable Property 6: a listener attaching while the ring buffer
    /// already holds content observes that tail before any chunk produced
    /// after the attach point.
    #[test]
    fn add_listener_observes_warm_tail_before_later_chunks() {
        let session = bare_session(4096);
        session.ring_buffer.lock().unwrap().push(b"warm tail");

        let sink = Arc::new(RecordingSink::default());
        session.add_listener(sink.clone());

        let later = Bytes::from_static(b"later chunk");
        let listeners: Vec<_> =
            session.listeners.lock().unwrap().iter().map(|e| e.sink.clone()).collect();
        for listener in listeners {
            listener.on_output(later.clone());
        }

        let received = sink.output.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(&received[0][..], b"warm tail");
        assert_eq!(&received[1][..], b"later chunk");
    }

    /// A listener attaching to a session with an empty ring buffer gets no
    /// synchronous replay call at all.
    #[test]
    fn add_listener_on_empty_buffer_gets_no_replay() {
        let session = bare_session(4096);
        let sink = Arc::new(RecordingSink::default());
        session.add_listener(sink.clone());
        assert!(sink.output.lock().unwrap().is_empty());
    }

    /// A panicking listener doesn't stop the exit notification from
    /// reaching its siblings.
    #[test]
    fn a_panicking_listener_does_not_block_siblings_on_exit() {
        struct PanickingSink;
        impl OutputSink for PanickingSink {
            fn on_output(&self, _data: Bytes) {}
            fn on_exit(&self, _code: Option<i32>) {
                panic!("boom");
            }
        }

        let session = bare_session(4096);
        session.add_listener(Arc::new(PanickingSink));
        let sibling = Arc::new(RecordingSink::default());
        session.add_listener(sibling.clone());

        session.finish(Some(0));

        assert_eq!(*sibling.exits.lock().unwrap(), vec![Some(0)]);
    }

    /// Testable Property 8 (applied to session-level disposal): calling
    /// `finish` twice notifies every listener of the exit exactly once.
    #[test]
    fn finish_is_idempotent() {
        let session = bare_session(4096);
        let sink = Arc::new(RecordingSink::default());
        session.add_listener(sink.clone());

        session.finish(Some(7));
        session.finish(Some(99));

        assert_eq!(*sink.exits.lock().unwrap(), vec![Some(7)]);
        assert_eq!(session.lifecycle(), SessionLifecycle::Exited);
    }
}
