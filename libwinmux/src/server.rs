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

//! The named-pipe RPC server: acceptor loop, per-connection reader/writer
//! tasks, and request dispatch against the session registry.
//!
//! Shaped after `libshpool`'s `daemon::server::Server::serve` (an accept
//! loop handing each connection to a concurrent handler, itself split into
//! a reader task and a writer task talking over an internal channel) but
//! built on `tokio::net::windows::named_pipe` instead of a blocking
//! `UnixListener`, since a Windows named pipe server must explicitly
//! re-arm a new instance after every accept rather than just looping on
//! `accept()`.

use std::sync::Arc;

use bytes::Bytes;
use tokio::net::windows::named_pipe::ServerOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use winmux_protocol::{DispatchError, Event, Request};

use crate::consts;
use crate::framing::{read_frame, write_frame};
use crate::registry::SessionRegistry;
use crate::security::current_user_only;
use crate::session::{CreateSessionRequest, OutputSink, Session};

pub struct Server {
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Server { registry, cancel: CancellationToken::new() }
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Accept connections on `\\.\pipe\winmuxd` until cancelled. Each
    /// accepted pipe instance is handed to its own connection task; a
    /// fresh instance is armed immediately after, so the daemon can always
    /// accept a new connection while earlier ones are still being served.
    #[instrument(skip(self))]
    pub async fn serve(&self) -> anyhow::Result<()> {
        let security = current_user_only()?;
        let mut next_conn_id = 0u64;

        // The first instance is created with `first_pipe_instance(true)`
        // so a second daemon can't silently steal the well-known name out
        // from under a running one.
        let mut server = unsafe {
            ServerOptions::new()
                .first_pipe_instance(true)
                .max_instances(consts::MAX_PENDING_INSTANCES)
                .create_with_security_attributes_raw(
                    consts::PIPE_NAME,
                    &security.attributes as *const _ as *const _,
                )?
        };

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("acceptor cancelled, shutting down");
                    return Ok(());
                }
                result = server.connect() => {
                    result?;
                    let conn_id = next_conn_id;
                    next_conn_id += 1;

                    let next = unsafe {
                        ServerOptions::new()
                            .max_instances(consts::MAX_PENDING_INSTANCES)
                            .create_with_security_attributes_raw(
                                consts::PIPE_NAME,
                                &security.attributes as *const _ as *const _,
                            )?
                    };
                    let connected = std::mem::replace(&mut server, next);

                    let registry = self.registry.clone();
                    let cancel = self.cancel.child_token();
                    tokio::spawn(async move {
                        handle_connection(conn_id, connected, registry, cancel).await;
                    });
                }
            }
        }
    }
}

/// Forwards a session's output/exit notifications onto one connection's
/// outbound queue, tagged with the session id that produced them.
struct ConnectionSink {
    session_id: String,
    tx: mpsc::UnboundedSender<Event>,
}

impl OutputSink for ConnectionSink {
    fn on_output(&self, data: Bytes) {
        let _ = self.tx.send(Event::Output { session_id: self.session_id.clone(), data: data.to_vec() });
    }

    fn on_exit(&self, code: Option<i32>) {
        let _ = self.tx.send(Event::Exit { session_id: self.session_id.clone(), code });
    }
}

/// A disposal hook run exactly once, tagged with the session it was
/// registered against so `Detach{sessionId}` can run just that one hook
/// instead of tearing down the whole connection.
type DisposeHook = (String, Box<dyn FnOnce() + Send>);
type HookList = Arc<std::sync::Mutex<Vec<DisposeHook>>>;

#[instrument(skip(pipe, registry, cancel), fields(conn_id))]
async fn handle_connection(
    conn_id: u64,
    pipe: tokio::net::windows::named_pipe::NamedPipeServer,
    registry: Arc<SessionRegistry>,
    cancel: CancellationToken,
) {
    debug!("connection accepted");
    let (mut read_half, mut write_half) = tokio::io::split(pipe);
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let hooks: HookList = Arc::new(std::sync::Mutex::new(Vec::new()));

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(err) = write_frame(&mut write_half, &event).await {
                        warn!(error = %err, "writer exiting on I/O error");
                        break;
                    }
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame::<_, Request>(&mut read_half) => frame,
        };
        let request = match frame {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(err) => {
                debug!(error = %err, "reader exiting on framing error");
                break;
            }
        };

        dispatch(request, &registry, &tx, &hooks).await;
    }

    dispose(conn_id, &hooks, tx, writer).await;
}

#[instrument(skip(request, registry, tx, hooks), fields(variant = request.variant_name()))]
async fn dispatch(
    request: Request,
    registry: &Arc<SessionRegistry>,
    tx: &mpsc::UnboundedSender<Event>,
    hooks: &HookList,
) {
    match request {
        Request::Ping => {
            let _ = tx.send(Event::Pong { server_time: chrono::Utc::now().into() });
        }
        Request::List => {
            let _ = tx.send(Event::Sessions { sessions: registry.list() });
        }
        Request::CreateSession { name, shell, cwd, env, cols, rows } => {
            let result = registry.create(CreateSessionRequest { name, shell, cwd, env, cols, rows });
            match result {
                Ok(session) => {
                    let _ = tx.send(Event::Created { session_id: session.id().to_string() });
                }
                Err(err) => {
                    warn!(error = %err, "CreateSession failed");
                    let _ = tx.send(Event::Error {
                        req_id: None,
                        code: "CREATE_FAILED".to_string(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Request::Attach { id_or_name } => match registry.get(&id_or_name) {
            None => {
                let _ = tx.send(Event::error(None, &DispatchError::NotFound));
            }
            Some(session) => {
                register_listener(&session, tx.clone(), hooks);
                let _ = tx.send(Event::Attached { session_id: session.id().to_string() });
            }
        },
        Request::Input { session_id, data } => match registry.get(&session_id) {
            None => {
                let _ = tx.send(Event::error(None, &DispatchError::NotFound));
            }
            Some(session) => session.write_input(&data).await,
        },
        Request::Resize { session_id, cols, rows } => match registry.get(&session_id) {
            None => {
                let _ = tx.send(Event::error(None, &DispatchError::NotFound));
            }
            Some(session) => session.resize(cols, rows),
        },
        Request::Kill { session_id } => match registry.get(&session_id) {
            None => {
                let _ = tx.send(Event::error(None, &DispatchError::NotFound));
            }
            Some(session) => {
                session.kill();
                let _ = tx.send(Event::Ack { req_id: None });
            }
        },
        Request::Detach { session_id } => {
            // Resolution of the open question in the design notes: the
            // server unregisters exactly this session's listener on this
            // connection rather than leaving `Detach` as a pure
            // client-side no-op, and rather than tearing down the whole
            // connection (a client may be attached to more than one
            // session at once).
            let mut guard = hooks.lock().unwrap();
            let (matching, rest): (Vec<_>, Vec<_>) =
                guard.drain(..).partition(|(sid, _)| *sid == session_id);
            *guard = rest;
            drop(guard);
            for (_, hook) in matching {
                let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
            }
        }
    }
}

fn register_listener(session: &Arc<Session>, tx: mpsc::UnboundedSender<Event>, hooks: &HookList) {
    let sink = Arc::new(ConnectionSink { session_id: session.id().to_string(), tx });
    let listener_id = session.add_listener(sink);

    let session_id = session.id().to_string();
    let session = session.clone();
    hooks
        .lock()
        .unwrap()
        .push((session_id, Box::new(move || session.remove_listener(listener_id))));
}

/// Runs every disposal hook exactly once, closes the outbound queue, and
/// joins the writer with a bounded grace period. Safe to call more than
/// once: the hook list is drained on first call, leaving nothing to run
/// on a second.
async fn dispose(
    conn_id: u64,
    hooks: &HookList,
    tx: mpsc::UnboundedSender<Event>,
    writer: tokio::task::JoinHandle<()>,
) {
    let to_run: Vec<_> = std::mem::take(&mut *hooks.lock().unwrap());
    for (_, hook) in to_run {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
        if result.is_err() {
            warn!("disposal hook panicked");
        }
    }
    drop(tx);

    if tokio::time::timeout(consts::WRITER_JOIN_GRACE, writer).await.is_err() {
        warn!(conn_id, "writer task did not join within the grace period");
    }
    debug!(conn_id, "connection disposed");
}
