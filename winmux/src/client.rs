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

//! Dialing the daemon's named pipe, with the auto-spawn-and-retry dance
//! that stands in for the systemd socket activation `libshpool` relies on
//! on Unix (`libshpool::daemon::systemd`) — Windows named pipes have no
//! activation-on-connect equivalent, so a client spawns the daemon itself.

use std::time::Duration;

use anyhow::{bail, Context};
use libwinmux::consts;
use libwinmux::framing::{read_frame, write_frame};
use tokio::net::windows::named_pipe::ClientOptions;
use tracing::{debug, info};
use winmux_protocol::{Event, Request};

const CONNECT_RETRIES: u32 = 20;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(150);

pub struct Client {
    pipe: tokio::net::windows::named_pipe::NamedPipeClient,
}

impl Client {
    /// Dial the daemon, spawning it first if its pipe doesn't exist yet.
    pub async fn connect() -> anyhow::Result<Client> {
        if let Some(pipe) = try_dial().await {
            return Ok(Client { pipe });
        }

        spawn_daemon()?;

        for attempt in 0..CONNECT_RETRIES {
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
            if let Some(pipe) = try_dial().await {
                return Ok(Client { pipe });
            }
            debug!(attempt, "daemon not accepting connections yet");
        }

        bail!("timed out waiting for the winmux daemon to start")
    }

    pub async fn send(&mut self, request: &Request) -> anyhow::Result<()> {
        write_frame(&mut self.pipe, request).await.context("writing request")?;
        Ok(())
    }

    /// Read one event off the wire, or `Ok(None)` if the daemon closed the
    /// connection cleanly.
    pub async fn recv(&mut self) -> anyhow::Result<Option<Event>> {
        let event = read_frame::<_, Event>(&mut self.pipe).await.context("reading event")?;
        Ok(event)
    }

    /// Send a request and wait for exactly one reply event, for the
    /// request/reply-shaped subcommands (everything except `attach`, which
    /// keeps reading events for the lifetime of the session).
    pub async fn roundtrip(&mut self, request: Request) -> anyhow::Result<Event> {
        self.send(&request).await?;
        match self.recv().await? {
            Some(event) => Ok(event),
            None => bail!("daemon closed the connection without replying"),
        }
    }
}

async fn try_dial() -> Option<tokio::net::windows::named_pipe::NamedPipeClient> {
    ClientOptions::new().open(consts::PIPE_NAME).ok()
}

/// Launch `winmux daemon` as a detached, windowless child of the current
/// process. Mirrors `libshpool::daemon::run`'s own process, just spawned
/// from the client side instead of assumed already-running.
fn spawn_daemon() -> anyhow::Result<()> {
    use std::os::windows::process::CommandExt;

    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    const DETACHED_PROCESS: u32 = 0x0000_0008;

    let exe = std::env::current_exe().context("resolving current executable")?;
    info!(exe = %exe.display(), "auto-spawning winmux daemon");

    std::process::Command::new(exe)
        .arg("daemon")
        .creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS)
        .spawn()
        .context("spawning daemon process")?;
    Ok(())
}
