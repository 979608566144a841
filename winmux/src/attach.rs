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

//! The `attach` raw-mode loop: forward stdin to the session, render its
//! output, and keep a one-line status bar pinned to the bottom row.
//!
//! `libshpool`'s own attach loop (`libshpool::attach::do_attach` handing
//! off to a raw tty via `libshpool::tty`) runs on blocking threads and
//! `termios`; this one is tokio-based and uses `crossterm` for raw mode and
//! cursor control, since there's no termios on Windows.

use std::io::{self, Read, Write};

use anyhow::Context;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::{cursor, queue, style};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use winmux_protocol::{Event, Request};

use crate::client::Client;

/// Byte a Windows console delivers for Ctrl-\ in raw mode; used here as the
/// local-only "detach without killing the session" hotkey.
const DETACH_BYTE: u8 = 0x1c;

pub async fn run(id_or_name: String) -> anyhow::Result<()> {
    let mut client = Client::connect().await?;
    let reply = client.roundtrip(Request::Attach { id_or_name: id_or_name.clone() }).await?;
    let session_id = match reply {
        Event::Attached { session_id } => session_id,
        Event::Error { code, message, .. } => {
            anyhow::bail!("attach failed: {code}: {message}");
        }
        other => anyhow::bail!("unexpected reply to attach: {other:?}"),
    };

    let guard = RawModeGuard::enter()?;
    draw_status_bar(&id_or_name, "connecting")?;

    let (input_tx, mut input_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let stdin_thread = std::thread::spawn(move || forward_stdin(input_tx));

    let result = event_loop(&mut client, &session_id, &id_or_name, &mut input_rx).await;

    drop(guard);
    // The stdin-forwarding thread is blocked on a synchronous read and will
    // only unblock (and notice the channel is gone) once the user presses a
    // key after detach; it's daemonized by not joining it.
    let _ = stdin_thread;

    result
}

async fn event_loop(
    client: &mut Client,
    session_id: &str,
    display_name: &str,
    input_rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) -> anyhow::Result<()> {
    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            chunk = input_rx.recv() => {
                let Some(chunk) = chunk else { break };
                if chunk.contains(&DETACH_BYTE) {
                    debug!("local detach hotkey observed");
                    // Fire-and-forget: the server runs the disposal hook but
                    // never replies to `Detach`, so waiting for a reply here
                    // would block forever.
                    let _ = client.send(&Request::Detach { session_id: session_id.to_string() }).await;
                    break;
                }
                client.send(&Request::Input { session_id: session_id.to_string(), data: chunk }).await?;
            }
            event = client.recv() => {
                match event? {
                    None => break,
                    Some(Event::Output { data, .. }) => {
                        stdout.write_all(&data).context("writing session output")?;
                        stdout.flush().ok();
                    }
                    Some(Event::Exit { code, .. }) => {
                        draw_status_bar(display_name, &format!("exited ({code:?})"))?;
                        break;
                    }
                    Some(other) => {
                        debug!(?other, "ignoring unrelated event while attached");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reads raw bytes from stdin on a blocking thread (crossterm's own event
/// reader is blocking too) and forwards each chunk over `tx`. Returns once
/// the channel's receiver is dropped.
fn forward_stdin(tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut stdin = io::stdin();
    let mut buf = [0u8; 4096];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "stdin read failed");
                break;
            }
        }
    }
}

/// Reserves the bottom terminal row via a DECSTBM scroll region and draws a
/// one-line status bar into it, then restores the cursor to where session
/// output should keep scrolling.
fn draw_status_bar(name: &str, hint: &str) -> anyhow::Result<()> {
    let (cols, rows) = crossterm::terminal::size().unwrap_or((80, 24));
    let mut stdout = io::stdout();

    // Exclude the last row from the scroll region so session output never
    // overwrites the status bar.
    write!(stdout, "\x1b[1;{}r", rows.saturating_sub(1))?;

    let label = format!(" winmux: {name}  ({hint}, Ctrl-\\ to detach) ");
    let label = if label.len() as u16 > cols { label[..cols as usize].to_string() } else { label };

    queue!(
        stdout,
        cursor::SavePosition,
        cursor::MoveTo(0, rows.saturating_sub(1)),
        style::Print(&label),
        cursor::RestorePosition,
    )?;
    stdout.flush()?;
    Ok(())
}

struct RawModeGuard;

impl RawModeGuard {
    fn enter() -> anyhow::Result<RawModeGuard> {
        enable_raw_mode().context("entering raw mode")?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        // Reset the scroll region back to the whole screen before leaving.
        let mut stdout = io::stdout();
        let _ = write!(stdout, "\x1b[r");
        let _ = stdout.flush();
        if let Err(err) = disable_raw_mode() {
            warn!(error = %err, "failed to disable raw mode");
        }
    }
}
