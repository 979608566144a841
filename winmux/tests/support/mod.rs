// This module is used from multiple different test files, each of which
// gets compiled into its own binary. Not all the binaries use all the
// stuff here.
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

pub mod client;
pub mod daemon;

/// winmuxd listens on a single well-known pipe name (`\\.\pipe\winmuxd`),
/// unlike shpool's per-invocation `--socket` path, so only one daemon
/// process may be alive across this whole test binary at a time. Every
/// test that spawns a `daemon::Proc` takes this lock for its duration.
pub static DAEMON_LOCK: Mutex<()> = Mutex::new(());

pub fn lock() -> std::sync::MutexGuard<'static, ()> {
    DAEMON_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn wait_until<P>(mut pred: P) -> anyhow::Result<()>
where
    P: FnMut() -> anyhow::Result<bool>,
{
    let mut sleep_dur = Duration::from_millis(10);
    for _ in 0..14 {
        if pred()? {
            return Ok(());
        }
        std::thread::sleep(sleep_dur);
        sleep_dur *= 2;
    }
    Err(anyhow::anyhow!("pred never became true"))
}

pub fn winmux_bin() -> PathBuf {
    let mut path = std::env::current_exe().expect("current_exe");
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.join("winmux.exe")
}
