use std::path::PathBuf;
use std::process::{Child, Command};

use tempfile::TempDir;

use super::{wait_until, winmux_bin};

/// A running `winmux daemon` child process, killed on drop.
///
/// Unlike `shpool`'s per-test `--socket` path, `winmuxd` always listens on
/// the single well-known pipe name, so callers must hold `support::lock()`
/// for the lifetime of this struct.
pub struct Proc {
    child: Child,
    _tmp_dir: TempDir,
    pub log_file: PathBuf,
}

impl Proc {
    /// Spawn a daemon using `config_json` as its config file contents, and
    /// block until its pipe is accepting connections.
    pub fn spawn(config_json: &str) -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new().prefix("winmux-test").tempdir()?;
        let config_path = tmp_dir.path().join("config.json");
        std::fs::write(&config_path, config_json)?;
        let log_file = tmp_dir.path().join("daemon.log");

        let child = Command::new(winmux_bin())
            .arg("--log-file")
            .arg(&log_file)
            .arg("-vv")
            .arg("--config-file")
            .arg(&config_path)
            .arg("daemon")
            .spawn()?;

        let proc = Proc { child, _tmp_dir: tmp_dir, log_file };
        wait_until(|| Ok(proc.is_listening()))?;
        Ok(proc)
    }

    fn is_listening(&self) -> bool {
        std::fs::OpenOptions::new().read(true).write(true).open(libwinmux::consts::PIPE_NAME).is_ok()
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
