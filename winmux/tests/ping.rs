#![cfg(windows)]

#[path = "support/mod.rs"]
mod support;

use support::daemon::Proc;

#[test]
fn ping_gets_a_pong_with_a_recent_server_time() {
    let _guard = support::lock();
    let daemon = Proc::spawn("{}").expect("daemon starts");

    let output = std::process::Command::new(support::winmux_bin())
        .arg("ping")
        .output()
        .expect("winmux ping runs");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("pong ("), "unexpected output: {stdout}");

    drop(daemon);
}
