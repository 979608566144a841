#![cfg(windows)]

#[path = "support/mod.rs"]
mod support;

use support::daemon::Proc;

#[test]
fn listing_an_empty_daemon_prints_nothing() {
    let _guard = support::lock();
    let daemon = Proc::spawn("{}").expect("daemon starts");

    let output = std::process::Command::new(support::winmux_bin())
        .arg("ls")
        .output()
        .expect("winmux ls runs");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert!(output.stdout.is_empty(), "expected no sessions, got: {:?}", String::from_utf8_lossy(&output.stdout));

    drop(daemon);
}
