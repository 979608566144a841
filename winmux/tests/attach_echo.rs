#![cfg(windows)]

#[path = "support/mod.rs"]
mod support;

use std::time::{Duration, Instant};

use support::client::TestClient;
use support::daemon::Proc;
use winmux_protocol::{Event, Request};

#[tokio::test]
async fn input_echoed_by_the_shell_shows_up_in_output() {
    let _guard = support::lock();
    let daemon = Proc::spawn("{}").expect("daemon starts");

    let mut client = TestClient::connect().await.expect("client connects");
    let create = client
        .roundtrip(Request::CreateSession {
            name: "echo-test".to_string(),
            shell: Some("cmd.exe".to_string()),
            cwd: None,
            env: None,
            cols: None,
            rows: None,
        })
        .await
        .expect("create succeeds");
    let Event::Created { session_id } = create else { panic!("unexpected reply: {create:?}") };

    let attached = client
        .roundtrip(Request::Attach { id_or_name: session_id.clone() })
        .await
        .expect("attach succeeds");
    assert!(matches!(attached, Event::Attached { .. }), "unexpected reply: {attached:?}");

    client
        .send(&Request::Input { session_id: session_id.clone(), data: "echo hi\r\n".to_string() })
        .await
        .expect("input send succeeds");

    let deadline = Instant::now() + Duration::from_secs(2);
    let mut seen = Vec::new();
    while Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Ok(Ok(Some(event))) = tokio::time::timeout(remaining, client.recv()).await else { break };
        if let Event::Output { data, .. } = event {
            seen.extend_from_slice(&data);
            if String::from_utf8_lossy(&seen).contains("hi") {
                drop(daemon);
                return;
            }
        }
    }
    panic!("did not see echoed output within 2s, got: {:?}", String::from_utf8_lossy(&seen));
}
