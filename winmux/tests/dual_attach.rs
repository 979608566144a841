#![cfg(windows)]

#[path = "support/mod.rs"]
mod support;

use std::time::{Duration, Instant};

use support::client::TestClient;
use support::daemon::Proc;
use winmux_protocol::{Event, Request};

async fn next_output(client: &mut TestClient, deadline: Instant) -> Option<Vec<u8>> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, client.recv()).await {
            Ok(Ok(Some(Event::Output { data, .. }))) => return Some(data),
            Ok(Ok(Some(_))) => continue,
            _ => return None,
        }
    }
}

#[tokio::test]
async fn a_second_attach_warm_replays_before_seeing_new_chunks() {
    let _guard = support::lock();
    let daemon = Proc::spawn("{}").expect("daemon starts");

    let mut a = TestClient::connect().await.expect("client a connects");
    let create = a
        .roundtrip(Request::CreateSession {
            name: "dual-attach".to_string(),
            shell: Some("cmd.exe".to_string()),
            cwd: None,
            env: None,
            cols: None,
            rows: None,
        })
        .await
        .expect("create succeeds");
    let Event::Created { session_id } = create else { panic!("unexpected reply: {create:?}") };

    let attached = a.roundtrip(Request::Attach { id_or_name: session_id.clone() }).await.expect("attach a succeeds");
    assert!(matches!(attached, Event::Attached { .. }));

    a.send(&Request::Input { session_id: session_id.clone(), data: "echo hi\r\n".to_string() })
        .await
        .expect("input send succeeds");

    let deadline = Instant::now() + Duration::from_secs(2);
    let a_tail = next_output(&mut a, deadline).await.expect("client a sees output before attaching client b");

    // Client b attaches after output has already accumulated in the ring
    // buffer; its first chunk should be a non-empty warm replay, not silence.
    let mut b = TestClient::connect().await.expect("client b connects");
    let attached_b =
        b.roundtrip(Request::Attach { id_or_name: session_id.clone() }).await.expect("attach b succeeds");
    assert!(matches!(attached_b, Event::Attached { .. }));

    let b_deadline = Instant::now() + Duration::from_secs(2);
    let b_first = next_output(&mut b, b_deadline).await.expect("client b receives a warm-replay chunk");
    assert!(!b_first.is_empty(), "warm replay chunk should not be empty");
    // The daemon may have produced more output for `a` between the two
    // attaches, so only assert a prefix/suffix relationship between the two
    // tails rather than byte-for-byte equality.
    let shorter_len = a_tail.len().min(b_first.len());
    assert!(
        a_tail.ends_with(&b_first[..shorter_len]) || b_first.ends_with(&a_tail[..shorter_len]),
        "b's warm replay should overlap with a's accumulated tail"
    );

    drop(daemon);
}
