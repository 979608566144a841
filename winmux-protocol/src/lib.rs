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

//! Wire messages for the winmux client/daemon protocol.
//!
//! A message is a self-describing JSON record with a `type` discriminator
//! and variant-specific, lower-camel-case fields. Every message on the wire
//! is wrapped in a length-prefixed frame (see `FRAME_MAX_LEN` below); this
//! crate only defines the payload shapes, not the framing itself, so that a
//! client built against another language can round-trip the same JSON
//! without linking the tokio-based framing code.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

/// Maximum allowed frame payload, per the framing contract.
pub const FRAME_MAX_LEN: u32 = 64 * 1024 * 1024;

/// Errors that can occur while decoding a frame off the wire.
///
/// These are fatal to the connection they occur on; see `DispatchError`
/// for the per-request errors that the server recovers from.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("frame length {0} exceeds the {FRAME_MAX_LEN} byte maximum")]
    InvalidFrame(u32),
    #[error("I/O error while framing: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Errors surfaced to a single request; the connection survives these.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("session not found")]
    NotFound,
    #[error("{0} not implemented")]
    Unimplemented(String),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotFound => "NOT_FOUND",
            DispatchError::Unimplemented(_) => "UNIMPLEMENTED",
        }
    }
}

/// A request a client sends to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    Ping,
    List,
    CreateSession {
        #[serde(default)]
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        env: Option<Vec<(String, String)>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
    },
    Attach {
        id_or_name: String,
    },
    Input {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    Kill {
        session_id: String,
    },
    Detach {
        session_id: String,
    },
}

impl Request {
    /// The variant name, used for `UNIMPLEMENTED` error messages and logs.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::List => "List",
            Request::CreateSession { .. } => "CreateSession",
            Request::Attach { .. } => "Attach",
            Request::Input { .. } => "Input",
            Request::Resize { .. } => "Resize",
            Request::Kill { .. } => "Kill",
            Request::Detach { .. } => "Detach",
        }
    }
}

/// An asynchronous event the daemon streams back to a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Pong {
        server_time: DateTime<FixedOffset>,
    },
    Sessions {
        sessions: Vec<SessionSummary>,
    },
    Created {
        session_id: String,
    },
    Attached {
        session_id: String,
    },
    Output {
        session_id: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    Exit {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        req_id: Option<String>,
        code: String,
        message: String,
    },
}

impl Event {
    pub fn error(req_id: Option<String>, err: &DispatchError) -> Event {
        Event::Error { req_id, code: err.code().to_string(), message: err.to_string() }
    }
}

/// Lifecycle state of a session, as seen from the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Running,
    Exited,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Running => write!(f, "Running"),
            SessionState::Exited => write!(f, "Exited"),
        }
    }
}

/// A flat snapshot of a session's externally visible fields, used in
/// `Sessions` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub state: SessionState,
    pub cols: u16,
    pub rows: u16,
    pub shell: String,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub created_at: DateTime<FixedOffset>,
    pub last_active_at: DateTime<FixedOffset>,
}

/// Base64 (de)serialization for binary payload fields, since the wire
/// encoding is UTF-8 text.
mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T>(value: &T) -> T
    where
        T: Serialize + for<'de> Deserialize<'de>,
    {
        let encoded = serde_json::to_string(value).expect("encode");
        serde_json::from_str(&encoded).expect("decode")
    }

    #[test]
    fn request_variants_roundtrip() {
        let cases = vec![
            Request::Ping,
            Request::List,
            Request::CreateSession {
                name: "mysession".into(),
                shell: Some("pwsh".into()),
                cwd: Some("C:\\".into()),
                env: None,
                cols: Some(100),
                rows: Some(30),
            },
            Request::Attach { id_or_name: "mysession".into() },
            Request::Input { session_id: "abc".into(), data: vec![0u8; 8192] },
            Request::Resize { session_id: "abc".into(), cols: 80, rows: 24 },
            Request::Kill { session_id: "abc".into() },
            Request::Detach { session_id: "abc".into() },
        ];
        for case in cases {
            let encoded = serde_json::to_value(&case).unwrap();
            assert_eq!(encoded["type"], case.variant_name());
            let decoded: Request = serde_json::from_value(encoded).unwrap();
            assert_eq!(format!("{:?}", case), format!("{:?}", decoded));
        }
    }

    #[test]
    fn large_binary_field_survives_roundtrip() {
        let data: Vec<u8> = (0..8192u32).map(|i| (i % 251) as u8).collect();
        let req = Request::Input { session_id: "s".into(), data: data.clone() };
        let decoded = roundtrip(&req);
        match decoded {
            Request::Input { data: got, .. } => assert_eq!(got, data),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let req = Request::CreateSession {
            name: String::new(),
            shell: None,
            cwd: None,
            env: None,
            cols: None,
            rows: None,
        };
        let encoded = serde_json::to_value(&req).unwrap();
        let obj = encoded.as_object().unwrap();
        assert!(!obj.contains_key("shell"));
        assert!(!obj.contains_key("cwd"));
        assert!(!obj.contains_key("cols"));
        assert!(!obj.contains_key("rows"));
    }

    #[test]
    fn event_polymorphism_preserved() {
        let events = vec![
            Event::Pong { server_time: chrono::Utc::now().into() },
            Event::Sessions { sessions: vec![] },
            Event::Created { session_id: "a".into() },
            Event::Attached { session_id: "a".into() },
            Event::Output { session_id: "a".into(), data: vec![1, 2, 3] },
            Event::Exit { session_id: "a".into(), code: Some(0) },
            Event::Ack { req_id: None },
            Event::Error { req_id: Some("r1".into()), code: "NOT_FOUND".into(), message: "nope".into() },
        ];
        for event in events {
            let decoded = roundtrip(&event);
            assert_eq!(format!("{:?}", event), format!("{:?}", decoded));
        }
    }
}
