//! Control-plane protocol between the master and its workers.
//!
//! Messages are JSON-serialized and newline-delimited, one object per record,
//! tagged by a `cmd` field. The framing is self-synchronizing: a fresh
//! connection always starts at a record boundary. Any record that does not
//! decode into a known verb is a protocol violation and the connection is
//! closed.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A control-plane message. Direction is per-verb; see the variant docs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Worker → master: sent once the worker is listening on its data socket.
    /// `data_addr` identifies the slot the worker was launched for.
    Register { pid: u32, data_addr: String },

    /// Master → worker: run the application bootstrap.
    Bootstrap,

    /// Worker → master: bootstrap succeeded, ready for traffic.
    Ready,

    /// Worker → master: absolute paths to merge into the watched-file set.
    Files { files: Vec<PathBuf> },

    /// Worker → master: forwarded verbatim to the operator log.
    Log { message: String },

    /// Worker → master as a request (no payload); master → worker as the
    /// response, carrying per-slot counters. The payload schema is a
    /// placeholder and may grow; the request/response shape is the contract.
    Status {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        workers: Option<Vec<SlotStatus>>,
    },
}

/// Per-slot counters reported in a `status` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub id: usize,
    pub state: String,
    pub in_flight: usize,
    pub served: u64,
}

impl ControlMessage {
    /// Serialize to a JSON line (with trailing newline).
    pub fn to_line(&self) -> String {
        let mut json =
            serde_json::to_string(self).expect("ControlMessage serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from a JSON line. Unknown verbs and malformed records
    /// fail, which callers treat as a protocol violation.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let msg = ControlMessage::Register {
            pid: 4242,
            data_addr: "tcp:127.0.0.1:5501".to_string(),
        };
        let line = msg.to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"cmd\":\"register\""));
        assert_eq!(ControlMessage::from_line(&line).unwrap(), msg);
    }

    #[test]
    fn test_bare_verbs_roundtrip() {
        for msg in [ControlMessage::Bootstrap, ControlMessage::Ready] {
            let line = msg.to_line();
            assert_eq!(ControlMessage::from_line(&line).unwrap(), msg);
        }
    }

    #[test]
    fn test_files_roundtrip() {
        let msg = ControlMessage::Files {
            files: vec![PathBuf::from("/app/src/kernel.rs")],
        };
        let parsed = ControlMessage::from_line(&msg.to_line()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_status_request_has_no_payload() {
        let req = ControlMessage::Status { workers: None };
        let line = req.to_line();
        assert!(!line.contains("workers"));
        assert_eq!(ControlMessage::from_line(&line).unwrap(), req);
    }

    #[test]
    fn test_status_response_carries_counters() {
        let resp = ControlMessage::Status {
            workers: Some(vec![SlotStatus {
                id: 0,
                state: "ready".to_string(),
                in_flight: 0,
                served: 17,
            }]),
        };
        let parsed = ControlMessage::from_line(&resp.to_line()).unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn test_unknown_cmd_is_rejected() {
        assert!(ControlMessage::from_line(r#"{"cmd":"reboot"}"#).is_err());
        assert!(ControlMessage::from_line(r#"{"pid":1}"#).is_err());
        assert!(ControlMessage::from_line("not json at all").is_err());
    }
}
