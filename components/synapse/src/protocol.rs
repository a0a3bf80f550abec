//! Wire messages.
//!
//! Relay traffic is JSON tagged by `type` (`advertise`, `offer`, `answer`,
//! `candidate`). Data-channel traffic is JSON tagged the same way with
//! kebab-case kinds (`hardware`, `task-create`, `task-created`,
//! `task-execute`, `task-result`, `error`).

use hive::HardwareUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Stable identifier of a peer, derived from its public identity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    Advertise {
        hash: SessionId,
    },
    Offer {
        offer: SessionDescription,
        src: SessionId,
        dest: SessionId,
    },
    Answer {
        answer: SessionDescription,
        src: SessionId,
        dest: SessionId,
    },
    Candidate {
        src: SessionId,
        dest: SessionId,
        candidate: IceCandidate,
    },
}

impl SignalMessage {
    /// Sender of the message; for `advertise` the advertised hash.
    pub fn src(&self) -> &SessionId {
        match self {
            SignalMessage::Advertise { hash } => hash,
            SignalMessage::Offer { src, .. }
            | SignalMessage::Answer { src, .. }
            | SignalMessage::Candidate { src, .. } => src,
        }
    }

    /// Addressee; `None` for broadcasts.
    pub fn dest(&self) -> Option<&SessionId> {
        match self {
            SignalMessage::Advertise { .. } => None,
            SignalMessage::Offer { dest, .. }
            | SignalMessage::Answer { dest, .. }
            | SignalMessage::Candidate { dest, .. } => Some(dest),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChannelMessage {
    Hardware {
        data: HardwareUsage,
    },
    TaskCreate {
        #[serde(rename = "progId")]
        prog_id: String,
        /// Program code, base64 encoded.
        code: String,
    },
    TaskCreated {
        #[serde(rename = "progId")]
        prog_id: String,
    },
    TaskExecute {
        #[serde(rename = "progId")]
        prog_id: String,
        #[serde(rename = "taskId")]
        task_id: String,
        #[serde(rename = "funcArgs", default)]
        func_args: Vec<Value>,
    },
    TaskResult {
        #[serde(rename = "taskId")]
        task_id: String,
        result: Value,
    },
    Error {
        #[serde(rename = "progId", default, skip_serializing_if = "Option::is_none")]
        prog_id: Option<String>,
        #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
        task_id: Option<String>,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_signal_wire_format() {
        let msg: SignalMessage = serde_json::from_value(json!({
            "type": "offer",
            "offer": {"type": "offer", "sdp": "v=0"},
            "src": "h1",
            "dest": "h2"
        }))
        .unwrap();
        assert_eq!(msg.src().as_str(), "h1");
        assert_eq!(msg.dest().map(SessionId::as_str), Some("h2"));

        let advertise = serde_json::to_value(SignalMessage::Advertise { hash: "h1".into() }).unwrap();
        assert_eq!(advertise, json!({"type": "advertise", "hash": "h1"}));

        let candidate = serde_json::to_value(SignalMessage::Candidate {
            src: "h1".into(),
            dest: "h2".into(),
            candidate: IceCandidate::new("candidate:1 1 tcp 127.0.0.1 9 typ host"),
        })
        .unwrap();
        assert_eq!(candidate["candidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_channel_wire_format() {
        let msg: ChannelMessage = serde_json::from_value(json!({
            "type": "task-execute",
            "progId": "sha512x5000",
            "taskId": "t-1",
            "funcArgs": ["hello"]
        }))
        .unwrap();
        assert_eq!(
            msg,
            ChannelMessage::TaskExecute {
                prog_id: "sha512x5000".into(),
                task_id: "t-1".into(),
                func_args: vec![json!("hello")],
            }
        );

        let err = serde_json::to_value(ChannelMessage::Error {
            prog_id: None,
            task_id: Some("t-1".into()),
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(err, json!({"type": "error", "taskId": "t-1", "message": "boom"}));
    }
}
