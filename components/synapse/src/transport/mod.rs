//! The peer-connection capability.
//!
//! A [`Transport`] is one end of a direct connection negotiated through
//! offer/answer/candidate exchange. It reports everything that happens to it
//! as [`TransportEvent`]s on the receiver handed out by its factory, and
//! carries one reliable, ordered text [`DataChannel`].

use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod memory;
pub mod tcp;

pub use memory::MemoryNetwork;
pub use tcp::{TcpConfig, TcpTransportFactory};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("invalid candidate: {0}")]
    InvalidCandidate(String),

    #[error("remote description is not set")]
    NoRemoteDescription,

    #[error("transport is closed")]
    Closed,

    #[error("data channel is not open")]
    ChannelClosed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the link is torn down.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// The local/remote address pair the connection settled on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePair {
    pub local: String,
    pub remote: String,
}

/// Cumulative byte counters of the selected pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(ConnectionState),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(String),
    ChannelClosed,
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            TransportEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            TransportEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            TransportEvent::ChannelMessage(m) => f.debug_tuple("ChannelMessage").field(&m.len()).finish(),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
        }
    }
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    fn send(&self, text: &str) -> Result<(), TransportError>;

    fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Declares the data channel; only the offering side calls this.
    fn create_data_channel(&self, label: &str) -> Result<(), TransportError>;

    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError>;

    fn has_remote_description(&self) -> bool;

    /// Fails with [`TransportError::NoRemoteDescription`] before the remote
    /// description is applied.
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError>;

    fn connection_state(&self) -> ConnectionState;

    fn selected_pair(&self) -> Option<CandidatePair>;

    fn stats(&self) -> TransportStats;

    /// Idempotent. Emits no further events on this end.
    fn close(&self);
}

pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError>;
}

/// Pulls the session token out of a `"<scheme> <token>"` description.
pub(crate) fn parse_description(desc: &SessionDescription, scheme: &str) -> Result<String, TransportError> {
    let mut parts = desc.sdp.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(s), Some(token)) if s == scheme => Ok(token.to_string()),
        _ => Err(TransportError::InvalidDescription(desc.sdp.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!ConnectionState::New.is_terminal());
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::Failed.is_terminal());
        assert!(ConnectionState::Closed.is_terminal());
        assert_eq!(serde_json::to_value(ConnectionState::Connected).unwrap(), "connected");
    }

    #[test]
    fn test_parse_description() {
        let desc = SessionDescription::offer("memory abc");
        assert_eq!(parse_description(&desc, "memory").unwrap(), "abc");
        assert!(parse_description(&desc, "tcp").is_err());
        assert!(parse_description(&SessionDescription::offer(""), "memory").is_err());
    }
}
