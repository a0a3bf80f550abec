use crate::protocol::SessionId;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("no link for peer {0}")]
    UnknownPeer(SessionId),

    /// The channel or transport was not connected when a message had to go out.
    #[error("data channel unavailable")]
    ChannelUnavailable,

    #[error("remote peer reported: {0}")]
    Remote(String),

    #[error("request `{0}` is already pending")]
    DuplicateRequest(String),

    #[error("relay connection closed")]
    RelayClosed,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed message: {0}")]
    Serialization(#[from] serde_json::Error),
}
