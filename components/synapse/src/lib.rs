//! # Synapse
//!
//! Relay-assisted peer mesh. Peers announce themselves through a stateless
//! relay, negotiate a direct transport per pair with offer/answer/candidate
//! signaling, and then exchange work and telemetry over a reliable data
//! channel.
//!
//! * [`protocol`]: relay and data-channel wire messages.
//! * [`transport`]: the peer-connection capability and its implementations.
//! * [`link`]: one [`PeerLink`] per remote peer.
//! * [`mesh`]: the [`Mesh`] dispatch loop owning every link.

pub mod error;
pub mod identity;
pub mod link;
pub mod mesh;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use error::LinkError;
pub use identity::{Identity, IdentityError};
pub use link::{LinkContext, NegotiationRole, NegotiationState, PeerLink};
pub use mesh::{Mesh, MeshCommand, MeshConfig, MeshHandle};
pub use protocol::{ChannelMessage, IceCandidate, SdpType, SessionDescription, SessionId, SignalMessage};
pub use telemetry::{ConnectionStatus, PeerChange, PeerEvent, PeerInfo, PeerTable, TrafficInfo, TrafficMeter};
pub use transport::{
    CandidatePair, ConnectionState, DataChannel, Transport, TransportError, TransportEvent, TransportFactory,
    TransportStats,
};
