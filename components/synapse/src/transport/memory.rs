//! In-process transport.
//!
//! Endpoints created by the same [`MemoryNetwork`] find each other through
//! the token carried in their session descriptions. A pair connects once
//! both sides hold each other's description and at least one side has
//! applied a remote candidate, which mirrors the ordering constraints of a
//! real peer connection closely enough to exercise the negotiation path.

use super::{
    parse_description, CandidatePair, ConnectionState, DataChannel, Transport, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportStats,
};
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

const SCHEME: &str = "memory";

struct Endpoint {
    events: mpsc::UnboundedSender<TransportEvent>,
    channel_label: Option<String>,
    remote_token: Option<String>,
    candidate_seen: bool,
    state: ConnectionState,
    peer: Option<String>,
    channel_open: bool,
    stats: TransportStats,
}

impl Endpoint {
    fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            events,
            channel_label: None,
            remote_token: None,
            candidate_seen: false,
            state: ConnectionState::New,
            peer: None,
            channel_open: false,
            stats: TransportStats::default(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

type Endpoints = HashMap<String, Endpoint>;

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    endpoints: Arc<Mutex<Endpoints>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of transports that have not been closed yet.
    pub fn live_endpoints(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Endpoints> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TransportFactory for MemoryNetwork {
    fn create(&self) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = Uuid::new_v4().simple().to_string();
        self.lock().insert(token.clone(), Endpoint::new(tx));

        let transport = MemoryTransport {
            token,
            network: self.clone(),
        };
        Ok((Arc::new(transport), rx))
    }
}

pub struct MemoryTransport {
    token: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    fn with_endpoint<R>(&self, f: impl FnOnce(&mut Endpoint) -> R) -> Result<R, TransportError> {
        let mut endpoints = self.network.lock();
        let endpoint = endpoints.get_mut(&self.token).ok_or(TransportError::Closed)?;
        Ok(f(endpoint))
    }

    fn description(&self) -> String {
        format!("{SCHEME} {}", self.token)
    }

    fn try_connect(&self, endpoints: &mut Endpoints) {
        let a = self.token.as_str();
        let Some(b) = endpoints.get(a).and_then(|ep| ep.remote_token.clone()) else {
            return;
        };
        let (Some(ea), Some(eb)) = (endpoints.get(a), endpoints.get(&b)) else {
            return;
        };
        if ea.state != ConnectionState::New || eb.state != ConnectionState::New {
            return;
        }
        if eb.remote_token.as_deref() != Some(a) || !(ea.candidate_seen || eb.candidate_seen) {
            return;
        }

        let label = ea.channel_label.clone().or_else(|| eb.channel_label.clone());
        for (me, other) in [(a.to_string(), b.clone()), (b.clone(), a.to_string())] {
            let Some(ep) = endpoints.get_mut(&me) else {
                continue;
            };
            ep.state = ConnectionState::Connected;
            ep.peer = Some(other);
            ep.channel_open = label.is_some();
            ep.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
            ep.emit(TransportEvent::ConnectionState(ConnectionState::Connected));
            if let Some(label) = &label {
                let channel = MemoryChannel {
                    token: me,
                    label: label.clone(),
                    network: self.network.clone(),
                };
                ep.emit(TransportEvent::ChannelOpen(Arc::new(channel)));
            }
        }
        debug!(local = a, remote = %b, "memory transport connected");
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.with_endpoint(|ep| ep.channel_label = Some(label.to_string()))
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        self.with_endpoint(|_| ())?;
        Ok(SessionDescription::offer(self.description()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if !self.with_endpoint(|ep| ep.remote_token.is_some())? {
            return Err(TransportError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(self.description()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if parse_description(&desc, SCHEME)? != self.token {
            return Err(TransportError::InvalidDescription(desc.sdp));
        }
        let candidate = IceCandidate::new(format!("candidate:1 1 {SCHEME} {} typ host", self.token));
        self.with_endpoint(|ep| ep.emit(TransportEvent::LocalCandidate(candidate)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let remote = parse_description(&desc, SCHEME)?;
        let mut endpoints = self.network.lock();
        let endpoint = endpoints.get_mut(&self.token).ok_or(TransportError::Closed)?;
        endpoint.remote_token = Some(remote);
        self.try_connect(&mut endpoints);
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.with_endpoint(|ep| ep.remote_token.is_some()).unwrap_or(false)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let mut fields = candidate.candidate.split_whitespace();
        let token = fields
            .by_ref()
            .position(|f| f == SCHEME)
            .and_then(|_| fields.next())
            .ok_or_else(|| TransportError::InvalidCandidate(candidate.candidate.clone()))?
            .to_string();

        let mut endpoints = self.network.lock();
        let endpoint = endpoints.get_mut(&self.token).ok_or(TransportError::Closed)?;
        match endpoint.remote_token.as_deref() {
            None => return Err(TransportError::NoRemoteDescription),
            Some(remote) if remote != token => {
                debug!(candidate = %candidate.candidate, "ignoring candidate for another session");
                return Ok(());
            }
            Some(_) => endpoint.candidate_seen = true,
        }
        self.try_connect(&mut endpoints);
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.with_endpoint(|ep| ep.state).unwrap_or(ConnectionState::Closed)
    }

    fn selected_pair(&self) -> Option<CandidatePair> {
        let peer = self.with_endpoint(|ep| ep.peer.clone()).ok().flatten()?;
        Some(CandidatePair {
            local: format!("{SCHEME}:{}", self.token),
            remote: format!("{SCHEME}:{peer}"),
        })
    }

    fn stats(&self) -> TransportStats {
        self.with_endpoint(|ep| ep.stats).unwrap_or_default()
    }

    fn close(&self) {
        let mut endpoints = self.network.lock();
        let Some(closed) = endpoints.remove(&self.token) else {
            return;
        };
        let Some(peer_token) = closed.peer else {
            return;
        };
        let Some(peer) = endpoints.get_mut(&peer_token) else {
            return;
        };
        if peer.peer.as_deref() != Some(self.token.as_str()) || peer.state.is_terminal() {
            return;
        }

        if peer.channel_open {
            peer.channel_open = false;
            peer.emit(TransportEvent::ChannelClosed);
        }
        peer.state = ConnectionState::Disconnected;
        peer.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryChannel {
    token: String,
    label: String,
    network: MemoryNetwork,
}

impl DataChannel for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.network
            .lock()
            .get(&self.token)
            .map_or(false, |ep| ep.channel_open && ep.state == ConnectionState::Connected)
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        let mut endpoints = self.network.lock();
        let peer = endpoints
            .get(&self.token)
            .filter(|ep| ep.channel_open && ep.state == ConnectionState::Connected)
            .and_then(|ep| ep.peer.clone())
            .ok_or(TransportError::ChannelClosed)?;

        let len = text.len() as u64;
        let remote = endpoints.get_mut(&peer).ok_or(TransportError::ChannelClosed)?;
        remote.stats.bytes_received += len;
        remote.emit(TransportEvent::ChannelMessage(text.to_string()));

        if let Some(local) = endpoints.get_mut(&self.token) {
            local.stats.bytes_sent += len;
        }
        Ok(())
    }

    fn close(&self) {
        let mut endpoints = self.network.lock();
        let peer = endpoints.get(&self.token).and_then(|ep| ep.peer.clone());
        for token in std::iter::once(self.token.clone()).chain(peer) {
            if let Some(ep) = endpoints.get_mut(&token) {
                if ep.channel_open {
                    ep.channel_open = false;
                    ep.emit(TransportEvent::ChannelClosed);
                }
            }
        }
    }
}
