//! The mesh: one dispatch loop owning every [`PeerLink`].
//!
//! Relay signals, link events and API commands are multiplexed through a
//! single `tokio::select!` loop, so the link map never needs a lock.

use crate::error::LinkError;
use crate::link::{LinkContext, NegotiationRole, PeerLink, TELEMETRY_INTERVAL_MS};
use crate::protocol::{SessionId, SignalMessage};
use crate::telemetry::{PeerChange, PeerEvent, PeerTable};
use crate::transport::{ConnectionState, TransportFactory};
use hive::WorkerPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const READVERTISE_AFTER_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Delay before the single repeated advertisement.
    pub readvertise_after: Duration,
    pub telemetry_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            readvertise_after: Duration::from_millis(READVERTISE_AFTER_MS),
            telemetry_interval: Duration::from_millis(TELEMETRY_INTERVAL_MS),
        }
    }
}

#[derive(Debug)]
pub enum MeshCommand {
    Link {
        peer: SessionId,
        reply: oneshot::Sender<Option<Arc<PeerLink>>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<SessionId>>,
    },
    Shutdown,
}

/// Cloneable front door to a running [`Mesh`].
#[derive(Clone)]
pub struct MeshHandle {
    local: SessionId,
    commands: mpsc::UnboundedSender<MeshCommand>,
    table: PeerTable,
}

impl MeshHandle {
    pub fn local(&self) -> &SessionId {
        &self.local
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    pub async fn link(&self, peer: &SessionId) -> Result<Arc<PeerLink>, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::Link {
                peer: peer.clone(),
                reply,
            })
            .map_err(|_| LinkError::UnknownPeer(peer.clone()))?;
        rx.await
            .ok()
            .flatten()
            .ok_or_else(|| LinkError::UnknownPeer(peer.clone()))
    }

    /// Peers whose links are currently connected.
    pub async fn connected_peers(&self) -> Vec<SessionId> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(MeshCommand::Peers { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(MeshCommand::Shutdown);
    }
}

pub struct Mesh {
    ctx: LinkContext,
    config: MeshConfig,
    links: HashMap<SessionId, Arc<PeerLink>>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    commands: mpsc::UnboundedReceiver<MeshCommand>,
    table: PeerTable,
}

impl Mesh {
    pub fn new(
        local: SessionId,
        config: MeshConfig,
        transports: Arc<dyn TransportFactory>,
        pool: Arc<WorkerPool>,
        relay: mpsc::UnboundedSender<SignalMessage>,
    ) -> (Self, MeshHandle) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let table = PeerTable::new();

        let ctx = LinkContext {
            local: local.clone(),
            relay,
            pool,
            events: events_tx,
            transports,
            telemetry_interval: config.telemetry_interval,
        };
        let handle = MeshHandle {
            local,
            commands: commands_tx,
            table: table.clone(),
        };
        let mesh = Self {
            ctx,
            config,
            links: HashMap::new(),
            events,
            commands,
            table,
        };
        (mesh, handle)
    }

    pub fn local(&self) -> &SessionId {
        &self.ctx.local
    }

    pub fn links(&self) -> usize {
        self.links.len()
    }

    pub fn link(&self, peer: &SessionId) -> Option<Arc<PeerLink>> {
        self.links.get(peer).cloned()
    }

    pub fn advertise(&self) {
        let hash = self.ctx.local.clone();
        if self.ctx.relay.send(SignalMessage::Advertise { hash }).is_err() {
            warn!("cannot advertise: relay connection closed");
        }
    }

    /// Runs until the inbound relay stream ends or shutdown is requested.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<SignalMessage>) {
        info!(id = %self.ctx.local, "mesh started");
        self.advertise();

        let readvertise = tokio::time::sleep(self.config.readvertise_after);
        tokio::pin!(readvertise);
        let mut readvertised = false;

        loop {
            tokio::select! {
                _ = &mut readvertise, if !readvertised => {
                    readvertised = true;
                    debug!("re-advertising");
                    self.advertise();
                }
                signal = inbound.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => {
                        info!("relay stream ended");
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(command) = self.commands.recv() => {
                    if !self.handle_command(command) {
                        break;
                    }
                }
            }
        }

        self.shutdown();
    }

    pub async fn handle_signal(&mut self, signal: SignalMessage) {
        if signal.src() == &self.ctx.local {
            return;
        }
        if let Some(dest) = signal.dest() {
            if dest != &self.ctx.local {
                debug!(%dest, "ignoring signal addressed elsewhere");
                return;
            }
        }

        match signal {
            SignalMessage::Advertise { hash } => {
                if self.links.contains_key(&hash) {
                    debug!(peer = %hash, "already known, advertise ignored");
                    return;
                }
                info!(peer = %hash, "peer advertised, offering");
                let Some(link) = self.open_link(hash.clone(), NegotiationRole::Offerer) else {
                    return;
                };
                if let Err(e) = link.create_offer().await {
                    warn!(peer = %hash, "offer failed: {e}");
                    self.remove(&hash);
                }
            }
            SignalMessage::Offer { offer, src, .. } => {
                if self.links.contains_key(&src) {
                    debug!(peer = %src, "already known, offer ignored");
                    return;
                }
                info!(peer = %src, "offer received, answering");
                let Some(link) = self.open_link(src.clone(), NegotiationRole::Answerer) else {
                    return;
                };
                if let Err(e) = link.create_answer(offer).await {
                    warn!(peer = %src, "answer failed: {e}");
                    self.remove(&src);
                }
            }
            SignalMessage::Answer { answer, src, .. } => {
                let Some(link) = self.links.get(&src).cloned() else {
                    warn!("answer dropped: {}", LinkError::UnknownPeer(src));
                    return;
                };
                if let Err(e) = link.accept_answer(answer).await {
                    warn!(peer = %src, "answer rejected: {e}");
                }
            }
            SignalMessage::Candidate { candidate, src, .. } => {
                let Some(link) = self.links.get(&src).cloned() else {
                    warn!("candidate dropped: {}", LinkError::UnknownPeer(src));
                    return;
                };
                if let Err(e) = link.add_candidate(candidate).await {
                    warn!(peer = %src, "candidate rejected: {e}");
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: PeerEvent) {
        self.table.apply(&event);

        if let PeerChange::Connection(status) = &event.change {
            if status.status.is_terminal() && self.remove(&event.peer) {
                info!(peer = %event.peer, status = ?status.status, "link removed");
            }
        }
    }

    fn handle_command(&mut self, command: MeshCommand) -> bool {
        match command {
            MeshCommand::Link { peer, reply } => {
                let _ = reply.send(self.links.get(&peer).cloned());
            }
            MeshCommand::Peers { reply } => {
                let peers = self
                    .links
                    .iter()
                    .filter(|(_, link)| link.connection_state() == ConnectionState::Connected)
                    .map(|(peer, _)| peer.clone())
                    .collect();
                let _ = reply.send(peers);
            }
            MeshCommand::Shutdown => return false,
        }
        true
    }

    /// Starts a fresh link. A row left over from an earlier session with
    /// the same peer is dropped so stale figures do not carry over.
    fn open_link(&mut self, peer: SessionId, role: NegotiationRole) -> Option<Arc<PeerLink>> {
        match PeerLink::new(&self.ctx, peer.clone(), role) {
            Ok(link) => {
                self.table.remove(&peer);
                let link = Arc::new(link);
                self.links.insert(peer, link.clone());
                Some(link)
            }
            Err(e) => {
                warn!(%peer, "cannot create link: {e}");
                None
            }
        }
    }

    fn remove(&mut self, peer: &SessionId) -> bool {
        match self.links.remove(peer) {
            Some(link) => {
                link.destroy();
                true
            }
            None => false,
        }
    }

    pub fn shutdown(&mut self) {
        for (_, link) in self.links.drain() {
            link.destroy();
        }
        info!(id = %self.ctx.local, "mesh stopped");
    }
}
