//! One negotiated connection to one remote peer.
//!
//! A [`PeerLink`] drives the offer/answer exchange over the relay, buffers
//! remote candidates until they can be applied, and once the data channel
//! is open serves the channel protocol: remote uploads and executions run
//! on the local [`WorkerPool`], responses to our own requests resolve the
//! matching pending entry, and hardware/traffic telemetry flows every
//! interval.

use crate::error::LinkError;
use crate::protocol::{ChannelMessage, IceCandidate, SdpType, SessionDescription, SessionId, SignalMessage};
use crate::telemetry::{ConnectionStatus, PeerChange, PeerEvent, TrafficInfo, TrafficMeter};
use crate::transport::{ConnectionState, DataChannel, Transport, TransportEvent, TransportEvents, TransportFactory};
use base64::{engine::general_purpose, Engine as _};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hive::{HardwareUsage, Task, WorkerPool};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const CHANNEL_LABEL: &str = "data";

pub const TELEMETRY_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    Offering,
    Answering,
    Negotiating,
    Connected,
    Closed,
}

/// Everything a link borrows from the node that owns it.
#[derive(Clone)]
pub struct LinkContext {
    pub local: SessionId,
    pub relay: mpsc::UnboundedSender<SignalMessage>,
    pub pool: Arc<WorkerPool>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub transports: Arc<dyn TransportFactory>,
    pub telemetry_interval: Duration,
}

struct LinkState {
    negotiation: NegotiationState,
    connection: ConnectionState,
    pending_candidates: Vec<IceCandidate>,
    channel: Option<Arc<dyn DataChannel>>,
    remote_usage: Option<HardwareUsage>,
    traffic: Option<TrafficInfo>,
    events: Option<mpsc::UnboundedSender<PeerEvent>>,
    timers: Vec<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

struct Shared {
    local: SessionId,
    remote: SessionId,
    relay: mpsc::UnboundedSender<SignalMessage>,
    pool: Arc<WorkerPool>,
    transport: Arc<dyn Transport>,
    telemetry_interval: Duration,
    state: Mutex<LinkState>,
    pending_programs: DashMap<String, oneshot::Sender<Result<(), LinkError>>>,
    pending_tasks: DashMap<String, oneshot::Sender<Result<Value, LinkError>>>,
}

pub struct PeerLink {
    role: NegotiationRole,
    shared: Arc<Shared>,
    negotiation: tokio::sync::Mutex<()>,
    destroyed: AtomicBool,
}

impl PeerLink {
    /// Creates the transport and starts listening to it. Must be called
    /// from within a tokio runtime.
    pub fn new(ctx: &LinkContext, remote: SessionId, role: NegotiationRole) -> Result<Self, LinkError> {
        let (transport, events) = ctx.transports.create()?;
        let shared = Arc::new(Shared {
            local: ctx.local.clone(),
            remote,
            relay: ctx.relay.clone(),
            pool: ctx.pool.clone(),
            transport,
            telemetry_interval: ctx.telemetry_interval,
            state: Mutex::new(LinkState {
                negotiation: NegotiationState::Idle,
                connection: ConnectionState::New,
                pending_candidates: Vec::new(),
                channel: None,
                remote_usage: None,
                traffic: None,
                events: Some(ctx.events.clone()),
                timers: Vec::new(),
                pump: None,
            }),
            pending_programs: DashMap::new(),
            pending_tasks: DashMap::new(),
        });

        let pump = tokio::spawn(pump(shared.clone(), events));
        shared.lock().pump = Some(pump);

        debug!(peer = %shared.remote, ?role, "link created");
        Ok(Self {
            role,
            shared,
            negotiation: tokio::sync::Mutex::new(()),
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn local(&self) -> &SessionId {
        &self.shared.local
    }

    pub fn remote(&self) -> &SessionId {
        &self.shared.remote
    }

    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.shared.lock().negotiation
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.lock().connection
    }

    pub fn remote_usage(&self) -> Option<HardwareUsage> {
        self.shared.lock().remote_usage.clone()
    }

    pub fn traffic(&self) -> Option<TrafficInfo> {
        self.shared.lock().traffic
    }

    pub fn pending_candidates(&self) -> usize {
        self.shared.lock().pending_candidates.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Idle → Offering: opens the data channel and sends our offer.
    pub async fn create_offer(&self) -> Result<(), LinkError> {
        let _negotiating = self.negotiation.lock().await;
        self.expect_role(NegotiationRole::Offerer)?;
        self.shared.transition(NegotiationState::Idle, NegotiationState::Offering)?;

        let transport = &self.shared.transport;
        transport.create_data_channel(CHANNEL_LABEL)?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.shared.signal(SignalMessage::Offer {
            offer,
            src: self.shared.local.clone(),
            dest: self.shared.remote.clone(),
        })?;

        info!(peer = %self.shared.remote, "offer sent");
        Ok(())
    }

    /// Idle → Answering: applies the remote offer, answers, then applies
    /// any candidates that arrived first.
    pub async fn create_answer(&self, offer: SessionDescription) -> Result<(), LinkError> {
        let _negotiating = self.negotiation.lock().await;
        self.expect_role(NegotiationRole::Answerer)?;
        if offer.kind != SdpType::Offer {
            return Err(LinkError::Negotiation("expected an offer".to_string()));
        }
        self.shared.transition(NegotiationState::Idle, NegotiationState::Answering)?;

        let transport = &self.shared.transport;
        transport.set_remote_description(offer).await?;
        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;
        self.shared.signal(SignalMessage::Answer {
            answer,
            src: self.shared.local.clone(),
            dest: self.shared.remote.clone(),
        })?;

        info!(peer = %self.shared.remote, "answer sent");
        self.drain_candidates().await;
        Ok(())
    }

    /// Offering → Negotiating.
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<(), LinkError> {
        let _negotiating = self.negotiation.lock().await;
        self.expect_role(NegotiationRole::Offerer)?;
        if answer.kind != SdpType::Answer {
            return Err(LinkError::Negotiation("expected an answer".to_string()));
        }
        self.shared.transition(NegotiationState::Offering, NegotiationState::Negotiating)?;

        if let Err(e) = self.shared.transport.set_remote_description(answer).await {
            // Stay ready for a valid answer.
            let _ = self.shared.transition(NegotiationState::Negotiating, NegotiationState::Offering);
            return Err(e.into());
        }
        debug!(peer = %self.shared.remote, "answer applied");
        self.drain_candidates().await;
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until a remote
    /// description exists.
    pub async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), LinkError> {
        let _negotiating = self.negotiation.lock().await;
        if self.is_destroyed() {
            return Ok(());
        }

        if self.shared.transport.has_remote_description() {
            self.shared.transport.add_ice_candidate(&candidate).await?;
        } else {
            let mut state = self.shared.lock();
            state.pending_candidates.push(candidate);
            debug!(peer = %self.shared.remote, buffered = state.pending_candidates.len(), "candidate buffered");
        }
        Ok(())
    }

    async fn drain_candidates(&self) {
        let pending = std::mem::take(&mut self.shared.lock().pending_candidates);
        for candidate in pending {
            if let Err(e) = self.shared.transport.add_ice_candidate(&candidate).await {
                warn!(peer = %self.shared.remote, candidate = %candidate.candidate, "failed to apply candidate: {e}");
            }
        }
    }

    /// Registers a program on the remote peer's workers.
    pub async fn upload_program(&self, prog_id: &str, code: &[u8]) -> Result<(), LinkError> {
        let (tx, rx) = oneshot::channel();
        match self.shared.pending_programs.entry(prog_id.to_string()) {
            Entry::Occupied(_) => return Err(LinkError::DuplicateRequest(prog_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let message = ChannelMessage::TaskCreate {
            prog_id: prog_id.to_string(),
            code: general_purpose::STANDARD.encode(code),
        };
        if let Err(e) = self.shared.deliver(&message) {
            self.shared.pending_programs.remove(prog_id);
            return Err(e);
        }
        rx.await.unwrap_or(Err(LinkError::ChannelUnavailable))
    }

    /// Runs a task on the remote peer and waits for its result.
    pub async fn execute(&self, task: Task) -> Result<Value, LinkError> {
        let (tx, rx) = oneshot::channel();
        match self.shared.pending_tasks.entry(task.task_id.clone()) {
            Entry::Occupied(_) => return Err(LinkError::DuplicateRequest(task.task_id)),
            Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        let task_id = task.task_id.clone();
        let message = ChannelMessage::TaskExecute {
            prog_id: task.prog_id,
            task_id: task.task_id,
            func_args: task.func_args,
        };
        if let Err(e) = self.shared.deliver(&message) {
            self.shared.pending_tasks.remove(&task_id);
            return Err(e);
        }
        rx.await.unwrap_or(Err(LinkError::ChannelUnavailable))
    }

    /// Tears the link down. Safe to call repeatedly; no event is emitted
    /// once it returns.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (channel, timers, pump) = {
            let mut state = self.shared.lock();
            state.events = None;
            state.negotiation = NegotiationState::Closed;
            state.pending_candidates.clear();
            (state.channel.take(), std::mem::take(&mut state.timers), state.pump.take())
        };

        for timer in timers {
            timer.abort();
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(channel) = channel {
            channel.close();
        }
        self.shared.transport.close();

        // Dropping the senders fails every outstanding request.
        self.shared.pending_programs.clear();
        self.shared.pending_tasks.clear();

        info!(peer = %self.shared.remote, "link destroyed");
    }

    fn expect_role(&self, role: NegotiationRole) -> Result<(), LinkError> {
        if self.role != role {
            return Err(LinkError::Negotiation(format!(
                "{:?} link cannot act as {role:?}",
                self.role
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink")
            .field("remote", self.remote())
            .field("role", &self.role())
            .field("negotiation", &self.negotiation_state())
            .finish()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, from: NegotiationState, to: NegotiationState) -> Result<(), LinkError> {
        let mut state = self.lock();
        if state.negotiation != from {
            return Err(LinkError::Negotiation(format!(
                "cannot move from {:?} to {to:?}",
                state.negotiation
            )));
        }
        state.negotiation = to;
        Ok(())
    }

    fn signal(&self, message: SignalMessage) -> Result<(), LinkError> {
        self.relay.send(message).map_err(|_| LinkError::RelayClosed)
    }

    fn emit(&self, change: PeerChange) {
        let state = self.lock();
        if let Some(events) = &state.events {
            let _ = events.send(PeerEvent {
                peer: self.remote.clone(),
                change,
            });
        }
    }

    /// The data channel, if it is open and the transport is connected.
    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        let channel = {
            let state = self.lock();
            if state.connection != ConnectionState::Connected {
                return None;
            }
            state.channel.clone()?
        };
        channel.is_open().then_some(channel)
    }

    fn deliver(&self, message: &ChannelMessage) -> Result<(), LinkError> {
        let channel = self.open_channel().ok_or(LinkError::ChannelUnavailable)?;
        channel.send(&serde_json::to_string(message)?)?;
        Ok(())
    }

    /// Sends a response, dropping it when the peer is no longer reachable.
    fn reply(&self, message: ChannelMessage) {
        if let Err(e) = self.deliver(&message) {
            warn!(peer = %self.remote, "response dropped: {e}");
        }
    }

    fn on_connection_state(&self, status: ConnectionState) {
        {
            let mut state = self.lock();
            state.connection = status;
            if status == ConnectionState::Connected {
                state.negotiation = NegotiationState::Connected;
            } else if status.is_terminal() {
                state.negotiation = NegotiationState::Closed;
            }
        }

        info!(peer = %self.remote, ?status, "connection state changed");
        let pair = self.transport.selected_pair();
        self.emit(PeerChange::Connection(ConnectionStatus { status, pair }));
    }

    fn on_channel_open(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        info!(peer = %self.remote, label = channel.label(), "data channel open");
        let timers = vec![
            tokio::spawn(report_hardware(self.clone())),
            tokio::spawn(sample_traffic(self.clone())),
        ];

        let mut state = self.lock();
        if state.events.is_none() {
            timers.iter().for_each(JoinHandle::abort);
            return;
        }
        state.channel = Some(channel);
        for stale in std::mem::replace(&mut state.timers, timers) {
            stale.abort();
        }
    }

    fn on_channel_closed(&self) {
        info!(peer = %self.remote, "data channel closed");
        let timers = {
            let mut state = self.lock();
            state.channel = None;
            std::mem::take(&mut state.timers)
        };
        for timer in timers {
            timer.abort();
        }
    }

    fn on_message(self: &Arc<Self>, text: &str) {
        let message: ChannelMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.remote, "malformed channel message: {e}");
                return;
            }
        };

        match message {
            ChannelMessage::Hardware { data } => {
                self.lock().remote_usage = Some(data.clone());
                self.emit(PeerChange::Hardware(data));
            }
            ChannelMessage::TaskCreate { prog_id, code } => {
                let shared = self.clone();
                tokio::spawn(async move { shared.serve_upload(prog_id, code).await });
            }
            ChannelMessage::TaskExecute {
                prog_id,
                task_id,
                func_args,
            } => {
                let shared = self.clone();
                let task = Task::new(prog_id, task_id, func_args);
                tokio::spawn(async move { shared.serve_execute(task).await });
            }
            ChannelMessage::TaskCreated { prog_id } => match self.pending_programs.remove(&prog_id) {
                Some((_, pending)) => {
                    let _ = pending.send(Ok(()));
                }
                None => debug!(peer = %self.remote, program = %prog_id, "unsolicited task-created"),
            },
            ChannelMessage::TaskResult { task_id, result } => match self.pending_tasks.remove(&task_id) {
                Some((_, pending)) => {
                    let _ = pending.send(Ok(result));
                }
                None => debug!(peer = %self.remote, task = %task_id, "unsolicited task-result"),
            },
            ChannelMessage::Error {
                prog_id,
                task_id,
                message,
            } => {
                if let Some((_, pending)) = task_id.as_ref().and_then(|id| self.pending_tasks.remove(id)) {
                    let _ = pending.send(Err(LinkError::Remote(message)));
                } else if let Some((_, pending)) = prog_id.as_ref().and_then(|id| self.pending_programs.remove(id)) {
                    let _ = pending.send(Err(LinkError::Remote(message)));
                } else {
                    warn!(peer = %self.remote, ?prog_id, ?task_id, %message, "remote error");
                }
            }
        }
    }

    async fn serve_upload(&self, prog_id: String, code: String) {
        let reply = match general_purpose::STANDARD.decode(code.as_bytes()) {
            Err(e) => ChannelMessage::Error {
                prog_id: Some(prog_id),
                task_id: None,
                message: format!("invalid program encoding: {e}"),
            },
            Ok(bytes) => match self.pool.upload_program(&prog_id, bytes).await {
                Ok(()) => {
                    info!(peer = %self.remote, program = %prog_id, "program registered");
                    ChannelMessage::TaskCreated { prog_id }
                }
                Err(e) => {
                    warn!(peer = %self.remote, program = %prog_id, "upload failed: {e}");
                    ChannelMessage::Error {
                        prog_id: Some(prog_id),
                        task_id: None,
                        message: e.to_string(),
                    }
                }
            },
        };
        self.reply(reply);
    }

    async fn serve_execute(&self, task: Task) {
        let prog_id = task.prog_id.clone();
        let task_id = task.task_id.clone();
        let reply = match self.pool.enqueue_task(task).await {
            Ok(result) => ChannelMessage::TaskResult { task_id, result },
            Err(e) => {
                warn!(peer = %self.remote, task = %task_id, "task failed: {e}");
                ChannelMessage::Error {
                    prog_id: Some(prog_id),
                    task_id: Some(task_id),
                    message: e.to_string(),
                }
            }
        };
        self.reply(reply);
    }
}

async fn pump(shared: Arc<Shared>, mut events: TransportEvents) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let forwarded = shared.signal(SignalMessage::Candidate {
                    src: shared.local.clone(),
                    dest: shared.remote.clone(),
                    candidate,
                });
                if let Err(e) = forwarded {
                    debug!(peer = %shared.remote, "candidate not forwarded: {e}");
                }
            }
            TransportEvent::ConnectionState(status) => shared.on_connection_state(status),
            TransportEvent::ChannelOpen(channel) => shared.on_channel_open(channel),
            TransportEvent::ChannelMessage(text) => shared.on_message(&text),
            TransportEvent::ChannelClosed => shared.on_channel_closed(),
        }
    }
}

async fn report_hardware(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.telemetry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if shared.open_channel().is_none() {
            continue;
        }
        let usage = shared.pool.query_usage().await;
        if let Err(e) = shared.deliver(&ChannelMessage::Hardware { data: usage }) {
            debug!(peer = %shared.remote, "hardware report skipped: {e}");
        }
    }
}

async fn sample_traffic(shared: Arc<Shared>) {
    let mut meter = TrafficMeter::new();
    let mut ticker = tokio::time::interval(shared.telemetry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        if let Some(rates) = meter.sample(Instant::now(), shared.transport.stats()) {
            shared.lock().traffic = Some(rates);
            shared.emit(PeerChange::Traffic(rates));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CandidatePair, MemoryNetwork, TransportError, TransportStats};
    use async_trait::async_trait;
    use hive::{PoolConfig, UnitFactory};
    use judge::{ExecutionUnit, Judge};
    use serde_json::json;

    struct Side {
        link: PeerLink,
        signals: mpsc::UnboundedReceiver<SignalMessage>,
        events: mpsc::UnboundedReceiver<PeerEvent>,
    }

    fn side(network: &MemoryNetwork, local: &str, remote: &str, role: NegotiationRole) -> Side {
        let factory: UnitFactory = Arc::new(|| Box::new(Judge::with_builtins()) as Box<dyn ExecutionUnit>);
        let (relay, signals) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let ctx = LinkContext {
            local: local.into(),
            relay,
            pool: Arc::new(WorkerPool::new(PoolConfig::with_size(2), factory).unwrap()),
            events: events_tx,
            transports: Arc::new(network.clone()),
            telemetry_interval: Duration::from_millis(100),
        };
        Side {
            link: PeerLink::new(&ctx, remote.into(), role).unwrap(),
            signals,
            events,
        }
    }

    /// Transport that only records the candidates applied to it.
    #[derive(Default)]
    struct RecordingTransport {
        remote: AtomicBool,
        applied: Mutex<Vec<String>>,
        events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl RecordingTransport {
        fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn create_data_channel(&self, _label: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::offer("recording"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
            Ok(SessionDescription::answer("recording"))
        }

        async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), TransportError> {
            Ok(())
        }

        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
            if desc.sdp == "garbage" {
                return Err(TransportError::InvalidDescription(desc.sdp));
            }
            self.remote.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn has_remote_description(&self) -> bool {
            self.remote.load(Ordering::SeqCst)
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
            if !self.has_remote_description() {
                return Err(TransportError::NoRemoteDescription);
            }
            self.applied.lock().unwrap().push(candidate.candidate.clone());
            Ok(())
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::New
        }

        fn selected_pair(&self) -> Option<CandidatePair> {
            None
        }

        fn stats(&self) -> TransportStats {
            TransportStats::default()
        }

        fn close(&self) {
            self.events.lock().unwrap().take();
        }
    }

    struct RecordingFactory(Arc<RecordingTransport>);

    impl TransportFactory for RecordingFactory {
        fn create(&self) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.0.events.lock().unwrap() = Some(tx);
            let transport: Arc<dyn Transport> = self.0.clone();
            Ok((transport, rx))
        }
    }

    fn recording_link(
        role: NegotiationRole,
    ) -> (PeerLink, Arc<RecordingTransport>, mpsc::UnboundedReceiver<SignalMessage>) {
        let factory: UnitFactory = Arc::new(|| Box::new(Judge::with_builtins()) as Box<dyn ExecutionUnit>);
        let transport = Arc::new(RecordingTransport::default());
        let (relay, signals) = mpsc::unbounded_channel();
        let (events, _) = mpsc::unbounded_channel();
        let ctx = LinkContext {
            local: "h1".into(),
            relay,
            pool: Arc::new(WorkerPool::new(PoolConfig::with_size(1), factory).unwrap()),
            events,
            transports: Arc::new(RecordingFactory(transport.clone())),
            telemetry_interval: Duration::from_millis(100),
        };
        (PeerLink::new(&ctx, "h2".into(), role).unwrap(), transport, signals)
    }

    fn drain(signals: &mut mpsc::UnboundedReceiver<SignalMessage>) -> Vec<SignalMessage> {
        std::iter::from_fn(|| signals.try_recv().ok()).collect()
    }

    async fn wait_for_status(events: &mut mpsc::UnboundedReceiver<PeerEvent>, wanted: ConnectionState) {
        while let Some(event) = events.recv().await {
            if let PeerChange::Connection(status) = event.change {
                if status.status == wanted {
                    return;
                }
            }
        }
        panic!("event stream ended before reaching {wanted:?}");
    }

    /// Negotiates h1 (offerer) with h2 (answerer), delivering h1's
    /// candidates to h2 before the offer.
    async fn connected_pair() -> (Side, Side) {
        let network = MemoryNetwork::new();
        let mut h1 = side(&network, "h1", "h2", NegotiationRole::Offerer);
        let mut h2 = side(&network, "h2", "h1", NegotiationRole::Answerer);

        h1.link.create_offer().await.unwrap();
        // Candidates are forwarded by the pump task.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut offer = None;
        for message in drain(&mut h1.signals) {
            match message {
                SignalMessage::Offer { offer: o, .. } => offer = Some(o),
                SignalMessage::Candidate { candidate, .. } => h2.link.add_candidate(candidate).await.unwrap(),
                other => panic!("unexpected signal {other:?}"),
            }
        }
        assert_eq!(h2.link.pending_candidates(), 1);

        h2.link.create_answer(offer.unwrap()).await.unwrap();
        assert_eq!(h2.link.pending_candidates(), 0);
        assert_eq!(h2.link.negotiation_state(), NegotiationState::Answering);

        tokio::time::sleep(Duration::from_millis(20)).await;
        for message in drain(&mut h2.signals) {
            match message {
                SignalMessage::Answer { answer, .. } => h1.link.accept_answer(answer).await.unwrap(),
                SignalMessage::Candidate { candidate, .. } => h1.link.add_candidate(candidate).await.unwrap(),
                other => panic!("unexpected signal {other:?}"),
            }
        }

        wait_for_status(&mut h1.events, ConnectionState::Connected).await;
        wait_for_status(&mut h2.events, ConnectionState::Connected).await;
        // Let both pumps register the opened channel.
        tokio::time::sleep(Duration::from_millis(20)).await;
        (h1, h2)
    }

    #[tokio::test]
    async fn test_remote_upload_and_execute() {
        let (h1, h2) = connected_pair().await;
        assert_eq!(h1.link.negotiation_state(), NegotiationState::Connected);

        h1.link.upload_program("digest", b"native:sha512x5000").await.unwrap();
        let result = h1
            .link
            .execute(Task::new("digest", "t-1", vec![json!("hello")]))
            .await
            .unwrap();
        assert_eq!(result, judge::native::sha512x5000(&[json!("hello")]).unwrap());

        let err = h1
            .link
            .execute(Task::new("missing", "t-2", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Remote(_)), "got {err:?}");

        let err = h1.link.upload_program("junk", b"not a program").await.unwrap_err();
        assert!(matches!(err, LinkError::Remote(_)), "got {err:?}");
        drop(h2);
    }

    #[tokio::test]
    async fn test_telemetry_flows_once_connected() {
        let (mut h1, _h2) = connected_pair().await;

        let mut saw_hardware = false;
        let mut saw_traffic = false;
        let deadline = tokio::time::sleep(Duration::from_secs(3));
        tokio::pin!(deadline);
        while !(saw_hardware && saw_traffic) {
            tokio::select! {
                _ = &mut deadline => panic!("telemetry did not arrive"),
                event = h1.events.recv() => match event.map(|e| e.change) {
                    Some(PeerChange::Hardware(usage)) => {
                        assert!(usage.cpus > 0);
                        saw_hardware = true;
                    }
                    Some(PeerChange::Traffic(_)) => saw_traffic = true,
                    Some(_) => {}
                    None => panic!("event stream closed"),
                },
            }
        }
        assert!(h1.link.remote_usage().is_some());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_silences_events() {
        let (mut h1, mut h2) = connected_pair().await;

        h2.link.destroy();
        h2.link.destroy();
        assert!(h2.link.is_destroyed());
        assert_eq!(h2.link.negotiation_state(), NegotiationState::Closed);

        // The only sender left was owned by the link: the stream ends.
        while h2.events.recv().await.is_some() {}

        wait_for_status(&mut h1.events, ConnectionState::Disconnected).await;
        let err = h1
            .link
            .execute(Task::new("digest", "t-1", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::ChannelUnavailable));
    }

    #[tokio::test]
    async fn test_buffered_candidates_apply_in_arrival_order() {
        let (link, transport, _signals) = recording_link(NegotiationRole::Answerer);
        for c in ["c1", "c2", "c3"] {
            link.add_candidate(IceCandidate::new(c)).await.unwrap();
        }
        assert_eq!(link.pending_candidates(), 3);
        assert!(transport.applied().is_empty());

        link.create_answer(SessionDescription::offer("remote")).await.unwrap();
        assert_eq!(transport.applied(), vec!["c1", "c2", "c3"]);
        assert_eq!(link.pending_candidates(), 0);

        // Once the remote description is set, candidates skip the buffer.
        link.add_candidate(IceCandidate::new("c4")).await.unwrap();
        assert_eq!(link.pending_candidates(), 0);
        assert_eq!(transport.applied(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_rejected_answer_leaves_offer_open() {
        let (link, transport, _signals) = recording_link(NegotiationRole::Offerer);
        link.create_offer().await.unwrap();
        link.add_candidate(IceCandidate::new("c1")).await.unwrap();
        link.add_candidate(IceCandidate::new("c2")).await.unwrap();

        let err = link
            .accept_answer(SessionDescription::answer("garbage"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Transport(TransportError::InvalidDescription(_))), "{err:?}");
        assert_eq!(link.negotiation_state(), NegotiationState::Offering);
        assert_eq!(link.pending_candidates(), 2);

        link.accept_answer(SessionDescription::answer("remote")).await.unwrap();
        assert_eq!(link.negotiation_state(), NegotiationState::Negotiating);
        assert_eq!(transport.applied(), vec!["c1", "c2"]);
    }

    #[tokio::test]
    async fn test_roles_are_enforced() {
        let network = MemoryNetwork::new();
        let answerer = side(&network, "h2", "h1", NegotiationRole::Answerer);
        assert!(matches!(
            answerer.link.create_offer().await,
            Err(LinkError::Negotiation(_))
        ));

        let offerer = side(&network, "h1", "h2", NegotiationRole::Offerer);
        assert!(matches!(
            offerer.link.accept_answer(SessionDescription::answer("memory x")).await,
            Err(LinkError::Negotiation(_))
        ));
        assert!(matches!(
            offerer.link.execute(Task::new("p", "t", vec![])).await,
            Err(LinkError::ChannelUnavailable)
        ));
    }
}
