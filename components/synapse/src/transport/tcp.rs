//! Direct TCP transport.
//!
//! The offering side binds an ephemeral listener and advertises one host
//! candidate per configured address. The answering side dials the
//! candidates it receives and opens with a one-line handshake carrying the
//! offerer's session token; the first connection that passes the handshake
//! becomes the data channel. Messages are newline-delimited text.

use super::{
    parse_description, CandidatePair, ConnectionState, DataChannel, Transport, TransportError, TransportEvent,
    TransportEvents, TransportFactory, TransportStats,
};
use crate::protocol::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const SCHEME: &str = "tcp-session";
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

type Lines = Framed<TcpStream, LinesCodec>;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address the offering side listens on.
    pub bind: IpAddr,
    /// Addresses advertised as host candidates.
    pub advertise: Vec<IpAddr>,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
        }
    }
}

#[derive(Clone)]
pub struct TcpTransportFactory {
    config: Arc<TcpConfig>,
}

impl TcpTransportFactory {
    pub fn new(config: TcpConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl TransportFactory for TcpTransportFactory {
    fn create(&self) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError> {
        let (events, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config: self.config.clone(),
            token: Uuid::new_v4().simple().to_string(),
            events,
            state: Mutex::new(TcpState::default()),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });
        Ok((Arc::new(TcpTransport { inner }), rx))
    }
}

#[derive(Default)]
struct TcpState {
    channel_label: Option<String>,
    listen_port: Option<u16>,
    remote_token: Option<String>,
    connection: ConnectionState,
    dials: usize,
    pair: Option<CandidatePair>,
    channel: Option<Arc<TcpChannel>>,
}

struct Inner {
    config: Arc<TcpConfig>,
    token: String,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<TcpState>,
    sent: AtomicU64,
    received: AtomicU64,
    shutdown: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TcpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TransportEvent) {
        if !self.shutdown.is_cancelled() {
            let _ = self.events.send(event);
        }
    }

    fn attach(self: &Arc<Self>, lines: Lines) {
        let pair = match (lines.get_ref().local_addr(), lines.get_ref().peer_addr()) {
            (Ok(local), Ok(remote)) => Some(CandidatePair {
                local: local.to_string(),
                remote: remote.to_string(),
            }),
            _ => None,
        };

        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (was_new, channel) = {
            let mut state = self.lock();
            if !matches!(state.connection, ConnectionState::New | ConnectionState::Connecting) {
                return;
            }
            let was_new = state.connection == ConnectionState::New;
            state.connection = ConnectionState::Connected;
            state.pair = pair.clone();

            let channel = Arc::new(TcpChannel {
                label: state.channel_label.clone().unwrap_or_else(|| "data".to_string()),
                outgoing,
                open: AtomicBool::new(true),
                closing: self.shutdown.child_token(),
            });
            state.channel = Some(channel.clone());
            (was_new, channel)
        };

        if let Some(pair) = &pair {
            info!(local = %pair.local, remote = %pair.remote, "tcp transport connected");
        }
        if was_new {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
        }
        self.emit(TransportEvent::ConnectionState(ConnectionState::Connected));

        let (sink, stream) = lines.split();
        tokio::spawn(write_loop(self.clone(), sink, outgoing_rx, channel.closing.clone()));
        tokio::spawn(read_loop(self.clone(), stream, channel.closing.clone()));
        self.emit(TransportEvent::ChannelOpen(channel));
    }

    fn begin_dial(&self) {
        let was_new = {
            let mut state = self.lock();
            state.dials += 1;
            let was_new = state.connection == ConnectionState::New;
            if was_new {
                state.connection = ConnectionState::Connecting;
            }
            was_new
        };
        if was_new {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Connecting));
        }
    }

    fn dial_failed(&self) {
        let failed = {
            let mut state = self.lock();
            state.dials = state.dials.saturating_sub(1);
            let failed = state.dials == 0 && state.connection == ConnectionState::Connecting;
            if failed {
                state.connection = ConnectionState::Failed;
            }
            failed
        };
        if failed {
            self.emit(TransportEvent::ConnectionState(ConnectionState::Failed));
        }
    }

    fn lost(&self) {
        let channel = {
            let mut state = self.lock();
            if state.connection != ConnectionState::Connected {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.channel.take()
        };
        if let Some(channel) = channel {
            if channel.open.swap(false, Ordering::AcqRel) {
                self.emit(TransportEvent::ChannelClosed);
            }
        }
        self.emit(TransportEvent::ConnectionState(ConnectionState::Disconnected));
    }
}

fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        let accepted = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let mut lines = Framed::new(stream, codec());
        let hello = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, lines.next()) => hello,
        };
        match hello {
            Ok(Some(Ok(token))) if token == inner.token => {
                inner.attach(lines);
                return;
            }
            _ => debug!(%addr, "rejected connection without a valid handshake"),
        }
    }
}

async fn dial(inner: Arc<Inner>, addr: SocketAddr, remote_token: String) {
    inner.begin_dial();
    let connected = tokio::select! {
        _ = inner.shutdown.cancelled() => return,
        connected = TcpStream::connect(addr) => connected,
    };
    let mut lines = match connected {
        Ok(stream) => Framed::new(stream, codec()),
        Err(e) => {
            debug!(%addr, "dial failed: {e}");
            inner.dial_failed();
            return;
        }
    };
    if let Err(e) = lines.send(remote_token).await {
        debug!(%addr, "handshake failed: {e}");
        inner.dial_failed();
        return;
    }
    inner.attach(lines);
}

async fn write_loop(
    inner: Arc<Inner>,
    mut sink: SplitSink<Lines, String>,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    closing: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = closing.cancelled() => break,
            line = outgoing.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let len = line.len() as u64 + 1;
        if let Err(e) = sink.send(line).await {
            warn!("tcp write failed: {e}");
            break;
        }
        inner.sent.fetch_add(len, Ordering::Relaxed);
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<Inner>, mut stream: SplitStream<Lines>, closing: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = closing.cancelled() => break,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(line)) => {
                inner.received.fetch_add(line.len() as u64 + 1, Ordering::Relaxed);
                inner.emit(TransportEvent::ChannelMessage(line));
            }
            Some(Err(e)) => {
                warn!("tcp read failed: {e}");
                break;
            }
            None => break,
        }
    }
    inner.lost();
}

/// Parses `... tcp <host> <port> ...` out of a candidate line.
fn parse_candidate(candidate: &IceCandidate) -> Result<SocketAddr, TransportError> {
    let invalid = || TransportError::InvalidCandidate(candidate.candidate.clone());
    let mut fields = candidate.candidate.split_whitespace();
    fields.by_ref().position(|f| f.eq_ignore_ascii_case("tcp")).ok_or_else(invalid)?;
    let host: IpAddr = fields.next().and_then(|h| h.parse().ok()).ok_or_else(invalid)?;
    let port: u16 = fields.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
    Ok(SocketAddr::new(host, port))
}

pub struct TcpTransport {
    inner: Arc<Inner>,
}

#[async_trait]
impl Transport for TcpTransport {
    fn create_data_channel(&self, label: &str) -> Result<(), TransportError> {
        self.inner.lock().channel_label = Some(label.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.inner.lock().listen_port.is_none() {
            let listener = TcpListener::bind(SocketAddr::new(self.inner.config.bind, 0)).await?;
            let port = listener.local_addr()?.port();
            self.inner.lock().listen_port = Some(port);
            debug!(port, "listening for peer");
            tokio::spawn(accept_loop(self.inner.clone(), listener));
        }

        let label = self.inner.lock().channel_label.clone().unwrap_or_else(|| "data".to_string());
        Ok(SessionDescription::offer(format!("{SCHEME} {} {label}", self.inner.token)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if !self.has_remote_description() {
            return Err(TransportError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(format!("{SCHEME} {}", self.inner.token)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        if parse_description(&desc, SCHEME)? != self.inner.token {
            return Err(TransportError::InvalidDescription(desc.sdp));
        }
        let Some(port) = self.inner.lock().listen_port else {
            return Ok(());
        };
        for (i, ip) in self.inner.config.advertise.iter().enumerate() {
            let candidate = IceCandidate::new(format!("candidate:{} 1 tcp {ip} {port} typ host", i + 1));
            self.inner.emit(TransportEvent::LocalCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), TransportError> {
        let token = parse_description(&desc, SCHEME)?;
        let label = desc.sdp.split_whitespace().nth(2).map(str::to_string);

        let mut state = self.inner.lock();
        state.remote_token = Some(token);
        if state.channel_label.is_none() {
            state.channel_label = label;
        }
        Ok(())
    }

    fn has_remote_description(&self) -> bool {
        self.inner.lock().remote_token.is_some()
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), TransportError> {
        let addr = parse_candidate(candidate)?;
        let remote_token = {
            let state = self.inner.lock();
            let Some(remote_token) = state.remote_token.clone() else {
                return Err(TransportError::NoRemoteDescription);
            };
            // The listening side waits for the dial.
            if state.listen_port.is_some()
                || !matches!(state.connection, ConnectionState::New | ConnectionState::Connecting)
            {
                return Ok(());
            }
            remote_token
        };

        tokio::spawn(dial(self.inner.clone(), addr, remote_token));
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection
    }

    fn selected_pair(&self) -> Option<CandidatePair> {
        let state = self.inner.lock();
        match state.connection {
            ConnectionState::Connected => state.pair.clone(),
            _ => None,
        }
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.inner.sent.load(Ordering::Relaxed),
            bytes_received: self.inner.received.load(Ordering::Relaxed),
        }
    }

    fn close(&self) {
        let channel = {
            let mut state = self.inner.lock();
            if state.connection == ConnectionState::Closed {
                return;
            }
            state.connection = ConnectionState::Closed;
            state.channel.take()
        };
        self.inner.shutdown.cancel();
        if let Some(channel) = channel {
            channel.open.store(false, Ordering::Release);
        }
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.close();
    }
}

struct TcpChannel {
    label: String,
    outgoing: mpsc::UnboundedSender<String>,
    open: AtomicBool,
    closing: CancellationToken,
}

impl DataChannel for TcpChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn send(&self, text: &str) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.outgoing
            .send(text.to_string())
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn close(&self) {
        self.closing.cancel();
    }
}
