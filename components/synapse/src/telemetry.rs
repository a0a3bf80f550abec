//! Per-peer change notifications and the merged view built from them.

use crate::protocol::SessionId;
use crate::transport::{CandidatePair, ConnectionState, TransportStats};
use dashmap::DashMap;
use hive::HardwareUsage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<CandidatePair>,
}

/// Throughput over the last sampling interval, in bits per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficInfo {
    pub up: f64,
    pub down: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerChange {
    Connection(ConnectionStatus),
    Hardware(HardwareUsage),
    Traffic(TrafficInfo),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer: SessionId,
    pub change: PeerChange,
}

/// Turns cumulative byte counters into rates. The first sample only sets
/// the baseline.
#[derive(Debug, Default)]
pub struct TrafficMeter {
    last: Option<(Instant, TransportStats)>,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sample(&mut self, now: Instant, stats: TransportStats) -> Option<TrafficInfo> {
        let (then, before) = self.last.replace((now, stats))?;
        let elapsed = now.saturating_duration_since(then).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let sent = stats.bytes_sent.saturating_sub(before.bytes_sent);
        let received = stats.bytes_received.saturating_sub(before.bytes_received);
        Some(TrafficInfo {
            up: sent as f64 * 8.0 / elapsed,
            down: received as f64 * 8.0 / elapsed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    #[serde(rename = "peerId")]
    pub peer_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<HardwareUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic: Option<TrafficInfo>,
}

impl PeerInfo {
    fn new(peer_id: SessionId) -> Self {
        Self {
            peer_id,
            connection: None,
            hardware: None,
            traffic: None,
        }
    }
}

/// Latest known connection, hardware and traffic figures of every peer,
/// keyed by session id. Rows stay after a link is torn down so the final
/// status remains visible until the peer comes back.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    peers: Arc<DashMap<SessionId, PeerInfo>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, event: &PeerEvent) {
        let mut row = self
            .peers
            .entry(event.peer.clone())
            .or_insert_with(|| PeerInfo::new(event.peer.clone()));
        match &event.change {
            PeerChange::Connection(status) => row.connection = Some(status.clone()),
            PeerChange::Hardware(usage) => row.hardware = Some(usage.clone()),
            PeerChange::Traffic(traffic) => row.traffic = Some(*traffic),
        }
    }

    pub fn get(&self, peer: &SessionId) -> Option<PeerInfo> {
        self.peers.get(peer).map(|row| row.clone())
    }

    pub fn remove(&self, peer: &SessionId) -> Option<PeerInfo> {
        self.peers.remove(peer).map(|(_, info)| info)
    }

    pub fn snapshot(&self) -> Vec<PeerInfo> {
        let mut rows: Vec<PeerInfo> = self.peers.iter().map(|row| row.value().clone()).collect();
        rows.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        rows
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
