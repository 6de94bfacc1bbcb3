//! Aggregierter Verbindungsstatus und Ereignisprotokoll

use crate::media::MediaAvailability;
use crate::negotiator::{NegotiationState, Role};
use crate::signaling::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use uuid::Uuid;

// ============================================================================
// STATUS
// ============================================================================

/// Status, den die UI anzeigt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionStatus {
    /// Keine Verbindung
    #[default]
    Searching,
    /// Mindestens ein Peer verbunden
    Connected,
    /// Keiner verbunden, mindestens einer im Retry
    Reconnecting,
    /// Alle Versuche erschöpft ("could not connect")
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: ConnectionStatus,
    pub connected_peer_ids: Vec<ParticipantId>,
    /// Peer → aktueller Retry-Versuch
    pub retrying: BTreeMap<ParticipantId, u32>,
    pub failed_peer_ids: Vec<ParticipantId>,
    pub media: MediaAvailability,
}

/// Leitet den Gesamtstatus aus den Zählern ab
///
/// `negotiating` zählt Sessions im ersten Versuch, die noch nicht verbunden
/// sind; solange es sie gibt, wird weiter gesucht statt aufgegeben.
pub fn derive_status(
    connected: usize,
    retrying: usize,
    negotiating: usize,
    failed: usize,
) -> ConnectionStatus {
    if connected > 0 {
        ConnectionStatus::Connected
    } else if retrying > 0 {
        ConnectionStatus::Reconnecting
    } else if failed > 0 && negotiating == 0 {
        ConnectionStatus::Failed
    } else {
        ConnectionStatus::Searching
    }
}

/// Sicht auf eine einzelne PeerSession
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSessionInfo {
    pub peer: ParticipantId,
    pub role: Role,
    pub state: NegotiationState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub generation: u64,
    pub session_id: Option<Uuid>,
}

// ============================================================================
// EVENT LOG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SessionLogEvent {
    PeerJoined,
    PeerLeft,
    SessionCreated { role: Role, attempt: u32 },
    Established,
    NegotiationFailed { attempt: u32, cause: String },
    RetryScheduled { attempt: u32, delay_ms: u64 },
    /// Retries erschöpft, der Peer wird nicht mehr angefragt
    HardFailure { attempts: u32, cause: String },
    ProtocolViolation { reason: String },
    TracksReplaced,
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionLogEntry {
    pub at: DateTime<Utc>,
    pub peer: Option<ParticipantId>,
    pub event: SessionLogEvent,
}

/// Ringpuffer der letzten Ereignisse
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<SessionLogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, peer: Option<ParticipantId>, event: SessionLogEvent) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(SessionLogEntry {
            at: Utc::now(),
            peer,
            event,
        });
    }

    /// Älteste zuerst
    pub fn entries(&self) -> Vec<SessionLogEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
