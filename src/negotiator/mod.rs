//! Negotiator Module - Offer/Answer/ICE pro Peer
//!
//! Ein [`SessionNegotiator`] führt genau einen Verhandlungsversuch mit einem
//! Peer durch. Über Retries entscheidet er nie selbst; Fehler und
//! Statuswechsel meldet er als [`NegotiatorEvent`] an den Supervisor.
//!
//! [`NegotiatorHandle`] lässt einen Negotiator als eigenen Task laufen, so
//! dass Operationen pro Peer serialisiert, verschiedene Peers aber parallel
//! verarbeitet werden.
//!

mod actor;
mod machine;

pub use actor::NegotiatorHandle;
pub use machine::SessionNegotiator;

use crate::signaling::{BusError, ParticipantId, SignalBus};
use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signal bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Negotiator is closed")]
    Closed,
}

/// Warum ein Verhandlungsversuch gescheitert ist
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "detail")]
pub enum FailureCause {
    #[error("transport reported failed")]
    TransportFailed,

    #[error("connection stayed disconnected")]
    Disconnected,

    #[error("no progress in state {0:?}")]
    Timeout(NegotiationState),

    #[error("transport error: {0}")]
    Transport(String),
}

// ============================================================================
// STATE
// ============================================================================

/// Rolle innerhalb eines Paares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    /// Beide Seiten berechnen dieselbe Aufteilung: die kleinere ID erstellt
    /// das Offer.
    pub fn between(local: &ParticipantId, remote: &ParticipantId) -> Role {
        if local < remote {
            Role::Initiator
        } else {
            Role::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NegotiationState {
    Idle,
    Offering,
    AwaitingAnswer,
    AwaitingFirstCandidate,
    AnsweringOffer,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    /// Zustände, in denen ohne Fortschritt ein Timeout greift
    pub fn is_negotiating(self) -> bool {
        matches!(
            self,
            NegotiationState::Offering
                | NegotiationState::AwaitingAnswer
                | NegotiationState::AwaitingFirstCandidate
                | NegotiationState::AnsweringOffer
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatorEventKind {
    StateChanged(NegotiationState),
    /// Erste Konvergenz; wird pro Negotiator genau einmal gemeldet
    Established,
    Failed { attempt: u32, cause: FailureCause },
    ProtocolViolation(String),
}

/// Event an den Supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatorEvent {
    pub peer: ParticipantId,
    /// Unterscheidet Events verworfener Negotiatoren desselben Peers
    pub generation: u64,
    pub kind: NegotiatorEventKind,
}

// ============================================================================
// CONTEXT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationTimings {
    /// Maximale Dauer ohne Fortschritt während der Verhandlung
    pub negotiation_timeout: Duration,
    /// Wie lange `disconnected` anhalten darf, bevor es als Fehler zählt
    pub disconnect_grace: Duration,
}

impl Default for NegotiationTimings {
    fn default() -> Self {
        Self {
            negotiation_timeout: Duration::from_secs(15),
            disconnect_grace: Duration::from_secs(5),
        }
    }
}

/// Was ein Negotiator von seiner Umgebung braucht
#[derive(Clone)]
pub struct NegotiatorContext {
    pub local: ParticipantId,
    pub bus: Arc<dyn SignalBus>,
    /// Signaling-Topic des Raums
    pub topic: String,
    pub events: mpsc::UnboundedSender<NegotiatorEvent>,
    pub timings: NegotiationTimings,
}

impl std::fmt::Debug for NegotiatorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiatorContext")
            .field("local", &self.local)
            .field("topic", &self.topic)
            .field("timings", &self.timings)
            .finish()
    }
}
