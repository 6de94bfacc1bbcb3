//! Transport Module - Peer-Verbindungen als Black Box
//!
//! Der Negotiator spricht nur mit [`PeerTransport`]; wie die Verbindung
//! tatsächlich aufgebaut wird, entscheidet die [`TransportFactory`]:
//! - WebRtcTransport: echte Peer Connection über webrtc-rs
//! - Loopback: deterministischer In-Process Transport
//!

mod loopback;
mod rtc;

pub use loopback::{LoopbackBehaviour, LoopbackNetwork, LoopbackProbe};
pub use rtc::{default_ice_servers, WebRtcTransport, WebRtcTransportFactory};

use crate::media::LocalMediaHandle;
use crate::signaling::ParticipantId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Invalid ICE candidate: {0}")]
    InvalidCandidate(String),

    #[error("Transport is closed")]
    Closed,
}

// ============================================================================
// TRANSPORT TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Verbindungsstatus, wie ihn der Transport meldet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl Connectivity {
    /// `connected` oder `completed`
    pub fn is_converged(self) -> bool {
        matches!(self, Connectivity::Connected | Connectivity::Completed)
    }
}

/// Events die ein Transport auslöst
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Lokaler ICE Candidate (JSON, so wie er übertragen wird)
    LocalCandidate(String),
    Connectivity(Connectivity),
}

pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Eine einzelne Peer-Verbindung
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Erzeugt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Erzeugt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), TransportError>;

    /// Tauscht die ausgehenden Tracks, ohne die Verbindung abzubauen
    async fn replace_tracks(&self, media: Option<&LocalMediaHandle>)
        -> Result<(), TransportError>;

    /// Schließt die Verbindung; mehrfacher Aufruf ist erlaubt
    async fn close(&self) -> Result<(), TransportError>;
}

/// Neu erzeugter Transport samt Event-Stream
pub struct TransportParts {
    pub transport: Arc<dyn PeerTransport>,
    pub events: TransportEvents,
}

impl std::fmt::Debug for TransportParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportParts").finish_non_exhaustive()
    }
}

/// Erzeugt Transports für einzelne Peers
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        local: &ParticipantId,
        peer: &ParticipantId,
        media: Option<&LocalMediaHandle>,
    ) -> Result<TransportParts, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converged_states() {
        assert!(Connectivity::Connected.is_converged());
        assert!(Connectivity::Completed.is_converged());
        assert!(!Connectivity::Checking.is_converged());
        assert!(!Connectivity::Disconnected.is_converged());
    }
}
