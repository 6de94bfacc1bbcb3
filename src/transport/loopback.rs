//! Loopback Transport
//!
//! Deterministischer In-Process Transport für Tests und Offline-Betrieb.
//! Jede Seite konvergiert unabhängig, sobald Local Description, Remote
//! Description und mindestens ein Remote Candidate vorliegen. Über das
//! [`LoopbackNetwork`] lässt sich beobachten, was die Negotiatoren mit
//! ihren Transports anstellen.

use super::{
    Connectivity, PeerTransport, SdpKind, TransportError, TransportEvent, TransportFactory,
    TransportParts,
};
use crate::media::LocalMediaHandle;
use crate::signaling::ParticipantId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Lokale Candidates pro erzeugter Description
const CANDIDATES_PER_DESCRIPTION: u16 = 2;

/// Wie sich neu erzeugte Transports verhalten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopbackBehaviour {
    /// Meldet `connected`, sobald der Austausch vollständig ist
    #[default]
    Converge,
    /// Meldet `failed` statt `connected`
    AlwaysFail,
    /// Meldet nie einen Endzustand
    Stall,
}

// ============================================================================
// PROBE
// ============================================================================

#[derive(Debug, Default)]
struct ProbeState {
    offers_created: usize,
    answers_created: usize,
    remote_descriptions: Vec<SdpKind>,
    applied_candidates: Vec<String>,
    track_replacements: usize,
    media: Option<Uuid>,
    closed: bool,
}

/// Beobachtet einen einzelnen Loopback Transport
#[derive(Clone)]
pub struct LoopbackProbe {
    state: Arc<Mutex<ProbeState>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl LoopbackProbe {
    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn answers_created(&self) -> usize {
        self.state.lock().answers_created
    }

    pub fn remote_descriptions(&self) -> Vec<SdpKind> {
        self.state.lock().remote_descriptions.clone()
    }

    /// Angewendete Remote Candidates in Reihenfolge
    pub fn applied_candidates(&self) -> Vec<String> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn track_replacements(&self) -> usize {
        self.state.lock().track_replacements
    }

    /// ID des zuletzt angehängten lokalen Streams
    pub fn media(&self) -> Option<Uuid> {
        self.state.lock().media
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Simuliert eine Statusmeldung des Transports
    pub fn inject(&self, connectivity: Connectivity) {
        let _ = self.events.send(TransportEvent::Connectivity(connectivity));
    }
}

impl std::fmt::Debug for LoopbackProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackProbe")
            .field("state", &*self.state.lock())
            .finish()
    }
}

// ============================================================================
// NETWORK
// ============================================================================

#[derive(Debug, Default)]
struct NetworkState {
    behaviour: LoopbackBehaviour,
    probes: HashMap<(ParticipantId, ParticipantId), Vec<LoopbackProbe>>,
}

/// Factory und Beobachter für Loopback Transports
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behaviour(behaviour: LoopbackBehaviour) -> Self {
        let network = Self::default();
        network.set_behaviour(behaviour);
        network
    }

    /// Gilt für alle ab jetzt erzeugten Transports
    pub fn set_behaviour(&self, behaviour: LoopbackBehaviour) {
        self.state.lock().behaviour = behaviour;
    }

    /// Anzahl Transports, die `local` für `peer` erzeugt hat
    pub fn transports_created(&self, local: &ParticipantId, peer: &ParticipantId) -> usize {
        self.probes(local, peer).len()
    }

    pub fn probes(&self, local: &ParticipantId, peer: &ParticipantId) -> Vec<LoopbackProbe> {
        self.state
            .lock()
            .probes
            .get(&(local.clone(), peer.clone()))
            .cloned()
            .unwrap_or_default()
    }

    /// Zuletzt erzeugter Transport von `local` zu `peer`
    pub fn latest(&self, local: &ParticipantId, peer: &ParticipantId) -> Option<LoopbackProbe> {
        self.probes(local, peer).pop()
    }

    /// Anzahl noch nicht geschlossener Transports
    pub fn open_transports(&self) -> usize {
        self.state
            .lock()
            .probes
            .values()
            .flatten()
            .filter(|p| !p.is_closed())
            .count()
    }
}

#[async_trait]
impl TransportFactory for LoopbackNetwork {
    async fn create(
        &self,
        local: &ParticipantId,
        peer: &ParticipantId,
        media: Option<&LocalMediaHandle>,
    ) -> Result<TransportParts, TransportError> {
        let (event_tx, events) = mpsc::unbounded_channel();
        let probe = LoopbackProbe {
            state: Arc::new(Mutex::new(ProbeState {
                media: media.map(|m| m.id()),
                ..Default::default()
            })),
            events: event_tx.clone(),
        };

        let behaviour = {
            let mut state = self.state.lock();
            state
                .probes
                .entry((local.clone(), peer.clone()))
                .or_default()
                .push(probe.clone());
            state.behaviour
        };

        let transport = LoopbackTransport {
            local: local.clone(),
            peer: peer.clone(),
            behaviour,
            probe,
            events: event_tx,
            endpoint: Mutex::new(Endpoint::default()),
        };

        Ok(TransportParts {
            transport: Arc::new(transport),
            events,
        })
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

#[derive(Debug, Default)]
struct Endpoint {
    local_description: Option<SdpKind>,
    remote_description: Option<SdpKind>,
    /// Remote Offer, auf das noch kein Answer erzeugt wurde
    pending_offer: bool,
    remote_candidates: usize,
    next_candidate: u16,
    converged: bool,
    closed: bool,
}

struct LoopbackTransport {
    local: ParticipantId,
    peer: ParticipantId,
    behaviour: LoopbackBehaviour,
    probe: LoopbackProbe,
    events: mpsc::UnboundedSender<TransportEvent>,
    endpoint: Mutex<Endpoint>,
}

impl LoopbackTransport {
    fn description(&self, kind: SdpKind, round: usize) -> String {
        let kind = match kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        };
        format!(
            "v=0\r\no=loopback {round} {round} IN IP4 127.0.0.1\r\ns={kind} {}->{}\r\n",
            self.local, self.peer
        )
    }

    /// Lokale Candidates nach dem Setzen der Local Description
    fn gather(&self, endpoint: &mut Endpoint) {
        for _ in 0..CANDIDATES_PER_DESCRIPTION {
            endpoint.next_candidate += 1;
            let candidate = serde_json::json!({
                "candidate": format!(
                    "candidate:{n} 1 udp 2122260223 127.0.0.1 {port} typ host",
                    n = endpoint.next_candidate,
                    port = 50000 + endpoint.next_candidate
                ),
                "sdpMid": "0",
                "sdpMLineIndex": 0,
            });
            let _ = self
                .events
                .send(TransportEvent::LocalCandidate(candidate.to_string()));
        }
    }

    fn check_convergence(&self, endpoint: &mut Endpoint) {
        if endpoint.converged
            || endpoint.local_description.is_none()
            || endpoint.remote_description.is_none()
            || endpoint.remote_candidates == 0
        {
            return;
        }

        let outcome = match self.behaviour {
            LoopbackBehaviour::Converge => Connectivity::Connected,
            LoopbackBehaviour::AlwaysFail => Connectivity::Failed,
            LoopbackBehaviour::Stall => return,
        };

        endpoint.converged = true;
        let _ = self
            .events
            .send(TransportEvent::Connectivity(Connectivity::Checking));
        let _ = self.events.send(TransportEvent::Connectivity(outcome));
    }

    fn ensure_open(endpoint: &Endpoint) -> Result<(), TransportError> {
        if endpoint.closed {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        let mut endpoint = self.endpoint.lock();
        Self::ensure_open(&endpoint)?;

        let round = {
            let mut probe = self.probe.state.lock();
            probe.offers_created += 1;
            probe.offers_created
        };

        endpoint.local_description = Some(SdpKind::Offer);
        let sdp = self.description(SdpKind::Offer, round);
        self.gather(&mut endpoint);
        self.check_convergence(&mut endpoint);
        Ok(sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let mut endpoint = self.endpoint.lock();
        Self::ensure_open(&endpoint)?;

        if !endpoint.pending_offer {
            return Err(TransportError::InvalidSdp(
                "no remote offer to answer".to_string(),
            ));
        }

        let round = {
            let mut probe = self.probe.state.lock();
            probe.answers_created += 1;
            probe.answers_created
        };

        endpoint.pending_offer = false;
        endpoint.local_description = Some(SdpKind::Answer);
        let sdp = self.description(SdpKind::Answer, round);
        self.gather(&mut endpoint);
        self.check_convergence(&mut endpoint);
        Ok(sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), TransportError> {
        let mut endpoint = self.endpoint.lock();
        Self::ensure_open(&endpoint)?;

        if sdp.is_empty() {
            return Err(TransportError::InvalidSdp("empty description".to_string()));
        }
        if kind == SdpKind::Answer && endpoint.local_description != Some(SdpKind::Offer) {
            return Err(TransportError::InvalidSdp(
                "answer without local offer".to_string(),
            ));
        }

        endpoint.remote_description = Some(kind);
        endpoint.pending_offer = kind == SdpKind::Offer;
        self.probe.state.lock().remote_descriptions.push(kind);
        self.check_convergence(&mut endpoint);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: String) -> Result<(), TransportError> {
        let mut endpoint = self.endpoint.lock();
        Self::ensure_open(&endpoint)?;

        if endpoint.remote_description.is_none() {
            return Err(TransportError::InvalidCandidate(
                "remote description not set".to_string(),
            ));
        }

        endpoint.remote_candidates += 1;
        self.probe.state.lock().applied_candidates.push(candidate);
        self.check_convergence(&mut endpoint);
        Ok(())
    }

    async fn replace_tracks(&self, media: Option<&LocalMediaHandle>) -> Result<(), TransportError> {
        let endpoint = self.endpoint.lock();
        Self::ensure_open(&endpoint)?;

        let mut probe = self.probe.state.lock();
        probe.track_replacements += 1;
        probe.media = media.map(|m| m.id());
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let mut endpoint = self.endpoint.lock();
        if endpoint.closed {
            return Ok(());
        }
        endpoint.closed = true;
        self.probe.state.lock().closed = true;
        let _ = self
            .events
            .send(TransportEvent::Connectivity(Connectivity::Closed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn pair(network: &LoopbackNetwork) -> (TransportParts, TransportParts) {
        let a = ParticipantId::from("a");
        let b = ParticipantId::from("b");
        let left = network.create(&a, &b, None).await.unwrap();
        let right = network.create(&b, &a, None).await.unwrap();
        (left, right)
    }

    fn candidates(events: &mut super::super::TransportEvents) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::LocalCandidate(c) = event {
                out.push(c);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_full_exchange_converges() {
        let network = LoopbackNetwork::new();
        let (mut left, mut right) = pair(&network).await;

        let offer = left.transport.create_offer().await.unwrap();
        right
            .transport
            .set_remote_description(SdpKind::Offer, offer)
            .await
            .unwrap();
        let answer = right.transport.create_answer().await.unwrap();
        left.transport
            .set_remote_description(SdpKind::Answer, answer)
            .await
            .unwrap();

        for c in candidates(&mut left.events) {
            right.transport.add_ice_candidate(c).await.unwrap();
        }
        for c in candidates(&mut right.events) {
            left.transport.add_ice_candidate(c).await.unwrap();
        }

        let mut states = Vec::new();
        while let Ok(TransportEvent::Connectivity(c)) = left.events.try_recv() {
            states.push(c);
        }
        assert_eq!(states, vec![Connectivity::Checking, Connectivity::Connected]);
        assert_eq!(
            network
                .latest(&"b".into(), &"a".into())
                .unwrap()
                .applied_candidates()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_is_rejected() {
        let network = LoopbackNetwork::new();
        let (left, _right) = pair(&network).await;

        assert!(matches!(
            left.transport.add_ice_candidate("{}".to_string()).await,
            Err(TransportError::InvalidCandidate(_))
        ));
    }

    #[tokio::test]
    async fn test_answer_requires_remote_offer() {
        let network = LoopbackNetwork::new();
        let (left, _right) = pair(&network).await;

        assert!(matches!(
            left.transport.create_answer().await,
            Err(TransportError::InvalidSdp(_))
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let network = LoopbackNetwork::new();
        let (left, _right) = pair(&network).await;
        assert_eq!(network.open_transports(), 2);

        left.transport.close().await.unwrap();
        left.transport.close().await.unwrap();
        assert_eq!(network.open_transports(), 1);
        assert_eq!(
            left.transport.create_offer().await,
            Err(TransportError::Closed)
        );
    }
}
