//! Zustandsmaschine eines einzelnen Verhandlungsversuchs
//!
//! Initiator: `Idle → Offering → AwaitingAnswer → AwaitingFirstCandidate →
//! Connected`. Responder: `Idle → AnsweringOffer → Connected`. Jeder Zustand
//! kann nach `Failed` oder `Closed` wechseln.
//!
//! Remote Candidates werden gepuffert, bis die Remote Description gesetzt
//! ist, und danach in Empfangsreihenfolge angewendet. Lokale Candidates
//! gehen erst raus, nachdem Offer bzw. Answer veröffentlicht wurde.

use super::{
    FailureCause, NegotiationError, NegotiationState, NegotiatorContext, NegotiatorEvent,
    NegotiatorEventKind, Role,
};
use crate::media::LocalMediaHandle;
use crate::signaling::{ParticipantId, SignalKind, SignalMessage};
use crate::transport::{Connectivity, PeerTransport, SdpKind, TransportEvent};
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

/// Obergrenze für gepufferte Remote Candidates
const MAX_BUFFERED_CANDIDATES: usize = 64;

pub struct SessionNegotiator {
    ctx: NegotiatorContext,
    peer: ParticipantId,
    role: Role,
    generation: u64,
    attempt: u32,
    state: NegotiationState,
    transport: Arc<dyn PeerTransport>,

    /// Verhandlungsversuch; vom Initiator vergeben, vom Responder übernommen
    session: Option<Uuid>,
    local_published: bool,
    remote_applied: bool,
    established: bool,
    /// Initiator wartet auf das Answer einer Neuverhandlung
    renegotiating: bool,
    /// Gerätewechsel während der Verhandlung, nachholen sobald verbunden
    renegotiate_when_connected: bool,
    /// Responder: Offer einer Neuverhandlung angewendet, Answer steht aus
    reoffer_pending: bool,

    buffered_candidates: Vec<(Uuid, String)>,
    queued_local: Vec<String>,
    last_progress: Instant,
    disconnected_since: Option<Instant>,
}

impl SessionNegotiator {
    pub fn new(
        ctx: NegotiatorContext,
        peer: ParticipantId,
        role: Role,
        generation: u64,
        attempt: u32,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self {
            ctx,
            peer,
            role,
            generation,
            attempt,
            state: NegotiationState::Idle,
            transport,
            session: None,
            local_published: false,
            remote_applied: false,
            established: false,
            renegotiating: false,
            renegotiate_when_connected: false,
            reoffer_pending: false,
            buffered_candidates: Vec::new(),
            queued_local: Vec::new(),
            last_progress: Instant::now(),
            disconnected_since: None,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn session(&self) -> Option<Uuid> {
        self.session
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    // ========================================================================
    // OPERATIONS
    // ========================================================================

    /// Initiator: erstellt das Offer und sendet es an den Peer
    pub async fn create_offer(&mut self) -> Result<(), NegotiationError> {
        let result = self.offer().await;
        self.absorb(&result).await;
        result
    }

    /// Responder: erzeugt das Answer auf ein bereits angewendetes Offer
    pub async fn create_answer(&mut self) -> Result<(), NegotiationError> {
        let result = self.answer().await;
        self.absorb(&result).await;
        result
    }

    /// Verarbeitet eine an uns adressierte Signaling-Nachricht
    pub async fn handle_signal(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        let result = self.route_signal(message).await;
        self.absorb(&result).await;
        result
    }

    /// Verarbeitet ein Event des eigenen Transports
    pub async fn handle_transport_event(
        &mut self,
        event: TransportEvent,
    ) -> Result<(), NegotiationError> {
        if self.is_terminal() {
            return Ok(());
        }
        let result = match event {
            TransportEvent::LocalCandidate(candidate) => self.on_local_candidate(candidate).await,
            TransportEvent::Connectivity(connectivity) => {
                self.on_connectivity(connectivity).await;
                Ok(())
            }
        };
        self.absorb(&result).await;
        result
    }

    /// Tauscht die ausgehenden Tracks; der Initiator verhandelt danach neu
    pub async fn replace_tracks(
        &mut self,
        media: Option<&LocalMediaHandle>,
    ) -> Result<(), NegotiationError> {
        if self.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        let result = self.swap_tracks(media).await;
        self.absorb(&result).await;
        result
    }

    /// Nächster Zeitpunkt, zu dem [`Self::on_deadline`] aufgerufen werden muss
    pub fn deadline(&self) -> Option<Instant> {
        if self.is_terminal() {
            return None;
        }
        let timings = self.ctx.timings;
        let negotiation = (self.state.is_negotiating()
            || self.renegotiating
            || self.awaiting_retry_offer())
        .then(|| self.last_progress + timings.negotiation_timeout);
        let disconnect = self
            .disconnected_since
            .map(|since| since + timings.disconnect_grace);

        match (negotiation, disconnect) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Prüft Timeouts
    pub async fn on_deadline(&mut self, now: Instant) {
        if self.is_terminal() {
            return;
        }
        let timings = self.ctx.timings;

        if let Some(since) = self.disconnected_since {
            if now >= since + timings.disconnect_grace {
                self.fail(FailureCause::Disconnected).await;
                return;
            }
        }

        if now < self.last_progress + timings.negotiation_timeout {
            return;
        }

        if self.state.is_negotiating() || self.awaiting_retry_offer() {
            self.fail(FailureCause::Timeout(self.state)).await;
        } else if self.renegotiating {
            // Die Verbindung steht weiter; nur das neue Answer kam nicht an
            tracing::warn!("Renegotiation with {} got no answer, giving up", self.peer);
            self.renegotiating = false;
        }
    }

    /// Schließt den Negotiator samt Transport; mehrfacher Aufruf ist erlaubt
    pub async fn close(&mut self) {
        if self.state == NegotiationState::Closed {
            return;
        }
        self.shutdown_transport().await;
        self.set_state(NegotiationState::Closed);
        tracing::debug!("Negotiator for {} (gen {}) closed", self.peer, self.generation);
    }

    /// Schließt den Negotiator wegen eines Protokollfehlers des Peers
    pub async fn report_violation(&mut self, reason: String) {
        if self.state == NegotiationState::Closed {
            return;
        }
        tracing::warn!("Protocol violation by {}: {}", self.peer, reason);
        self.close().await;
        self.emit(NegotiatorEventKind::ProtocolViolation(reason));
    }

    /// Wiederholter Responder, dessen Initiator noch kein neues Offer geschickt hat
    ///
    /// Beim ersten Versuch wartet der Responder unbegrenzt, ab dem zweiten
    /// zählt das Warten auf das Offer als Verhandlung.
    fn awaiting_retry_offer(&self) -> bool {
        self.role == Role::Responder && self.state == NegotiationState::Idle && self.attempt > 0
    }

    // ========================================================================
    // PROTOCOL
    // ========================================================================

    async fn offer(&mut self) -> Result<(), NegotiationError> {
        if self.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        if self.role != Role::Initiator {
            return Err(NegotiationError::ProtocolViolation(
                "responder cannot create an offer".to_string(),
            ));
        }
        if self.state != NegotiationState::Idle {
            return Err(NegotiationError::ProtocolViolation(format!(
                "offer requested in state {:?}",
                self.state
            )));
        }

        let session = Uuid::new_v4();
        self.session = Some(session);
        self.set_state(NegotiationState::Offering);

        let sdp = self.transport.create_offer().await?;
        self.send(SignalKind::Offer, sdp).await?;
        tracing::info!("Sent offer to {} (session {})", self.peer, session);

        self.local_published = true;
        self.flush_local_candidates().await;
        self.set_state(NegotiationState::AwaitingAnswer);
        Ok(())
    }

    async fn answer(&mut self) -> Result<(), NegotiationError> {
        if self.is_terminal() {
            return Err(NegotiationError::Closed);
        }
        let answering = self.state == NegotiationState::AnsweringOffer && !self.local_published;
        if self.role != Role::Responder || !(answering || self.reoffer_pending) {
            return Err(NegotiationError::ProtocolViolation(
                "createAnswer without a prior offer".to_string(),
            ));
        }

        let sdp = self.transport.create_answer().await?;
        self.send(SignalKind::Answer, sdp).await?;
        tracing::info!("Sent answer to {}", self.peer);

        self.local_published = true;
        self.reoffer_pending = false;
        self.flush_local_candidates().await;
        self.touch();
        Ok(())
    }

    async fn route_signal(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        if self.is_terminal() {
            tracing::debug!(
                "Dropping {:?} from {}: negotiator is {:?}",
                message.kind,
                self.peer,
                self.state
            );
            return Err(NegotiationError::Closed);
        }
        if message.from != self.peer || message.target != self.ctx.local {
            return Ok(());
        }

        match message.kind {
            SignalKind::Offer => self.on_offer(message).await,
            SignalKind::Answer => self.on_answer(message).await,
            SignalKind::IceCandidate => self.on_remote_candidate(message).await,
        }
    }

    async fn on_offer(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        if self.role != Role::Responder {
            return Err(NegotiationError::ProtocolViolation(
                "offer received by the initiator".to_string(),
            ));
        }

        match self.session {
            None => {
                self.session = Some(message.session);
                self.set_state(NegotiationState::AnsweringOffer);
                self.apply_remote_description(SdpKind::Offer, message.payload)
                    .await?;
                self.answer().await
            }
            Some(session) if session != message.session => {
                tracing::debug!("Ignoring offer of stale session {} from {}", message.session, self.peer);
                Ok(())
            }
            // Der Initiator darf neu verhandeln, bevor unsere Seite verbunden ist
            Some(_) if self.remote_applied && self.local_published => {
                tracing::info!(
                    "Renegotiation offer from {} in state {:?}",
                    self.peer,
                    self.state
                );
                self.transport
                    .set_remote_description(SdpKind::Offer, message.payload)
                    .await?;
                self.reoffer_pending = true;
                self.touch();
                self.answer().await
            }
            Some(_) => Err(NegotiationError::ProtocolViolation(
                "remote description applied twice".to_string(),
            )),
        }
    }

    async fn on_answer(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        if self.role != Role::Initiator {
            return Err(NegotiationError::ProtocolViolation(
                "answer received by the responder".to_string(),
            ));
        }
        if self.session != Some(message.session) {
            tracing::debug!("Ignoring answer of stale session {} from {}", message.session, self.peer);
            return Ok(());
        }

        if self.state == NegotiationState::AwaitingAnswer {
            self.apply_remote_description(SdpKind::Answer, message.payload)
                .await?;
            tracing::info!("Applied answer from {}", self.peer);
            if !self.established {
                self.set_state(NegotiationState::AwaitingFirstCandidate);
            }
            return Ok(());
        }

        if self.renegotiating {
            self.transport
                .set_remote_description(SdpKind::Answer, message.payload)
                .await?;
            self.renegotiating = false;
            self.touch();
            tracing::info!("Renegotiation with {} complete", self.peer);
            return Ok(());
        }

        Err(NegotiationError::ProtocolViolation(
            "remote description applied twice".to_string(),
        ))
    }

    async fn on_remote_candidate(&mut self, message: SignalMessage) -> Result<(), NegotiationError> {
        let current = self.session == Some(message.session);

        if current && self.remote_applied {
            self.apply_candidate(message.payload).await;
            return Ok(());
        }

        // Initiator kennt nur die eigene Session
        if !current && self.role == Role::Initiator {
            tracing::debug!("Ignoring candidate of stale session {} from {}", message.session, self.peer);
            return Ok(());
        }

        if self.buffered_candidates.len() >= MAX_BUFFERED_CANDIDATES {
            // Candidates älterer Sessions zuerst verwerfen
            self.buffered_candidates
                .retain(|(session, _)| *session == message.session);
        }
        if self.buffered_candidates.len() >= MAX_BUFFERED_CANDIDATES {
            tracing::warn!(
                "Candidate buffer for {} full, dropping candidate of session {}",
                self.peer,
                message.session
            );
            return Ok(());
        }
        self.buffered_candidates
            .push((message.session, message.payload));
        Ok(())
    }

    /// Setzt die Remote Description und spielt gepufferte Candidates ab
    async fn apply_remote_description(
        &mut self,
        kind: SdpKind,
        sdp: String,
    ) -> Result<(), NegotiationError> {
        self.transport.set_remote_description(kind, sdp).await?;
        self.remote_applied = true;
        self.touch();

        let session = self.session;
        let buffered = std::mem::take(&mut self.buffered_candidates);
        let mut replayed = 0;
        for (candidate_session, candidate) in buffered {
            if Some(candidate_session) == session {
                self.apply_candidate(candidate).await;
                replayed += 1;
            }
        }
        if replayed > 0 {
            tracing::debug!("Replayed {} buffered candidate(s) from {}", replayed, self.peer);
        }
        Ok(())
    }

    async fn apply_candidate(&mut self, candidate: String) {
        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => self.touch(),
            // Einzelne unbrauchbare Candidates sind kein Grund abzubrechen
            Err(e) => tracing::warn!("Failed to add ICE candidate from {}: {}", self.peer, e),
        }
    }

    async fn on_local_candidate(&mut self, candidate: String) -> Result<(), NegotiationError> {
        if !self.local_published {
            self.queued_local.push(candidate);
            return Ok(());
        }
        self.send(SignalKind::IceCandidate, candidate).await
    }

    async fn flush_local_candidates(&mut self) {
        for candidate in std::mem::take(&mut self.queued_local) {
            if let Err(e) = self.send(SignalKind::IceCandidate, candidate).await {
                tracing::warn!("Failed to send ICE candidate to {}: {}", self.peer, e);
            }
        }
    }

    async fn on_connectivity(&mut self, connectivity: Connectivity) {
        tracing::debug!("Connectivity with {}: {:?}", self.peer, connectivity);

        match connectivity {
            c if c.is_converged() => {
                self.disconnected_since = None;
                if self.established {
                    return;
                }
                self.established = true;
                self.set_state(NegotiationState::Connected);
                tracing::info!("Connection to {} established", self.peer);
                self.emit(NegotiatorEventKind::Established);

                if self.renegotiate_when_connected {
                    self.renegotiate_when_connected = false;
                    let result = self.renegotiate().await;
                    self.absorb(&result).await;
                }
            }
            Connectivity::Disconnected => {
                if self.established && self.disconnected_since.is_none() {
                    tracing::warn!("Connection to {} disconnected", self.peer);
                    self.disconnected_since = Some(Instant::now());
                }
            }
            Connectivity::Failed => self.fail(FailureCause::TransportFailed).await,
            Connectivity::Closed => {
                self.fail(FailureCause::Transport("closed by transport".to_string()))
                    .await
            }
            _ => {}
        }
    }

    async fn swap_tracks(&mut self, media: Option<&LocalMediaHandle>) -> Result<(), NegotiationError> {
        self.transport.replace_tracks(media).await?;

        if self.role != Role::Initiator {
            return Ok(());
        }
        if self.state == NegotiationState::Connected {
            self.renegotiate().await
        } else {
            self.renegotiate_when_connected = self.state != NegotiationState::Idle;
            Ok(())
        }
    }

    /// Neues Offer über die bestehende Verbindung (gleiche Session)
    async fn renegotiate(&mut self) -> Result<(), NegotiationError> {
        let sdp = self.transport.create_offer().await?;
        self.renegotiating = true;
        self.touch();
        self.send(SignalKind::Offer, sdp).await?;
        tracing::info!("Sent renegotiation offer to {}", self.peer);
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn send(&self, kind: SignalKind, payload: String) -> Result<(), NegotiationError> {
        let session = self.session.ok_or(NegotiationError::Closed)?;
        let message = SignalMessage::new(
            kind,
            self.ctx.local.clone(),
            self.peer.clone(),
            session,
            payload,
        );
        self.ctx
            .bus
            .publish(&self.ctx.topic, message.encode()?)
            .await?;
        Ok(())
    }

    /// Fehler einer Operation in den Zustand übernehmen
    async fn absorb(&mut self, result: &Result<(), NegotiationError>) {
        match result {
            Ok(()) | Err(NegotiationError::Closed) => {}
            Err(NegotiationError::ProtocolViolation(reason)) => {
                self.report_violation(reason.clone()).await
            }
            Err(NegotiationError::Transport(e)) => {
                self.fail(FailureCause::Transport(e.to_string())).await
            }
            // at-most-once: verlorene Nachrichten fängt der Timeout ab
            Err(NegotiationError::Bus(e)) => {
                tracing::warn!("Failed to signal {}: {}", self.peer, e)
            }
        }
    }

    async fn fail(&mut self, cause: FailureCause) {
        if self.is_terminal() {
            return;
        }
        tracing::warn!(
            "Negotiation with {} failed (attempt {}): {}",
            self.peer,
            self.attempt,
            cause
        );
        self.set_state(NegotiationState::Failed);
        self.shutdown_transport().await;
        self.emit(NegotiatorEventKind::Failed {
            attempt: self.attempt,
            cause,
        });
    }

    async fn shutdown_transport(&self) {
        if let Err(e) = self.transport.close().await {
            tracing::error!("Failed to close transport to {}: {}", self.peer, e);
        }
    }

    fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    fn set_state(&mut self, state: NegotiationState) {
        if self.state == state {
            return;
        }
        tracing::debug!("Negotiator {}: {:?} -> {:?}", self.peer, self.state, state);
        self.state = state;
        self.touch();
        self.emit(NegotiatorEventKind::StateChanged(state));
    }

    fn emit(&self, kind: NegotiatorEventKind) {
        let _ = self.ctx.events.send(NegotiatorEvent {
            peer: self.peer.clone(),
            generation: self.generation,
            kind,
        });
    }
}

impl std::fmt::Debug for SessionNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionNegotiator")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("generation", &self.generation)
            .field("state", &self.state)
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiator::NegotiationTimings;
    use crate::signaling::{topics, MemoryBus, SignalBus, Subscription};
    use crate::transport::{LoopbackNetwork, LoopbackProbe, TransportEvents, TransportFactory};
    use futures::{FutureExt, StreamExt};
    use std::time::Duration;
    use tokio::sync::mpsc;

    const ROOM: &str = "test";

    struct Side {
        negotiator: SessionNegotiator,
        transport_events: TransportEvents,
        events: mpsc::UnboundedReceiver<NegotiatorEvent>,
        probe: LoopbackProbe,
    }

    impl Side {
        async fn pump_transport(&mut self) {
            while let Ok(event) = self.transport_events.try_recv() {
                let _ = self.negotiator.handle_transport_event(event).await;
            }
        }

        fn drain_events(&mut self) -> Vec<NegotiatorEventKind> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event.kind);
            }
            out
        }
    }

    async fn side(bus: &MemoryBus, network: &LoopbackNetwork, local: &str, peer: &str) -> Side {
        retried_side(bus, network, local, peer, 0).await
    }

    async fn retried_side(
        bus: &MemoryBus,
        network: &LoopbackNetwork,
        local: &str,
        peer: &str,
        attempt: u32,
    ) -> Side {
        let local = ParticipantId::from(local);
        let peer = ParticipantId::from(peer);
        let parts = network.create(&local, &peer, None).await.unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        let ctx = NegotiatorContext {
            local: local.clone(),
            bus: Arc::new(bus.clone()),
            topic: topics::signaling(ROOM),
            events: tx,
            timings: NegotiationTimings {
                negotiation_timeout: Duration::from_secs(2),
                disconnect_grace: Duration::from_secs(1),
            },
        };
        let role = Role::between(&local, &peer);
        let probe = network.latest(&local, &peer).unwrap();
        Side {
            negotiator: SessionNegotiator::new(ctx, peer, role, 1, attempt, parts.transport),
            transport_events: parts.events,
            events,
            probe,
        }
    }

    async fn tap(bus: &MemoryBus) -> Subscription {
        bus.subscribe(&topics::signaling(ROOM)).await.unwrap()
    }

    fn published(tap: &mut Subscription) -> Vec<SignalMessage> {
        let mut out = Vec::new();
        while let Some(Some(raw)) = tap.next().now_or_never() {
            out.push(SignalMessage::decode(&raw).unwrap());
        }
        out
    }

    /// Leitet Nachrichten zwischen beiden Seiten weiter, bis Ruhe herrscht
    async fn relay(tap: &mut Subscription, a: &mut Side, b: &mut Side) {
        for _ in 0..16 {
            a.pump_transport().await;
            b.pump_transport().await;
            let messages = published(tap);
            if messages.is_empty() {
                return;
            }
            for message in messages {
                let target = if &message.target == b.negotiator.peer() { &mut *a } else { &mut *b };
                let _ = target.negotiator.handle_signal(message).await;
            }
        }
    }

    fn candidate_message(from: &str, to: &str, session: Uuid, n: u32) -> SignalMessage {
        SignalMessage::new(
            SignalKind::IceCandidate,
            from.into(),
            to.into(),
            session,
            format!("candidate-{n}"),
        )
    }

    #[tokio::test]
    async fn test_offer_precedes_local_candidates() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        a.pump_transport().await;

        let messages = published(&mut tap);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].kind, SignalKind::Offer);
        assert_eq!(messages[0].target, ParticipantId::from("b"));
        assert!(messages[1..]
            .iter()
            .all(|m| m.kind == SignalKind::IceCandidate && m.session == messages[0].session));
        assert_eq!(a.negotiator.state(), NegotiationState::AwaitingAnswer);
    }

    #[tokio::test]
    async fn test_full_exchange_connects_both_sides() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;
        let mut b = side(&bus, &network, "b", "a").await;

        a.negotiator.create_offer().await.unwrap();
        relay(&mut tap, &mut a, &mut b).await;

        assert_eq!(a.negotiator.state(), NegotiationState::Connected);
        assert_eq!(b.negotiator.state(), NegotiationState::Connected);
        assert_eq!(a.probe.offers_created(), 1);
        assert_eq!(b.probe.answers_created(), 1);

        let established = |events: Vec<NegotiatorEventKind>| {
            events
                .into_iter()
                .filter(|e| *e == NegotiatorEventKind::Established)
                .count()
        };
        assert_eq!(established(a.drain_events()), 1);
        assert_eq!(established(b.drain_events()), 1);
    }

    #[tokio::test]
    async fn test_early_candidates_are_replayed_in_order() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut b = side(&bus, &network, "b", "a").await;
        let session = Uuid::new_v4();

        for n in 0..3 {
            b.negotiator
                .handle_signal(candidate_message("a", "b", session, n))
                .await
                .unwrap();
        }
        assert!(b.probe.applied_candidates().is_empty());

        b.negotiator
            .handle_signal(SignalMessage::new(
                SignalKind::Offer,
                "a".into(),
                "b".into(),
                session,
                "v=0".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(
            b.probe.applied_candidates(),
            vec!["candidate-0", "candidate-1", "candidate-2"]
        );
        assert_eq!(b.negotiator.state(), NegotiationState::AnsweringOffer);
    }

    #[tokio::test]
    async fn test_candidates_of_other_sessions_are_not_replayed() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut b = side(&bus, &network, "b", "a").await;
        let session = Uuid::new_v4();

        b.negotiator
            .handle_signal(candidate_message("a", "b", Uuid::new_v4(), 0))
            .await
            .unwrap();
        b.negotiator
            .handle_signal(candidate_message("a", "b", session, 1))
            .await
            .unwrap();
        b.negotiator
            .handle_signal(SignalMessage::new(
                SignalKind::Offer,
                "a".into(),
                "b".into(),
                session,
                "v=0".to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(b.probe.applied_candidates(), vec!["candidate-1"]);
    }

    #[tokio::test]
    async fn test_second_answer_is_protocol_violation() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        let session = published(&mut tap)[0].session;
        let answer = SignalMessage::new(SignalKind::Answer, "b".into(), "a".into(), session, "v=0".to_string());

        a.negotiator.handle_signal(answer.clone()).await.unwrap();
        assert_eq!(a.negotiator.state(), NegotiationState::AwaitingFirstCandidate);

        let result = a.negotiator.handle_signal(answer).await;
        assert!(matches!(result, Err(NegotiationError::ProtocolViolation(_))));
        assert_eq!(a.negotiator.state(), NegotiationState::Closed);
        assert!(a.probe.is_closed());
        assert!(a
            .drain_events()
            .iter()
            .any(|e| matches!(e, NegotiatorEventKind::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_answer_without_offer_is_protocol_violation() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut b = side(&bus, &network, "b", "a").await;

        let result = b.negotiator.create_answer().await;
        assert!(matches!(result, Err(NegotiationError::ProtocolViolation(_))));
        assert_eq!(b.negotiator.state(), NegotiationState::Closed);
        assert!(b.probe.is_closed());
    }

    #[tokio::test]
    async fn test_late_answer_after_close_is_ignored() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        let session = published(&mut tap)[0].session;
        a.negotiator.close().await;
        a.negotiator.close().await;

        let result = a
            .negotiator
            .handle_signal(SignalMessage::new(SignalKind::Answer, "b".into(), "a".into(), session, "v=0".to_string()))
            .await;
        assert_eq!(result, Err(NegotiationError::Closed));
        assert_eq!(a.negotiator.state(), NegotiationState::Closed);
        assert!(a.probe.remote_descriptions().is_empty());
    }

    #[tokio::test]
    async fn test_stale_answer_is_dropped() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        a.negotiator
            .handle_signal(SignalMessage::new(SignalKind::Answer, "b".into(), "a".into(), Uuid::new_v4(), "v=0".to_string()))
            .await
            .unwrap();

        assert_eq!(a.negotiator.state(), NegotiationState::AwaitingAnswer);
        assert!(a.probe.remote_descriptions().is_empty());
    }

    #[tokio::test]
    async fn test_connectivity_flaps_emit_established_once() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;
        let mut b = side(&bus, &network, "b", "a").await;

        a.negotiator.create_offer().await.unwrap();
        relay(&mut tap, &mut a, &mut b).await;
        a.drain_events();

        a.probe.inject(Connectivity::Disconnected);
        a.probe.inject(Connectivity::Connected);
        a.probe.inject(Connectivity::Completed);
        a.pump_transport().await;

        assert!(!a.drain_events().contains(&NegotiatorEventKind::Established));
        assert_eq!(a.negotiator.state(), NegotiationState::Connected);
        assert_eq!(a.negotiator.deadline(), None);
    }

    #[tokio::test]
    async fn test_sustained_disconnect_fails() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;
        let mut b = side(&bus, &network, "b", "a").await;

        a.negotiator.create_offer().await.unwrap();
        relay(&mut tap, &mut a, &mut b).await;
        a.drain_events();

        a.probe.inject(Connectivity::Disconnected);
        a.pump_transport().await;
        let deadline = a.negotiator.deadline().unwrap();

        a.negotiator.on_deadline(deadline).await;
        assert_eq!(a.negotiator.state(), NegotiationState::Failed);
        assert!(a.drain_events().contains(&NegotiatorEventKind::Failed {
            attempt: 0,
            cause: FailureCause::Disconnected,
        }));
        assert!(a.probe.is_closed());
    }

    #[tokio::test]
    async fn test_awaiting_answer_times_out() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        a.negotiator.on_deadline(Instant::now()).await;
        assert_eq!(a.negotiator.state(), NegotiationState::AwaitingAnswer);

        a.negotiator
            .on_deadline(Instant::now() + Duration::from_secs(3))
            .await;
        assert!(a.drain_events().contains(&NegotiatorEventKind::Failed {
            attempt: 0,
            cause: FailureCause::Timeout(NegotiationState::AwaitingAnswer),
        }));
    }

    #[tokio::test]
    async fn test_transport_failure_is_reported_not_retried() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        a.probe.inject(Connectivity::Failed);
        a.pump_transport().await;

        assert_eq!(a.negotiator.state(), NegotiationState::Failed);
        assert_eq!(a.probe.offers_created(), 1);
        // weitere Events ändern nichts mehr
        a.probe.inject(Connectivity::Connected);
        a.pump_transport().await;
        assert_eq!(a.negotiator.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn test_track_replacement_renegotiates_without_dropping() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;
        let mut b = side(&bus, &network, "b", "a").await;

        a.negotiator.create_offer().await.unwrap();
        relay(&mut tap, &mut a, &mut b).await;
        let session = a.negotiator.session();

        a.negotiator.replace_tracks(None).await.unwrap();
        b.negotiator.replace_tracks(None).await.unwrap();
        relay(&mut tap, &mut a, &mut b).await;

        assert_eq!(a.probe.offers_created(), 2);
        assert_eq!(b.probe.answers_created(), 2);
        assert_eq!(a.negotiator.session(), session);
        assert_eq!(a.negotiator.state(), NegotiationState::Connected);
        assert_eq!(b.negotiator.state(), NegotiationState::Connected);
        assert!(!a.probe.is_closed());
        assert_eq!(a.negotiator.deadline(), None);
    }

    #[tokio::test]
    async fn test_reoffer_before_responder_connects_is_answered() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;
        let mut b = side(&bus, &network, "b", "a").await;

        a.negotiator.create_offer().await.unwrap();
        a.pump_transport().await;
        let (offer, held): (Vec<_>, Vec<_>) = published(&mut tap)
            .into_iter()
            .partition(|m| m.kind == SignalKind::Offer);

        // Nur das Offer kommt an, die Candidates von a hängen noch
        b.negotiator.handle_signal(offer[0].clone()).await.unwrap();
        b.pump_transport().await;
        for message in published(&mut tap) {
            a.negotiator.handle_signal(message).await.unwrap();
        }
        a.pump_transport().await;
        assert_eq!(a.negotiator.state(), NegotiationState::Connected);
        assert_eq!(b.negotiator.state(), NegotiationState::AnsweringOffer);

        a.negotiator.replace_tracks(None).await.unwrap();
        a.pump_transport().await;
        let renegotiation = published(&mut tap);
        assert!(renegotiation.iter().any(|m| m.kind == SignalKind::Offer));

        for message in held.into_iter().chain(renegotiation) {
            b.negotiator.handle_signal(message).await.unwrap();
        }
        assert_eq!(b.probe.answers_created(), 2);
        assert!(!b.probe.is_closed());
        assert!(!b
            .drain_events()
            .iter()
            .any(|e| matches!(e, NegotiatorEventKind::ProtocolViolation(_))));

        relay(&mut tap, &mut a, &mut b).await;
        assert_eq!(a.negotiator.state(), NegotiationState::Connected);
        assert_eq!(b.negotiator.state(), NegotiationState::Connected);
        assert_eq!(a.negotiator.deadline(), None);
    }

    #[tokio::test]
    async fn test_missing_first_candidate_times_out() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut tap = tap(&bus).await;
        let mut a = side(&bus, &network, "a", "b").await;

        a.negotiator.create_offer().await.unwrap();
        let session = published(&mut tap)[0].session;
        a.negotiator
            .handle_signal(SignalMessage::new(SignalKind::Answer, "b".into(), "a".into(), session, "v=0".to_string()))
            .await
            .unwrap();
        assert_eq!(a.negotiator.state(), NegotiationState::AwaitingFirstCandidate);
        assert!(a.negotiator.deadline().is_some());

        a.negotiator
            .on_deadline(Instant::now() + Duration::from_secs(3))
            .await;
        assert_eq!(a.negotiator.state(), NegotiationState::Failed);
        assert!(a.drain_events().contains(&NegotiatorEventKind::Failed {
            attempt: 0,
            cause: FailureCause::Timeout(NegotiationState::AwaitingFirstCandidate),
        }));
        assert!(a.probe.is_closed());
    }

    #[tokio::test]
    async fn test_first_responder_waits_for_offer_without_deadline() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let b = side(&bus, &network, "b", "a").await;

        assert_eq!(b.negotiator.state(), NegotiationState::Idle);
        assert_eq!(b.negotiator.deadline(), None);
    }

    #[tokio::test]
    async fn test_retried_responder_times_out_without_offer() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut b = retried_side(&bus, &network, "b", "a", 1).await;

        assert!(b.negotiator.deadline().is_some());
        b.negotiator.on_deadline(Instant::now()).await;
        assert_eq!(b.negotiator.state(), NegotiationState::Idle);

        b.negotiator
            .on_deadline(Instant::now() + Duration::from_secs(3))
            .await;
        assert_eq!(b.negotiator.state(), NegotiationState::Failed);
        assert!(b.drain_events().contains(&NegotiatorEventKind::Failed {
            attempt: 1,
            cause: FailureCause::Timeout(NegotiationState::Idle),
        }));
        assert!(b.probe.is_closed());
    }

    #[tokio::test]
    async fn test_full_candidate_buffer_prefers_newest_session() {
        let bus = MemoryBus::new();
        let network = LoopbackNetwork::new();
        let mut b = side(&bus, &network, "b", "a").await;
        let stale = Uuid::new_v4();
        let session = Uuid::new_v4();

        for n in 0..MAX_BUFFERED_CANDIDATES as u32 {
            b.negotiator
                .handle_signal(candidate_message("a", "b", stale, n))
                .await
                .unwrap();
        }
        b.negotiator
            .handle_signal(candidate_message("a", "b", session, 100))
            .await
            .unwrap();
        b.negotiator
            .handle_signal(SignalMessage::new(SignalKind::Offer, "a".into(), "b".into(), session, "v=0".to_string()))
            .await
            .unwrap();

        assert_eq!(b.probe.applied_candidates(), vec!["candidate-100"]);
    }
}
