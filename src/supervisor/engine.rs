//! ConnectionSupervisor
//!
//! Besitzt alle PeerSessions eines Raums. Presence-Änderungen, eingehende
//! Signaling-Nachrichten, Negotiator-Events, Retry-Timer und Gerätewechsel
//! laufen durch eine einzige Schleife; nur sie verändert die Tabelle.

use super::status::{
    derive_status, EventLog, PeerSessionInfo, SessionLogEvent, StatusSnapshot,
};
use super::{PairingPolicy, RetryPolicy, SupervisorError};
use crate::media::{LocalMediaHandle, MediaAvailability};
use crate::negotiator::{
    FailureCause, NegotiationState, NegotiationTimings, NegotiatorContext, NegotiatorEvent,
    NegotiatorEventKind, NegotiatorHandle, Role, SessionNegotiator,
};
use crate::presence::PresenceEvent;
use crate::signaling::{ParticipantId, SignalBus, SignalKind, SignalMessage, Subscription};
use crate::transport::TransportFactory;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

/// Gepufferte Nachrichten pro unbekanntem Peer
const MAX_STRAYS_PER_PEER: usize = 32;

/// Unbekannte Peers, für die gepuffert wird
const MAX_STRAY_PEERS: usize = 64;

// ============================================================================
// SETTINGS
// ============================================================================

/// Alles, was ein Supervisor für einen Raum braucht
pub struct SupervisorSettings {
    pub local: ParticipantId,
    pub bus: Arc<dyn SignalBus>,
    /// Signaling-Topic des Raums
    pub topic: String,
    pub transports: Arc<dyn TransportFactory>,
    pub pairing: PairingPolicy,
    pub retry: RetryPolicy,
    pub timings: NegotiationTimings,
    pub status: Arc<watch::Sender<StatusSnapshot>>,
    pub log: Arc<Mutex<EventLog>>,
}

/// Eingänge der Supervisor-Schleife
pub struct SupervisorInputs {
    pub presence: BoxStream<'static, PresenceEvent>,
    pub signals: Subscription,
    pub media: watch::Receiver<Option<LocalMediaHandle>>,
}

enum SupervisorCommand {
    RetryDue { peer: ParticipantId, generation: u64 },
    Inspect(oneshot::Sender<Vec<PeerSessionInfo>>),
    Shutdown(oneshot::Sender<()>),
}

// ============================================================================
// PEER SESSION
// ============================================================================

struct PeerSession {
    role: Role,
    state: NegotiationState,
    retry_count: u32,
    last_error: Option<String>,
    generation: u64,
    /// Session-ID des aktuellen Offers (nur Responder)
    session_id: Option<Uuid>,
    negotiator: Option<NegotiatorHandle>,
    retry_timer: Option<JoinHandle<()>>,
}

impl PeerSession {
    fn info(&self, peer: &ParticipantId) -> PeerSessionInfo {
        PeerSessionInfo {
            peer: peer.clone(),
            role: self.role,
            state: self.state,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            generation: self.generation,
            session_id: self.session_id,
        }
    }
}

// ============================================================================
// SUPERVISOR
// ============================================================================

pub struct ConnectionSupervisor {
    settings: SupervisorSettings,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    negotiator_events: mpsc::UnboundedSender<NegotiatorEvent>,

    presence: BTreeSet<ParticipantId>,
    sessions: BTreeMap<ParticipantId, PeerSession>,
    /// Peers, mit denen die Verhandlung endgültig gescheitert ist
    failed: BTreeSet<ParticipantId>,
    strays: HashMap<ParticipantId, VecDeque<SignalMessage>>,
    media: Option<LocalMediaHandle>,
    next_generation: u64,
}

impl ConnectionSupervisor {
    /// Startet die Supervisor-Schleife
    pub fn spawn(settings: SupervisorSettings, inputs: SupervisorInputs) -> SupervisorHandle {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (negotiator_events, negotiator_rx) = mpsc::unbounded_channel();

        let supervisor = ConnectionSupervisor {
            settings,
            commands: commands.clone(),
            negotiator_events,
            presence: BTreeSet::new(),
            sessions: BTreeMap::new(),
            failed: BTreeSet::new(),
            strays: HashMap::new(),
            media: None,
            next_generation: 1,
        };

        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let task = tokio::spawn(supervisor.run(inputs, command_rx, negotiator_rx, token));

        SupervisorHandle {
            commands,
            task: Some(task),
            _guard: guard,
        }
    }

    async fn run(
        mut self,
        inputs: SupervisorInputs,
        mut command_rx: mpsc::UnboundedReceiver<SupervisorCommand>,
        mut negotiator_rx: mpsc::UnboundedReceiver<NegotiatorEvent>,
        cancel: CancellationToken,
    ) {
        let SupervisorInputs {
            mut presence,
            mut signals,
            mut media,
        } = inputs;
        let mut presence_open = true;
        let mut signals_open = true;
        let mut media_open = true;

        self.media = media.borrow_and_update().clone();
        tracing::info!("Supervisor for {} started", self.settings.local);
        self.publish_status();

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = command_rx.recv() => match command {
                    SupervisorCommand::Shutdown(ack) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    SupervisorCommand::Inspect(reply) => {
                        let _ = reply.send(self.peer_sessions());
                    }
                    SupervisorCommand::RetryDue { peer, generation } => {
                        self.on_retry_due(peer, generation).await;
                    }
                },
                Some(event) = negotiator_rx.recv() => self.on_negotiator_event(event).await,
                event = presence.next(), if presence_open => match event {
                    Some(event) => self.on_presence(event).await,
                    None => {
                        tracing::warn!("Presence stream ended");
                        presence_open = false;
                    }
                },
                raw = signals.next(), if signals_open => match raw {
                    Some(raw) => self.on_raw_signal(&raw).await,
                    None => {
                        tracing::error!("Signaling subscription ended");
                        signals_open = false;
                    }
                },
                changed = media.changed(), if media_open => match changed {
                    Ok(()) => {
                        let handle = media.borrow_and_update().clone();
                        self.on_media_changed(handle);
                    }
                    Err(_) => media_open = false,
                },
            }
            self.publish_status();
        }

        self.shutdown().await;
    }

    // ========================================================================
    // PRESENCE & PAIRING
    // ========================================================================

    async fn on_presence(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Joined(peer) => {
                if peer != self.settings.local && self.presence.insert(peer.clone()) {
                    self.record(Some(peer), SessionLogEvent::PeerJoined);
                }
            }
            PresenceEvent::Left(peer) => {
                if self.presence.remove(&peer) {
                    self.record(Some(peer.clone()), SessionLogEvent::PeerLeft);
                }
                self.forget(&peer);
            }
            PresenceEvent::Synced(members) => {
                let gone: Vec<ParticipantId> =
                    self.presence.difference(&members).cloned().collect();
                for peer in &gone {
                    self.forget(peer);
                }
                self.presence = members;
            }
        }
        self.reconcile().await;
    }

    /// Vergisst gescheiterte und gepufferte Zustände eines gegangenen Peers
    fn forget(&mut self, peer: &ParticipantId) {
        self.failed.remove(peer);
        self.strays.remove(peer);
    }

    /// Gleicht die Sessions mit der Pairing-Policy ab
    async fn reconcile(&mut self) {
        let targets = self.settings.pairing.targets(
            &self.settings.local,
            &self.presence,
            &self.failed,
        );

        let obsolete: Vec<ParticipantId> = self
            .sessions
            .keys()
            .filter(|peer| !targets.contains(*peer))
            .cloned()
            .collect();
        for peer in obsolete {
            tracing::info!("Peer {} no longer paired, tearing down", peer);
            self.teardown(&peer).await;
        }

        for peer in targets {
            if !self.sessions.contains_key(&peer) {
                self.create_session(peer, 0, None).await;
            }
        }
    }

    // ========================================================================
    // SESSION LIFECYCLE
    // ========================================================================

    /// Erstellt (oder ersetzt) die Session für `peer`
    async fn create_session(
        &mut self,
        peer: ParticipantId,
        retry_count: u32,
        last_error: Option<String>,
    ) {
        let generation = self.next_generation;
        self.next_generation += 1;
        let role = Role::between(&self.settings.local, &peer);

        let mut session = PeerSession {
            role,
            state: NegotiationState::Idle,
            retry_count,
            last_error,
            generation,
            session_id: None,
            negotiator: None,
            retry_timer: None,
        };

        let parts = match self
            .settings
            .transports
            .create(&self.settings.local, &peer, self.media.as_ref())
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!("Could not create transport for {}: {}", peer, e);
                session.state = NegotiationState::Failed;
                self.sessions.insert(peer.clone(), session);
                self.on_failure(&peer, FailureCause::Transport(e.to_string()))
                    .await;
                return;
            }
        };

        let ctx = NegotiatorContext {
            local: self.settings.local.clone(),
            bus: Arc::clone(&self.settings.bus),
            topic: self.settings.topic.clone(),
            events: self.negotiator_events.clone(),
            timings: self.settings.timings,
        };
        let negotiator = SessionNegotiator::new(
            ctx,
            peer.clone(),
            role,
            generation,
            retry_count,
            parts.transport,
        );
        let handle = NegotiatorHandle::spawn(negotiator, parts.events);

        if role == Role::Initiator {
            handle.start();
        }

        // Vorab eingetroffene Nachrichten nachreichen
        if let Some(strays) = self.strays.remove(&peer) {
            let strays = relevant_strays(strays);
            if let Some(offer) = strays.iter().find(|m| m.kind == SignalKind::Offer) {
                session.session_id = Some(offer.session);
            }
            tracing::debug!("Replaying {} early message(s) from {}", strays.len(), peer);
            for message in strays {
                handle.signal(message);
            }
        }

        session.negotiator = Some(handle);
        tracing::info!(
            "Session with {} created as {:?} (attempt {})",
            peer,
            role,
            retry_count
        );
        self.record(
            Some(peer.clone()),
            SessionLogEvent::SessionCreated {
                role,
                attempt: retry_count,
            },
        );

        // Ersetzte Sessions sind an dieser Stelle bereits geschlossen
        self.sessions.insert(peer, session);
    }

    /// Schließt die Session und entfernt sie danach aus der Tabelle
    async fn teardown(&mut self, peer: &ParticipantId) {
        if let Some(session) = self.sessions.get_mut(peer) {
            close_session(session).await;
        }
        if self.sessions.remove(peer).is_some() {
            self.record(Some(peer.clone()), SessionLogEvent::SessionClosed);
        }
        self.strays.remove(peer);
    }

    async fn shutdown(&mut self) {
        let peers: Vec<ParticipantId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.teardown(&peer).await;
        }
        self.presence.clear();
        self.failed.clear();
        self.strays.clear();
        self.media = None;
        tracing::info!("Supervisor for {} stopped", self.settings.local);
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    async fn on_raw_signal(&mut self, raw: &str) {
        let message = match SignalMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring malformed signaling message: {}", e);
                return;
            }
        };

        if message.target != self.settings.local || message.from == self.settings.local {
            return;
        }

        tracing::debug!("Received {:?} from {}", message.kind, message.from);
        self.route_signal(message).await;
    }

    async fn route_signal(&mut self, message: SignalMessage) {
        let peer = message.from.clone();

        if self.failed.contains(&peer) {
            tracing::debug!("Ignoring {:?} from failed peer {}", message.kind, peer);
            return;
        }

        let Some(session) = self.sessions.get_mut(&peer) else {
            self.buffer_stray(message);
            return;
        };

        if message.kind == SignalKind::Offer && session.role == Role::Initiator {
            tracing::warn!("Ignoring offer from {}: we are the initiator", peer);
            return;
        }

        let restarted = message.kind == SignalKind::Offer
            && session
                .session_id
                .map(|current| current != message.session)
                .unwrap_or(false);

        match session.negotiator.as_ref() {
            // Retry steht noch aus: ein neues Offer wartet nicht auf unseren Timer
            None if message.kind == SignalKind::Offer => {
                tracing::info!("New offer from {} while waiting to retry", peer);
                self.restart_with(peer, message).await;
            }
            None => self.buffer_stray(message),
            Some(_) if restarted => {
                tracing::info!("Initiator {} restarted negotiation", peer);
                self.restart_with(peer, message).await;
            }
            Some(handle) => {
                if message.kind == SignalKind::Offer && session.session_id.is_none() {
                    session.session_id = Some(message.session);
                }
                handle.signal(message);
            }
        }
    }

    /// Ersetzt den Responder durch einen neuen, der mit `offer` beginnt
    async fn restart_with(&mut self, peer: ParticipantId, offer: SignalMessage) {
        let (retry_count, last_error) = match self.sessions.get_mut(&peer) {
            Some(session) => {
                close_session(session).await;
                (session.retry_count, session.last_error.clone())
            }
            None => (0, None),
        };
        self.strays.entry(peer.clone()).or_default().push_back(offer);
        self.create_session(peer, retry_count, last_error).await;
    }

    fn buffer_stray(&mut self, message: SignalMessage) {
        if !self.strays.contains_key(&message.from) && self.strays.len() >= MAX_STRAY_PEERS {
            tracing::debug!("Stray buffer full, dropping message from {}", message.from);
            return;
        }
        let queue = self.strays.entry(message.from.clone()).or_default();
        if queue.len() >= MAX_STRAYS_PER_PEER {
            // Ohne Offer sind die Candidates wertlos, also den ältesten Candidate opfern
            let oldest = queue
                .iter()
                .position(|m| m.kind != SignalKind::Offer)
                .unwrap_or(0);
            if let Some(dropped) = queue.remove(oldest) {
                tracing::debug!(
                    "Stray queue of {} full, dropping {:?}",
                    dropped.from,
                    dropped.kind
                );
            }
        }
        queue.push_back(message);
    }

    // ========================================================================
    // NEGOTIATOR EVENTS & RETRY
    // ========================================================================

    async fn on_negotiator_event(&mut self, event: NegotiatorEvent) {
        let Some(session) = self.sessions.get_mut(&event.peer) else {
            return;
        };
        if session.generation != event.generation {
            tracing::debug!("Dropping event of replaced negotiator for {}", event.peer);
            return;
        }

        match event.kind {
            NegotiatorEventKind::StateChanged(state) => session.state = state,
            NegotiatorEventKind::Established => {
                session.state = NegotiationState::Connected;
                session.retry_count = 0;
                session.last_error = None;
                self.record(Some(event.peer), SessionLogEvent::Established);
            }
            NegotiatorEventKind::Failed { attempt, cause } => {
                session.last_error = Some(cause.to_string());
                self.record(
                    Some(event.peer.clone()),
                    SessionLogEvent::NegotiationFailed {
                        attempt,
                        cause: cause.to_string(),
                    },
                );
                self.on_failure(&event.peer, cause).await;
            }
            NegotiatorEventKind::ProtocolViolation(reason) => {
                tracing::warn!("Giving up on {} after protocol violation", event.peer);
                self.record(
                    Some(event.peer.clone()),
                    SessionLogEvent::ProtocolViolation { reason },
                );
                self.teardown(&event.peer).await;
                self.failed.insert(event.peer);
            }
        }
    }

    /// Entscheidet über Retry oder endgültiges Scheitern
    async fn on_failure(&mut self, peer: &ParticipantId, cause: FailureCause) {
        let retry = self.settings.retry;
        let Some(session) = self.sessions.get_mut(peer) else {
            return;
        };

        if let Some(handle) = session.negotiator.take() {
            handle.close().await;
        }
        session.state = NegotiationState::Failed;

        if !retry.should_retry(session.retry_count) {
            let attempts = session.retry_count;
            tracing::warn!(
                "Negotiation with {} failed permanently after {} retries: {}",
                peer,
                attempts,
                cause
            );
            self.teardown(peer).await;
            self.failed.insert(peer.clone());
            self.record(
                Some(peer.clone()),
                SessionLogEvent::HardFailure {
                    attempts,
                    cause: cause.to_string(),
                },
            );
            return;
        }

        session.retry_count += 1;
        let attempt = session.retry_count;
        let delay = retry.delay(attempt);
        let generation = session.generation;
        let commands = self.commands.clone();
        let due_peer = peer.clone();

        session.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(SupervisorCommand::RetryDue {
                peer: due_peer,
                generation,
            });
        }));

        tracing::info!(
            "Retrying {} in {:?} (attempt {}/{})",
            peer,
            delay,
            attempt,
            retry.max_retries
        );
        self.record(
            Some(peer.clone()),
            SessionLogEvent::RetryScheduled {
                attempt,
                delay_ms: delay.as_millis() as u64,
            },
        );
    }

    async fn on_retry_due(&mut self, peer: ParticipantId, generation: u64) {
        let Some(session) = self.sessions.get(&peer) else {
            return;
        };
        if session.generation != generation || session.negotiator.is_some() {
            return;
        }
        let retry_count = session.retry_count;
        let last_error = session.last_error.clone();
        self.create_session(peer, retry_count, last_error).await;
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    fn on_media_changed(&mut self, media: Option<LocalMediaHandle>) {
        let unchanged = match (&self.media, &media) {
            (Some(current), Some(new)) => current.same_stream(new),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }

        tracing::info!(
            "Local media changed, updating {} session(s)",
            self.sessions.len()
        );
        self.media = media;

        let mut replaced = Vec::new();
        for (peer, session) in &self.sessions {
            if let Some(handle) = &session.negotiator {
                handle.replace_tracks(self.media.clone());
                if session.state == NegotiationState::Connected {
                    replaced.push(peer.clone());
                }
            }
        }
        for peer in replaced {
            self.record(Some(peer), SessionLogEvent::TracksReplaced);
        }
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    fn peer_sessions(&self) -> Vec<PeerSessionInfo> {
        self.sessions
            .iter()
            .map(|(peer, session)| session.info(peer))
            .collect()
    }

    fn publish_status(&self) {
        let mut connected = Vec::new();
        let mut retrying = BTreeMap::new();
        let mut negotiating = 0;

        for (peer, session) in &self.sessions {
            if session.state == NegotiationState::Connected {
                connected.push(peer.clone());
            } else if session.retry_count > 0 {
                retrying.insert(peer.clone(), session.retry_count);
            } else {
                negotiating += 1;
            }
        }

        let snapshot = StatusSnapshot {
            status: derive_status(connected.len(), retrying.len(), negotiating, self.failed.len()),
            connected_peer_ids: connected,
            retrying,
            failed_peer_ids: self.failed.iter().cloned().collect(),
            media: self
                .media
                .as_ref()
                .map(|m| m.availability())
                .unwrap_or(MediaAvailability::Unavailable),
        };

        self.settings.status.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            if current.status != snapshot.status {
                tracing::info!("Connection status: {:?} -> {:?}", current.status, snapshot.status);
            }
            *current = snapshot;
            true
        });
    }

    fn record(&self, peer: Option<ParticipantId>, event: SessionLogEvent) {
        self.settings.log.lock().record(peer, event);
    }
}

/// Schließt Negotiator samt Transport und stoppt einen ausstehenden Retry
async fn close_session(session: &mut PeerSession) {
    if let Some(timer) = session.retry_timer.take() {
        timer.abort();
    }
    if let Some(handle) = session.negotiator.take() {
        handle.close().await;
    }
}

/// Behält nur Nachrichten des neuesten Offers (falls eines dabei ist)
fn relevant_strays(strays: VecDeque<SignalMessage>) -> Vec<SignalMessage> {
    let latest_offer = strays
        .iter()
        .rev()
        .find(|m| m.kind == SignalKind::Offer)
        .map(|m| m.session);

    match latest_offer {
        Some(session) => strays.into_iter().filter(|m| m.session == session).collect(),
        None => strays.into_iter().collect(),
    }
}

// ============================================================================
// HANDLE
// ============================================================================

/// Steuerung eines laufenden Supervisors
///
/// Drop bricht die Schleife ab; alle Sessions werden dabei geschlossen.
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    task: Option<JoinHandle<()>>,
    _guard: DropGuard,
}

impl SupervisorHandle {
    /// Momentaufnahme aller PeerSessions
    pub async fn peer_sessions(&self) -> Result<Vec<PeerSessionInfo>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SupervisorCommand::Inspect(tx))
            .map_err(|_| SupervisorError::NotRunning)?;
        rx.await.map_err(|_| SupervisorError::NotRunning)
    }

    /// Schließt alle Sessions und beendet die Schleife
    pub async fn shutdown(mut self) -> Result<(), SupervisorError> {
        let (tx, rx) = oneshot::channel();
        let acknowledged = self.commands.send(SupervisorCommand::Shutdown(tx)).is_ok()
            && rx.await.is_ok();

        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| SupervisorError::Task(e.to_string()))?;
        }

        if acknowledged {
            Ok(())
        } else {
            Err(SupervisorError::NotRunning)
        }
    }
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("running", &self.task.as_ref().map(|t| !t.is_finished()))
            .finish()
    }
}
