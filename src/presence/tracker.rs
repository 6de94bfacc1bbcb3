//! PresenceTracker
//!
//! Hält die PresenceSet eines Raums aktuell und verteilt Änderungen als
//! Stream. Ein Hintergrund-Task verarbeitet das Presence-Topic; er meldet
//! den eigenen Teilnehmer auf jedem Exit-Pfad wieder ab.

use super::{PresenceError, PresenceEvent};
use crate::signaling::{
    topics, ParticipantId, PresenceKind, PresenceMessage, SignalBus, Subscription,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

const EVENT_CAPACITY: usize = 256;

/// Teilnehmer → zuletzt gesehen
type Members = Arc<Mutex<HashMap<ParticipantId, Instant>>>;

struct Running {
    room: String,
    local: ParticipantId,
    _guard: DropGuard,
    task: JoinHandle<()>,
}

pub struct PresenceTracker {
    bus: Arc<dyn SignalBus>,
    heartbeat: Duration,
    ttl: Duration,
    members: Members,
    event_tx: broadcast::Sender<PresenceEvent>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl PresenceTracker {
    pub fn new(bus: Arc<dyn SignalBus>, heartbeat: Duration, ttl: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            bus,
            heartbeat,
            ttl,
            members: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Tritt dem Raum bei und kündigt `local` an
    ///
    /// Ein zweiter Aufruf mit demselben Raum und derselben ID ist ein No-op.
    pub async fn start(&self, room: &str, local: &ParticipantId) -> Result<(), PresenceError> {
        let mut running = self.running.lock().await;

        if let Some(current) = running.as_ref() {
            if current.room == room && &current.local == local {
                return Ok(());
            }
            return Err(PresenceError::AlreadyRunning(current.room.clone()));
        }

        let topic = topics::presence(room);
        let subscription = self
            .bus
            .subscribe(&topic)
            .await
            .map_err(|e| PresenceError::TransportUnavailable(e.to_string()))?;

        let join = PresenceMessage::join(local.clone())
            .encode()
            .map_err(|e| PresenceError::TransportUnavailable(e.to_string()))?;
        self.bus
            .publish(&topic, join)
            .await
            .map_err(|e| PresenceError::TransportUnavailable(e.to_string()))?;

        {
            let mut members = self.members.lock();
            members.clear();
            members.insert(local.clone(), Instant::now());
        }

        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let worker = PresenceWorker {
            bus: Arc::clone(&self.bus),
            topic,
            local: local.clone(),
            members: Arc::clone(&self.members),
            event_tx: self.event_tx.clone(),
            heartbeat: self.heartbeat,
            ttl: self.ttl,
        };
        let task = tokio::spawn(worker.run(subscription, token));

        let _ = self
            .event_tx
            .send(PresenceEvent::Synced(snapshot(&self.members)));

        tracing::info!("Joined presence of room {} as {}", room, local);

        *running = Some(Running {
            room: room.to_string(),
            local: local.clone(),
            _guard: guard,
            task,
        });
        Ok(())
    }

    /// Stream der Änderungen; beginnt immer mit einem `Synced`
    ///
    /// Läuft über `stop()`/`start()` hinweg weiter. Wer zu langsam liest,
    /// bekommt statt der verpassten Events einen neuen `Synced`.
    pub fn events(&self) -> BoxStream<'static, PresenceEvent> {
        let mut rx = self.event_tx.subscribe();
        let members = Arc::clone(&self.members);

        let stream = async_stream::stream! {
            yield PresenceEvent::Synced(snapshot(&members));
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Presence consumer lagged by {} event(s), resyncing", skipped);
                        yield PresenceEvent::Synced(snapshot(&members));
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        stream.boxed()
    }

    /// Aktuelle PresenceSet (inklusive des eigenen Teilnehmers)
    pub fn presence_set(&self) -> BTreeSet<ParticipantId> {
        snapshot(&self.members)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Meldet den Teilnehmer ab und beendet das Abonnement
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        let Running {
            room, _guard, task, ..
        } = running;
        drop(_guard);

        if let Err(e) = task.await {
            tracing::error!("Presence task for room {} ended abnormally: {}", room, e);
        }
        self.members.lock().clear();
        tracing::info!("Left presence of room {}", room);
    }
}

impl std::fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("members", &self.presence_set())
            .field("heartbeat", &self.heartbeat)
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn snapshot(members: &Members) -> BTreeSet<ParticipantId> {
    members.lock().keys().cloned().collect()
}

// ============================================================================
// WORKER
// ============================================================================

struct PresenceWorker {
    bus: Arc<dyn SignalBus>,
    topic: String,
    local: ParticipantId,
    members: Members,
    event_tx: broadcast::Sender<PresenceEvent>,
    heartbeat: Duration,
    ttl: Duration,
}

impl PresenceWorker {
    async fn run(self, mut subscription: Subscription, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = subscription.next() => match message {
                    Some(raw) => self.on_message(&raw).await,
                    None => {
                        tracing::error!("Presence subscription on {} ended", self.topic);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.announce(PresenceMessage::sync(self.local.clone())).await;
                    self.sweep();
                }
            }
        }

        // Abmelden auf jedem Exit-Pfad
        drop(subscription);
        self.announce(PresenceMessage::leave(self.local.clone())).await;
        tracing::debug!("Presence worker for {} stopped", self.local);
    }

    async fn on_message(&self, raw: &str) {
        let message = match PresenceMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring malformed presence message: {}", e);
                return;
            }
        };

        if message.participant_id == self.local {
            return;
        }

        match message.kind {
            PresenceKind::Join => {
                self.seen(message.participant_id);
                // Dem Neuen zeigen, dass wir da sind
                self.announce(PresenceMessage::sync(self.local.clone())).await;
            }
            PresenceKind::Sync => self.seen(message.participant_id),
            PresenceKind::Leave => {
                if self.members.lock().remove(&message.participant_id).is_some() {
                    tracing::info!("{} left", message.participant_id);
                    self.emit(PresenceEvent::Left(message.participant_id));
                }
            }
        }
    }

    fn seen(&self, id: ParticipantId) {
        let is_new = self
            .members
            .lock()
            .insert(id.clone(), Instant::now())
            .is_none();
        if is_new {
            tracing::info!("{} joined", id);
            self.emit(PresenceEvent::Joined(id));
        }
    }

    /// Entfernt Teilnehmer, deren letztes Lebenszeichen älter als die TTL ist
    fn sweep(&self) {
        let now = Instant::now();
        let expired: Vec<ParticipantId> = {
            let mut members = self.members.lock();
            let expired: Vec<ParticipantId> = members
                .iter()
                .filter(|(id, seen)| **id != self.local && now.duration_since(**seen) > self.ttl)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                members.remove(id);
            }
            expired
        };

        for id in expired {
            tracing::info!("{} timed out", id);
            self.emit(PresenceEvent::Left(id));
        }
        self.emit(PresenceEvent::Synced(snapshot(&self.members)));
    }

    async fn announce(&self, message: PresenceMessage) {
        let result = match message.encode() {
            Ok(raw) => self.bus.publish(&self.topic, raw).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            tracing::warn!("Failed to publish presence {:?}: {}", message.kind, e);
        }
    }

    fn emit(&self, event: PresenceEvent) {
        let _ = self.event_tx.send(event);
    }
}
