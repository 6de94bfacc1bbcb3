//! RoomSession - Einstiegspunkt für einen Raum
//!
//! Verbindet SignalBus, PresenceTracker, MediaDeviceManager und
//! ConnectionSupervisor. Es gibt keinen globalen Zustand: jede Session wird
//! explizit mit ihren Abhängigkeiten gebaut und mit `start()`/`stop()`
//! gesteuert.

use crate::config::{ConfigError, SessionConfig};
use crate::media::{
    CpalBackend, DeviceBackend, DeviceDescriptor, DeviceError, MediaConstraints,
    MediaDeviceManager,
};
use crate::presence::{PresenceError, PresenceTracker};
use crate::signaling::{topics, ParticipantId, SignalBus, WebSocketBus};
use crate::supervisor::{
    ConnectionSupervisor, EventLog, PeerSessionInfo, SessionLogEntry, SessionLogEvent,
    StatusSnapshot, SupervisorHandle, SupervisorInputs, SupervisorSettings,
};
use crate::transport::{TransportFactory, WebRtcTransportFactory};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Bus nicht erreichbar; beendet die Raum-Session
    #[error("Signaling transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Protocol violation by {peer}: {reason}")]
    ProtocolViolation { peer: ParticipantId, reason: String },

    #[error("Negotiation with {peer} failed after {attempts} retries: {cause}")]
    NegotiationFailed {
        peer: ParticipantId,
        attempts: u32,
        cause: String,
    },

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session is not running")]
    NotRunning,

    #[error("Session already running in room {0}")]
    AlreadyRunning(String),

    #[error("Teardown incomplete: {0}")]
    Teardown(String),
}

impl From<PresenceError> for SessionError {
    fn from(e: PresenceError) -> Self {
        match e {
            PresenceError::TransportUnavailable(msg) => SessionError::TransportUnavailable(msg),
            PresenceError::AlreadyRunning(room) => SessionError::AlreadyRunning(room),
        }
    }
}

// ============================================================================
// SERVICES
// ============================================================================

/// Austauschbare Abhängigkeiten einer RoomSession
#[derive(Clone)]
pub struct RoomServices {
    pub bus: Arc<dyn SignalBus>,
    pub devices: Arc<dyn DeviceBackend>,
    pub transports: Arc<dyn TransportFactory>,
}

impl RoomServices {
    /// Produktiv-Setup: WebSocket Relay, cpal und webrtc
    pub async fn connect(config: &SessionConfig) -> Result<Self, SessionError> {
        let bus = WebSocketBus::connect(&config.signaling_url)
            .await
            .map_err(|e| SessionError::TransportUnavailable(e.to_string()))?;

        Ok(Self {
            bus: Arc::new(bus),
            devices: Arc::new(CpalBackend::new()),
            transports: Arc::new(WebRtcTransportFactory::from_config(config)),
        })
    }
}

impl std::fmt::Debug for RoomServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomServices").finish_non_exhaustive()
    }
}

// ============================================================================
// ROOM SESSION
// ============================================================================

struct Running {
    room: String,
    supervisor: SupervisorHandle,
}

pub struct RoomSession {
    local: ParticipantId,
    config: SessionConfig,
    bus: Arc<dyn SignalBus>,
    transports: Arc<dyn TransportFactory>,
    media: MediaDeviceManager,
    presence: PresenceTracker,
    status: Arc<watch::Sender<StatusSnapshot>>,
    log: Arc<Mutex<EventLog>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl RoomSession {
    pub fn new(
        local: ParticipantId,
        config: SessionConfig,
        services: RoomServices,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let presence = PresenceTracker::new(
            Arc::clone(&services.bus),
            config.heartbeat(),
            config.presence_ttl(),
        );
        let (status, _) = watch::channel(StatusSnapshot::default());
        let log = EventLog::new(config.event_log_capacity);

        Ok(Self {
            local,
            bus: services.bus,
            transports: services.transports,
            media: MediaDeviceManager::new(services.devices),
            presence,
            status: Arc::new(status),
            log: Arc::new(Mutex::new(log)),
            running: tokio::sync::Mutex::new(None),
            config,
        })
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Raum, in dem die Session gerade läuft
    pub async fn room(&self) -> Option<String> {
        self.running.lock().await.as_ref().map(|r| r.room.clone())
    }

    /// Betritt einen Raum
    ///
    /// Idempotent für denselben Raum. Fehlende Geräte degradieren die
    /// Session, ein nicht erreichbarer Bus bricht den Start ab.
    pub async fn start(&self, room: &str) -> Result<(), SessionError> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if current.room == room {
                return Ok(());
            }
            return Err(SessionError::AlreadyRunning(current.room.clone()));
        }

        tracing::info!("Joining room {} as {}", room, self.local);

        // 1. Lokale Medien
        if let Err(e) = self.media.acquire(&self.config.media) {
            tracing::warn!("Continuing without local media: {}", e);
        }

        // 2. Signaling vor Presence, damit kein Offer verloren geht
        let topic = topics::signaling(room);
        let signals = match self.bus.subscribe(&topic).await {
            Ok(signals) => signals,
            Err(e) => {
                tracing::error!("Signaling unavailable: {}", e);
                self.release_media();
                return Err(SessionError::TransportUnavailable(e.to_string()));
            }
        };

        // 3. Presence
        if let Err(e) = self.presence.start(room, &self.local).await {
            tracing::error!("Presence unavailable: {}", e);
            self.release_media();
            return Err(e.into());
        }

        // 4. Supervisor
        let supervisor = ConnectionSupervisor::spawn(
            SupervisorSettings {
                local: self.local.clone(),
                bus: Arc::clone(&self.bus),
                topic,
                transports: Arc::clone(&self.transports),
                pairing: self.config.pairing,
                retry: self.config.retry_policy(),
                timings: self.config.timings(),
                status: Arc::clone(&self.status),
                log: Arc::clone(&self.log),
            },
            SupervisorInputs {
                presence: self.presence.events(),
                signals,
                media: self.media.subscribe(),
            },
        );

        *running = Some(Running {
            room: room.to_string(),
            supervisor,
        });
        Ok(())
    }

    /// Verlässt den Raum
    ///
    /// Jeder Schritt läuft, auch wenn ein vorheriger fehlschlägt; die
    /// Probleme werden gesammelt zurückgegeben.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let Some(running) = self.running.lock().await.take() else {
            return Ok(());
        };

        tracing::info!("Leaving room {}", running.room);
        let mut problems = Vec::new();

        if let Err(e) = running.supervisor.shutdown().await {
            tracing::error!("Supervisor shutdown failed: {}", e);
            problems.push(e.to_string());
        }

        self.release_media();
        self.presence.stop().await;
        self.status.send_replace(StatusSnapshot::default());

        if problems.is_empty() {
            Ok(())
        } else {
            Err(SessionError::Teardown(problems.join("; ")))
        }
    }

    /// Vollständiger Teardown und Neueintritt in denselben Raum
    pub async fn find_next(&self) -> Result<(), SessionError> {
        let room = self.room().await.ok_or(SessionError::NotRunning)?;
        tracing::info!("Looking for the next peer in {}", room);

        if let Err(e) = self.stop().await {
            tracing::warn!("Teardown before rejoin incomplete: {}", e);
        }
        self.start(&room).await
    }

    fn release_media(&self) {
        if let Some(handle) = self.media.current() {
            self.media.release(handle);
        }
    }

    // ========================================================================
    // MEDIA
    // ========================================================================

    /// Wechselt das Capture-Gerät; verbundene Sessions verhandeln neu
    pub fn switch_device(&self, constraints: &MediaConstraints) -> Result<(), SessionError> {
        self.media.switch_device(constraints)?;
        Ok(())
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.media.set_audio_enabled(enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.media.set_video_enabled(enabled);
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.media.is_audio_enabled()
    }

    pub fn is_video_enabled(&self) -> bool {
        self.media.is_video_enabled()
    }

    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>, SessionError> {
        Ok(self.media.enumerate()?)
    }

    pub fn has_video_input(&self) -> bool {
        self.media.has_video_input()
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    pub fn status(&self) -> StatusSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusSnapshot> {
        self.status.subscribe()
    }

    /// Letzte Ereignisse, älteste zuerst
    pub fn recent_events(&self) -> Vec<SessionLogEntry> {
        self.log.lock().entries()
    }

    /// Endgültig gescheiterte Peers aus dem Ereignisprotokoll
    pub fn failures(&self) -> Vec<SessionError> {
        self.log
            .lock()
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let peer = entry.peer?;
                match entry.event {
                    SessionLogEvent::HardFailure { attempts, cause } => {
                        Some(SessionError::NegotiationFailed {
                            peer,
                            attempts,
                            cause,
                        })
                    }
                    SessionLogEvent::ProtocolViolation { reason } => {
                        Some(SessionError::ProtocolViolation { peer, reason })
                    }
                    _ => None,
                }
            })
            .collect()
    }

    pub async fn peer_sessions(&self) -> Result<Vec<PeerSessionInfo>, SessionError> {
        let running = self.running.lock().await;
        let running = running.as_ref().ok_or(SessionError::NotRunning)?;
        running
            .supervisor
            .peer_sessions()
            .await
            .map_err(|_| SessionError::NotRunning)
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("local", &self.local)
            .field("status", &self.status.borrow().status)
            .finish()
    }
}
