//! Match Signaling - Peer-Verbindungen für zufällige Video-Chat-Räume
//!
//! Orchestriert, wer mit wem verbunden wird:
//! - Presence über einen austauschbaren SignalBus
//! - Offer/Answer/ICE pro Peer als eigener Zustandsautomat
//! - Retry mit begrenztem Backoff und aggregierter Verbindungsstatus
//! - WebRTC als Transport, cpal für Audio-Geräte
//!
//! Einstieg ist [`RoomSession`]:
//!
//! ```no_run
//! use match_signaling::{ParticipantId, RoomServices, RoomSession, SessionConfig};
//!
//! # async fn demo() -> Result<(), match_signaling::SessionError> {
//! match_signaling::init_tracing();
//! let config = SessionConfig::from_env()?;
//! let services = RoomServices::connect(&config).await?;
//! let session = RoomSession::new(ParticipantId::random(), config, services)?;
//!
//! session.start("lobby").await?;
//! let mut status = session.subscribe_status();
//! status.changed().await.ok();
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod media;
pub mod negotiator;
pub mod presence;
pub mod session;
pub mod signaling;
pub mod supervisor;
pub mod transport;

pub use config::{init_tracing, ConfigError, SessionConfig, TurnServer};
pub use media::{
    DeviceError, LocalMediaHandle, MediaAvailability, MediaConstraints, MediaDeviceManager,
};
pub use negotiator::{FailureCause, NegotiationState, Role};
pub use presence::{PresenceEvent, PresenceTracker};
pub use session::{RoomServices, RoomSession, SessionError};
pub use signaling::{ParticipantId, SignalBus};
pub use supervisor::{ConnectionStatus, PairingPolicy, SessionLogEntry, StatusSnapshot};
pub use transport::TransportFactory;
