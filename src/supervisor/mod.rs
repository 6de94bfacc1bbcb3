//! Supervisor Module - Lebenszyklus aller Peer-Verbindungen eines Raums
//!
//! Der [`ConnectionSupervisor`] entscheidet anhand der Presence und der
//! [`PairingPolicy`], mit wem verhandelt wird, führt Retries nach der
//! [`RetryPolicy`] durch und veröffentlicht den aggregierten
//! [`StatusSnapshot`].
//!

mod engine;
mod policy;
mod status;

pub use engine::{ConnectionSupervisor, SupervisorHandle, SupervisorInputs, SupervisorSettings};
pub use policy::{PairingPolicy, RetryPolicy};
pub use status::{
    derive_status, ConnectionStatus, EventLog, PeerSessionInfo, SessionLogEntry, SessionLogEvent,
    StatusSnapshot,
};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Supervisor is not running")]
    NotRunning,

    #[error("Supervisor task failed: {0}")]
    Task(String),
}
