//! Presence Module - wer ist gerade im Raum
//!
//! Jeder Teilnehmer kündigt sich mit `join` an, beantwortet fremde Joins mit
//! `sync` und sendet regelmäßig ein `sync` als Lebenszeichen. Wer länger als
//! die TTL schweigt, gilt als gegangen.
//!

mod tracker;

pub use tracker::PresenceTracker;

use crate::signaling::ParticipantId;
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("Signal bus unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Presence already running in room {0}")]
    AlreadyRunning(String),
}

/// Änderungen der Anwesenheit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    Joined(ParticipantId),
    Left(ParticipantId),
    /// Vollständige Menge inklusive des eigenen Teilnehmers
    Synced(BTreeSet<ParticipantId>),
}
