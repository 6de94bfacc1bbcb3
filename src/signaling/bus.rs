//! SignalBus - transportunabhängiger Publish/Subscribe-Kanal
//!
//! Zustellung ist at-most-once, ohne Reihenfolgegarantie zwischen
//! verschiedenen Absendern und ohne Persistenz. Alles oberhalb dieses
//! Moduls muss mit verlorenen und umsortierten Nachrichten leben.

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    #[error("Signal bus unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to publish message: {0}")]
    PublishFailed(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

// ============================================================================
// SUBSCRIPTION
// ============================================================================

/// Stream roher Nachrichten eines Topics. Drop beendet das Abonnement.
pub struct Subscription(pub BoxStream<'static, String>);

impl core::ops::Deref for Subscription {
    type Target = BoxStream<'static, String>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl core::ops::DerefMut for Subscription {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Wandelt einen Broadcast-Receiver in eine Subscription um.
/// Verpasste Nachrichten (Lagged) werden verworfen, at-most-once.
pub(crate) fn subscription_from(mut rx: broadcast::Receiver<String>) -> Subscription {
    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(message) => yield message,
                Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Subscriber lagged behind, {} message(s) dropped", skipped);
                }
            }
        }
    };
    Subscription(Box::pin(stream))
}

// ============================================================================
// SIGNAL BUS
// ============================================================================

#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Veröffentlicht eine Nachricht (fire-and-forget)
    async fn publish(&self, topic: &str, message: String) -> Result<(), BusError>;

    /// Abonniert ein Topic
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

// ============================================================================
// MEMORY BUS
// ============================================================================

const TOPIC_CAPACITY: usize = 1024;

/// In-Process SignalBus für mehrere Teilnehmer im selben Prozess
///
/// Klone teilen sich denselben Hub. Mit [`MemoryBus::set_available`] lässt
/// sich ein Ausfall des Busses simulieren.
#[derive(Clone)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    available: Arc<AtomicBool>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Schaltet den Bus an/aus
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            // Bestehende Abonnements enden wie bei einem Verbindungsabbruch
            self.topics.lock().clear();
        }
        tracing::debug!("Memory bus available: {}", available);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone()
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SignalBus for MemoryBus {
    async fn publish(&self, topic: &str, message: String) -> Result<(), BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable("memory bus switched off".to_string()));
        }
        // Ohne Abonnenten geht die Nachricht verloren, das ist erlaubt
        let _ = self.sender(topic).send(message);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if !self.is_available() {
            return Err(BusError::Unavailable("memory bus switched off".to_string()));
        }
        Ok(subscription_from(self.sender(topic).subscribe()))
    }
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus")
            .field("topics", &self.topics.lock().len())
            .field("available", &self.is_available())
            .finish()
    }
}
