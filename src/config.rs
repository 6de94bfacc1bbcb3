//! Konfiguration einer RoomSession
//!
//! Alle Policy-Konstanten an einer Stelle. Defaults entsprechen dem
//! Verhalten der App; einzelne Werte lassen sich über Umgebungsvariablen
//! überschreiben.

use crate::media::MediaConstraints;
use crate::negotiator::NegotiationTimings;
use crate::supervisor::{PairingPolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default Signaling URL (kann über `SIGNALING_URL` überschrieben werden)
pub const DEFAULT_SIGNALING_URL: &str = "http://localhost:8787";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// TURN-Server mit Zugangsdaten
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnServer {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl std::fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnServer")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("credential", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub signaling_url: String,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    /// Anteil der Backoff-Verzögerung, um den zufällig abgewichen wird
    pub retry_jitter: f64,
    pub negotiation_timeout_ms: u64,
    pub disconnect_grace_ms: u64,
    pub heartbeat_ms: u64,
    pub presence_ttl_ms: u64,
    pub pairing: PairingPolicy,
    pub ice_servers: Vec<String>,
    /// Zusätzlich zu den STUN-Servern, z.B. hinter symmetrischem NAT
    pub turn_server: Option<TurnServer>,
    pub event_log_capacity: usize,
    pub media: MediaConstraints,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            max_retries: 5,
            retry_base_ms: 500,
            retry_max_ms: 8_000,
            retry_jitter: 0.3,
            negotiation_timeout_ms: 15_000,
            disconnect_grace_ms: 5_000,
            heartbeat_ms: 5_000,
            presence_ttl_ms: 15_000,
            pairing: PairingPolicy::default(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_server: None,
            event_log_capacity: 64,
            media: MediaConstraints::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults, überschrieben durch Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = lookup("SIGNALING_URL") {
            config.signaling_url = url;
        }
        if let Some(value) = lookup("MATCH_MAX_RETRIES") {
            config.max_retries = parse_var("MATCH_MAX_RETRIES", &value)?;
        }
        if let Some(value) = lookup("MATCH_PAIRING") {
            config.pairing = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "MATCH_PAIRING",
                value,
            })?;
        }
        if let Some(value) = lookup("MATCH_NEGOTIATION_TIMEOUT_MS") {
            config.negotiation_timeout_ms = parse_var("MATCH_NEGOTIATION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("MATCH_ICE_SERVERS") {
            config.ice_servers = value
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(url) = lookup("MATCH_TURN_URL") {
            config.turn_server = Some(TurnServer {
                url,
                username: lookup("MATCH_TURN_USERNAME").unwrap_or_default(),
                credential: lookup("MATCH_TURN_CREDENTIAL").unwrap_or_default(),
            });
        }

        config.validate()?;
        Ok(config)
    }

    /// Prüft die Werte auf Plausibilität
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_base_ms == 0 || self.retry_base_ms > self.retry_max_ms {
            return Err(ConfigError::Invalid(format!(
                "retry base {}ms must be between 1 and the cap {}ms",
                self.retry_base_ms, self.retry_max_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(ConfigError::Invalid(format!(
                "retry jitter {} outside 0.0..=1.0",
                self.retry_jitter
            )));
        }
        if self.negotiation_timeout_ms == 0 || self.disconnect_grace_ms == 0 {
            return Err(ConfigError::Invalid(
                "negotiation timeout and disconnect grace must be positive".to_string(),
            ));
        }
        if self.heartbeat_ms == 0 || self.presence_ttl_ms <= self.heartbeat_ms {
            return Err(ConfigError::Invalid(format!(
                "presence TTL {}ms must exceed the heartbeat {}ms",
                self.presence_ttl_ms, self.heartbeat_ms
            )));
        }
        if let Some(turn) = &self.turn_server {
            if !(turn.url.starts_with("turn:") || turn.url.starts_with("turns:")) {
                return Err(ConfigError::InvalidValue {
                    name: "turnServer.url",
                    value: turn.url.clone(),
                });
            }
        }
        if self.event_log_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event log capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base: Duration::from_millis(self.retry_base_ms),
            max: Duration::from_millis(self.retry_max_ms),
            jitter: self.retry_jitter,
        }
    }

    pub fn timings(&self) -> NegotiationTimings {
        NegotiationTimings {
            negotiation_timeout: Duration::from_millis(self.negotiation_timeout_ms),
            disconnect_grace: Duration::from_millis(self.disconnect_grace_ms),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

// ============================================================================
// LOGGING
// ============================================================================

/// Installiert den fmt-Subscriber
///
/// Filter aus `RUST_LOG` plus Defaults für diese Crate und webrtc. Ein
/// zweiter Aufruf ändert nichts.
pub fn init_tracing() {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in ["match_signaling=debug", "webrtc=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .is_ok()
    {
        tracing::info!("Logging initialized");
    }
}
