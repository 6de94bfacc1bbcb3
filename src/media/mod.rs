//! Media Module - lokale Capture-Geräte
//!
//! Dieses Modul verwaltet:
//! - Aufzählung der verfügbaren Geräte
//! - Akquise des lokalen Capture-Streams (LocalMediaHandle)
//! - Gerätewechsel als Copy-on-Write Swap
//! - Mute / Kamera aus
//!

mod cpal_backend;
mod handle;
mod manager;
mod virtual_devices;

pub use cpal_backend::{CpalBackend, SAMPLE_RATE};
pub use handle::{LocalMediaHandle, LocalTrack};
pub use manager::MediaDeviceManager;
pub use virtual_devices::VirtualDevices;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No video input device found")]
    NoVideoDevice,

    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Device backend error: {0}")]
    Backend(String),

    #[error("No capture media available")]
    MediaUnavailable,
}

// ============================================================================
// DEVICE TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    /// Gerätetyp, von dem ein Track dieser Art aufgenommen wird
    pub fn device_kind(self) -> DeviceKind {
        match self {
            TrackKind::Audio => DeviceKind::AudioInput,
            TrackKind::Video => DeviceKind::VideoInput,
        }
    }
}

/// Beschreibung eines Geräts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
    pub is_default: bool,
}

/// Gewünschte Medien beim Akquirieren
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    #[serde(default)]
    pub audio_device: Option<String>,
    #[serde(default)]
    pub video_device: Option<String>,
}

impl MediaConstraints {
    pub fn audio_video() -> Self {
        Self {
            audio: true,
            video: true,
            audio_device: None,
            video_device: None,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            video: false,
            ..Self::audio_video()
        }
    }

    /// Wählt ein bestimmtes Gerät für die angegebene Track-Art
    pub fn with_device(mut self, kind: TrackKind, device_id: impl Into<String>) -> Self {
        match kind {
            TrackKind::Audio => self.audio_device = Some(device_id.into()),
            TrackKind::Video => self.video_device = Some(device_id.into()),
        }
        self
    }

    pub(crate) fn device_for(&self, kind: TrackKind) -> Option<&str> {
        match kind {
            TrackKind::Audio => self.audio_device.as_deref(),
            TrackKind::Video => self.video_device.as_deref(),
        }
    }

    pub(crate) fn wants(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_video()
    }
}

/// Was vom lokalen Capture tatsächlich verfügbar ist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaAvailability {
    /// Noch nicht akquiriert
    #[default]
    Pending,
    Full,
    AudioOnly,
    VideoOnly,
    /// Kein Capture möglich; die Session läuft nur empfangend weiter
    Unavailable,
}

// ============================================================================
// DEVICE BACKEND
// ============================================================================

/// Zugriff auf die Geräte-I/O der Plattform
pub trait DeviceBackend: Send + Sync {
    /// Listet alle Geräte auf
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError>;

    /// Öffnet ein Capture-Gerät; `None` wählt das Standardgerät
    fn open(&self, kind: TrackKind, device_id: Option<&str>)
        -> Result<DeviceDescriptor, DeviceError>;

    /// Gibt ein geöffnetes Gerät wieder frei
    fn close(&self, device: &DeviceDescriptor);
}
