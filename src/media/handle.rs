//! LocalMediaHandle - geteilter, unveränderlicher Capture-Stream
//!
//! Ein Handle ist ein Arc auf die akquirierten Geräte. Alle PeerSessions
//! teilen sich denselben Handle lesend; die Geräte werden erst freigegeben,
//! wenn der letzte Klon gedroppt wird.

use super::{DeviceBackend, DeviceDescriptor, MediaAvailability, TrackKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Ein ausgehender Track des lokalen Streams
#[derive(Debug, Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub device_id: String,
    enabled: Arc<AtomicBool>,
}

impl LocalTrack {
    pub(crate) fn new(kind: TrackKind, device_id: String) -> Self {
        Self {
            id: format!("{}-{}", kind_label(kind), Uuid::new_v4()),
            kind,
            device_id,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Ob der Track gerade Medien sendet (Mute / Kamera aus)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

fn kind_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

struct LocalMedia {
    id: Uuid,
    tracks: Vec<LocalTrack>,
    devices: Vec<DeviceDescriptor>,
    availability: MediaAvailability,
    backend: Arc<dyn DeviceBackend>,
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        for device in &self.devices {
            self.backend.close(device);
        }
        tracing::debug!("Local media {} released", self.id);
    }
}

/// Geteilter Verweis auf den lokalen Capture-Stream
#[derive(Clone)]
pub struct LocalMediaHandle(Arc<LocalMedia>);

impl LocalMediaHandle {
    pub(crate) fn new(
        tracks: Vec<LocalTrack>,
        devices: Vec<DeviceDescriptor>,
        availability: MediaAvailability,
        backend: Arc<dyn DeviceBackend>,
    ) -> Self {
        Self(Arc::new(LocalMedia {
            id: Uuid::new_v4(),
            tracks,
            devices,
            availability,
            backend,
        }))
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.0.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.0.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        &self.0.devices
    }

    pub fn availability(&self) -> MediaAvailability {
        self.0.availability
    }

    pub fn has_video(&self) -> bool {
        self.track(TrackKind::Video).is_some()
    }

    /// Ob zwei Handles auf denselben Stream zeigen
    pub fn same_stream(&self, other: &LocalMediaHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for LocalMediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaHandle")
            .field("id", &self.0.id)
            .field("tracks", &self.0.tracks)
            .field("availability", &self.0.availability)
            .finish()
    }
}
