//! MediaDeviceManager
//!
//! Einziger Eigentümer des aktiven LocalMediaHandle. Ein Gerätewechsel
//! erzeugt einen neuen Handle und tauscht ihn atomar aus; laufende Sessions
//! erfahren davon über [`MediaDeviceManager::subscribe`].

use super::{
    DeviceBackend, DeviceDescriptor, DeviceError, DeviceKind, LocalMediaHandle, LocalTrack,
    MediaAvailability, MediaConstraints, TrackKind,
};
use std::sync::Arc;
use tokio::sync::watch;

pub struct MediaDeviceManager {
    backend: Arc<dyn DeviceBackend>,
    current: watch::Sender<Option<LocalMediaHandle>>,
}

impl MediaDeviceManager {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        let (current, _) = watch::channel(None);
        Self { backend, current }
    }

    /// Listet alle Geräte auf
    pub fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        self.backend.enumerate()
    }

    /// Prüft ob überhaupt eine Kamera vorhanden ist
    pub fn has_video_input(&self) -> bool {
        match self.backend.enumerate() {
            Ok(devices) => devices.iter().any(|d| d.kind == DeviceKind::VideoInput),
            Err(e) => {
                tracing::warn!("Error checking camera: {}", e);
                false
            }
        }
    }

    /// Akquiriert den lokalen Stream und macht ihn zum aktiven Handle
    ///
    /// Fehlt die Kamera, wird auf Audio-only degradiert. Nur wenn gar nichts
    /// geöffnet werden kann, kommt `MediaUnavailable` zurück.
    pub fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, DeviceError> {
        let handle = self.open_stream(constraints)?;
        if let Some(previous) = self.current.send_replace(Some(handle.clone())) {
            tracing::debug!("Replaced local media {} on acquire", previous.id());
        }
        tracing::info!(
            "Local media {} acquired ({:?})",
            handle.id(),
            handle.availability()
        );
        Ok(handle)
    }

    /// Wechselt das aktive Capture-Gerät
    ///
    /// Der alte Handle bleibt gültig, bis die letzte Session ihn loslässt.
    pub fn switch_device(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaHandle, DeviceError> {
        let handle = self.open_stream(constraints)?;
        let previous = self.current.send_replace(Some(handle.clone()));
        tracing::info!(
            "Switched local media {:?} -> {}",
            previous.as_ref().map(|h| h.id()),
            handle.id()
        );
        Ok(handle)
    }

    /// Gibt einen Handle frei
    ///
    /// Ist er der aktive Handle, gibt es danach keinen aktiven Stream mehr.
    /// Die Geräte schließen, sobald keine Session mehr darauf verweist.
    pub fn release(&self, handle: LocalMediaHandle) {
        let was_current = self.current.send_if_modified(|current| match current {
            Some(active) if active.same_stream(&handle) => {
                *current = None;
                true
            }
            _ => false,
        });
        tracing::debug!(
            "Released local media {} (was active: {})",
            handle.id(),
            was_current
        );
    }

    /// Aktiver Handle
    pub fn current(&self) -> Option<LocalMediaHandle> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LocalMediaHandle>> {
        self.current.subscribe()
    }

    pub fn availability(&self) -> MediaAvailability {
        self.current
            .borrow()
            .as_ref()
            .map(|h| h.availability())
            .unwrap_or(MediaAvailability::Unavailable)
    }

    /// Setzt Mute-Status
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Audio, enabled);
        tracing::debug!("Audio enabled: {}", enabled);
    }

    /// Schaltet die Kamera an/aus
    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Video, enabled);
        tracing::debug!("Video enabled: {}", enabled);
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.is_enabled(TrackKind::Audio)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.is_enabled(TrackKind::Video)
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(track) = self.current.borrow().as_ref().and_then(|h| h.track(kind)) {
            track.set_enabled(enabled);
        }
    }

    fn is_enabled(&self, kind: TrackKind) -> bool {
        self.current
            .borrow()
            .as_ref()
            .and_then(|h| h.track(kind).map(|t| t.is_enabled()))
            .unwrap_or(false)
    }

    fn open_stream(&self, constraints: &MediaConstraints) -> Result<LocalMediaHandle, DeviceError> {
        let mut tracks = Vec::new();
        let mut devices = Vec::new();

        for kind in [TrackKind::Audio, TrackKind::Video] {
            if !constraints.wants(kind) {
                continue;
            }
            match self.backend.open(kind, constraints.device_for(kind)) {
                Ok(device) => {
                    tracks.push(LocalTrack::new(kind, device.id.clone()));
                    devices.push(device);
                }
                Err(e) => {
                    tracing::warn!("Could not open {:?} capture: {}", kind, e);
                }
            }
        }

        if tracks.is_empty() {
            return Err(DeviceError::MediaUnavailable);
        }

        let has = |kind| tracks.iter().any(|t: &LocalTrack| t.kind == kind);
        let availability = match (has(TrackKind::Audio), has(TrackKind::Video)) {
            (true, true) => MediaAvailability::Full,
            (true, false) if constraints.video => MediaAvailability::AudioOnly,
            (false, true) if constraints.audio => MediaAvailability::VideoOnly,
            _ => MediaAvailability::Full,
        };

        if availability == MediaAvailability::AudioOnly {
            tracing::warn!("No camera available, degrading to audio-only");
        }

        Ok(LocalMediaHandle::new(
            tracks,
            devices,
            availability,
            Arc::clone(&self.backend),
        ))
    }
}

impl std::fmt::Debug for MediaDeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaDeviceManager")
            .field("current", &*self.current.borrow())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::VirtualDevices;

    #[test]
    fn test_acquire_full_media() {
        let devices = Arc::new(VirtualDevices::standard());
        let manager = MediaDeviceManager::new(devices.clone());

        let handle = manager.acquire(&MediaConstraints::audio_video()).unwrap();
        assert_eq!(handle.availability(), MediaAvailability::Full);
        assert_eq!(handle.tracks().len(), 2);
        assert!(manager.has_video_input());
        assert_eq!(devices.open_count(), 2);
    }

    #[test]
    fn test_missing_camera_degrades_to_audio_only() {
        let manager = MediaDeviceManager::new(Arc::new(VirtualDevices::microphone_only()));

        let handle = manager.acquire(&MediaConstraints::audio_video()).unwrap();
        assert_eq!(handle.availability(), MediaAvailability::AudioOnly);
        assert!(!handle.has_video());
        assert!(!manager.has_video_input());
    }

    #[test]
    fn test_no_devices_reports_media_unavailable() {
        let manager = MediaDeviceManager::new(Arc::new(VirtualDevices::empty()));

        assert_eq!(
            manager.acquire(&MediaConstraints::audio_video()).unwrap_err(),
            DeviceError::MediaUnavailable
        );
        assert_eq!(manager.availability(), MediaAvailability::Unavailable);
    }

    #[test]
    fn test_devices_close_when_last_reference_drops() {
        let devices = Arc::new(VirtualDevices::standard());
        let manager = MediaDeviceManager::new(devices.clone());

        let handle = manager.acquire(&MediaConstraints::audio_only()).unwrap();
        let session_ref = handle.clone();

        manager.release(handle);
        assert!(manager.current().is_none());
        // Eine Session hält den Stream noch
        assert_eq!(devices.open_count(), 1);

        drop(session_ref);
        assert_eq!(devices.open_count(), 0);
    }

    #[test]
    fn test_switch_device_publishes_new_handle() {
        let devices = Arc::new(VirtualDevices::standard().with_device(
            "usb-mic",
            "USB Microphone",
            DeviceKind::AudioInput,
        ));
        let manager = MediaDeviceManager::new(devices.clone());
        let mut updates = manager.subscribe();

        let first = manager.acquire(&MediaConstraints::audio_only()).unwrap();
        let second = manager
            .switch_device(&MediaConstraints::audio_only().with_device(TrackKind::Audio, "usb-mic"))
            .unwrap();

        assert!(updates.has_changed().unwrap());
        let published = updates.borrow_and_update().clone().unwrap();
        assert!(published.same_stream(&second));
        assert!(!published.same_stream(&first));
        assert_eq!(
            second.track(TrackKind::Audio).unwrap().device_id,
            "usb-mic".to_string()
        );
    }

    #[test]
    fn test_mute_and_camera_toggle() {
        let manager = MediaDeviceManager::new(Arc::new(VirtualDevices::standard()));
        let handle = manager.acquire(&MediaConstraints::audio_video()).unwrap();

        manager.set_audio_enabled(false);
        manager.set_video_enabled(false);
        assert!(!manager.is_audio_enabled());
        assert!(!handle.track(TrackKind::Video).unwrap().is_enabled());

        manager.set_video_enabled(true);
        assert!(manager.is_video_enabled());
    }
}
