//! In-Memory Geräte für Tests und Headless-Betrieb

use super::{DeviceBackend, DeviceDescriptor, DeviceError, DeviceKind, TrackKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Default)]
struct VirtualState {
    devices: Vec<DeviceDescriptor>,
    busy: HashSet<String>,
    /// Geräte-ID → Anzahl offener Nutzungen
    open: HashMap<String, usize>,
}

/// Simulierte Geräte
#[derive(Debug, Default)]
pub struct VirtualDevices {
    state: Mutex<VirtualState>,
}

impl VirtualDevices {
    /// Keine Geräte
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mikrofon, Lautsprecher und Kamera
    pub fn standard() -> Self {
        Self::microphone_only()
            .with_device("virtual-camera", "Virtual Camera", DeviceKind::VideoInput)
    }

    /// Mikrofon und Lautsprecher, keine Kamera
    pub fn microphone_only() -> Self {
        Self::empty()
            .with_device("virtual-mic", "Virtual Microphone", DeviceKind::AudioInput)
            .with_device("virtual-speaker", "Virtual Speaker", DeviceKind::AudioOutput)
    }

    /// Fügt ein Gerät hinzu; das erste Gerät einer Art ist das Standardgerät
    pub fn with_device(self, id: &str, label: &str, kind: DeviceKind) -> Self {
        {
            let mut state = self.state.lock();
            let is_default = !state.devices.iter().any(|d| d.kind == kind);
            state.devices.push(DeviceDescriptor {
                id: id.to_string(),
                label: label.to_string(),
                kind,
                is_default,
            });
        }
        self
    }

    /// Markiert ein Gerät als belegt (z.B. von einer anderen Anwendung)
    pub fn set_busy(&self, id: &str, busy: bool) {
        let mut state = self.state.lock();
        if busy {
            state.busy.insert(id.to_string());
        } else {
            state.busy.remove(id);
        }
    }

    /// Anzahl offener Gerätenutzungen
    pub fn open_count(&self) -> usize {
        self.state.lock().open.values().sum()
    }

    pub fn is_open(&self, id: &str) -> bool {
        self.state.lock().open.get(id).copied().unwrap_or(0) > 0
    }
}

impl DeviceBackend for VirtualDevices {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        Ok(self.state.lock().devices.clone())
    }

    fn open(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<DeviceDescriptor, DeviceError> {
        let mut state = self.state.lock();
        let wanted = kind.device_kind();

        let device = match device_id {
            Some(id) => state
                .devices
                .iter()
                .find(|d| d.id == id && d.kind == wanted)
                .cloned()
                .ok_or_else(|| DeviceError::NotFound(id.to_string()))?,
            None => state
                .devices
                .iter()
                .find(|d| d.kind == wanted && d.is_default)
                .cloned()
                .ok_or(match kind {
                    TrackKind::Audio => DeviceError::NoInputDevice,
                    TrackKind::Video => DeviceError::NoVideoDevice,
                })?,
        };

        if state.busy.contains(&device.id) {
            return Err(DeviceError::Busy(device.id));
        }

        *state.open.entry(device.id.clone()).or_default() += 1;
        Ok(device)
    }

    fn close(&self, device: &DeviceDescriptor) {
        let mut state = self.state.lock();
        if let Some(count) = state.open.get_mut(&device.id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.open.remove(&device.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_selection() {
        let devices = VirtualDevices::standard();
        let mic = devices.open(TrackKind::Audio, None).unwrap();
        assert_eq!(mic.id, "virtual-mic");
        assert!(devices.is_open("virtual-mic"));

        devices.close(&mic);
        assert!(!devices.is_open("virtual-mic"));
    }

    #[test]
    fn test_busy_and_missing_devices() {
        let devices = VirtualDevices::microphone_only();
        assert_eq!(
            devices.open(TrackKind::Video, None).unwrap_err(),
            DeviceError::NoVideoDevice
        );
        assert_eq!(
            devices.open(TrackKind::Audio, Some("nope")).unwrap_err(),
            DeviceError::NotFound("nope".to_string())
        );

        devices.set_busy("virtual-mic", true);
        assert!(matches!(
            devices.open(TrackKind::Audio, None),
            Err(DeviceError::Busy(_))
        ));
    }
}
