//! Geräte-Backend über cpal
//!
//! Zählt die Audio-Geräte des Systems auf und prüft beim Öffnen, ob das
//! Mikrofon eine brauchbare Konfiguration anbietet. Der eigentliche
//! Capture-Stream gehört zur Media-Pipeline und wird hier nicht gehalten
//! (cpal::Stream ist nicht Send).
//!
//! Kameras werden von cpal nicht abgedeckt; Video meldet daher immer
//! `NoVideoDevice` und die Session degradiert auf Audio-only.

use super::{DeviceBackend, DeviceDescriptor, DeviceError, DeviceKind, TrackKind};
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Audio-Geräte der Plattform
#[derive(Debug, Default)]
pub struct CpalBackend {
    /// Namen der aktuell geöffneten Geräte
    open: Mutex<HashSet<String>>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn describe(
        devices: impl Iterator<Item = Device>,
        default_name: Option<&String>,
        kind: DeviceKind,
    ) -> Vec<DeviceDescriptor> {
        devices
            .filter_map(|d| {
                d.name().ok().map(|name| DeviceDescriptor {
                    is_default: Some(&name) == default_name,
                    id: name.clone(),
                    label: name,
                    kind,
                })
            })
            .collect()
    }

    fn find_input(device_id: Option<&str>) -> Result<Device, DeviceError> {
        let host = cpal::default_host();
        match device_id {
            None => host.default_input_device().ok_or(DeviceError::NoInputDevice),
            Some(id) => host
                .input_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?
                .find(|d| d.name().map(|n| n == id).unwrap_or(false))
                .ok_or_else(|| DeviceError::NotFound(id.to_string())),
        }
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, DeviceError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

impl DeviceBackend for CpalBackend {
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DeviceError> {
        let host = cpal::default_host();

        let default_input = host.default_input_device().and_then(|d| d.name().ok());
        let default_output = host.default_output_device().and_then(|d| d.name().ok());

        let mut devices = Self::describe(
            host.input_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?,
            default_input.as_ref(),
            DeviceKind::AudioInput,
        );
        devices.extend(Self::describe(
            host.output_devices()
                .map_err(|e| DeviceError::Backend(e.to_string()))?,
            default_output.as_ref(),
            DeviceKind::AudioOutput,
        ));

        Ok(devices)
    }

    fn open(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<DeviceDescriptor, DeviceError> {
        if kind == TrackKind::Video {
            return Err(DeviceError::NoVideoDevice);
        }

        let device = Self::find_input(device_id)?;
        let name = device
            .name()
            .map_err(|e| DeviceError::Backend(e.to_string()))?;
        let config = Self::find_best_input_config(&device)?;

        tracing::info!(
            "Opened audio input '{}': {} Hz, {} channels",
            name,
            config.sample_rate.0,
            config.channels
        );

        let is_default = device_id.is_none();
        self.open.lock().insert(name.clone());

        Ok(DeviceDescriptor {
            id: name.clone(),
            label: name,
            kind: DeviceKind::AudioInput,
            is_default,
        })
    }

    fn close(&self, device: &DeviceDescriptor) {
        if self.open.lock().remove(&device.id) {
            tracing::debug!("Closed audio input '{}'", device.id);
        }
    }
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, DeviceError> {
    // Priorität: 48kHz > andere, F32 > andere
    let target_rate = cpal::SampleRate(SAMPLE_RATE);
    let supports_target =
        |c: &SupportedStreamConfigRange| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate;

    if let Some(config) = configs
        .iter()
        .find(|c| supports_target(c) && c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_sample_rate(target_rate).into());
    }

    if let Some(config) = configs.iter().find(|c| c.sample_format() == SampleFormat::F32) {
        let rate = if supports_target(config) {
            target_rate
        } else {
            config.max_sample_rate()
        };
        return Ok(config.with_sample_rate(rate).into());
    }

    configs
        .first()
        .map(|c| c.with_max_sample_rate().into())
        .ok_or_else(|| DeviceError::Backend("No suitable audio configuration found".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpal::{SampleRate, SupportedBufferSize};

    fn range(min: u32, max: u32, format: SampleFormat) -> SupportedStreamConfigRange {
        SupportedStreamConfigRange::new(
            1,
            SampleRate(min),
            SampleRate(max),
            SupportedBufferSize::Unknown,
            format,
        )
    }

    #[test]
    fn test_prefers_48khz_float() {
        let config = select_best_config(vec![
            range(8000, 16000, SampleFormat::I16),
            range(8000, 96000, SampleFormat::F32),
        ])
        .unwrap();
        assert_eq!(config.sample_rate.0, SAMPLE_RATE);
    }

    #[test]
    fn test_falls_back_to_max_rate() {
        let config = select_best_config(vec![range(8000, 44100, SampleFormat::F32)]).unwrap();
        assert_eq!(config.sample_rate.0, 44100);

        let config = select_best_config(vec![range(8000, 16000, SampleFormat::I16)]).unwrap();
        assert_eq!(config.sample_rate.0, 16000);
    }

    #[test]
    fn test_no_config_is_error() {
        assert!(select_best_config(Vec::new()).is_err());
    }

    #[test]
    fn test_video_is_not_supported() {
        let backend = CpalBackend::new();
        assert_eq!(
            backend.open(TrackKind::Video, None).unwrap_err(),
            DeviceError::NoVideoDevice
        );
    }
}
