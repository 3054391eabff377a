use std::sync::Arc;

use crate::capability::{
    DeviceKind, MediaDeviceInfo, SessionCapability, StreamSlot, VideoSource,
};
use crate::error::{ExamError, Result};

/// Pre-join media choices carried into the live session.
#[derive(Debug, Default)]
pub struct MediaPreferences {
    pub join_with_camera: bool,
    pub join_with_mic: bool,
    pub preferred_video_input: Option<String>,
    pub preferred_audio_input: Option<String>,
    pub preferred_audio_output: Option<String>,
    /// Stream acquired by a pre-join preview. Handed to the capability on
    /// join instead of re-requesting camera permission.
    pub preview: StreamSlot,
}

impl MediaPreferences {
    pub fn new() -> Self {
        Self {
            join_with_camera: true,
            join_with_mic: true,
            ..Self::default()
        }
    }
}

/// Live media flags. `mic_ready` is tracked apart from `muted`: muting
/// releases the device, unmuting lazily re-acquires it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MediaState {
    pub camera_on: bool,
    pub muted: bool,
    pub mic_ready: bool,
    pub screen_sharing: bool,
}

/// The explicitly preferred device when it is still attached, else the
/// first available one.
pub fn pick_device(devices: &[MediaDeviceInfo], preferred: Option<&str>) -> Option<String> {
    if let Some(wanted) = preferred.map(str::trim).filter(|p| !p.is_empty()) {
        if let Some(found) = devices.iter().find(|d| d.device_id == wanted) {
            return Some(found.device_id.clone());
        }
    }
    devices.first().map(|d| d.device_id.clone())
}

pub async fn acquire_audio_input(
    capability: &Arc<dyn SessionCapability>,
    prefs: &MediaPreferences,
) -> Result<()> {
    let devices = capability.list_devices(DeviceKind::AudioInput).await;
    let device_id = pick_device(&devices, prefs.preferred_audio_input.as_deref())
        .ok_or_else(|| ExamError::NoDeviceAvailable(DeviceKind::AudioInput.label().to_string()))?;
    capability.start_audio_input(&device_id).await
}

pub async fn acquire_video_input(
    capability: &Arc<dyn SessionCapability>,
    prefs: &mut MediaPreferences,
) -> Result<()> {
    if let Some(stream) = prefs.preview.take() {
        // Ownership moves to the capability. Stopping these tracks here
        // would publish a black tile.
        return capability.start_video_input(VideoSource::Stream(stream)).await;
    }
    let devices = capability.list_devices(DeviceKind::VideoInput).await;
    let device_id = pick_device(&devices, prefs.preferred_video_input.as_deref())
        .ok_or_else(|| ExamError::NoDeviceAvailable(DeviceKind::VideoInput.label().to_string()))?;
    capability.start_video_input(VideoSource::Device(device_id)).await
}

pub async fn apply_audio_output(
    capability: &Arc<dyn SessionCapability>,
    prefs: &MediaPreferences,
) {
    let devices = capability.list_devices(DeviceKind::AudioOutput).await;
    let Some(device_id) = pick_device(&devices, prefs.preferred_audio_output.as_deref()) else {
        return;
    };
    if let Err(e) = capability.choose_audio_output(&device_id).await {
        tracing::warn!(device_id = %device_id, error = %e, "Failed to choose audio output");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cam(id: &str) -> MediaDeviceInfo {
        MediaDeviceInfo {
            device_id: id.to_string(),
            kind: DeviceKind::VideoInput,
            label: id.to_string(),
        }
    }

    #[test]
    fn test_pick_prefers_explicit_device() {
        let devices = vec![cam("a"), cam("b")];
        assert_eq!(pick_device(&devices, Some("b")), Some("b".to_string()));
    }

    #[test]
    fn test_pick_falls_back_to_first() {
        let devices = vec![cam("a"), cam("b")];
        assert_eq!(pick_device(&devices, Some("gone")), Some("a".to_string()));
        assert_eq!(pick_device(&devices, None), Some("a".to_string()));
        assert_eq!(pick_device(&devices, Some("  ")), Some("a".to_string()));
    }

    #[test]
    fn test_pick_with_no_devices() {
        assert_eq!(pick_device(&[], Some("a")), None);
    }
}
