pub mod loopback;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Credentials issued by the backend collaborator for one participant's
/// connection to the conferencing session.
#[derive(Debug, Clone)]
pub struct SessionCredentials {
    pub session_id: String,
    pub attendee_id: String,
    pub external_user_id: String,
    pub join_token: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    VideoInput,
    AudioInput,
    AudioOutput,
}

impl DeviceKind {
    pub fn label(&self) -> &'static str {
        match self {
            DeviceKind::VideoInput => "camera",
            DeviceKind::AudioInput => "microphone",
            DeviceKind::AudioOutput => "speaker",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub kind: DeviceKind,
    pub label: String,
}

/// Owning handle to a local media stream.
///
/// The underlying tracks live until `stop_tracks` is called; cloning the
/// handle shares the same tracks, so whoever holds ownership decides when
/// they die.
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    id: String,
    stopped: Arc<AtomicBool>,
}

impl MediaStreamHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn stop_tracks(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn tracks_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Exclusive holder of the local media stream.
///
/// The stream is owned by exactly one slot at a time (pre-join preview or
/// live session). `take` moves ownership out without touching the tracks;
/// `release` stops the tracks and empties the slot.
#[derive(Debug, Default)]
pub struct StreamSlot {
    inner: Option<MediaStreamHandle>,
}

impl StreamSlot {
    pub fn empty() -> Self {
        Self { inner: None }
    }

    /// Put a stream into the slot, stopping whatever it previously held.
    pub fn hold(&mut self, handle: MediaStreamHandle) {
        if let Some(previous) = self.inner.take() {
            previous.stop_tracks();
        }
        self.inner = Some(handle);
    }

    /// Move the stream out. The caller becomes the owner; the tracks keep
    /// running.
    pub fn take(&mut self) -> Option<MediaStreamHandle> {
        self.inner.take()
    }

    /// Stop the tracks and empty the slot.
    pub fn release(&mut self) {
        if let Some(handle) = self.inner.take() {
            handle.stop_tracks();
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.is_some()
    }
}

/// State of one published tile as reported by the capability.
#[derive(Debug, Clone)]
pub struct TileState {
    pub tile_id: u32,
    pub local: bool,
    pub content: bool,
    pub bound_attendee_id: String,
    pub bound_external_user_id: String,
}

/// Events delivered by the capability. No ordering or exactly-once
/// guarantees across event kinds; the consumers impose idempotence.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started,
    Stopped,
    Presence {
        attendee_id: String,
        present: bool,
        external_user_id: String,
    },
    TileUpdated {
        tile: TileState,
    },
    TileRemoved {
        tile_id: u32,
    },
    Volume {
        attendee_id: String,
        volume: f32,
        muted: bool,
    },
    Data {
        topic: String,
        sender_attendee_id: String,
        payload: Vec<u8>,
    },
    DevicesChanged,
}

/// Local video source: an explicit device, or an already-running stream
/// whose ownership transfers to the capability.
#[derive(Debug, Clone)]
pub enum VideoSource {
    Device(String),
    Stream(MediaStreamHandle),
}

/// Black-box conferencing session interface.
///
/// Owned by the external SDK in production; `loopback` provides an
/// in-process implementation for tests and the simulator.
#[async_trait]
pub trait SessionCapability: Send + Sync {
    fn credentials(&self) -> &SessionCredentials;

    /// Register an event sink. All registered sinks receive all events.
    fn events(&self) -> mpsc::UnboundedReceiver<SessionEvent>;

    async fn start(&self) -> Result<()>;
    async fn stop(&self);

    async fn list_devices(&self, kind: DeviceKind) -> Vec<MediaDeviceInfo>;

    async fn start_audio_input(&self, device_id: &str) -> Result<()>;
    async fn stop_audio_input(&self);
    async fn start_video_input(&self, source: VideoSource) -> Result<()>;
    async fn stop_video_input(&self);
    async fn choose_audio_output(&self, device_id: &str) -> Result<()>;

    async fn start_local_tile(&self);
    async fn stop_local_tile(&self);

    async fn start_content_share(&self, stream: MediaStreamHandle) -> Result<()>;
    async fn stop_content_share(&self);

    async fn mute_local_audio(&self);
    async fn unmute_local_audio(&self);

    async fn bind_tile(&self, tile_id: u32, surface: &str);
    async fn unbind_tile(&self, tile_id: u32);

    async fn subscribe_volume(&self, attendee_id: &str);
    async fn unsubscribe_volume(&self, attendee_id: &str);

    /// Publish a data message on a topic, with a caller-specified
    /// approximate lifetime for transport-side retry.
    async fn send_data(&self, topic: &str, payload: &str, lifetime_ms: u64) -> Result<()>;
}

/// Constructs a capability from backend-issued credentials.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, credentials: SessionCredentials) -> Result<Arc<dyn SessionCapability>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_slot_transfer_keeps_tracks_alive() {
        let mut preview = StreamSlot::empty();
        preview.hold(MediaStreamHandle::new("cam"));

        let moved = preview.take().unwrap();
        assert!(!preview.is_held());
        assert!(!moved.tracks_stopped());
    }

    #[test]
    fn test_stream_slot_release_stops_tracks() {
        let handle = MediaStreamHandle::new("cam");
        let watcher = handle.clone();
        let mut slot = StreamSlot::empty();
        slot.hold(handle);
        slot.release();
        assert!(watcher.tracks_stopped());
        assert!(!slot.is_held());
    }

    #[test]
    fn test_stream_slot_hold_stops_previous() {
        let first = MediaStreamHandle::new("a");
        let watcher = first.clone();
        let mut slot = StreamSlot::empty();
        slot.hold(first);
        slot.hold(MediaStreamHandle::new("b"));
        assert!(watcher.tracks_stopped());
        assert!(slot.is_held());
    }
}
