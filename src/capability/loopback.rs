//! In-process implementation of the session capability.
//!
//! Models the substrate the real conferencing SDK exposes, with its
//! weaknesses intact: data messages are unordered, may be delivered more
//! than once, and are never echoed to their sender; presence and tile
//! events are independent streams. Used by the simulator binary and the
//! integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    DeviceKind, MediaDeviceInfo, MediaStreamHandle, SessionCapability, SessionConnector,
    SessionCredentials, SessionEvent, TileState, VideoSource,
};
use crate::error::{ExamError, Result};

fn default_devices() -> Vec<MediaDeviceInfo> {
    vec![
        MediaDeviceInfo {
            device_id: "cam-0".to_string(),
            kind: DeviceKind::VideoInput,
            label: "Integrated Camera".to_string(),
        },
        MediaDeviceInfo {
            device_id: "mic-0".to_string(),
            kind: DeviceKind::AudioInput,
            label: "Internal Microphone".to_string(),
        },
        MediaDeviceInfo {
            device_id: "spk-0".to_string(),
            kind: DeviceKind::AudioOutput,
            label: "Speakers".to_string(),
        },
    ]
}

struct AttendeeState {
    external_user_id: String,
    sinks: Vec<mpsc::UnboundedSender<SessionEvent>>,
    started: bool,
    camera_tile: Option<u32>,
    content_tile: Option<u32>,
    video_stream: Option<MediaStreamHandle>,
    content_stream: Option<MediaStreamHandle>,
    audio_input: Option<String>,
    muted: bool,
    volume_watch: HashSet<String>,
    devices: Vec<MediaDeviceInfo>,
}

impl AttendeeState {
    fn new(external_user_id: String) -> Self {
        Self {
            external_user_id,
            sinks: Vec::new(),
            started: false,
            camera_tile: None,
            content_tile: None,
            video_stream: None,
            content_stream: None,
            audio_input: None,
            muted: false,
            volume_watch: HashSet::new(),
            devices: default_devices(),
        }
    }

    fn emit(&self, event: SessionEvent) {
        for sink in &self.sinks {
            let _ = sink.send(event.clone());
        }
    }
}

struct NetState {
    next_tile_id: u32,
    attendees: HashMap<String, AttendeeState>,
    bindings: HashMap<u32, String>,
}

/// Shared in-process "session" that loopback capabilities attach to.
pub struct LoopbackNet {
    state: Mutex<NetState>,
    duplicate_data_delivery: AtomicBool,
}

impl LoopbackNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(NetState {
                next_tile_id: 1,
                attendees: HashMap::new(),
                bindings: HashMap::new(),
            }),
            duplicate_data_delivery: AtomicBool::new(false),
        })
    }

    /// Make every data message arrive twice, to exercise receiver dedup.
    pub fn set_duplicate_data_delivery(&self, enabled: bool) {
        self.duplicate_data_delivery.store(enabled, Ordering::SeqCst);
    }

    pub fn attach(self: &Arc<Self>, credentials: SessionCredentials) -> Arc<LoopbackCapability> {
        let mut state = self.state.lock().expect("loopback state poisoned");
        state
            .attendees
            .entry(credentials.attendee_id.clone())
            .or_insert_with(|| AttendeeState::new(credentials.external_user_id.clone()));
        drop(state);

        Arc::new(LoopbackCapability {
            net: Arc::clone(self),
            credentials,
        })
    }

    /// Surface a tile was last bound to, for assertions.
    pub fn binding_for(&self, tile_id: u32) -> Option<String> {
        let state = self.state.lock().expect("loopback state poisoned");
        state.bindings.get(&tile_id).cloned()
    }

    /// Whether the published video stream of an attendee has had its
    /// tracks stopped (a stopped stream publishes black).
    pub fn video_stream_stopped(&self, attendee_id: &str) -> Option<bool> {
        let state = self.state.lock().expect("loopback state poisoned");
        state
            .attendees
            .get(attendee_id)
            .and_then(|a| a.video_stream.as_ref())
            .map(MediaStreamHandle::tracks_stopped)
    }

    /// Replace an attendee's device list and notify it, as a platform
    /// device-change notification would.
    pub fn replace_devices(&self, attendee_id: &str, devices: Vec<MediaDeviceInfo>) {
        let mut state = self.state.lock().expect("loopback state poisoned");
        if let Some(attendee) = state.attendees.get_mut(attendee_id) {
            attendee.devices = devices;
            attendee.emit(SessionEvent::DevicesChanged);
        }
    }

    fn broadcast_tile(state: &NetState, owner_id: &str, tile: TileState) {
        for (id, attendee) in &state.attendees {
            if !attendee.started {
                continue;
            }
            let mut for_recipient = tile.clone();
            for_recipient.local = id == owner_id;
            attendee.emit(SessionEvent::TileUpdated { tile: for_recipient });
        }
    }

    fn broadcast(state: &NetState, event: SessionEvent) {
        for attendee in state.attendees.values() {
            if attendee.started {
                attendee.emit(event.clone());
            }
        }
    }
}

/// One attendee's handle on the loopback session.
pub struct LoopbackCapability {
    net: Arc<LoopbackNet>,
    credentials: SessionCredentials,
}

impl LoopbackCapability {
    fn with_state<R>(&self, f: impl FnOnce(&mut NetState) -> R) -> R {
        let mut state = self.net.state.lock().expect("loopback state poisoned");
        f(&mut state)
    }

    fn my_id(&self) -> &str {
        &self.credentials.attendee_id
    }

    fn notify_volume_watchers(&self, state: &NetState, muted: bool) {
        let volume = if muted { 0.0 } else { 0.5 };
        for attendee in state.attendees.values() {
            if attendee.started && attendee.volume_watch.contains(self.my_id()) {
                attendee.emit(SessionEvent::Volume {
                    attendee_id: self.my_id().to_string(),
                    volume,
                    muted,
                });
            }
        }
    }
}

#[async_trait]
impl SessionCapability for LoopbackCapability {
    fn credentials(&self) -> &SessionCredentials {
        &self.credentials
    }

    fn events(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.with_state(|state| {
            if let Some(attendee) = state.attendees.get_mut(self.my_id()) {
                attendee.sinks.push(tx);
            }
        });
        rx
    }

    async fn start(&self) -> Result<()> {
        self.with_state(|state| {
            let Some(me) = state.attendees.get_mut(self.my_id()) else {
                return Err(ExamError::capability("attendee detached from loopback"));
            };
            me.started = true;
            let my_external = me.external_user_id.clone();

            // Announce the newcomer to everyone (self included; the real
            // SDK reports own presence too) and replay the existing
            // participants and their tiles to the newcomer.
            let join_event = SessionEvent::Presence {
                attendee_id: self.my_id().to_string(),
                present: true,
                external_user_id: my_external,
            };
            LoopbackNet::broadcast(state, join_event);

            let mut replay = Vec::new();
            for (id, attendee) in &state.attendees {
                if id == self.my_id() || !attendee.started {
                    continue;
                }
                replay.push(SessionEvent::Presence {
                    attendee_id: id.clone(),
                    present: true,
                    external_user_id: attendee.external_user_id.clone(),
                });
                if let Some(tile_id) = attendee.camera_tile {
                    replay.push(SessionEvent::TileUpdated {
                        tile: TileState {
                            tile_id,
                            local: false,
                            content: false,
                            bound_attendee_id: id.clone(),
                            bound_external_user_id: attendee.external_user_id.clone(),
                        },
                    });
                }
                if let Some(tile_id) = attendee.content_tile {
                    replay.push(SessionEvent::TileUpdated {
                        tile: TileState {
                            tile_id,
                            local: false,
                            content: true,
                            bound_attendee_id: format!("{id}#content"),
                            bound_external_user_id: format!(
                                "{}#content",
                                attendee.external_user_id
                            ),
                        },
                    });
                }
            }

            let me = state
                .attendees
                .get(self.my_id())
                .expect("attendee inserted above");
            me.emit(SessionEvent::Started);
            for event in replay {
                me.emit(event);
            }
            Ok(())
        })
    }

    async fn stop(&self) {
        self.with_state(|state| {
            let Some(me) = state.attendees.get_mut(self.my_id()) else {
                return;
            };
            if !me.started {
                return;
            }
            me.started = false;
            let camera = me.camera_tile.take();
            let content = me.content_tile.take();
            if let Some(stream) = me.video_stream.take() {
                stream.stop_tracks();
            }
            if let Some(stream) = me.content_stream.take() {
                stream.stop_tracks();
            }
            me.emit(SessionEvent::Stopped);
            let external = me.external_user_id.clone();

            for tile_id in [camera, content].into_iter().flatten() {
                LoopbackNet::broadcast(state, SessionEvent::TileRemoved { tile_id });
            }
            LoopbackNet::broadcast(
                state,
                SessionEvent::Presence {
                    attendee_id: self.my_id().to_string(),
                    present: false,
                    external_user_id: external,
                },
            );
        });
    }

    async fn list_devices(&self, kind: DeviceKind) -> Vec<MediaDeviceInfo> {
        self.with_state(|state| {
            state
                .attendees
                .get(self.my_id())
                .map(|a| {
                    a.devices
                        .iter()
                        .filter(|d| d.kind == kind)
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn start_audio_input(&self, device_id: &str) -> Result<()> {
        self.with_state(|state| {
            let Some(me) = state.attendees.get_mut(self.my_id()) else {
                return Err(ExamError::capability("attendee detached from loopback"));
            };
            let known = me
                .devices
                .iter()
                .any(|d| d.kind == DeviceKind::AudioInput && d.device_id == device_id);
            if !known {
                return Err(ExamError::MediaInput(
                    "audio".to_string(),
                    format!("unknown device {device_id}"),
                ));
            }
            me.audio_input = Some(device_id.to_string());
            Ok(())
        })
    }

    async fn stop_audio_input(&self) {
        self.with_state(|state| {
            if let Some(me) = state.attendees.get_mut(self.my_id()) {
                me.audio_input = None;
            }
        });
    }

    async fn start_video_input(&self, source: VideoSource) -> Result<()> {
        self.with_state(|state| {
            let Some(me) = state.attendees.get_mut(self.my_id()) else {
                return Err(ExamError::capability("attendee detached from loopback"));
            };
            match source {
                VideoSource::Device(device_id) => {
                    let known = me
                        .devices
                        .iter()
                        .any(|d| d.kind == DeviceKind::VideoInput && d.device_id == device_id);
                    if !known {
                        return Err(ExamError::MediaInput(
                            "video".to_string(),
                            format!("unknown device {device_id}"),
                        ));
                    }
                    me.video_stream = Some(MediaStreamHandle::new(format!("dev:{device_id}")));
                }
                VideoSource::Stream(handle) => {
                    // Ownership transfers here; the handle dies with the
                    // capability, not with whoever acquired it.
                    me.video_stream = Some(handle);
                }
            }
            Ok(())
        })
    }

    async fn stop_video_input(&self) {
        self.with_state(|state| {
            if let Some(me) = state.attendees.get_mut(self.my_id()) {
                if let Some(stream) = me.video_stream.take() {
                    stream.stop_tracks();
                }
            }
        });
    }

    async fn choose_audio_output(&self, device_id: &str) -> Result<()> {
        self.with_state(|state| {
            let Some(me) = state.attendees.get(self.my_id()) else {
                return Err(ExamError::capability("attendee detached from loopback"));
            };
            let known = me
                .devices
                .iter()
                .any(|d| d.kind == DeviceKind::AudioOutput && d.device_id == device_id);
            if known {
                Ok(())
            } else {
                Err(ExamError::MediaInput(
                    "audio output".to_string(),
                    format!("unknown device {device_id}"),
                ))
            }
        })
    }

    async fn start_local_tile(&self) {
        self.with_state(|state| {
            let Some(me) = state.attendees.get_mut(self.my_id()) else {
                return;
            };
            if !me.started || me.camera_tile.is_some() {
                return;
            }
            let tile_id = state.next_tile_id;
            state.next_tile_id += 1;
            let external = {
                let me = state
                    .attendees
                    .get_mut(self.my_id())
                    .expect("attendee checked above");
                me.camera_tile = Some(tile_id);
                me.external_user_id.clone()
            };
            LoopbackNet::broadcast_tile(
                state,
                self.my_id(),
                TileState {
                    tile_id,
                    local: false,
                    content: false,
                    bound_attendee_id: self.my_id().to_string(),
                    bound_external_user_id: external,
                },
            );
        });
    }

    async fn stop_local_tile(&self) {
        self.with_state(|state| {
            let removed = state
                .attendees
                .get_mut(self.my_id())
                .and_then(|me| me.camera_tile.take());
            if let Some(tile_id) = removed {
                LoopbackNet::broadcast(state, SessionEvent::TileRemoved { tile_id });
            }
        });
    }

    async fn start_content_share(&self, stream: MediaStreamHandle) -> Result<()> {
        self.with_state(|state| {
            let Some(me) = state.attendees.get_mut(self.my_id()) else {
                return Err(ExamError::capability("attendee detached from loopback"));
            };
            if !me.started {
                return Err(ExamError::capability("content share before start"));
            }
            if me.content_tile.is_some() {
                return Ok(());
            }
            let tile_id = state.next_tile_id;
            state.next_tile_id += 1;
            let external = {
                let me = state
                    .attendees
                    .get_mut(self.my_id())
                    .expect("attendee checked above");
                me.content_tile = Some(tile_id);
                me.content_stream = Some(stream);
                me.external_user_id.clone()
            };
            LoopbackNet::broadcast_tile(
                state,
                self.my_id(),
                TileState {
                    tile_id,
                    local: false,
                    content: true,
                    bound_attendee_id: format!("{}#content", self.my_id()),
                    bound_external_user_id: format!("{external}#content"),
                },
            );
            Ok(())
        })
    }

    async fn stop_content_share(&self) {
        self.with_state(|state| {
            let removed = state.attendees.get_mut(self.my_id()).and_then(|me| {
                if let Some(stream) = me.content_stream.take() {
                    stream.stop_tracks();
                }
                me.content_tile.take()
            });
            if let Some(tile_id) = removed {
                LoopbackNet::broadcast(state, SessionEvent::TileRemoved { tile_id });
            }
        });
    }

    async fn mute_local_audio(&self) {
        self.with_state(|state| {
            if let Some(me) = state.attendees.get_mut(self.my_id()) {
                me.muted = true;
            }
            self.notify_volume_watchers(state, true);
        });
    }

    async fn unmute_local_audio(&self) {
        self.with_state(|state| {
            if let Some(me) = state.attendees.get_mut(self.my_id()) {
                me.muted = false;
            }
            self.notify_volume_watchers(state, false);
        });
    }

    async fn bind_tile(&self, tile_id: u32, surface: &str) {
        self.with_state(|state| {
            state.bindings.insert(tile_id, surface.to_string());
        });
    }

    async fn unbind_tile(&self, tile_id: u32) {
        self.with_state(|state| {
            state.bindings.remove(&tile_id);
        });
    }

    async fn subscribe_volume(&self, attendee_id: &str) {
        self.with_state(|state| {
            let target_state = state
                .attendees
                .get(attendee_id)
                .map(|target| (target.muted, target.started));
            if let Some(me) = state.attendees.get_mut(self.my_id()) {
                me.volume_watch.insert(attendee_id.to_string());
                // The SDK reports current state on subscription.
                if let Some((muted, true)) = target_state {
                    me.emit(SessionEvent::Volume {
                        attendee_id: attendee_id.to_string(),
                        volume: if muted { 0.0 } else { 0.5 },
                        muted,
                    });
                }
            }
        });
    }

    async fn unsubscribe_volume(&self, attendee_id: &str) {
        self.with_state(|state| {
            if let Some(me) = state.attendees.get_mut(self.my_id()) {
                me.volume_watch.remove(attendee_id);
            }
        });
    }

    async fn send_data(&self, topic: &str, payload: &str, _lifetime_ms: u64) -> Result<()> {
        let copies = if self.net.duplicate_data_delivery.load(Ordering::SeqCst) {
            2
        } else {
            1
        };
        self.with_state(|state| {
            for (id, attendee) in &state.attendees {
                if id == self.my_id() || !attendee.started {
                    continue;
                }
                for _ in 0..copies {
                    attendee.emit(SessionEvent::Data {
                        topic: topic.to_string(),
                        sender_attendee_id: self.my_id().to_string(),
                        payload: payload.as_bytes().to_vec(),
                    });
                }
            }
        });
        Ok(())
    }
}

/// Connector handing out loopback capabilities for backend-issued
/// credentials.
pub struct LoopbackConnector {
    net: Arc<LoopbackNet>,
}

impl LoopbackConnector {
    pub fn new(net: Arc<LoopbackNet>) -> Self {
        Self { net }
    }
}

#[async_trait]
impl SessionConnector for LoopbackConnector {
    async fn connect(&self, credentials: SessionCredentials) -> Result<Arc<dyn SessionCapability>> {
        let capability: Arc<dyn SessionCapability> = self.net.attach(credentials);
        Ok(capability)
    }
}
