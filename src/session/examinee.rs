use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{AttendanceRecord, ExamBackend, Profile};
use crate::capability::{
    MediaStreamHandle, SessionCapability, SessionConnector, SessionCredentials, SessionEvent,
};
use crate::config::ProtocolConfig;
use crate::error::{ExamError, Result};
use crate::identity::{make_external_user_id, normalize_attendee_id, Role};
use crate::protocol::chat::{self, ChatEntry, ChatKind, ChatMessage, ChatRole};
use crate::protocol::{ChatLog, ControlMessage, CHAT_TOPIC, CONVERSATION_ALL, EXAM_CONTROL_TOPIC};
use crate::session::controller::{release_media, SessionPhase, PROCTOR_VIEW_SURFACE, SELF_VIEW_SURFACE};
use crate::session::media::{
    acquire_audio_input, acquire_video_input, apply_audio_output, MediaPreferences, MediaState,
};
use crate::session::proctor_view::{ProctorView, ProctorViewAction};

/// Examinee-side session controller: joins with a session code (signed-in
/// or guest), publishes camera/screen, shows the active proctor feed, and
/// obeys remote end-exam/kick commands.
pub struct ExamineeController {
    backend: Arc<dyn ExamBackend>,
    connector: Arc<dyn SessionConnector>,
    protocol: ProtocolConfig,
    username: String,

    pub media_prefs: MediaPreferences,
    media_state: MediaState,

    phase: SessionPhase,
    capability: Option<Arc<dyn SessionCapability>>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,

    view: ProctorView,
    chat: ChatLog,

    profile: Option<Profile>,
    profile_epoch: u64,

    join_code: String,
    attendee_id: String,
    external_user_id: String,
    notice: Option<String>,
    force_removed: bool,

    attendance_join_code: String,
    attendance_attendee_id: String,
    attendance_leave_sent: bool,
}

impl ExamineeController {
    pub fn new(
        backend: Arc<dyn ExamBackend>,
        connector: Arc<dyn SessionConnector>,
        protocol: ProtocolConfig,
        username: &str,
    ) -> Self {
        Self {
            backend,
            connector,
            protocol,
            username: username.to_string(),
            media_prefs: MediaPreferences::new(),
            media_state: MediaState::default(),
            phase: SessionPhase::Idle,
            capability: None,
            events: None,
            view: ProctorView::new(),
            chat: ChatLog::new(),
            profile: None,
            profile_epoch: 0,
            join_code: String::new(),
            attendee_id: String::new(),
            external_user_id: String::new(),
            notice: None,
            force_removed: false,
            attendance_join_code: String::new(),
            attendance_attendee_id: String::new(),
            attendance_leave_sent: false,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn proctor_view(&self) -> &ProctorView {
        &self.view
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    pub fn attendee_id(&self) -> &str {
        &self.attendee_id
    }

    pub fn external_user_id(&self) -> &str {
        &self.external_user_id
    }

    pub fn media_state(&self) -> MediaState {
        self.media_state
    }

    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    /// Whether the last session ended because a proctor removed this
    /// participant. Cleared by the next explicit join.
    pub fn was_force_removed(&self) -> bool {
        self.force_removed
    }

    /// Fetch the signed-in profile; a stale result (the controller was
    /// torn down meanwhile) is discarded.
    pub async fn refresh_profile(&mut self) {
        let epoch = self.profile_epoch;
        match self.backend.fetch_profile().await {
            Ok(profile) => {
                if self.profile_epoch == epoch {
                    self.profile = Some(profile);
                } else {
                    tracing::debug!("Discarding stale profile fetch");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to fetch profile"),
        }
    }

    /// Join the exam session. Guests pass their display name and skip the
    /// authenticated endpoints.
    pub async fn join(&mut self, join_code: &str, guest_display_name: Option<&str>) -> Result<()> {
        if self.phase != SessionPhase::Idle {
            return Err(ExamError::InvalidPhase(self.phase.to_string()));
        }
        let join_code = join_code.trim().to_string();
        if join_code.is_empty() {
            return Err(ExamError::MissingJoinCode);
        }
        let guest = match guest_display_name {
            Some(name) => {
                let name = name.trim();
                if name.is_empty() {
                    return Err(ExamError::MissingGuestName);
                }
                Some(name.to_string())
            }
            None => None,
        };

        self.phase = SessionPhase::Joining;
        self.notice = None;
        self.force_removed = false;
        match self.join_inner(&join_code, guest).await {
            Ok(()) => {
                self.join_code = join_code.clone();
                self.phase = SessionPhase::Live;
                tracing::info!(join_code = %join_code, attendee_id = %self.attendee_id, "Examinee joined session");
                Ok(())
            }
            Err(e) => {
                if let Some(capability) = self.capability.take() {
                    release_media(&capability).await;
                    capability.stop().await;
                }
                self.events = None;
                self.phase = SessionPhase::Idle;
                Err(e)
            }
        }
    }

    async fn join_inner(&mut self, join_code: &str, guest: Option<String>) -> Result<()> {
        let (profile, username) = match &guest {
            Some(name) => (
                Profile {
                    display_name: name.clone(),
                    class_name: "guest".to_string(),
                    username: name.clone(),
                },
                name.clone(),
            ),
            None => {
                if self.profile.is_none() {
                    self.refresh_profile().await;
                }
                let profile = self.profile.clone().unwrap_or_default();
                let username = if profile.username.trim().is_empty() {
                    self.username.clone()
                } else {
                    profile.username.clone()
                };
                (profile, username)
            }
        };
        let external_user_id = make_external_user_id(
            Role::Student,
            &profile.display_name,
            &profile.class_name,
            &username,
        );

        let (session, attendee) = if guest.is_some() {
            self.backend.guest_join(join_code, &external_user_id).await?
        } else {
            let session = self.backend.create_session(join_code).await?;
            let attendee = self
                .backend
                .create_attendee(&session.session_id, &external_user_id)
                .await?;
            (session, attendee)
        };

        // Record attendance right after attendee issuance; best-effort,
        // never blocks the join.
        self.attendance_join_code = join_code.to_string();
        self.attendance_attendee_id = attendee.attendee_id.trim().to_string();
        self.attendance_leave_sent = false;
        let record = AttendanceRecord {
            join_code: join_code.to_string(),
            session_id: session.session_id.clone(),
            attendee_id: attendee.attendee_id.clone(),
            external_user_id: external_user_id.clone(),
            role: "examinee".to_string(),
        };
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.attendance_join(&record).await {
                tracing::warn!(error = %e, "Failed to record attendance join");
            }
        });

        let attendee_id = attendee.attendee_id.clone();
        let capability = self
            .connector
            .connect(SessionCredentials {
                session_id: session.session_id,
                attendee_id: attendee.attendee_id,
                external_user_id: external_user_id.clone(),
                join_token: attendee.join_token,
            })
            .await?;
        self.events = Some(capability.events());

        let mut state = MediaState::default();
        if self.media_prefs.join_with_mic {
            match acquire_audio_input(&capability, &self.media_prefs).await {
                Ok(()) => state.mic_ready = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Examinee mic unavailable");
                    state.muted = true;
                }
            }
        } else {
            state.muted = true;
        }

        let mut video_started = false;
        if self.media_prefs.join_with_camera {
            match acquire_video_input(&capability, &mut self.media_prefs).await {
                Ok(()) => video_started = true,
                Err(e) => tracing::warn!(error = %e, "Examinee camera unavailable"),
            }
        }

        capability.start().await?;
        apply_audio_output(&capability, &self.media_prefs).await;
        if video_started {
            capability.start_local_tile().await;
            state.camera_on = true;
        }

        self.attendee_id = normalize_attendee_id(&attendee_id);
        self.external_user_id = external_user_id;
        self.view = ProctorView::new();
        self.chat = ChatLog::new();
        self.media_state = state;
        self.capability = Some(capability);
        Ok(())
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::TileUpdated { tile } => {
                if tile.local && !tile.content {
                    if let Some(capability) = self.capability.clone() {
                        capability.bind_tile(tile.tile_id, SELF_VIEW_SURFACE).await;
                    }
                    return;
                }
                let action = self.view.apply_tile_update(&tile);
                self.run_view_action(action).await;
            }
            SessionEvent::TileRemoved { tile_id } => {
                let action = self.view.apply_tile_removed(tile_id);
                self.run_view_action(action).await;
            }
            SessionEvent::Data { topic, sender_attendee_id, payload } => {
                if topic == CHAT_TOPIC {
                    self.on_chat(&sender_attendee_id, &payload);
                } else if topic == EXAM_CONTROL_TOPIC {
                    self.on_control(&payload).await;
                }
            }
            // The examinee side has no per-participant grid to reconcile.
            SessionEvent::Presence { .. }
            | SessionEvent::Volume { .. }
            | SessionEvent::Started
            | SessionEvent::Stopped
            | SessionEvent::DevicesChanged => {}
        }
    }

    pub async fn pump(&mut self) {
        loop {
            let next = match self.events.as_mut() {
                None => return,
                Some(rx) => rx.try_recv(),
            };
            match next {
                Ok(event) => self.handle_event(event).await,
                Err(_) => return,
            }
        }
    }

    pub async fn run_until_idle(&mut self) {
        loop {
            if self.phase == SessionPhase::Idle {
                return;
            }
            let next = match self.events.as_mut() {
                None => return,
                Some(rx) => rx.recv().await,
            };
            match next {
                Some(event) => self.handle_event(event).await,
                None => return,
            }
        }
    }

    async fn run_view_action(&mut self, action: Option<ProctorViewAction>) {
        let Some(capability) = self.capability.clone() else {
            return;
        };
        match action {
            Some(ProctorViewAction::Bind { tile_id }) => {
                capability.bind_tile(tile_id, PROCTOR_VIEW_SURFACE).await;
            }
            Some(ProctorViewAction::Clear) | None => {}
        }
    }

    /// Switch the active proctor feed by attendee id.
    pub async fn select_proctor(&mut self, attendee_id: &str) {
        let action = self.view.select(attendee_id);
        self.run_view_action(action).await;
    }

    fn on_chat(&mut self, envelope_sender: &str, payload: &[u8]) {
        let Some(msg) = ChatMessage::parse(payload) else {
            tracing::debug!("Dropping malformed chat payload");
            return;
        };
        let sender_raw = if envelope_sender.is_empty() {
            msg.from_attendee_id().to_string()
        } else {
            envelope_sender.to_string()
        };
        let known = self.view.known_proctor_ids();
        if !chat::examinee_accepts(&msg, &sender_raw, &self.attendee_id, &known) {
            return;
        }

        self.chat.record(ChatEntry {
            id: msg.id().to_string(),
            ts: msg.ts().to_string(),
            kind: if msg.is_direct() { ChatKind::Direct } else { ChatKind::Broadcast },
            conversation: CONVERSATION_ALL.to_string(),
            peer_display_name: String::new(),
            from_role: msg.from_role(),
            from_attendee_id: normalize_attendee_id(&sender_raw),
            text: msg.text().to_string(),
        });
    }

    async fn on_control(&mut self, payload: &[u8]) {
        let Some(msg) = ControlMessage::parse(payload) else {
            tracing::debug!("Dropping malformed control payload");
            return;
        };
        if !msg.from_proctor() {
            return;
        }
        match &msg {
            ControlMessage::EndExam { .. } => {
                if self.phase != SessionPhase::Live {
                    return;
                }
                self.notice = Some("The exam has ended.".to_string());
                self.teardown().await;
            }
            ControlMessage::Kick { .. } => {
                if !msg.kick_targets(&self.attendee_id) || self.phase != SessionPhase::Live {
                    return;
                }
                self.force_removed = true;
                self.notice = Some("You were removed from the session by a proctor.".to_string());
                self.teardown().await;
            }
        }
    }

    /// Send a direct message to the proctors.
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        let capability = self
            .capability
            .clone()
            .ok_or_else(|| ExamError::InvalidPhase(self.phase.to_string()))?;
        let msg = chat::compose_direct_to_proctor(&self.attendee_id, text)?;

        self.chat.record_own(ChatEntry {
            id: msg.id().to_string(),
            ts: msg.ts().to_string(),
            kind: ChatKind::Direct,
            conversation: CONVERSATION_ALL.to_string(),
            peer_display_name: String::new(),
            from_role: ChatRole::Examinee,
            from_attendee_id: self.attendee_id.clone(),
            text: msg.text().to_string(),
        });

        capability
            .send_data(CHAT_TOPIC, &msg.to_json()?, self.protocol.chat_lifetime_ms)
            .await
            .map_err(|e| ExamError::DataMessageSend(CHAT_TOPIC.to_string(), e.to_string()))
    }

    pub async fn start_screen_share(&mut self, stream: MediaStreamHandle) -> Result<()> {
        let capability = self
            .capability
            .clone()
            .ok_or_else(|| ExamError::InvalidPhase(self.phase.to_string()))?;
        capability.start_content_share(stream).await?;
        self.media_state.screen_sharing = true;
        Ok(())
    }

    pub async fn stop_screen_share(&mut self) {
        if let Some(capability) = self.capability.clone() {
            capability.stop_content_share().await;
        }
        self.media_state.screen_sharing = false;
    }

    /// Leave the session. Safe when no session exists and safe to call
    /// twice.
    pub async fn leave(&mut self) {
        self.teardown().await;
    }

    /// Best-effort departure notification for the page-unload path. May
    /// race the explicit leave; whichever runs first wins the guard.
    pub fn notify_unload(&mut self) {
        self.send_attendance_leave();
    }

    fn send_attendance_leave(&mut self) {
        if self.attendance_leave_sent {
            return;
        }
        let join_code = self.attendance_join_code.trim().to_string();
        let attendee_id = self.attendance_attendee_id.trim().to_string();
        if join_code.is_empty() || attendee_id.is_empty() {
            return;
        }
        self.attendance_leave_sent = true;
        let backend = Arc::clone(&self.backend);
        tokio::spawn(async move {
            if let Err(e) = backend.attendance_leave(&join_code, &attendee_id).await {
                tracing::warn!(error = %e, "Failed to record attendance leave");
            }
        });
    }

    async fn teardown(&mut self) {
        if self.phase == SessionPhase::Leaving {
            return;
        }
        let Some(capability) = self.capability.take() else {
            self.phase = SessionPhase::Idle;
            return;
        };
        self.phase = SessionPhase::Leaving;
        self.send_attendance_leave();

        release_media(&capability).await;
        capability.stop().await;

        self.events = None;
        self.view.clear();
        self.chat.clear();
        self.media_state = MediaState::default();
        self.media_prefs.preview.release();
        self.profile_epoch += 1;
        self.phase = SessionPhase::Idle;
        tracing::info!(join_code = %self.join_code, "Examinee session torn down");
    }

    pub async fn toggle_mute(&mut self) -> Result<()> {
        let capability = self
            .capability
            .clone()
            .ok_or_else(|| ExamError::InvalidPhase(self.phase.to_string()))?;
        crate::session::controller::toggle_mute(&capability, &mut self.media_state, &self.media_prefs)
            .await
    }

    pub async fn toggle_camera(&mut self) -> Result<()> {
        let capability = self
            .capability
            .clone()
            .ok_or_else(|| ExamError::InvalidPhase(self.phase.to_string()))?;
        crate::session::controller::toggle_camera(
            &capability,
            &mut self.media_state,
            &mut self.media_prefs,
        )
        .await
    }
}
