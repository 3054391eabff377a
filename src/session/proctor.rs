use std::sync::Arc;

use tokio::sync::mpsc;

use crate::backend::{ExamBackend, Profile};
use crate::capability::{
    SessionCapability, SessionConnector, SessionCredentials, SessionEvent,
};
use crate::config::ProtocolConfig;
use crate::error::{ExamError, Result};
use crate::identity::{make_external_user_id, normalize_attendee_id, Role};
use crate::protocol::chat::{self, ChatEntry, ChatKind, ChatMessage, ChatRole};
use crate::protocol::{ChatLog, ControlMessage, CHAT_TOPIC, CONVERSATION_ALL, EXAM_CONTROL_TOPIC};
use crate::session::controller::{
    co_proctor_surface, release_media, student_camera_surface, student_screen_surface,
    SessionPhase, SELF_VIEW_SURFACE,
};
use crate::session::media::{
    acquire_audio_input, acquire_video_input, apply_audio_output, MediaPreferences, MediaState,
};
use crate::session::roster::{ParticipantRoster, RosterAction};

/// Proctor-side session controller: joins a session, reconciles the
/// student grid, routes chat, and issues end-exam/kick commands.
pub struct ProctorController {
    backend: Arc<dyn ExamBackend>,
    connector: Arc<dyn SessionConnector>,
    protocol: ProtocolConfig,
    username: String,

    pub media_prefs: MediaPreferences,
    media_state: MediaState,

    phase: SessionPhase,
    capability: Option<Arc<dyn SessionCapability>>,
    events: Option<mpsc::UnboundedReceiver<SessionEvent>>,

    roster: ParticipantRoster,
    chat: ChatLog,

    profile: Option<Profile>,
    profile_epoch: u64,

    join_code: String,
    attendee_id: String,
    external_user_id: String,
    notice: Option<String>,
}

impl ProctorController {
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
            roster: ParticipantRoster::new(""),
            chat: ChatLog::new(),
            profile: None,
            profile_epoch: 0,
            join_code: String::new(),
            attendee_id: String::new(),
            external_user_id: String::new(),
            notice: None,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn roster(&self) -> &ParticipantRoster {
        &self.roster
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

    /// Pending user-facing notice (forced termination and the like).
    pub fn take_notice(&mut self) -> Option<String> {
        self.notice.take()
    }

    /// Fetch the signed-in profile. A result that lands after the
    /// controller moved on (teardown bumped the epoch) is discarded
    /// instead of overwriting fresher state.
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

    /// Join the session behind `join_code` and start monitoring.
    pub async fn join(&mut self, join_code: &str) -> Result<()> {
        if self.phase != SessionPhase::Idle {
            return Err(ExamError::InvalidPhase(self.phase.to_string()));
        }
        let join_code = join_code.trim().to_string();
        if join_code.is_empty() {
            return Err(ExamError::MissingJoinCode);
        }

        self.phase = SessionPhase::Joining;
        self.notice = None;
        match self.join_inner(&join_code).await {
            Ok(()) => {
                self.join_code = join_code.clone();
                self.phase = SessionPhase::Live;
                tracing::info!(join_code = %join_code, attendee_id = %self.attendee_id, "Proctor joined session");
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

    async fn join_inner(&mut self, join_code: &str) -> Result<()> {
        if self.profile.is_none() {
            self.refresh_profile().await;
        }
        let profile = self.profile.clone().unwrap_or_default();
        let username = if profile.username.trim().is_empty() {
            self.username.clone()
        } else {
            profile.username.clone()
        };
        let external_user_id =
            make_external_user_id(Role::Proctor, &profile.display_name, "", &username);

        let session = self.backend.create_session(join_code).await?;
        let attendee = self
            .backend
            .create_attendee(&session.session_id, &external_user_id)
            .await?;
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

        // Device acquisition failures degrade to mic/camera off; they
        // never abort the join.
        let mut state = MediaState::default();
        if self.media_prefs.join_with_mic {
            match acquire_audio_input(&capability, &self.media_prefs).await {
                Ok(()) => state.mic_ready = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Proctor mic unavailable");
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
                Err(e) => tracing::warn!(error = %e, "Proctor camera unavailable"),
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
        self.roster = ParticipantRoster::new(&self.attendee_id);
        self.chat = ChatLog::new();
        self.media_state = state;
        self.capability = Some(capability);
        Ok(())
    }

    /// Process one capability event.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Presence { attendee_id, present, external_user_id } => {
                let actions = self.roster.apply_presence(&attendee_id, present, &external_user_id);
                self.run_roster_actions(actions).await;
            }
            SessionEvent::TileUpdated { tile } => {
                let actions = self.roster.apply_tile_update(&tile);
                self.run_roster_actions(actions).await;
            }
            SessionEvent::TileRemoved { tile_id } => self.roster.apply_tile_removed(tile_id),
            SessionEvent::Volume { attendee_id, muted, .. } => {
                self.roster.apply_volume(&attendee_id, muted)
            }
            SessionEvent::Data { topic, sender_attendee_id, payload } => {
                if topic == CHAT_TOPIC {
                    self.on_chat(&sender_attendee_id, &payload);
                } else if topic == EXAM_CONTROL_TOPIC {
                    self.on_control(&payload).await;
                }
            }
            SessionEvent::Started | SessionEvent::Stopped | SessionEvent::DevicesChanged => {}
        }
    }

    /// Drain and handle every already-queued event.
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

    /// Handle events until the session leaves the Live phase.
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

    async fn run_roster_actions(&mut self, actions: Vec<RosterAction>) {
        let Some(capability) = self.capability.clone() else {
            return;
        };
        for action in actions {
            match action {
                RosterAction::SubscribeVolume(attendee_id) => {
                    capability.subscribe_volume(&attendee_id).await
                }
                RosterAction::UnsubscribeVolume(attendee_id) => {
                    capability.unsubscribe_volume(&attendee_id).await
                }
                RosterAction::BindSelfView { tile_id } => {
                    capability.bind_tile(tile_id, SELF_VIEW_SURFACE).await
                }
                RosterAction::BindStudentCamera { stable_key, tile_id } => {
                    capability
                        .bind_tile(tile_id, &student_camera_surface(&stable_key))
                        .await
                }
                RosterAction::BindStudentScreen { stable_key, tile_id } => {
                    capability
                        .bind_tile(tile_id, &student_screen_surface(&stable_key))
                        .await
                }
                RosterAction::BindCoProctor { attendee_id, tile_id } => {
                    capability
                        .bind_tile(tile_id, &co_proctor_surface(&attendee_id))
                        .await
                }
            }
        }
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
        if !chat::proctor_accepts(&msg, &sender_raw) {
            return;
        }
        let sender_id = normalize_attendee_id(&sender_raw);

        let (conversation, peer_display_name) = match &msg {
            ChatMessage::Broadcast { .. } => (CONVERSATION_ALL.to_string(), String::new()),
            ChatMessage::Direct { .. } if msg.from_role() == ChatRole::Examinee => (
                self.roster.stable_key_for_attendee(&sender_id),
                self.roster.display_name_for_attendee(&sender_id),
            ),
            ChatMessage::Direct { to_attendee_id, .. } => {
                let to = to_attendee_id.clone().unwrap_or_default();
                (
                    self.roster.stable_key_for_attendee(&to),
                    self.roster.display_name_for_attendee(&to),
                )
            }
        };

        let incoming_from_examinee = msg.from_role() == ChatRole::Examinee && msg.is_direct();
        let entry = ChatEntry {
            id: msg.id().to_string(),
            ts: msg.ts().to_string(),
            kind: if msg.is_direct() { ChatKind::Direct } else { ChatKind::Broadcast },
            conversation: conversation.clone(),
            peer_display_name,
            from_role: msg.from_role(),
            from_attendee_id: sender_id,
            text: msg.text().to_string(),
        };
        if self.chat.record(entry) && incoming_from_examinee {
            self.chat.bump_unread(&conversation);
        }
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
                self.notice = Some("You were removed from the session by a proctor.".to_string());
                self.teardown().await;
            }
        }
    }

    /// Select which conversation outgoing chat goes to (`"all"` or a
    /// student stable key). Also clears its unread counter.
    pub fn set_chat_target(&mut self, key: &str) {
        self.chat.set_active_conversation(key);
    }

    /// Send the draft to the active conversation.
    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        let capability = self
            .capability
            .clone()
            .ok_or_else(|| ExamError::InvalidPhase(self.phase.to_string()))?;

        let target = self.chat.active_conversation().to_string();
        let (msg, peer_display_name) = if target == CONVERSATION_ALL {
            (chat::compose_broadcast(&self.attendee_id, text)?, String::new())
        } else {
            let record = self
                .roster
                .student(&target)
                .ok_or(ExamError::ChatTargetUnavailable)?;
            if record.attendee_id.is_empty() {
                return Err(ExamError::ChatTargetUnavailable);
            }
            let name = record.display_name();
            let to = record.attendee_id.clone();
            (
                chat::compose_direct_to_examinee(&self.attendee_id, &to, text)?,
                name,
            )
        };

        self.chat.record_own(ChatEntry {
            id: msg.id().to_string(),
            ts: msg.ts().to_string(),
            kind: if msg.is_direct() { ChatKind::Direct } else { ChatKind::Broadcast },
            conversation: target,
            peer_display_name,
            from_role: ChatRole::Proctor,
            from_attendee_id: self.attendee_id.clone(),
            text: msg.text().to_string(),
        });

        capability
            .send_data(CHAT_TOPIC, &msg.to_json()?, self.protocol.chat_lifetime_ms)
            .await
            .map_err(|e| ExamError::DataMessageSend(CHAT_TOPIC.to_string(), e.to_string()))
    }

    /// Force-remove a participant. Kicking yourself is refused silently.
    pub async fn kick_participant(&mut self, attendee_id: &str, role_hint: Option<&str>) -> Result<()> {
        let capability = self
            .capability
            .clone()
            .ok_or_else(|| ExamError::InvalidPhase(self.phase.to_string()))?;
        let target = normalize_attendee_id(attendee_id);
        if target.is_empty() || target == self.attendee_id {
            return Ok(());
        }
        let msg = ControlMessage::kick(&self.attendee_id, &target, role_hint);
        tracing::info!(target = %target, "Kicking participant");
        capability
            .send_data(EXAM_CONTROL_TOPIC, &msg.to_json()?, self.protocol.control_lifetime_ms)
            .await
            .map_err(|e| ExamError::DataMessageSend(EXAM_CONTROL_TOPIC.to_string(), e.to_string()))
    }

    /// End the exam for everyone: broadcast the command, persist the ended
    /// state on the backend (so rejoin is blocked), then tear down
    /// locally. A backend failure still tears down but is surfaced, since
    /// silently failing would let the exam be rejoined.
    pub async fn end_exam(&mut self) -> Result<()> {
        if self.phase != SessionPhase::Live {
            return Ok(());
        }
        if let Some(capability) = self.capability.clone() {
            let msg = ControlMessage::end_exam(&self.attendee_id);
            if let Ok(json) = msg.to_json() {
                if let Err(e) = capability
                    .send_data(EXAM_CONTROL_TOPIC, &json, self.protocol.control_lifetime_ms)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to broadcast end-exam");
                }
            }
        }

        let backend_result = self
            .backend
            .end_session(&self.join_code)
            .await
            .map_err(|e| ExamError::EndSessionFailed(e.to_string()));

        self.teardown().await;
        backend_result
    }

    /// Leave the session. Safe when no session exists and safe to call
    /// twice.
    pub async fn leave(&mut self) {
        self.teardown().await;
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

        release_media(&capability).await;
        for attendee_id in self.roster.drain_volume_subscriptions() {
            capability.unsubscribe_volume(&attendee_id).await;
        }
        capability.stop().await;

        self.events = None;
        self.roster.clear();
        self.chat.clear();
        self.media_state = MediaState::default();
        self.media_prefs.preview.release();
        self.profile_epoch += 1;
        self.phase = SessionPhase::Idle;
        tracing::info!(join_code = %self.join_code, "Proctor session torn down");
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
