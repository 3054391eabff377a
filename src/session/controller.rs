use std::fmt;
use std::sync::Arc;

use crate::capability::SessionCapability;
use crate::error::Result;
use crate::session::media::{acquire_audio_input, MediaPreferences, MediaState};

/// Lifecycle of one session attempt.
///
/// Every teardown trigger (explicit leave, kick, end-exam, join failure)
/// funnels through the same guarded transitions, so running a teardown
/// twice is structurally a no-op instead of relying on scattered flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Joining,
    Live,
    Leaving,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionPhase::Idle => "Idle",
            SessionPhase::Joining => "Joining",
            SessionPhase::Live => "Live",
            SessionPhase::Leaving => "Leaving",
        };
        f.write_str(name)
    }
}

/// Surface the local self-view binds to.
pub const SELF_VIEW_SURFACE: &str = "self-view";

/// Surface the examinee's active proctor feed binds to.
pub const PROCTOR_VIEW_SURFACE: &str = "proctor-view";

pub fn student_camera_surface(stable_key: &str) -> String {
    format!("student:{stable_key}:camera")
}

pub fn student_screen_surface(stable_key: &str) -> String {
    format!("student:{stable_key}:screen")
}

pub fn co_proctor_surface(attendee_id: &str) -> String {
    format!("proctor:{attendee_id}")
}

/// Best-effort release of all published local media. Every step is
/// non-throwing; teardown must tolerate partially torn-down sessions.
pub(crate) async fn release_media(capability: &Arc<dyn SessionCapability>) {
    capability.stop_content_share().await;
    capability.stop_local_tile().await;
    capability.stop_video_input().await;
    capability.stop_audio_input().await;
}

/// Mute/unmute with lazy device re-acquisition. Muting also releases the
/// microphone; unmuting re-acquires it first when needed.
pub(crate) async fn toggle_mute(
    capability: &Arc<dyn SessionCapability>,
    state: &mut MediaState,
    prefs: &MediaPreferences,
) -> Result<()> {
    if state.muted {
        if !state.mic_ready {
            acquire_audio_input(capability, prefs).await?;
            state.mic_ready = true;
        }
        capability.unmute_local_audio().await;
        state.muted = false;
    } else {
        capability.mute_local_audio().await;
        state.muted = true;
        capability.stop_audio_input().await;
        state.mic_ready = false;
    }
    Ok(())
}

pub(crate) async fn toggle_camera(
    capability: &Arc<dyn SessionCapability>,
    state: &mut MediaState,
    prefs: &mut MediaPreferences,
) -> Result<()> {
    if state.camera_on {
        capability.stop_local_tile().await;
        capability.stop_video_input().await;
        state.camera_on = false;
        return Ok(());
    }
    crate::session::media::acquire_video_input(capability, prefs).await?;
    capability.start_local_tile().await;
    state.camera_on = true;
    Ok(())
}
