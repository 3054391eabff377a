pub mod chat;
pub mod control;

pub use chat::{ChatEntry, ChatKind, ChatLog, ChatMessage, ChatRole};
pub use control::ControlMessage;

use chrono::{SecondsFormat, Utc};

/// Topic carrying user-facing chat between proctors and examinees.
pub const CHAT_TOPIC: &str = "exam-chat-v1";

/// Topic carrying administrative commands (end-exam, kick).
pub const EXAM_CONTROL_TOPIC: &str = "exam-control-v1";

/// Maximum chat text length, enforced at the sender.
pub const MAX_CHAT_LEN: usize = 500;

/// Conversation key addressing every participant.
pub const CONVERSATION_ALL: &str = "all";

/// Client-generated unique message id, used for receiver-side dedup.
pub fn make_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current UTC time as the ISO8601 string the wire format carries.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() {
        assert_ne!(make_message_id(), make_message_id());
    }

    #[test]
    fn test_now_iso_shape() {
        let ts = now_iso();
        assert!(ts.ends_with('Z'));
        assert!(ts.contains('T'));
    }
}
