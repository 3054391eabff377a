use serde::{Deserialize, Serialize};

use super::{make_message_id, now_iso};
use crate::error::Result;
use crate::identity::normalize_attendee_id;

/// Administrative command over the exam-control topic.
///
/// `end_exam` addresses everyone; `kick` is unicast-by-convention on a
/// broadcast transport, so every recipient must decide for itself whether
/// it is the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "end_exam", rename_all = "camelCase")]
    EndExam {
        id: String,
        ts: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_role: Option<String>,
        from_attendee_id: String,
    },
    #[serde(rename = "kick", rename_all = "camelCase")]
    Kick {
        id: String,
        ts: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_role: Option<String>,
        from_attendee_id: String,
        to_attendee_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_role: Option<String>,
    },
}

impl ControlMessage {
    /// Parse and validate a raw control payload. Anything that is not a
    /// known variant is dropped silently.
    pub fn parse(raw: &[u8]) -> Option<ControlMessage> {
        serde_json::from_slice(raw).ok()
    }

    pub fn end_exam(from_attendee_id: &str) -> ControlMessage {
        ControlMessage::EndExam {
            id: make_message_id(),
            ts: now_iso(),
            from_role: Some("proctor".to_string()),
            from_attendee_id: from_attendee_id.to_string(),
        }
    }

    pub fn kick(from_attendee_id: &str, target_attendee_id: &str, role_hint: Option<&str>) -> ControlMessage {
        ControlMessage::Kick {
            id: make_message_id(),
            ts: now_iso(),
            from_role: Some("proctor".to_string()),
            from_attendee_id: from_attendee_id.to_string(),
            to_attendee_id: normalize_attendee_id(target_attendee_id),
            to_role: role_hint.map(str::to_string),
        }
    }

    /// A command is honored only when its claimed sender role is proctor
    /// (or absent, for tolerance of older senders).
    pub fn from_proctor(&self) -> bool {
        let from_role = match self {
            ControlMessage::EndExam { from_role, .. } | ControlMessage::Kick { from_role, .. } => {
                from_role
            }
        };
        from_role.as_deref().map_or(true, |r| r == "proctor")
    }

    /// Whether a kick targets the given attendee. Both ids are normalized
    /// (transport-appended `#...` suffixes stripped) before comparison; a
    /// kick with no resolvable target matches nobody.
    pub fn kick_targets(&self, my_attendee_id: &str) -> bool {
        match self {
            ControlMessage::Kick { to_attendee_id, .. } => {
                let target = normalize_attendee_id(to_attendee_id);
                let me = normalize_attendee_id(my_attendee_id);
                !target.is_empty() && !me.is_empty() && target == me
            }
            ControlMessage::EndExam { .. } => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rejects_unknown_types() {
        assert!(ControlMessage::parse(b"{}").is_none());
        assert!(ControlMessage::parse(br#"{"type":"reboot","id":"1"}"#).is_none());
        assert!(ControlMessage::parse(b"\x00\x01").is_none());
    }

    #[test]
    fn test_kick_round_trip() {
        let msg = ControlMessage::kick("p1", "s1#content", Some("examinee"));
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"kick""#));
        // Target is normalized before it ever hits the wire.
        assert!(json.contains(r#""toAttendeeId":"s1""#));
        let parsed = ControlMessage::parse(json.as_bytes()).unwrap();
        assert!(parsed.from_proctor());
    }

    #[test]
    fn test_kick_targeting_with_suffixes() {
        let msg = ControlMessage::kick("p1", "abc", None);
        assert!(msg.kick_targets("abc"));
        assert!(msg.kick_targets("abc#123"));
        assert!(!msg.kick_targets("abcd"));
        assert!(!msg.kick_targets(""));
    }

    #[test]
    fn test_end_exam_never_targets() {
        let msg = ControlMessage::end_exam("p1");
        assert!(!msg.kick_targets("p1"));
        assert!(msg.from_proctor());
    }

    #[test]
    fn test_missing_from_role_is_tolerated() {
        let json = br#"{"type":"end_exam","id":"1","ts":"t","fromAttendeeId":"p1"}"#;
        let msg = ControlMessage::parse(json).unwrap();
        assert!(msg.from_proctor());
    }

    #[test]
    fn test_non_proctor_sender_is_rejected() {
        let json =
            br#"{"type":"kick","id":"1","ts":"t","fromRole":"examinee","fromAttendeeId":"s2","toAttendeeId":"s1"}"#;
        let msg = ControlMessage::parse(json).unwrap();
        assert!(!msg.from_proctor());
    }
}
