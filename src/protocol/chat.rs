use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::{make_message_id, now_iso, CONVERSATION_ALL, MAX_CHAT_LEN};
use crate::error::{ExamError, Result};
use crate::identity::normalize_attendee_id;

/// Sender/recipient role as it appears on the chat wire.
///
/// Note the asymmetry with identity prefixes: identity strings say
/// `student`, the chat protocol says `examinee`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    Proctor,
    Examinee,
}

/// Chat payload over the chat topic.
///
/// A tagged union rather than a loose JSON blob: anything that does not
/// match a known variant is rejected at the parse boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChatMessage {
    #[serde(rename = "broadcast", rename_all = "camelCase")]
    Broadcast {
        id: String,
        ts: String,
        from_role: ChatRole,
        from_attendee_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_role: Option<String>,
        text: String,
    },
    #[serde(rename = "direct", rename_all = "camelCase")]
    Direct {
        id: String,
        ts: String,
        from_role: ChatRole,
        from_attendee_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_role: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to_attendee_id: Option<String>,
        text: String,
    },
}

impl ChatMessage {
    /// Parse and validate a raw data-message payload. Returns `None` for
    /// anything malformed; the receive path must never fail on bad input.
    pub fn parse(raw: &[u8]) -> Option<ChatMessage> {
        let msg: ChatMessage = serde_json::from_slice(raw).ok()?;
        if msg.id().is_empty() {
            return None;
        }
        Some(msg)
    }

    pub fn id(&self) -> &str {
        match self {
            ChatMessage::Broadcast { id, .. } | ChatMessage::Direct { id, .. } => id,
        }
    }

    pub fn ts(&self) -> &str {
        match self {
            ChatMessage::Broadcast { ts, .. } | ChatMessage::Direct { ts, .. } => ts,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ChatMessage::Broadcast { text, .. } | ChatMessage::Direct { text, .. } => text,
        }
    }

    pub fn from_role(&self) -> ChatRole {
        match self {
            ChatMessage::Broadcast { from_role, .. } | ChatMessage::Direct { from_role, .. } => {
                *from_role
            }
        }
    }

    pub fn from_attendee_id(&self) -> &str {
        match self {
            ChatMessage::Broadcast { from_attendee_id, .. }
            | ChatMessage::Direct { from_attendee_id, .. } => from_attendee_id,
        }
    }

    pub fn to_role(&self) -> Option<&str> {
        match self {
            ChatMessage::Broadcast { to_role, .. } | ChatMessage::Direct { to_role, .. } => {
                to_role.as_deref()
            }
        }
    }

    pub fn to_attendee_id(&self) -> Option<&str> {
        match self {
            ChatMessage::Broadcast { .. } => None,
            ChatMessage::Direct { to_attendee_id, .. } => to_attendee_id.as_deref(),
        }
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, ChatMessage::Direct { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn validate_text(text: &str) -> Result<String> {
    let trimmed = text.trim();
    if trimmed.chars().count() > MAX_CHAT_LEN {
        return Err(ExamError::ChatTooLong(MAX_CHAT_LEN));
    }
    Ok(trimmed.to_string())
}

/// Proctor broadcast to everyone in the session.
pub fn compose_broadcast(from_attendee_id: &str, text: &str) -> Result<ChatMessage> {
    Ok(ChatMessage::Broadcast {
        id: make_message_id(),
        ts: now_iso(),
        from_role: ChatRole::Proctor,
        from_attendee_id: from_attendee_id.to_string(),
        to_role: Some("all".to_string()),
        text: validate_text(text)?,
    })
}

/// Proctor direct message addressed to one examinee attendee id.
pub fn compose_direct_to_examinee(
    from_attendee_id: &str,
    to_attendee_id: &str,
    text: &str,
) -> Result<ChatMessage> {
    Ok(ChatMessage::Direct {
        id: make_message_id(),
        ts: now_iso(),
        from_role: ChatRole::Proctor,
        from_attendee_id: from_attendee_id.to_string(),
        to_role: Some("examinee".to_string()),
        to_attendee_id: Some(normalize_attendee_id(to_attendee_id)),
        text: validate_text(text)?,
    })
}

/// Examinee direct message to the proctors. The proctor attendee id may be
/// unknown on the examinee side; proctors filter by role instead.
pub fn compose_direct_to_proctor(from_attendee_id: &str, text: &str) -> Result<ChatMessage> {
    Ok(ChatMessage::Direct {
        id: make_message_id(),
        ts: now_iso(),
        from_role: ChatRole::Examinee,
        from_attendee_id: from_attendee_id.to_string(),
        to_role: Some("proctor".to_string()),
        to_attendee_id: None,
        text: validate_text(text)?,
    })
}

/// Receiver-side admission filter on the examinee side.
///
/// Only proctor broadcasts and proctor directs addressed to this attendee
/// pass. When one or more proctor attendee ids are already known from the
/// roster, a message whose transport sender is not among them is discarded;
/// this is advisory spoofing protection, not authentication.
pub fn examinee_accepts(
    msg: &ChatMessage,
    envelope_sender_id: &str,
    my_attendee_id: &str,
    known_proctor_ids: &HashSet<String>,
) -> bool {
    if msg.from_role() != ChatRole::Proctor {
        return false;
    }

    let sender = normalize_attendee_id(envelope_sender_id);
    if !known_proctor_ids.is_empty() && !sender.is_empty() {
        let known = known_proctor_ids
            .iter()
            .any(|id| normalize_attendee_id(id) == sender);
        if !known {
            return false;
        }
    }

    match msg {
        ChatMessage::Broadcast { .. } => true,
        ChatMessage::Direct { to_role, to_attendee_id, .. } => {
            let me = normalize_attendee_id(my_attendee_id);
            to_role.as_deref() == Some("examinee")
                && !me.is_empty()
                && to_attendee_id
                    .as_deref()
                    .map(normalize_attendee_id)
                    .is_some_and(|to| to == me)
        }
    }
}

/// Receiver-side admission filter on the proctor side.
///
/// Accepts examinee-to-proctor directs (which must be attributable to a
/// concrete sender attendee id) and anything sent by a proctor, so the
/// shared log shows echoes and co-proctor sends.
pub fn proctor_accepts(msg: &ChatMessage, envelope_sender_id: &str) -> bool {
    match msg.from_role() {
        ChatRole::Proctor => true,
        ChatRole::Examinee => {
            msg.is_direct()
                && msg.to_role() == Some("proctor")
                && !normalize_attendee_id(envelope_sender_id).is_empty()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Broadcast,
    Direct,
}

/// One applied entry in a participant's chat pane state.
#[derive(Debug, Clone)]
pub struct ChatEntry {
    pub id: String,
    pub ts: String,
    pub kind: ChatKind,
    /// `"all"` or the stable key of the student conversation.
    pub conversation: String,
    pub peer_display_name: String,
    pub from_role: ChatRole,
    pub from_attendee_id: String,
    pub text: String,
}

/// Per-session chat state: applied entries, the dedup seen-set that makes
/// at-least-once delivery idempotent, and per-conversation unread counts.
#[derive(Debug, Default)]
pub struct ChatLog {
    seen_ids: HashSet<String>,
    entries: Vec<ChatEntry>,
    unread: HashMap<String, u32>,
    active_conversation: String,
}

impl ChatLog {
    pub fn new() -> Self {
        Self {
            seen_ids: HashSet::new(),
            entries: Vec::new(),
            unread: HashMap::new(),
            active_conversation: CONVERSATION_ALL.to_string(),
        }
    }

    /// Mark the sender's own id as seen before transmission so the echo of
    /// a locally-appended message is never applied twice.
    pub fn note_own(&mut self, id: &str) {
        self.seen_ids.insert(id.to_string());
    }

    /// Append the sender's own message immediately, without waiting for a
    /// transport echo; the id goes into the seen-set so a later echo is a
    /// no-op.
    pub fn record_own(&mut self, entry: ChatEntry) {
        self.seen_ids.insert(entry.id.clone());
        self.entries.push(entry);
    }

    /// Append an entry unless its id was already applied. Returns whether
    /// the entry was appended.
    pub fn record(&mut self, entry: ChatEntry) -> bool {
        if !self.seen_ids.insert(entry.id.clone()) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn set_active_conversation(&mut self, key: &str) {
        self.active_conversation = key.to_string();
        self.unread.remove(key);
    }

    pub fn active_conversation(&self) -> &str {
        &self.active_conversation
    }

    /// Bump the unread counter for a conversation unless it is the active
    /// one.
    pub fn bump_unread(&mut self, key: &str) {
        if key.is_empty() || key == self.active_conversation {
            return;
        }
        *self.unread.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn unread(&self, key: &str) -> u32 {
        self.unread.get(key).copied().unwrap_or(0)
    }

    pub fn total_unread(&self) -> u32 {
        self.unread
            .iter()
            .filter(|(key, _)| key.as_str() != self.active_conversation)
            .map(|(_, count)| count)
            .sum()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn entries_for(&self, conversation: &str) -> Vec<&ChatEntry> {
        self.entries
            .iter()
            .filter(|e| e.conversation == conversation)
            .collect()
    }

    pub fn clear(&mut self) {
        self.seen_ids.clear();
        self.entries.clear();
        self.unread.clear();
        self.active_conversation = CONVERSATION_ALL.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_from(msg: &ChatMessage) -> ChatEntry {
        ChatEntry {
            id: msg.id().to_string(),
            ts: msg.ts().to_string(),
            kind: if msg.is_direct() { ChatKind::Direct } else { ChatKind::Broadcast },
            conversation: CONVERSATION_ALL.to_string(),
            peer_display_name: String::new(),
            from_role: msg.from_role(),
            from_attendee_id: msg.from_attendee_id().to_string(),
            text: msg.text().to_string(),
        }
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ChatMessage::parse(b"not json").is_none());
        assert!(ChatMessage::parse(b"{}").is_none());
        assert!(ChatMessage::parse(br#"{"type":"mystery","id":"1"}"#).is_none());
        // Missing text field.
        assert!(ChatMessage::parse(
            br#"{"type":"broadcast","id":"1","ts":"t","fromRole":"proctor","fromAttendeeId":"a"}"#
        )
        .is_none());
        // Empty id.
        assert!(ChatMessage::parse(
            br#"{"type":"broadcast","id":"","ts":"t","fromRole":"proctor","fromAttendeeId":"a","text":"hi"}"#
        )
        .is_none());
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let msg = compose_direct_to_examinee("p1", "s1#x", "hello").unwrap();
        let json = msg.to_json().unwrap();
        assert!(json.contains(r#""type":"direct""#));
        assert!(json.contains(r#""fromRole":"proctor""#));
        assert!(json.contains(r#""toAttendeeId":"s1""#));
        let parsed = ChatMessage::parse(json.as_bytes()).unwrap();
        assert_eq!(parsed.text(), "hello");
    }

    #[test]
    fn test_compose_rejects_overlong_text() {
        let text = "あ".repeat(MAX_CHAT_LEN + 1);
        assert!(matches!(
            compose_broadcast("p1", &text),
            Err(ExamError::ChatTooLong(_))
        ));
        // Exactly at the limit is fine, counted in characters not bytes.
        assert!(compose_broadcast("p1", &"あ".repeat(MAX_CHAT_LEN)).is_ok());
    }

    #[test]
    fn test_duplicate_delivery_applies_once() {
        let msg = compose_broadcast("p1", "hello").unwrap();
        let mut log = ChatLog::new();
        assert!(log.record(entry_from(&msg)));
        for _ in 0..3 {
            assert!(!log.record(entry_from(&msg)));
        }
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn test_own_echo_not_applied() {
        let msg = compose_direct_to_proctor("s1", "help").unwrap();
        let mut log = ChatLog::new();
        log.note_own(msg.id());
        assert!(!log.record(entry_from(&msg)));
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_examinee_filter_roles() {
        let known = HashSet::new();
        let from_examinee = compose_direct_to_proctor("s2", "psst").unwrap();
        assert!(!examinee_accepts(&from_examinee, "s2", "s1", &known));

        let broadcast = compose_broadcast("p1", "hello all").unwrap();
        assert!(examinee_accepts(&broadcast, "p1", "s1", &known));

        let direct_to_me = compose_direct_to_examinee("p1", "s1", "you").unwrap();
        assert!(examinee_accepts(&direct_to_me, "p1", "s1", &known));

        let direct_to_other = compose_direct_to_examinee("p1", "s2", "them").unwrap();
        assert!(!examinee_accepts(&direct_to_other, "p1", "s1", &known));
    }

    #[test]
    fn test_examinee_filter_normalizes_target_id() {
        let known = HashSet::new();
        let direct = compose_direct_to_examinee("p1", "s1", "you").unwrap();
        assert!(examinee_accepts(&direct, "p1", "s1#content", &known));
    }

    #[test]
    fn test_examinee_filter_spoofing_guard() {
        let mut known = HashSet::new();
        known.insert("p1".to_string());

        let spoofed = compose_broadcast("attacker", "obey").unwrap();
        assert!(!examinee_accepts(&spoofed, "attacker", "s1", &known));
        // Same payload from a roster-known sender passes.
        let legit = compose_broadcast("p1", "hello").unwrap();
        assert!(examinee_accepts(&legit, "p1#dup", "s1", &known));
    }

    #[test]
    fn test_proctor_filter() {
        let from_examinee = compose_direct_to_proctor("s1", "question").unwrap();
        assert!(proctor_accepts(&from_examinee, "s1"));
        // Examinee directs must be attributable to a sender id.
        assert!(!proctor_accepts(&from_examinee, ""));

        let own_echo = compose_broadcast("p1", "hello").unwrap();
        assert!(proctor_accepts(&own_echo, "p1"));

        // An examinee-tagged broadcast is never admitted.
        let json = br#"{"type":"broadcast","id":"x1","ts":"t","fromRole":"examinee","fromAttendeeId":"s1","text":"spam"}"#;
        let msg = ChatMessage::parse(json).unwrap();
        assert!(!proctor_accepts(&msg, "s1"));
    }

    #[test]
    fn test_unread_counters() {
        let mut log = ChatLog::new();
        log.bump_unread("student:a:b");
        log.bump_unread("student:a:b");
        log.bump_unread("all"); // active conversation, ignored
        assert_eq!(log.unread("student:a:b"), 2);
        assert_eq!(log.total_unread(), 2);

        log.set_active_conversation("student:a:b");
        assert_eq!(log.unread("student:a:b"), 0);
        assert_eq!(log.total_unread(), 0);
    }
}
