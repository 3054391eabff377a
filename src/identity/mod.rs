use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// UTF-8 byte budget for the display-name token inside an external user id.
/// The conferencing backend caps the full identity string, and multi-byte
/// scripts blow past a character-based cap long before a byte-based one.
pub const NAME_TOKEN_MAX_BYTES: usize = 24;

/// UTF-8 byte budget for the class token.
pub const CLASS_TOKEN_MAX_BYTES: usize = 18;

/// Character cap applied before byte truncation.
const TOKEN_PART_MAX_CHARS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Student,
    Proctor,
}

impl Role {
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Proctor => "proctor",
        }
    }
}

/// Role classification of an external user id by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantClass {
    Student,
    Proctor,
    Unknown,
}

/// Trim, collapse internal whitespace runs, and cap the length of a raw
/// token part before encoding.
pub fn sanitize_token_part(value: &str) -> String {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(TOKEN_PART_MAX_CHARS).collect()
}

/// Truncate to at most `max_bytes` UTF-8 bytes, backing off to the nearest
/// codepoint boundary so multi-byte characters are never cut in half.
fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Encode one token part: sanitize, truncate by bytes, then base64url
/// without padding. An empty input encodes the literal fallback "User" so
/// the identity string always keeps its `role:token:...` shape.
pub fn encode_token(value: &str, max_bytes: usize) -> String {
    let sanitized = sanitize_token_part(value);
    let truncated = truncate_utf8(&sanitized, max_bytes);
    if truncated.is_empty() {
        return URL_SAFE_NO_PAD.encode("User");
    }
    URL_SAFE_NO_PAD.encode(truncated)
}

/// FNV-1a 32-bit over the lower-cased, trimmed username, as fixed-width hex.
///
/// Non-cryptographic on purpose: this only needs to give the same human a
/// stable token across reconnects without embedding the raw username.
pub fn stable_user_key(username: &str) -> String {
    let normalized = username.trim().to_lowercase();
    let mut hash: u32 = 0x811c_9dc5;
    for byte in normalized.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("{hash:08x}")
}

/// Build the wire identity string for a participant.
///
/// Students carry `student:<nameTok>:<classTok>:<rand>`; proctors swap the
/// class token for a login-derived stability key so the same proctor keeps
/// a consistent identity across reconnects.
pub fn make_external_user_id(
    role: Role,
    display_name: &str,
    class_name: &str,
    username: &str,
) -> String {
    let fallback_name = if username.trim().is_empty() { "User" } else { username };
    let name_source = if display_name.trim().is_empty() { fallback_name } else { display_name };
    let name_token = encode_token(name_source, NAME_TOKEN_MAX_BYTES);
    let rand_suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);

    match role {
        Role::Proctor => {
            let user_key = stable_user_key(if username.trim().is_empty() { "User" } else { username });
            format!("proctor:{name_token}:{user_key}:{rand_suffix}")
        }
        Role::Student => {
            let class_source = if class_name.trim().is_empty() { "class" } else { class_name };
            let class_token = encode_token(class_source, CLASS_TOKEN_MAX_BYTES);
            format!("student:{name_token}:{class_token}:{rand_suffix}")
        }
    }
}

/// Decode the display name out of an external user id.
///
/// Strips any transport-appended `#...` suffix first. Unstructured or
/// legacy ids (`student-123`) come back unchanged; a token that fails to
/// decode comes back raw. This function never fails.
pub fn decode_display_name(external_user_id: &str) -> String {
    let base = external_user_id.split('#').next().unwrap_or_default();
    let parts: Vec<&str> = base.split(':').collect();
    if parts.len() >= 2 && (parts[0] == "student" || parts[0] == "proctor") {
        let token = parts[1];
        if token.is_empty() {
            return base.to_string();
        }
        return match URL_SAFE_NO_PAD.decode(token) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(decoded) if !decoded.is_empty() => decoded,
                _ => token.to_string(),
            },
            Err(_) => token.to_string(),
        };
    }
    base.to_string()
}

/// Derive the stable key that identifies the same student across rejoins.
///
/// The random suffix differs on every connect, so the key keeps only the
/// role, name token and class token. Ids without that shape (legacy or
/// proctor ids) fall back to the raw base string.
pub fn stable_student_key(external_user_id: &str) -> String {
    let base = external_user_id.split('#').next().unwrap_or_default();
    let parts: Vec<&str> = base.split(':').collect();
    if parts.len() >= 4 && parts[0] == "student" {
        return format!("{}:{}:{}", parts[0], parts[1], parts[2]);
    }
    base.to_string()
}

/// Strip the transport-appended sub-stream suffix (`#content` and the
/// like) from an attendee id before comparisons.
pub fn normalize_attendee_id(attendee_id: &str) -> String {
    attendee_id
        .trim()
        .split('#')
        .next()
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Classify an external user id by its role prefix, accepting both the
/// structured `role:` form and the legacy `role-` form.
pub fn classify(external_user_id: &str) -> ParticipantClass {
    let base = external_user_id.split('#').next().unwrap_or_default();
    if base.starts_with("student:") || base.starts_with("student-") {
        ParticipantClass::Student
    } else if base.starts_with("proctor:") || base.starts_with("proctor-") {
        ParticipantClass::Proctor
    } else {
        ParticipantClass::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_ascii() {
        let id = make_external_user_id(Role::Student, "John Doe", "3-B", "john");
        assert_eq!(decode_display_name(&id), "John Doe");
    }

    #[test]
    fn test_round_trip_multibyte() {
        let id = make_external_user_id(Role::Student, "山田太郎", "3年B組", "yamada");
        assert_eq!(decode_display_name(&id), "山田太郎");
    }

    #[test]
    fn test_truncation_lands_on_codepoint_boundary() {
        // Ten kanji are 30 UTF-8 bytes; the 24-byte budget keeps exactly 8.
        let name = "試験監督試験監督試験";
        let id = make_external_user_id(Role::Student, name, "c", "u");
        let decoded = decode_display_name(&id);
        assert_eq!(decoded, "試験監督試験監督");
        assert!(decoded.len() <= NAME_TOKEN_MAX_BYTES);
    }

    #[test]
    fn test_proctor_round_trip() {
        let id = make_external_user_id(Role::Proctor, "監督 花子", "", "hanako@example.com");
        assert_eq!(decode_display_name(&id), "監督 花子");
    }

    #[test]
    fn test_sanitize_collapses_whitespace() {
        assert_eq!(sanitize_token_part("  a \t b\n c  "), "a b c");
    }

    #[test]
    fn test_empty_name_falls_back() {
        let id = make_external_user_id(Role::Student, "", "", "");
        assert_eq!(decode_display_name(&id), "User");
    }

    #[test]
    fn test_decode_legacy_ids_unchanged() {
        assert_eq!(decode_display_name("student-123"), "student-123");
        assert_eq!(decode_display_name("proctor-9"), "proctor-9");
    }

    #[test]
    fn test_decode_strips_transport_suffix() {
        let id = make_external_user_id(Role::Student, "Alice", "c", "u");
        let with_suffix = format!("{id}#content");
        assert_eq!(decode_display_name(&with_suffix), "Alice");
    }

    #[test]
    fn test_decode_bad_token_returns_it_raw() {
        assert_eq!(decode_display_name("student:???:c:1"), "???");
    }

    #[test]
    fn test_decode_arbitrary_string_returns_itself() {
        assert_eq!(decode_display_name("whatever"), "whatever");
    }

    #[test]
    fn test_stable_key_survives_rejoin() {
        let a = make_external_user_id(Role::Student, "山田太郎", "3-B", "u");
        let b = make_external_user_id(Role::Student, "山田太郎", "3-B", "u");
        // Random suffixes differ, stable keys must not.
        assert_eq!(stable_student_key(&a), stable_student_key(&b));
    }

    #[test]
    fn test_stable_key_falls_back_for_legacy_ids() {
        assert_eq!(stable_student_key("student-123"), "student-123");
        assert_eq!(stable_student_key("student-123#content"), "student-123");
    }

    #[test]
    fn test_stable_user_key_known_vectors() {
        // FNV-1a 32-bit offset basis for the empty string.
        assert_eq!(stable_user_key(""), "811c9dc5");
        assert_eq!(stable_user_key("a"), "e40c292c");
        // Case and surrounding whitespace do not change the key.
        assert_eq!(stable_user_key(" Alice "), stable_user_key("alice"));
    }

    #[test]
    fn test_normalize_attendee_id() {
        assert_eq!(normalize_attendee_id(" abc#content "), "abc");
        assert_eq!(normalize_attendee_id("abc"), "abc");
        assert_eq!(normalize_attendee_id(""), "");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("student:dG9t:YQ:1"), ParticipantClass::Student);
        assert_eq!(classify("proctor-7"), ParticipantClass::Proctor);
        assert_eq!(classify("mediapipeline:x"), ParticipantClass::Unknown);
    }
}
