pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::BackendConfig;
use crate::error::{ExamError, Result};

/// Profile of the signed-in user, used to build the wire identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub class_name: String,
    #[serde(default)]
    pub username: String,
}

/// Conferencing session located or created for a join code.
#[derive(Debug, Clone)]
pub struct SessionDescriptor {
    pub session_id: String,
}

/// Per-participant credentials issued for a session.
#[derive(Debug, Clone)]
pub struct AttendeeCredentials {
    pub attendee_id: String,
    pub join_token: String,
}

/// Attendance join notification payload.
#[derive(Debug, Clone, Serialize)]
pub struct AttendanceRecord {
    pub join_code: String,
    pub session_id: String,
    pub attendee_id: String,
    pub external_user_id: String,
    pub role: String,
}

/// Backend collaborator consumed by the session controllers. The HTTP
/// paths are an implementation detail of `HttpExamBackend`; the core only
/// relies on these operations existing with these semantics.
#[async_trait]
pub trait ExamBackend: Send + Sync {
    async fn fetch_profile(&self) -> Result<Profile>;

    /// Create or get the session behind a join code. Fails with
    /// `ExamError::SessionEnded` when the session was ended and may not be
    /// rejoined.
    async fn create_session(&self, join_code: &str) -> Result<SessionDescriptor>;

    async fn create_attendee(
        &self,
        session_id: &str,
        external_user_id: &str,
    ) -> Result<AttendeeCredentials>;

    /// Unauthenticated join path for guest examinees.
    async fn guest_join(
        &self,
        join_code: &str,
        external_user_id: &str,
    ) -> Result<(SessionDescriptor, AttendeeCredentials)>;

    async fn attendance_join(&self, record: &AttendanceRecord) -> Result<()>;

    async fn attendance_leave(&self, join_code: &str, attendee_id: &str) -> Result<()>;

    /// Mark the session ended, blocking any future rejoin.
    async fn end_session(&self, join_code: &str) -> Result<()>;
}

/// Classify a non-success backend response. The ended-session marker is
/// surfaced as its own non-retryable error; everything else keeps the raw
/// detail for the user to see.
fn error_for_response(status: reqwest::StatusCode, detail: &str) -> ExamError {
    if detail.contains("already ended") || detail.contains("Meeting ended") {
        return ExamError::SessionEnded;
    }
    ExamError::Backend(format!("{}: {}", status.as_u16(), detail))
}

fn detail_from_body(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(detail) = value.get("detail").and_then(|d| d.as_str()) {
            return detail.to_string();
        }
    }
    body.trim().to_string()
}

#[derive(Deserialize)]
struct MeetingEnvelope {
    #[serde(rename = "Meeting")]
    meeting: MeetingBody,
}

#[derive(Deserialize)]
struct MeetingBody {
    #[serde(rename = "MeetingId")]
    meeting_id: String,
}

#[derive(Deserialize)]
struct AttendeeEnvelope {
    #[serde(rename = "Attendee")]
    attendee: AttendeeBody,
}

#[derive(Deserialize)]
struct AttendeeBody {
    #[serde(rename = "AttendeeId")]
    attendee_id: String,
    #[serde(rename = "JoinToken", default)]
    join_token: String,
}

#[derive(Deserialize)]
struct GuestJoinEnvelope {
    #[serde(rename = "Meeting")]
    meeting: MeetingBody,
    #[serde(rename = "Attendee")]
    attendee: AttendeeBody,
}

/// HTTP implementation of the backend collaborator.
pub struct HttpExamBackend {
    client: reqwest::Client,
    base_url: String,
    auth_token: std::sync::Mutex<Option<String>>,
}

impl HttpExamBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            auth_token: std::sync::Mutex::new(None),
        })
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        *self.auth_token.lock().expect("auth token lock poisoned") = token;
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.auth_token.lock().expect("auth token lock poisoned").clone();
        match token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn post_json(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .authorize(self.client.post(&url).json(&body))
            .send()
            .await?;
        Self::parse_response(response).await
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.authorize(self.client.get(&url)).send().await?;
        Self::parse_response(response).await
    }

    async fn parse_response(response: reqwest::Response) -> Result<serde_json::Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = detail_from_body(&body);
            return Err(error_for_response(status, &detail));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl ExamBackend for HttpExamBackend {
    async fn fetch_profile(&self) -> Result<Profile> {
        let value = self.get_json("/profile").await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn create_session(&self, join_code: &str) -> Result<SessionDescriptor> {
        let value = self
            .post_json("/meetings", json!({ "external_meeting_id": join_code }))
            .await?;
        let envelope: MeetingEnvelope = serde_json::from_value(value)?;
        Ok(SessionDescriptor {
            session_id: envelope.meeting.meeting_id,
        })
    }

    async fn create_attendee(
        &self,
        session_id: &str,
        external_user_id: &str,
    ) -> Result<AttendeeCredentials> {
        let path = format!("/meetings/{}/attendees", urlencoding::encode(session_id));
        let value = self
            .post_json(&path, json!({ "external_user_id": external_user_id }))
            .await?;
        let envelope: AttendeeEnvelope = serde_json::from_value(value)?;
        Ok(AttendeeCredentials {
            attendee_id: envelope.attendee.attendee_id,
            join_token: envelope.attendee.join_token,
        })
    }

    async fn guest_join(
        &self,
        join_code: &str,
        external_user_id: &str,
    ) -> Result<(SessionDescriptor, AttendeeCredentials)> {
        let value = self
            .post_json(
                "/guest/join",
                json!({
                    "external_meeting_id": join_code,
                    "external_user_id": external_user_id,
                }),
            )
            .await?;
        let envelope: GuestJoinEnvelope = serde_json::from_value(value)?;
        Ok((
            SessionDescriptor {
                session_id: envelope.meeting.meeting_id,
            },
            AttendeeCredentials {
                attendee_id: envelope.attendee.attendee_id,
                join_token: envelope.attendee.join_token,
            },
        ))
    }

    async fn attendance_join(&self, record: &AttendanceRecord) -> Result<()> {
        self.post_json(
            "/attendance/join",
            json!({
                "join_code": record.join_code,
                "meeting_id": record.session_id,
                "attendee_id": record.attendee_id,
                "external_user_id": record.external_user_id,
                "role": record.role,
            }),
        )
        .await?;
        Ok(())
    }

    async fn attendance_leave(&self, join_code: &str, attendee_id: &str) -> Result<()> {
        self.post_json(
            "/attendance/leave",
            json!({ "join_code": join_code, "attendee_id": attendee_id }),
        )
        .await?;
        Ok(())
    }

    async fn end_session(&self, join_code: &str) -> Result<()> {
        let path = format!("/scheduled-meetings/{}/end", urlencoding::encode(join_code));
        self.post_json(&path, json!({})).await?;
        Ok(())
    }
}
