//! In-memory backend collaborator for the simulator and tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    AttendanceRecord, AttendeeCredentials, ExamBackend, Profile, SessionDescriptor,
};
use crate::error::{ExamError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttendanceEvent {
    Join { join_code: String, attendee_id: String, role: String },
    Leave { join_code: String, attendee_id: String },
}

struct MemoryState {
    next_attendee: u32,
    sessions: HashMap<String, String>,
    ended: HashSet<String>,
    attendance: Vec<AttendanceEvent>,
}

/// Backend that issues credentials from memory and tracks ended sessions,
/// so a full join/leave/end flow can run without a network.
pub struct InMemoryBackend {
    profile: Profile,
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            state: Mutex::new(MemoryState {
                next_attendee: 1,
                sessions: HashMap::new(),
                ended: HashSet::new(),
                attendance: Vec::new(),
            }),
        }
    }

    pub fn attendance_events(&self) -> Vec<AttendanceEvent> {
        self.state.lock().expect("memory backend poisoned").attendance.clone()
    }

    fn issue(&self, join_code: &str) -> Result<(SessionDescriptor, AttendeeCredentials)> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        if state.ended.contains(join_code) {
            return Err(ExamError::SessionEnded);
        }
        let session_id = state
            .sessions
            .entry(join_code.to_string())
            .or_insert_with(|| format!("session-{join_code}"))
            .clone();
        let attendee_id = format!("att-{}", state.next_attendee);
        state.next_attendee += 1;
        Ok((
            SessionDescriptor { session_id },
            AttendeeCredentials {
                attendee_id,
                join_token: "token".to_string(),
            },
        ))
    }
}

#[async_trait]
impl ExamBackend for InMemoryBackend {
    async fn fetch_profile(&self) -> Result<Profile> {
        Ok(self.profile.clone())
    }

    async fn create_session(&self, join_code: &str) -> Result<SessionDescriptor> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        if state.ended.contains(join_code) {
            return Err(ExamError::SessionEnded);
        }
        let session_id = state
            .sessions
            .entry(join_code.to_string())
            .or_insert_with(|| format!("session-{join_code}"))
            .clone();
        Ok(SessionDescriptor { session_id })
    }

    async fn create_attendee(
        &self,
        _session_id: &str,
        _external_user_id: &str,
    ) -> Result<AttendeeCredentials> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        let attendee_id = format!("att-{}", state.next_attendee);
        state.next_attendee += 1;
        Ok(AttendeeCredentials {
            attendee_id,
            join_token: "token".to_string(),
        })
    }

    async fn guest_join(
        &self,
        join_code: &str,
        _external_user_id: &str,
    ) -> Result<(SessionDescriptor, AttendeeCredentials)> {
        self.issue(join_code)
    }

    async fn attendance_join(&self, record: &AttendanceRecord) -> Result<()> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.attendance.push(AttendanceEvent::Join {
            join_code: record.join_code.clone(),
            attendee_id: record.attendee_id.clone(),
            role: record.role.clone(),
        });
        Ok(())
    }

    async fn attendance_leave(&self, join_code: &str, attendee_id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.attendance.push(AttendanceEvent::Leave {
            join_code: join_code.to_string(),
            attendee_id: attendee_id.to_string(),
        });
        Ok(())
    }

    async fn end_session(&self, join_code: &str) -> Result<()> {
        let mut state = self.state.lock().expect("memory backend poisoned");
        state.ended.insert(join_code.to_string());
        Ok(())
    }
}
