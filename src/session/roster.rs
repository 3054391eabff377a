use std::collections::{HashMap, HashSet};

use crate::capability::TileState;
use crate::identity::{
    classify, decode_display_name, normalize_attendee_id, stable_student_key, ParticipantClass,
};

/// Live record of one student, keyed by stable key so the same human maps
/// to the same record across attendee-id churn.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRecord {
    pub external_user_id: String,
    pub attendee_id: String,
    pub camera_tile: Option<u32>,
    pub screen_tile: Option<u32>,
    pub is_muted: bool,
}

impl ParticipantRecord {
    pub fn display_name(&self) -> String {
        decode_display_name(&self.external_user_id)
    }
}

/// A co-proctor sharing the session, tracked separately from the student
/// grid.
#[derive(Debug, Clone, Default)]
pub struct CoProctor {
    pub attendee_id: String,
    pub external_user_id: String,
    pub camera_tile: Option<u32>,
}

/// Follow-up work the reconciliation asks the controller to perform
/// against the capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterAction {
    SubscribeVolume(String),
    UnsubscribeVolume(String),
    BindSelfView { tile_id: u32 },
    BindStudentCamera { stable_key: String, tile_id: u32 },
    BindStudentScreen { stable_key: String, tile_id: u32 },
    BindCoProctor { attendee_id: String, tile_id: u32 },
}

/// Proctor-side participant reconciliation.
///
/// Driven by three independent, unordered event sources (presence, tile
/// updates, volume). Neither presence nor tile events are authoritative:
/// records are created by whichever arrives first and merged by the rest,
/// never destructively overwritten.
#[derive(Debug)]
pub struct ParticipantRoster {
    self_attendee_id: String,
    students: HashMap<String, ParticipantRecord>,
    co_proctors: HashMap<String, CoProctor>,
    volume_subscribed: HashSet<String>,
}

impl ParticipantRoster {
    pub fn new(self_attendee_id: &str) -> Self {
        Self {
            self_attendee_id: normalize_attendee_id(self_attendee_id),
            students: HashMap::new(),
            co_proctors: HashMap::new(),
            volume_subscribed: HashSet::new(),
        }
    }

    pub fn students(&self) -> &HashMap<String, ParticipantRecord> {
        &self.students
    }

    pub fn student(&self, stable_key: &str) -> Option<&ParticipantRecord> {
        self.students.get(stable_key)
    }

    pub fn co_proctors(&self) -> &HashMap<String, CoProctor> {
        &self.co_proctors
    }

    pub fn student_count(&self) -> usize {
        self.students.len()
    }

    /// Resolve the stable conversation key for an attendee id: the student
    /// key when the attendee is a known student, the normalized id itself
    /// otherwise.
    pub fn stable_key_for_attendee(&self, attendee_id: &str) -> String {
        let id = normalize_attendee_id(attendee_id);
        if id.is_empty() {
            return String::new();
        }
        for (key, record) in &self.students {
            if record.attendee_id == id {
                return key.clone();
            }
        }
        id
    }

    /// Resolve a student display name by attendee id, falling back to the
    /// id itself for unknown attendees.
    pub fn display_name_for_attendee(&self, attendee_id: &str) -> String {
        let id = normalize_attendee_id(attendee_id);
        for record in self.students.values() {
            if record.attendee_id == id {
                return record.display_name();
            }
        }
        id
    }

    pub fn display_name_for_key(&self, stable_key: &str) -> String {
        match self.students.get(stable_key) {
            Some(record) => record.display_name(),
            None => self.display_name_for_attendee(stable_key),
        }
    }

    pub fn apply_presence(
        &mut self,
        attendee_id: &str,
        present: bool,
        external_user_id: &str,
    ) -> Vec<RosterAction> {
        if external_user_id.is_empty() {
            return Vec::new();
        }
        let base_external = external_user_id.split('#').next().unwrap_or_default();
        let attendee = normalize_attendee_id(attendee_id);

        match classify(base_external) {
            ParticipantClass::Proctor => {
                if attendee.is_empty() || attendee == self.self_attendee_id {
                    return Vec::new();
                }
                if present {
                    let entry = self.co_proctors.entry(attendee.clone()).or_default();
                    entry.attendee_id = attendee;
                    entry.external_user_id = base_external.to_string();
                } else {
                    self.co_proctors.remove(&attendee);
                }
                Vec::new()
            }
            ParticipantClass::Student => {
                let stable_key = stable_student_key(base_external);
                if present {
                    let entry = self.students.entry(stable_key).or_default();
                    entry.external_user_id = base_external.to_string();
                    if !attendee.is_empty() {
                        entry.attendee_id = attendee;
                    }
                    Vec::new()
                } else {
                    self.students.remove(&stable_key);
                    if self.volume_subscribed.remove(&attendee) {
                        vec![RosterAction::UnsubscribeVolume(attendee)]
                    } else {
                        Vec::new()
                    }
                }
            }
            ParticipantClass::Unknown => Vec::new(),
        }
    }

    pub fn apply_tile_update(&mut self, tile: &TileState) -> Vec<RosterAction> {
        // Own camera goes to the self-view surface.
        if tile.local && !tile.content {
            return vec![RosterAction::BindSelfView { tile_id: tile.tile_id }];
        }
        if tile.local || tile.bound_attendee_id.is_empty() {
            return Vec::new();
        }

        let base_external = tile
            .bound_external_user_id
            .split('#')
            .next()
            .unwrap_or_default()
            .to_string();
        let attendee = normalize_attendee_id(&tile.bound_attendee_id);

        match classify(&base_external) {
            ParticipantClass::Proctor => {
                if attendee.is_empty() || attendee == self.self_attendee_id || tile.content {
                    return Vec::new();
                }
                let entry = self.co_proctors.entry(attendee.clone()).or_default();
                entry.attendee_id = attendee.clone();
                entry.external_user_id = base_external;
                entry.camera_tile = Some(tile.tile_id);
                vec![RosterAction::BindCoProctor {
                    attendee_id: attendee,
                    tile_id: tile.tile_id,
                }]
            }
            ParticipantClass::Student => {
                let stable_key = stable_student_key(&base_external);
                let mut actions = Vec::new();

                // Lazily watch the mute state, once per attendee id. The
                // base id is used even for content tiles, whose bound id
                // carries a sub-stream suffix.
                if !attendee.is_empty() && self.volume_subscribed.insert(attendee.clone()) {
                    actions.push(RosterAction::SubscribeVolume(attendee.clone()));
                }

                let entry = self.students.entry(stable_key.clone()).or_default();
                entry.external_user_id = base_external;
                if !attendee.is_empty() {
                    entry.attendee_id = attendee;
                }
                if tile.content {
                    entry.screen_tile = Some(tile.tile_id);
                    actions.push(RosterAction::BindStudentScreen {
                        stable_key,
                        tile_id: tile.tile_id,
                    });
                } else {
                    entry.camera_tile = Some(tile.tile_id);
                    actions.push(RosterAction::BindStudentCamera {
                        stable_key,
                        tile_id: tile.tile_id,
                    });
                }
                actions
            }
            ParticipantClass::Unknown => Vec::new(),
        }
    }

    /// Clear whichever slot referenced the removed tile. The record itself
    /// stays: the participant may still be present, or may reacquire the
    /// tile after a transient renegotiation.
    pub fn apply_tile_removed(&mut self, tile_id: u32) {
        for record in self.students.values_mut() {
            if record.camera_tile == Some(tile_id) {
                record.camera_tile = None;
            }
            if record.screen_tile == Some(tile_id) {
                record.screen_tile = None;
            }
        }
        for proctor in self.co_proctors.values_mut() {
            if proctor.camera_tile == Some(tile_id) {
                proctor.camera_tile = None;
            }
        }
    }

    /// Update only the mute flag of the matching record.
    pub fn apply_volume(&mut self, attendee_id: &str, muted: bool) {
        let id = normalize_attendee_id(attendee_id);
        if id.is_empty() {
            return;
        }
        for record in self.students.values_mut() {
            if record.attendee_id == id {
                record.is_muted = muted;
                return;
            }
        }
    }

    /// Hand back every live volume subscription for teardown.
    pub fn drain_volume_subscriptions(&mut self) -> Vec<String> {
        self.volume_subscribed.drain().collect()
    }

    pub fn clear(&mut self) {
        self.students.clear();
        self.co_proctors.clear();
        self.volume_subscribed.clear();
    }
}
