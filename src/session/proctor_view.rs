use std::collections::{BTreeMap, HashMap, HashSet};

use crate::capability::TileState;
use crate::identity::{classify, decode_display_name, normalize_attendee_id, ParticipantClass};

/// One visible proctor tile on the examinee side.
#[derive(Debug, Clone)]
pub struct ProctorTile {
    pub attendee_id: String,
    pub external_user_id: String,
    pub tile_id: u32,
}

/// Re-bind instruction for the single proctor viewport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProctorViewAction {
    Bind { tile_id: u32 },
    Clear,
}

/// Examinee-side tracker of the currently-visible proctors.
///
/// Supports several simultaneous proctors: one is selected as the active
/// view, and when its tile disappears the view falls back to another
/// known proctor automatically. Keyed order is deterministic so fallback
/// selection does not flap.
#[derive(Debug, Default)]
pub struct ProctorView {
    proctors: BTreeMap<String, ProctorTile>,
    tile_to_attendee: HashMap<u32, String>,
    selected: Option<String>,
}

impl ProctorView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn selected_attendee_id(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn selected_external_user_id(&self) -> Option<&str> {
        let selected = self.selected.as_deref()?;
        self.proctors.get(selected).map(|p| p.external_user_id.as_str())
    }

    pub fn selected_display_name(&self) -> Option<String> {
        self.selected_external_user_id().map(decode_display_name)
    }

    /// Transport attendee ids of every known proctor, used as the advisory
    /// anti-spoofing roster for incoming chat.
    pub fn known_proctor_ids(&self) -> HashSet<String> {
        self.proctors.keys().cloned().collect()
    }

    pub fn proctor_count(&self) -> usize {
        self.proctors.len()
    }

    /// Explicitly select a proctor, returning the bind for its tile.
    pub fn select(&mut self, attendee_id: &str) -> Option<ProctorViewAction> {
        let id = normalize_attendee_id(attendee_id);
        let tile = self.proctors.get(&id)?.tile_id;
        self.selected = Some(id);
        Some(ProctorViewAction::Bind { tile_id: tile })
    }

    pub fn apply_tile_update(&mut self, tile: &TileState) -> Option<ProctorViewAction> {
        if tile.local || tile.content {
            return None;
        }
        if classify(&tile.bound_external_user_id) != ParticipantClass::Proctor {
            return None;
        }
        let attendee = normalize_attendee_id(&tile.bound_attendee_id);
        if attendee.is_empty() {
            return None;
        }
        let base_external = tile
            .bound_external_user_id
            .split('#')
            .next()
            .unwrap_or_default()
            .to_string();

        self.tile_to_attendee.insert(tile.tile_id, attendee.clone());
        self.proctors.insert(
            attendee.clone(),
            ProctorTile {
                attendee_id: attendee.clone(),
                external_user_id: base_external,
                tile_id: tile.tile_id,
            },
        );

        match &self.selected {
            None => {
                self.selected = Some(attendee);
                Some(ProctorViewAction::Bind { tile_id: tile.tile_id })
            }
            Some(selected) if *selected == attendee => {
                Some(ProctorViewAction::Bind { tile_id: tile.tile_id })
            }
            Some(_) => None,
        }
    }

    pub fn apply_tile_removed(&mut self, tile_id: u32) -> Option<ProctorViewAction> {
        let attendee = self.tile_to_attendee.remove(&tile_id)?;
        self.proctors.remove(&attendee);

        if self.selected.as_deref() != Some(attendee.as_str()) {
            return None;
        }

        // Fall back to another known proctor, if any.
        match self.proctors.values().next() {
            Some(next) => {
                self.selected = Some(next.attendee_id.clone());
                Some(ProctorViewAction::Bind { tile_id: next.tile_id })
            }
            None => {
                self.selected = None;
                Some(ProctorViewAction::Clear)
            }
        }
    }

    pub fn clear(&mut self) {
        self.proctors.clear();
        self.tile_to_attendee.clear();
        self.selected = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{make_external_user_id, Role};

    fn proctor_tile(tile_id: u32, attendee: &str, external: &str) -> TileState {
        TileState {
            tile_id,
            local: false,
            content: false,
            bound_attendee_id: attendee.to_string(),
            bound_external_user_id: external.to_string(),
        }
    }

    #[test]
    fn test_first_proctor_becomes_active() {
        let external = make_external_user_id(Role::Proctor, "監督", "", "a");
        let mut view = ProctorView::new();
        let action = view.apply_tile_update(&proctor_tile(5, "p1", &external));
        assert_eq!(action, Some(ProctorViewAction::Bind { tile_id: 5 }));
        assert_eq!(view.selected_attendee_id(), Some("p1"));
        assert_eq!(view.selected_display_name().as_deref(), Some("監督"));
    }

    #[test]
    fn test_second_proctor_does_not_steal_view() {
        let a = make_external_user_id(Role::Proctor, "A", "", "a");
        let b = make_external_user_id(Role::Proctor, "B", "", "b");
        let mut view = ProctorView::new();
        view.apply_tile_update(&proctor_tile(1, "p1", &a));
        let action = view.apply_tile_update(&proctor_tile(2, "p2", &b));
        assert_eq!(action, None);
        assert_eq!(view.selected_attendee_id(), Some("p1"));
        assert_eq!(view.proctor_count(), 2);
    }

    #[test]
    fn test_fallback_when_active_tile_disappears() {
        let a = make_external_user_id(Role::Proctor, "A", "", "a");
        let b = make_external_user_id(Role::Proctor, "B", "", "b");
        let mut view = ProctorView::new();
        view.apply_tile_update(&proctor_tile(1, "p1", &a));
        view.apply_tile_update(&proctor_tile(2, "p2", &b));

        let action = view.apply_tile_removed(1);
        assert_eq!(action, Some(ProctorViewAction::Bind { tile_id: 2 }));
        assert_eq!(view.selected_attendee_id(), Some("p2"));
    }

    #[test]
    fn test_clear_when_last_proctor_leaves() {
        let a = make_external_user_id(Role::Proctor, "A", "", "a");
        let mut view = ProctorView::new();
        view.apply_tile_update(&proctor_tile(1, "p1", &a));
        let action = view.apply_tile_removed(1);
        assert_eq!(action, Some(ProctorViewAction::Clear));
        assert_eq!(view.selected_attendee_id(), None);
    }

    #[test]
    fn test_removing_inactive_tile_is_silent() {
        let a = make_external_user_id(Role::Proctor, "A", "", "a");
        let b = make_external_user_id(Role::Proctor, "B", "", "b");
        let mut view = ProctorView::new();
        view.apply_tile_update(&proctor_tile(1, "p1", &a));
        view.apply_tile_update(&proctor_tile(2, "p2", &b));
        assert_eq!(view.apply_tile_removed(2), None);
        assert_eq!(view.selected_attendee_id(), Some("p1"));
    }

    #[test]
    fn test_student_and_content_tiles_are_ignored() {
        let student = make_external_user_id(Role::Student, "S", "c", "u");
        let proctor = make_external_user_id(Role::Proctor, "P", "", "p");
        let mut view = ProctorView::new();

        assert!(view.apply_tile_update(&proctor_tile(1, "s1", &student)).is_none());

        let content = TileState {
            tile_id: 2,
            local: false,
            content: true,
            bound_attendee_id: "p1#content".to_string(),
            bound_external_user_id: format!("{proctor}#content"),
        };
        assert!(view.apply_tile_update(&content).is_none());
        assert_eq!(view.proctor_count(), 0);
    }

    #[test]
    fn test_explicit_selection() {
        let a = make_external_user_id(Role::Proctor, "A", "", "a");
        let b = make_external_user_id(Role::Proctor, "B", "", "b");
        let mut view = ProctorView::new();
        view.apply_tile_update(&proctor_tile(1, "p1", &a));
        view.apply_tile_update(&proctor_tile(2, "p2", &b));

        assert_eq!(view.select("p2"), Some(ProctorViewAction::Bind { tile_id: 2 }));
        assert_eq!(view.selected_attendee_id(), Some("p2"));
        assert_eq!(view.select("ghost"), None);
    }
}
