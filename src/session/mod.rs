mod controller;
mod examinee;
mod media;
mod proctor;
mod proctor_view;
mod roster;

pub use controller::{
    co_proctor_surface, student_camera_surface, student_screen_surface, SessionPhase,
    PROCTOR_VIEW_SURFACE, SELF_VIEW_SURFACE,
};
pub use examinee::ExamineeController;
pub use media::{pick_device, MediaPreferences, MediaState};
pub use proctor::ProctorController;
pub use proctor_view::{ProctorView, ProctorViewAction};
pub use roster::{CoProctor, ParticipantRecord, ParticipantRoster, RosterAction};
