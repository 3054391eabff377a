// End-to-end tests for the proctoring session flow, run over the
// in-process loopback capability and the in-memory backend.

use std::sync::Arc;

use tokio::time::{sleep, Duration};

use examguard_client::backend::memory::{AttendanceEvent, InMemoryBackend};
use examguard_client::backend::Profile;
use examguard_client::capability::loopback::{LoopbackConnector, LoopbackNet};
use examguard_client::capability::MediaStreamHandle;
use examguard_client::config::ProtocolConfig;
use examguard_client::identity::stable_student_key;
use examguard_client::protocol::chat::ChatRole;
use examguard_client::session::{ExamineeController, ProctorController, SessionPhase};
use examguard_client::ExamError;

struct Harness {
    net: Arc<LoopbackNet>,
    backend: Arc<InMemoryBackend>,
}

impl Harness {
    fn new() -> Self {
        Self {
            net: LoopbackNet::new(),
            backend: Arc::new(InMemoryBackend::new(Profile {
                display_name: "Dr. Smith".to_string(),
                class_name: String::new(),
                username: "dr.smith".to_string(),
            })),
        }
    }

    fn proctor(&self) -> ProctorController {
        ProctorController::new(
            self.backend.clone(),
            Arc::new(LoopbackConnector::new(self.net.clone())),
            ProtocolConfig::default(),
            "dr.smith",
        )
    }

    fn examinee(&self) -> ExamineeController {
        ExamineeController::new(
            self.backend.clone(),
            Arc::new(LoopbackConnector::new(self.net.clone())),
            ProtocolConfig::default(),
            "guest",
        )
    }
}

async fn settle(proctor: &mut ProctorController, examinee: &mut ExamineeController) {
    // Let spawned best-effort tasks run, then drain both event queues. Two
    // rounds so reactions to reactions (volume subscriptions and the like)
    // also land.
    sleep(Duration::from_millis(10)).await;
    for _ in 0..2 {
        proctor.pump().await;
        examinee.pump().await;
    }
}

#[tokio::test]
async fn test_end_to_end_monitored_session() {
    let harness = Harness::new();
    // The transport may deliver everything twice; the session must not
    // notice.
    harness.net.set_duplicate_data_delivery(true);

    let mut proctor = harness.proctor();
    proctor.join("EX42").await.unwrap();
    assert_eq!(proctor.phase(), SessionPhase::Live);

    let mut examinee = harness.examinee();
    examinee.join("EX42", Some("山田太郎")).await.unwrap();
    assert_eq!(examinee.phase(), SessionPhase::Live);

    settle(&mut proctor, &mut examinee).await;

    // Exactly one student record, resolved to the decoded display name.
    assert_eq!(proctor.roster().student_count(), 1);
    let (stable_key, record) = proctor
        .roster()
        .students()
        .iter()
        .next()
        .map(|(k, v)| (k.clone(), v.clone()))
        .unwrap();
    assert_eq!(record.display_name(), "山田太郎");
    assert_eq!(stable_key, stable_student_key(examinee.external_user_id()));
    assert!(record.camera_tile.is_some());

    // The examinee sees the proctor's feed.
    assert_eq!(examinee.proctor_view().proctor_count(), 1);
    assert_eq!(
        examinee.proctor_view().selected_display_name().as_deref(),
        Some("Dr. Smith")
    );

    // Direct message proctor -> examinee.
    proctor.set_chat_target(&stable_key);
    proctor.send_chat("Please show your desk.").await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    let received: Vec<_> = examinee
        .chat()
        .entries()
        .iter()
        .filter(|e| e.text == "Please show your desk.")
        .collect();
    assert_eq!(received.len(), 1, "duplicate delivery must collapse to one entry");
    assert_eq!(received[0].from_role, ChatRole::Proctor);

    // Direct message examinee -> proctor, landing in that student's
    // conversation.
    examinee.send_chat("Understood.").await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    let incoming: Vec<_> = proctor
        .chat()
        .entries()
        .iter()
        .filter(|e| e.text == "Understood.")
        .collect();
    assert_eq!(incoming.len(), 1);
    assert_eq!(incoming[0].conversation, stable_key);
    assert_eq!(incoming[0].peer_display_name, "山田太郎");

    // Mute state propagates through the volume subscription.
    examinee.toggle_mute().await.unwrap();
    settle(&mut proctor, &mut examinee).await;
    assert!(proctor.roster().student(&stable_key).unwrap().is_muted);

    // Kick the student: they transition to Idle with a notice and cannot
    // silently resume.
    let target = record.attendee_id.clone();
    proctor.kick_participant(&target, Some("examinee")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    assert_eq!(examinee.phase(), SessionPhase::Idle);
    assert!(examinee.was_force_removed());
    assert!(examinee.take_notice().is_some());
    assert!(examinee.chat().entries().is_empty(), "chat state resets on teardown");

    // The proctor saw the student leave.
    settle(&mut proctor, &mut examinee).await;
    assert_eq!(proctor.roster().student_count(), 0);

    // Ending the exam blocks any rejoin attempt.
    proctor.end_exam().await.unwrap();
    assert_eq!(proctor.phase(), SessionPhase::Idle);

    let err = examinee.join("EX42", Some("山田太郎")).await.unwrap_err();
    assert!(matches!(err, ExamError::SessionEnded));
    assert_eq!(examinee.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_end_exam_reaches_all_participants_once() {
    let harness = Harness::new();
    harness.net.set_duplicate_data_delivery(true);

    let mut proctor = harness.proctor();
    proctor.join("EX7").await.unwrap();
    let mut examinee = harness.examinee();
    examinee.join("EX7", Some("Alice")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    proctor.end_exam().await.unwrap();
    // Both copies of the end_exam command drain through one teardown.
    settle(&mut proctor, &mut examinee).await;

    assert_eq!(examinee.phase(), SessionPhase::Idle);
    assert_eq!(examinee.take_notice().as_deref(), Some("The exam has ended."));
    assert!(!examinee.was_force_removed());
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let harness = Harness::new();

    let mut proctor = harness.proctor();
    proctor.join("EX9").await.unwrap();
    let mut examinee = harness.examinee();
    examinee.join("EX9", Some("Bob")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    examinee.leave().await;
    examinee.leave().await;
    assert_eq!(examinee.phase(), SessionPhase::Idle);

    // Leaving with no session at all is a no-op too.
    let mut idle = harness.examinee();
    idle.leave().await;
    assert_eq!(idle.phase(), SessionPhase::Idle);

    proctor.leave().await;
    proctor.leave().await;
    assert_eq!(proctor.phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_attendance_leave_is_sent_exactly_once() {
    let harness = Harness::new();

    let mut proctor = harness.proctor();
    proctor.join("EX11").await.unwrap();
    let mut examinee = harness.examinee();
    examinee.join("EX11", Some("Carol")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    // Page-unload path fires first, then the explicit leave races it.
    examinee.notify_unload();
    examinee.leave().await;
    examinee.leave().await;
    sleep(Duration::from_millis(10)).await;

    let leaves: Vec<_> = harness
        .backend
        .attendance_events()
        .into_iter()
        .filter(|e| matches!(e, AttendanceEvent::Leave { .. }))
        .collect();
    assert_eq!(leaves.len(), 1);

    let joins: Vec<_> = harness
        .backend
        .attendance_events()
        .into_iter()
        .filter(|e| matches!(e, AttendanceEvent::Join { role, .. } if role == "examinee"))
        .collect();
    assert_eq!(joins.len(), 1);
}

#[tokio::test]
async fn test_preview_stream_handoff_keeps_tracks_alive() {
    let harness = Harness::new();

    let mut examinee = harness.examinee();
    let preview = MediaStreamHandle::new("prejoin-preview");
    let watcher = preview.clone();
    examinee.media_prefs.preview.hold(preview);

    examinee.join("EX13", Some("Dave")).await.unwrap();

    // Ownership moved to the capability: the slot is empty and the tracks
    // were not stopped, so the published camera is live.
    assert!(!examinee.media_prefs.preview.is_held());
    assert!(!watcher.tracks_stopped());
    assert_eq!(
        harness.net.video_stream_stopped(examinee.attendee_id()),
        Some(false)
    );

    // Leaving stops the capability, which releases the stream.
    examinee.leave().await;
    assert!(watcher.tracks_stopped());
}

#[tokio::test]
async fn test_spoofed_control_and_chat_are_ignored() {
    let harness = Harness::new();

    let mut proctor = harness.proctor();
    proctor.join("EX17").await.unwrap();
    let mut examinee = harness.examinee();
    examinee.join("EX17", Some("Eve")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    // A second examinee tries to chat to and kick the first one.
    let mut rogue = harness.examinee();
    rogue.join("EX17", Some("Mallory")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;
    rogue.pump().await;

    rogue.send_chat("ignore me please").await.unwrap();
    settle(&mut proctor, &mut examinee).await;

    // The proctor sees the rogue's direct, the other examinee does not.
    assert!(examinee
        .chat()
        .entries()
        .iter()
        .all(|e| e.text != "ignore me please"));

    // A kick claiming to come from an examinee is dropped by everyone.
    let kick = examguard_client::protocol::ControlMessage::parse(
        format!(
            r#"{{"type":"kick","id":"forged-1","ts":"t","fromRole":"examinee","fromAttendeeId":"{}","toAttendeeId":"{}"}}"#,
            rogue.attendee_id(),
            examinee.attendee_id()
        )
        .as_bytes(),
    )
    .unwrap();
    assert!(!kick.from_proctor());
}

#[tokio::test]
async fn test_rejoin_after_explicit_leave() {
    let harness = Harness::new();

    let mut proctor = harness.proctor();
    proctor.join("EX19").await.unwrap();

    let mut examinee = harness.examinee();
    examinee.join("EX19", Some("Frank")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;
    assert_eq!(proctor.roster().student_count(), 1);

    examinee.leave().await;
    settle(&mut proctor, &mut examinee).await;
    assert_eq!(proctor.roster().student_count(), 0);

    // Same profile rejoining lands in the same stable record.
    examinee.join("EX19", Some("Frank")).await.unwrap();
    settle(&mut proctor, &mut examinee).await;
    assert_eq!(proctor.roster().student_count(), 1);
}

#[tokio::test]
async fn test_join_requires_code_and_guest_name() {
    let harness = Harness::new();

    let mut examinee = harness.examinee();
    assert!(matches!(
        examinee.join("   ", Some("Gina")).await,
        Err(ExamError::MissingJoinCode)
    ));
    assert!(matches!(
        examinee.join("EX23", Some("  ")).await,
        Err(ExamError::MissingGuestName)
    ));
    assert_eq!(examinee.phase(), SessionPhase::Idle);

    let mut proctor = harness.proctor();
    assert!(matches!(
        proctor.join("").await,
        Err(ExamError::MissingJoinCode)
    ));
}
