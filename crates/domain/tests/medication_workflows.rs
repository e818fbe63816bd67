use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use domain::clock::{Clock, ManualClock, RequestContext};
use domain::config::Config;
use domain::events::{CorrectedAction, EventData, EventQuery, EventType, MedicationEvent};
use domain::medications::{
    ChangeStatusInput, CommandPatch, CreateMedicationInput, Frequency, MarkDoseTakenInput, MedicationClass,
    MedicationCommand, MedicationInfo, SkipDoseInput, StatusKind,
};
use domain::notifications::LogNotifier;
use domain::setup;
use domain::store::{Collection, MemoryStore};
use domain::undo::{CorrectionRequest, UndoRequest};
use domain::workflows::WorkflowOrchestrator;
use domain::Error;

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    orchestrator: Arc<WorkflowOrchestrator>,
}

fn at(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(at("2024-03-01T07:00:00Z")));
    let orchestrator = setup::init(
        store.clone(),
        Arc::new(LogNotifier),
        Config::default(),
        clock.clone(),
    );
    Harness {
        store,
        clock,
        orchestrator,
    }
}

fn user() -> RequestContext {
    RequestContext::new("caregiver-1").with_session("session-1")
}

fn input(name: &str, frequency: Frequency, class: MedicationClass) -> CreateMedicationInput {
    CreateMedicationInput {
        patient_id: "patient-1".to_string(),
        medication: MedicationInfo {
            name: name.to_string(),
            dosage: "10mg".to_string(),
            form: Some("tablet".to_string()),
            instructions: None,
        },
        frequency,
        times: None,
        start_date: None,
        end_date: None,
        time_zone: None,
        medication_class: class,
        computed_from_preferences: false,
        notify: true,
    }
}

async fn create(h: &Harness, frequency: Frequency, class: MedicationClass) -> MedicationCommand {
    h.orchestrator
        .create_medication(&user(), input("Lisinopril", frequency, class))
        .await
        .into_result()
        .unwrap()
}

async fn take(h: &Harness, command: &MedicationCommand, scheduled_for: &str) -> MedicationEvent {
    h.orchestrator
        .mark_dose_taken(
            &user(),
            MarkDoseTakenInput {
                command_id: command.id.clone(),
                scheduled_for: Some(at(scheduled_for)),
                taken_at: Some(h.clock.now()),
                ..Default::default()
            },
        )
        .await
        .into_result()
        .unwrap()
}

async fn events_of(h: &Harness, command: &MedicationCommand, kind: EventType) -> Vec<MedicationEvent> {
    h.orchestrator
        .events()
        .query(&EventQuery::for_command(&command.id).of_type(kind))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_create_twice_daily_medication() {
    let h = harness();
    let result = h
        .orchestrator
        .create_medication(&user(), input("Metformin", Frequency::TwiceDaily, MedicationClass::Standard))
        .await;

    assert!(result.success);
    assert!(result.workflow_id.starts_with("wf_"));
    assert_eq!(result.notifications_sent, 1);
    let command = result.output.clone().unwrap();
    assert_eq!(command.schedule.times, vec!["08:00".to_string(), "20:00".to_string()]);
    assert_eq!(command.status.current, StatusKind::Active);
    assert!(command.status.is_active);
    assert_eq!(command.version(), 1);

    let created = events_of(&h, &command, EventType::MedicationCreated).await;
    assert_eq!(created.len(), 1);
    let scheduled = events_of(&h, &command, EventType::DoseScheduled).await;
    // Two slots a day over the default 30-day horizon.
    assert_eq!(scheduled.len(), 60);
    let first_slot = scheduled.iter().filter_map(|e| e.timing.scheduled_for).min();
    assert_eq!(first_slot, Some(at("2024-03-01T08:00:00Z")));
    assert_eq!(result.event_ids.len(), 1 + scheduled.len());
    assert!(created
        .iter()
        .chain(scheduled.iter())
        .all(|e| e.metadata.correlation_id == result.correlation_id));
}

#[tokio::test]
async fn test_duplicate_medication_is_rejected() {
    let h = harness();
    create(&h, Frequency::OnceDaily, MedicationClass::Standard).await;

    let again = h
        .orchestrator
        .create_medication(&user(), input("Lisinopril", Frequency::OnceDaily, MedicationClass::Standard))
        .await;
    assert!(!again.success);
    assert!(matches!(again.cause, Some(Error::Uniqueness { .. })));
    assert_eq!(h.store.len(Collection::Commands), 1);
}

#[tokio::test]
async fn test_failed_scheduling_phase_compensates_command() {
    let h = harness();
    // Phase one takes three commits (log, data, log); the fifth is the
    // scheduling phase's data commit.
    h.store.fail_nth_commit(5);

    let result = h
        .orchestrator
        .create_medication(&user(), input("Warfarin", Frequency::OnceDaily, MedicationClass::Critical))
        .await;

    assert!(!result.success);
    let Some(Error::PhaseFailed { phase, compensated, .. }) = &result.cause else {
        panic!("expected a phase failure, got {:?}", result.cause);
    };
    assert_eq!(phase, "schedule_doses");
    assert_eq!(compensated, &vec!["write_command".to_string()]);
    assert!(h.store.is_empty(Collection::Commands));
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_late_dose_within_threshold_is_on_time() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:10:00Z"));

    let event = take(&h, &command, "2024-03-01T08:00:00Z").await;

    assert_eq!(event.event_type(), EventType::DoseTaken);
    assert_eq!(event.timing.is_on_time, Some(true));
    assert_eq!(event.timing.minutes_late, Some(10));
    assert_eq!(event.timing.grace_period_end, Some(at("2024-03-01T09:00:00Z")));
    assert_eq!(event.context.related_event_ids.len(), 1);

    let stored = h.orchestrator.commands().require(&command.id).await.unwrap();
    assert_eq!(stored.version(), 2);
}

#[tokio::test]
async fn test_prn_dose_records_prn_event() {
    let h = harness();
    let command = create(&h, Frequency::AsNeeded, MedicationClass::Standard).await;
    assert!(events_of(&h, &command, EventType::DoseScheduled).await.is_empty());

    let result = h
        .orchestrator
        .mark_dose_taken(
            &user(),
            MarkDoseTakenInput {
                command_id: command.id.clone(),
                ..Default::default()
            },
        )
        .await;
    let event = result.into_result().unwrap();
    assert_eq!(event.event_type(), EventType::PrnDoseTaken);
    assert_eq!(event.timing.is_on_time, None);
}

#[tokio::test]
async fn test_undo_inside_window() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:05:00Z"));
    let taken = take(&h, &command, "2024-03-01T08:00:00Z").await;

    h.clock.advance(Duration::seconds(5));
    let result = h
        .orchestrator
        .undo_event(
            &user(),
            UndoRequest {
                event_id: taken.id.clone(),
                reason: "tapped the wrong dose".to_string(),
                corrected_action: None,
            },
            true,
        )
        .await;

    assert!(result.success);
    let outcome = result.output.unwrap();
    assert_eq!(outcome.retraction.event_type(), EventType::DoseTakenUndone);
    let undo = outcome.retraction.undo_data().unwrap();
    assert_eq!(undo.original_event_id, taken.id);
    assert_eq!(undo.original_event_type, EventType::DoseTaken);
    assert_eq!(outcome.validation.elapsed_seconds, 5);
    assert_eq!(outcome.adherence.taken_delta, -1);
    assert_eq!(outcome.adherence.before.taken, 1);
    assert_eq!(outcome.adherence.after.taken, 0);

    let history = h.orchestrator.undo_engine().undo_history(&command.id).await.unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_undo_with_follow_up_action() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:05:00Z"));
    let taken = take(&h, &command, "2024-03-01T08:00:00Z").await;

    let outcome = h
        .orchestrator
        .undo_event(
            &user(),
            UndoRequest {
                event_id: taken.id.clone(),
                reason: "was skipped".to_string(),
                corrected_action: Some(CorrectedAction::Skipped {
                    reason: Some("nausea".to_string()),
                }),
            },
            false,
        )
        .await
        .into_result()
        .unwrap();

    let follow_up = outcome.follow_up.unwrap();
    assert_eq!(follow_up.event_type(), EventType::DoseSkipped);
    assert!(follow_up.context.related_event_ids.contains(&taken.id));
}

#[tokio::test]
async fn test_correction_after_undo_window() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:05:00Z"));
    let taken = take(&h, &command, "2024-03-01T08:00:00Z").await;

    h.clock.advance(Duration::hours(2));
    let undo = h
        .orchestrator
        .undo_event(
            &user(),
            UndoRequest {
                event_id: taken.id.clone(),
                reason: "late".to_string(),
                corrected_action: None,
            },
            false,
        )
        .await;
    assert!(matches!(
        undo.cause,
        Some(Error::UndoRejected {
            requires_correction: true,
            ..
        })
    ));

    let corrected = h
        .orchestrator
        .correct_event(
            &user(),
            CorrectionRequest {
                event_id: taken.id.clone(),
                reason: "patient spat it out".to_string(),
                corrected_action: CorrectedAction::Missed,
                notes: None,
            },
            true,
        )
        .await
        .into_result()
        .unwrap();
    assert_eq!(corrected.retraction.event_type(), EventType::DoseMissedCorrected);
    assert_eq!(
        h.orchestrator.events().require_event(&taken.id).await.unwrap(),
        taken
    );

    let second = h
        .orchestrator
        .correct_event(
            &user(),
            CorrectionRequest {
                event_id: taken.id.clone(),
                reason: "actually taken".to_string(),
                corrected_action: CorrectedAction::Taken {
                    taken_at: at("2024-03-01T08:05:00Z"),
                },
                notes: None,
            },
            false,
        )
        .await;
    assert!(matches!(second.cause, Some(Error::AlreadyRetracted { .. })));
}

#[tokio::test]
async fn test_correction_record_cannot_be_retracted() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:05:00Z"));
    let taken = take(&h, &command, "2024-03-01T08:00:00Z").await;

    h.clock.advance(Duration::hours(2));
    let corrected = h
        .orchestrator
        .correct_event(
            &user(),
            CorrectionRequest {
                event_id: taken.id.clone(),
                reason: "wrong time entered".to_string(),
                corrected_action: CorrectedAction::Taken {
                    taken_at: at("2024-03-01T08:20:00Z"),
                },
                notes: None,
            },
            false,
        )
        .await
        .into_result()
        .unwrap();
    let replacement = corrected.retraction;
    assert_eq!(replacement.event_type(), EventType::DoseTaken);
    assert_eq!(corrected.adherence.taken_delta, 0);

    h.clock.advance(Duration::seconds(5));
    let undo = h
        .orchestrator
        .undo_event(
            &user(),
            UndoRequest {
                event_id: replacement.id.clone(),
                reason: "changed my mind".to_string(),
                corrected_action: None,
            },
            false,
        )
        .await;
    assert!(matches!(
        undo.cause,
        Some(Error::UndoRejected {
            requires_correction: false,
            ..
        })
    ));

    let again = h
        .orchestrator
        .correct_event(
            &user(),
            CorrectionRequest {
                event_id: replacement.id.clone(),
                reason: "changed my mind".to_string(),
                corrected_action: CorrectedAction::Missed,
                notes: None,
            },
            false,
        )
        .await;
    assert!(matches!(again.cause, Some(Error::UndoRejected { .. })));
    assert!(!h
        .orchestrator
        .undo_engine()
        .validate_undo(&replacement.id)
        .await
        .unwrap()
        .allowed);
    assert_eq!(events_of(&h, &command, EventType::DoseTakenUndone).await.len(), 0);
    assert_eq!(events_of(&h, &command, EventType::DoseMissedCorrected).await.len(), 0);
}

#[tokio::test]
async fn test_window_boundaries() {
    let h = harness();
    let command = create(&h, Frequency::FourTimesDaily, MedicationClass::Standard).await;
    let engine = h.orchestrator.undo_engine();

    h.clock.set(at("2024-03-01T08:00:00Z"));
    let first = take(&h, &command, "2024-03-01T08:00:00Z").await;
    h.clock.advance(Duration::milliseconds(29_900));
    assert!(engine.validate_undo(&first.id).await.unwrap().allowed);

    h.clock.advance(Duration::milliseconds(200));
    let late = engine.validate_undo(&first.id).await.unwrap();
    assert!(!late.allowed);
    assert!(late.requires_correction);

    h.clock.set(at("2024-03-02T08:00:01Z"));
    let result = h
        .orchestrator
        .correct_event(
            &user(),
            CorrectionRequest {
                event_id: first.id.clone(),
                reason: "too late".to_string(),
                corrected_action: CorrectedAction::Missed,
                notes: None,
            },
            false,
        )
        .await;
    assert!(matches!(
        result.cause,
        Some(Error::UndoRejected {
            requires_correction: false,
            ..
        })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_undo_succeeds_once() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:00:00Z"));
    let taken = take(&h, &command, "2024-03-01T08:00:00Z").await;

    let mut handles = Vec::new();
    for i in 0..4 {
        let orchestrator = h.orchestrator.clone();
        let request = UndoRequest {
            event_id: taken.id.clone(),
            reason: format!("attempt {i}"),
            corrected_action: None,
        };
        handles.push(tokio::spawn(async move {
            orchestrator
                .undo_event(&RequestContext::new("caregiver-1"), request, false)
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        let result = handle.await.unwrap();
        if result.success {
            successes += 1;
        } else {
            assert!(
                matches!(result.cause, Some(Error::AlreadyRetracted { .. })),
                "unexpected failure: {:?}",
                result.cause
            );
        }
    }
    assert_eq!(successes, 1);
    assert_eq!(events_of(&h, &command, EventType::DoseTakenUndone).await.len(), 1);
}

#[tokio::test]
async fn test_failed_dose_write_leaves_nothing_behind() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:00:00Z"));
    // Log commit first, then the data commit.
    h.store.fail_nth_commit(2);

    let result = h
        .orchestrator
        .mark_dose_taken(
            &user(),
            MarkDoseTakenInput {
                command_id: command.id.clone(),
                scheduled_for: Some(at("2024-03-01T08:00:00Z")),
                ..Default::default()
            },
        )
        .await;

    assert!(!result.success);
    assert!(events_of(&h, &command, EventType::DoseTaken).await.is_empty());
    let stored = h.orchestrator.commands().require(&command.id).await.unwrap();
    assert_eq!(stored.version(), 1);
    assert_eq!(h.store.len(Collection::RollbackLog), 1);
}

#[tokio::test]
async fn test_status_change_and_version_monotonicity() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.clock.set(at("2024-03-01T08:00:00Z"));
    take(&h, &command, "2024-03-01T08:00:00Z").await;

    let paused = h
        .orchestrator
        .change_status(
            &user(),
            ChangeStatusInput {
                command_id: command.id.clone(),
                status: StatusKind::Paused,
                reason: Some("hospital stay".to_string()),
                notify: true,
            },
        )
        .await
        .into_result()
        .unwrap();
    assert_eq!(paused.version(), 3);
    assert!(!paused.status.is_active);

    let events = events_of(&h, &command, EventType::MedicationPaused).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0].event_data,
        EventData::MedicationPaused {
            from: StatusKind::Active,
            ..
        }
    ));

    let discontinued = h
        .orchestrator
        .change_status(
            &user(),
            ChangeStatusInput {
                command_id: command.id.clone(),
                status: StatusKind::Discontinued,
                reason: None,
                notify: false,
            },
        )
        .await
        .into_result()
        .unwrap();
    assert_eq!(discontinued.version(), 4);

    let resumed = h
        .orchestrator
        .change_status(
            &user(),
            ChangeStatusInput {
                command_id: command.id.clone(),
                status: StatusKind::Active,
                reason: None,
                notify: false,
            },
        )
        .await;
    assert!(matches!(resumed.cause, Some(Error::InvalidStateTransition { .. })));

    let skip = h
        .orchestrator
        .skip_dose(
            &user(),
            SkipDoseInput {
                command_id: command.id.clone(),
                scheduled_for: Some(at("2024-03-01T20:00:00Z")),
                ..Default::default()
            },
        )
        .await;
    assert!(matches!(skip.cause, Some(Error::Validation { .. })));
    let stored = h.orchestrator.commands().require(&command.id).await.unwrap();
    assert_eq!(stored.version(), 4);
}

#[tokio::test]
async fn test_missed_dose_detection_is_idempotent() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Critical).await;

    // 08:00 taken, 20:00 forgotten.
    h.clock.set(at("2024-03-01T08:02:00Z"));
    take(&h, &command, "2024-03-01T08:00:00Z").await;
    h.clock.set(at("2024-03-01T20:16:00Z"));

    let first = h.orchestrator.detect_missed_doses(&RequestContext::system()).await;
    let summary = first.output.clone().unwrap();
    assert_eq!(summary.commands_checked, 1);
    assert_eq!(summary.doses_missed, 1);
    assert_eq!(summary.failures, 0);
    assert_eq!(first.notifications_sent, 1);

    let missed = events_of(&h, &command, EventType::DoseMissed).await;
    assert_eq!(missed.len(), 1);
    assert_eq!(missed[0].timing.scheduled_for, Some(at("2024-03-01T20:00:00Z")));
    assert!(matches!(
        missed[0].event_data,
        EventData::DoseMissed {
            grace_period_minutes: 15,
            ..
        }
    ));

    let second = h
        .orchestrator
        .detect_missed_doses(&RequestContext::system())
        .await
        .into_result()
        .unwrap();
    assert_eq!(second.doses_missed, 0);
    assert_eq!(events_of(&h, &command, EventType::DoseMissed).await.len(), 1);

    let direct = h
        .orchestrator
        .process_missed_dose(&RequestContext::system(), &command.id, at("2024-03-01T20:00:00Z"))
        .await
        .into_result()
        .unwrap();
    assert!(direct.is_none());
}

#[tokio::test]
async fn test_schedule_change_moves_monitored_slots() {
    let h = harness();
    let command = create(&h, Frequency::OnceDaily, MedicationClass::Standard).await;

    let updated = h
        .orchestrator
        .update_medication(
            &user(),
            &command.id,
            CommandPatch {
                times: Some(vec!["10:00".to_string()]),
                ..Default::default()
            },
        )
        .await;
    assert!(updated.success);
    // The update event plus one new slot per day of the horizon.
    assert_eq!(updated.event_ids.len(), 31);
    let scheduled = events_of(&h, &command, EventType::DoseScheduled).await;
    assert!(scheduled
        .iter()
        .any(|e| e.timing.scheduled_for == Some(at("2024-03-01T10:00:00Z"))));

    h.clock.set(at("2024-03-01T10:00:00Z"));
    take(&h, &command, "2024-03-01T10:00:00Z").await;

    h.clock.set(at("2024-03-01T12:00:00Z"));
    let same_day = h
        .orchestrator
        .detect_missed_doses(&RequestContext::system())
        .await
        .into_result()
        .unwrap();
    assert_eq!(same_day.doses_missed, 0);
    assert!(events_of(&h, &command, EventType::DoseMissed).await.is_empty());

    h.clock.set(at("2024-03-02T12:00:00Z"));
    let next_day = h
        .orchestrator
        .detect_missed_doses(&RequestContext::system())
        .await
        .into_result()
        .unwrap();
    assert_eq!(next_day.doses_missed, 1);
    let missed = events_of(&h, &command, EventType::DoseMissed).await;
    assert_eq!(missed[0].timing.scheduled_for, Some(at("2024-03-02T10:00:00Z")));
}

#[tokio::test]
async fn test_update_without_schedule_change_keeps_slots() {
    let h = harness();
    let command = create(&h, Frequency::OnceDaily, MedicationClass::Standard).await;

    let updated = h
        .orchestrator
        .update_medication(
            &user(),
            &command.id,
            CommandPatch {
                medication_class: Some(MedicationClass::Critical),
                ..Default::default()
            },
        )
        .await;
    assert_eq!(updated.event_ids.len(), 1);
    assert_eq!(events_of(&h, &command, EventType::DoseScheduled).await.len(), 30);
}

#[tokio::test]
async fn test_paused_medication_is_not_monitored() {
    let h = harness();
    let command = create(&h, Frequency::TwiceDaily, MedicationClass::Standard).await;
    h.orchestrator
        .change_status(
            &user(),
            ChangeStatusInput {
                command_id: command.id.clone(),
                status: StatusKind::Paused,
                reason: None,
                notify: false,
            },
        )
        .await
        .into_result()
        .unwrap();

    h.clock.set(at("2024-03-02T12:00:00Z"));
    let summary = h
        .orchestrator
        .detect_missed_doses(&RequestContext::system())
        .await
        .into_result()
        .unwrap();
    assert_eq!(summary.commands_checked, 0);
    assert!(events_of(&h, &command, EventType::DoseMissed).await.is_empty());
}
