use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::{Clock, RequestContext};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{
    ArchiveSummary, CreateEventRequest, EventData, EventQuery, EventStore, EventTiming, EventType,
    MedicationEvent, TriggerSource,
};
use crate::ids;
use crate::medications::{
    touches_schedule, ChangeStatusInput, CommandPatch, CommandStore, CreateMedicationInput,
    MarkDoseTakenInput, MedicationCommand, SkipDoseInput, StatusKind,
};
use crate::notifications::{
    NotificationKind, NotificationPriority, NotificationRequest, Notifier,
};
use crate::recovery::{retry, RecoveryPolicy, RetryScope};
use crate::transactions::{templates, TransactionCoordinator, TransactionPhase};
use crate::undo::{CorrectionRequest, RetractionOutcome, UndoEngine, UndoRequest};

use super::result::{WorkflowResult, WorkflowRun};
use super::schedule::{is_scheduled_slot, upcoming_doses};

const NOTIFIER: &str = "notifier";

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct MissedDoseSummary {
    pub commands_checked: usize,
    pub doses_missed: usize,
    pub already_recorded: usize,
    pub failures: usize,
}

/// Sequences the stores, coordinator and undo engine into the business
/// workflows. Each method is one invocation and returns a result record
/// instead of an error.
#[derive(Clone)]
pub struct WorkflowOrchestrator {
    commands: CommandStore,
    events: EventStore,
    undo: UndoEngine,
    coordinator: Arc<TransactionCoordinator>,
    notifier: Arc<dyn Notifier>,
    breakers: Arc<CircuitBreakerRegistry>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
    recovery: RecoveryPolicy,
}

impl WorkflowOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commands: CommandStore,
        events: EventStore,
        undo: UndoEngine,
        coordinator: Arc<TransactionCoordinator>,
        notifier: Arc<dyn Notifier>,
        breakers: Arc<CircuitBreakerRegistry>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            commands,
            events,
            undo,
            coordinator,
            notifier,
            breakers,
            clock,
            config,
            recovery: RecoveryPolicy::default(),
        }
    }

    pub fn with_recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    pub fn commands(&self) -> &CommandStore {
        &self.commands
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn undo_engine(&self) -> &UndoEngine {
        &self.undo
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    fn finish<T>(
        &self,
        run: WorkflowRun,
        outcome: Result<T>,
        ctx: &RequestContext,
        patient_id: Option<&str>,
    ) -> WorkflowResult<T> {
        run.finish(outcome, &self.recovery, ctx, patient_id, self.clock.now())
    }

    // ---- create ----

    pub async fn create_medication(
        &self,
        ctx: &RequestContext,
        input: CreateMedicationInput,
    ) -> WorkflowResult<MedicationCommand> {
        let mut run = WorkflowRun::start("create_medication", ctx);
        let outcome = self.create_phases(ctx, &input, &mut run).await;
        self.finish(run, outcome, ctx, Some(&input.patient_id))
    }

    async fn create_phases(
        &self,
        ctx: &RequestContext,
        input: &CreateMedicationInput,
        run: &mut WorkflowRun,
    ) -> Result<MedicationCommand> {
        let now = self.clock.now();
        let command = MedicationCommand::create(input, &ctx.actor_id, now)?;
        if self.commands.get(&command.id).await?.is_some() {
            return Err(duplicate_medication());
        }

        let created = self.events.build_event(
            CreateEventRequest::for_command(
                &command,
                EventData::MedicationCreated {
                    medication_name: command.medication.name.clone(),
                    dosage: command.medication.dosage.clone(),
                    frequency: command.schedule.frequency,
                    times: command.schedule.times.clone(),
                },
                ctx,
            )
            .correlated(&run.correlation_id),
        )?;

        let doses = upcoming_doses(
            &command,
            now,
            self.config.schedule_horizon_days,
            self.config.max_generated_events,
        )?;
        let scheduled = doses
            .into_iter()
            .map(|at| self.scheduled_event(ctx, &command, at, &run.correlation_id))
            .collect::<Result<Vec<_>>>()?;

        let mut phases = vec![TransactionPhase::new(
            "write_command".to_string(),
            templates::creation_operations(&command, std::slice::from_ref(&created))?,
            vec![CommandStore::delete_op(&command.id)],
        )];
        if !scheduled.is_empty() {
            let ops = scheduled
                .iter()
                .map(templates::event_write)
                .collect::<Result<Vec<_>>>()?;
            phases.push(TransactionPhase::new("schedule_doses".to_string(), ops, vec![]));
        }

        self.coordinator
            .execute_distributed("create_medication", phases, Some(&run.correlation_id))
            .await
            .map_err(|e| if e.is_already_exists() { duplicate_medication() } else { e })?;

        run.record_events(std::iter::once(&created.id));
        run.record_events(scheduled.iter().map(|e| &e.id));
        info!(
            command_id = %command.id,
            scheduled = scheduled.len(),
            "Medication created"
        );

        if input.notify {
            let request = NotificationRequest::new(
                command.patient_id.clone(),
                NotificationKind::MedicationCreated,
                NotificationPriority::Normal,
                "Medication added".to_string(),
                format!(
                    "{} {} was added to the medication list",
                    command.medication.name, command.medication.dosage
                ),
            )
            .for_command(&command.id);
            self.notify(run, request).await;
        }
        Ok(command)
    }

    // ---- doses ----

    pub async fn mark_dose_taken(
        &self,
        ctx: &RequestContext,
        input: MarkDoseTakenInput,
    ) -> WorkflowResult<MedicationEvent> {
        let mut run = WorkflowRun::start("mark_dose_taken", ctx);
        let patient_id = self.patient_of(&input.command_id).await;
        let outcome = self
            .mark_taken_phases(ctx, &input, patient_id.as_deref(), &mut run)
            .await;
        self.finish(run, outcome, ctx, patient_id.as_deref())
    }

    async fn mark_taken_phases(
        &self,
        ctx: &RequestContext,
        input: &MarkDoseTakenInput,
        patient_id: Option<&str>,
        run: &mut WorkflowRun,
    ) -> Result<MedicationEvent> {
        let taken_at = input.taken_at.unwrap_or_else(|| self.clock.now());
        let correlation_id = run.correlation_id.clone();
        let scope = self.retry_scope("mark_dose_taken", ctx, patient_id);

        let (command, event) = retry(&self.recovery, scope, || {
            self.record_taken(ctx, input, taken_at, &correlation_id)
        })
        .await?;

        run.record_events(std::iter::once(&event.id));
        if input.notify {
            let on_time = match event.timing.is_on_time {
                Some(true) => "on time",
                Some(false) => "late",
                None => "as needed",
            };
            let request = NotificationRequest::new(
                command.patient_id.clone(),
                NotificationKind::DoseTaken,
                NotificationPriority::Low,
                "Dose taken".to_string(),
                format!("{} taken ({on_time})", command.medication.name),
            )
            .for_command(&command.id);
            self.notify(run, request).await;
        }
        Ok(event)
    }

    /// One attempt: re-reads the command so a retry sees the latest version.
    async fn record_taken(
        &self,
        ctx: &RequestContext,
        input: &MarkDoseTakenInput,
        taken_at: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<(MedicationCommand, MedicationEvent)> {
        let before = self.commands.require(&input.command_id).await?;
        ensure_recordable(&before)?;

        let data = if before.status.is_prn {
            EventData::PrnDoseTaken {
                taken_at,
                dosage: input.dosage.clone(),
                reason: None,
                notes: input.notes.clone(),
            }
        } else {
            EventData::DoseTaken {
                scheduled_for: input.scheduled_for,
                taken_at,
                dosage: input.dosage.clone(),
                notes: input.notes.clone(),
                undo_data: None,
            }
        };

        let mut request = CreateEventRequest::for_command(&before, data, ctx)
            .correlated(correlation_id)
            .salted(taken_at.to_rfc3339());
        if let (Some(scheduled), false) = (input.scheduled_for, before.status.is_prn) {
            let (on_time, minutes_late) =
                EventTiming::punctuality(scheduled, taken_at, self.config.on_time_threshold);
            request = request
                .scheduled(scheduled, scheduled + before.grace())
                .punctuality(on_time, minutes_late)
                .related(self.scheduled_reference(&before, scheduled).await?);
        }

        self.write_dose(before, request).await
    }

    pub async fn skip_dose(
        &self,
        ctx: &RequestContext,
        input: SkipDoseInput,
    ) -> WorkflowResult<MedicationEvent> {
        let mut run = WorkflowRun::start("skip_dose", ctx);
        let correlation_id = run.correlation_id.clone();
        let patient_id = self.patient_of(&input.command_id).await;
        let scope = self.retry_scope("skip_dose", ctx, patient_id.as_deref());

        let outcome = retry(&self.recovery, scope, || {
            self.record_skip(ctx, &input, &correlation_id)
        })
        .await;

        let outcome = outcome.map(|(_, event)| {
            run.record_events(std::iter::once(&event.id));
            event
        });
        self.finish(run, outcome, ctx, patient_id.as_deref())
    }

    async fn record_skip(
        &self,
        ctx: &RequestContext,
        input: &SkipDoseInput,
        correlation_id: &str,
    ) -> Result<(MedicationCommand, MedicationEvent)> {
        let before = self.commands.require(&input.command_id).await?;
        ensure_recordable(&before)?;
        let now = self.clock.now();

        let mut request = CreateEventRequest::for_command(
            &before,
            EventData::DoseSkipped {
                scheduled_for: input.scheduled_for,
                reason: input.reason.clone(),
                notes: input.notes.clone(),
            },
            ctx,
        )
        .correlated(correlation_id)
        .salted(now.to_rfc3339());
        if let Some(scheduled) = input.scheduled_for {
            request = request
                .scheduled(scheduled, scheduled + before.grace())
                .related(self.scheduled_reference(&before, scheduled).await?);
        }

        self.write_dose(before, request).await
    }

    /// Best-effort lookup for error reports; a missing command surfaces
    /// from the workflow itself.
    async fn patient_of(&self, command_id: &str) -> Option<String> {
        match self.commands.get(command_id).await {
            Ok(command) => command.map(|c| c.patient_id),
            Err(_) => None,
        }
    }

    fn retry_scope<'a>(
        &'a self,
        operation: &'a str,
        ctx: &'a RequestContext,
        patient_id: Option<&'a str>,
    ) -> RetryScope<'a> {
        RetryScope {
            operation,
            context: ctx,
            patient_id,
            clock: self.clock.as_ref(),
        }
    }

    async fn write_dose(
        &self,
        before: MedicationCommand,
        request: CreateEventRequest,
    ) -> Result<(MedicationCommand, MedicationEvent)> {
        let event = self.events.build_event(request)?;
        let after = before.touched(&event.metadata.created_by, self.clock.now());

        self.coordinator
            .execute_dose(&before, &after, &event)
            .await
            .map_err(|e| {
                if e.is_already_exists() {
                    Error::Uniqueness {
                        field: "dose already recorded".to_string(),
                    }
                } else {
                    e
                }
            })?;
        Ok((after, event))
    }

    /// Back-reference to the generated DOSE_SCHEDULED event, when there is one.
    async fn scheduled_reference(
        &self,
        command: &MedicationCommand,
        scheduled_for: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let id = ids::event_id(
            &command.id,
            EventType::DoseScheduled.as_str(),
            &scheduled_for.to_rfc3339(),
        );
        Ok(if self.events.exists(&id).await? {
            vec![id]
        } else {
            vec![]
        })
    }

    // ---- command changes ----

    pub async fn change_status(
        &self,
        ctx: &RequestContext,
        input: ChangeStatusInput,
    ) -> WorkflowResult<MedicationCommand> {
        let mut run = WorkflowRun::start("change_status", ctx);
        let outcome = self.change_status_phases(ctx, &input, &mut run).await;
        let patient_id = outcome.as_ref().ok().map(|c| c.patient_id.clone());
        self.finish(run, outcome, ctx, patient_id.as_deref())
    }

    async fn change_status_phases(
        &self,
        ctx: &RequestContext,
        input: &ChangeStatusInput,
        run: &mut WorkflowRun,
    ) -> Result<MedicationCommand> {
        let before = self.commands.require(&input.command_id).await?;
        let from = before.status.current;
        let after = before.transition_to(
            input.status,
            input.reason.clone(),
            &ctx.actor_id,
            self.clock.now(),
        )?;

        let event = self.events.build_event(
            CreateEventRequest::for_command(
                &after,
                EventData::status_change(from, input.status, input.reason.clone()),
                ctx,
            )
            .correlated(&run.correlation_id)
            .salted(format!("v{}", after.version())),
        )?;
        self.coordinator
            .execute_status_change(&before, &after, &event)
            .await?;
        run.record_events(std::iter::once(&event.id));
        info!(
            command_id = %after.id,
            from = from.as_str(),
            to = input.status.as_str(),
            "Status changed"
        );

        if input.notify {
            let priority = if input.status == StatusKind::Discontinued {
                NotificationPriority::High
            } else {
                NotificationPriority::Normal
            };
            let request = NotificationRequest::new(
                after.patient_id.clone(),
                NotificationKind::StatusChanged,
                priority,
                "Medication status changed".to_string(),
                format!(
                    "{} changed from {} to {}",
                    after.medication.name,
                    from.as_str(),
                    input.status.as_str()
                ),
            )
            .for_command(&after.id)
            .with_data(json!({ "before": from, "after": input.status }));
            self.notify(run, request).await;
        }
        Ok(after)
    }

    pub async fn update_medication(
        &self,
        ctx: &RequestContext,
        command_id: &str,
        patch: CommandPatch,
    ) -> WorkflowResult<MedicationCommand> {
        let mut run = WorkflowRun::start("update_medication", ctx);
        let outcome = self.update_phases(ctx, command_id, &patch, &mut run).await;
        let patient_id = outcome.as_ref().ok().map(|c| c.patient_id.clone());
        self.finish(run, outcome, ctx, patient_id.as_deref())
    }

    async fn update_phases(
        &self,
        ctx: &RequestContext,
        command_id: &str,
        patch: &CommandPatch,
        run: &mut WorkflowRun,
    ) -> Result<MedicationCommand> {
        let ctx = ctx.clone().with_correlation(run.correlation_id.clone());
        let update = self.commands.prepare_update(&ctx, command_id, patch).await?;
        let rescheduled = if update.changes_schedule() {
            self.reschedule(&ctx, &update.after, &run.correlation_id).await?
        } else {
            vec![]
        };

        self.commands.commit_update(&update, &rescheduled).await?;
        run.record_events(std::iter::once(&update.event.id));
        run.record_events(rescheduled.iter().map(|e| &e.id));
        if !rescheduled.is_empty() {
            info!(
                command_id = %update.after.id,
                scheduled = rescheduled.len(),
                "Dose schedule regenerated"
            );
        }
        Ok(update.after)
    }

    /// DOSE_SCHEDULED events for upcoming slots of the new schedule that do
    /// not have one yet. Capped so they commit together with the replaced
    /// command and its update event.
    async fn reschedule(
        &self,
        ctx: &RequestContext,
        command: &MedicationCommand,
        correlation_id: &str,
    ) -> Result<Vec<MedicationEvent>> {
        let existing: HashSet<DateTime<Utc>> = self
            .events
            .query(&EventQuery::for_command(&command.id).of_type(EventType::DoseScheduled))
            .await?
            .iter()
            .filter_map(|e| e.timing.scheduled_for)
            .collect();
        let cap = self
            .config
            .max_generated_events
            .min(self.config.max_batch_size.saturating_sub(2));

        upcoming_doses(
            command,
            self.clock.now(),
            self.config.schedule_horizon_days,
            cap + existing.len(),
        )?
        .into_iter()
        .filter(|at| !existing.contains(at))
        .take(cap)
        .map(|at| self.scheduled_event(ctx, command, at, correlation_id))
        .collect()
    }

    fn scheduled_event(
        &self,
        ctx: &RequestContext,
        command: &MedicationCommand,
        at: DateTime<Utc>,
        correlation_id: &str,
    ) -> Result<MedicationEvent> {
        self.events.build_event(
            CreateEventRequest::for_command(
                command,
                EventData::DoseScheduled { scheduled_for: at },
                ctx,
            )
            .triggered_by(TriggerSource::SystemDetection)
            .scheduled(at, at + command.grace())
            .salted(at.to_rfc3339())
            .correlated(correlation_id),
        )
    }

    // ---- undo / correction ----

    pub async fn undo_event(
        &self,
        ctx: &RequestContext,
        request: UndoRequest,
        notify: bool,
    ) -> WorkflowResult<RetractionOutcome> {
        let run = WorkflowRun::start("undo_event", ctx);
        let outcome = self
            .undo
            .undo_event(ctx, &request, &run.correlation_id)
            .await;
        self.close_retraction(ctx, run, outcome, notify, NotificationKind::EventUndone)
            .await
    }

    pub async fn correct_event(
        &self,
        ctx: &RequestContext,
        request: CorrectionRequest,
        notify: bool,
    ) -> WorkflowResult<RetractionOutcome> {
        let run = WorkflowRun::start("correct_event", ctx);
        let outcome = self
            .undo
            .correct_event(ctx, &request, &run.correlation_id)
            .await;
        self.close_retraction(ctx, run, outcome, notify, NotificationKind::EventCorrected)
            .await
    }

    async fn close_retraction(
        &self,
        ctx: &RequestContext,
        mut run: WorkflowRun,
        outcome: Result<RetractionOutcome>,
        notify: bool,
        kind: NotificationKind,
    ) -> WorkflowResult<RetractionOutcome> {
        if let Ok(done) = &outcome {
            run.record_events(done.event_ids().iter());
            if notify {
                let request = NotificationRequest::new(
                    done.original.patient_id.clone(),
                    kind,
                    NotificationPriority::Low,
                    "Dose record changed".to_string(),
                    format!(
                        "{} recorded as {}",
                        done.original.event_type().as_str(),
                        done.retraction.event_type().as_str()
                    ),
                )
                .for_command(&done.original.command_id)
                .with_data(json!({ "adherence": done.adherence }));
                self.notify(&mut run, request).await;
            }
        }
        let patient_id = outcome.as_ref().ok().map(|o| o.original.patient_id.clone());
        self.finish(run, outcome, ctx, patient_id.as_deref())
    }

    // ---- missed doses ----

    /// Batch pass over every monitored medication.
    pub async fn detect_missed_doses(&self, ctx: &RequestContext) -> WorkflowResult<MissedDoseSummary> {
        let mut run = WorkflowRun::start("detect_missed_doses", ctx);
        let outcome = self.detect_phases(ctx, &mut run).await;
        self.finish(run, outcome, ctx, None)
    }

    async fn detect_phases(
        &self,
        ctx: &RequestContext,
        run: &mut WorkflowRun,
    ) -> Result<MissedDoseSummary> {
        let now = self.clock.now();
        let mut summary = MissedDoseSummary::default();

        for command in self.commands.list_monitored().await? {
            summary.commands_checked += 1;
            let overdue = match self.overdue_doses(&command, now).await {
                Ok(overdue) => overdue,
                Err(e) => {
                    warn!(command_id = %command.id, error = %e, "Missed-dose scan failed");
                    summary.failures += 1;
                    continue;
                }
            };
            for scheduled_for in overdue {
                match self.record_missed(ctx, &command, scheduled_for, run).await {
                    Ok(Some(_)) => summary.doses_missed += 1,
                    Ok(None) => summary.already_recorded += 1,
                    Err(e) => {
                        warn!(command_id = %command.id, error = %e, "Failed to record missed dose");
                        summary.failures += 1;
                    }
                }
            }
        }

        info!(
            checked = summary.commands_checked,
            missed = summary.doses_missed,
            failures = summary.failures,
            "Missed-dose detection finished"
        );
        Ok(summary)
    }

    /// Records one missed dose. `None` when it was already recorded.
    pub async fn process_missed_dose(
        &self,
        ctx: &RequestContext,
        command_id: &str,
        scheduled_for: DateTime<Utc>,
    ) -> WorkflowResult<Option<MedicationEvent>> {
        let mut run = WorkflowRun::start("process_missed_dose", ctx);
        let outcome = match self.commands.require(command_id).await {
            Ok(command) => self.record_missed(ctx, &command, scheduled_for, &mut run).await,
            Err(e) => Err(e),
        };
        let patient_id = outcome
            .as_ref()
            .ok()
            .and_then(|e| e.as_ref().map(|e| e.patient_id.clone()));
        self.finish(run, outcome, ctx, patient_id.as_deref())
    }

    async fn record_missed(
        &self,
        ctx: &RequestContext,
        command: &MedicationCommand,
        scheduled_for: DateTime<Utc>,
        run: &mut WorkflowRun,
    ) -> Result<Option<MedicationEvent>> {
        let now = self.clock.now();
        let request = CreateEventRequest::for_command(
            command,
            EventData::DoseMissed {
                scheduled_for,
                detected_at: now,
                grace_period_minutes: command.grace_period.minutes,
            },
            ctx,
        )
        .triggered_by(TriggerSource::MissedDetection)
        .scheduled(scheduled_for, scheduled_for + command.grace())
        .salted(scheduled_for.to_rfc3339())
        .related(self.scheduled_reference(command, scheduled_for).await?)
        .correlated(&run.correlation_id);

        let event = match self.events.create_event(request).await {
            Ok(event) => event,
            Err(e) if e.is_already_exists() => return Ok(None),
            Err(e) => return Err(e),
        };
        run.record_events(std::iter::once(&event.id));

        let request = NotificationRequest::new(
            command.patient_id.clone(),
            NotificationKind::DoseMissed,
            NotificationPriority::from(command.grace_period.class),
            "Missed dose".to_string(),
            format!(
                "{} {} scheduled for {} was not taken",
                command.medication.name,
                command.medication.dosage,
                scheduled_for.to_rfc3339()
            ),
        )
        .for_command(&command.id);
        self.notify(run, request).await;
        Ok(Some(event))
    }

    /// Scheduled doses past their grace period with nothing recorded against
    /// them inside the look-around window. Slots generated for a schedule
    /// that has since changed are dropped once they fall after the change.
    async fn overdue_doses(
        &self,
        command: &MedicationCommand,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        let oldest = now - self.config.missed_lookback;
        let latest = now - command.grace();
        let lookaround = self.config.missed_lookaround;

        let history = self.events.query(&EventQuery::for_command(&command.id)).await?;
        let retracted: HashSet<&str> = history
            .iter()
            .filter_map(|e| e.undo_data().map(|u| u.original_event_id.as_str()))
            .collect();

        let mut resolved_slots: HashSet<DateTime<Utc>> = HashSet::new();
        let mut unslotted: Vec<DateTime<Utc>> = Vec::new();
        for event in &history {
            let resolves = match event.event_type() {
                EventType::DoseTaken
                | EventType::PrnDoseTaken
                | EventType::DoseSkipped
                | EventType::DoseRescheduled => !retracted.contains(event.id.as_str()),
                EventType::DoseMissed
                | EventType::DoseMissedCorrected
                | EventType::DoseSkippedCorrected => true,
                EventType::MedicationCreated
                | EventType::MedicationUpdated
                | EventType::DoseScheduled
                | EventType::DoseSnoozed
                | EventType::MedicationPaused
                | EventType::MedicationHeld
                | EventType::MedicationResumed
                | EventType::MedicationDiscontinued
                | EventType::DoseTakenUndone => false,
            };
            if !resolves {
                continue;
            }
            match event.timing.scheduled_for {
                Some(slot) => {
                    resolved_slots.insert(slot);
                }
                None => unslotted.push(event.timestamp()),
            }
        }

        let schedule_changed_at = history
            .iter()
            .filter_map(|e| match &e.event_data {
                EventData::MedicationUpdated { changes, .. } if touches_schedule(changes) => {
                    Some(e.timestamp())
                }
                _ => None,
            })
            .max();

        let candidates = history
            .iter()
            .filter(|e| e.event_type() == EventType::DoseScheduled)
            .filter_map(|e| e.timing.scheduled_for)
            .filter(|slot| *slot >= oldest && *slot <= latest)
            .filter(|slot| !resolved_slots.contains(slot))
            .filter(|slot| {
                !unslotted
                    .iter()
                    .any(|at| (*at - *slot).abs() <= lookaround)
            });

        let mut overdue = Vec::new();
        for slot in candidates {
            let superseded = schedule_changed_at.is_some_and(|at| slot > at)
                && !is_scheduled_slot(command, slot)?;
            if !superseded {
                overdue.push(slot);
            }
        }
        Ok(overdue)
    }

    // ---- maintenance ----

    /// Archives events older than the retention window.
    pub async fn archive_expired_events(&self, ctx: &RequestContext) -> WorkflowResult<ArchiveSummary> {
        let run = WorkflowRun::start("archive_expired_events", ctx);
        let cutoff = self.clock.now() - self.config.event_retention;
        let outcome = self.events.archive_events_before(cutoff).await;
        self.finish(run, outcome, ctx, None)
    }

    /// Fire-and-continue: failures are logged and counted, never raised.
    async fn notify(&self, run: &mut WorkflowRun, request: NotificationRequest) {
        let breaker = self.breakers.get(NOTIFIER);
        match breaker.call(|| self.notifier.send(&request)).await {
            Ok(delivery) => {
                run.notifications_sent += delivery.total_sent;
                if delivery.total_failed > 0 {
                    warn!(
                        workflow_id = %run.workflow_id,
                        failed = delivery.total_failed,
                        "Some notifications were not delivered"
                    );
                }
            }
            Err(e) => warn!(workflow_id = %run.workflow_id, error = %e, "Notification skipped"),
        }
    }
}

fn duplicate_medication() -> Error {
    Error::Uniqueness {
        field: "medication already exists for this patient".to_string(),
    }
}

fn ensure_recordable(command: &MedicationCommand) -> Result<()> {
    if command.status.current == StatusKind::Discontinued {
        return Err(Error::validation(format!(
            "{} is discontinued; doses can no longer be recorded",
            command.medication.name
        )));
    }
    Ok(())
}
