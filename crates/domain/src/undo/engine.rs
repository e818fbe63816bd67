use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{Clock, RequestContext};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{
    CorrectedAction, CreateEventRequest, EventData, EventQuery, EventStore, EventTiming,
    EventType, MedicationEvent, TriggerSource, UndoData,
};
use crate::ids;
use crate::medications::CommandStore;
use crate::transactions::{templates::event_write, TransactionCoordinator, TransactionRequest};

use super::policy::{check_corrected_action, RetractionTarget, UndoPolicy, UndoValidation};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UndoRequest {
    pub event_id: String,
    pub reason: String,
    /// Recorded alongside the undo as a follow-up event
    #[serde(default)]
    pub corrected_action: Option<CorrectedAction>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectionRequest {
    pub event_id: String,
    pub reason: String,
    pub corrected_action: CorrectedAction,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AdherenceSnapshot {
    pub taken: usize,
    pub scheduled: usize,
    /// `None` when nothing was scheduled
    pub rate: Option<f64>,
}

/// Taken/scheduled counts over the adherence window, before and after a
/// retraction.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct AdherenceImpact {
    pub before: AdherenceSnapshot,
    pub after: AdherenceSnapshot,
    pub taken_delta: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RetractionOutcome {
    pub original: MedicationEvent,
    /// The undo or correction event
    pub retraction: MedicationEvent,
    pub follow_up: Option<MedicationEvent>,
    pub validation: UndoValidation,
    pub adherence: AdherenceImpact,
    pub transaction_id: String,
}

impl RetractionOutcome {
    pub fn event_ids(&self) -> Vec<String> {
        let mut ids = vec![self.retraction.id.clone()];
        ids.extend(self.follow_up.iter().map(|e| e.id.clone()));
        ids
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct UndoHistoryEntry {
    pub event: MedicationEvent,
    pub original_event_id: String,
    pub original_event_type: EventType,
    /// `None` once the original has been archived
    pub elapsed_seconds: Option<i64>,
}

/// Retracts and amends recorded events.
///
/// Every retraction of an event `X` is written under the same deterministic
/// ID with a not-exists guard, so the "already retracted" check and the
/// write are one atomic step in the store.
#[derive(Clone)]
pub struct UndoEngine {
    events: EventStore,
    commands: CommandStore,
    coordinator: Arc<TransactionCoordinator>,
    clock: Arc<dyn Clock>,
    policy: UndoPolicy,
    on_time_threshold: Duration,
    adherence_window: Duration,
}

impl UndoEngine {
    pub fn new(
        events: EventStore,
        commands: CommandStore,
        coordinator: Arc<TransactionCoordinator>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Self {
        Self {
            events,
            commands,
            coordinator,
            clock,
            policy: UndoPolicy::from(config),
            on_time_threshold: config.on_time_threshold,
            adherence_window: config.adherence_window,
        }
    }

    pub fn policy(&self) -> &UndoPolicy {
        &self.policy
    }

    /// Read-only check of whether `event_id` could be undone right now.
    pub async fn validate_undo(&self, event_id: &str) -> Result<UndoValidation> {
        let original = self.events.require_event(event_id).await?;
        let target = self.target(&original).await?;
        let elapsed = UndoPolicy::elapsed(original.timestamp(), self.clock.now());
        Ok(self.policy.validate_undo(target, elapsed))
    }

    pub async fn undo_event(
        &self,
        ctx: &RequestContext,
        request: &UndoRequest,
        correlation_id: &str,
    ) -> Result<RetractionOutcome> {
        let original = self.events.require_event(&request.event_id).await?;
        let now = self.clock.now();
        let elapsed = UndoPolicy::elapsed(original.timestamp(), now);
        let target = self.target(&original).await?;

        if target.already_retracted {
            return Err(Error::AlreadyRetracted {
                event_id: original.id,
            });
        }
        let validation = self.policy.validate_undo(target, elapsed).into_result()?;

        let undo_data = UndoData {
            original_event_id: original.id.clone(),
            original_event_type: original.event_type(),
            undo_reason: request.reason.clone(),
            undo_timestamp: now,
            corrected_action: request.corrected_action.clone(),
        };
        let scheduled_for = original.event_data.scheduled_for();

        let retraction = self.events.build_event(
            self.retraction_request(
                &original,
                EventData::DoseTakenUndone {
                    scheduled_for,
                    undo_data,
                },
                ctx,
                correlation_id,
            ),
        )?;

        let follow_up = match &request.corrected_action {
            Some(action) => Some(self.events.build_event(
                self.follow_up_request(&original, &retraction, action, ctx, correlation_id)
                    .await?,
            )?),
            None => None,
        };

        let adherence = self
            .adherence_impact(&original, &retraction, follow_up.as_ref(), now)
            .await?;

        let mut ops = vec![event_write(&retraction)?];
        if let Some(event) = &follow_up {
            ops.push(event_write(event)?);
        }
        let receipt = self
            .commit(&original, TransactionRequest::new("undo", ops), correlation_id)
            .await?;

        info!(
            event_id = %original.id,
            undo_event_id = %retraction.id,
            elapsed_seconds = validation.elapsed_seconds,
            "Event undone"
        );
        Ok(RetractionOutcome {
            original,
            retraction,
            follow_up,
            validation,
            adherence,
            transaction_id: receipt.transaction_id,
        })
    }

    pub async fn correct_event(
        &self,
        ctx: &RequestContext,
        request: &CorrectionRequest,
        correlation_id: &str,
    ) -> Result<RetractionOutcome> {
        let original = self.events.require_event(&request.event_id).await?;
        let now = self.clock.now();
        let elapsed = UndoPolicy::elapsed(original.timestamp(), now);
        let target = self.target(&original).await?;

        if target.already_retracted {
            return Err(Error::AlreadyRetracted {
                event_id: original.id,
            });
        }
        let validation = self.policy.validate_correction(target, elapsed).into_result()?;
        check_corrected_action(original.event_type(), &request.corrected_action)?;

        let scheduled_for = original.event_data.scheduled_for();
        let undo_data = UndoData {
            original_event_id: original.id.clone(),
            original_event_type: original.event_type(),
            undo_reason: request.reason.clone(),
            undo_timestamp: now,
            corrected_action: Some(request.corrected_action.clone()),
        };

        let data = match &request.corrected_action {
            CorrectedAction::Missed => EventData::DoseMissedCorrected {
                scheduled_for,
                notes: request.notes.clone(),
                undo_data,
            },
            CorrectedAction::Skipped { reason } => EventData::DoseSkippedCorrected {
                scheduled_for,
                reason: reason.clone(),
                undo_data,
            },
            CorrectedAction::Taken { taken_at } => EventData::DoseTaken {
                scheduled_for,
                taken_at: *taken_at,
                dosage: None,
                notes: request.notes.clone(),
                undo_data: Some(undo_data),
            },
            CorrectedAction::Rescheduled { new_time } => EventData::DoseRescheduled {
                original_time: scheduled_for,
                new_time: *new_time,
                reason: Some(request.reason.clone()),
                undo_data: Some(undo_data),
            },
        };

        let mut corrected = self.retraction_request(&original, data, ctx, correlation_id);
        if let (CorrectedAction::Taken { taken_at }, Some(scheduled)) =
            (&request.corrected_action, scheduled_for)
        {
            let (on_time, minutes_late) =
                EventTiming::punctuality(scheduled, *taken_at, self.on_time_threshold);
            corrected = corrected.punctuality(on_time, minutes_late);
        }
        let retraction = self.events.build_event(corrected)?;

        let adherence = self
            .adherence_impact(&original, &retraction, None, now)
            .await?;
        let receipt = self
            .commit(
                &original,
                TransactionRequest::new("correction", vec![event_write(&retraction)?]),
                correlation_id,
            )
            .await?;

        info!(
            event_id = %original.id,
            correction_event_id = %retraction.id,
            elapsed_seconds = validation.elapsed_seconds,
            "Event corrected"
        );
        Ok(RetractionOutcome {
            original,
            retraction,
            follow_up: None,
            validation,
            adherence,
            transaction_id: receipt.transaction_id,
        })
    }

    /// Every undo or correction recorded for a medication, oldest first.
    pub async fn undo_history(&self, command_id: &str) -> Result<Vec<UndoHistoryEntry>> {
        let events = self.events.query(&EventQuery::for_command(command_id)).await?;
        let mut history = Vec::new();

        for event in events {
            let Some(undo) = event.undo_data().cloned() else {
                continue;
            };
            let elapsed_seconds = self
                .events
                .get_event(&undo.original_event_id)
                .await?
                .map(|original| {
                    UndoPolicy::elapsed(original.timestamp(), event.timestamp()).num_seconds()
                });
            history.push(UndoHistoryEntry {
                original_event_id: undo.original_event_id,
                original_event_type: undo.original_event_type,
                elapsed_seconds,
                event,
            });
        }
        Ok(history)
    }

    /// Taken vs scheduled doses over the adherence window ending at `now`.
    /// Retracted takes are excluded.
    pub async fn adherence(&self, command_id: &str, now: DateTime<Utc>) -> Result<AdherenceSnapshot> {
        let history = self.events.query(&EventQuery::for_command(command_id)).await?;
        Ok(self.snapshot(history.iter(), now))
    }

    /// Both snapshots come from one read taken before the retraction is
    /// written; "after" is that history plus the new records.
    async fn adherence_impact(
        &self,
        original: &MedicationEvent,
        retraction: &MedicationEvent,
        follow_up: Option<&MedicationEvent>,
        now: DateTime<Utc>,
    ) -> Result<AdherenceImpact> {
        let history = self
            .events
            .query(&EventQuery::for_command(&original.command_id))
            .await?;
        let before = self.snapshot(history.iter(), now);
        let after = self.snapshot(
            history
                .iter()
                .chain(std::iter::once(retraction))
                .chain(follow_up),
            now,
        );
        Ok(impact(before, after))
    }

    fn snapshot<'a>(
        &self,
        events: impl Iterator<Item = &'a MedicationEvent>,
        now: DateTime<Utc>,
    ) -> AdherenceSnapshot {
        let from = now - self.adherence_window;
        let events: Vec<&MedicationEvent> = events.collect();

        let retracted: HashSet<&str> = events
            .iter()
            .filter_map(|e| e.undo_data().map(|u| u.original_event_id.as_str()))
            .collect();

        let in_window = |at: DateTime<Utc>| at >= from && at <= now;
        let scheduled = events
            .iter()
            .filter(|e| e.event_type() == EventType::DoseScheduled)
            .filter(|e| e.timing.scheduled_for.is_some_and(in_window))
            .count();
        let taken = events
            .iter()
            .filter(|e| e.event_type().counts_as_taken())
            .filter(|e| !retracted.contains(e.id.as_str()))
            .filter(|e| in_window(e.timestamp()))
            .count();

        AdherenceSnapshot {
            taken,
            scheduled,
            rate: (scheduled > 0).then(|| taken as f64 / scheduled as f64),
        }
    }

    async fn target(&self, original: &MedicationEvent) -> Result<RetractionTarget> {
        let already_retracted = self
            .events
            .exists(&ids::retraction_id(&original.command_id, &original.id))
            .await?;
        Ok(RetractionTarget {
            event_type: original.event_type(),
            compensating: original.undo_data().is_some(),
            already_retracted,
        })
    }

    fn retraction_request(
        &self,
        original: &MedicationEvent,
        data: EventData,
        ctx: &RequestContext,
        correlation_id: &str,
    ) -> CreateEventRequest {
        let mut request = CreateEventRequest::new(
            &original.command_id,
            &original.patient_id,
            data,
            ctx,
        )
        .with_id(ids::retraction_id(&original.command_id, &original.id))
        .related(vec![original.id.clone()])
        .correlated(correlation_id);
        request.medication_name = original.context.medication_name.clone();
        request
    }

    async fn follow_up_request(
        &self,
        original: &MedicationEvent,
        retraction: &MedicationEvent,
        action: &CorrectedAction,
        ctx: &RequestContext,
        correlation_id: &str,
    ) -> Result<CreateEventRequest> {
        let now = self.clock.now();
        let scheduled_for = original.event_data.scheduled_for();

        let data = match action {
            CorrectedAction::Missed => {
                let grace_period_minutes = match self.commands.get(&original.command_id).await? {
                    Some(command) => command.grace_period.minutes,
                    None => 0,
                };
                EventData::DoseMissed {
                    scheduled_for: scheduled_for.unwrap_or(original.timestamp()),
                    detected_at: now,
                    grace_period_minutes,
                }
            }
            CorrectedAction::Skipped { reason } => EventData::DoseSkipped {
                scheduled_for,
                reason: reason.clone(),
                notes: None,
            },
            CorrectedAction::Taken { taken_at } => EventData::DoseTaken {
                scheduled_for,
                taken_at: *taken_at,
                dosage: None,
                notes: None,
                undo_data: None,
            },
            CorrectedAction::Rescheduled { new_time } => EventData::DoseRescheduled {
                original_time: scheduled_for,
                new_time: *new_time,
                reason: None,
                undo_data: None,
            },
        };

        let mut request = CreateEventRequest::new(
            &original.command_id,
            &original.patient_id,
            data,
            ctx,
        )
        .salted(format!("follow-up:{}", original.id))
        .related(vec![original.id.clone(), retraction.id.clone()])
        .correlated(correlation_id)
        .triggered_by(TriggerSource::UserAction);
        request.medication_name = original.context.medication_name.clone();
        Ok(request)
    }

    async fn commit(
        &self,
        original: &MedicationEvent,
        request: TransactionRequest,
        correlation_id: &str,
    ) -> Result<crate::transactions::TransactionReceipt> {
        match self
            .coordinator
            .execute(request.correlation(Some(correlation_id)))
            .await
        {
            Ok(receipt) => Ok(receipt),
            Err(e) if e.is_already_exists() => {
                warn!(event_id = %original.id, "Concurrent retraction lost the race");
                Err(Error::AlreadyRetracted {
                    event_id: original.id.clone(),
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn impact(before: AdherenceSnapshot, after: AdherenceSnapshot) -> AdherenceImpact {
    AdherenceImpact {
        taken_delta: after.taken as i64 - before.taken as i64,
        before,
        after,
    }
}
