use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use ulid::Ulid;

use crate::clock::{Clock, RequestContext};
use crate::errors::{Error, Result};
use crate::ids;
use crate::medications::MedicationCommand;
use crate::store::{Collection, Direction, DocumentStore, Filter, Precondition, WriteOp};
use crate::transactions::{TransactionCoordinator, TransactionRequest};

use super::types::{
    ArchiveInfo, EventContext, EventData, EventMetadata, EventTiming, EventType, MedicationEvent,
    TriggerSource, EVENT_TYPE_PATH, SCHEMA_VERSION,
};

pub const ENTITY: &str = "MedicationEvent";

const TIMESTAMP_PATH: &str = "timing.event_timestamp";

/// Everything needed to mint one event.
#[derive(Clone, Debug)]
pub struct CreateEventRequest {
    pub command_id: String,
    pub patient_id: String,
    pub event_data: EventData,
    pub actor_id: String,
    pub trigger_source: TriggerSource,
    pub medication_name: Option<String>,
    pub related_event_ids: Vec<String>,
    pub event_timestamp: Option<DateTime<Utc>>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub grace_period_end: Option<DateTime<Utc>>,
    pub is_on_time: Option<bool>,
    pub minutes_late: Option<i64>,
    pub correlation_id: Option<String>,
    pub session_id: Option<String>,
    /// Distinguishes events of the same type on the same command
    pub id_salt: Option<String>,
    /// Fixed ID, used for retractions
    pub id: Option<String>,
}

impl CreateEventRequest {
    pub fn new(
        command_id: impl Into<String>,
        patient_id: impl Into<String>,
        event_data: EventData,
        ctx: &RequestContext,
    ) -> Self {
        Self {
            command_id: command_id.into(),
            patient_id: patient_id.into(),
            event_data,
            actor_id: ctx.actor_id.clone(),
            trigger_source: TriggerSource::UserAction,
            medication_name: None,
            related_event_ids: vec![],
            event_timestamp: None,
            scheduled_for: None,
            grace_period_end: None,
            is_on_time: None,
            minutes_late: None,
            correlation_id: ctx.correlation_id.clone(),
            session_id: ctx.session_id.clone(),
            id_salt: None,
            id: None,
        }
    }

    /// Request for an event on `command`, with its name snapshot.
    pub fn for_command(command: &MedicationCommand, event_data: EventData, ctx: &RequestContext) -> Self {
        let mut request = Self::new(&command.id, &command.patient_id, event_data, ctx);
        request.medication_name = Some(command.medication.name.clone());
        request
    }

    pub fn triggered_by(mut self, source: TriggerSource) -> Self {
        self.trigger_source = source;
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.event_timestamp = Some(timestamp);
        self
    }

    pub fn scheduled(mut self, scheduled_for: DateTime<Utc>, grace_period_end: DateTime<Utc>) -> Self {
        self.scheduled_for = Some(scheduled_for);
        self.grace_period_end = Some(grace_period_end);
        self
    }

    pub fn punctuality(mut self, is_on_time: bool, minutes_late: i64) -> Self {
        self.is_on_time = Some(is_on_time);
        self.minutes_late = Some(minutes_late);
        self
    }

    pub fn related(mut self, event_ids: Vec<String>) -> Self {
        self.related_event_ids = event_ids;
        self
    }

    pub fn correlated(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn salted(mut self, salt: impl Into<String>) -> Self {
        self.id_salt = Some(salt.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Filters over the event history. Archived events are excluded unless
/// asked for.
#[derive(Clone, Debug, Default)]
pub struct EventQuery {
    pub patient_id: Option<String>,
    pub command_id: Option<String>,
    pub event_types: Vec<EventType>,
    pub correlation_id: Option<String>,
    pub trigger_source: Option<TriggerSource>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub include_archived: bool,
    pub limit: Option<usize>,
    pub newest_first: bool,
}

impl EventQuery {
    pub fn for_patient(patient_id: &str) -> Self {
        Self {
            patient_id: Some(patient_id.to_string()),
            ..Default::default()
        }
    }

    pub fn for_command(command_id: &str) -> Self {
        Self {
            command_id: Some(command_id.to_string()),
            ..Default::default()
        }
    }

    pub fn of_type(mut self, event_type: EventType) -> Self {
        self.event_types = vec![event_type];
        self
    }

    pub fn of_types(mut self, event_types: &[EventType]) -> Self {
        self.event_types = event_types.to_vec();
        self
    }

    pub fn correlated(mut self, correlation_id: &str) -> Self {
        self.correlation_id = Some(correlation_id.to_string());
        self
    }

    pub fn triggered_by(mut self, source: TriggerSource) -> Self {
        self.trigger_source = Some(source);
        self
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn including_archived(mut self) -> Self {
        self.include_archived = true;
        self
    }

    pub fn newest_first(mut self) -> Self {
        self.newest_first = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn filter(&self) -> Result<Filter> {
        let mut filter = Filter::new();
        if let Some(patient_id) = &self.patient_id {
            filter = filter.eq("patient_id", patient_id.as_str());
        }
        if let Some(command_id) = &self.command_id {
            filter = filter.eq("command_id", command_id.as_str());
        }
        match self.event_types.as_slice() {
            [] => {}
            [single] => filter = filter.eq(EVENT_TYPE_PATH, single.as_str()),
            many => {
                let values = many.iter().map(|t| Value::from(t.as_str())).collect();
                filter = filter.any_of(EVENT_TYPE_PATH, values);
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            filter = filter.eq("metadata.correlation_id", correlation_id.as_str());
        }
        if let Some(source) = self.trigger_source {
            filter = filter.eq("context.trigger_source", serde_json::to_value(source)?);
        }
        if let Some(from) = self.from {
            filter = filter.gte(TIMESTAMP_PATH, from.to_rfc3339());
        }
        if let Some(to) = self.to {
            filter = filter.lte(TIMESTAMP_PATH, to.to_rfc3339());
        }
        let direction = if self.newest_first {
            Direction::Descending
        } else {
            Direction::Ascending
        };
        Ok(filter.order_by(TIMESTAMP_PATH, direction))
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchOutcome {
    pub created: Vec<MedicationEvent>,
    pub failed: Vec<BatchFailure>,
    pub transaction_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub archived: usize,
    pub batches: usize,
}

/// Repository for the append-only event history. All writes go through the
/// transaction coordinator and are create-only.
#[derive(Clone)]
pub struct EventStore {
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<TransactionCoordinator>,
    clock: Arc<dyn Clock>,
    max_batch_size: usize,
}

impl EventStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        coordinator: Arc<TransactionCoordinator>,
        clock: Arc<dyn Clock>,
        max_batch_size: usize,
    ) -> Self {
        Self {
            store,
            coordinator,
            clock,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Validates a request and mints the event without writing it.
    pub fn build_event(&self, request: CreateEventRequest) -> Result<MedicationEvent> {
        if request.command_id.trim().is_empty() {
            return Err(Error::validation("command_id is required"));
        }
        if request.patient_id.trim().is_empty() {
            return Err(Error::validation("patient_id is required"));
        }
        if request.actor_id.trim().is_empty() {
            return Err(Error::validation("actor is required"));
        }
        request.event_data.validate()?;

        let now = self.clock.now();
        let event_timestamp = request.event_timestamp.unwrap_or(now);
        let event_type = request.event_data.kind();
        let id = match request.id {
            Some(id) => id,
            None => {
                let salt = request
                    .id_salt
                    .unwrap_or_else(|| event_timestamp.to_rfc3339());
                ids::event_id(&request.command_id, event_type.as_str(), &salt)
            }
        };
        let scheduled_for = request.scheduled_for.or(request.event_data.scheduled_for());

        Ok(MedicationEvent {
            id,
            command_id: request.command_id,
            patient_id: request.patient_id,
            context: EventContext {
                medication_name: request.medication_name,
                trigger_source: request.trigger_source,
                related_event_ids: request.related_event_ids,
            },
            timing: EventTiming {
                event_timestamp,
                scheduled_for,
                grace_period_end: request.grace_period_end,
                is_on_time: request.is_on_time,
                minutes_late: request.minutes_late,
            },
            metadata: EventMetadata {
                schema_version: SCHEMA_VERSION.to_string(),
                created_at: now,
                created_by: request.actor_id,
                correlation_id: request
                    .correlation_id
                    .unwrap_or_else(|| Ulid::new().to_string()),
                session_id: request.session_id,
            },
            event_data: request.event_data,
            archive: None,
        })
    }

    pub async fn create_event(&self, request: CreateEventRequest) -> Result<MedicationEvent> {
        let event = self.build_event(request)?;
        let op = crate::transactions::templates::event_write(&event)?;

        self.coordinator
            .execute(
                TransactionRequest::new("create_event", vec![op])
                    .correlation(Some(&event.metadata.correlation_id)),
            )
            .await?;

        info!(event_id = %event.id, event_type = event.event_type().as_str(), "Event created");
        Ok(event)
    }

    /// Validates each request on its own; the valid ones are written in
    /// atomic chunks of at most `max_batch_size`. A failed chunk does not
    /// affect the others.
    pub async fn create_events_batch(&self, requests: Vec<CreateEventRequest>) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut accepted: Vec<(usize, MedicationEvent)> = Vec::new();
        let mut seen = HashSet::new();

        for (index, request) in requests.into_iter().enumerate() {
            match self.build_event(request) {
                Ok(event) if !seen.insert(event.id.clone()) => outcome.failed.push(BatchFailure {
                    index,
                    reason: format!("duplicate event {} in batch", event.id),
                }),
                Ok(event) => accepted.push((index, event)),
                Err(e) => outcome.failed.push(BatchFailure {
                    index,
                    reason: e.to_string(),
                }),
            }
        }

        for chunk in accepted.chunks(self.max_batch_size) {
            let mut ops = Vec::with_capacity(chunk.len());
            for (_, event) in chunk {
                ops.push(crate::transactions::templates::event_write(event)?);
            }
            let correlation = chunk
                .first()
                .map(|(_, event)| event.metadata.correlation_id.clone());

            match self
                .coordinator
                .execute(
                    TransactionRequest::new("create_events_batch", ops)
                        .correlation(correlation.as_deref()),
                )
                .await
            {
                Ok(receipt) => {
                    outcome.transaction_ids.push(receipt.transaction_id);
                    outcome
                        .created
                        .extend(chunk.iter().map(|(_, event)| event.clone()));
                }
                Err(e) => {
                    warn!(size = chunk.len(), error = %e, "Event batch rejected");
                    outcome
                        .failed
                        .extend(chunk.iter().map(|(index, _)| BatchFailure {
                            index: *index,
                            reason: e.to_string(),
                        }));
                }
            }
        }

        outcome.failed.sort_by_key(|f| f.index);
        Ok(outcome)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Option<MedicationEvent>> {
        match self.store.get(Collection::Events, event_id).await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc)?)),
            None => Ok(None),
        }
    }

    pub async fn require_event(&self, event_id: &str) -> Result<MedicationEvent> {
        self.get_event(event_id)
            .await?
            .ok_or_else(|| Error::not_found(ENTITY, event_id))
    }

    pub async fn exists(&self, event_id: &str) -> Result<bool> {
        Ok(self.store.exists(Collection::Events, event_id).await?)
    }

    pub async fn query(&self, query: &EventQuery) -> Result<Vec<MedicationEvent>> {
        let filter = query.filter()?;
        let mut docs = self.store.query(Collection::Events, &filter).await?;
        if query.include_archived {
            docs.extend(self.store.query(Collection::ArchivedEvents, &filter).await?);
            docs = filter.apply(docs);
        }

        let mut events = docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<MedicationEvent>, _>>()?;
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Moves events older than `cutoff` to the archive. Each batch copies
    /// and deletes in one transaction.
    pub async fn archive_events_before(&self, cutoff: DateTime<Utc>) -> Result<ArchiveSummary> {
        let filter = Filter::new()
            .lte(TIMESTAMP_PATH, cutoff.to_rfc3339())
            .order_by(TIMESTAMP_PATH, Direction::Ascending);
        let docs = self.store.query(Collection::Events, &filter).await?;
        let events = docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<MedicationEvent>, _>>()?;

        let mut summary = ArchiveSummary::default();
        let archived_at = self.clock.now();
        let per_batch = (self.max_batch_size / 2).max(1);

        for chunk in events.chunks(per_batch) {
            let mut ops = Vec::with_capacity(chunk.len() * 2);
            for event in chunk {
                let mut archived = event.clone();
                archived.archive = Some(ArchiveInfo {
                    archived_at,
                    archived_from: Collection::Events.as_str().to_string(),
                });
                ops.push(WriteOp::create(
                    Collection::ArchivedEvents,
                    &event.id,
                    serde_json::to_value(&archived)?,
                ));
                ops.push(WriteOp::delete(Collection::Events, &event.id).when(Precondition::Exists));
            }
            self.coordinator
                .execute(TransactionRequest::new("archive_events", ops))
                .await?;
            summary.archived += chunk.len();
            summary.batches += 1;
        }

        info!(archived = summary.archived, cutoff = %cutoff, "Events archived");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn start() -> DateTime<Utc> {
        "2024-03-01T08:00:00Z".parse().unwrap()
    }

    fn event_store(max_batch_size: usize) -> (EventStore, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let coordinator = Arc::new(TransactionCoordinator::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(5),
        ));
        (
            EventStore::new(store.clone(), coordinator, clock.clone(), max_batch_size),
            store,
            clock,
        )
    }

    fn skipped(command_id: &str) -> CreateEventRequest {
        CreateEventRequest::new(
            command_id,
            "patient-1",
            EventData::DoseSkipped {
                scheduled_for: None,
                reason: None,
                notes: None,
            },
            &RequestContext::new("u1"),
        )
    }

    #[tokio::test]
    async fn test_create_assigns_identity_and_correlation() {
        let (events, _, _) = event_store(10);
        let event = events.create_event(skipped("cmd_1")).await.unwrap();

        assert!(event.id.starts_with("evt_"));
        assert!(!event.metadata.correlation_id.is_empty());
        assert_eq!(event.timing.event_timestamp, start());
        assert_eq!(events.require_event(&event.id).await.unwrap(), event);
    }

    #[tokio::test]
    async fn test_same_identity_cannot_be_written_twice() {
        let (events, _, _) = event_store(10);
        events.create_event(skipped("cmd_1")).await.unwrap();
        let again = events.create_event(skipped("cmd_1")).await;
        assert!(again.unwrap_err().is_already_exists());
    }

    #[tokio::test]
    async fn test_batch_keeps_valid_members() {
        let (events, _, _) = event_store(2);
        let requests = vec![
            skipped("cmd_1").salted("a"),
            skipped("").salted("b"),
            skipped("cmd_1").salted("c"),
            skipped("cmd_1").salted("a"),
            skipped("cmd_1").salted("d"),
        ];
        let outcome = events.create_events_batch(requests).await.unwrap();

        assert_eq!(outcome.created.len(), 3);
        assert_eq!(outcome.transaction_ids.len(), 2);
        let failed: Vec<usize> = outcome.failed.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_query_filters_and_excludes_archived() {
        let (events, _, clock) = event_store(10);
        let old = events.create_event(skipped("cmd_1")).await.unwrap();
        clock.advance(ChronoDuration::days(400));
        let recent = events.create_event(skipped("cmd_1")).await.unwrap();
        events.create_event(skipped("cmd_2")).await.unwrap();

        let summary = events
            .archive_events_before(clock.now() - ChronoDuration::days(365))
            .await
            .unwrap();
        assert_eq!(summary.archived, 1);

        let visible = events.query(&EventQuery::for_command("cmd_1")).await.unwrap();
        assert_eq!(visible, vec![recent.clone()]);

        let all = events
            .query(&EventQuery::for_command("cmd_1").including_archived())
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, old.id);
        assert!(all[0].archive.is_some());
    }

    #[tokio::test]
    async fn test_query_by_type_set() {
        let (events, _, _) = event_store(10);
        events.create_event(skipped("cmd_1")).await.unwrap();
        let found = events
            .query(&EventQuery::for_patient("patient-1").of_types(&[EventType::DoseTaken, EventType::DoseSkipped]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let none = events
            .query(&EventQuery::for_patient("patient-1").of_type(EventType::DoseTaken))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
