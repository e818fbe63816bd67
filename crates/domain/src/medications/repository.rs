use std::sync::Arc;

use tracing::{info, warn};

use crate::clock::{Clock, RequestContext};
use crate::errors::{Error, Result};
use crate::events::{CreateEventRequest, EventData, EventStore, MedicationEvent};
use crate::store::{Collection, DocumentStore, Filter, WriteOp};
use crate::transactions::{RollbackStrategy, TransactionCoordinator, TransactionRequest};

use super::command::{MedicationCommand, ENTITY};
use super::inputs::CommandPatch;

/// A validated command replacement awaiting its write.
#[derive(Clone, Debug)]
pub struct PendingUpdate {
    pub before: MedicationCommand,
    pub after: MedicationCommand,
    pub event: MedicationEvent,
}

impl PendingUpdate {
    /// Frequency, times, dates or zone changed, so the dose slots did too.
    pub fn changes_schedule(&self) -> bool {
        match &self.event.event_data {
            EventData::MedicationUpdated { changes, .. } => touches_schedule(changes),
            _ => false,
        }
    }
}

/// Whether a MEDICATION_UPDATED change list moves dose slots.
pub fn touches_schedule(changes: &[String]) -> bool {
    changes.iter().any(|field| field.starts_with(SCHEDULE_FIELDS))
}

const SCHEDULE_FIELDS: &str = "schedule.";

/// Repository for the command projection. Reads hit the store directly;
/// every mutation goes through the transaction coordinator.
#[derive(Clone)]
pub struct CommandStore {
    store: Arc<dyn DocumentStore>,
    coordinator: Arc<TransactionCoordinator>,
    events: EventStore,
    clock: Arc<dyn Clock>,
}

impl CommandStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        coordinator: Arc<TransactionCoordinator>,
        events: EventStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            coordinator,
            events,
            clock,
        }
    }

    pub async fn get(&self, command_id: &str) -> Result<Option<MedicationCommand>> {
        let Some(doc) = self.store.get(Collection::Commands, command_id).await? else {
            return Ok(None);
        };
        let command: MedicationCommand = serde_json::from_value(doc)?;
        if !command.verify_checksum() {
            warn!(command_id, "Command checksum mismatch");
        }
        Ok(Some(command))
    }

    pub async fn require(&self, command_id: &str) -> Result<MedicationCommand> {
        self.get(command_id)
            .await?
            .ok_or_else(|| Error::not_found(ENTITY, command_id))
    }

    pub async fn list_for_patient(&self, patient_id: &str) -> Result<Vec<MedicationCommand>> {
        self.list(&Filter::new().eq("patient_id", patient_id)).await
    }

    /// Active, scheduled (non-PRN) medications: the ones that can miss doses.
    pub async fn list_monitored(&self) -> Result<Vec<MedicationCommand>> {
        self.list(
            &Filter::new()
                .eq("status.is_active", true)
                .eq("status.is_prn", false),
        )
        .await
    }

    async fn list(&self, filter: &Filter) -> Result<Vec<MedicationCommand>> {
        let docs = self.store.query(Collection::Commands, filter).await?;
        Ok(docs
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?)
    }

    /// Read, patch, re-validate, write. The write is guarded on the version
    /// that was read, so a rejected or conflicting update changes nothing.
    pub async fn update_command(
        &self,
        ctx: &RequestContext,
        command_id: &str,
        patch: &CommandPatch,
    ) -> Result<(MedicationCommand, MedicationEvent)> {
        let update = self.prepare_update(ctx, command_id, patch).await?;
        self.commit_update(&update, &[]).await?;
        Ok((update.after, update.event))
    }

    /// Validates a patch against the stored command without writing.
    pub async fn prepare_update(
        &self,
        ctx: &RequestContext,
        command_id: &str,
        patch: &CommandPatch,
    ) -> Result<PendingUpdate> {
        let before = self.require(command_id).await?;
        let after = before.patched(patch, &ctx.actor_id, self.clock.now())?;

        let event = self.events.build_event(
            CreateEventRequest::for_command(
                &after,
                EventData::MedicationUpdated {
                    previous_version: before.version(),
                    changes: changed_fields(&before, &after),
                },
                ctx,
            )
            .salted(format!("v{}", after.version())),
        )?;

        Ok(PendingUpdate {
            before,
            after,
            event,
        })
    }

    /// Writes the replacement, its update event and `extra_events` in one
    /// transaction.
    pub async fn commit_update(
        &self,
        update: &PendingUpdate,
        extra_events: &[MedicationEvent],
    ) -> Result<()> {
        let mut events = Vec::with_capacity(extra_events.len() + 1);
        events.push(update.event.clone());
        events.extend_from_slice(extra_events);

        self.coordinator
            .execute_command_replace(
                &update.before,
                &update.after,
                &events,
                Some(&update.event.metadata.correlation_id),
            )
            .await?;

        info!(
            command_id = %update.after.id,
            version = update.after.version(),
            events = events.len(),
            "Command updated"
        );
        Ok(())
    }

    /// Administrative removal. Its events are left in place.
    pub async fn delete_command(&self, command_id: &str) -> Result<()> {
        self.require(command_id).await?;
        self.coordinator
            .execute(
                TransactionRequest::new("delete_command", vec![Self::delete_op(command_id)])
                    .rollback(RollbackStrategy::Manual),
            )
            .await?;
        warn!(command_id, "Command deleted");
        Ok(())
    }

    pub(crate) fn delete_op(command_id: &str) -> WriteOp {
        WriteOp::delete(Collection::Commands, command_id)
    }
}

fn changed_fields(before: &MedicationCommand, after: &MedicationCommand) -> Vec<String> {
    let checks = [
        ("medication", before.medication != after.medication),
        ("schedule.frequency", before.schedule.frequency != after.schedule.frequency),
        ("schedule.times", before.schedule.times != after.schedule.times),
        ("schedule.end_date", before.schedule.end_date != after.schedule.end_date),
        ("schedule.time_zone", before.schedule.time_zone != after.schedule.time_zone),
        ("grace_period", before.grace_period != after.grace_period),
    ];
    let changes: Vec<String> = checks
        .iter()
        .filter(|(_, changed)| *changed)
        .map(|(field, _)| field.to_string())
        .collect();
    if changes.is_empty() {
        // The patch restated current values.
        vec!["metadata".to_string()]
    } else {
        changes
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::medications::{CreateMedicationInput, Frequency, MedicationClass, MedicationInfo};
    use crate::store::MemoryStore;

    async fn seeded() -> (CommandStore, Arc<MemoryStore>, MedicationCommand) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new("2024-03-01T07:00:00Z".parse().unwrap()));
        let coordinator = Arc::new(TransactionCoordinator::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(5),
        ));
        let events = EventStore::new(store.clone(), coordinator.clone(), clock.clone(), 100);
        let commands = CommandStore::new(store.clone(), coordinator.clone(), events, clock.clone());

        let input = CreateMedicationInput {
            patient_id: "patient-1".to_string(),
            medication: MedicationInfo {
                name: "Lisinopril".to_string(),
                dosage: "10mg".to_string(),
                form: None,
                instructions: None,
            },
            frequency: Frequency::OnceDaily,
            times: None,
            start_date: None,
            end_date: None,
            time_zone: None,
            medication_class: MedicationClass::Critical,
            computed_from_preferences: false,
            notify: false,
        };
        let command = MedicationCommand::create(&input, "u1", clock.now()).unwrap();
        coordinator.execute_creation(&command, &[], None).await.unwrap();
        (commands, store, command)
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_records_event() {
        let (commands, _, command) = seeded().await;
        let patch = CommandPatch {
            times: Some(vec!["09:30".to_string()]),
            ..Default::default()
        };

        let (updated, event) = commands
            .update_command(&RequestContext::new("u2"), &command.id, &patch)
            .await
            .unwrap();

        assert_eq!(updated.version(), 2);
        assert_eq!(commands.require(&command.id).await.unwrap(), updated);
        assert_eq!(
            event.event_data,
            EventData::MedicationUpdated {
                previous_version: 1,
                changes: vec!["schedule.times".to_string()],
            }
        );
    }

    #[test]
    fn test_schedule_fields_move_slots() {
        assert!(touches_schedule(&["schedule.times".to_string()]));
        assert!(!touches_schedule(&["grace_period".to_string(), "medication".to_string()]));
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_stored_command() {
        let (commands, _, command) = seeded().await;
        let patch = CommandPatch {
            times: Some(vec!["08:00".to_string(), "20:00".to_string()]),
            ..Default::default()
        };

        let result = commands
            .update_command(&RequestContext::new("u2"), &command.id, &patch)
            .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(commands.require(&command.id).await.unwrap(), command);
    }

    #[tokio::test]
    async fn test_monitored_excludes_prn_and_inactive() {
        let (commands, _, command) = seeded().await;
        assert_eq!(commands.list_monitored().await.unwrap().len(), 1);
        assert_eq!(commands.list_for_patient("patient-1").await.unwrap(), vec![command.clone()]);

        commands.delete_command(&command.id).await.unwrap();
        assert!(commands.list_monitored().await.unwrap().is_empty());
        assert!(matches!(
            commands.delete_command(&command.id).await,
            Err(Error::NotFound { .. })
        ));
    }
}
