//! Fixed operation templates for the recurring multi-document writes.

use serde_json::json;

use crate::errors::Result;
use crate::events::MedicationEvent;
use crate::medications::MedicationCommand;
use crate::store::{Collection, WriteOp};

use super::coordinator::{TransactionCoordinator, TransactionReceipt, TransactionRequest};

const VERSION_PATH: &str = "metadata.version";

/// Events are write-once.
pub fn event_write(event: &MedicationEvent) -> Result<WriteOp> {
    Ok(WriteOp::create(
        Collection::Events,
        &event.id,
        serde_json::to_value(event)?,
    ))
}

/// Command plus its initial events. The command must not exist yet.
pub fn creation_operations(
    command: &MedicationCommand,
    events: &[MedicationEvent],
) -> Result<Vec<WriteOp>> {
    let mut ops = vec![WriteOp::create(
        Collection::Commands,
        &command.id,
        serde_json::to_value(command)?,
    )];
    for event in events {
        ops.push(event_write(event)?);
    }
    Ok(ops)
}

/// One dose event plus the command's metadata bump.
pub fn dose_operations(
    before: &MedicationCommand,
    after: &MedicationCommand,
    event: &MedicationEvent,
) -> Result<Vec<WriteOp>> {
    Ok(vec![
        event_write(event)?,
        WriteOp::update(
            Collection::Commands,
            &after.id,
            json!({ "metadata": serde_json::to_value(&after.metadata)? }),
        )
        .when_field(VERSION_PATH, before.version()),
    ])
}

/// Status block update plus the status-change event.
pub fn status_change_operations(
    before: &MedicationCommand,
    after: &MedicationCommand,
    event: &MedicationEvent,
) -> Result<Vec<WriteOp>> {
    Ok(vec![
        WriteOp::update(
            Collection::Commands,
            &after.id,
            json!({
                "status": serde_json::to_value(&after.status)?,
                "metadata": serde_json::to_value(&after.metadata)?,
            }),
        )
        .when_field(VERSION_PATH, before.version()),
        event_write(event)?,
    ])
}

/// Full replacement of a command plus any events describing the change.
pub fn command_replace_operations(
    before: &MedicationCommand,
    after: &MedicationCommand,
    events: &[MedicationEvent],
) -> Result<Vec<WriteOp>> {
    let mut ops = vec![WriteOp::set(
        Collection::Commands,
        &after.id,
        serde_json::to_value(after)?,
    )
    .when_field(VERSION_PATH, before.version())];
    for event in events {
        ops.push(event_write(event)?);
    }
    Ok(ops)
}

impl TransactionCoordinator {
    pub async fn execute_creation(
        &self,
        command: &MedicationCommand,
        events: &[MedicationEvent],
        correlation_id: Option<&str>,
    ) -> Result<TransactionReceipt> {
        let request =
            TransactionRequest::new("creation", creation_operations(command, events)?)
                .correlation(correlation_id);
        self.execute(request).await
    }

    pub async fn execute_dose(
        &self,
        before: &MedicationCommand,
        after: &MedicationCommand,
        event: &MedicationEvent,
    ) -> Result<TransactionReceipt> {
        let request = TransactionRequest::new("dose", dose_operations(before, after, event)?)
            .correlation(Some(&event.metadata.correlation_id));
        self.execute(request).await
    }

    pub async fn execute_status_change(
        &self,
        before: &MedicationCommand,
        after: &MedicationCommand,
        event: &MedicationEvent,
    ) -> Result<TransactionReceipt> {
        let request = TransactionRequest::new(
            "status_change",
            status_change_operations(before, after, event)?,
        )
        .correlation(Some(&event.metadata.correlation_id));
        self.execute(request).await
    }

    pub async fn execute_command_replace(
        &self,
        before: &MedicationCommand,
        after: &MedicationCommand,
        events: &[MedicationEvent],
        correlation_id: Option<&str>,
    ) -> Result<TransactionReceipt> {
        let request = TransactionRequest::new(
            "command_replace",
            command_replace_operations(before, after, events)?,
        )
        .correlation(correlation_id);
        self.execute(request).await
    }
}
