use chrono::{DateTime, Utc};
use cqrs_es::DomainEvent;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::medications::{Frequency, StatusKind};

pub const SCHEMA_VERSION: &str = "1.0";

/// Field path of the event-type tag inside a stored event document.
pub const EVENT_TYPE_PATH: &str = "event_data.type";

/// Field path of the original-event back-reference on compensating events.
pub const ORIGINAL_EVENT_PATH: &str = "event_data.undo_data.original_event_id";

/// Closed set of event types. Serialized names match the `EventData` tags.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MedicationCreated,
    MedicationUpdated,
    DoseScheduled,
    DoseTaken,
    PrnDoseTaken,
    DoseMissed,
    DoseSkipped,
    DoseSnoozed,
    DoseRescheduled,
    MedicationPaused,
    MedicationHeld,
    MedicationResumed,
    MedicationDiscontinued,
    DoseTakenUndone,
    DoseMissedCorrected,
    DoseSkippedCorrected,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::MedicationCreated => "MEDICATION_CREATED",
            EventType::MedicationUpdated => "MEDICATION_UPDATED",
            EventType::DoseScheduled => "DOSE_SCHEDULED",
            EventType::DoseTaken => "DOSE_TAKEN",
            EventType::PrnDoseTaken => "PRN_DOSE_TAKEN",
            EventType::DoseMissed => "DOSE_MISSED",
            EventType::DoseSkipped => "DOSE_SKIPPED",
            EventType::DoseSnoozed => "DOSE_SNOOZED",
            EventType::DoseRescheduled => "DOSE_RESCHEDULED",
            EventType::MedicationPaused => "MEDICATION_PAUSED",
            EventType::MedicationHeld => "MEDICATION_HELD",
            EventType::MedicationResumed => "MEDICATION_RESUMED",
            EventType::MedicationDiscontinued => "MEDICATION_DISCONTINUED",
            EventType::DoseTakenUndone => "DOSE_TAKEN_UNDONE",
            EventType::DoseMissedCorrected => "DOSE_MISSED_CORRECTED",
            EventType::DoseSkippedCorrected => "DOSE_SKIPPED_CORRECTED",
        }
    }

    /// Events that may be retracted inside the undo window.
    pub fn is_undoable(&self) -> bool {
        matches!(self, EventType::DoseTaken | EventType::PrnDoseTaken)
    }

    /// Events that may be amended inside the correction window.
    pub fn is_correctable(&self) -> bool {
        self.is_undoable() || matches!(self, EventType::DoseMissed | EventType::DoseSkipped)
    }

    pub fn counts_as_taken(&self) -> bool {
        matches!(self, EventType::DoseTaken | EventType::PrnDoseTaken)
    }
}

/// Replacement outcome requested by an undo or correction.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CorrectedAction {
    Missed,
    Skipped {
        #[serde(default)]
        reason: Option<String>,
    },
    Taken {
        taken_at: DateTime<Utc>,
    },
    Rescheduled {
        new_time: DateTime<Utc>,
    },
}

/// Back-reference carried by every compensating event.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct UndoData {
    pub original_event_id: String,
    pub original_event_type: EventType,
    pub undo_reason: String,
    pub undo_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub corrected_action: Option<CorrectedAction>,
}

/// Event payload, one variant per event type.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventData {
    MedicationCreated {
        medication_name: String,
        dosage: String,
        frequency: Frequency,
        times: Vec<String>,
    },

    MedicationUpdated {
        previous_version: u64,
        changes: Vec<String>,
    },

    DoseScheduled {
        scheduled_for: DateTime<Utc>,
    },

    DoseTaken {
        #[serde(default)]
        scheduled_for: Option<DateTime<Utc>>,
        taken_at: DateTime<Utc>,
        #[serde(default)]
        dosage: Option<String>,
        #[serde(default)]
        notes: Option<String>,
        /// Present when this is a correction to "taken"
        #[serde(default, skip_serializing_if = "Option::is_none")]
        undo_data: Option<UndoData>,
    },

    PrnDoseTaken {
        taken_at: DateTime<Utc>,
        #[serde(default)]
        dosage: Option<String>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },

    DoseMissed {
        scheduled_for: DateTime<Utc>,
        detected_at: DateTime<Utc>,
        grace_period_minutes: i64,
    },

    DoseSkipped {
        #[serde(default)]
        scheduled_for: Option<DateTime<Utc>>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        notes: Option<String>,
    },

    DoseSnoozed {
        scheduled_for: DateTime<Utc>,
        snoozed_until: DateTime<Utc>,
    },

    DoseRescheduled {
        #[serde(default)]
        original_time: Option<DateTime<Utc>>,
        new_time: DateTime<Utc>,
        #[serde(default)]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        undo_data: Option<UndoData>,
    },

    MedicationPaused {
        from: StatusKind,
        #[serde(default)]
        reason: Option<String>,
    },

    MedicationHeld {
        from: StatusKind,
        #[serde(default)]
        reason: Option<String>,
    },

    MedicationResumed {
        from: StatusKind,
        #[serde(default)]
        reason: Option<String>,
    },

    MedicationDiscontinued {
        from: StatusKind,
        #[serde(default)]
        reason: Option<String>,
    },

    DoseTakenUndone {
        #[serde(default)]
        scheduled_for: Option<DateTime<Utc>>,
        undo_data: UndoData,
    },

    DoseMissedCorrected {
        #[serde(default)]
        scheduled_for: Option<DateTime<Utc>>,
        #[serde(default)]
        notes: Option<String>,
        undo_data: UndoData,
    },

    DoseSkippedCorrected {
        #[serde(default)]
        scheduled_for: Option<DateTime<Utc>>,
        #[serde(default)]
        reason: Option<String>,
        undo_data: UndoData,
    },
}

const MAX_TEXT_LEN: usize = 1000;

impl EventData {
    pub fn kind(&self) -> EventType {
        match self {
            EventData::MedicationCreated { .. } => EventType::MedicationCreated,
            EventData::MedicationUpdated { .. } => EventType::MedicationUpdated,
            EventData::DoseScheduled { .. } => EventType::DoseScheduled,
            EventData::DoseTaken { .. } => EventType::DoseTaken,
            EventData::PrnDoseTaken { .. } => EventType::PrnDoseTaken,
            EventData::DoseMissed { .. } => EventType::DoseMissed,
            EventData::DoseSkipped { .. } => EventType::DoseSkipped,
            EventData::DoseSnoozed { .. } => EventType::DoseSnoozed,
            EventData::DoseRescheduled { .. } => EventType::DoseRescheduled,
            EventData::MedicationPaused { .. } => EventType::MedicationPaused,
            EventData::MedicationHeld { .. } => EventType::MedicationHeld,
            EventData::MedicationResumed { .. } => EventType::MedicationResumed,
            EventData::MedicationDiscontinued { .. } => EventType::MedicationDiscontinued,
            EventData::DoseTakenUndone { .. } => EventType::DoseTakenUndone,
            EventData::DoseMissedCorrected { .. } => EventType::DoseMissedCorrected,
            EventData::DoseSkippedCorrected { .. } => EventType::DoseSkippedCorrected,
        }
    }

    /// Status-change payload for a transition into `to`.
    pub fn status_change(from: StatusKind, to: StatusKind, reason: Option<String>) -> Self {
        match to {
            StatusKind::Active => EventData::MedicationResumed { from, reason },
            StatusKind::Paused => EventData::MedicationPaused { from, reason },
            StatusKind::Held => EventData::MedicationHeld { from, reason },
            StatusKind::Discontinued => EventData::MedicationDiscontinued { from, reason },
        }
    }

    pub fn undo_data(&self) -> Option<&UndoData> {
        match self {
            EventData::DoseTaken { undo_data, .. } | EventData::DoseRescheduled { undo_data, .. } => {
                undo_data.as_ref()
            }
            EventData::DoseTakenUndone { undo_data, .. }
            | EventData::DoseMissedCorrected { undo_data, .. }
            | EventData::DoseSkippedCorrected { undo_data, .. } => Some(undo_data),
            EventData::MedicationCreated { .. }
            | EventData::MedicationUpdated { .. }
            | EventData::DoseScheduled { .. }
            | EventData::PrnDoseTaken { .. }
            | EventData::DoseMissed { .. }
            | EventData::DoseSkipped { .. }
            | EventData::DoseSnoozed { .. }
            | EventData::MedicationPaused { .. }
            | EventData::MedicationHeld { .. }
            | EventData::MedicationResumed { .. }
            | EventData::MedicationDiscontinued { .. } => None,
        }
    }

    /// The dose slot this payload refers to, if any.
    pub fn scheduled_for(&self) -> Option<DateTime<Utc>> {
        match self {
            EventData::DoseScheduled { scheduled_for }
            | EventData::DoseMissed { scheduled_for, .. }
            | EventData::DoseSnoozed { scheduled_for, .. } => Some(*scheduled_for),
            EventData::DoseTaken { scheduled_for, .. }
            | EventData::DoseSkipped { scheduled_for, .. }
            | EventData::DoseTakenUndone { scheduled_for, .. }
            | EventData::DoseMissedCorrected { scheduled_for, .. }
            | EventData::DoseSkippedCorrected { scheduled_for, .. } => *scheduled_for,
            EventData::DoseRescheduled { original_time, .. } => *original_time,
            EventData::MedicationCreated { .. }
            | EventData::MedicationUpdated { .. }
            | EventData::PrnDoseTaken { .. }
            | EventData::MedicationPaused { .. }
            | EventData::MedicationHeld { .. }
            | EventData::MedicationResumed { .. }
            | EventData::MedicationDiscontinued { .. } => None,
        }
    }

    /// Shape checks the type system cannot express.
    pub fn validate(&self) -> Result<()> {
        match self {
            EventData::MedicationCreated {
                medication_name,
                dosage,
                ..
            } => {
                require_text("medication_name", medication_name)?;
                require_text("dosage", dosage)
            }
            EventData::MedicationUpdated { changes, .. } => {
                if changes.is_empty() {
                    return Err(Error::validation("MEDICATION_UPDATED requires at least one change"));
                }
                Ok(())
            }
            EventData::DoseScheduled { .. } | EventData::DoseMissed { .. } => Ok(()),
            EventData::DoseTaken {
                dosage,
                notes,
                undo_data,
                ..
            } => {
                limit_text("dosage", dosage)?;
                limit_text("notes", notes)?;
                undo_data.as_ref().map_or(Ok(()), validate_undo_data)
            }
            EventData::PrnDoseTaken {
                dosage,
                reason,
                notes,
                ..
            } => {
                limit_text("dosage", dosage)?;
                limit_text("reason", reason)?;
                limit_text("notes", notes)
            }
            EventData::DoseSkipped { reason, notes, .. } => {
                limit_text("reason", reason)?;
                limit_text("notes", notes)
            }
            EventData::DoseSnoozed {
                scheduled_for,
                snoozed_until,
            } => {
                if snoozed_until <= scheduled_for {
                    return Err(Error::validation("snoozed_until must be after scheduled_for"));
                }
                Ok(())
            }
            EventData::DoseRescheduled {
                reason, undo_data, ..
            } => {
                limit_text("reason", reason)?;
                undo_data.as_ref().map_or(Ok(()), validate_undo_data)
            }
            EventData::MedicationPaused { reason, .. }
            | EventData::MedicationHeld { reason, .. }
            | EventData::MedicationResumed { reason, .. }
            | EventData::MedicationDiscontinued { reason, .. } => limit_text("reason", reason),
            EventData::DoseTakenUndone { undo_data, .. } => validate_undo_data(undo_data),
            EventData::DoseMissedCorrected {
                notes, undo_data, ..
            } => {
                limit_text("notes", notes)?;
                validate_undo_data(undo_data)
            }
            EventData::DoseSkippedCorrected {
                reason, undo_data, ..
            } => {
                limit_text("reason", reason)?;
                validate_undo_data(undo_data)
            }
        }
    }
}

fn validate_undo_data(undo: &UndoData) -> Result<()> {
    require_text("undo_data.original_event_id", &undo.original_event_id)?;
    require_text("undo_data.undo_reason", &undo.undo_reason)
}

fn require_text(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    if value.len() > MAX_TEXT_LEN {
        return Err(Error::validation(format!("{field} exceeds {MAX_TEXT_LEN} characters")));
    }
    Ok(())
}

fn limit_text(field: &str, value: &Option<String>) -> Result<()> {
    match value {
        Some(text) if text.len() > MAX_TEXT_LEN => Err(Error::validation(format!(
            "{field} exceeds {MAX_TEXT_LEN} characters"
        ))),
        _ => Ok(()),
    }
}

impl DomainEvent for EventData {
    fn event_type(&self) -> String {
        self.kind().as_str().to_string()
    }

    fn event_version(&self) -> String {
        SCHEMA_VERSION.to_string()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    UserAction,
    SystemDetection,
    MissedDetection,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventContext {
    #[serde(default)]
    pub medication_name: Option<String>,
    pub trigger_source: TriggerSource,
    /// Back-references only; never ownership
    #[serde(default)]
    pub related_event_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventTiming {
    pub event_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grace_period_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_on_time: Option<bool>,
    /// Negative when early
    #[serde(default)]
    pub minutes_late: Option<i64>,
}

impl EventTiming {
    /// Signed lateness of `actual` against `scheduled_for` in whole minutes,
    /// and whether it falls within `threshold` either side.
    pub fn punctuality(
        scheduled_for: DateTime<Utc>,
        actual: DateTime<Utc>,
        threshold: chrono::Duration,
    ) -> (bool, i64) {
        let minutes_late = (actual - scheduled_for).num_minutes();
        (minutes_late.abs() <= threshold.num_minutes(), minutes_late)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventMetadata {
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub correlation_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct ArchiveInfo {
    pub archived_at: DateTime<Utc>,
    pub archived_from: String,
}

/// Immutable record of one occurrence in a medication's history.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MedicationEvent {
    pub id: String,
    pub command_id: String,
    pub patient_id: String,
    pub event_data: EventData,
    pub context: EventContext,
    pub timing: EventTiming,
    pub metadata: EventMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveInfo>,
}

impl MedicationEvent {
    pub fn event_type(&self) -> EventType {
        self.event_data.kind()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timing.event_timestamp
    }

    pub fn undo_data(&self) -> Option<&UndoData> {
        self.event_data.undo_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tag_matches_event_type_name() {
        let at: DateTime<Utc> = "2024-03-01T08:00:00Z".parse().unwrap();
        let data = EventData::DoseTakenUndone {
            scheduled_for: None,
            undo_data: UndoData {
                original_event_id: "evt_1".to_string(),
                original_event_type: EventType::DoseTaken,
                undo_reason: "tapped by mistake".to_string(),
                undo_timestamp: at,
                corrected_action: Some(CorrectedAction::Missed),
            },
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["type"], json!("DOSE_TAKEN_UNDONE"));
        assert_eq!(
            serde_json::to_value(EventType::DoseTakenUndone).unwrap(),
            value["type"]
        );
        assert_eq!(value["undo_data"]["corrected_action"]["action"], json!("missed"));
        assert_eq!(data.event_type(), "DOSE_TAKEN_UNDONE");

        let back: EventData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_every_type_name_round_trips_through_serde() {
        let all = [
            EventType::MedicationCreated,
            EventType::MedicationUpdated,
            EventType::DoseScheduled,
            EventType::DoseTaken,
            EventType::PrnDoseTaken,
            EventType::DoseMissed,
            EventType::DoseSkipped,
            EventType::DoseSnoozed,
            EventType::DoseRescheduled,
            EventType::MedicationPaused,
            EventType::MedicationHeld,
            EventType::MedicationResumed,
            EventType::MedicationDiscontinued,
            EventType::DoseTakenUndone,
            EventType::DoseMissedCorrected,
            EventType::DoseSkippedCorrected,
        ];
        for kind in all {
            assert_eq!(serde_json::to_value(kind).unwrap(), json!(kind.as_str()));
        }
    }

    #[test]
    fn test_snooze_must_move_forward() {
        let at: DateTime<Utc> = "2024-03-01T08:00:00Z".parse().unwrap();
        let data = EventData::DoseSnoozed {
            scheduled_for: at,
            snoozed_until: at,
        };
        assert!(data.validate().is_err());
    }

    #[test]
    fn test_punctuality_is_signed() {
        let scheduled: DateTime<Utc> = "2024-03-01T08:00:00Z".parse().unwrap();
        let threshold = chrono::Duration::minutes(30);
        assert_eq!(
            EventTiming::punctuality(scheduled, scheduled + chrono::Duration::minutes(10), threshold),
            (true, 10)
        );
        assert_eq!(
            EventTiming::punctuality(scheduled, scheduled - chrono::Duration::minutes(45), threshold),
            (false, -45)
        );
        assert_eq!(
            EventTiming::punctuality(scheduled, scheduled + chrono::Duration::minutes(30), threshold),
            (true, 30)
        );
    }

    #[test]
    fn test_undo_sets() {
        assert!(EventType::DoseTaken.is_undoable());
        assert!(!EventType::DoseMissed.is_undoable());
        assert!(EventType::DoseMissed.is_correctable());
        assert!(!EventType::DoseTakenUndone.is_correctable());
    }
}
