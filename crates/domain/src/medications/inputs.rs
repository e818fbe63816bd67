use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::command::{Frequency, MedicationClass, MedicationInfo, StatusKind};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateMedicationInput {
    pub patient_id: String,
    pub medication: MedicationInfo,
    pub frequency: Frequency,
    /// Falls back to the frequency's default slots when absent
    #[serde(default)]
    pub times: Option<Vec<String>>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub time_zone: Option<String>,
    #[serde(default)]
    pub medication_class: MedicationClass,
    #[serde(default)]
    pub computed_from_preferences: bool,
    #[serde(default)]
    pub notify: bool,
}

/// Partial update of a medication's configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandPatch {
    pub medication: Option<MedicationInfo>,
    pub frequency: Option<Frequency>,
    pub times: Option<Vec<String>>,
    /// `Some(None)` clears the end date
    pub end_date: Option<Option<NaiveDate>>,
    pub time_zone: Option<String>,
    pub medication_class: Option<MedicationClass>,
}

impl CommandPatch {
    pub fn is_empty(&self) -> bool {
        self.medication.is_none()
            && self.frequency.is_none()
            && self.times.is_none()
            && self.end_date.is_none()
            && self.time_zone.is_none()
            && self.medication_class.is_none()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeStatusInput {
    pub command_id: String,
    pub status: StatusKind,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MarkDoseTakenInput {
    pub command_id: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    /// Defaults to now
    #[serde(default)]
    pub taken_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dosage: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SkipDoseInput {
    pub command_id: String,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}
