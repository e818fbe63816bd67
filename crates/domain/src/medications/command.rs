use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::ids;

use super::inputs::{CommandPatch, CreateMedicationInput};

pub const ENTITY: &str = "MedicationCommand";

/// Dosing frequency
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    OnceDaily,
    TwiceDaily,
    ThreeTimesDaily,
    FourTimesDaily,
    EveryOtherDay,
    Weekly,
    /// PRN: taken as needed, never scheduled
    AsNeeded,
}

impl Frequency {
    pub fn default_times(&self) -> &'static [&'static str] {
        match self {
            Frequency::OnceDaily | Frequency::EveryOtherDay | Frequency::Weekly => &["08:00"],
            Frequency::TwiceDaily => &["08:00", "20:00"],
            Frequency::ThreeTimesDaily => &["08:00", "14:00", "20:00"],
            Frequency::FourTimesDaily => &["08:00", "12:00", "16:00", "20:00"],
            Frequency::AsNeeded => &[],
        }
    }

    /// Number of time slots a schedule with this frequency must carry.
    pub fn slots(&self) -> usize {
        self.default_times().len()
    }

    pub fn is_prn(&self) -> bool {
        matches!(self, Frequency::AsNeeded)
    }
}

/// Medication lifecycle status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Active,
    Paused,
    Held,
    /// Terminal
    Discontinued,
}

impl Default for StatusKind {
    fn default() -> Self {
        Self::Active
    }
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Active => "active",
            StatusKind::Paused => "paused",
            StatusKind::Held => "held",
            StatusKind::Discontinued => "discontinued",
        }
    }

    pub fn can_transition_to(&self, next: StatusKind) -> bool {
        match (self, next) {
            (StatusKind::Discontinued, _) => false,
            (current, next) => *current != next,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MedicationClass {
    Critical,
    Standard,
    Vitamin,
    Prn,
}

impl Default for MedicationClass {
    fn default() -> Self {
        Self::Standard
    }
}

impl MedicationClass {
    pub fn grace_minutes(&self) -> i64 {
        match self {
            MedicationClass::Critical => 15,
            MedicationClass::Standard => 60,
            MedicationClass::Vitamin => 240,
            MedicationClass::Prn => 0,
        }
    }
}

/// Opaque medication descriptor
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MedicationInfo {
    pub name: String,
    pub dosage: String,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Schedule {
    pub frequency: Frequency,
    /// `HH:MM` slots in `time_zone`, ascending
    pub times: Vec<String>,
    pub start_date: NaiveDate,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    pub is_indefinite: bool,
    pub time_zone: String,
    #[serde(default)]
    pub computed_from_preferences: bool,
    #[serde(default)]
    pub next_recompute_at: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn tz(&self) -> Result<Tz> {
        self.time_zone
            .parse::<Tz>()
            .map_err(|_| Error::validation(format!("unknown time zone {}", self.time_zone)))
    }

    pub fn parsed_times(&self) -> Result<Vec<NaiveTime>> {
        self.times.iter().map(|t| parse_slot(t)).collect()
    }

    fn validate(&self) -> Result<()> {
        self.tz()?;
        let parsed = self.parsed_times()?;

        if self.frequency.is_prn() {
            if !parsed.is_empty() {
                return Err(Error::validation("as-needed medications cannot have scheduled times"));
            }
        } else if parsed.len() != self.frequency.slots() {
            return Err(Error::validation(format!(
                "{:?} requires {} time slot(s), got {}",
                self.frequency,
                self.frequency.slots(),
                parsed.len()
            )));
        }

        if parsed.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::validation("schedule times must be unique and ascending"));
        }

        match (self.is_indefinite, self.end_date) {
            (true, Some(_)) => Err(Error::validation("an indefinite schedule cannot have an end date")),
            (false, None) => Err(Error::validation("a finite schedule needs an end date")),
            (false, Some(end)) if end < self.start_date => {
                Err(Error::validation("end date precedes start date"))
            }
            _ => Ok(()),
        }
    }
}

fn parse_slot(slot: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(slot, "%H:%M")
        .map_err(|_| Error::validation(format!("invalid time slot {slot:?}, expected HH:MM")))
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MedicationStatus {
    pub current: StatusKind,
    /// Always `current == Active`
    pub is_active: bool,
    pub is_prn: bool,
    pub changed_at: DateTime<Utc>,
    pub changed_by: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl MedicationStatus {
    pub fn new(
        current: StatusKind,
        is_prn: bool,
        changed_at: DateTime<Utc>,
        changed_by: &str,
        reason: Option<String>,
    ) -> Self {
        Self {
            current,
            is_active: current == StatusKind::Active,
            is_prn,
            changed_at,
            changed_by: changed_by.to_string(),
            reason,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct GracePeriod {
    pub class: MedicationClass,
    pub minutes: i64,
}

impl From<MedicationClass> for GracePeriod {
    fn from(class: MedicationClass) -> Self {
        Self {
            class,
            minutes: class.grace_minutes(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct CommandMetadata {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
    pub checksum: String,
}

/// Current-state projection of one prescribed medication.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MedicationCommand {
    pub id: String,
    pub patient_id: String,
    pub medication: MedicationInfo,
    pub schedule: Schedule,
    pub status: MedicationStatus,
    pub grace_period: GracePeriod,
    pub metadata: CommandMetadata,
}

impl MedicationCommand {
    pub fn create(input: &CreateMedicationInput, actor: &str, now: DateTime<Utc>) -> Result<Self> {
        if input.patient_id.trim().is_empty() {
            return Err(Error::validation("patient_id is required"));
        }
        if input.medication.name.trim().is_empty() {
            return Err(Error::validation("medication name is required"));
        }

        let frequency = input.frequency;
        let times = match &input.times {
            Some(times) if !times.is_empty() => {
                let mut times = times.clone();
                times.sort();
                times
            }
            _ => frequency
                .default_times()
                .iter()
                .map(|t| t.to_string())
                .collect(),
        };
        let class = if frequency.is_prn() {
            MedicationClass::Prn
        } else {
            input.medication_class
        };

        let mut command = Self {
            id: ids::command_id(&input.patient_id, &input.medication.name),
            patient_id: input.patient_id.clone(),
            medication: input.medication.clone(),
            schedule: Schedule {
                frequency,
                times,
                start_date: input.start_date.unwrap_or_else(|| now.date_naive()),
                end_date: input.end_date,
                is_indefinite: input.end_date.is_none(),
                time_zone: input.time_zone.clone().unwrap_or_else(|| "UTC".to_string()),
                computed_from_preferences: input.computed_from_preferences,
                next_recompute_at: input
                    .computed_from_preferences
                    .then(|| now + Duration::days(7)),
            },
            status: MedicationStatus::new(
                StatusKind::Active,
                frequency.is_prn(),
                now,
                actor,
                None,
            ),
            grace_period: class.into(),
            metadata: CommandMetadata {
                version: 1,
                created_at: now,
                created_by: actor.to_string(),
                updated_at: now,
                updated_by: actor.to_string(),
                checksum: String::new(),
            },
        };
        command.validate()?;
        command.metadata.checksum = command.compute_checksum()?;
        Ok(command)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() || self.patient_id.trim().is_empty() {
            return Err(Error::validation("command identity is incomplete"));
        }
        if self.medication.name.trim().is_empty() {
            return Err(Error::validation("medication name is required"));
        }
        if self.medication.dosage.trim().is_empty() {
            return Err(Error::validation("dosage is required"));
        }
        self.schedule.validate()?;

        if self.status.is_active != (self.status.current == StatusKind::Active) {
            return Err(Error::validation("is_active disagrees with current status"));
        }
        if self.status.is_prn != self.schedule.frequency.is_prn() {
            return Err(Error::validation("is_prn disagrees with frequency"));
        }
        if self.grace_period.minutes < 0 {
            return Err(Error::validation("grace period cannot be negative"));
        }
        Ok(())
    }

    /// Scheduled slots available to dose generation. Empty for PRN medications.
    pub fn schedulable_times(&self) -> &[String] {
        if self.status.is_prn {
            &[]
        } else {
            &self.schedule.times
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::minutes(self.grace_period.minutes)
    }

    pub fn version(&self) -> u64 {
        self.metadata.version
    }

    /// Copy with the version bumped and the update stamp refreshed.
    pub fn touched(&self, actor: &str, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.metadata.version += 1;
        next.metadata.updated_at = now;
        next.metadata.updated_by = actor.to_string();
        next
    }

    /// Applies `patch` and re-validates the merged result. `self` is untouched
    /// when validation fails.
    pub fn patched(&self, patch: &CommandPatch, actor: &str, now: DateTime<Utc>) -> Result<Self> {
        if patch.is_empty() {
            return Err(Error::validation("update contains no changes"));
        }
        self.validate_mutable()?;

        let mut next = self.touched(actor, now);
        if let Some(medication) = &patch.medication {
            if ids::command_id(&self.patient_id, &medication.name) != self.id {
                return Err(Error::validation(
                    "renaming a medication changes its identity; create a new one instead",
                ));
            }
            next.medication = medication.clone();
        }
        if let Some(frequency) = patch.frequency {
            next.schedule.frequency = frequency;
            next.status.is_prn = frequency.is_prn();
            if patch.times.is_none() {
                next.schedule.times = frequency
                    .default_times()
                    .iter()
                    .map(|t| t.to_string())
                    .collect();
            }
            if frequency.is_prn() {
                next.grace_period = MedicationClass::Prn.into();
            }
        }
        if let Some(times) = &patch.times {
            let mut times = times.clone();
            times.sort();
            next.schedule.times = times;
        }
        if let Some(end_date) = patch.end_date {
            next.schedule.end_date = end_date;
            next.schedule.is_indefinite = end_date.is_none();
        }
        if let Some(time_zone) = &patch.time_zone {
            next.schedule.time_zone = time_zone.clone();
        }
        if let Some(class) = patch.medication_class {
            next.grace_period = class.into();
        }

        next.validate()?;
        next.metadata.checksum = next.compute_checksum()?;
        Ok(next)
    }

    pub fn transition_to(
        &self,
        next_status: StatusKind,
        reason: Option<String>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !self.status.current.can_transition_to(next_status) {
            return Err(Error::InvalidStateTransition {
                from: self.status.current.as_str().to_string(),
                to: next_status.as_str().to_string(),
            });
        }

        let mut next = self.touched(actor, now);
        next.status = MedicationStatus::new(next_status, self.status.is_prn, now, actor, reason);
        next.validate()?;
        next.metadata.checksum = next.compute_checksum()?;
        Ok(next)
    }

    /// SHA-256 over everything except `metadata`.
    pub fn compute_checksum(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("metadata");
        }
        Ok(ids::sha256_hex(&value.to_string()))
    }

    pub fn verify_checksum(&self) -> bool {
        self.compute_checksum()
            .map(|sum| sum == self.metadata.checksum)
            .unwrap_or(false)
    }

    fn validate_mutable(&self) -> Result<()> {
        if self.status.current == StatusKind::Discontinued {
            return Err(Error::Forbidden);
        }
        Ok(())
    }
}
