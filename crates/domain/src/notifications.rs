use std::fmt;

use async_trait::async_trait;
use derive_new::new;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::Result;
use crate::medications::MedicationClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl fmt::Display for NotificationPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl From<MedicationClass> for NotificationPriority {
    /// Missed-dose severity follows how tight the grace period is.
    fn from(class: MedicationClass) -> Self {
        match class {
            MedicationClass::Critical => Self::Urgent,
            MedicationClass::Standard => Self::High,
            MedicationClass::Vitamin => Self::Normal,
            MedicationClass::Prn => Self::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    MedicationCreated,
    DoseTaken,
    DoseMissed,
    StatusChanged,
    EventUndone,
    EventCorrected,
}

#[derive(Debug, Clone, Serialize, Deserialize, new)]
pub struct NotificationRequest {
    pub patient_id: String,
    pub kind: NotificationKind,
    pub priority: NotificationPriority,
    pub title: String,
    pub message: String,
    #[new(default)]
    pub command_id: Option<String>,
    #[new(default)]
    pub data: Option<Value>,
}

impl NotificationRequest {
    pub fn for_command(mut self, command_id: &str) -> Self {
        self.command_id = Some(command_id.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationDelivery {
    pub total_sent: u32,
    pub total_failed: u32,
}

/// Outbound notification collaborator (caregivers, family, devices).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationDelivery>;
}

/// Writes notifications to the log. Default collaborator for the lambdas.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, request: &NotificationRequest) -> Result<NotificationDelivery> {
        tracing::info!(
            patient_id = %request.patient_id,
            kind = ?request.kind,
            priority = %request.priority,
            title = %request.title,
            "{}",
            request.message
        );
        Ok(NotificationDelivery {
            total_sent: 1,
            total_failed: 0,
        })
    }
}
