//! Undo/correction window rules.
//!
//! Whether a recorded event may be retracted depends only on its type,
//! whether it is itself a compensating record, whether a retraction already
//! exists for it, and how long ago it was recorded. Nothing here touches
//! storage.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::events::{CorrectedAction, EventType};

/// Where an event sits relative to the two windows.
#[derive(Clone, Copy, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum UndoWindow {
    Undoable,
    CorrectionOnly,
    Immutable,
}

#[derive(Clone, Debug, Serialize, Eq, PartialEq)]
pub struct UndoValidation {
    pub allowed: bool,
    pub requires_correction: bool,
    pub window: UndoWindow,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub elapsed_seconds: i64,
    /// Time left in the window that applies to the attempted action
    pub remaining_seconds: i64,
}

impl UndoValidation {
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            return Ok(self);
        }
        Err(Error::UndoRejected {
            reason: self.reason.unwrap_or_else(|| "not permitted".to_string()),
            requires_correction: self.requires_correction,
            elapsed_seconds: self.elapsed_seconds,
        })
    }
}

/// What is known about the event a retraction targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetractionTarget {
    pub event_type: EventType,
    /// The event carries undo data: it is an undo or correction record
    pub compensating: bool,
    pub already_retracted: bool,
}

impl RetractionTarget {
    pub fn fresh(event_type: EventType) -> Self {
        Self {
            event_type,
            compensating: false,
            already_retracted: false,
        }
    }
}

const ALREADY_RETRACTED: &str = "event has already been undone or corrected";
const COMPENSATING: &str = "undo and correction records cannot themselves be undone or corrected";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UndoPolicy {
    pub undo_window: Duration,
    pub correction_window: Duration,
}

impl From<&Config> for UndoPolicy {
    fn from(config: &Config) -> Self {
        Self {
            undo_window: config.undo_window,
            correction_window: config.correction_window,
        }
    }
}

impl Default for UndoPolicy {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl UndoPolicy {
    /// Time since `recorded_at`. A timestamp in the future counts as zero.
    pub fn elapsed(recorded_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (now - recorded_at).max(Duration::zero())
    }

    /// Both windows are inclusive.
    pub fn window(&self, elapsed: Duration) -> UndoWindow {
        if elapsed <= self.undo_window {
            UndoWindow::Undoable
        } else if elapsed <= self.correction_window {
            UndoWindow::CorrectionOnly
        } else {
            UndoWindow::Immutable
        }
    }

    pub fn validate_undo(&self, target: RetractionTarget, elapsed: Duration) -> UndoValidation {
        let event_type = target.event_type;
        let window = self.window(elapsed);
        let correctable = event_type.is_correctable() && window != UndoWindow::Immutable;
        let remaining = (self.undo_window - elapsed).max(Duration::zero());

        let refusal = if target.already_retracted {
            Some((false, ALREADY_RETRACTED.to_string()))
        } else if target.compensating {
            Some((false, COMPENSATING.to_string()))
        } else if !event_type.is_undoable() {
            Some((
                correctable,
                format!("{} events cannot be undone", event_type.as_str()),
            ))
        } else {
            match window {
                UndoWindow::Undoable => None,
                UndoWindow::CorrectionOnly => Some((
                    true,
                    format!(
                        "undo window of {}s has passed; submit a correction instead",
                        self.undo_window.num_seconds()
                    ),
                )),
                UndoWindow::Immutable => Some((
                    false,
                    "event is outside the correction window and can no longer be changed"
                        .to_string(),
                )),
            }
        };

        build(window, elapsed, remaining, refusal)
    }

    pub fn validate_correction(&self, target: RetractionTarget, elapsed: Duration) -> UndoValidation {
        let event_type = target.event_type;
        let window = self.window(elapsed);
        let remaining = (self.correction_window - elapsed).max(Duration::zero());

        let refusal = if target.already_retracted {
            Some((false, ALREADY_RETRACTED.to_string()))
        } else if target.compensating {
            Some((false, COMPENSATING.to_string()))
        } else if !event_type.is_correctable() {
            Some((
                false,
                format!("{} events cannot be corrected", event_type.as_str()),
            ))
        } else if window == UndoWindow::Immutable {
            Some((
                false,
                "event is outside the correction window and can no longer be changed".to_string(),
            ))
        } else {
            None
        };

        build(window, elapsed, remaining, refusal)
    }
}

fn build(
    window: UndoWindow,
    elapsed: Duration,
    remaining: Duration,
    refusal: Option<(bool, String)>,
) -> UndoValidation {
    match refusal {
        None => UndoValidation {
            allowed: true,
            requires_correction: false,
            window,
            reason: None,
            elapsed_seconds: elapsed.num_seconds(),
            remaining_seconds: remaining.num_seconds(),
        },
        Some((requires_correction, reason)) => UndoValidation {
            allowed: false,
            requires_correction,
            window,
            reason: Some(reason),
            elapsed_seconds: elapsed.num_seconds(),
            remaining_seconds: 0,
        },
    }
}

/// A correction must change the recorded outcome. Re-recording a missed
/// dose as missed, or a skip as a skip, is refused.
pub fn check_corrected_action(original: EventType, action: &CorrectedAction) -> Result<()> {
    let repeats = matches!(
        (original, action),
        (EventType::DoseMissed, CorrectedAction::Missed)
            | (EventType::DoseSkipped, CorrectedAction::Skipped { .. })
    );
    if repeats {
        return Err(Error::validation(format!(
            "{} is already the recorded outcome",
            original.as_str()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn taken() -> RetractionTarget {
        RetractionTarget::fresh(EventType::DoseTaken)
    }

    fn retracted() -> RetractionTarget {
        RetractionTarget {
            already_retracted: true,
            ..taken()
        }
    }

    fn policy() -> UndoPolicy {
        UndoPolicy {
            undo_window: Duration::seconds(30),
            correction_window: Duration::hours(24),
        }
    }

    #[test]
    fn test_boundaries() {
        let p = policy();
        let at = |ms: i64| p.validate_undo(taken(), Duration::milliseconds(ms));

        assert!(at(29_900).allowed);
        assert!(at(30_000).allowed);

        let late = at(30_100);
        assert!(!late.allowed);
        assert!(late.requires_correction);

        let day = Duration::hours(24) + Duration::seconds(1);
        let gone = p.validate_undo(taken(), day);
        assert!(!gone.allowed);
        assert!(!gone.requires_correction);
        assert!(!p.validate_correction(taken(), day).allowed);
    }

    #[test]
    fn test_missed_dose_needs_correction_even_when_fresh() {
        let v = policy().validate_undo(RetractionTarget::fresh(EventType::DoseMissed), Duration::seconds(1));
        assert!(!v.allowed);
        assert!(v.requires_correction);
    }

    #[test]
    fn test_retracted_event_is_final() {
        let v = policy().validate_correction(retracted(), Duration::seconds(1));
        assert!(!v.allowed);
        assert!(!v.requires_correction);
    }

    #[test]
    fn test_compensating_record_is_final() {
        let correction = RetractionTarget {
            compensating: true,
            ..taken()
        };
        let undo = policy().validate_undo(correction, Duration::seconds(5));
        assert!(!undo.allowed);
        assert!(!undo.requires_correction);

        let amend = policy().validate_correction(correction, Duration::hours(1));
        assert!(!amend.allowed);
        assert!(amend.into_result().is_err());
    }

    #[test]
    fn test_future_timestamp_counts_as_zero() {
        let now: DateTime<Utc> = "2024-03-01T08:00:00Z".parse().unwrap();
        assert_eq!(
            UndoPolicy::elapsed(now + Duration::minutes(5), now),
            Duration::zero()
        );
    }

    #[test]
    fn test_correction_must_change_outcome() {
        assert!(check_corrected_action(EventType::DoseMissed, &CorrectedAction::Missed).is_err());
        assert!(check_corrected_action(EventType::DoseTaken, &CorrectedAction::Missed).is_ok());
    }

    proptest! {
        #[test]
        fn prop_undo_and_correction_partition_time(ms in 0i64..(2 * 24 * 3600 * 1000)) {
            let p = policy();
            let elapsed = Duration::milliseconds(ms);
            let undo = p.validate_undo(taken(), elapsed);
            let correction = p.validate_correction(taken(), elapsed);

            prop_assert_eq!(undo.allowed, elapsed <= p.undo_window);
            prop_assert_eq!(undo.requires_correction, elapsed > p.undo_window && elapsed <= p.correction_window);
            prop_assert_eq!(correction.allowed, elapsed <= p.correction_window);
        }

        #[test]
        fn prop_retracted_never_allowed(ms in 0i64..(2 * 24 * 3600 * 1000)) {
            let p = policy();
            let elapsed = Duration::milliseconds(ms);
            prop_assert!(!p.validate_undo(retracted(), elapsed).allowed);
            prop_assert!(!p.validate_correction(retracted(), elapsed).allowed);
        }
    }
}
