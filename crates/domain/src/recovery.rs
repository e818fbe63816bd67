//! Error classification and recovery policy.
//!
//! Every failure is mapped to an [`ErrorClass`]; the class (and severity)
//! selects a [`RecoveryStrategy`] from a fixed table. Errors are captured
//! into an [`ErrorReport`] and logged before any recovery action runs.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::clock::{Clock, RequestContext};
use crate::errors::{Error, Result};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Authentication,
    Authorization,
    Network,
    Database,
    BusinessLogic,
    System,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum EscalationTier {
    Support,
    Engineering,
    OnCall,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum RecoveryStrategy {
    Ignore,
    Retry { max_retries: u32, backoff_ms: u64 },
    Rollback,
    Escalate { tier: EscalationTier },
}

/// What a class of error implies for the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClassProfile {
    pub retryable: bool,
    pub requires_rollback: bool,
    pub requires_notification: bool,
}

impl ErrorClass {
    pub fn profile(&self) -> ClassProfile {
        let (retryable, requires_rollback, requires_notification) = match self {
            ErrorClass::Validation => (false, false, false),
            ErrorClass::Authentication => (false, false, false),
            ErrorClass::Authorization => (false, false, false),
            ErrorClass::Network => (true, false, false),
            ErrorClass::Database => (true, true, false),
            ErrorClass::BusinessLogic => (false, true, true),
            ErrorClass::System => (false, true, true),
        };
        ClassProfile {
            retryable,
            requires_rollback,
            requires_notification,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorClass::Validation => Severity::Low,
            ErrorClass::Authentication | ErrorClass::Authorization => Severity::Medium,
            ErrorClass::Network | ErrorClass::Database => Severity::Medium,
            ErrorClass::BusinessLogic => Severity::High,
            ErrorClass::System => Severity::Critical,
        }
    }

    /// Whether the specific error message may be shown to the end user.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            ErrorClass::Validation | ErrorClass::Authentication | ErrorClass::Authorization
        )
    }
}

#[derive(Clone, Debug)]
pub struct RecoveryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(100),
        }
    }
}

impl RecoveryPolicy {
    pub fn strategy_for(&self, class: ErrorClass, severity: Severity) -> RecoveryStrategy {
        let backoff_ms = self.base_backoff.as_millis() as u64;
        match class {
            ErrorClass::Validation | ErrorClass::Authorization => RecoveryStrategy::Ignore,
            ErrorClass::Authentication => RecoveryStrategy::Ignore,
            ErrorClass::Network => RecoveryStrategy::Retry {
                max_retries: self.max_retries,
                backoff_ms: backoff_ms * 2,
            },
            ErrorClass::Database if severity >= Severity::High => RecoveryStrategy::Rollback,
            ErrorClass::Database => RecoveryStrategy::Retry {
                max_retries: self.max_retries,
                backoff_ms,
            },
            ErrorClass::BusinessLogic => RecoveryStrategy::Rollback,
            ErrorClass::System => RecoveryStrategy::Escalate {
                tier: EscalationTier::OnCall,
            },
        }
    }

    pub fn strategy_for_error(&self, error: &Error) -> RecoveryStrategy {
        self.strategy_for(error.class(), error.severity())
    }
}

/// Who and what a retried operation belongs to.
#[derive(Clone, Copy, Debug)]
pub struct RetryScope<'a> {
    pub operation: &'a str,
    pub context: &'a RequestContext,
    pub patient_id: Option<&'a str>,
    pub clock: &'a dyn Clock,
}

/// Runs the scoped operation, retrying while the policy maps its error to
/// `Retry`.
///
/// Backoff doubles after every attempt. Each failure that leads to a retry
/// is captured as an [`ErrorReport`] first; the final error is returned
/// uncaptured. The closure is re-invoked from scratch, so it must rebuild
/// any version-guarded writes it issues.
pub async fn retry<T, F, Fut>(policy: &RecoveryPolicy, scope: RetryScope<'_>, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) => match policy.strategy_for_error(&err) {
                RecoveryStrategy::Retry {
                    max_retries,
                    backoff_ms,
                } if attempt < max_retries => {
                    let report = ErrorReport::capture(
                        &err,
                        policy,
                        scope.operation,
                        scope.context,
                        scope.patient_id,
                        scope.clock.now(),
                    );
                    let delay = backoff_ms.saturating_mul(1 << attempt.min(16));
                    attempt += 1;
                    tracing::warn!(
                        operation = scope.operation,
                        error_id = %report.error_id,
                        attempt,
                        delay_ms = delay,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                _ => return Err(err),
            },
        }
    }
}

/// Support-facing record of one failure.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub error_id: String,
    pub class: ErrorClass,
    pub severity: Severity,
    pub strategy: RecoveryStrategy,
    pub message: String,
    pub operation: String,
    pub actor_id: String,
    pub patient_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl ErrorReport {
    /// Classifies and logs `error`. Logging happens here, before the caller
    /// acts on the returned strategy.
    pub fn capture(
        error: &Error,
        policy: &RecoveryPolicy,
        operation: &str,
        context: &RequestContext,
        patient_id: Option<&str>,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let error_id = Ulid::new().to_string();
        let class = error.class();
        let severity = error.severity();
        let strategy = policy.strategy_for(class, severity);

        tracing::error!(
            error_id = %error_id,
            operation,
            actor_id = %context.actor_id,
            patient_id = patient_id.unwrap_or("-"),
            class = ?class,
            severity = ?severity,
            strategy = ?strategy,
            occurred_at = %occurred_at,
            error = %error,
            "Workflow error"
        );

        let message = if class.is_user_facing() {
            error.to_string()
        } else {
            format!("The operation could not be completed. Reference: {error_id}")
        };

        Self {
            error_id,
            class,
            severity,
            strategy,
            message,
            operation: operation.to_string(),
            actor_id: context.actor_id.clone(),
            patient_id: patient_id.map(str::to_string),
            occurred_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn scope<'a>(ctx: &'a RequestContext) -> RetryScope<'a> {
        RetryScope {
            operation: "test",
            context: ctx,
            patient_id: Some("p-1"),
            clock: &SystemClock,
        }
    }

    #[test]
    fn test_strategy_table() {
        let policy = RecoveryPolicy::default();
        assert_eq!(
            policy.strategy_for(ErrorClass::Validation, Severity::Low),
            RecoveryStrategy::Ignore
        );
        assert!(matches!(
            policy.strategy_for(ErrorClass::Database, Severity::Medium),
            RecoveryStrategy::Retry { max_retries: 3, .. }
        ));
        assert_eq!(
            policy.strategy_for(ErrorClass::Database, Severity::High),
            RecoveryStrategy::Rollback
        );
        assert_eq!(
            policy.strategy_for(ErrorClass::BusinessLogic, Severity::High),
            RecoveryStrategy::Rollback
        );
        assert!(matches!(
            policy.strategy_for(ErrorClass::System, Severity::Critical),
            RecoveryStrategy::Escalate { .. }
        ));
    }

    #[test]
    fn test_user_message_hides_internal_detail() {
        let policy = RecoveryPolicy::default();
        let ctx = RequestContext::new("user-1");
        let now = Utc::now();

        let validation = Error::validation("dosage is required");
        let report = ErrorReport::capture(&validation, &policy, "create", &ctx, None, now);
        assert_eq!(report.message, "Validation error: dosage is required");

        let backend = Error::Store(StoreError::Backend("socket reset by peer".into()));
        let report = ErrorReport::capture(&backend, &policy, "create", &ctx, Some("p-1"), now);
        assert!(!report.message.contains("socket"));
        assert!(report.message.contains(&report.error_id));
        assert_eq!(report.class, ErrorClass::Database);
        assert_eq!(report.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retryable() {
        let policy = RecoveryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
        };
        let ctx = RequestContext::new("user-1");
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry(&policy, scope(&ctx), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::validation("bad")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_conflict() {
        let policy = RecoveryPolicy {
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
        };
        let ctx = RequestContext::new("user-1");
        let calls = AtomicU32::new(0);
        let result = retry(&policy, scope(&ctx), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Store(StoreError::Conflict("write conflict".into())))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }
}
