use std::fmt::Debug;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Actor recorded for system-triggered work (detection runs, compensations).
pub const SYSTEM_ACTOR: &str = "system";

/// Time source. Injected everywhere a timestamp is taken.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Identity of the caller, as established by the authentication layer.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct RequestContext {
    pub actor_id: String,
    pub session_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            session_id: None,
            correlation_id: None,
        }
    }

    pub fn system() -> Self {
        Self::new(SYSTEM_ACTOR)
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Correlation ID for this invocation, generated when the caller gave none.
    pub fn correlation_or_new(&self) -> String {
        self.correlation_id
            .clone()
            .unwrap_or_else(|| Ulid::new().to_string())
    }
}
