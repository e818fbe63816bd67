//! Per-collaborator circuit breaking.
//!
//! After `failure_threshold` consecutive failures a breaker opens and
//! rejects calls until `cooldown` has passed. The first call after that is a
//! half-open probe: success closes the breaker, failure re-opens it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Runs `operation` unless the breaker is open.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire_at(Instant::now())?;
        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure_at(Instant::now());
                Err(e)
            }
        }
    }

    fn acquire_at(&self, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| now.duration_since(at) >= self.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    info!(breaker = %self.name, "Circuit half-open, probing");
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        name: self.name.clone(),
                    })
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.name, "Circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    fn on_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures += 1;
        let trip = inner.state == BreakerState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != BreakerState::Open {
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "Circuit opened"
            );
        }
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }
}

/// One breaker per collaborator name, shared across invocations in a process.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    failure_threshold: u32,
    cooldown: Duration,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.failure_threshold, self.cooldown))
            })
            .clone()
    }

    pub fn states(&self) -> Vec<(String, BreakerState)> {
        let mut states: Vec<_> = self
            .breakers
            .lock()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }
}
