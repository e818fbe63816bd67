use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::clock::RequestContext;
use crate::errors::{Error, Result};
use crate::recovery::{ErrorReport, RecoveryPolicy};

/// Outcome of one workflow invocation, for API responses and monitoring.
#[derive(Debug, Serialize)]
pub struct WorkflowResult<T> {
    pub workflow_id: String,
    pub workflow: String,
    pub success: bool,
    pub correlation_id: String,
    pub event_ids: Vec<String>,
    pub notifications_sent: u32,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    /// The typed failure, for in-process callers
    #[serde(skip)]
    pub cause: Option<Error>,
}

impl<T> WorkflowResult<T> {
    pub fn into_result(self) -> Result<T> {
        match (self.output, self.cause) {
            (_, Some(e)) => Err(e),
            (Some(output), None) => Ok(output),
            (None, None) => Err(Error::validation("workflow produced no output")),
        }
    }
}

/// Bookkeeping threaded through the phases of one invocation.
#[derive(Debug)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub workflow: &'static str,
    pub correlation_id: String,
    pub event_ids: Vec<String>,
    pub notifications_sent: u32,
    started: Instant,
}

impl WorkflowRun {
    pub fn start(workflow: &'static str, ctx: &RequestContext) -> Self {
        Self {
            workflow_id: format!("wf_{}", Ulid::new()),
            workflow,
            correlation_id: ctx.correlation_or_new(),
            event_ids: vec![],
            notifications_sent: 0,
            started: Instant::now(),
        }
    }

    pub fn record_events<'a>(&mut self, ids: impl IntoIterator<Item = &'a String>) {
        self.event_ids.extend(ids.into_iter().cloned());
    }

    /// Closes the run. Failures are classified and logged here, before the
    /// result is handed back.
    pub fn finish<T>(
        self,
        outcome: Result<T>,
        policy: &RecoveryPolicy,
        ctx: &RequestContext,
        patient_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> WorkflowResult<T> {
        let execution_time_ms = self.started.elapsed().as_millis() as u64;
        let (success, output, error, cause) = match outcome {
            Ok(output) => (true, Some(output), None, None),
            Err(e) => {
                let report = ErrorReport::capture(&e, policy, self.workflow, ctx, patient_id, now);
                (false, None, Some(report), Some(e))
            }
        };

        tracing::info!(
            workflow = self.workflow,
            workflow_id = %self.workflow_id,
            correlation_id = %self.correlation_id,
            success,
            events = self.event_ids.len(),
            execution_time_ms,
            "Workflow finished"
        );

        WorkflowResult {
            workflow_id: self.workflow_id,
            workflow: self.workflow.to_string(),
            success,
            correlation_id: self.correlation_id,
            event_ids: self.event_ids,
            notifications_sent: self.notifications_sent,
            execution_time_ms,
            output,
            error,
            cause,
        }
    }
}
