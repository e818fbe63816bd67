use derive_new::new;
use tracing::{error, info, warn};

use crate::errors::{Error, Result};
use crate::store::WriteOp;

use super::coordinator::{TransactionCoordinator, TransactionReceipt, TransactionRequest};
use super::log::RollbackStrategy;

/// One named step of a multi-phase operation.
#[derive(Clone, Debug, new)]
pub struct TransactionPhase {
    pub name: String,
    pub operations: Vec<WriteOp>,
    /// Run in reverse order if a later phase fails
    pub compensation: Vec<WriteOp>,
}

impl TransactionCoordinator {
    /// Runs `phases` in order, each as its own transaction. When a phase
    /// fails, completed phases are compensated newest first. A failure in the
    /// first phase is returned unchanged since nothing needs compensating.
    pub async fn execute_distributed(
        &self,
        label: &str,
        phases: Vec<TransactionPhase>,
        correlation_id: Option<&str>,
    ) -> Result<Vec<TransactionReceipt>> {
        let mut completed: Vec<(TransactionPhase, TransactionReceipt)> = Vec::new();

        for phase in phases {
            let request = TransactionRequest::new(
                format!("{label}:{}", phase.name),
                phase.operations.clone(),
            )
            .rollback(RollbackStrategy::Manual)
            .correlation(correlation_id);

            match self.execute(request).await {
                Ok(receipt) => completed.push((phase, receipt)),
                Err(e) if completed.is_empty() => return Err(e),
                Err(e) => {
                    warn!(label, phase = %phase.name, error = %e, "Phase failed, compensating");
                    let compensated = self.compensate(label, &completed, correlation_id).await;
                    return Err(Error::PhaseFailed {
                        phase: phase.name,
                        source: Box::new(e),
                        compensated,
                    });
                }
            }
        }

        Ok(completed.into_iter().map(|(_, receipt)| receipt).collect())
    }

    /// Best effort. Failures are escalated to manual review, never retried.
    async fn compensate(
        &self,
        label: &str,
        completed: &[(TransactionPhase, TransactionReceipt)],
        correlation_id: Option<&str>,
    ) -> Vec<String> {
        let mut compensated = Vec::new();

        for (phase, receipt) in completed.iter().rev() {
            if phase.compensation.is_empty() {
                continue;
            }
            let request = TransactionRequest::new(
                format!("{label}:{}:compensate", phase.name),
                phase.compensation.clone(),
            )
            .rollback(RollbackStrategy::None)
            .correlation(correlation_id);

            match self.execute(request).await {
                Ok(_) => {
                    info!(label, phase = %phase.name, "Phase compensated");
                    compensated.push(phase.name.clone());
                }
                Err(e) => {
                    error!(label, phase = %phase.name, error = %e, "Compensation failed");
                    let items = phase
                        .compensation
                        .iter()
                        .map(|op| (op.clone(), format!("compensation failed: {e}")))
                        .collect();
                    if let Err(e) = self
                        .queue_for_review(&receipt.transaction_id, None, items)
                        .await
                    {
                        error!(label, phase = %phase.name, error = %e, "Failed to queue compensation");
                    }
                }
            }
        }
        compensated
    }
}
