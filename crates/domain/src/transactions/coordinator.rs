use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::store::{
    Collection, DocKey, DocumentStore, Operation, Precondition, StoreError, WriteOp,
};

use super::log::{
    ManualReviewItem, OperationRecord, RollbackReport, RollbackStatus, RollbackStrategy,
    TransactionLogEntry, TransactionStatus,
};

/// A group of writes to commit as one unit.
#[derive(Clone, Debug)]
pub struct TransactionRequest {
    pub label: String,
    pub operations: Vec<WriteOp>,
    pub rollback_strategy: RollbackStrategy,
    pub timeout: Option<Duration>,
    pub correlation_id: Option<String>,
}

impl TransactionRequest {
    pub fn new(label: impl Into<String>, operations: Vec<WriteOp>) -> Self {
        Self {
            label: label.into(),
            operations,
            rollback_strategy: RollbackStrategy::Automatic,
            timeout: None,
            correlation_id: None,
        }
    }

    pub fn rollback(mut self, strategy: RollbackStrategy) -> Self {
        self.rollback_strategy = strategy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn correlation(mut self, correlation_id: Option<&str>) -> Self {
        self.correlation_id = correlation_id.map(str::to_string);
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct TransactionReceipt {
    pub transaction_id: String,
    pub operations: usize,
    pub duration_ms: i64,
}

enum Failure {
    Store(StoreError),
    Timeout(u64),
}

impl Failure {
    fn describe(&self) -> String {
        match self {
            Failure::Store(e) => e.to_string(),
            Failure::Timeout(ms) => format!("timed out after {ms}ms"),
        }
    }

    /// The store rejected the commit outright, so none of it was applied.
    fn is_definite(&self) -> bool {
        matches!(
            self,
            Failure::Store(
                StoreError::NotFound { .. }
                    | StoreError::AlreadyExists { .. }
                    | StoreError::VersionMismatch { .. }
                    | StoreError::Conflict(_)
                    | StoreError::Serialization(_)
            )
        )
    }

    fn into_error(self, transaction_id: String, rollback: Option<Box<RollbackReport>>) -> Error {
        match self {
            Failure::Store(source) => Error::TransactionFailed {
                transaction_id,
                source,
                rollback,
            },
            Failure::Timeout(timeout_ms) => Error::TransactionTimeout {
                transaction_id,
                timeout_ms,
                rollback,
            },
        }
    }
}

/// Sole entry point for durable writes. Every attempt is logged before and
/// after it runs; failures are rolled back according to the request's
/// strategy.
#[derive(Clone)]
pub struct TransactionCoordinator {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    default_timeout: Duration,
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, default_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            default_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Shorthand for an unlabelled request with the default timeout.
    pub async fn execute_transaction(
        &self,
        operations: Vec<WriteOp>,
        strategy: RollbackStrategy,
    ) -> Result<TransactionReceipt> {
        self.execute(TransactionRequest::new("transaction", operations).rollback(strategy))
            .await
    }

    pub async fn execute(&self, request: TransactionRequest) -> Result<TransactionReceipt> {
        let (mut entry, outcome) = self.run(&request).await?;

        match outcome {
            Ok(()) => Ok(TransactionReceipt {
                transaction_id: entry.id,
                operations: request.operations.len(),
                duration_ms: entry.duration_ms.unwrap_or_default(),
            }),
            Err(failure) => {
                let rollback = match request.rollback_strategy {
                    RollbackStrategy::Automatic => Some(Box::new(
                        self.rollback(&mut entry, !failure.is_definite()).await,
                    )),
                    RollbackStrategy::Manual | RollbackStrategy::None => None,
                };
                Err(failure.into_error(entry.id, rollback))
            }
        }
    }

    /// Logs, commits and logs again. Never rolls back, so rollback can call
    /// it without recursing.
    async fn run(
        &self,
        request: &TransactionRequest,
    ) -> Result<(TransactionLogEntry, std::result::Result<(), Failure>)> {
        if request.operations.is_empty() {
            return Err(Error::validation("a transaction needs at least one operation"));
        }

        let operations = self.record_operations(&request.operations).await?;
        let mut entry = TransactionLogEntry {
            id: format!("txn_{}", Ulid::new()),
            label: request.label.clone(),
            status: TransactionStatus::Pending,
            rollback_strategy: request.rollback_strategy,
            operations,
            correlation_id: request.correlation_id.clone(),
            started_at: self.clock.now(),
            finished_at: None,
            duration_ms: None,
            error: None,
            rollback_id: None,
        };

        // Nothing runs unless the attempt is on record first.
        self.store
            .commit(&[log_write(&entry)?])
            .await
            .map_err(Error::Store)?;

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let outcome = match tokio::time::timeout(timeout, self.store.commit(&request.operations)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Failure::Store(e)),
            Err(_) => Err(Failure::Timeout(timeout.as_millis() as u64)),
        };

        match &outcome {
            Ok(()) => {
                entry.finish(TransactionStatus::Completed, None, self.clock.now());
                info!(
                    transaction_id = %entry.id,
                    label = %entry.label,
                    operations = request.operations.len(),
                    "Transaction committed"
                );
            }
            Err(failure) => {
                entry.finish(TransactionStatus::Failed, Some(failure.describe()), self.clock.now());
                warn!(
                    transaction_id = %entry.id,
                    label = %entry.label,
                    error = %failure.describe(),
                    "Transaction failed"
                );
            }
        }
        self.write_log(&entry).await;

        Ok((entry, outcome))
    }

    async fn record_operations(&self, operations: &[WriteOp]) -> Result<Vec<OperationRecord>> {
        let mut seen: HashSet<DocKey> = HashSet::new();
        let mut records = Vec::with_capacity(operations.len());

        for op in operations {
            let first_touch = seen.insert(op.key());
            let creates_document = match (op.operation, &op.precondition) {
                (Operation::Set, _) if !first_touch => false,
                (Operation::Set, Some(Precondition::NotExists)) => true,
                (Operation::Set, _) => !self.store.exists(op.collection, &op.document_id).await?,
                (Operation::Update | Operation::Merge | Operation::Delete, _) => false,
            };
            records.push(OperationRecord {
                op: op.clone(),
                creates_document,
            });
        }
        Ok(records)
    }

    async fn write_log(&self, entry: &TransactionLogEntry) {
        let result = match log_write(entry) {
            Ok(op) => self.store.commit(&[op]).await.map_err(Error::Store),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(transaction_id = %entry.id, error = %e, "Failed to record transaction outcome");
        }
    }

    /// Reverts a failed transaction from its logged operations. A definite
    /// rejection applied nothing, so there is nothing to revert. When it is
    /// unknown whether the commit landed, documents it created are deleted
    /// and every other operation is queued for manual review.
    pub async fn rollback(
        &self,
        entry: &mut TransactionLogEntry,
        outcome_unknown: bool,
    ) -> RollbackReport {
        let mut report = RollbackReport {
            id: format!("rbk_{}", Ulid::new()),
            transaction_id: entry.id.clone(),
            status: RollbackStatus::Completed,
            reverted: vec![],
            not_applied: vec![],
            manual_review: vec![],
            error: None,
            created_at: self.clock.now(),
        };

        let mut deletes = Vec::new();
        let mut review = Vec::new();
        for record in entry.operations.iter().rev() {
            let key = format!("{}/{}", record.op.collection, record.op.document_id);
            if !outcome_unknown {
                // A definite store rejection applied nothing; any existing
                // document belongs to another writer.
                report.not_applied.push(key);
            } else if record.op.operation == Operation::Set && record.creates_document {
                match self.store.exists(record.op.collection, &record.op.document_id).await {
                    Ok(true) => {
                        deletes.push(
                            WriteOp::delete(record.op.collection, &record.op.document_id)
                                .when(Precondition::Exists),
                        );
                        report.reverted.push(key);
                    }
                    Ok(false) => report.not_applied.push(key),
                    Err(e) => {
                        report.error = Some(e.to_string());
                        review.push((record.op.clone(), format!("existence check failed: {e}")));
                        report.manual_review.push(key);
                    }
                }
            } else {
                review.push((
                    record.op.clone(),
                    "no pre-image recorded; cannot revert automatically".to_string(),
                ));
                report.manual_review.push(key);
            }
        }

        if !deletes.is_empty() {
            let request = TransactionRequest::new(format!("rollback:{}", entry.id), deletes)
                .rollback(RollbackStrategy::None)
                .correlation(entry.correlation_id.as_deref());
            let failure = match self.run(&request).await {
                Ok((_, Ok(()))) => None,
                Ok((_, Err(failure))) => Some(failure.describe()),
                Err(e) => Some(e.to_string()),
            };
            if let Some(reason) = failure {
                error!(transaction_id = %entry.id, error = %reason, "Rollback failed, escalating");
                report.error = Some(reason.clone());
                report.status = RollbackStatus::Failed;
                for op in request.operations {
                    review.push((op, format!("rollback failed: {reason}")));
                }
                report.manual_review.append(&mut report.reverted);
            }
        }

        if report.status != RollbackStatus::Failed && !report.manual_review.is_empty() {
            report.status = RollbackStatus::PartiallyCompleted;
        }

        let queued = self.queue_for_review(&entry.id, Some(&report.id), review).await;
        if let Err(e) = queued {
            error!(transaction_id = %entry.id, error = %e, "Failed to queue manual review items");
        }

        match serde_json::to_value(&report) {
            Ok(doc) => {
                if let Err(e) = self
                    .store
                    .commit(&[WriteOp::set(Collection::RollbackLog, &report.id, doc)])
                    .await
                {
                    error!(rollback_id = %report.id, error = %e, "Failed to record rollback");
                }
            }
            Err(e) => error!(rollback_id = %report.id, error = %e, "Failed to encode rollback"),
        }

        entry.rollback_id = Some(report.id.clone());
        self.write_log(entry).await;

        info!(
            transaction_id = %entry.id,
            rollback_id = %report.id,
            reverted = report.reverted.len(),
            manual_review = report.manual_review.len(),
            "Rollback finished"
        );
        report
    }

    /// Writes one manual-review item per entry. Used for irreversible
    /// operations and for failed rollbacks or compensations.
    pub(crate) async fn queue_for_review(
        &self,
        transaction_id: &str,
        rollback_id: Option<&str>,
        items: Vec<(WriteOp, String)>,
    ) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        let now = self.clock.now();
        let mut writes = Vec::with_capacity(items.len());
        for (op, reason) in items {
            let item = ManualReviewItem {
                id: format!("rev_{}", Ulid::new()),
                transaction_id: transaction_id.to_string(),
                rollback_id: rollback_id.map(str::to_string),
                operation: Some(op),
                reason,
                created_at: now,
                resolved: false,
            };
            writes.push(WriteOp::create(
                Collection::ManualReview,
                &item.id,
                serde_json::to_value(&item)?,
            ));
        }
        warn!(transaction_id, items = writes.len(), "Queued for manual review");
        self.store.commit(&writes).await.map_err(Error::Store)
    }
}

fn log_write(entry: &TransactionLogEntry) -> Result<WriteOp> {
    Ok(WriteOp::set(
        Collection::TransactionLog,
        &entry.id,
        serde_json::to_value(entry)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{Filter, MemoryStore};
    use serde_json::json;

    fn coordinator(store: Arc<MemoryStore>) -> TransactionCoordinator {
        let clock = Arc::new(ManualClock::new("2024-03-01T08:00:00Z".parse().unwrap()));
        TransactionCoordinator::new(store, clock, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_commit_is_logged_as_completed() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone());

        let receipt = coordinator
            .execute_transaction(
                vec![WriteOp::create(Collection::Commands, "c1", json!({"v": 1}))],
                RollbackStrategy::Automatic,
            )
            .await
            .unwrap();

        let log = store
            .get(Collection::TransactionLog, &receipt.transaction_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log["status"], json!("completed"));
        assert_eq!(log["operations"][0]["creates_document"], json!(true));
    }

    #[tokio::test]
    async fn test_update_of_missing_document_aborts_everything() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone());

        let result = coordinator
            .execute_transaction(
                vec![
                    WriteOp::create(Collection::Commands, "c1", json!({"v": 1})),
                    WriteOp::update(Collection::Commands, "missing", json!({"v": 2})),
                ],
                RollbackStrategy::Automatic,
            )
            .await;

        assert!(matches!(
            result,
            Err(Error::TransactionFailed {
                source: StoreError::NotFound { .. },
                ..
            })
        ));
        assert!(store.get(Collection::Commands, "c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_created_documents() {
        let store = Arc::new(MemoryStore::new().with_ack_delay(Duration::from_millis(200)));
        let coordinator = coordinator(store.clone());

        let result = coordinator
            .execute(
                TransactionRequest::new(
                    "slow",
                    vec![
                        WriteOp::create(Collection::Events, "e1", json!({"n": 1})),
                        WriteOp::merge(Collection::Commands, "c1", json!({"n": 1})),
                    ],
                )
                .timeout(Duration::from_millis(20)),
            )
            .await;

        let Err(Error::TransactionTimeout { rollback: Some(report), .. }) = result else {
            panic!("expected a timeout with a rollback report");
        };
        assert_eq!(report.reverted, vec!["events/e1".to_string()]);
        assert_eq!(report.manual_review, vec!["commands/c1".to_string()]);
        assert_eq!(report.status, RollbackStatus::PartiallyCompleted);
        assert!(store.get(Collection::Events, "e1").await.unwrap().is_none());

        let queued = store
            .query(Collection::ManualReview, &Filter::new())
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert!(store
            .get(Collection::RollbackLog, &report.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_manual_strategy_leaves_rollback_to_caller() {
        let store = Arc::new(MemoryStore::new());
        store.fail_nth_commit(2);
        let coordinator = coordinator(store.clone());

        let result = coordinator
            .execute_transaction(
                vec![WriteOp::create(Collection::Events, "e1", json!({}))],
                RollbackStrategy::Manual,
            )
            .await;

        assert!(matches!(
            result,
            Err(Error::TransactionFailed { rollback: None, .. })
        ));
        assert!(store
            .query(Collection::RollbackLog, &Filter::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_empty_transaction_rejected() {
        let coordinator = coordinator(Arc::new(MemoryStore::new()));
        assert!(matches!(
            coordinator
                .execute_transaction(vec![], RollbackStrategy::None)
                .await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_create_keeps_the_existing_document() {
        let store = Arc::new(MemoryStore::new());
        let coordinator = coordinator(store.clone());
        coordinator
            .execute_transaction(
                vec![WriteOp::create(Collection::Events, "e1", json!({"winner": true}))],
                RollbackStrategy::Automatic,
            )
            .await
            .unwrap();

        let result = coordinator
            .execute_transaction(
                vec![WriteOp::create(Collection::Events, "e1", json!({"winner": false}))],
                RollbackStrategy::Automatic,
            )
            .await;

        let Err(Error::TransactionFailed { rollback: Some(report), .. }) = result else {
            panic!("expected a failed transaction with a rollback report");
        };
        assert!(report.reverted.is_empty());
        assert_eq!(report.not_applied, vec!["events/e1".to_string()]);
        assert!(report.is_clean());
        let kept = store.get(Collection::Events, "e1").await.unwrap().unwrap();
        assert_eq!(kept["winner"], json!(true));
    }
}
