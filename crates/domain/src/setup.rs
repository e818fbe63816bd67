use std::sync::Arc;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::clock::Clock;
use crate::config::Config;
use crate::events::EventStore;
use crate::medications::CommandStore;
use crate::notifications::Notifier;
use crate::store::{dynamo::DynamoStore, DocumentStore};
use crate::transactions::TransactionCoordinator;
use crate::undo::UndoEngine;
use crate::workflows::WorkflowOrchestrator;

/// Wires the stores, coordinator and undo engine over one document store.
pub fn init(
    store: Arc<dyn DocumentStore>,
    notifier: Arc<dyn Notifier>,
    config: Config,
    clock: Arc<dyn Clock>,
) -> Arc<WorkflowOrchestrator> {
    let coordinator = Arc::new(TransactionCoordinator::new(
        store.clone(),
        clock.clone(),
        config.transaction_timeout,
    ));
    let events = EventStore::new(
        store.clone(),
        coordinator.clone(),
        clock.clone(),
        config.max_batch_size,
    );
    let commands = CommandStore::new(store, coordinator.clone(), events.clone(), clock.clone());
    let undo = UndoEngine::new(
        events.clone(),
        commands.clone(),
        coordinator.clone(),
        clock.clone(),
        &config,
    );
    let breakers = Arc::new(CircuitBreakerRegistry::new(
        config.breaker_failure_threshold,
        config.breaker_cooldown,
    ));

    Arc::new(WorkflowOrchestrator::new(
        commands,
        events,
        undo,
        coordinator,
        notifier,
        breakers,
        clock,
        Arc::new(config),
    ))
}

pub fn init_store(client: aws_sdk_dynamodb::Client, config: &Config) -> Arc<dyn DocumentStore> {
    Arc::new(DynamoStore::new(client, config.tables.clone()))
}
