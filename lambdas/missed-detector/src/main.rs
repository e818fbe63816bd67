use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_lambda_events::eventbridge::EventBridgeEvent;
use domain::clock::{RequestContext, SystemClock};
use domain::config::Config;
use domain::notifications::LogNotifier;
use domain::setup;
use domain::workflows::WorkflowOrchestrator;
use lambda_runtime::{service_fn, Error, LambdaEvent};
use serde_json::{json, Value};

/// Scheduled rule detail-type that switches the run to archiving.
const ARCHIVE_DETAIL_TYPE: &str = "ArchiveExpiredEvents";

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .without_time()
        .init();

    let config = Config::from_env().map_err(anyhow::Error::from)?;
    config.validate().map_err(anyhow::Error::from)?;

    let aws_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let client = aws_sdk_dynamodb::Client::new(&aws_config);
    let store = setup::init_store(client, &config);
    let orchestrator = setup::init(store, Arc::new(LogNotifier), config, Arc::new(SystemClock));

    lambda_runtime::run(service_fn(|event: LambdaEvent<EventBridgeEvent>| {
        let orchestrator = orchestrator.clone();
        async move { handle(event, &orchestrator).await }
    }))
    .await
}

async fn handle(
    event: LambdaEvent<EventBridgeEvent>,
    orchestrator: &WorkflowOrchestrator,
) -> Result<Value, Error> {
    let ctx = RequestContext::system().with_correlation(event.context.request_id.clone());
    tracing::info!(
        request_id = %event.context.request_id,
        detail_type = %event.payload.detail_type,
        "Scheduled run"
    );

    if event.payload.detail_type == ARCHIVE_DETAIL_TYPE {
        let result = orchestrator.archive_expired_events(&ctx).await;
        let body = serde_json::to_value(&result)?;
        result.into_result().map_err(anyhow::Error::from)?;
        return Ok(body);
    }

    let result = orchestrator.detect_missed_doses(&ctx).await;
    let body = serde_json::to_value(&result)?;
    if !result.success {
        tracing::error!(workflow_id = %result.workflow_id, "Missed-dose detection failed");
        result.into_result().map_err(anyhow::Error::from)?;
    }
    Ok(json!({ "status": "ok", "result": body }))
}
