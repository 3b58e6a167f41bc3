//! Integration tests for the worker thread proxy

mod common;

use common::fake_library::{fake_loader, COMMIT};
use common::{init_tracing, test_registry, TestProject};
use query_engine_host::{
    BatchRequest, Engine, EngineError, EngineEventLevel, EngineState, EngineType, Metrics,
    MetricsOptions, RequestHeaders, RequestOptions, TransactionOptions, TransactionOutcome,
    TransactionRequest, WorkerEngine,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::info;

#[tokio::test]
async fn test_worker_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    info!("🧪 Testing requests through the worker thread");

    let project = TestProject::new();
    let (loader, behavior) = fake_loader();
    let engine = WorkerEngine::spawn_with_loader(project.config(), loader, test_registry()).await?;
    assert_eq!(engine.engine_type(), EngineType::Worker);
    assert_eq!(engine.state(), EngineState::NotStarted);

    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Running);

    let result = engine.request("query { users }", RequestOptions::read()).await?;
    assert_eq!(result.data["data"]["echo"], json!("query { users }"));
    assert_eq!(engine.version().await?, COMMIT);

    engine.stop().await?;
    assert_eq!(engine.state(), EngineState::NotStarted);
    assert_eq!(behavior.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(engine.pending_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_typed_errors_cross_the_worker_boundary() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let project = TestProject::new();
    let (loader, behavior) = fake_loader();
    *behavior.init_error.lock() = Some(json!({
        "message": "Schema parsing failed",
        "error_code": "P1012"
    }));
    let engine = WorkerEngine::spawn_with_loader(project.config(), loader, test_registry()).await?;

    match engine.start().await.unwrap_err() {
        EngineError::Initialization {
            error_code,
            client_version,
            ..
        } => {
            assert_eq!(error_code.as_deref(), Some("P1012"));
            assert_eq!(client_version, common::CLIENT_VERSION);
        }
        other => panic!("expected an initialization error, got {other:?}"),
    }
    assert_eq!(engine.state(), EngineState::Crashed);

    match engine
        .request("query { missing }", RequestOptions::read())
        .await
        .unwrap_err()
    {
        EngineError::KnownRequest { code, meta, .. } => {
            assert_eq!(code, "P2025");
            assert_eq!(meta, Some(json!({ "cause": "Record to update not found." })));
        }
        other => panic!("expected a known request error, got {other:?}"),
    }

    behavior.panic_on_next_query.store(true, Ordering::SeqCst);
    let err = engine
        .request("query { boom }", RequestOptions::read())
        .await
        .unwrap_err();
    assert!(err.is_panic());
    assert_eq!(engine.state(), EngineState::Crashed);
    Ok(())
}

#[tokio::test]
async fn test_worker_batch_and_transactions() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let project = TestProject::new();
    let (loader, _behavior) = fake_loader();
    let engine = WorkerEngine::spawn_with_loader(project.config(), loader, test_registry()).await?;

    let results = engine
        .request_batch(BatchRequest::new(vec![
            "query { one }".to_string(),
            "query { missing }".to_string(),
        ]))
        .await?;
    assert_eq!(results.len(), 2);
    assert!(results[0].is_ok());
    assert!(results[1].as_ref().unwrap_err().is_known_request());

    let info = match engine
        .transaction(
            TransactionRequest::Start(TransactionOptions::default()),
            RequestHeaders::default(),
        )
        .await?
    {
        TransactionOutcome::Started(info) => info,
        other => panic!("expected a started transaction, got {other:?}"),
    };
    let outcome = engine
        .transaction(
            TransactionRequest::Rollback(info.clone()),
            RequestHeaders::for_transaction(&info),
        )
        .await?;
    assert_eq!(outcome, TransactionOutcome::RolledBack);

    match engine.metrics(MetricsOptions::default()).await? {
        Metrics::Json(value) => assert!(value.get("counters").is_some()),
        other => panic!("expected json metrics, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_worker_forwards_engine_events() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let project = TestProject::new();
    let (loader, _behavior) = fake_loader();
    let engine = WorkerEngine::spawn_with_loader(project.config(), loader, test_registry()).await?;
    let mut events = engine.subscribe();

    engine.request("query { logged }", RequestOptions::read()).await?;

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await??;
    assert_eq!(event.level, EngineEventLevel::Query);
    assert_eq!(event.message, "query { logged }");
    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let project = TestProject::new();
    let (loader, behavior) = fake_loader();
    let engine = std::sync::Arc::new(
        WorkerEngine::spawn_with_loader(project.config(), loader, test_registry()).await?,
    );

    let calls: Vec<_> = (0..8)
        .map(|n| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let query = format!("query {{ item{n} }}");
                let result = engine.request(&query, RequestOptions::read()).await?;
                Ok::<_, EngineError>((query, result))
            })
        })
        .collect();

    for call in calls {
        let (query, result) = call.await??;
        assert_eq!(result.data["data"]["echo"], json!(query));
    }
    assert_eq!(behavior.instances.load(Ordering::SeqCst), 1);
    assert_eq!(engine.pending_calls(), 0);
    Ok(())
}
