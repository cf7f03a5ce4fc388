//! Loading databases through the landlord: sharing, admission and failures.

use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tenantdb_server::{
    DatabaseRecord, DeletionStatus, EntryState, PutDocument, ServerError, KEEP_FAILED_LOAD,
    MAX_BATCH_SIZE,
};
use tenantdb_testkit::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_construction() {
    let provider = Arc::new(GatedProvider::closed());
    let server = TestServer::builder().database("orders").provider(provider.clone()).build();

    let callers = (0..16).map(|i| {
        let landlord = Arc::clone(&server.landlord);
        // Mixed case resolves to the same instance.
        let name = if i % 2 == 0 { "orders" } else { "ORDERS" };
        tokio::spawn(async move { landlord.get_or_create(name).await })
    });
    let callers: Vec<_> = callers.collect();
    assert!(provider.wait_for_active(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    provider.release();

    let ids: Vec<_> = join_all(callers)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap().id())
        .collect();
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(provider.opens(), 1);
    assert_eq!(server.landlord.stats().loads(), 1);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn admission_never_exceeds_capacity() {
    let provider = Arc::new(GatedProvider::closed());
    let names: Vec<String> = (0..6).map(|i| format!("db{i}")).collect();
    let server = names
        .iter()
        .fold(TestServer::builder(), |builder, name| builder.database(name))
        .provider(provider.clone())
        .config(|c| c.max_concurrent_loads(2).concurrent_load_timeout(Duration::from_secs(20)))
        .build();

    let loads: Vec<_> = names
        .iter()
        .map(|name| {
            let landlord = Arc::clone(&server.landlord);
            let name = name.clone();
            tokio::spawn(async move { landlord.get_or_create(&name).await })
        })
        .collect();

    assert!(provider.wait_for_active(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.active(), 2);
    assert_eq!(server.landlord.admission().in_use(), 2);

    provider.release();
    for load in join_all(loads).await {
        load.unwrap().unwrap();
    }
    assert_eq!(provider.opens(), 6);
    assert!(provider.max_concurrent() <= 2);
    assert_eq!(server.landlord.admission().in_use(), 0);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_gate_times_out_then_admits() {
    let provider = Arc::new(GatedProvider::closed());
    let server = TestServer::builder()
        .database("a")
        .database("b")
        .provider(provider.clone())
        .config(|c| c.max_concurrent_loads(1).concurrent_load_timeout(Duration::from_millis(200)))
        .build();

    let landlord = Arc::clone(&server.landlord);
    let a = tokio::spawn(async move { landlord.get_or_create("a").await });
    assert!(provider.wait_for_active(1, WAIT).await);

    let err = server.landlord.get_or_create("b").await.unwrap_err();
    assert!(matches!(err, ServerError::ConcurrentLoadTimeout { ref name, .. } if name == "b"));
    assert!(err.is_retryable());
    assert_eq!(server.landlord.stats().admission_timeouts(), 1);
    assert!(server.landlord.database_state("b").is_none());

    provider.release();
    a.await.unwrap().unwrap();
    server.landlord.get_or_create("b").await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_load_proceeds_when_a_token_frees_up() {
    let provider = Arc::new(GatedProvider::closed());
    let server = TestServer::builder()
        .database("a")
        .database("b")
        .provider(provider.clone())
        .config(|c| c.max_concurrent_loads(1).concurrent_load_timeout(Duration::from_secs(20)))
        .build();

    let landlord = Arc::clone(&server.landlord);
    let a = tokio::spawn(async move { landlord.get_or_create("a").await });
    assert!(provider.wait_for_active(1, WAIT).await);
    let landlord = Arc::clone(&server.landlord);
    let b = tokio::spawn(async move { landlord.get_or_create("b").await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(provider.opens(), 1);
    provider.release();

    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();
    assert_eq!(provider.max_concurrent(), 1);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unload_then_load_constructs_a_fresh_instance() {
    let server = TestServer::with_databases(&["orders"]);
    let first = server.landlord.get_or_create("orders").await.unwrap();
    first.submit(PutDocument::new("orders/1", json!({"total": 10}))).await.unwrap();

    assert!(server.landlord.unload("orders", None, None).await.unwrap());
    assert!(first.is_disposed());
    assert!(server.landlord.database_state("orders").is_none());
    assert!(server.landlord.last_used("orders").is_none());
    assert!(!server.landlord.unload("orders", None, None).await.unwrap());

    let second = server.landlord.get_or_create("orders").await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(second.get_document("orders/1").unwrap().unwrap().data["total"], 10);
    assert_eq!(server.landlord.stats().loads(), 2);
    assert_eq!(server.landlord.stats().unloads(), 1);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reload_during_unload_waits_for_disposal() {
    let server = TestServer::builder().database("orders").on_disk().build();

    for round in 0..20 {
        let id = format!("orders/{round}");
        let db = server.landlord.get_or_create("orders").await.unwrap();
        db.submit(PutDocument::new(id.clone(), json!({ "round": round })))
            .await
            .unwrap();
        drop(db);

        let landlord = Arc::clone(&server.landlord);
        let unload = tokio::spawn(async move { landlord.unload("orders", None, None).await });
        while matches!(
            server.landlord.database_state("orders"),
            Some(EntryState::Loaded(_))
        ) {
            tokio::task::yield_now().await;
        }

        // The old instance still holds the directory lock until disposed.
        let reloaded = server.landlord.get_or_create("orders").await.unwrap();
        assert!(unload.await.unwrap().unwrap());
        assert_eq!(reloaded.get_document(&id).unwrap().unwrap().data["round"], round);
    }

    assert_eq!(server.landlord.stats().unloads(), 20);
    assert_eq!(server.landlord.stats().loads(), 21);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn skip_predicate_keeps_instance_loaded() {
    let server = TestServer::with_databases(&["orders"]);
    let db = server.landlord.get_or_create("orders").await.unwrap();
    let keep =
        |candidate: &tenantdb_server::DocumentDatabase| candidate.name().as_str() == "orders";

    assert!(!server.landlord.unload("orders", None, Some(&keep)).await.unwrap());
    assert!(!db.is_disposed());
    assert!(server.landlord.unload("orders", None, None).await.unwrap());
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_construction_is_evicted_and_retried() {
    let provider = Arc::new(FaultInjectingProvider::new());
    provider.fail_next_opens(1);
    let server = TestServer::builder().database("a").provider(provider.clone()).build();

    let err = server.landlord.get_or_create("a").await.unwrap_err();
    assert!(matches!(err, ServerError::LoadFailure { ref name, .. } if name == "a"));
    assert!(server.landlord.database_state("a").is_none());
    assert_eq!(server.landlord.stats().load_failures(), 1);
    assert_eq!(server.landlord.admission().in_use(), 0);

    server.landlord.get_or_create("a").await.unwrap();
    assert_eq!(provider.opens(), 2);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn kept_failed_load_is_evicted_by_next_request() {
    let provider = Arc::new(FaultInjectingProvider::new());
    provider.fail_next_opens(1);
    let mut record = DatabaseRecord::new("a", &[NODE]);
    record.settings.insert(KEEP_FAILED_LOAD.into(), "true".into());
    let server = TestServer::builder().record(record).provider(provider.clone()).build();

    assert!(server.landlord.get_or_create("a").await.is_err());
    assert!(matches!(
        server.landlord.database_state("a"),
        Some(EntryState::Faulted(ServerError::LoadFailure { .. }))
    ));

    server.landlord.get_or_create("a").await.unwrap();
    assert_eq!(provider.opens(), 2);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn load_timeout_leaves_the_load_running() {
    let provider = Arc::new(GatedProvider::closed());
    let server = TestServer::builder()
        .database("slow")
        .provider(provider.clone())
        .config(|c| c.database_load_timeout(Duration::from_millis(100)))
        .build();

    let err = server.landlord.get_database("slow").await.unwrap_err();
    assert!(matches!(err, ServerError::DatabaseLoadTimeout { .. }));
    assert!(matches!(server.landlord.database_state("slow"), Some(EntryState::Loading)));
    assert!(matches!(
        server.landlord.unload("slow", None, None).await,
        Err(ServerError::StillLoading { .. })
    ));

    provider.release();
    server.landlord.get_or_create("slow").await.unwrap();
    assert_eq!(provider.opens(), 1);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn record_validation_rejects_before_admission() {
    let server = TestServer::builder()
        .database("disabled")
        .database("deleting")
        .record(DatabaseRecord::new("elsewhere", &["B"]))
        .record({
            let mut record = DatabaseRecord::new("misconfigured", &[NODE]);
            record.settings.insert(MAX_BATCH_SIZE.into(), "0".into());
            record
        })
        .build();
    server.disable("disabled");
    server.mark_deleted("deleting", DeletionStatus::SoftDelete);
    let landlord = &server.landlord;

    let cases = [
        ("missing", "DatabaseNotFound"),
        ("disabled", "InstanceDisabled"),
        ("deleting", "InstanceBeingDeleted"),
        ("elsewhere", "NotRelevant"),
        ("misconfigured", "InvalidSetting"),
        ("<system>", "InvalidName"),
        ("  ", "InvalidName"),
    ];
    for (name, expected) in cases {
        let err = landlord.get_or_create(name).await.unwrap_err();
        let actual = match err {
            ServerError::DatabaseNotFound { .. } => "DatabaseNotFound",
            ServerError::InstanceDisabled { .. } => "InstanceDisabled",
            ServerError::InstanceBeingDeleted { .. } => "InstanceBeingDeleted",
            ServerError::NotRelevant { .. } => "NotRelevant",
            ServerError::InvalidSetting { .. } => "InvalidSetting",
            ServerError::InvalidName { .. } => "InvalidName",
            other => panic!("unexpected error for {name}: {other}"),
        };
        assert_eq!(actual, expected, "{name}");
    }
    assert_eq!(landlord.stats().loads(), 0);
    assert_eq!(landlord.admission().in_use(), 0);

    landlord.try_get_or_create("disabled", true).await.unwrap().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn load_notifications_are_broadcast() {
    use futures::StreamExt;

    let server = TestServer::with_databases(&["a", "b"]);
    let mut loaded = server.landlord.notifications().on_database_loaded();

    server.landlord.get_or_create("a").await.unwrap();
    server.landlord.get_or_create("b").await.unwrap();
    server.landlord.get_or_create("a").await.unwrap();

    let first = tokio::time::timeout(WAIT, loaded.next()).await.unwrap();
    let second = tokio::time::timeout(WAIT, loaded.next()).await.unwrap();
    assert_eq!(first.as_deref(), Some("a"));
    assert_eq!(second.as_deref(), Some("b"));
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_databases_load_concurrently() {
    let names: Vec<String> = (0..32).map(|i| format!("tenant{i}")).collect();
    let server = names
        .iter()
        .fold(TestServer::builder(), |builder, name| builder.database(name))
        .config(|c| c.max_concurrent_loads(4).concurrent_load_timeout(Duration::from_secs(20)))
        .build();

    let result = stress_concurrent_loads(&server.landlord, "tenant", names.len()).await;
    assert_eq!(result.successful_ops, 32);
    assert_eq!(server.landlord.loaded_databases().len(), 32);
    server.shutdown().await.unwrap();
}
