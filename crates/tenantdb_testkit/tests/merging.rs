//! Writes through loaded instances: ordering, durability failures and
//! change notifications.

use futures::StreamExt;
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tenantdb_server::{
    BatchCommand, DocumentChangeKind, DocumentsTransaction, MergedCommand, PutDocument, ServerError,
    ServerResult, DOCUMENTS_TABLE,
};
use tenantdb_testkit::prelude::*;

const WAIT: Duration = Duration::from_secs(5);

fn multiply(factor: i64) -> impl MergedCommand {
    move |tx: &mut DocumentsTransaction| -> ServerResult<usize> {
        let doc = tx
            .get_document("counter")?
            .ok_or_else(|| ServerError::command("counter is missing"))?;
        let value = doc.data["v"].as_i64().unwrap_or_default();
        tx.put_document("counter", json!({ "v": value * factor }))?;
        Ok(1)
    }
}

fn add(delta: i64) -> impl MergedCommand {
    move |tx: &mut DocumentsTransaction| -> ServerResult<usize> {
        let doc = tx
            .get_document("counter")?
            .ok_or_else(|| ServerError::command("counter is missing"))?;
        let value = doc.data["v"].as_i64().unwrap_or_default();
        tx.put_document("counter", json!({ "v": value + delta }))?;
        Ok(1)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_commands_apply_in_submission_order() {
    let server = TestServer::with_databases(&["a"]);
    let db = server.landlord.get_or_create("a").await.unwrap();
    let merger = db.merger();

    // Order-sensitive: only c1, c2, c3 in that order ends at 15.
    let c1 = merger.submit(Box::new(PutDocument::new("counter", json!({"v": 1})))).unwrap();
    let c2 = merger.submit(Box::new(multiply(10))).unwrap();
    let c3 = merger.submit(Box::new(add(5))).unwrap();

    for reply in [c1, c2, c3] {
        assert_eq!(reply.await.unwrap().unwrap(), 1);
    }
    assert_eq!(db.get_document("counter").unwrap().unwrap().data["v"], 15);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_command_does_not_fail_later_batches() {
    let server = TestServer::with_databases(&["a"]);
    let db = server.landlord.get_or_create("a").await.unwrap();

    let err = db.submit(multiply(2)).await.unwrap_err();
    assert!(matches!(err, ServerError::Command { .. }));
    db.submit(PutDocument::new("counter", json!({"v": 4}))).await.unwrap();
    db.submit(multiply(2)).await.unwrap();
    assert_eq!(db.get_document("counter").unwrap().unwrap().data["v"], 8);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn durability_failure_requires_reload() {
    let provider = Arc::new(FaultInjectingProvider::new());
    let server = TestServer::builder().database("a").provider(provider.clone()).build();
    let db = server.landlord.get_or_create("a").await.unwrap();
    db.submit(PutDocument::new("docs/1", json!({"n": 1}))).await.unwrap();

    provider.fail_flushes(true);
    let err = db.submit(PutDocument::new("docs/2", json!({"n": 2}))).await.unwrap_err();
    assert!(matches!(err, ServerError::StorageCommitFailure { .. }));
    assert!(err.requires_reload());
    assert!(db.get_document("docs/2").unwrap().is_none());
    assert_eq!(db.merger().stats().commit_failures(), 1);

    // Refused until reloaded, even once the disk recovers.
    provider.fail_flushes(false);
    assert!(db.merger().broken_reason().is_some());
    assert!(matches!(
        db.submit(PutDocument::new("docs/3", json!({"n": 3}))).await,
        Err(ServerError::StorageCommitFailure { .. })
    ));

    assert!(server.landlord.unload("a", None, None).await.unwrap());
    let reloaded = server.landlord.get_or_create("a").await.unwrap();
    assert_ne!(db.id(), reloaded.id());
    assert_eq!(reloaded.get_document("docs/1").unwrap().unwrap().data["n"], 1);
    assert!(reloaded.get_document("docs/2").unwrap().is_none());

    reloaded.submit(PutDocument::new("docs/3", json!({"n": 3}))).await.unwrap();
    assert_eq!(reloaded.environment().count(DOCUMENTS_TABLE), 2);
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn control_plane_changes_are_visible_when_submit_returns() {
    let server = TestServer::with_databases(&["a"]);
    let db = server.landlord.get_or_create("a").await.unwrap();
    let mut changes = db.changes().subscribe_all();

    let batch = BatchCommand::new()
        .put("users/1", json!({}))
        .put("system/config", json!({"max": 1}))
        .put("users/2", json!({}))
        .delete("users/1");
    assert_eq!(db.submit(batch).await.unwrap(), 4);

    assert_eq!(db.changes().system_notifications_raised(), 1);
    let first = changes.try_next().unwrap();
    assert_eq!(first.id, "system/config");

    let mut data = Vec::new();
    while data.len() < 3 {
        let change = tokio::time::timeout(WAIT, changes.next()).await.unwrap().unwrap();
        data.push((change.id, change.kind));
    }
    assert_eq!(
        data,
        vec![
            ("users/1".to_string(), DocumentChangeKind::Put),
            ("users/2".to_string(), DocumentChangeKind::Put),
            ("users/1".to_string(), DocumentChangeKind::Delete),
        ]
    );
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn predicate_subscriptions_see_matching_changes() {
    let server = TestServer::with_databases(&["a"]);
    let db = server.landlord.get_or_create("a").await.unwrap();
    let mut orders = db.subscribe(|change| change.collection.as_deref() == Some("Orders"));

    db.submit(PutDocument::new("users/1", json!({}))).await.unwrap();
    db.submit(PutDocument::new("orders/1", json!({"@metadata": {"@collection": "Orders"}})))
        .await
        .unwrap();

    let change = tokio::time::timeout(WAIT, orders.next()).await.unwrap().unwrap();
    assert_eq!(change.id, "orders/1");
    assert!(orders.try_next().is_none());
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_are_merged_into_batches() {
    let server = TestServer::with_databases(&["a"]);
    let db = server.landlord.get_or_create("a").await.unwrap();

    let config = StressConfig {
        writers: 8,
        ops_per_writer: 50,
        payload_size: 64,
    };
    let result = stress_concurrent_writes(&db, &config).await;
    assert_eq!(result.successful_ops, 400);
    assert_eq!(result.failed_ops, 0);
    assert!(result.batches >= 1 && result.batches <= 400);
    assert_eq!(db.environment().count(DOCUMENTS_TABLE), 400);
    assert!(!db.is_busy());
    server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_backed_writes_survive_reload() {
    let server = TestServer::builder().database("orders").on_disk().build();
    let db = server.landlord.get_or_create("orders").await.unwrap();
    db.submit(BatchCommand::new().put("orders/1", json!({"n": 1})).put("orders/2", json!({"n": 2})))
        .await
        .unwrap();
    assert!(server.landlord.unload("orders", None, None).await.unwrap());

    let db = server.landlord.get_or_create("orders").await.unwrap();
    assert_eq!(db.environment().count(DOCUMENTS_TABLE), 2);
    assert!(db.allocated_size() > 0);
    server.shutdown().await.unwrap();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn merged_state_matches_sequential_model(ops in operation_sequence_strategy(24)) {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let server = TestServer::builder()
                .database("model")
                .config(|c| {
                    let database = c.database.clone().max_batch_size(4);
                    c.database(database)
                })
                .build();
            let db = server.landlord.get_or_create("model").await.unwrap();

            let replies: Vec<_> = ops
                .iter()
                .map(|op| {
                    let command = BatchCommand { operations: vec![op.clone()] };
                    db.merger().submit(Box::new(command)).unwrap()
                })
                .collect();
            for reply in replies {
                reply.await.unwrap().unwrap();
            }

            let mut model = BTreeMap::new();
            apply_to_model(&mut model, &ops);
            assert_eq!(db.environment().count(DOCUMENTS_TABLE), model.len());
            for (id, data) in &model {
                assert_eq!(&db.get_document(id).unwrap().unwrap().data, data);
            }
            server.shutdown().await.unwrap();
        });
    }
}
