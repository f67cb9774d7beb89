mod common;

use common::*;
use prism::proto::ErrorValue;
use serde_json::json;
use std::time::Duration;

/// A rejected mutation rolls the speculative write back to the pre-apply
/// value and leaves no optimistic entry behind.
#[tokio::test]
async fn rejected_mutation_rolls_back() {
    let (client, server) = client_and_server();
    server.seed("User", "u4", record(&[("name", json!("A"))]));

    let user = client.get("User", "u4", None).await.unwrap();
    assert_eq!(user.read("name"), Some(json!("A")));

    server.set_latency(Duration::from_millis(20));
    server.fail_next_mutation(ErrorValue::application("rejected"));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .mutate(MutationCall::new("User", "u4", MutationKind::Update).data(record(&[("name", json!("B"))])))
                .await
        })
    };

    // The speculative write is visible while the mutation is in flight
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(user.read("name"), Some(json!("B")));
    assert!(client.optimistic().has_pending(&"User".into(), &"u4".into()));

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(prism::MutationError::Application(_))));

    assert_eq!(user.read("name"), Some(json!("A")));
    assert!(!client.optimistic().has_pending(&"User".into(), &"u4".into()));
    assert_eq!(client.optimistic().pending_count(), 0);
}

/// A confirmed mutation ends with the server-authoritative record installed —
/// observationally the same as applying the server data directly.
#[tokio::test]
async fn confirmed_mutation_installs_server_record() {
    let (client, server) = client_and_server();
    server.seed("User", "u1", record(&[("name", json!("A")), ("age", json!(30))]));

    let user = client.get("User", "u1", None).await.unwrap();
    let result = client
        .mutate(MutationCall::new("User", "u1", MutationKind::Update).data(record(&[("name", json!("B"))])))
        .await
        .unwrap();

    // Server merged the update into the full record and returned it
    let server_record = result.unwrap();
    assert_eq!(server_record["name"], json!("B"));
    assert_eq!(server_record["age"], json!(30));

    assert_eq!(user.read("name"), Some(json!("B")));
    assert_eq!(user.read("age"), Some(json!(30)));
    assert_eq!(client.optimistic().pending_count(), 0);
}

/// Creating optimistically then failing removes the entity that never
/// existed.
#[tokio::test]
async fn failed_create_removes_the_entity() {
    let (client, server) = client_and_server();
    server.fail_next_mutation(ErrorValue::transport("socket dropped"));

    let result = client
        .mutate(MutationCall::new("User", "new", MutationKind::Create).data(record(&[("name", json!("N"))])))
        .await;
    assert!(matches!(result, Err(prism::MutationError::Transport(_))));
    assert!(client.muxer().cell(&"User".into(), &"new".into()).is_none());
}

/// Deletes need no response body; the tombstone stays after confirmation.
#[tokio::test]
async fn delete_mutation_confirms_without_body() {
    let (client, server) = client_and_server();
    server.seed("User", "u1", record(&[("name", json!("A"))]));
    let user = client.get("User", "u1", None).await.unwrap();

    let result = client.mutate(MutationCall::new("User", "u1", MutationKind::Delete)).await.unwrap();
    assert!(result.is_none());
    assert_eq!(user.cell().peek_field(prism::optimistic::DELETED_FIELD), Some(json!(true)));
    assert_eq!(client.optimistic().pending_count(), 0);
}

/// Mutation plugin hooks observe errors.
#[tokio::test]
async fn mutation_error_hook_fires() {
    use prism::plugin::{PluginDef, PluginInstance};
    use prism::{OperationContext, OperationResult};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ErrorCounter(Arc<AtomicUsize>);
    impl PluginInstance for ErrorCounter {
        fn on_mutation_error(&self, _ctx: &OperationContext, _result: &OperationResult) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let errors = Arc::new(AtomicUsize::new(0));
    let server = LocalProcessConnector::new();
    server.seed("User", "u1", record(&[("name", json!("A"))]));
    server.fail_next_mutation(ErrorValue::application("no"));

    let client = Client::builder()
        .fetcher(Arc::new(server.clone()))
        .plugin(PluginDef::new("errors", {
            let errors = errors.clone();
            Arc::new(move |_config| Arc::new(ErrorCounter(errors.clone())) as Arc<dyn PluginInstance>)
        }))
        .build()
        .unwrap();

    let result = client
        .mutate(MutationCall::new("User", "u1", MutationKind::Update).data(record(&[("name", json!("B"))])))
        .await;
    assert!(result.is_err());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

/// With optimistic updates disabled, nothing is written until the server
/// answers.
#[tokio::test]
async fn disabled_optimistic_waits_for_the_server() {
    use prism::OptimisticConfig;
    use std::sync::Arc;

    let server = LocalProcessConnector::new();
    server.seed("User", "u1", record(&[("name", json!("A"))]));
    let client = Client::builder()
        .fetcher(Arc::new(server.clone()))
        .subscription_transport(Arc::new(server.clone()))
        .optimistic(OptimisticConfig { enabled: false, ..Default::default() })
        .build()
        .unwrap();

    let user = client.get("User", "u1", None).await.unwrap();
    server.set_latency(Duration::from_millis(20));

    let pending = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .mutate(MutationCall::new("User", "u1", MutationKind::Update).data(record(&[("name", json!("B"))])))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(user.read("name"), Some(json!("A"))); // no speculative write

    pending.await.unwrap().unwrap();
}
