mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A full-entity subscription lets a later field query derive without a
/// second fetch.
#[tokio::test]
async fn derive_from_full_subscription() {
    let (client, server) = client_and_server();
    server.seed("User", "u1", record(&[("id", json!("u1")), ("name", json!("J")), ("bio", json!("H")), ("email", json!("j@e"))]));

    let user = client.get("User", "u1", None).await.unwrap();
    assert!(!user.derived());
    assert_eq!(server.fetch_calls(), 1);

    let named = client.get("User", "u1", Some(&["name".to_string()])).await.unwrap();
    assert!(named.derived());
    assert_eq!(server.fetch_calls(), 1); // no refetch
    assert_eq!(named.read("name"), Some(json!("J")));

    // The derived view reads through the same cell
    assert!(named.cell().ptr_eq(user.cell()));
}

/// Concurrent resolves for one (entity, id) share a single fetch and a single
/// cell.
#[tokio::test]
async fn concurrent_resolves_deduplicate() {
    let (client, server) = client_and_server();
    server.seed("User", "u2", record(&[("name", json!("J"))]));
    server.set_latency(Duration::from_millis(10));

    let (a, b, c) = tokio::join!(
        client.get("User", "u2", None),
        client.get("User", "u2", None),
        client.get("User", "u2", None),
    );
    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());

    assert_eq!(server.fetch_calls(), 1);
    assert!(a.cell().ptr_eq(b.cell()));
    assert!(b.cell().ptr_eq(c.cell()));
    assert_eq!(client.resolver().inflight_count(), 0);
}

/// A fetch failure propagates to every caller attached to the in-flight
/// promise, and the in-flight entry is gone afterward.
#[tokio::test]
async fn dedup_failure_reaches_all_callers() {
    let (client, server) = client_and_server();
    server.seed("User", "u1", record(&[("name", json!("J"))]));
    server.set_latency(Duration::from_millis(10));
    server.fail_next_fetch(prism::RetrievalError::Transport("socket dropped".to_string()));

    let (a, b) = tokio::join!(client.get("User", "u1", None), client.get("User", "u1", None));
    assert!(a.is_err());
    assert!(b.is_err());
    assert_eq!(server.fetch_calls(), 1);
    assert_eq!(client.resolver().inflight_count(), 0);

    // A later resolve starts fresh and succeeds
    let ok = client.get("User", "u1", None).await;
    assert!(ok.is_ok());
    assert_eq!(server.fetch_calls(), 2);
}

#[tokio::test]
async fn missing_entities_resolve_to_not_found() {
    let (client, server) = client_and_server();
    let result = client.get("User", "ghost", None).await;
    assert!(matches!(result, Err(prism::RetrievalError::NotFound)));
    assert_eq!(server.fetch_calls(), 1);
}

/// Releasing the last holder of a query key unsubscribes the full entity.
#[tokio::test]
async fn release_on_last_holder() {
    let (client, server) = client_and_server();
    server.seed("User", "u1", record(&[("name", json!("J"))]));

    let first = client.get("User", "u1", None).await.unwrap();
    let second = client.get("User", "u1", None).await.unwrap();
    let key = first.key().unwrap().clone();
    assert_eq!(second.key(), Some(&key));
    assert_eq!(client.muxer().entity_ref_count(&"User".into(), &"u1".into()), 1);

    client.release(&key);
    server.clear_sent_messages();
    client.release(&key);
    settle().await;

    assert_eq!(client.muxer().entity_ref_count(&"User".into(), &"u1".into()), 0);
    assert_eq!(server.unsubscribe_message_count(), 1);
}

/// Queued fetches in one window go out as a single bulk request when the
/// transport advertises one.
#[tokio::test]
async fn queued_fetches_use_bulk_primitive() {
    let server = LocalProcessConnector::with_batching(true);
    server.seed("User", "u1", record(&[("name", json!("A"))]));
    server.seed("User", "u2", record(&[("name", json!("B"))]));
    let client = Client::builder()
        .fetcher(Arc::new(server.clone()))
        .subscription_transport(Arc::new(server.clone()))
        .build()
        .unwrap();

    let a = client.queue_fetch("User", "u1", None);
    let b = client.queue_fetch("User", "u2", None);
    let missing = client.queue_fetch("User", "ghost", None);
    let (a, b, missing) = tokio::join!(a, b, missing);

    assert_eq!(a.unwrap().read("name"), Some(json!("A")));
    assert_eq!(b.unwrap().read("name"), Some(json!("B")));
    assert!(matches!(missing, Err(prism::RetrievalError::NotFound)));

    assert_eq!(server.batch_calls(), 1);
    assert_eq!(server.fetch_calls(), 0);
}

/// Without a bulk primitive the queue falls back to per-item deduplicated
/// fetches.
#[tokio::test]
async fn queued_fetches_fall_back_to_single_fetches() {
    let (client, server) = client_and_server();
    server.seed("User", "u1", record(&[("name", json!("A"))]));

    let a = client.queue_fetch("User", "u1", None);
    let b = client.queue_fetch("User", "u1", None);
    let (a, b) = tokio::join!(a, b);

    assert!(a.is_ok());
    assert!(b.is_ok());
    // Same canonical key: the two queued items share one fetch
    assert_eq!(server.fetch_calls(), 1);
    assert_eq!(server.batch_calls(), 0);
}

/// Lists fetch unconditionally, install every item, and expose a computed
/// list value that tracks item updates.
#[tokio::test]
async fn list_queries_install_items() {
    let (client, server) = client_and_server();
    server.seed("Post", "p1", record(&[("id", json!("p1")), ("title", json!("first"))]));
    server.seed("Post", "p2", record(&[("id", json!("p2")), ("title", json!("second"))]));

    let posts = client.list("Post", json!({})).await.unwrap();
    assert_eq!(posts.len(), 2);
    assert_eq!(server.fetch_list_calls(), 1);

    let titles: Vec<_> = posts.value().iter().map(|r| r["title"].clone()).collect();
    assert_eq!(titles, vec![json!("first"), json!("second")]);

    // Items are live cells: a server push is visible through the list value
    settle().await; // full-entity subscriptions are immediate, but let intents flush
    server.push_update("Post", "p1", "title", prism::proto::FieldUpdate::Value { data: json!("edited") });
    let titles: Vec<_> = posts.value().iter().map(|r| r["title"].clone()).collect();
    assert_eq!(titles, vec![json!("edited"), json!("second")]);

    // Lists never derive: an identical list query fetches again
    let _again = client.list("Post", json!({})).await.unwrap();
    assert_eq!(server.fetch_list_calls(), 2);
}

/// A list failure leaves no partial subscriptions behind.
#[tokio::test]
async fn failed_list_subscribes_nothing() {
    let (client, server) = client_and_server();
    server.seed("Post", "p1", record(&[("id", json!("p1")), ("title", json!("t"))]));
    server.fail_next_fetch(prism::RetrievalError::Transport("boom".to_string()));

    assert!(client.list("Post", json!({})).await.is_err());
    settle().await;
    assert_eq!(server.subscribe_message_count(), 0);
    assert_eq!(client.resolver().active_queries(), 0);
}

/// Plugin query hooks bracket resolution.
#[tokio::test]
async fn query_hooks_fire_around_resolution() {
    use prism::plugin::{PluginDef, PluginInstance};
    use prism::{OperationContext, OperationResult};

    struct Hooks {
        starts: Arc<AtomicUsize>,
        ends: Arc<AtomicUsize>,
    }
    impl PluginInstance for Hooks {
        fn on_query_start(&self, _ctx: &OperationContext) -> anyhow::Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_query_end(&self, _ctx: &OperationContext, _result: &OperationResult) -> anyhow::Result<()> {
            self.ends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    let server = LocalProcessConnector::new();
    server.seed("User", "u1", record(&[("name", json!("J"))]));

    let client = Client::builder()
        .fetcher(Arc::new(server.clone()))
        .plugin(PluginDef::new("hooks", {
            let starts = starts.clone();
            let ends = ends.clone();
            Arc::new(move |_config| {
                Arc::new(Hooks { starts: starts.clone(), ends: ends.clone() }) as Arc<dyn PluginInstance>
            })
        }))
        .build()
        .unwrap();

    client.get("User", "u1", None).await.unwrap();
    assert_eq!(starts.load(Ordering::SeqCst), 1);
    assert_eq!(ends.load(Ordering::SeqCst), 1);
}
