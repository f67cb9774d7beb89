mod common;

use common::*;
use prism::proto::{DeltaOp, FieldUpdate};
use prism::signals::Effect;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Server-pushed text deltas splice into the subscribed field.
#[tokio::test]
async fn field_deltas_apply_in_order() {
    let (client, server) = client_and_server();
    server.seed("Doc", "d1", record(&[("content", json!("Hello"))]));

    let doc = client.get("Doc", "d1", None).await.unwrap();
    assert_eq!(doc.read("content"), Some(json!("Hello")));

    server.push_update(
        "Doc",
        "d1",
        "content",
        FieldUpdate::Delta { data: vec![DeltaOp { position: 5, insert: Some(" World".to_string()), delete: 0 }] },
    );
    assert_eq!(doc.read("content"), Some(json!("Hello World")));

    server.push_update(
        "Doc",
        "d1",
        "content",
        FieldUpdate::Delta { data: vec![DeltaOp { position: 11, insert: Some("!".to_string()), delete: 0 }] },
    );
    assert_eq!(doc.read("content"), Some(json!("Hello World!")));
}

/// With a selective subscription the server refuses pushes for other fields,
/// and each name change notifies the subscriber exactly once.
#[tokio::test]
async fn selective_subscription_filters_pushes() {
    let (client, server) = client_and_server();
    server.seed("User", "u3", record(&[("name", json!("J")), ("bio", json!("initial"))]));

    // Prime the cache with the whole record, then drop that interest so the
    // only live subscription is the selective one below
    let full = client.get("User", "u3", None).await.unwrap();
    client.release(full.key().unwrap());

    let user = client.get("User", "u3", Some(&["name".to_string()])).await.unwrap();
    settle().await; // let the subscribe intent flush

    let notifications = Arc::new(AtomicUsize::new(0));
    let _effect = Effect::new({
        let user = user.clone();
        let notifications = notifications.clone();
        move || {
            let _ = user.read("name");
            notifications.fetch_add(1, Ordering::SeqCst);
        }
    });
    assert_eq!(notifications.load(Ordering::SeqCst), 1);

    // bio was never subscribed: the transport refuses to forward it
    server.push_update("User", "u3", "bio", FieldUpdate::Value { data: json!("changed") });
    assert_eq!(user.cell().peek_field("bio"), Some(json!("initial")));

    // one pushed name change, exactly one notification
    server.push_update("User", "u3", "name", FieldUpdate::Value { data: json!("K") });
    assert_eq!(notifications.load(Ordering::SeqCst), 2);
    assert_eq!(user.read("name"), Some(json!("K")));
}

/// Two local subscribers to one field produce one subscribe message; the
/// unsubscribe goes out only when the last one releases.
#[tokio::test]
async fn field_interest_is_refcounted_end_to_end() {
    let (client, server) = client_and_server();
    server.seed("User", "u5", record(&[("name", json!("A")), ("bio", json!("B"))]));

    let muxer = client.muxer();
    let entity = "User".into();
    let id = "u5".into();
    muxer.get_or_create(&entity, &id, record(&[("name", json!("A"))]));

    let name = "name".to_string();
    muxer.subscribe_field(&entity, &id, &name);
    muxer.subscribe_field(&entity, &id, &name);
    settle().await;
    assert_eq!(server.subscribe_message_count(), 1);

    muxer.unsubscribe_field(&entity, &id, &name);
    settle().await;
    assert_eq!(server.unsubscribe_message_count(), 0);

    muxer.unsubscribe_field(&entity, &id, &name);
    settle().await;
    assert_eq!(server.unsubscribe_message_count(), 1);

    // Back to the exact pre-subscription state
    assert_eq!(muxer.field_ref_count(&entity, &id, "name"), 0);
    assert!(!muxer.has_pending_intents(&entity, &id));
    assert!(!server.is_subscribed(&entity, &id, "name"));
}

/// Sum of single-field derivability equals the number of fields with positive
/// ref-count whenever the full-entity count is zero.
#[tokio::test]
async fn derivability_matches_refcounts() {
    let (client, _server) = client_and_server();
    let muxer = client.muxer();
    let entity = "User".into();
    let id = "u1".into();
    muxer.get_or_create(&entity, &id, record(&[("a", json!(1)), ("b", json!(2)), ("c", json!(3))]));

    let fields = ["a", "b", "c"];
    muxer.subscribe_field(&entity, &id, &"a".to_string());
    muxer.subscribe_field(&entity, &id, &"c".to_string());

    assert_eq!(muxer.entity_ref_count(&entity, &id), 0);
    let derivable = fields.iter().filter(|f| muxer.can_derive(&entity, &id, &[f.to_string()])).count();
    let positive = fields.iter().filter(|f| muxer.field_ref_count(&entity, &id, f) > 0).count();
    assert_eq!(derivable, positive);
    assert_eq!(derivable, 2);
}

/// After unsubscribe-all, updates addressed to the pair reach nobody until a
/// new get-or-create.
#[tokio::test]
async fn unsubscribe_all_cuts_off_updates() {
    let (client, server) = client_and_server();
    server.seed("User", "u6", record(&[("name", json!("A"))]));

    let user = client.get("User", "u6", None).await.unwrap();
    let entity = "User".into();
    let id = "u6".into();

    client.muxer().unsubscribe_all(&entity, &id);
    assert!(user.cell().is_disposed());

    server.push_update("User", "u6", "name", FieldUpdate::Value { data: json!("B") });
    assert_eq!(user.cell().peek_field("name"), Some(json!("A")));
}
