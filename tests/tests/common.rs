#[allow(unused)]
pub use prism::connector::local_process::LocalProcessConnector;
#[allow(unused)]
pub use prism::{Client, MutationCall, MutationKind};

use std::str::FromStr;
use std::sync::Arc;
use tracing::Level;

// Initialize tracing for tests
#[ctor::ctor]
fn init_tracing() {
    // if LOG_LEVEL env var is set, use it
    if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::fmt().with_max_level(Level::from_str(&level).unwrap()).with_test_writer().init();
    } else {
        tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
    }
}

#[allow(unused)]
pub fn record(pairs: &[(&str, serde_json::Value)]) -> prism::proto::Record {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

/// A client wired to a fresh in-process server over both channels.
#[allow(unused)]
pub fn client_and_server() -> (Client, LocalProcessConnector) {
    let server = LocalProcessConnector::new();
    let client = Client::builder()
        .fetcher(Arc::new(server.clone()))
        .subscription_transport(Arc::new(server.clone()))
        .build()
        .expect("client config is valid");
    (client, server)
}

/// Sleep comfortably past the 10 ms batching tick.
#[allow(unused)]
pub async fn settle() { tokio::time::sleep(std::time::Duration::from_millis(40)).await }
