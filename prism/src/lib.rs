//! # prism
//!
//! The reactive client core of a type-safe API framework: remote queries and
//! mutations become locally observable entities with field-level reactivity,
//! one multiplexed subscription stream per (entity, field), query
//! deduplication and derivation, and optimistic mutation semantics.
//!
//! ```no_run
//! use prism::{Client, MutationCall, MutationKind};
//! use prism::connector::local_process::LocalProcessConnector;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let server = LocalProcessConnector::new();
//! let client = Client::builder()
//!     .fetcher(Arc::new(server.clone()))
//!     .subscription_transport(Arc::new(server.clone()))
//!     .build()?;
//!
//! let user = client.get("User", "u1", None).await?;
//! println!("name = {:?}", user.read("name"));
//! # Ok(())
//! # }
//! ```

pub use prism_core::*;

pub use prism_proto as proto;
pub use prism_signals as signals;
