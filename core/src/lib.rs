pub mod client;
pub mod connector;
pub mod delta;
pub mod entity;
pub mod error;
pub mod executor;
pub mod muxer;
pub mod optimistic;
pub mod plugin;
pub mod resolver;
pub mod task;

pub use client::{Client, ClientBuilder, MutationCall};
pub use connector::{Fetcher, SubscriptionSender, UpdateCallback};
pub use entity::{DerivedEntity, EntityCell};
pub use error::{ConfigError, MutationError, RetrievalError};
pub use executor::{Link, LinkChain, Next, OperationContext, OperationHandle, OperationResult};
pub use muxer::SubscriptionMultiplexer;
pub use optimistic::{MutationKind, OptimisticConfig, OptimisticEngine, OptimisticId};
pub use plugin::{PluginDef, PluginHost, PluginInstance, PluginRegistration};
pub use resolver::{EntityHandle, ListHandle, QueryResolver};

pub use prism_proto as proto;
pub use prism_signals as signals;
