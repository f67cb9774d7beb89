//! Public error types for the prism client core.
//!
//! Errors in the operation executor never cross the public boundary as
//! panics; they surface in the result's `error` slot as a
//! [`prism_proto::ErrorValue`]. These enums are the typed view used by the
//! resolver and the mutation path.

use prism_proto::{ErrorKind, ErrorValue};
use thiserror::Error;

/// Error type for retrieval operations.
///
/// Returned from: `Client::get`, `Client::list`, `QueryResolver::resolve_*`.
/// Cloneable so a single deduplicated fetch failure can propagate to every
/// caller attached to the in-flight promise.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    /// Entity not found
    #[error("entity not found")]
    NotFound,

    /// The transport failed to deliver or hit a protocol-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid query shape or options
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// A bug in the core; logged with a stable identifier
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error type for mutation operations.
///
/// Returned from: `Client::mutate`.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    /// The args failed the schema bound to the operation; no state mutated
    #[error("validation error: {0}")]
    Validation(String),

    /// The transport failed to deliver the mutation
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote handler returned a structured failure
    #[error("application error: {0}")]
    Application(ErrorValue),

    /// A bug in the core; logged with a stable identifier
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error type for client construction.
///
/// Returned from: `Client::new`, `LinkChain::new`, `PluginHost::register`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The executor needs at least one link (the terminal)
    #[error("link chain requires at least one link")]
    EmptyLinkChain,

    /// A plugin declared a dependency that was never registered
    #[error("plugin {plugin}: missing dependency {dependency}")]
    MissingPluginDependency { plugin: String, dependency: String },

    /// The client needs a request/response transport
    #[error("client requires a fetcher transport")]
    MissingFetcher,
}

impl From<ErrorValue> for RetrievalError {
    fn from(err: ErrorValue) -> Self {
        match err.kind {
            ErrorKind::Transport => RetrievalError::Transport(err.message),
            ErrorKind::Validation => RetrievalError::InvalidQuery(err.message),
            ErrorKind::Application => RetrievalError::Transport(err.message),
            ErrorKind::Internal => RetrievalError::Internal(err.message),
        }
    }
}

impl From<ErrorValue> for MutationError {
    fn from(err: ErrorValue) -> Self {
        match err.kind {
            ErrorKind::Validation => MutationError::Validation(err.message),
            ErrorKind::Transport => MutationError::Transport(err.message),
            ErrorKind::Application => MutationError::Application(err),
            ErrorKind::Internal => MutationError::Internal(err.message),
        }
    }
}

impl From<&RetrievalError> for ErrorValue {
    fn from(err: &RetrievalError) -> Self {
        match err {
            RetrievalError::NotFound => ErrorValue::application("entity not found"),
            RetrievalError::Transport(m) => ErrorValue::transport(m.clone()),
            RetrievalError::InvalidQuery(m) => ErrorValue::validation(m.clone()),
            RetrievalError::Internal(m) => ErrorValue::internal(m.clone()),
        }
    }
}
