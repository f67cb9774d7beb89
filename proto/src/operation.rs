use crate::id::{EntityId, EntityName, FieldName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;

/// A decoded entity record as returned by the transport.
pub type Record = BTreeMap<FieldName, serde_json::Value>;

/// Identifies one executed operation, for logging and plugin hooks.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(Ulid);

impl OperationId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self { Self(Ulid::new()) }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let id_str = self.0.to_string();
        write!(f, "O{}", &id_str[20..])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// Classifies an operation failure for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// Arguments failed the schema bound to the operation; no state mutated.
    Validation,
    /// The transport failed to deliver or hit a protocol-level failure.
    Transport,
    /// The remote handler returned a structured failure.
    Application,
    /// A bug in the core; logged with a stable identifier.
    Internal,
}

/// The error slot of an operation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind:?}: {message}")]
pub struct ErrorValue {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorValue {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self { Self { kind, message: message.into(), details: None } }

    pub fn validation(message: impl Into<String>) -> Self { Self::new(ErrorKind::Validation, message) }
    pub fn transport(message: impl Into<String>) -> Self { Self::new(ErrorKind::Transport, message) }
    pub fn application(message: impl Into<String>) -> Self { Self::new(ErrorKind::Application, message) }
    pub fn internal(message: impl Into<String>) -> Self { Self::new(ErrorKind::Internal, message) }
}

/// One item of a bulk fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub entity: EntityName,
    pub id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<FieldName>>,
}
