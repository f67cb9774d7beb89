//! Wire types shared by the prism client core and its transports: entity
//! identifiers, subscribe/unsubscribe messages, field updates and text
//! deltas, operation contexts and error values, and canonical query keys.

pub mod id;
pub mod key;
pub mod message;
pub mod operation;
pub mod update;

pub use id::{EntityId, EntityName, FieldName};
pub use key::{deterministic_json, QueryKey};
pub use message::{ClientMessage, FieldSelection};
pub use operation::{ErrorKind, ErrorValue, FetchRequest, OperationId, OperationKind, Record};
pub use update::{DeltaOp, FieldUpdate, UpdateMessage};
