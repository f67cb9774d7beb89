use serde::{Deserialize, Serialize};

/// Name of an entity type, e.g. `"User"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityName(String);

/// Identifier of one entity instance within its type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

/// Field names are plain strings; they are map keys everywhere.
pub type FieldName = String;

impl EntityName {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl EntityId {
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

impl From<&str> for EntityName {
    fn from(s: &str) -> Self { Self(s.to_owned()) }
}
impl From<String> for EntityName {
    fn from(s: String) -> Self { Self(s) }
}
impl From<&str> for EntityId {
    fn from(s: &str) -> Self { Self(s.to_owned()) }
}
impl From<String> for EntityId {
    fn from(s: String) -> Self { Self(s) }
}
