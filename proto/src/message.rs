use crate::id::{EntityId, EntityName, FieldName};
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// Which fields a subscribe or unsubscribe intent covers: an explicit list, or
/// the whole entity. Serializes as an array of names or the string `"*"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    Fields(Vec<FieldName>),
    All,
}

impl FieldSelection {
    pub fn is_all(&self) -> bool { matches!(self, FieldSelection::All) }
}

impl Serialize for FieldSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldSelection::Fields(fields) => fields.serialize(serializer),
            FieldSelection::All => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for FieldSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct SelectionVisitor;

        impl<'de> Visitor<'de> for SelectionVisitor {
            type Value = FieldSelection;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result { f.write_str("an array of field names or \"*\"") }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                if v == "*" {
                    Ok(FieldSelection::All)
                } else {
                    Err(E::custom(format!("unexpected field selection string: {v:?}")))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut fields = Vec::new();
                while let Some(field) = seq.next_element::<FieldName>()? {
                    fields.push(field);
                }
                Ok(FieldSelection::Fields(fields))
            }
        }

        deserializer.deserialize_any(SelectionVisitor)
    }
}

/// Outgoing message on the subscription channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe { entity: EntityName, id: EntityId, fields: FieldSelection },
    Unsubscribe { entity: EntityName, id: EntityId, fields: FieldSelection },
}

impl std::fmt::Display for FieldSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldSelection::Fields(fields) => write!(f, "[{}]", fields.join(", ")),
            FieldSelection::All => write!(f, "*"),
        }
    }
}

impl std::fmt::Display for ClientMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientMessage::Subscribe { entity, id, fields } => write!(f, "Subscribe {entity}/{id} {fields}"),
            ClientMessage::Unsubscribe { entity, id, fields } => write!(f, "Unsubscribe {entity}/{id} {fields}"),
        }
    }
}
