use crate::id::{EntityId, EntityName, FieldName};
use serde::{Deserialize, Serialize};

/// One edit op of a text delta. `position` addresses the string as it stands
/// before this op (ops apply left-to-right); out-of-range positions clamp to
/// the string length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaOp {
    pub position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert: Option<String>,
    #[serde(default)]
    pub delete: usize,
}

/// A per-field update: replace the whole value, or splice a string field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum FieldUpdate {
    Value { data: serde_json::Value },
    Delta { data: Vec<DeltaOp> },
}

/// An incoming update pushed by the server for one subscribed field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpdateMessage {
    Update { entity: EntityName, id: EntityId, field: FieldName, update: FieldUpdate },
}

impl std::fmt::Display for UpdateMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateMessage::Update { entity, id, field, update } => {
                let strategy = match update {
                    FieldUpdate::Value { .. } => "value",
                    FieldUpdate::Delta { .. } => "delta",
                };
                write!(f, "Update {entity}/{id}.{field} ({strategy})")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_strategies_tag_correctly() {
        let value = FieldUpdate::Value { data: serde_json::json!("hello") };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["strategy"], "value");

        let delta = FieldUpdate::Delta { data: vec![DeltaOp { position: 5, insert: Some(" world".to_string()), delete: 0 }] };
        let json = serde_json::to_value(&delta).unwrap();
        assert_eq!(json["strategy"], "delta");
        assert_eq!(json["data"][0]["position"], 5);

        // delete defaults to 0 when absent on the wire
        let parsed: FieldUpdate =
            serde_json::from_value(serde_json::json!({"strategy": "delta", "data": [{"position": 0, "insert": "x"}]})).unwrap();
        match parsed {
            FieldUpdate::Delta { data } => assert_eq!(data[0].delete, 0),
            _ => panic!("expected delta"),
        }
    }
}
