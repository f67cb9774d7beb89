use crate::id::{EntityId, EntityName, FieldName};
use serde_json::Value;

/// Canonical, bytewise-comparable identifier for a single-entity or list
/// query. Used as a map key for deduplication and release; the field list a
/// key was built from is always carried alongside it, never re-parsed out of
/// the key (field names may contain the join character).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryKey(String);

impl QueryKey {
    /// `entity ":" id ":" (sorted fields, comma-joined | "*")`
    pub fn entity(entity: &EntityName, id: &EntityId, fields: Option<&[FieldName]>) -> Self {
        let fields = match fields {
            Some(fields) => {
                let mut sorted: Vec<&str> = fields.iter().map(|f| f.as_str()).collect();
                sorted.sort_unstable();
                sorted.join(",")
            }
            None => "*".to_owned(),
        };
        Self(format!("{entity}:{id}:{fields}"))
    }

    /// `"list:" entity ":" deterministic-json(options)`
    pub fn list(entity: &EntityName, options: &Value) -> Self { Self(format!("list:{entity}:{}", deterministic_json(options))) }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{}", self.0) }
}

/// Serialize a JSON value with object keys emitted in sorted order at every
/// depth, so equal values always produce equal strings.
pub fn deterministic_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_unstable();
                out.push('{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                    out.push(':');
                    write(&map[*key], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            leaf => out.push_str(&serde_json::to_string(leaf).expect("leaf serialization is infallible")),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}
