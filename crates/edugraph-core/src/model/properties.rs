//! Property maps and the system-managed keys that live beside them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Ordered property map of a node or relationship.
pub type Properties = BTreeMap<String, Value>;

pub const ID: &str = "id";
pub const CREATED_AT: &str = "createdAt";
pub const UPDATED_AT: &str = "updatedAt";
pub const WEIGHT: &str = "weight";

/// System fields lifted out of an incoming or stored property map.
///
/// `weight` is only ever set by [`split_edge_keys`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SystemFields {
    pub id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub weight: Option<f64>,
}

/// Remove the system-managed node keys from `props`, returning whatever
/// could be parsed out of them. Unparseable timestamps are dropped. A node's
/// `weight` is ordinary data and stays in the map.
pub fn split_system_keys(props: &mut Properties) -> SystemFields {
    let id = match props.remove(ID) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    };
    let created_at = props.remove(CREATED_AT).as_ref().and_then(parse_timestamp);
    let updated_at = props.remove(UPDATED_AT).as_ref().and_then(parse_timestamp);

    SystemFields {
        id,
        created_at,
        updated_at,
        weight: None,
    }
}

/// Like [`split_system_keys`], also lifting out the relationship `weight`.
pub fn split_edge_keys(props: &mut Properties) -> SystemFields {
    let mut system = split_system_keys(props);
    system.weight = props.remove(WEIGHT).and_then(|v| v.as_f64());
    system
}

/// Parse an RFC 3339 timestamp stored as a JSON string.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Apply a partial update: keys in `patch` overwrite, `null` removes a key,
/// everything else in `base` is kept.
pub fn apply_patch(base: &mut Properties, patch: &Properties) {
    for (key, value) in patch {
        if value.is_null() {
            base.remove(key);
        } else {
            base.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_split_system_keys() {
        let mut p = props(json!({
            "id": "abc",
            "name": "Alice",
            "updatedAt": "2024-03-01T10:00:00Z",
            "createdAt": "not a timestamp",
            "weight": 3,
        }));

        let sys = split_edge_keys(&mut p);

        assert_eq!(sys.id.as_deref(), Some("abc"));
        assert_eq!(sys.updated_at.unwrap().to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(sys.created_at.is_none());
        assert_eq!(sys.weight, Some(3.0));
        assert_eq!(p.len(), 1);
        assert_eq!(p["name"], "Alice");
    }

    #[test]
    fn test_node_split_keeps_weight() {
        let mut p = props(json!({"id": "kp", "name": "Fractions", "weight": 0.5}));

        let sys = split_system_keys(&mut p);

        assert_eq!(sys.id.as_deref(), Some("kp"));
        assert!(sys.weight.is_none());
        assert_eq!(p, props(json!({"name": "Fractions", "weight": 0.5})));
    }

    #[test]
    fn test_apply_patch() {
        let mut base = props(json!({"name": "Bob", "grade": "2", "school": "North"}));
        apply_patch(&mut base, &props(json!({"grade": "3", "school": null, "club": "chess"})));

        assert_eq!(base, props(json!({"name": "Bob", "grade": "3", "club": "chess"})));
    }
}
