// src/models/payload.rs

//! Upstream payload shapes.
//!
//! The API is inconsistent about how it wraps lists: some endpoints return a
//! bare array, others an object holding a named array, and event details nest
//! sessions under arbitrarily deep groups. Every call site resolves shapes
//! through the unions below instead of probing JSON ad hoc.

use serde_json::{Map, Value};

/// Keys that wrap an events listing.
pub const EVENT_LIST_KEYS: &[&str] = &["events", "items", "data"];
/// Keys that wrap lap rows.
pub const LAP_ROW_KEYS: &[&str] = &["rows", "laps", "lapRows"];
/// Keys that wrap announcement rows.
pub const ANNOUNCEMENT_ROW_KEYS: &[&str] = &["rows", "announcements"];

pub const EVENT_ID_KEYS: &[&str] = &["id", "eventId", "event_id"];
pub const SESSION_ID_KEYS: &[&str] = &["id", "sessionId", "session_id"];

/// A list of rows, however the server chose to wrap it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RowsPayload<'a> {
    /// `{"rows": [...]}` (or another recognized key).
    Wrapper { key: &'a str, rows: &'a [Value] },
    /// `[...]`
    Bare(&'a [Value]),
    /// `null`, or a wrapper whose array is null.
    Empty,
}

impl<'a> RowsPayload<'a> {
    /// Resolve `value` against the recognized wrapper `keys`.
    ///
    /// Returns `None` when the payload matches no known shape.
    pub fn classify(value: &'a Value, keys: &'a [&'a str]) -> Option<Self> {
        match value {
            Value::Null => Some(RowsPayload::Empty),
            Value::Array(rows) => Some(RowsPayload::Bare(rows)),
            Value::Object(map) => {
                for key in keys {
                    match map.get(*key) {
                        Some(Value::Array(rows)) => {
                            return Some(RowsPayload::Wrapper { key: *key, rows });
                        }
                        Some(Value::Null) => return Some(RowsPayload::Empty),
                        _ => {}
                    }
                }
                None
            }
            _ => None,
        }
    }

    pub fn rows(&self) -> &'a [Value] {
        match *self {
            RowsPayload::Wrapper { rows, .. } => rows,
            RowsPayload::Bare(rows) => rows,
            RowsPayload::Empty => &[],
        }
    }

    pub fn len(&self) -> usize {
        self.rows().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }
}

/// Sessions as found in an event detail payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionsPayload<'a> {
    /// A plain list of sessions.
    Flat(&'a [Value]),
    /// `sessions: null` or no sessions field at all.
    Missing,
    /// A grouping object with `sessions` and nested `groups`/`subGroups`.
    Grouped(&'a Map<String, Value>),
}

impl<'a> SessionsPayload<'a> {
    /// Resolve the sessions shape of an event detail payload.
    pub fn from_event(value: &'a Value) -> Result<Self, String> {
        match value {
            Value::Null => Ok(SessionsPayload::Missing),
            Value::Array(items) => Ok(SessionsPayload::Flat(items)),
            Value::Object(map) => match map.get("sessions") {
                None if map.contains_key("groups") => Ok(SessionsPayload::Grouped(map)),
                None | Some(Value::Null) => Ok(SessionsPayload::Missing),
                Some(Value::Array(items)) if !map.contains_key("groups") => {
                    Ok(SessionsPayload::Flat(items))
                }
                Some(Value::Array(_)) => Ok(SessionsPayload::Grouped(map)),
                Some(Value::Object(grouping)) => Ok(SessionsPayload::Grouped(grouping)),
                Some(other) => Err(format!("unexpected sessions field: {}", type_name(other))),
            },
            other => Err(format!("unexpected event payload: {}", type_name(other))),
        }
    }

    /// All sessions, groups flattened depth-first in document order.
    pub fn flatten(&self) -> Vec<&'a Value> {
        match *self {
            SessionsPayload::Missing => Vec::new(),
            SessionsPayload::Flat(items) => items.iter().collect(),
            SessionsPayload::Grouped(root) => {
                let mut sessions = Vec::new();
                let mut stack: Vec<&'a Map<String, Value>> = vec![root];

                while let Some(group) = stack.pop() {
                    if let Some(Value::Array(items)) = group.get("sessions") {
                        sessions.extend(items.iter());
                    }
                    let children = ["groups", "subGroups"]
                        .iter()
                        .filter_map(|key| group.get(*key).and_then(Value::as_array))
                        .flatten()
                        .filter_map(Value::as_object)
                        .collect::<Vec<_>>();
                    // Reversed so the first child group is processed next.
                    stack.extend(children.into_iter().rev());
                }

                sessions
            }
        }
    }
}

/// Read a positive integer id from the first matching key.
///
/// Accepts JSON numbers and numeric strings.
pub fn extract_id(value: &Value, keys: &[&str]) -> Option<u64> {
    let map = value.as_object()?;
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find_map(coerce_id)
}

/// Coerce a scalar to a positive integer id.
pub fn coerce_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f > 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .filter(|id| *id > 0)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rows_wrapper_and_bare_yield_same_rows() {
        let wrapped = json!({"rows": [{"text": "a"}, {"text": "b"}]});
        let bare = json!([{"text": "a"}, {"text": "b"}]);

        let w = RowsPayload::classify(&wrapped, ANNOUNCEMENT_ROW_KEYS).unwrap();
        let b = RowsPayload::classify(&bare, ANNOUNCEMENT_ROW_KEYS).unwrap();

        assert!(matches!(w, RowsPayload::Wrapper { key: "rows", .. }));
        assert!(matches!(b, RowsPayload::Bare(_)));
        assert_eq!(w.rows(), b.rows());
    }

    #[test]
    fn rows_null_and_null_wrapper_are_empty() {
        let null = Value::Null;
        let wrapped_null = json!({"rows": null});
        assert_eq!(RowsPayload::classify(&null, LAP_ROW_KEYS), Some(RowsPayload::Empty));
        assert_eq!(
            RowsPayload::classify(&wrapped_null, LAP_ROW_KEYS),
            Some(RowsPayload::Empty)
        );
    }

    #[test]
    fn rows_unknown_shape_is_rejected() {
        assert!(RowsPayload::classify(&json!({"foo": []}), LAP_ROW_KEYS).is_none());
        assert!(RowsPayload::classify(&json!("text"), LAP_ROW_KEYS).is_none());
    }

    #[test]
    fn sessions_flat_list() {
        let event = json!({"id": 1, "sessions": [{"id": 10}, {"id": 11}]});
        let payload = SessionsPayload::from_event(&event).unwrap();
        assert!(matches!(payload, SessionsPayload::Flat(_)));
        assert_eq!(payload.flatten().len(), 2);
    }

    #[test]
    fn sessions_null_is_empty() {
        let event = json!({"id": 1, "sessions": null});
        let payload = SessionsPayload::from_event(&event).unwrap();
        assert_eq!(payload, SessionsPayload::Missing);
        assert!(payload.flatten().is_empty());
    }

    #[test]
    fn sessions_nested_groups_are_flattened_in_order() {
        let event = json!({
            "id": 1,
            "sessions": {
                "sessions": [{"id": 1}],
                "groups": [
                    {
                        "name": "Saturday",
                        "sessions": [{"id": 2}],
                        "subGroups": [
                            {"sessions": [{"id": 3}], "subGroups": [{"sessions": [{"id": 4}]}]}
                        ]
                    },
                    {"name": "Sunday", "sessions": [{"id": 5}]}
                ]
            }
        });

        let payload = SessionsPayload::from_event(&event).unwrap();
        let ids: Vec<u64> = payload
            .flatten()
            .into_iter()
            .filter_map(|s| extract_id(s, SESSION_ID_KEYS))
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn sessions_groups_at_event_root() {
        let event = json!({"groups": [{"sessions": [{"id": 7}]}]});
        let payload = SessionsPayload::from_event(&event).unwrap();
        assert_eq!(payload.flatten().len(), 1);
    }

    #[test]
    fn sessions_rejects_scalar_field() {
        assert!(SessionsPayload::from_event(&json!({"sessions": 3})).is_err());
    }

    #[test]
    fn ids_accept_numbers_and_strings() {
        assert_eq!(extract_id(&json!({"id": 42}), EVENT_ID_KEYS), Some(42));
        assert_eq!(extract_id(&json!({"eventId": "43"}), EVENT_ID_KEYS), Some(43));
        assert_eq!(extract_id(&json!({"id": 44.0}), EVENT_ID_KEYS), Some(44));
        assert_eq!(extract_id(&json!({"id": null, "eventId": 45}), EVENT_ID_KEYS), Some(45));
        assert_eq!(extract_id(&json!({"id": 0}), EVENT_ID_KEYS), None);
        assert_eq!(extract_id(&json!({"id": "abc"}), EVENT_ID_KEYS), None);
    }
}
