// src/models/record.rs

//! The line format of an NDJSON artifact.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Cursor, EntityType, Lineage};

/// One exported line, tagged with its entity type and full ancestor chain.
///
/// Events and sessions hold one instance in `raw`. Laps and announcements
/// hold a whole fetched page exactly as the server returned it; the stream
/// processors interpret its shape later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedRecord {
    pub entity: EntityType,
    pub org_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Cursor>,
    pub raw: Value,
}

impl ExportedRecord {
    /// Record for a single entity instance.
    pub fn instance(entity: EntityType, lineage: Lineage, raw: Value) -> Self {
        Self {
            entity,
            org_id: lineage.org_id,
            event_id: lineage.event_id,
            session_id: lineage.session_id,
            cursor: None,
            raw,
        }
    }

    /// Record for a fetched page of rows.
    pub fn page(entity: EntityType, lineage: Lineage, cursor: Cursor, raw: Value) -> Self {
        Self {
            cursor: Some(cursor),
            ..Self::instance(entity, lineage, raw)
        }
    }

    pub fn lineage(&self) -> Lineage {
        Lineage {
            org_id: self.org_id,
            event_id: self.event_id,
            session_id: self.session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialized_line_carries_ancestors() {
        let lineage = Lineage::org(30476).with_event(1).with_session(2);
        let record = ExportedRecord::page(
            EntityType::Announcements,
            lineage,
            Cursor::START,
            json!({"rows": [{"text": "hello"}]}),
        );

        let line = serde_json::to_value(&record).unwrap();
        assert_eq!(line["entity"], "announcements");
        assert_eq!(line["org_id"], 30476);
        assert_eq!(line["event_id"], 1);
        assert_eq!(line["session_id"], 2);
        assert_eq!(line["cursor"], 0);
        assert_eq!(line["raw"]["rows"][0]["text"], "hello");
    }

    #[test]
    fn event_record_omits_missing_ancestors() {
        let record = ExportedRecord::instance(
            EntityType::Events,
            Lineage::org(9).with_event(3),
            json!({"id": 3}),
        );
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains("session_id"));
        assert!(!line.contains("cursor"));

        let back: ExportedRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.lineage(), Lineage::org(9).with_event(3));
    }
}
