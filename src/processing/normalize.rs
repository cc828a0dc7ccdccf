// src/processing/normalize.rs

//! Per-entity normalization of exported records into fixed-schema rows.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::models::{
    ANNOUNCEMENT_ROW_KEYS, EVENT_ID_KEYS, EntityType, ExportedRecord, LAP_ROW_KEYS,
    RecordValidation, RowsPayload, SESSION_ID_KEYS, coerce_id,
};
use crate::processing::track_records::TrackRecordParser;

pub const EVENT_COLUMNS: &[&str] = &[
    "org_id",
    "event_id",
    "name",
    "sport",
    "start_date",
    "location_name",
    "country",
    "extra",
];

pub const SESSION_COLUMNS: &[&str] = &[
    "org_id",
    "event_id",
    "session_id",
    "name",
    "session_type",
    "group_name",
    "start_time",
    "status",
    "extra",
];

pub const LAP_COLUMNS: &[&str] = &[
    "org_id",
    "event_id",
    "session_id",
    "competitor_id",
    "driver_name",
    "position",
    "lap_number",
    "lap_time",
    "lap_seconds",
    "extra",
];

pub const ANNOUNCEMENT_COLUMNS: &[&str] = &[
    "org_id",
    "event_id",
    "session_id",
    "timestamp",
    "text",
    "record_class",
    "record_lap_time",
    "record_lap_seconds",
    "record_driver",
    "record_marque",
];

/// Column order of an entity's table.
pub fn columns(entity: EntityType) -> &'static [&'static str] {
    match entity {
        EntityType::Events => EVENT_COLUMNS,
        EntityType::Sessions => SESSION_COLUMNS,
        EntityType::Laps => LAP_COLUMNS,
        EntityType::Announcements => ANNOUNCEMENT_COLUMNS,
    }
}

/// A typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bool(bool),
}

impl Cell {
    fn id(id: Option<u64>) -> Self {
        match id.and_then(|id| i64::try_from(id).ok()) {
            Some(id) => Cell::Int(id),
            None => Cell::Null,
        }
    }

    fn text(value: Option<String>) -> Self {
        value.map_or(Cell::Null, Cell::Text)
    }

    fn float(value: Option<f64>) -> Self {
        value.map_or(Cell::Null, Cell::Float)
    }
}

impl From<&Value> for Cell {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => Cell::Null,
            Value::Bool(b) => Cell::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Cell::Int(i),
                None => n.as_f64().map_or(Cell::Null, Cell::Float),
            },
            Value::String(s) => Cell::Text(s.clone()),
            other => Cell::Text(other.to_string()),
        }
    }
}

/// One row of an entity table, aligned with [`columns`].
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub entity: EntityType,
    pub cells: Vec<Cell>,
}

impl NormalizedRow {
    /// Cell by column name.
    pub fn get(&self, column: &str) -> Option<&Cell> {
        columns(self.entity)
            .iter()
            .position(|c| *c == column)
            .and_then(|i| self.cells.get(i))
    }
}

/// Rows of one exported record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Normalized {
    pub rows: Vec<NormalizedRow>,
    /// Row-page entries dropped because they are not objects
    pub skipped: u64,
}

impl Normalized {
    fn one(row: NormalizedRow) -> Self {
        Self {
            rows: vec![row],
            skipped: 0,
        }
    }
}

/// Turns exported records into rows.
pub struct Normalizer {
    records: TrackRecordParser,
}

impl Normalizer {
    pub fn new(policy: RecordValidation) -> Result<Self> {
        Ok(Self {
            records: TrackRecordParser::new(policy)?,
        })
    }

    /// Rows for one exported record.
    ///
    /// Fails with `MalformedPayload` when the raw payload has no recognized shape.
    pub fn normalize(&self, record: &ExportedRecord) -> Result<Normalized> {
        match record.entity {
            EntityType::Events => event_row(record).map(Normalized::one),
            EntityType::Sessions => session_row(record).map(Normalized::one),
            EntityType::Laps => lap_rows(record),
            EntityType::Announcements => self.announcement_rows(record),
        }
    }

    fn announcement_rows(&self, record: &ExportedRecord) -> Result<Normalized> {
        let payload = RowsPayload::classify(&record.raw, ANNOUNCEMENT_ROW_KEYS)
            .ok_or_else(|| malformed(record, "unrecognized announcements payload"))?;
        let (objects, skipped) = objects(payload.rows());

        let rows = objects
            .into_iter()
            .map(|row| {
                let fields = Fields::new(row);
                let session_id = fields
                    .id(&["sessionId", "session_id"])
                    .or(record.session_id);
                let event_id = fields.id(&["eventId", "event_id"]).or(record.event_id);
                let text = fields.text(&["text", "message"]);
                let parsed = text.as_deref().and_then(|t| self.records.parse(t));

                NormalizedRow {
                    entity: EntityType::Announcements,
                    cells: vec![
                        Cell::id(Some(record.org_id)),
                        Cell::id(event_id),
                        Cell::id(session_id),
                        fields.cell(&["timestamp", "time", "createdAt", "date"]),
                        Cell::text(text),
                        Cell::text(parsed.as_ref().and_then(|r| r.class.clone())),
                        Cell::text(parsed.as_ref().map(|r| r.lap_time.clone())),
                        Cell::float(parsed.as_ref().and_then(|r| r.lap_seconds)),
                        Cell::text(parsed.as_ref().map(|r| r.driver.clone())),
                        Cell::text(parsed.as_ref().and_then(|r| r.marque.clone())),
                    ],
                }
            })
            .collect();
        Ok(Normalized { rows, skipped })
    }
}

/// Object entries of a row page plus how many entries were not objects.
fn objects(rows: &[Value]) -> (Vec<&Map<String, Value>>, u64) {
    let objects: Vec<_> = rows.iter().filter_map(Value::as_object).collect();
    let skipped = (rows.len() - objects.len()) as u64;
    (objects, skipped)
}

fn event_row(record: &ExportedRecord) -> Result<NormalizedRow> {
    let raw = record
        .raw
        .as_object()
        .ok_or_else(|| malformed(record, "event is not an object"))?;
    let mut fields = Fields::new(raw);

    let event_id = record.event_id.or_else(|| fields.take_id(EVENT_ID_KEYS));
    fields.forget(EVENT_ID_KEYS);

    let cells = vec![
        Cell::id(Some(record.org_id)),
        Cell::id(event_id),
        fields.take(&["name", "eventName", "title"]),
        fields.take(&["sport", "sportType"]),
        fields.take(&["startDate", "start_date", "date", "eventDate", "startTime"]),
        fields.take(&["location_name", "venue_name", "location", "track_name", "venue"]),
        fields.take(&[
            "location_country",
            "country",
            "location_countryCode",
            "venue_country",
            "location_country_name",
        ]),
        fields.extra(),
    ];
    Ok(NormalizedRow {
        entity: EntityType::Events,
        cells,
    })
}

fn session_row(record: &ExportedRecord) -> Result<NormalizedRow> {
    let raw = record
        .raw
        .as_object()
        .ok_or_else(|| malformed(record, "session is not an object"))?;
    let mut fields = Fields::new(raw);

    let session_id = record.session_id.or_else(|| fields.take_id(SESSION_ID_KEYS));
    fields.forget(SESSION_ID_KEYS);
    let event_id = record.event_id.or_else(|| fields.take_id(&["eventId", "event_id"]));
    fields.forget(&["eventId", "event_id"]);

    let cells = vec![
        Cell::id(Some(record.org_id)),
        Cell::id(event_id),
        Cell::id(session_id),
        fields.take(&["name", "sessionName", "description"]),
        fields.take(&["type", "sessionType", "session_type"]),
        fields.take(&["groupName", "group_name", "group", "group_name_name"]),
        fields.take(&["startTime", "start_time", "start", "date", "scheduledAt"]),
        fields.take(&["status", "state"]),
        fields.extra(),
    ];
    Ok(NormalizedRow {
        entity: EntityType::Sessions,
        cells,
    })
}

fn lap_rows(record: &ExportedRecord) -> Result<Normalized> {
    let payload = RowsPayload::classify(&record.raw, LAP_ROW_KEYS)
        .ok_or_else(|| malformed(record, "unrecognized laps payload"))?;

    let (competitors, mut skipped) = objects(payload.rows());
    let mut rows = Vec::new();
    for row in competitors {
        match row.get("laps").and_then(Value::as_array) {
            // A competitor with its own laps: one row per lap, inheriting the competitor fields.
            Some(laps) => {
                let mut competitor = row.clone();
                competitor.remove("laps");
                let (laps, dropped) = objects(laps);
                skipped += dropped;
                for lap in laps {
                    let mut merged = competitor.clone();
                    merged.extend(lap.iter().map(|(k, v)| (k.clone(), v.clone())));
                    rows.push(lap_row(record, &merged));
                }
            }
            None => rows.push(lap_row(record, row)),
        }
    }
    Ok(Normalized { rows, skipped })
}

fn lap_row(record: &ExportedRecord, raw: &Map<String, Value>) -> NormalizedRow {
    let mut fields = Fields::new(raw);

    let session_id = fields
        .take_id(&["sessionId", "session_id"])
        .or(record.session_id);
    let competitor = fields.take(&[
        "competitorId",
        "competitor_id",
        "participantId",
        "resultId",
        "id",
    ]);
    let driver = fields.take(&[
        "name",
        "driverName",
        "driver_name",
        "driver",
        "competitorName",
        "participant_name",
    ]);
    let position = fields.take(&["position", "pos", "rank"]);
    let lap_number = fields.take(&["lapNumber", "lap_number", "lap", "lapNo"]);
    let lap_time = fields.take(&["lapTime", "lap_time", "time"]);
    let lap_seconds = match &lap_time {
        Cell::Text(s) => parse_seconds(s),
        Cell::Float(f) if f.is_finite() => Some(*f),
        Cell::Int(i) => Some(*i as f64),
        _ => None,
    };

    NormalizedRow {
        entity: EntityType::Laps,
        cells: vec![
            Cell::id(Some(record.org_id)),
            Cell::id(record.event_id),
            Cell::id(session_id),
            competitor,
            driver,
            position,
            lap_number,
            lap_time,
            Cell::float(lap_seconds),
            fields.extra(),
        ],
    }
}

/// Seconds from a lap time such as `66.1`, `1:06.111` or `1:02:03.5`.
pub fn parse_seconds(text: &str) -> Option<f64> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(seconds) = text.parse::<f64>() {
        return seconds.is_finite().then_some(seconds);
    }

    let parts: Vec<&str> = text.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    let (last, whole) = parts.split_last()?;
    let mut total = 0.0;
    for part in whole {
        total = total * 60.0 + part.trim().parse::<u32>().ok()? as f64;
    }
    let seconds = last.trim().parse::<f64>().ok().filter(|s| s.is_finite())?;
    Some(total * 60.0 + seconds)
}

fn malformed(record: &ExportedRecord, message: &str) -> AppError {
    let lineage = record.lineage();
    let context = format!(
        "{} record of org {} (event {:?}, session {:?}, cursor {:?})",
        record.entity, lineage.org_id, lineage.event_id, lineage.session_id, record.cursor
    );
    AppError::malformed(context, message)
}

/// Flattened fields of a raw object; columns take their values out, the rest becomes `extra`.
struct Fields {
    flat: BTreeMap<String, Value>,
}

impl Fields {
    fn new(raw: &Map<String, Value>) -> Self {
        let mut flat = BTreeMap::new();
        flatten_into(&mut flat, None, raw);
        Self { flat }
    }

    /// Remove and return the first non-null candidate.
    fn take(&mut self, candidates: &[&str]) -> Cell {
        for key in candidates {
            if let Some(value) = self.flat.remove(*key) {
                if !value.is_null() {
                    return Cell::from(&value);
                }
            }
        }
        Cell::Null
    }

    fn take_id(&mut self, candidates: &[&str]) -> Option<u64> {
        let id = self.id(candidates);
        self.forget(candidates);
        id
    }

    fn id(&self, candidates: &[&str]) -> Option<u64> {
        candidates
            .iter()
            .filter_map(|key| self.flat.get(*key))
            .find_map(coerce_id)
    }

    fn text(&self, candidates: &[&str]) -> Option<String> {
        candidates
            .iter()
            .filter_map(|key| self.flat.get(*key))
            .find_map(|v| v.as_str().map(str::to_string))
    }

    fn cell(&self, candidates: &[&str]) -> Cell {
        candidates
            .iter()
            .filter_map(|key| self.flat.get(*key))
            .find(|v| !v.is_null())
            .map_or(Cell::Null, Cell::from)
    }

    fn forget(&mut self, keys: &[&str]) {
        for key in keys {
            self.flat.remove(*key);
        }
    }

    /// Remaining fields as a JSON object, or null when nothing is left.
    fn extra(self) -> Cell {
        let rest: Map<String, Value> = self
            .flat
            .into_iter()
            .filter(|(_, v)| !v.is_null())
            .collect();
        if rest.is_empty() {
            Cell::Null
        } else {
            Cell::Text(Value::Object(rest).to_string())
        }
    }
}

/// Nested objects become `parent_child` keys; arrays stay as JSON values.
fn flatten_into(out: &mut BTreeMap<String, Value>, prefix: Option<&str>, map: &Map<String, Value>) {
    for (key, value) in map {
        let name = match prefix {
            Some(prefix) => format!("{prefix}_{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => flatten_into(out, Some(&name), inner),
            _ => {
                out.insert(name, value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cursor, Lineage};
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(RecordValidation::AllowMissingClass).unwrap()
    }

    fn announcements(raw: Value) -> ExportedRecord {
        ExportedRecord::page(
            EntityType::Announcements,
            Lineage::org(30476).with_event(1).with_session(2),
            Cursor::START,
            raw,
        )
    }

    #[test]
    fn wrapper_and_bare_announcements_yield_identical_rows() {
        let text = "New Track Record (1:06.111) for FA by Jane Doe in Van Diemen";
        let wrapped = normalizer()
            .normalize(&announcements(json!({"rows": [{"text": text}]})))
            .unwrap()
            .rows;
        let bare = normalizer()
            .normalize(&announcements(json!([{"text": text}])))
            .unwrap()
            .rows;

        assert_eq!(wrapped, bare);
        assert_eq!(wrapped.len(), 1);
        let row = &wrapped[0];
        assert_eq!(row.get("org_id"), Some(&Cell::Int(30476)));
        assert_eq!(row.get("session_id"), Some(&Cell::Int(2)));
        assert_eq!(row.get("record_class"), Some(&Cell::Text("FA".into())));
        assert_eq!(row.get("record_driver"), Some(&Cell::Text("Jane Doe".into())));
    }

    #[test]
    fn announcement_session_id_in_row_wins_over_lineage() {
        let rows = normalizer()
            .normalize(&announcements(json!([{"text": "hi", "sessionId": 99}])))
            .unwrap()
            .rows;
        assert_eq!(rows[0].get("session_id"), Some(&Cell::Int(99)));
        assert_eq!(rows[0].get("record_class"), Some(&Cell::Null));
    }

    #[test]
    fn unrecognized_announcement_payload_is_malformed() {
        let err = normalizer()
            .normalize(&announcements(json!({"unexpected": true})))
            .unwrap_err();
        assert!(matches!(err, AppError::MalformedPayload { .. }));
    }

    #[test]
    fn events_flatten_nested_objects_and_keep_extra() {
        let record = ExportedRecord::instance(
            EntityType::Events,
            Lineage::org(7).with_event(11),
            json!({
                "id": 11,
                "name": "Summer Cup",
                "sport": "Car",
                "startDate": "2024-06-01",
                "location": {"name": "Sandown", "country": "AU"},
                "organization": {"id": 7}
            }),
        );
        let rows = normalizer().normalize(&record).unwrap().rows;
        let row = &rows[0];
        assert_eq!(row.cells.len(), EVENT_COLUMNS.len());
        assert_eq!(row.get("event_id"), Some(&Cell::Int(11)));
        assert_eq!(row.get("location_name"), Some(&Cell::Text("Sandown".into())));
        assert_eq!(row.get("country"), Some(&Cell::Text("AU".into())));
        assert_eq!(
            row.get("extra"),
            Some(&Cell::Text(r#"{"organization_id":7}"#.into()))
        );
    }

    #[test]
    fn laps_explode_nested_competitor_laps() {
        let record = ExportedRecord::page(
            EntityType::Laps,
            Lineage::org(1).with_event(2).with_session(3),
            Cursor::START,
            json!({"rows": [
                {"competitorId": 5, "name": "Jane", "laps": [
                    {"lapNumber": 1, "lapTime": "1:06.111"},
                    {"lapNumber": 2, "lapTime": "1:05.900"}
                ]},
                {"competitorId": 6, "name": "Joe", "lapNumber": 1, "lapTime": "66.5"}
            ]}),
        );
        let rows = normalizer().normalize(&record).unwrap().rows;
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].get("driver_name"), Some(&Cell::Text("Jane".into())));
        assert_eq!(rows[1].get("lap_number"), Some(&Cell::Int(2)));
        match rows[0].get("lap_seconds") {
            Some(Cell::Float(s)) => assert!((s - 66.111).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(rows[2].get("lap_seconds"), Some(&Cell::Float(66.5)));
        assert_eq!(rows[2].get("session_id"), Some(&Cell::Int(3)));
    }

    #[test]
    fn empty_lap_page_has_no_rows() {
        let record = ExportedRecord::page(
            EntityType::Laps,
            Lineage::org(1).with_event(2).with_session(3),
            Cursor(500),
            Value::Null,
        );
        assert_eq!(normalizer().normalize(&record).unwrap(), Normalized::default());
    }

    #[test]
    fn non_object_entries_are_counted_as_skipped() {
        let normalized = normalizer()
            .normalize(&announcements(json!([{"text": "Green flag"}, "stray", 42, null])))
            .unwrap();
        assert_eq!(normalized.rows.len(), 1);
        assert_eq!(normalized.skipped, 3);

        let record = ExportedRecord::page(
            EntityType::Laps,
            Lineage::org(1).with_event(2).with_session(3),
            Cursor::START,
            json!({"rows": [
                {"competitorId": 5, "laps": [{"lapNumber": 1}, "junk"]},
                [1, 2]
            ]}),
        );
        let normalized = normalizer().normalize(&record).unwrap();
        assert_eq!(normalized.rows.len(), 1);
        assert_eq!(normalized.skipped, 2);
    }

    #[test]
    fn lap_time_parsing() {
        assert_eq!(parse_seconds("66.1"), Some(66.1));
        assert_eq!(parse_seconds("1:02:03.5"), Some(3723.5));
        assert!((parse_seconds(" 1:06.111 ").unwrap() - 66.111).abs() < 1e-9);
        assert_eq!(parse_seconds(""), None);
        assert_eq!(parse_seconds("DNF"), None);
        assert_eq!(parse_seconds("NaN"), None);
        assert_eq!(parse_seconds("inf"), None);
        assert_eq!(parse_seconds("1:-infinity"), None);
    }
}
