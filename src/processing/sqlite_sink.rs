// src/processing/sqlite_sink.rs

//! The indexed store, `<out>/speedhive.sqlite`.
//!
//! Rows are inserted one statement at a time inside transactions of at most
//! `batch_size` rows, so memory stays flat however large the export is.

use std::path::{Path, PathBuf};

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, params_from_iter};

use crate::error::{AppError, Result};
use crate::models::EntityType;
use crate::processing::RowSink;
use crate::processing::normalize::{Cell, NormalizedRow, columns};

pub const DATABASE_FILE: &str = "speedhive.sqlite";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS events (
    org_id INTEGER NOT NULL,
    event_id INTEGER,
    name TEXT,
    sport TEXT,
    start_date TEXT,
    location_name TEXT,
    country TEXT,
    extra TEXT
);
CREATE TABLE IF NOT EXISTS sessions (
    org_id INTEGER NOT NULL,
    event_id INTEGER,
    session_id INTEGER,
    name TEXT,
    session_type TEXT,
    group_name TEXT,
    start_time TEXT,
    status TEXT,
    extra TEXT
);
CREATE TABLE IF NOT EXISTS laps (
    org_id INTEGER NOT NULL,
    event_id INTEGER,
    session_id INTEGER,
    competitor_id TEXT,
    driver_name TEXT,
    position INTEGER,
    lap_number INTEGER,
    lap_time TEXT,
    lap_seconds REAL,
    extra TEXT
);
CREATE TABLE IF NOT EXISTS announcements (
    org_id INTEGER NOT NULL,
    event_id INTEGER,
    session_id INTEGER,
    timestamp TEXT,
    text TEXT,
    record_class TEXT,
    record_lap_time TEXT,
    record_lap_seconds REAL,
    record_driver TEXT,
    record_marque TEXT
);
CREATE INDEX IF NOT EXISTS idx_events_org ON events(org_id);
CREATE INDEX IF NOT EXISTS idx_sessions_org_event ON sessions(org_id, event_id);
CREATE INDEX IF NOT EXISTS idx_laps_driver ON laps(driver_name);
CREATE INDEX IF NOT EXISTS idx_laps_competitor ON laps(competitor_id);
CREATE INDEX IF NOT EXISTS idx_laps_session ON laps(session_id);
CREATE INDEX IF NOT EXISTS idx_announcements_session ON announcements(session_id);
CREATE INDEX IF NOT EXISTS idx_announcements_driver ON announcements(record_driver);
";

impl ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(SqlValue::Null),
            Cell::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Cell::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Cell::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
        })
    }
}

pub struct SqliteSink {
    path: PathBuf,
    conn: Connection,
    batch_size: usize,
    pending: usize,
}

impl SqliteSink {
    /// Create a fresh store in `dir`, replacing any store from an earlier run.
    pub fn create(dir: &Path, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(AppError::config("process.batch_size must be > 0"));
        }
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DATABASE_FILE);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            path,
            conn,
            batch_size,
            pending: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn commit(&mut self) -> Result<()> {
        if self.pending > 0 {
            self.conn.execute_batch("COMMIT")?;
            self.pending = 0;
        }
        Ok(())
    }
}

fn insert_sql(entity: EntityType) -> String {
    let cols = columns(entity);
    let placeholders = vec!["?"; cols.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        entity.as_str(),
        cols.join(", "),
        placeholders
    )
}

impl RowSink for SqliteSink {
    fn write(&mut self, row: &NormalizedRow) -> Result<()> {
        if self.pending == 0 {
            self.conn.execute_batch("BEGIN")?;
        }
        let mut stmt = self.conn.prepare_cached(&insert_sql(row.entity))?;
        stmt.execute(params_from_iter(row.cells.iter()))?;
        drop(stmt);

        self.pending += 1;
        if self.pending >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.commit()
    }
}
