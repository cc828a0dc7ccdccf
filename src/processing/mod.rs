//! Stream processors: exported NDJSON in, CSV tables and an SQLite store out.
//!
//! Nothing here touches the network. Artifacts are read lazily line by line,
//! normalized per entity type, and handed to one or more [`RowSink`]s.

pub mod csv_sink;
pub mod driver;
pub mod normalize;
pub mod reader;
pub mod sqlite_sink;
pub mod track_records;

use crate::error::Result;

pub use csv_sink::CsvSink;
pub use driver::{OutputFormat, discover_org_dirs, run_process};
pub use normalize::{Cell, Normalized, NormalizedRow, Normalizer, columns, parse_seconds};
pub use reader::NdjsonReader;
pub use sqlite_sink::SqliteSink;
pub use track_records::{TrackRecord, TrackRecordParser};

/// Destination for normalized rows.
pub trait RowSink: Send {
    fn write(&mut self, row: &NormalizedRow) -> Result<()>;

    /// Flush or commit whatever is still buffered.
    fn finish(&mut self) -> Result<()>;
}
