// src/models/mod.rs

//! Domain models for the exporter and the stream processors.

mod config;
mod payload;
mod record;
mod summary;
mod work;

pub use config::{
    ApiConfig, ApiPaths, Config, ExportConfig, LoggingConfig, PageSizes, ProcessConfig,
    RecordValidation, RetryConfig,
};
pub use payload::{
    ANNOUNCEMENT_ROW_KEYS, EVENT_ID_KEYS, EVENT_LIST_KEYS, LAP_ROW_KEYS, RowsPayload,
    SESSION_ID_KEYS, SessionsPayload, coerce_id, extract_id,
};
pub use record::ExportedRecord;
pub use summary::{EntityCounts, ExportSummary, FailedUnit, ProcessSummary, RunStatus};
pub use work::{Cursor, EntityType, Lineage, WorkUnit};
