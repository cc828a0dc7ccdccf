//! Service layer for the exporter.
//!
//! - Single-attempt HTTP fetching (`Fetcher`, `HttpFetcher`)
//! - Bounded retrying execution (`Scheduler`)
//! - The org → events → sessions → {laps, announcements} traversal (`Exporter`)

pub mod exporter;
pub mod fetcher;
pub mod scheduler;

pub use exporter::{ExportOptions, Exporter, has_artifacts};
pub use fetcher::{ApiRequest, Endpoints, FetchError, Fetcher, HttpFetcher, IsRetryable};
pub use scheduler::{Outcome, Scheduler, SchedulerConfig, TerminalFailure};
