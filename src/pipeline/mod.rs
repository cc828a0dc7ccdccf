//! Pipeline entry points.
//!
//! - `run_export`: export organizations to NDJSON artifacts
//! - `run_processing`: turn artifacts into CSV tables and the SQLite store
//! - `org_status`: checkpoint progress of an organization

pub mod export;
pub mod process;
pub mod status;

pub use export::{collect_org_ids, export_orgs, log_summary, parse_org_ids, run_export};
pub use process::run_processing;
pub use status::{OrgStatus, log_status, org_status};
