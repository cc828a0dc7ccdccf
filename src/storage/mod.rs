//! Durable storage for exports.
//!
//! - `CheckpointStore`: traversal progress, rewritten atomically
//! - `NdjsonWriter` / `ArtifactSet`: append-only NDJSON artifacts
//!
//! ## Directory Structure
//!
//! ```text
//! output/full_dump/
//! └── 30476/
//!     ├── .checkpoint.json
//!     ├── events.ndjson.gz
//!     ├── sessions.ndjson.gz
//!     ├── laps.ndjson.gz
//!     └── announcements.ndjson.gz
//! ```

pub mod checkpoint;
pub mod ndjson;

pub use checkpoint::{
    CHECKPOINT_FILE, CHECKPOINT_VERSION, CheckpointState, CheckpointStore, EntityProgress,
};
pub use ndjson::{ArtifactSet, FlushToken, NdjsonWriter};
