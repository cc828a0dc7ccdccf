// src/pipeline/status.rs

//! Checkpoint progress of an organization, read without touching the network.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::EntityType;
use crate::services::has_artifacts;
use crate::storage::{CheckpointState, CheckpointStore};

#[derive(Debug, Clone, Serialize)]
pub struct OrgStatus {
    pub org_id: u64,
    pub has_checkpoint: bool,
    pub has_artifacts: bool,
    pub updated_at: Option<DateTime<Utc>>,
    /// Every event of the organization has been listed
    pub events_listed: bool,
    /// Next offset of the event listing
    pub events_cursor: u64,
    /// Events written whose sessions are not all done
    pub open_events: usize,
    /// Sessions written whose laps or announcements are not done
    pub open_sessions: usize,
}

impl OrgStatus {
    /// Nothing left to do on resume.
    pub fn is_finished(&self) -> bool {
        self.has_checkpoint && self.events_listed && self.open_events == 0
    }
}

/// Read the status of `org_id` under `output_dir`.
///
/// A corrupt checkpoint is reported as an error, like a resuming export would.
pub fn org_status(output_dir: &Path, org_id: u64) -> Result<OrgStatus> {
    let store = CheckpointStore::new(output_dir);
    let has_checkpoint = store.path(org_id).exists();
    let state = store.load(org_id)?;

    Ok(OrgStatus {
        org_id,
        has_checkpoint,
        has_artifacts: has_artifacts(&output_dir.join(org_id.to_string())),
        updated_at: has_checkpoint.then_some(state.updated_at),
        events_listed: state.is_complete(EntityType::Events, org_id),
        events_cursor: state.cursor(EntityType::Events, org_id).offset(),
        open_events: state.open_children(EntityType::Events, org_id).len(),
        open_sessions: open_sessions(&state),
    })
}

fn open_sessions(state: &CheckpointState) -> usize {
    state
        .progress
        .get(&EntityType::Sessions)
        .map_or(0, |p| p.open_children.values().map(|s| s.len()).sum())
}

/// Log a status report.
pub fn log_status(status: &OrgStatus) {
    if !status.has_checkpoint {
        log::info!(
            "Organization {}: no checkpoint{}",
            status.org_id,
            if status.has_artifacts {
                " (artifacts present)"
            } else {
                ""
            }
        );
        return;
    }

    log::info!(
        "Organization {}: {}",
        status.org_id,
        if status.is_finished() {
            "finished"
        } else {
            "in progress"
        }
    );
    if let Some(updated) = status.updated_at {
        log::info!("  Last checkpoint: {}", updated.to_rfc3339());
    }
    log::info!(
        "  Events listed: {} (next offset {})",
        if status.events_listed { "all" } else { "partially" },
        status.events_cursor
    );
    log::info!("  Unfinished events: {}", status.open_events);
    log::info!("  Unfinished sessions: {}", status.open_sessions);
}
