// src/models/summary.rs

//! Run summaries for export and processing.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{EntityType, WorkUnit};

/// How far an export run got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every reachable unit was attempted.
    Completed,
    /// `max_events` or `max_sessions_per_event` stopped the traversal early.
    Truncated,
    /// Cancelled; only fully flushed work is checkpointed.
    Interrupted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "completed",
            RunStatus::Truncated => "truncated",
            RunStatus::Interrupted => "interrupted",
        })
    }
}

/// Per-entity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    /// Lines appended to the artifact (or that would be, in a dry run)
    pub records: u64,
    /// Upstream items seen (events, sessions, lap rows, announcement rows)
    pub items: u64,
    /// Work units that completed
    pub units_succeeded: u64,
    /// Work units that failed terminally
    pub units_failed: u64,
}

/// A work unit that exhausted its retries or failed fatally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedUnit {
    pub unit: WorkUnit,
    pub reason: String,
    pub attempts: u32,
}

/// Result of `Exporter::run`.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSummary {
    pub org_id: u64,
    pub status: RunStatus,
    pub dry_run: bool,
    pub counts: BTreeMap<EntityType, EntityCounts>,
    pub failures: Vec<FailedUnit>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExportSummary {
    pub fn new(org_id: u64, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            org_id,
            status: RunStatus::Completed,
            dry_run,
            counts: EntityType::ALL
                .iter()
                .map(|e| (*e, EntityCounts::default()))
                .collect(),
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn counts(&self, entity: EntityType) -> EntityCounts {
        self.counts.get(&entity).copied().unwrap_or_default()
    }

    /// Count a completed unit.
    pub fn record_success(&mut self, entity: EntityType, records: u64, items: u64) {
        let counts = self.counts.entry(entity).or_default();
        counts.units_succeeded += 1;
        counts.records += records;
        counts.items += items;
    }

    /// Count a terminal failure.
    pub fn record_failure(&mut self, unit: WorkUnit, reason: impl Into<String>, attempts: u32) {
        self.counts.entry(unit.entity).or_default().units_failed += 1;
        self.failures.push(FailedUnit {
            unit,
            reason: reason.into(),
            attempts,
        });
    }

    /// Raise the status; `Interrupted` wins over `Truncated`.
    pub fn escalate(&mut self, status: RunStatus) {
        self.status = match (self.status, status) {
            (RunStatus::Interrupted, _) | (_, RunStatus::Interrupted) => RunStatus::Interrupted,
            (RunStatus::Truncated, _) | (_, RunStatus::Truncated) => RunStatus::Truncated,
            _ => RunStatus::Completed,
        };
    }

    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    pub fn total_failed(&self) -> u64 {
        self.counts.values().map(|c| c.units_failed).sum()
    }
}

/// Result of a processing run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessSummary {
    /// Artifact files read
    pub files: usize,
    /// Normalized rows written per entity
    pub rows: BTreeMap<EntityType, u64>,
    /// Records and row entries skipped because their shape was not recognized
    pub skipped: u64,
}

impl ProcessSummary {
    pub fn rows(&self, entity: EntityType) -> u64 {
        self.rows.get(&entity).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: ProcessSummary) {
        self.files += other.files;
        self.skipped += other.skipped;
        for (entity, count) in other.rows {
            *self.rows.entry(entity).or_insert(0) += count;
        }
    }
}
