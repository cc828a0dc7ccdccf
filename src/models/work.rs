// src/models/work.rs

//! Entity types, pagination cursors and work units.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// The four levels below an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Events,
    Sessions,
    Laps,
    Announcements,
}

impl EntityType {
    /// All entity types in traversal order.
    pub const ALL: [EntityType; 4] = [
        EntityType::Events,
        EntityType::Sessions,
        EntityType::Laps,
        EntityType::Announcements,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Events => "events",
            EntityType::Sessions => "sessions",
            EntityType::Laps => "laps",
            EntityType::Announcements => "announcements",
        }
    }

    /// Artifact file name, e.g. `laps.ndjson.gz`.
    pub fn file_name(&self, compress: bool) -> String {
        if compress {
            format!("{}.ndjson.gz", self.as_str())
        } else {
            format!("{}.ndjson", self.as_str())
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "events" => Ok(EntityType::Events),
            "sessions" => Ok(EntityType::Sessions),
            "laps" => Ok(EntityType::Laps),
            "announcements" => Ok(EntityType::Announcements),
            other => Err(AppError::validation(format!("unknown entity type '{other}'"))),
        }
    }
}

/// Pagination position: the offset of the next item to request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn offset(&self) -> u64 {
        self.0
    }

    /// Cursor after consuming `count` more items.
    pub fn advance(&self, count: usize) -> Cursor {
        Cursor(self.0 + count as u64)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Ancestor id chain of a work unit or record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lineage {
    pub org_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<u64>,
}

impl Lineage {
    pub fn org(org_id: u64) -> Self {
        Self {
            org_id,
            event_id: None,
            session_id: None,
        }
    }

    pub fn with_event(self, event_id: u64) -> Self {
        Self {
            event_id: Some(event_id),
            session_id: None,
            ..self
        }
    }

    pub fn with_session(self, session_id: u64) -> Self {
        Self {
            session_id: Some(session_id),
            ..self
        }
    }
}

/// One schedulable fetch: a page of `entity` children under `parent_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub entity: EntityType,
    pub parent_id: u64,
    pub cursor: Cursor,
    pub lineage: Lineage,
}

impl WorkUnit {
    /// Events of an organization.
    pub fn events(org_id: u64, cursor: Cursor) -> Self {
        Self {
            entity: EntityType::Events,
            parent_id: org_id,
            cursor,
            lineage: Lineage::org(org_id),
        }
    }

    /// Sessions of an event.
    pub fn sessions(lineage: Lineage, event_id: u64) -> Self {
        Self {
            entity: EntityType::Sessions,
            parent_id: event_id,
            cursor: Cursor::START,
            lineage: lineage.with_event(event_id),
        }
    }

    /// Laps or announcements of a session.
    pub fn session_child(entity: EntityType, lineage: Lineage, session_id: u64, cursor: Cursor) -> Self {
        Self {
            entity,
            parent_id: session_id,
            cursor,
            lineage: lineage.with_session(session_id),
        }
    }

    /// The same listing, one page further.
    pub fn next_page(&self, cursor: Cursor) -> Self {
        Self {
            cursor,
            ..self.clone()
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} {}", self.entity, self.parent_id, self.cursor)
    }
}
