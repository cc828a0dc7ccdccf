// src/storage/checkpoint.rs

//! Durable traversal progress per organization.
//!
//! ```text
//! {output}/{org_id}/.checkpoint.json
//! ```
//!
//! Every mutation rewrites the whole file atomically (temp file, fsync,
//! rename, directory fsync), so a crash leaves either the old or the new
//! state on disk. Callers only mutate after the matching artifact lines are
//! flushed.
//!
//! Closing a session or an event drops the progress of everything beneath
//! it, so the file only grows with the work still in flight.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::{Cursor, EntityType};

pub const CHECKPOINT_FILE: &str = ".checkpoint.json";
pub const CHECKPOINT_VERSION: u32 = 1;

/// Progress of one entity type, keyed by parent id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityProgress {
    /// Next cursor to request per parent
    #[serde(default)]
    pub cursors: BTreeMap<u64, Cursor>,
    /// Parents whose children are fully enumerated
    #[serde(default)]
    pub completed: BTreeSet<u64>,
    /// Children already written whose own subtrees are unfinished
    #[serde(default)]
    pub open_children: BTreeMap<u64, BTreeSet<u64>>,
}

/// Checkpoint file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub version: u32,
    pub org_id: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress: BTreeMap<EntityType, EntityProgress>,
}

impl CheckpointState {
    pub fn new(org_id: u64) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            org_id,
            updated_at: Utc::now(),
            progress: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.progress.values().all(|p| {
            p.cursors.is_empty() && p.completed.is_empty() && p.open_children.is_empty()
        })
    }

    /// Where to resume the listing of `parent`'s children.
    pub fn cursor(&self, entity: EntityType, parent: u64) -> Cursor {
        self.progress
            .get(&entity)
            .and_then(|p| p.cursors.get(&parent).copied())
            .unwrap_or(Cursor::START)
    }

    pub fn is_complete(&self, entity: EntityType, parent: u64) -> bool {
        self.progress
            .get(&entity)
            .is_some_and(|p| p.completed.contains(&parent))
    }

    /// Written children of `parent` that still need their subtrees visited.
    pub fn open_children(&self, entity: EntityType, parent: u64) -> Vec<u64> {
        self.progress
            .get(&entity)
            .and_then(|p| p.open_children.get(&parent))
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    fn entry(&mut self, entity: EntityType) -> &mut EntityProgress {
        self.progress.entry(entity).or_default()
    }

    fn close(&mut self, entity: EntityType, parent: u64, child: u64) {
        let Some(progress) = self.progress.get_mut(&entity) else {
            return;
        };
        if let Some(open) = progress.open_children.get_mut(&parent) {
            open.remove(&child);
            if open.is_empty() {
                progress.open_children.remove(&parent);
            }
        }
        self.drop_empty(entity);
    }

    /// Drop every entry kept for `parent`'s children.
    fn forget(&mut self, entity: EntityType, parent: u64) {
        let Some(progress) = self.progress.get_mut(&entity) else {
            return;
        };
        progress.cursors.remove(&parent);
        progress.completed.remove(&parent);
        progress.open_children.remove(&parent);
        self.drop_empty(entity);
    }

    fn drop_empty(&mut self, entity: EntityType) {
        if self.progress.get(&entity).is_some_and(|p| *p == EntityProgress::default()) {
            self.progress.remove(&entity);
        }
    }

    fn validate(&self, org_id: u64) -> std::result::Result<(), String> {
        if self.version != CHECKPOINT_VERSION {
            return Err(format!(
                "unsupported version {} (expected {})",
                self.version, CHECKPOINT_VERSION
            ));
        }
        if self.org_id != org_id {
            return Err(format!(
                "belongs to organization {}, not {}",
                self.org_id, org_id
            ));
        }
        Ok(())
    }
}

/// Reads and atomically rewrites checkpoint files under an output root.
#[derive(Debug)]
pub struct CheckpointStore {
    root: PathBuf,
    cache: Mutex<HashMap<u64, CheckpointState>>,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Path of an organization's checkpoint file.
    pub fn path(&self, org_id: u64) -> PathBuf {
        self.root.join(org_id.to_string()).join(CHECKPOINT_FILE)
    }

    /// Current state; an absent file yields an empty state.
    pub fn load(&self, org_id: u64) -> Result<CheckpointState> {
        let mut cache = self.lock()?;
        Ok(self.cached(&mut cache, org_id)?.clone())
    }

    /// Advance the cursor of `parent`'s child listing.
    pub fn record_progress(
        &self,
        org_id: u64,
        entity: EntityType,
        parent: u64,
        cursor: Cursor,
    ) -> Result<()> {
        self.mutate(org_id, |state| {
            state.entry(entity).cursors.insert(parent, cursor);
        })
    }

    /// Advance the cursor and register the page's children as open, in one write.
    pub fn record_page(
        &self,
        org_id: u64,
        entity: EntityType,
        parent: u64,
        cursor: Cursor,
        children: &[u64],
    ) -> Result<()> {
        self.mutate(org_id, |state| {
            let progress = state.entry(entity);
            progress.cursors.insert(parent, cursor);
            if !children.is_empty() {
                progress
                    .open_children
                    .entry(parent)
                    .or_default()
                    .extend(children.iter().copied());
            }
        })
    }

    /// Record that every child of `parent` has been enumerated.
    pub fn mark_parent_complete(&self, org_id: u64, entity: EntityType, parent: u64) -> Result<()> {
        self.mutate(org_id, |state| {
            state.entry(entity).completed.insert(parent);
        })
    }

    /// Close a session whose laps and announcements are complete.
    ///
    /// Its laps and announcements progress is dropped in the same write.
    pub fn close_session(&self, org_id: u64, event_id: u64, session_id: u64) -> Result<()> {
        self.mutate(org_id, |state| {
            state.close(EntityType::Sessions, event_id, session_id);
            state.forget(EntityType::Laps, session_id);
            state.forget(EntityType::Announcements, session_id);
        })
    }

    /// Close an event whose sessions are all closed, dropping its sessions progress.
    pub fn close_event(&self, org_id: u64, event_id: u64) -> Result<()> {
        self.mutate(org_id, |state| {
            state.close(EntityType::Events, org_id, event_id);
            state.forget(EntityType::Sessions, event_id);
        })
    }

    /// Discard all progress and write a fresh, empty checkpoint.
    pub fn reset(&self, org_id: u64) -> Result<()> {
        let mut cache = self.lock()?;
        let state = CheckpointState::new(org_id);
        self.persist(&state)?;
        cache.insert(org_id, state);
        Ok(())
    }

    fn mutate(&self, org_id: u64, apply: impl FnOnce(&mut CheckpointState)) -> Result<()> {
        let mut cache = self.lock()?;
        let mut next = self.cached(&mut cache, org_id)?.clone();
        apply(&mut next);
        next.updated_at = Utc::now();
        self.persist(&next)?;
        cache.insert(org_id, next);
        Ok(())
    }

    fn cached<'a>(
        &self,
        cache: &'a mut HashMap<u64, CheckpointState>,
        org_id: u64,
    ) -> Result<&'a CheckpointState> {
        if !cache.contains_key(&org_id) {
            let state = self.read(org_id)?;
            cache.insert(org_id, state);
        }
        cache
            .get(&org_id)
            .ok_or_else(|| AppError::validation(format!("checkpoint for {org_id} not cached")))
    }

    fn read(&self, org_id: u64) -> Result<CheckpointState> {
        let path = self.path(org_id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CheckpointState::new(org_id));
            }
            Err(e) => return Err(AppError::checkpoint_corrupt(&path, e)),
        };

        let state: CheckpointState =
            serde_json::from_slice(&bytes).map_err(|e| AppError::checkpoint_corrupt(&path, e))?;
        state
            .validate(org_id)
            .map_err(|message| AppError::checkpoint_corrupt(&path, message))?;
        Ok(state)
    }

    fn persist(&self, state: &CheckpointState) -> Result<()> {
        let path = self.path(state.org_id);
        let dir = path
            .parent()
            .ok_or_else(|| AppError::config(format!("invalid checkpoint path {}", path.display())))?;
        fs::create_dir_all(dir)?;

        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &path)?;
        sync_dir(dir)?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<u64, CheckpointState>>> {
        self.cache
            .lock()
            .map_err(|_| AppError::validation("checkpoint store lock poisoned"))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_empty_state() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let state = store.load(30476).unwrap();
        assert!(state.is_empty());
        assert_eq!(state.cursor(EntityType::Events, 30476), Cursor::START);
        assert!(!store.path(30476).exists());
    }

    #[test]
    fn progress_survives_a_new_store() {
        let tmp = TempDir::new().unwrap();
        {
            let store = CheckpointStore::new(tmp.path());
            store
                .record_page(7, EntityType::Events, 7, Cursor(100), &[1, 2, 3])
                .unwrap();
            store.close_event(7, 2).unwrap();
            store
                .record_progress(7, EntityType::Laps, 55, Cursor(500))
                .unwrap();
            store.mark_parent_complete(7, EntityType::Sessions, 1).unwrap();
        }

        let store = CheckpointStore::new(tmp.path());
        let state = store.load(7).unwrap();
        assert_eq!(state.cursor(EntityType::Events, 7), Cursor(100));
        assert_eq!(state.open_children(EntityType::Events, 7), vec![1, 3]);
        assert_eq!(state.cursor(EntityType::Laps, 55), Cursor(500));
        assert!(state.is_complete(EntityType::Sessions, 1));
        assert!(!state.is_complete(EntityType::Sessions, 2));
    }

    #[test]
    fn closing_a_session_drops_its_progress() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store
            .record_page(1, EntityType::Sessions, 10, Cursor(2), &[100, 101])
            .unwrap();
        for session in [100, 101] {
            store.record_progress(1, EntityType::Laps, session, Cursor(7)).unwrap();
            store.mark_parent_complete(1, EntityType::Laps, session).unwrap();
        }
        store.mark_parent_complete(1, EntityType::Announcements, 100).unwrap();
        store.close_session(1, 10, 100).unwrap();

        let state = store.load(1).unwrap();
        assert_eq!(state.open_children(EntityType::Sessions, 10), vec![101]);
        assert_eq!(state.cursor(EntityType::Laps, 100), Cursor::START);
        assert!(!state.is_complete(EntityType::Laps, 100));
        assert!(state.is_complete(EntityType::Laps, 101));
        assert!(!state.progress.contains_key(&EntityType::Announcements));
    }

    #[test]
    fn closing_an_event_keeps_only_the_event_listing() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store.record_page(1, EntityType::Events, 1, Cursor(1), &[10]).unwrap();
        store.mark_parent_complete(1, EntityType::Events, 1).unwrap();
        store
            .record_page(1, EntityType::Sessions, 10, Cursor(1), &[100])
            .unwrap();
        store.mark_parent_complete(1, EntityType::Sessions, 10).unwrap();
        store.close_session(1, 10, 100).unwrap();
        store.close_event(1, 10).unwrap();

        let state = store.load(1).unwrap();
        assert_eq!(state.progress.keys().collect::<Vec<_>>(), vec![&EntityType::Events]);
        assert_eq!(state.cursor(EntityType::Events, 1), Cursor(1));
        assert!(state.is_complete(EntityType::Events, 1));
        assert!(state.open_children(EntityType::Events, 1).is_empty());
    }

    #[test]
    fn corrupt_file_is_reported_not_discarded() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let path = store.path(9);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();

        let err = store.load(9).unwrap_err();
        assert!(matches!(err, AppError::CheckpointCorrupt { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"{ not json");
    }

    #[test]
    fn checkpoint_of_another_org_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store.record_progress(1, EntityType::Events, 1, Cursor(5)).unwrap();

        let foreign = store.path(2);
        fs::create_dir_all(foreign.parent().unwrap()).unwrap();
        fs::copy(store.path(1), &foreign).unwrap();

        let err = CheckpointStore::new(tmp.path()).load(2).unwrap_err();
        assert!(err.to_string().contains("organization 1"));
    }

    #[test]
    fn reset_discards_progress() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store.record_progress(3, EntityType::Events, 3, Cursor(200)).unwrap();
        store.reset(3).unwrap();

        assert!(store.load(3).unwrap().is_empty());
        assert!(CheckpointStore::new(tmp.path()).load(3).unwrap().is_empty());
    }

    #[test]
    fn no_temp_file_left_behind() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::new(tmp.path());
        store.record_progress(4, EntityType::Events, 4, Cursor(1)).unwrap();
        let names: Vec<_> = fs::read_dir(tmp.path().join("4"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![CHECKPOINT_FILE.to_string()]);
    }
}
