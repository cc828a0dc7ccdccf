// src/services/exporter.rs

//! Export orchestrator.
//!
//! Walks org → events → sessions → {laps, announcements}, writes every
//! fetched payload to the organization's artifacts and advances the
//! checkpoint only after the matching lines are flushed.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{
    ANNOUNCEMENT_ROW_KEYS, Config, Cursor, EVENT_ID_KEYS, EVENT_LIST_KEYS, EntityType,
    ExportSummary, ExportedRecord, LAP_ROW_KEYS, Lineage, PageSizes, RetryConfig, RowsPayload,
    RunStatus, SESSION_ID_KEYS, SessionsPayload, WorkUnit, extract_id,
};
use crate::services::fetcher::{ApiRequest, Endpoints, Fetcher, HttpFetcher};
use crate::services::scheduler::{Outcome, Scheduler, SchedulerConfig};
use crate::storage::{ArtifactSet, CheckpointState, CheckpointStore};

/// Upper bound on pages requested for one parent's listing in a single run.
pub const MAX_PAGES_PER_PARENT: usize = 10_000;

/// Per-run export settings.
#[derive(Debug, Clone)]
pub struct ExportOptions {
    /// Root directory; artifacts go to `<output_dir>/<org_id>/`
    pub output_dir: PathBuf,
    pub max_concurrent: usize,
    pub page_size: PageSizes,
    /// Limit on newly enumerated events
    pub max_events: Option<usize>,
    pub max_sessions_per_event: Option<usize>,
    /// Traverse without writing artifacts or checkpoints
    pub dry_run: bool,
    /// Continue from the checkpoint instead of starting over
    pub resume: bool,
    pub compress: bool,
}

impl ExportOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            output_dir: config.export.output_dir.clone(),
            max_concurrent: config.export.max_concurrent,
            page_size: config.export.page_size,
            max_events: None,
            max_sessions_per_event: None,
            dry_run: false,
            resume: true,
            compress: config.export.compress,
        }
    }

    pub fn org_dir(&self, org_id: u64) -> PathBuf {
        self.output_dir.join(org_id.to_string())
    }

    /// Reject options that cannot produce a valid run.
    pub fn validate(&self, org_id: u64) -> Result<()> {
        if org_id == 0 {
            return Err(AppError::config("organization id must be a positive integer"));
        }
        if self.max_concurrent == 0 {
            return Err(AppError::config("max_concurrent must be at least 1"));
        }
        if self.page_size.events == 0 || self.page_size.laps == 0 {
            return Err(AppError::config("page sizes must be at least 1"));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(AppError::config("output directory is empty"));
        }
        Ok(())
    }
}

/// Drives the export of one organization at a time.
pub struct Exporter {
    fetcher: Arc<dyn Fetcher>,
    endpoints: Endpoints,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl Exporter {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        endpoints: Endpoints,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            endpoints,
            retry,
            cancel,
        }
    }

    /// Exporter talking HTTP to the configured API.
    pub fn from_config(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let fetcher = HttpFetcher::new(&config.api)?;
        Ok(Self::new(
            Arc::new(fetcher),
            Endpoints::from_config(&config.api),
            config.retry.clone(),
            cancel,
        ))
    }

    /// Export one organization.
    ///
    /// Per-unit failures are collected in the summary; only configuration
    /// problems, a corrupt checkpoint, storage errors and a failed event
    /// listing end the run with an error.
    pub async fn run(&self, org_id: u64, options: &ExportOptions) -> Result<ExportSummary> {
        options.validate(org_id)?;

        let org_dir = options.org_dir(org_id);
        if !options.dry_run {
            fs::create_dir_all(&org_dir).map_err(|e| {
                AppError::config(format!(
                    "cannot create output directory {}: {}",
                    org_dir.display(),
                    e
                ))
            })?;
        }

        let store = CheckpointStore::new(&options.output_dir);
        let resume = if options.resume {
            store.load(org_id)?
        } else {
            CheckpointState::new(org_id)
        };

        let persist = if options.dry_run {
            None
        } else {
            if !options.resume {
                store.reset(org_id)?;
            }
            Some(Persist {
                artifacts: ArtifactSet::open(&org_dir, options.compress, options.resume)?,
                store,
            })
        };

        log::info!(
            "Exporting organization {} to {} ({}{})",
            org_id,
            org_dir.display(),
            if options.resume && !resume.is_empty() {
                "resuming"
            } else {
                "fresh"
            },
            if options.dry_run { ", dry run" } else { "" }
        );

        let abort = self.cancel.child_token();
        let run = OrgRun {
            org_id,
            options,
            endpoints: &self.endpoints,
            scheduler: Scheduler::new(
                Arc::clone(&self.fetcher),
                SchedulerConfig::new(options.max_concurrent, &self.retry),
                abort.clone(),
            ),
            resume,
            persist,
            summary: Mutex::new(ExportSummary::new(org_id, options.dry_run)),
            events_taken: AtomicUsize::new(0),
            event_pages: Mutex::new(EventPages::default()),
            fatal: Mutex::new(None),
            abort,
        };

        run.traverse().await?;

        let mut summary = run.into_summary();
        if self.cancel.is_cancelled() {
            summary.escalate(RunStatus::Interrupted);
        }
        summary.finish();
        Ok(summary)
    }
}

/// Artifacts plus checkpoint; absent in a dry run.
struct Persist {
    artifacts: ArtifactSet,
    store: CheckpointStore,
}

/// Children found under a parent that still need visiting.
struct Listing {
    ids: Vec<u64>,
    /// Every child of the parent has been written
    complete: bool,
}

/// Event listing pages fetched so far in this run.
#[derive(Default)]
struct EventPages {
    fetched: usize,
    last: Option<Value>,
}

/// State of one organization's export.
struct OrgRun<'a> {
    org_id: u64,
    options: &'a ExportOptions,
    endpoints: &'a Endpoints,
    scheduler: Scheduler,
    /// Checkpoint as it was when the run started
    resume: CheckpointState,
    persist: Option<Persist>,
    summary: Mutex<ExportSummary>,
    events_taken: AtomicUsize,
    event_pages: Mutex<EventPages>,
    fatal: Mutex<Option<AppError>>,
    abort: CancellationToken,
}

impl OrgRun<'_> {
    async fn traverse(&self) -> Result<()> {
        let width = self.options.max_concurrent.max(1);
        let org_id = self.org_id;

        let pending = self.resume.open_children(EntityType::Events, org_id);
        if !pending.is_empty() {
            log::info!("Resuming {} unfinished events of {}", pending.len(), org_id);
        }

        let start = if self.resume.is_complete(EntityType::Events, org_id) {
            None
        } else {
            Some(self.resume.cursor(EntityType::Events, org_id))
        };

        let listed = stream::unfold(start, move |cursor| async move {
            let cursor = cursor?;
            let (ids, next) = self.event_page(cursor).await;
            Some((stream::iter(ids), next))
        })
        .flatten();

        let mut subtrees = std::pin::pin!(
            stream::iter(pending)
                .chain(listed)
                .map(|event_id| self.event_subtree(event_id))
                .buffer_unordered(width)
        );

        while let Some(result) = subtrees.next().await {
            if let Err(error) = result {
                self.abort_with(error);
            }
        }

        match lock(&self.fatal).take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn into_summary(self) -> ExportSummary {
        self.summary
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch one page of events, write it and return the event ids to descend into.
    async fn event_page(&self, cursor: Cursor) -> (Vec<u64>, Option<Cursor>) {
        let org_id = self.org_id;
        let page_size = self.options.page_size.events;
        let taken_before = self.events_taken.load(Ordering::SeqCst);

        if let Some(max) = self.options.max_events {
            if taken_before >= max {
                self.escalate(RunStatus::Truncated);
                return (Vec::new(), None);
            }
        }

        let unit = WorkUnit::events(org_id, cursor);
        let request = self.endpoints.events(org_id, cursor, page_size);
        let value = match self.scheduler.submit(&unit, &request).await {
            Outcome::Success(value) => value,
            Outcome::Failed(failure) => {
                log::error!(
                    "{} failed after {} attempts: {}",
                    unit,
                    failure.attempts,
                    failure.error
                );
                self.record_failure(unit.clone(), failure.error.to_string(), failure.attempts);
                self.fail_after_drain(AppError::fetch(unit.to_string(), failure.error));
                return (Vec::new(), None);
            }
            Outcome::Cancelled => return (Vec::new(), None),
        };

        if let Some(reason) = self.stalled_event_listing(&value) {
            log::warn!("{}: {}; treating the event listing as finished", unit, reason);
            if let Err(error) = self.checkpoint(|store, org| {
                store.mark_parent_complete(org, EntityType::Events, org)
            }) {
                self.abort_with(error);
            }
            return (Vec::new(), None);
        }

        let Some(payload) = RowsPayload::classify(&value, EVENT_LIST_KEYS) else {
            self.record_failure(unit.clone(), "unrecognized events payload", 1);
            self.fail_after_drain(AppError::malformed(
                unit.to_string(),
                "unrecognized events payload",
            ));
            return (Vec::new(), None);
        };

        let fetched = payload.len();
        let take = match self.options.max_events {
            Some(max) => fetched.min(max.saturating_sub(taken_before)),
            None => fetched,
        };
        let capped = take < fetched;
        let last = !capped && fetched < page_size;
        let next = cursor.advance(take);

        let mut ids = Vec::with_capacity(take);
        let records: Vec<ExportedRecord> = payload.rows()[..take]
            .iter()
            .map(|row| {
                let lineage = match extract_id(row, EVENT_ID_KEYS) {
                    Some(event_id) => {
                        ids.push(event_id);
                        Lineage::org(org_id).with_event(event_id)
                    }
                    None => {
                        log::warn!("{}: event without an id is written but not descended", unit);
                        Lineage::org(org_id)
                    }
                };
                ExportedRecord::instance(EntityType::Events, lineage, row.clone())
            })
            .collect();

        let persisted = self.write(EntityType::Events, &records).and_then(|_| {
            self.checkpoint(|store, org| {
                store.record_page(org, EntityType::Events, org, next, &ids)?;
                if last {
                    store.mark_parent_complete(org, EntityType::Events, org)?;
                }
                Ok(())
            })
        });
        if let Err(error) = persisted {
            self.abort_with(error);
            return (Vec::new(), None);
        }

        self.events_taken.fetch_add(take, Ordering::SeqCst);
        self.record_success(EntityType::Events, records.len(), take);
        if capped {
            self.escalate(RunStatus::Truncated);
        }
        log::debug!("{}: {} events", unit, take);

        (ids, if last || capped { None } else { Some(next) })
    }

    /// Why the event listing stopped making progress, if it did.
    fn stalled_event_listing(&self, value: &Value) -> Option<String> {
        let mut pages = lock(&self.event_pages);
        pages.fetched += 1;
        let reason = stall_reason(pages.fetched, pages.last.as_ref(), value);
        pages.last = Some(value.clone());
        reason
    }

    async fn event_subtree(&self, event_id: u64) -> Result<()> {
        let lineage = Lineage::org(self.org_id).with_event(event_id);
        let Some(listing) = self.sessions_of(event_id).await? else {
            return Ok(());
        };

        let width = self.options.max_concurrent.max(1);
        let results: Vec<Result<bool>> = stream::iter(listing.ids)
            .map(|session_id| self.session_subtree(lineage, session_id))
            .buffer_unordered(width)
            .collect()
            .await;

        let mut all_closed = true;
        for result in results {
            all_closed &= result?;
        }

        if listing.complete && all_closed {
            self.checkpoint(|store, org| store.close_event(org, event_id))?;
        }
        Ok(())
    }

    /// Sessions of an event: those still open from a previous run plus any
    /// not yet written. `None` when the listing could not be fetched.
    async fn sessions_of(&self, event_id: u64) -> Result<Option<Listing>> {
        let mut ids = self.resume.open_children(EntityType::Sessions, event_id);
        if self.resume.is_complete(EntityType::Sessions, event_id) {
            return Ok(Some(Listing { ids, complete: true }));
        }

        let unit = WorkUnit::sessions(Lineage::org(self.org_id), event_id);
        let request = self.endpoints.event_sessions(event_id);
        let Some(value) = self.fetch(&unit, &request).await else {
            return Ok(None);
        };

        let payload = match SessionsPayload::from_event(&value) {
            Ok(payload) => payload,
            Err(message) => {
                log::error!("{}: malformed sessions payload: {}", unit, message);
                self.record_failure(unit, format!("malformed payload: {message}"), 1);
                return Ok(None);
            }
        };

        // Sessions arrive as one list; the cursor counts how many were written.
        let written = self.resume.cursor(EntityType::Sessions, event_id).offset() as usize;
        let sessions: Vec<&Value> = payload.flatten().into_iter().skip(written).collect();
        let take = match self.options.max_sessions_per_event {
            Some(cap) => sessions.len().min(cap.saturating_sub(written)),
            None => sessions.len(),
        };
        let capped = take < sessions.len();

        let mut new_ids = Vec::with_capacity(take);
        let records: Vec<ExportedRecord> = sessions[..take]
            .iter()
            .map(|row| {
                let lineage = match extract_id(row, SESSION_ID_KEYS) {
                    Some(session_id) => {
                        new_ids.push(session_id);
                        unit.lineage.with_session(session_id)
                    }
                    None => {
                        log::warn!("{}: session without an id is written but not descended", unit);
                        unit.lineage
                    }
                };
                ExportedRecord::instance(EntityType::Sessions, lineage, (*row).clone())
            })
            .collect();

        self.write(EntityType::Sessions, &records)?;
        let next = Cursor::START.advance(written + take);
        self.checkpoint(|store, org| {
            store.record_page(org, EntityType::Sessions, event_id, next, &new_ids)?;
            if !capped {
                store.mark_parent_complete(org, EntityType::Sessions, event_id)?;
            }
            Ok(())
        })?;

        self.record_success(EntityType::Sessions, records.len(), take);
        if capped {
            self.escalate(RunStatus::Truncated);
        }

        ids.extend(new_ids);
        Ok(Some(Listing {
            ids,
            complete: !capped,
        }))
    }

    /// Laps and announcements of one session. True once both are complete.
    async fn session_subtree(&self, event_lineage: Lineage, session_id: u64) -> Result<bool> {
        let (laps, announcements) = futures::join!(
            self.laps_of(event_lineage, session_id),
            self.announcements_of(event_lineage, session_id)
        );
        let done = laps? && announcements?;

        if done {
            if let Some(event_id) = event_lineage.event_id {
                self.checkpoint(|store, org| store.close_session(org, event_id, session_id))?;
            }
        }
        Ok(done)
    }

    async fn laps_of(&self, event_lineage: Lineage, session_id: u64) -> Result<bool> {
        if self.resume.is_complete(EntityType::Laps, session_id) {
            return Ok(true);
        }

        let page_size = self.options.page_size.laps;
        let mut unit = WorkUnit::session_child(
            EntityType::Laps,
            event_lineage,
            session_id,
            self.resume.cursor(EntityType::Laps, session_id),
        );

        let mut fetched = 0;
        let mut previous: Option<Value> = None;
        loop {
            let request = self.endpoints.laps(session_id, unit.cursor, page_size);
            let Some(value) = self.fetch(&unit, &request).await else {
                return Ok(false);
            };
            fetched += 1;

            if let Some(reason) = stall_reason(fetched, previous.as_ref(), &value) {
                log::warn!("{}: {}; treating the laps listing as finished", unit, reason);
                self.checkpoint(|store, org| {
                    store.mark_parent_complete(org, EntityType::Laps, session_id)
                })?;
                return Ok(true);
            }

            let rows = match RowsPayload::classify(&value, LAP_ROW_KEYS) {
                Some(payload) => payload.len(),
                None => {
                    log::warn!("{}: unrecognized laps payload stored as-is; listing ends here", unit);
                    0
                }
            };
            let next = unit.cursor.advance(rows);
            let last = rows < page_size;

            let record = ExportedRecord::page(EntityType::Laps, unit.lineage, unit.cursor, value);
            self.write(EntityType::Laps, std::slice::from_ref(&record))?;
            self.checkpoint(|store, org| {
                store.record_progress(org, EntityType::Laps, session_id, next)?;
                if last {
                    store.mark_parent_complete(org, EntityType::Laps, session_id)?;
                }
                Ok(())
            })?;
            self.record_success(EntityType::Laps, 1, rows);

            if last {
                return Ok(true);
            }
            previous = Some(record.raw);
            unit = unit.next_page(next);
        }
    }

    async fn announcements_of(&self, event_lineage: Lineage, session_id: u64) -> Result<bool> {
        if self.resume.is_complete(EntityType::Announcements, session_id) {
            return Ok(true);
        }

        let unit = WorkUnit::session_child(
            EntityType::Announcements,
            event_lineage,
            session_id,
            Cursor::START,
        );
        let request = self.endpoints.announcements(session_id);
        let Some(value) = self.fetch(&unit, &request).await else {
            return Ok(false);
        };

        let rows = RowsPayload::classify(&value, ANNOUNCEMENT_ROW_KEYS).map_or(0, |p| p.len());
        self.write(
            EntityType::Announcements,
            &[ExportedRecord::page(
                EntityType::Announcements,
                unit.lineage,
                unit.cursor,
                value,
            )],
        )?;
        self.checkpoint(|store, org| {
            store.record_progress(org, EntityType::Announcements, session_id, Cursor::START.advance(rows))?;
            store.mark_parent_complete(org, EntityType::Announcements, session_id)
        })?;
        self.record_success(EntityType::Announcements, 1, rows);
        Ok(true)
    }

    /// Submit a unit; terminal failures are logged and counted here.
    async fn fetch(&self, unit: &WorkUnit, request: &ApiRequest) -> Option<Value> {
        match self.scheduler.submit(unit, request).await {
            Outcome::Success(value) => Some(value),
            Outcome::Failed(failure) => {
                log::error!(
                    "{} failed after {} attempts: {}",
                    unit,
                    failure.attempts,
                    failure.error
                );
                self.record_failure(unit.clone(), failure.error.to_string(), failure.attempts);
                None
            }
            Outcome::Cancelled => None,
        }
    }

    /// Append and flush; returns once every record is durable.
    fn write(&self, entity: EntityType, records: &[ExportedRecord]) -> Result<()> {
        let Some(persist) = &self.persist else {
            return Ok(());
        };
        if records.is_empty() {
            return Ok(());
        }

        let writer = persist.artifacts.writer(entity);
        let mut last = None;
        for record in records {
            last = Some(writer.append(record)?);
        }
        let durable = writer.flush()?;
        if last.is_some_and(|token| token > durable) {
            return Err(AppError::Io(std::io::Error::other(format!(
                "flush of {} did not cover appended records",
                writer.path().display()
            ))));
        }
        Ok(())
    }

    fn checkpoint(&self, update: impl FnOnce(&CheckpointStore, u64) -> Result<()>) -> Result<()> {
        match &self.persist {
            Some(persist) => update(&persist.store, self.org_id),
            None => Ok(()),
        }
    }

    fn record_success(&self, entity: EntityType, records: usize, items: usize) {
        lock(&self.summary).record_success(entity, records as u64, items as u64);
    }

    fn record_failure(&self, unit: WorkUnit, reason: impl Into<String>, attempts: u32) {
        lock(&self.summary).record_failure(unit, reason, attempts);
    }

    fn escalate(&self, status: RunStatus) {
        lock(&self.summary).escalate(status);
    }

    /// Stop pagination with an error; in-flight subtrees still finish.
    fn fail_after_drain(&self, error: AppError) {
        lock(&self.fatal).get_or_insert(error);
    }

    /// Record an error and stop scheduling new fetches.
    fn abort_with(&self, error: AppError) {
        log::error!("Aborting export of {}: {}", self.org_id, error);
        lock(&self.fatal).get_or_insert(error);
        self.abort.cancel();
    }
}

/// Reason to stop paginating a listing that is not advancing.
///
/// A server that ignores the offset keeps returning the same full page.
fn stall_reason(fetched: usize, previous: Option<&Value>, page: &Value) -> Option<String> {
    if previous.is_some_and(|previous| previous == page) {
        return Some("page repeats the previous page".to_string());
    }
    if fetched > MAX_PAGES_PER_PARENT {
        return Some(format!("more than {MAX_PAGES_PER_PARENT} pages"));
    }
    None
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Whether `dir` holds artifacts of a previous run.
pub fn has_artifacts(dir: &Path) -> bool {
    EntityType::ALL.iter().any(|entity| {
        dir.join(entity.file_name(true)).exists() || dir.join(entity.file_name(false)).exists()
    })
}
