//! In-memory timing API for exporter tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use speedhive_dump::models::{Config, EntityType, ExportedRecord, RetryConfig};
use speedhive_dump::processing::NdjsonReader;
use speedhive_dump::services::{ApiRequest, Endpoints, ExportOptions, Exporter, FetchError, Fetcher};
use tokio_util::sync::CancellationToken;

type Reply = Result<Value, FetchError>;

/// Serves scripted replies keyed by `path@offset` and records what was asked.
#[derive(Default)]
pub struct MockApi {
    routes: HashMap<String, Reply>,
    /// One-shot failures served before the route's normal reply
    failures: Mutex<HashMap<String, Vec<FetchError>>>,
    /// Cancel this token when the keyed route is first requested
    trip: Mutex<Option<(String, CancellationToken)>>,
    latency: Option<Duration>,
    /// Copy this file's bytes the first time each key is requested
    snapshot_of: Option<PathBuf>,
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
    calls: Mutex<Vec<String>>,
    served: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockApi {
    pub fn route(mut self, path: &str, offset: u64, reply: Reply) -> Self {
        self.routes.insert(key(path, offset), reply);
        self
    }

    pub fn fail_first(self, path: &str, offset: u64, errors: Vec<FetchError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert(key(path, offset), errors);
        self
    }

    /// Cancel `token` and fail with a timeout the first time `path` is requested.
    pub fn interrupt_at(self, path: &str, token: CancellationToken) -> Self {
        *self.trip.lock().unwrap() = Some((key(path, 0), token));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Remember the contents of `file` as they were when each key was first requested.
    pub fn snapshot_file(mut self, file: &Path) -> Self {
        self.snapshot_of = Some(file.to_path_buf());
        self
    }

    /// Bytes of the snapshot file taken when `key` was first requested.
    pub fn snapshot(&self, key: &str) -> Option<Vec<u8>> {
        self.snapshots.lock().unwrap().get(key).cloned()
    }

    /// Every request key in arrival order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Successful replies per request key.
    pub fn served(&self) -> HashMap<String, usize> {
        self.served.lock().unwrap().clone()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

fn key(path: &str, offset: u64) -> String {
    format!("{path}@{offset}")
}

#[async_trait]
impl Fetcher for MockApi {
    async fn fetch(&self, request: &ApiRequest) -> Result<Value, FetchError> {
        let offset = request.get("offset").unwrap_or("0");
        let key = format!("{}@{}", request.path, offset);
        self.calls.lock().unwrap().push(key.clone());
        if let Some(file) = &self.snapshot_of {
            if let Ok(bytes) = std::fs::read(file) {
                self.snapshots
                    .lock()
                    .unwrap()
                    .entry(key.clone())
                    .or_insert(bytes);
            }
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let tripped = {
            let mut trip = self.trip.lock().unwrap();
            match trip.as_ref() {
                Some((at, _)) if *at == key => trip.take(),
                _ => None,
            }
        };
        if let Some((_, token)) = tripped {
            token.cancel();
            return Err(FetchError::Timeout);
        }

        if let Some(queue) = self.failures.lock().unwrap().get_mut(&key) {
            if !queue.is_empty() {
                return Err(queue.remove(0));
            }
        }

        let reply = self
            .routes
            .get(&key)
            .cloned()
            .unwrap_or(Err(FetchError::Client { status: 404 }));
        if reply.is_ok() {
            *self.served.lock().unwrap().entry(key).or_insert(0) += 1;
        }
        reply
    }
}

/// Two events of organization 30476, one session each. The first session's
/// announcements come wrapped in `{rows: [...]}`, the second's as a bare array.
pub fn two_event_api() -> MockApi {
    MockApi::default()
        .route(
            "organizations/30476/events",
            0,
            Ok(json!([
                {"id": 1, "name": "Winter Cup", "sport": "Car"},
                {"id": 2, "name": "Spring Cup", "sport": "Car"}
            ])),
        )
        .route(
            "events/1",
            0,
            Ok(json!({"id": 1, "sessions": {"groups": [{"name": "Race", "sessions": [{"id": 101, "name": "Race 1"}]}]}})),
        )
        .route(
            "events/2",
            0,
            Ok(json!({"id": 2, "sessions": [{"id": 201, "name": "Qualifying"}]})),
        )
        .route(
            "sessions/101/laps",
            0,
            Ok(json!({"rows": [{"competitorId": 7, "name": "Jane Doe", "lapNumber": 1, "lapTime": "1:06.111"}]})),
        )
        .route("sessions/201/laps", 0, Ok(json!([])))
        .route(
            "sessions/101/announcements",
            0,
            Ok(json!({"rows": [{"text": "New Track Record (1:06.111) for FA by Jane Doe in Van Diemen"}]})),
        )
        .route(
            "sessions/201/announcements",
            0,
            Ok(json!([{"text": "Session started"}])),
        )
}

/// `events` events of organization 30476 with `sessions` sessions each and
/// empty laps and announcements.
pub fn wide_api(events: u64, sessions: u64) -> MockApi {
    let listing: Vec<_> = (1..=events).map(|id| json!({"id": id})).collect();
    let mut api = MockApi::default().route("organizations/30476/events", 0, Ok(json!(listing)));
    for event in 1..=events {
        let ids: Vec<_> = (0..sessions).map(|s| json!({"id": event * 100 + s})).collect();
        api = api.route(&format!("events/{event}"), 0, Ok(json!({"sessions": ids})));
        for s in 0..sessions {
            let session = event * 100 + s;
            api = api
                .route(&format!("sessions/{session}/laps"), 0, Ok(json!([])))
                .route(&format!("sessions/{session}/announcements"), 0, Ok(json!([])));
        }
    }
    api
}

pub fn exporter(api: Arc<MockApi>, max_attempts: u32, cancel: CancellationToken) -> Exporter {
    let retry = RetryConfig {
        max_attempts,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        jitter: false,
        ..RetryConfig::default()
    };
    Exporter::new(api, Endpoints::default(), retry, cancel)
}

pub fn options(dir: &Path, compress: bool) -> ExportOptions {
    ExportOptions {
        output_dir: dir.to_path_buf(),
        compress,
        ..ExportOptions::from_config(&Config::default())
    }
}

/// Every record of one artifact, or none if it does not exist.
pub fn read_records(org_dir: &Path, entity: EntityType) -> Vec<ExportedRecord> {
    [false, true]
        .into_iter()
        .map(|compress| org_dir.join(entity.file_name(compress)))
        .filter(|path| path.exists())
        .flat_map(|path| NdjsonReader::open(path).unwrap())
        .map(|value| serde_json::from_value(value).unwrap())
        .collect()
}
