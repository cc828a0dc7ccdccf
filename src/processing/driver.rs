// src/processing/driver.rs

//! Turns an export directory into row tables and the indexed store.
//!
//! Each org directory is read on its own thread; normalized rows flow through
//! a bounded channel to a single sink thread that owns every output.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use crate::error::{AppError, Result};
use crate::models::{EntityType, ExportedRecord, ProcessConfig, ProcessSummary};
use crate::processing::RowSink;
use crate::processing::csv_sink::CsvSink;
use crate::processing::normalize::{NormalizedRow, Normalizer};
use crate::processing::reader::NdjsonReader;
use crate::processing::sqlite_sink::SqliteSink;
use crate::services::has_artifacts;

/// Which processed artifacts to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum OutputFormat {
    Csv,
    Sqlite,
    #[default]
    All,
}

impl OutputFormat {
    fn csv(&self) -> bool {
        matches!(self, OutputFormat::Csv | OutputFormat::All)
    }

    fn sqlite(&self) -> bool {
        matches!(self, OutputFormat::Sqlite | OutputFormat::All)
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Sqlite => "sqlite",
            OutputFormat::All => "all",
        })
    }
}

impl FromStr for OutputFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "csv" => Ok(OutputFormat::Csv),
            "sqlite" => Ok(OutputFormat::Sqlite),
            "all" => Ok(OutputFormat::All),
            other => Err(AppError::validation(format!("unknown output format '{other}'"))),
        }
    }
}

/// Org directories under `input`: `input` itself if it holds artifacts,
/// otherwise every numeric subdirectory that does.
pub fn discover_org_dirs(input: &Path) -> Result<Vec<PathBuf>> {
    if !input.is_dir() {
        return Err(AppError::config(format!(
            "input {} is not a directory",
            input.display()
        )));
    }
    if has_artifacts(input) {
        return Ok(vec![input.to_path_buf()]);
    }

    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(input)? {
        let path = entry?.path();
        let numeric = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.parse::<u64>().is_ok());
        if numeric && path.is_dir() && has_artifacts(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();

    if dirs.is_empty() {
        return Err(AppError::config(format!(
            "no export artifacts found under {}",
            input.display()
        )));
    }
    Ok(dirs)
}

/// Process every org under `input` into `output`.
pub fn run_process(
    input: &Path,
    output: &Path,
    format: OutputFormat,
    config: &ProcessConfig,
) -> Result<ProcessSummary> {
    let org_dirs = discover_org_dirs(input)?;
    let normalizer = Normalizer::new(config.record_validation)?;
    let sinks = open_sinks(output, format, config)?;
    log::info!(
        "Processing {} org director{} into {} ({})",
        org_dirs.len(),
        if org_dirs.len() == 1 { "y" } else { "ies" },
        output.display(),
        format
    );

    let (tx, rx) = sync_channel::<Vec<NormalizedRow>>(config.channel_capacity.max(1));

    thread::scope(|scope| {
        let sink = scope.spawn(move || drain(rx, sinks));

        let readers: Vec<_> = org_dirs
            .iter()
            .map(|dir| {
                let tx = tx.clone();
                let normalizer = &normalizer;
                scope.spawn(move || read_org(dir, normalizer, &tx))
            })
            .collect();
        drop(tx);

        let mut summary = ProcessSummary::default();
        let mut reader_error = None;
        for reader in readers {
            match reader.join() {
                Ok(Ok(part)) => summary.merge(part),
                Ok(Err(e)) => {
                    reader_error.get_or_insert(e);
                }
                Err(_) => {
                    reader_error.get_or_insert(AppError::validation("reader thread panicked"));
                }
            }
        }

        let rows = sink
            .join()
            .map_err(|_| AppError::validation("sink thread panicked"))??;
        if let Some(e) = reader_error {
            return Err(e);
        }
        summary.rows = rows;

        log::info!(
            "Processed {} file(s): {} event, {} session, {} lap, {} announcement row(s); {} record(s) skipped",
            summary.files,
            summary.rows(EntityType::Events),
            summary.rows(EntityType::Sessions),
            summary.rows(EntityType::Laps),
            summary.rows(EntityType::Announcements),
            summary.skipped
        );
        Ok(summary)
    })
}

fn open_sinks(
    output: &Path,
    format: OutputFormat,
    config: &ProcessConfig,
) -> Result<Vec<Box<dyn RowSink>>> {
    let mut sinks: Vec<Box<dyn RowSink>> = Vec::new();
    if format.csv() {
        sinks.push(Box::new(CsvSink::create(output)?));
    }
    if format.sqlite() {
        sinks.push(Box::new(SqliteSink::create(output, config.batch_size)?));
    }
    Ok(sinks)
}

/// Stream every artifact of one org directory into the channel.
///
/// Stops early without error once the sink has hung up; the sink's own error
/// is what gets reported.
fn read_org(
    dir: &Path,
    normalizer: &Normalizer,
    tx: &SyncSender<Vec<NormalizedRow>>,
) -> Result<ProcessSummary> {
    let mut summary = ProcessSummary::default();

    for entity in EntityType::ALL {
        for compress in [false, true] {
            let path = dir.join(entity.file_name(compress));
            if !path.exists() {
                continue;
            }
            summary.files += 1;
            log::debug!("Reading {}", path.display());

            let mut reader = NdjsonReader::open(&path)?;
            for value in reader.by_ref() {
                let record: ExportedRecord = match serde_json::from_value(value) {
                    Ok(record) => record,
                    Err(e) => {
                        log::warn!("{}: skipping line that is not a record: {}", path.display(), e);
                        summary.skipped += 1;
                        continue;
                    }
                };
                match normalizer.normalize(&record) {
                    Ok(normalized) => {
                        if normalized.skipped > 0 {
                            log::warn!(
                                "{}: skipped {} row(s) that are not objects",
                                path.display(),
                                normalized.skipped
                            );
                            summary.skipped += normalized.skipped;
                        }
                        if !normalized.rows.is_empty() && tx.send(normalized.rows).is_err() {
                            return Ok(summary);
                        }
                    }
                    Err(e) => {
                        log::warn!("{}: {}", path.display(), e);
                        summary.skipped += 1;
                    }
                }
            }
            summary.skipped += reader.skipped();
        }
    }
    Ok(summary)
}

fn drain(
    rx: Receiver<Vec<NormalizedRow>>,
    mut sinks: Vec<Box<dyn RowSink>>,
) -> Result<BTreeMap<EntityType, u64>> {
    let mut rows: BTreeMap<EntityType, u64> = BTreeMap::new();
    for batch in rx {
        for row in &batch {
            for sink in sinks.iter_mut() {
                sink.write(row)?;
            }
            *rows.entry(row.entity).or_insert(0) += 1;
        }
    }
    for sink in sinks.iter_mut() {
        sink.finish()?;
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cursor, Lineage};
    use crate::processing::csv_sink::table_path;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_lines(path: &Path, records: &[ExportedRecord]) {
        let mut file = std::fs::File::create(path).unwrap();
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
        }
    }

    fn export_dir(root: &Path, org: u64) -> PathBuf {
        let dir = root.join(org.to_string());
        std::fs::create_dir_all(&dir).unwrap();
        let lineage = Lineage::org(org).with_event(1);
        write_lines(
            &dir.join("events.ndjson"),
            &[ExportedRecord::instance(
                EntityType::Events,
                lineage,
                json!({"id": 1, "name": "Cup"}),
            )],
        );
        write_lines(
            &dir.join("announcements.ndjson"),
            &[
                ExportedRecord::page(
                    EntityType::Announcements,
                    lineage.with_session(10),
                    Cursor::START,
                    json!({"rows": [{"text": "Green flag"}]}),
                ),
                ExportedRecord::page(
                    EntityType::Announcements,
                    lineage.with_session(11),
                    Cursor::START,
                    json!([
                        {"text": "New Track Record (1:06.111) for FA by Jane Doe in Van Diemen"},
                        "not a row"
                    ]),
                ),
                ExportedRecord::page(
                    EntityType::Announcements,
                    lineage.with_session(12),
                    Cursor::START,
                    json!({"mystery": 1}),
                ),
            ],
        );
        dir
    }

    #[test]
    fn processes_every_org_into_both_outputs() {
        let tmp = TempDir::new().unwrap();
        let input = tmp.path().join("dump");
        export_dir(&input, 1);
        export_dir(&input, 2);
        let output = tmp.path().join("out");

        let summary =
            run_process(&input, &output, OutputFormat::All, &ProcessConfig::default()).unwrap();
        assert_eq!(summary.files, 4);
        assert_eq!(summary.rows(EntityType::Events), 2);
        assert_eq!(summary.rows(EntityType::Announcements), 4);
        assert_eq!(summary.skipped, 4);

        let csv = std::fs::read_to_string(table_path(&output, EntityType::Announcements)).unwrap();
        assert_eq!(csv.lines().count(), 5);

        let conn = rusqlite::Connection::open(output.join("speedhive.sqlite")).unwrap();
        let records: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM announcements WHERE record_class = 'FA'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(records, 2);
    }

    #[test]
    fn single_org_directory_is_accepted_as_input() {
        let tmp = TempDir::new().unwrap();
        let dir = export_dir(tmp.path(), 30476);
        assert_eq!(discover_org_dirs(&dir).unwrap(), vec![dir.clone()]);

        let output = tmp.path().join("csv");
        let summary =
            run_process(&dir, &output, OutputFormat::Csv, &ProcessConfig::default()).unwrap();
        assert_eq!(summary.rows(EntityType::Announcements), 2);
        assert!(!output.join("speedhive.sqlite").exists());
    }

    #[test]
    fn empty_input_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            discover_org_dirs(tmp.path()),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    fn output_format_parses() {
        assert_eq!("SQLite".parse::<OutputFormat>().unwrap(), OutputFormat::Sqlite);
        assert!("parquet".parse::<OutputFormat>().is_err());
    }
}
