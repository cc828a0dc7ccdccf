// src/pipeline/export.rs

//! Export pipeline: one organization after another.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::models::{Config, EntityType, ExportSummary, RunStatus};
use crate::services::{ExportOptions, Exporter};

/// Organization ids listed one per line; blank lines and `#` comments are ignored.
pub fn parse_org_ids(text: &str) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<u64>() {
            Ok(id) if id > 0 => ids.push(id),
            _ => {
                return Err(AppError::validation(format!(
                    "line {}: '{}' is not an organization id",
                    number + 1,
                    line
                )));
            }
        }
    }
    Ok(ids)
}

/// Ids given on the command line followed by those in `org_file`, without repeats.
pub fn collect_org_ids(flags: &[u64], org_file: Option<&Path>) -> Result<Vec<u64>> {
    let mut ids = flags.to_vec();
    if let Some(path) = org_file {
        let text = fs::read_to_string(path).map_err(|e| {
            AppError::config(format!("cannot read org file {}: {}", path.display(), e))
        })?;
        ids.extend(parse_org_ids(&text).map_err(|e| {
            AppError::validation(format!("{}: {}", path.display(), e))
        })?);
    }

    let mut seen = HashSet::new();
    ids.retain(|id| seen.insert(*id));
    if ids.is_empty() {
        return Err(AppError::config("no organization ids given"));
    }
    Ok(ids)
}

/// Export every organization in `org_ids` with the configured HTTP API.
///
/// Organizations run sequentially; a cancelled token stops before the next
/// one starts. A fatal error for one organization ends the whole run.
pub async fn run_export(
    config: &Config,
    org_ids: &[u64],
    options: &ExportOptions,
    cancel: CancellationToken,
) -> Result<Vec<ExportSummary>> {
    let exporter = Exporter::from_config(config, cancel.clone())?;
    export_orgs(&exporter, org_ids, options, &cancel).await
}

/// Export with an already constructed exporter.
pub async fn export_orgs(
    exporter: &Exporter,
    org_ids: &[u64],
    options: &ExportOptions,
    cancel: &CancellationToken,
) -> Result<Vec<ExportSummary>> {
    let mut summaries = Vec::with_capacity(org_ids.len());

    for (i, &org_id) in org_ids.iter().enumerate() {
        if cancel.is_cancelled() {
            log::warn!(
                "Interrupted; skipping {} remaining organization(s)",
                org_ids.len() - i
            );
            break;
        }
        log::info!("[{}/{}] Organization {}", i + 1, org_ids.len(), org_id);

        let summary = exporter.run(org_id, options).await?;
        log_summary(&summary);
        summaries.push(summary);
    }

    Ok(summaries)
}

/// Log the outcome of one organization's export.
pub fn log_summary(summary: &ExportSummary) {
    let elapsed = summary.finished_at - summary.started_at;
    log::info!(
        "Organization {} {} in {}s{}",
        summary.org_id,
        summary.status,
        elapsed.num_seconds(),
        if summary.dry_run { " (dry run)" } else { "" }
    );

    for entity in EntityType::ALL {
        let counts = summary.counts(entity);
        log::info!(
            "  {:<14} {:>7} record(s) {:>9} item(s)  {} ok / {} failed",
            entity.as_str(),
            counts.records,
            counts.items,
            counts.units_succeeded,
            counts.units_failed
        );
    }

    for failure in &summary.failures {
        log::error!(
            "  failed: {} after {} attempt(s): {}",
            failure.unit,
            failure.attempts,
            failure.reason
        );
    }

    match summary.status {
        RunStatus::Completed => {}
        RunStatus::Truncated => {
            log::info!("  Caps stopped enumeration early; run again without caps to finish")
        }
        RunStatus::Interrupted => log::warn!("  Run was interrupted; run again to resume"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn org_ids_skip_blanks_and_comments() {
        let ids = parse_org_ids("30476\n\n# club series\n  512  # night races\n30476\n").unwrap();
        assert_eq!(ids, vec![30476, 512, 30476]);
    }

    #[test]
    fn org_ids_reject_garbage_with_line_number() {
        let err = parse_org_ids("1\nabc\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
        assert!(parse_org_ids("0").is_err());
        assert!(parse_org_ids("-4").is_err());
    }

    #[test]
    fn flags_and_file_merge_without_repeats() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("orgs.txt");
        fs::write(&file, "7\n30476\n9\n").unwrap();

        let ids = collect_org_ids(&[30476, 1], Some(&file)).unwrap();
        assert_eq!(ids, vec![30476, 1, 7, 9]);

        assert!(collect_org_ids(&[], Some(&tmp.path().join("absent.txt"))).is_err());
        fs::write(&file, "# nothing yet\n").unwrap();
        assert!(matches!(
            collect_org_ids(&[], Some(&file)),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn configured_token_reaches_the_api() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/organizations/7/events"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.api.base_url = server.uri();
        config.api.token = Some("s3cret".to_string());
        let options = ExportOptions {
            output_dir: tmp.path().to_path_buf(),
            ..ExportOptions::from_config(&config)
        };

        let summaries = run_export(&config, &[7], &options, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].status, RunStatus::Completed);
    }
}
