// src/pipeline/process.rs

use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::models::{Config, ProcessSummary};
use crate::processing::{OutputFormat, run_process};

/// Run the stream processors off the async runtime.
pub async fn run_processing(
    config: &Config,
    input: PathBuf,
    output: PathBuf,
    format: OutputFormat,
) -> Result<ProcessSummary> {
    let process = config.process.clone();
    tokio::task::spawn_blocking(move || run_process(&input, &output, format, &process))
        .await
        .map_err(|e| AppError::validation(format!("processing task failed: {e}")))?
}
