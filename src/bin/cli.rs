//! speedhive-dump CLI
//!
//! Exports timing data and turns finished exports into tables.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use speedhive_dump::{
    error::Result,
    models::Config,
    pipeline,
    processing::OutputFormat,
    services::ExportOptions,
};
use tokio_util::sync::CancellationToken;

/// speedhive-dump - resumable Speedhive timing-data export
#[derive(Parser, Debug)]
#[command(
    name = "speedhive-dump",
    version,
    about = "Resumable export of Speedhive timing data to NDJSON, CSV and SQLite"
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "speedhive.toml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Export organizations to NDJSON artifacts
    Export {
        /// Organization id (repeatable)
        #[arg(long = "org", num_args = 1.., required_unless_present = "org_file")]
        orgs: Vec<u64>,

        /// File with one organization id per line
        #[arg(long)]
        org_file: Option<PathBuf>,

        /// Bearer token for the API (default: api.token)
        #[arg(long)]
        token: Option<String>,

        /// Output root (default: export.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Maximum concurrent requests (default: export.max_concurrent)
        #[arg(long)]
        concurrency: Option<usize>,

        /// Discard the checkpoint and start over
        #[arg(long)]
        no_resume: bool,

        /// Stop after this many newly listed events
        #[arg(long)]
        max_events: Option<usize>,

        /// Export at most this many sessions per event
        #[arg(long = "max-sessions")]
        max_sessions: Option<usize>,

        /// Traverse without writing artifacts or checkpoints
        #[arg(long)]
        dry_run: bool,

        /// Write plain .ndjson instead of gzip
        #[arg(long)]
        no_compress: bool,
    },

    /// Convert exported artifacts into CSV tables and/or an SQLite store
    Process {
        /// Export directory (an org directory or its parent)
        #[arg(short, long)]
        input: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::All)]
        format: OutputFormat,
    },

    /// Show checkpoint progress
    Status {
        #[arg(long = "org", required = true, num_args = 1..)]
        orgs: Vec<u64>,

        /// Output root (default: export.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate,
}

/// Initialize logging based on verbosity flag.
fn init_logging(verbose: bool, level: &str) {
    let level = if verbose { "debug" } else { level };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}

/// Cancel `token` on Ctrl-C so in-flight work can drain.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received; finishing in-flight requests");
            token.cancel();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = Config::load(&cli.config);
    let level = loaded
        .as_ref()
        .map(|c| c.logging.level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(cli.verbose, &level);

    let mut config = match loaded {
        Ok(config) => {
            log::info!("Loaded configuration from {}", cli.config.display());
            config
        }
        Err(e) => {
            if matches!(cli.command, Command::Validate) {
                log::error!("Cannot load {}: {}", cli.config.display(), e);
                return Err(e);
            }
            log::warn!("Using default configuration ({}): {}", cli.config.display(), e);
            Config::default()
        }
    };

    match cli.command {
        Command::Export {
            orgs,
            org_file,
            token,
            output,
            concurrency,
            no_resume,
            max_events,
            max_sessions,
            dry_run,
            no_compress,
        } => {
            if token.is_some() {
                config.api.token = token;
            }
            config.validate()?;
            let orgs = pipeline::collect_org_ids(&orgs, org_file.as_deref())?;

            let mut options = ExportOptions::from_config(&config);
            if let Some(output) = output {
                options.output_dir = output;
            }
            if let Some(concurrency) = concurrency {
                options.max_concurrent = concurrency;
            }
            options.resume = !no_resume;
            options.max_events = max_events;
            options.max_sessions_per_event = max_sessions;
            options.dry_run = dry_run;
            options.compress = options.compress && !no_compress;

            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let summaries = pipeline::run_export(&config, &orgs, &options, cancel).await?;
            let failed: u64 = summaries.iter().map(|s| s.total_failed()).sum();
            if failed > 0 {
                log::warn!("{} work unit(s) failed; re-run to retry them", failed);
            }
        }

        Command::Process {
            input,
            output,
            format,
        } => {
            config.validate()?;
            pipeline::run_processing(&config, input, output, format).await?;
        }

        Command::Status { orgs, output } => {
            let output = output.unwrap_or_else(|| config.export.output_dir.clone());
            for org_id in orgs {
                let status = pipeline::org_status(&output, org_id)?;
                pipeline::log_status(&status);
            }
        }

        Command::Validate => {
            log::info!("Validating configuration...");
            if let Err(e) = config.validate() {
                log::error!("Config validation failed: {}", e);
                return Err(e);
            }
            log::info!("Config OK");
        }
    }

    Ok(())
}

