//! `mla_cli` - CLI commands for the MySQL log auditor
//!
//! This crate provides:
//! - clap-based command definitions
//! - The scan/daemon entry points driving the audit pipeline
//! - Activity, stats, report, and checkpoint query commands
//! - JSON and text output formatting

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use mla_config::MlaConfig;
use mla_parse::RiskLevel;
use mla_scan::{Auditor, ScanSummary, SourceScanResult};
use mla_store::{ActivityFilter, MlaStore, StatsFilter};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// CLI errors
#[derive(Error, Debug)]
pub enum CliError {
    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Config error: {0}")]
    ConfigError(#[from] mla_config::ConfigError),

    #[error("Store error: {0}")]
    StoreError(#[from] mla_store::StoreError),

    #[error("Scan error: {0}")]
    ScanError(#[from] mla_scan::ScanError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Output format for commands
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Standard JSON output
    Json,
    /// Human-readable text
    Text,
}

/// Main CLI application
#[derive(Parser, Debug)]
#[command(name = "mla")]
#[command(
    author,
    version,
    about = "MySQL log auditor - remote general-log ingestion and risk classification"
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format for commands
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one scan pass over configured sources
    Scan {
        /// Scan only this source (default: all enabled sources)
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Run the scan loop (periodic scans of all enabled sources)
    Daemon {
        /// Override the scan interval in seconds
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List recorded activities
    Activities {
        /// Filter by source id
        #[arg(long)]
        source: Option<i64>,

        /// Filter by user name (substring match)
        #[arg(short, long)]
        user: Option<String>,

        /// Filter by operation type (e.g. SELECT, UPDATE, DDL)
        #[arg(long)]
        operation: Option<String>,

        /// Filter by risk level (High, Medium, Low)
        #[arg(long)]
        risk: Option<String>,

        /// Filter by RFC3339 timestamp (inclusive lower bound)
        #[arg(long)]
        since: Option<String>,

        /// Filter by RFC3339 timestamp (inclusive upper bound)
        #[arg(long)]
        until: Option<String>,

        /// Maximum rows to return
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Rows to skip (pagination)
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Show aggregate activity statistics
    Stats {
        /// Filter by source id
        #[arg(long)]
        source: Option<i64>,

        /// Filter by RFC3339 timestamp (inclusive lower bound)
        #[arg(long)]
        since: Option<String>,

        /// Filter by RFC3339 timestamp (inclusive upper bound)
        #[arg(long)]
        until: Option<String>,
    },

    /// Summary report over a trailing window
    Report {
        /// Window length in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Scan checkpoint management
    Checkpoints {
        #[command(subcommand)]
        command: CheckpointCommands,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List stored per-source watermarks
    List,

    /// Clear a source's watermark, forcing a full rescan
    Clear {
        /// Source id
        source_id: i64,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Run the CLI
    ///
    /// # Errors
    ///
    /// Returns [`CliError`] when configuration loading, storage access, or
    /// the requested command fails.
    pub async fn run(self) -> Result<(), CliError> {
        match self.command {
            Commands::Scan { source } => {
                let config = load_config(self.config.as_ref())?;
                let store = Arc::new(MlaStore::open(&config.global.db_path)?);
                let auditor = Auditor::new(store, config);

                match source {
                    Some(name) => {
                        let result = auditor.scan_source(&name).await?;
                        print_scan_result(&result, self.format);
                        if !result.success() {
                            return Err(CliError::CommandFailed(format!(
                                "Scan of '{name}' failed: {}",
                                result.error.unwrap_or_default()
                            )));
                        }
                    }
                    None => {
                        let summary = auditor.scan_all().await;
                        print_scan_summary(&summary, self.format);
                        if summary.sources_failed > 0 {
                            return Err(CliError::CommandFailed(format!(
                                "{} of {} sources failed",
                                summary.sources_failed, summary.sources_attempted
                            )));
                        }
                    }
                }
            }
            Commands::Daemon { interval } => {
                let config = load_config(self.config.as_ref())?;
                let store = Arc::new(MlaStore::open(&config.global.db_path)?);
                let scan_interval = interval
                    .map(std::time::Duration::from_secs)
                    .unwrap_or_else(|| config.scan_interval());
                let auditor = Auditor::new(store, config);

                info!(interval_secs = scan_interval.as_secs(), "Daemon started");
                loop {
                    let summary = auditor.scan_all().await;
                    info!(
                        sources_succeeded = summary.sources_succeeded,
                        sources_failed = summary.sources_failed,
                        total_records = summary.total_records,
                        "Scan pass finished, sleeping"
                    );
                    tokio::time::sleep(scan_interval).await;
                }
            }
            Commands::Activities {
                source,
                user,
                operation,
                risk,
                since,
                until,
                limit,
                offset,
            } => {
                let store = open_store(self.config.as_ref())?;

                let risk_level = match risk {
                    Some(value) => Some(
                        RiskLevel::from_str(&value)
                            .map_err(CliError::CommandFailed)?
                            .as_str()
                            .to_string(),
                    ),
                    None => None,
                };

                let filter = ActivityFilter {
                    source_id: source,
                    start: parse_opt_rfc3339(since.as_deref())?,
                    end: parse_opt_rfc3339(until.as_deref())?,
                    operation_type: operation.map(|op| op.to_uppercase()),
                    risk_level,
                    user_name: user,
                    limit,
                    offset,
                };
                let (activities, total) = store.list_activities(&filter)?;
                let payload = serde_json::json!({
                    "activities": activities,
                    "total": total,
                    "limit": limit,
                    "offset": offset,
                });
                print_output(&payload, self.format);
            }
            Commands::Stats {
                source,
                since,
                until,
            } => {
                let store = open_store(self.config.as_ref())?;
                let filter = StatsFilter {
                    source_id: source,
                    start: parse_opt_rfc3339(since.as_deref())?,
                    end: parse_opt_rfc3339(until.as_deref())?,
                };
                let stats = store.activity_stats(&filter)?;
                print_output(&stats, self.format);
            }
            Commands::Report { hours } => {
                if hours <= 0 {
                    return Err(CliError::CommandFailed(
                        "Report window must be at least one hour".to_string(),
                    ));
                }
                let store = open_store(self.config.as_ref())?;
                let end = Utc::now();
                let start = end - ChronoDuration::hours(hours);
                let report = store.summary_report(start, end)?;
                print_output(&report, self.format);
            }
            Commands::Checkpoints { command } => {
                let store = open_store(self.config.as_ref())?;
                match command {
                    CheckpointCommands::List => {
                        let checkpoints = store.list_checkpoints()?;
                        if checkpoints.is_empty() {
                            println!("No checkpoints recorded yet");
                        } else {
                            let rows: Vec<_> = checkpoints
                                .iter()
                                .map(|(source_id, watermark)| {
                                    serde_json::json!({
                                        "source_id": source_id,
                                        "last_scan_time": watermark,
                                    })
                                })
                                .collect();
                            print_output(&rows, self.format);
                        }
                    }
                    CheckpointCommands::Clear { source_id } => {
                        if store.clear_checkpoint(source_id)? {
                            println!("Checkpoint cleared for source {source_id}");
                        } else {
                            return Err(CliError::CommandFailed(format!(
                                "No checkpoint for source {source_id}"
                            )));
                        }
                    }
                }
            }
            Commands::Config { command } => match command {
                ConfigCommands::Show { json } => {
                    let config = load_config(self.config.as_ref())?;
                    if json {
                        print_output(&config, OutputFormat::Json);
                    } else {
                        let rendered = toml::to_string_pretty(&config).map_err(|e| {
                            CliError::CommandFailed(format!("Config render failed: {e}"))
                        })?;
                        println!("{rendered}");
                    }
                }
            },
        }
        Ok(())
    }
}

fn load_config(config_path: Option<&PathBuf>) -> Result<MlaConfig, CliError> {
    let config = match config_path {
        Some(path) => MlaConfig::load(path)?,
        None => MlaConfig::discover_with_env()?,
    };
    Ok(config)
}

fn open_store(config_path: Option<&PathBuf>) -> Result<MlaStore, CliError> {
    let config = load_config(config_path)?;
    Ok(MlaStore::open(&config.global.db_path)?)
}

fn parse_opt_rfc3339(value: Option<&str>) -> Result<Option<DateTime<Utc>>, CliError> {
    match value {
        Some(v) => Ok(Some(parse_rfc3339(v)?)),
        None => Ok(None),
    }
}

fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, CliError> {
    let parsed = DateTime::parse_from_rfc3339(value)
        .map_err(|err| CliError::CommandFailed(format!("Invalid timestamp: {err}")))?;
    Ok(parsed.with_timezone(&Utc))
}

fn print_output<T: Serialize>(value: &T, format: OutputFormat) {
    let json = match format {
        OutputFormat::Json | OutputFormat::Text => serde_json::to_string_pretty(value),
    }
    .unwrap_or_else(|e| format!(r#"{{"error": "serialization failed: {e}"}}"#));
    println!("{json}");
}

fn scan_result_json(result: &SourceScanResult) -> serde_json::Value {
    serde_json::json!({
        "source": result.source_name,
        "source_id": result.source_id,
        "files_scanned": result.files_scanned,
        "lines_consumed": result.lines_consumed,
        "records_emitted": result.records_emitted,
        "records_stored": result.records_stored,
        "duration_ms": result.duration.as_millis(),
        "success": result.success(),
        "error": result.error,
    })
}

fn print_scan_result(result: &SourceScanResult, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_output(&scan_result_json(result), format),
        OutputFormat::Text => {
            if result.success() {
                println!(
                    "{}: {} files, {} records stored ({} ms)",
                    result.source_name,
                    result.files_scanned,
                    result.records_stored,
                    result.duration.as_millis()
                );
            } else {
                println!(
                    "{}: FAILED - {}",
                    result.source_name,
                    result.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
}

fn print_scan_summary(summary: &ScanSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "sources_attempted": summary.sources_attempted,
                "sources_succeeded": summary.sources_succeeded,
                "sources_failed": summary.sources_failed,
                "total_records": summary.total_records,
                "duration_ms": summary.total_duration.as_millis(),
                "success_rate": summary.success_rate(),
                "results": summary.results.iter().map(scan_result_json).collect::<Vec<_>>(),
            });
            print_output(&payload, format);
        }
        OutputFormat::Text => {
            for result in &summary.results {
                print_scan_result(result, format);
            }
            println!(
                "{}/{} sources succeeded, {} records stored ({} ms)",
                summary.sources_succeeded,
                summary.sources_attempted,
                summary.total_records,
                summary.total_duration.as_millis()
            );
        }
    }
}
