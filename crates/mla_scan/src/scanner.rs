//! Scan orchestration
//!
//! `Auditor` runs the pipeline for each enabled source: read the stored
//! watermark, connect over SFTP, select candidate log files, stream their
//! lines through the parser, and batch the surviving records into the
//! store. The checkpoint advances only after a fully successful source
//! scan that read at least one file; a failed scan or an empty candidate
//! set leaves the old watermark for the next pass.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument, warn};

use mla_config::{MlaConfig, SelectionPolicy, SourceConfig};
use mla_parse::{GeneralLogParser, ParserStats};
use mla_store::{ActivityBatchSink, MlaStore, StoreError};

use crate::checkpoint::CheckpointWindow;
use crate::ssh::{join_remote_path, RemoteFileEntry, SftpConnection, SshError};

/// Sources scanned concurrently in `scan_all`
const MAX_CONCURRENT_SOURCES: usize = 4;

/// Errors from scan orchestration
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Unknown source '{0}'")]
    SourceNotFound(String),

    #[error("Source '{0}' is disabled")]
    SourceDisabled(String),

    #[error("SSH error: {0}")]
    SshError(#[from] SshError),

    #[error("Storage error: {0}")]
    StoreError(#[from] StoreError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result of scanning a single source
#[derive(Debug)]
pub struct SourceScanResult {
    pub source_name: String,
    pub source_id: i64,
    /// Log files fully read during this scan
    pub files_scanned: usize,
    /// Lines fed to the parser, including skipped ones
    pub lines_consumed: u64,
    /// Records the parser emitted (before watermark/risk filtering)
    pub records_emitted: u64,
    /// Records written to the store
    pub records_stored: usize,
    pub duration: Duration,
    /// Set when the scan failed; the checkpoint did not advance
    pub error: Option<String>,
}

impl SourceScanResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    fn failed(name: &str, source_id: i64, error: &ScanError, duration: Duration) -> Self {
        Self {
            source_name: name.to_string(),
            source_id,
            files_scanned: 0,
            lines_consumed: 0,
            records_emitted: 0,
            records_stored: 0,
            duration,
            error: Some(error.to_string()),
        }
    }
}

/// Summary of one multi-source scan pass
#[derive(Debug, Default)]
pub struct ScanSummary {
    pub sources_attempted: usize,
    pub sources_succeeded: usize,
    pub sources_failed: usize,
    /// Records stored across all sources
    pub total_records: usize,
    pub total_duration: Duration,
    pub results: Vec<SourceScanResult>,
}

impl ScanSummary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_result(&mut self, result: SourceScanResult) {
        self.sources_attempted += 1;
        if result.success() {
            self.sources_succeeded += 1;
            self.total_records += result.records_stored;
        } else {
            self.sources_failed += 1;
        }
        self.results.push(result);
    }

    /// Success rate as a percentage
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.sources_attempted == 0 {
            0.0
        } else {
            let succeeded = u32::try_from(self.sources_succeeded).unwrap_or(u32::MAX);
            let attempted = u32::try_from(self.sources_attempted).unwrap_or(u32::MAX);
            (f64::from(succeeded) / f64::from(attempted)) * 100.0
        }
    }
}

/// Pick which discovered files a scan should read, oldest first.
///
/// `LatestOnly` keeps the single newest file. `Incremental` keeps every
/// file modified after the watermark, so rotated files that gained no new
/// content since the last scan are skipped without opening them.
#[must_use]
pub fn select_candidates(
    mut entries: Vec<RemoteFileEntry>,
    policy: SelectionPolicy,
    watermark: chrono::DateTime<chrono::Utc>,
) -> Vec<RemoteFileEntry> {
    entries.retain(|e| e.is_file);
    match policy {
        SelectionPolicy::LatestOnly => entries
            .into_iter()
            .max_by_key(|e| e.modified)
            .into_iter()
            .collect(),
        SelectionPolicy::Incremental => {
            entries.retain(|e| e.modified > watermark);
            entries.sort_by_key(|e| e.modified);
            entries
        }
    }
}

/// Multi-source scan driver
pub struct Auditor {
    store: Arc<MlaStore>,
    config: MlaConfig,
}

impl Auditor {
    #[must_use]
    pub fn new(store: Arc<MlaStore>, config: MlaConfig) -> Self {
        Self { store, config }
    }

    /// Scan every enabled source, bounded concurrency, failures isolated
    /// per source.
    #[instrument(skip(self))]
    pub async fn scan_all(&self) -> ScanSummary {
        let start = Instant::now();
        let sources = self.config.enabled_sources();

        info!(source_count = sources.len(), "Starting scan pass");

        let results: Vec<SourceScanResult> = stream::iter(sources)
            .map(|(name, source)| self.scan_one(name, source))
            .buffer_unordered(MAX_CONCURRENT_SOURCES)
            .collect()
            .await;

        let mut summary = ScanSummary::new();
        for result in results {
            summary.add_result(result);
        }
        summary.total_duration = start.elapsed();

        info!(
            sources_succeeded = summary.sources_succeeded,
            sources_failed = summary.sources_failed,
            total_records = summary.total_records,
            duration_ms = summary.total_duration.as_millis(),
            "Scan pass complete"
        );

        summary
    }

    /// Scan one source by name.
    ///
    /// # Errors
    ///
    /// Returns [`ScanError::SourceNotFound`] or [`ScanError::SourceDisabled`]
    /// when the name does not resolve to an enabled source. Scan failures
    /// themselves are reported in the result's `error` field.
    pub async fn scan_source(&self, name: &str) -> Result<SourceScanResult, ScanError> {
        let source = self
            .config
            .sources
            .get(name)
            .ok_or_else(|| ScanError::SourceNotFound(name.to_string()))?;
        if !source.enabled {
            return Err(ScanError::SourceDisabled(name.to_string()));
        }
        Ok(self.scan_one(name, source).await)
    }

    #[instrument(skip(self, source), fields(source = %name, source_id = source.source_id))]
    async fn scan_one(&self, name: &str, source: &SourceConfig) -> SourceScanResult {
        let start = Instant::now();
        match self.scan_source_inner(name, source).await {
            Ok(mut result) => {
                result.duration = start.elapsed();
                info!(
                    files = result.files_scanned,
                    stored = result.records_stored,
                    duration_ms = result.duration.as_millis(),
                    "Source scan complete"
                );
                result
            }
            Err(e) => {
                warn!(error = %e, "Source scan failed, checkpoint not advanced");
                SourceScanResult::failed(name, source.source_id, &e, start.elapsed())
            }
        }
    }

    async fn scan_source_inner(
        &self,
        name: &str,
        source: &SourceConfig,
    ) -> Result<SourceScanResult, ScanError> {
        let window = CheckpointWindow::begin(self.store.get_checkpoint(source.source_id)?);

        let conn =
            SftpConnection::connect(source, self.config.scan.connect_timeout()).await?;
        let outcome = self.scan_files(source, &conn, &window).await;
        conn.close().await;
        let (files_scanned, stats, records_stored) = outcome?;

        // All candidates read and all batches flushed. A pass that selected
        // no files covers nothing, so its watermark stays where it was.
        match window.advance(files_scanned, true) {
            Some(watermark) => self.store.set_checkpoint(source.source_id, watermark)?,
            None => info!(
                source_id = source.source_id,
                "No new log files, checkpoint unchanged"
            ),
        }

        Ok(SourceScanResult {
            source_name: name.to_string(),
            source_id: source.source_id,
            files_scanned,
            lines_consumed: stats.lines_consumed,
            records_emitted: stats.records_emitted,
            records_stored,
            duration: Duration::ZERO,
            error: None,
        })
    }

    async fn scan_files(
        &self,
        source: &SourceConfig,
        conn: &SftpConnection,
        window: &CheckpointWindow,
    ) -> Result<(usize, ParserStats, usize), ScanError> {
        let scan = &self.config.scan;

        let entries = conn
            .list_log_files(&source.log_directory, &scan.file_suffix)
            .await?;
        let candidates = select_candidates(entries, source.selection, window.watermark());
        debug!(candidates = candidates.len(), "Selected candidate log files");

        let mut parser = GeneralLogParser::new(source.source_id, self.config.rules.clone());
        let mut sink = ActivityBatchSink::new(Arc::clone(&self.store), scan.batch_size);
        let mut files_scanned = 0usize;

        for entry in &candidates {
            if files_scanned > 0 && !scan.carry_session_across_files {
                parser.reset_session();
            }

            let path = join_remote_path(&source.log_directory, &entry.name);
            debug!(file = %entry.name, size = entry.size, "Reading log file");

            let file = conn.open_file(&path).await?;
            let mut reader = BufReader::new(file);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                if reader.read_until(b'\n', &mut buf).await? == 0 {
                    break;
                }
                // Undecodable bytes degrade that line, never abort the file.
                let line = String::from_utf8_lossy(&buf);
                if let Some(record) = parser.feed_line(&line) {
                    if window.accepts(record.timestamp)
                        && scan.allowed_risk_levels.contains(&record.risk_level)
                    {
                        sink.push(record)?;
                    }
                }
            }
            files_scanned += 1;
        }

        let stats = parser.stats();
        let records_stored = sink.finish()?;
        Ok((files_scanned, stats, records_stored))
    }
}
