//! `mla_store` - `DuckDB` storage layer for the MySQL log auditor
//!
//! This crate provides:
//! - `DuckDB` connection management
//! - Schema migrations
//! - The batched activity sink used by the scanner
//! - Per-source scan checkpoints
//! - The activity query surface consumed by listing/statistics frontends

use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::Connection;
use mla_parse::ActivityRecord;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod migrations;

/// Storage errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] duckdb::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Main storage handle
pub struct MlaStore {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl MlaStore {
    /// Open or create database at path
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if directory creation, database opening, or
    /// migration execution fails.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!(path = %path.display(), "Opening DuckDB database");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_string_lossy().to_string(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    /// Open in-memory database (for testing)
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if in-memory database setup or migrations fail.
    pub fn open_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: ":memory:".to_string(),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        migrations::run_all(&conn)?;
        Ok(())
    }

    /// Database file path (`:memory:` for test stores)
    #[must_use]
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    // =========================================================================
    // Activity writes
    // =========================================================================

    /// Insert a batch of activity records inside one transaction.
    ///
    /// All-or-nothing: on failure the transaction rolls back and the whole
    /// batch is reported failed. Returns the number of rows written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the transaction or any insert fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn insert_activities_batch(&self, records: &[ActivityRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO user_activities \
                 (source_id, ts, user_name, client_host, db_name, thread_id, \
                  command_type, operation_type, argument, risk_level) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for record in records {
                stmt.execute(duckdb::params![
                    record.source_id,
                    format_ts(record.timestamp),
                    record.user_name,
                    record.client_host,
                    record.db_name,
                    i64::try_from(record.thread_id).unwrap_or(i64::MAX),
                    record.command_type,
                    record.operation_type,
                    record.argument,
                    record.risk_level.as_str(),
                ])?;
            }
        }
        tx.commit()?;
        debug!(rows = records.len(), "Activity batch committed");
        Ok(records.len())
    }

    // =========================================================================
    // Scan checkpoints
    // =========================================================================

    /// Read the watermark for a source, if one has ever been recorded.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails or the stored value cannot
    /// be decoded as a timestamp.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn get_checkpoint(&self, source_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT CAST(last_scan_time AS TEXT) FROM scan_checkpoints WHERE source_id = ?",
        )?;
        let mut rows = stmt.query(duckdb::params![source_id])?;
        match rows.next()? {
            Some(row) => {
                let text: String = row.get(0)?;
                let ts = parse_ts(&text)
                    .ok_or_else(|| StoreError::QueryError(format!("bad checkpoint: {text}")))?;
                Ok(Some(ts))
            }
            None => Ok(None),
        }
    }

    /// Advance (or create) the watermark for a source. Single atomic upsert
    /// keyed by source id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the upsert fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn set_checkpoint(&self, source_id: i64, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO scan_checkpoints (source_id, last_scan_time, updated_at) \
             VALUES (?, ?, current_timestamp)",
            duckdb::params![source_id, format_ts(ts)],
        )?;
        Ok(())
    }

    /// Delete the watermark for a source, forcing a full rescan.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the delete fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn clear_checkpoint(&self, source_id: i64) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "DELETE FROM scan_checkpoints WHERE source_id = ?",
            duckdb::params![source_id],
        )?;
        Ok(affected > 0)
    }

    /// List all stored checkpoints as (`source_id`, watermark) pairs.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the query fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn list_checkpoints(&self) -> Result<Vec<(i64, String)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT source_id, CAST(last_scan_time AS TEXT) \
             FROM scan_checkpoints ORDER BY source_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut checkpoints = Vec::new();
        for row in rows {
            checkpoints.push(row?);
        }
        Ok(checkpoints)
    }

    // =========================================================================
    // Activity queries
    // =========================================================================

    /// List activities matching a filter, newest first, with the total count
    /// of matching rows (ignoring pagination).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if query execution or row decoding fails.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn list_activities(
        &self,
        filter: &ActivityFilter,
    ) -> Result<(Vec<StoredActivity>, i64), StoreError> {
        let where_sql = filter.where_sql();
        let conn = self.conn.lock().unwrap();

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM user_activities {where_sql}"),
            [],
            |row| row.get(0),
        )?;

        let limit = clamp_limit(filter.limit);
        let sql = format!(
            "SELECT id, source_id, CAST(ts AS TEXT), user_name, client_host, db_name, \
             thread_id, command_type, operation_type, argument, risk_level \
             FROM user_activities {where_sql} \
             ORDER BY ts DESC LIMIT {limit} OFFSET {}",
            filter.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredActivity {
                id: row.get(0)?,
                source_id: row.get(1)?,
                timestamp: row.get(2)?,
                user_name: row.get(3)?,
                client_host: row.get(4)?,
                db_name: row.get(5)?,
                thread_id: row.get(6)?,
                command_type: row.get(7)?,
                operation_type: row.get(8)?,
                argument: row.get(9)?,
                risk_level: row.get(10)?,
            })
        })?;

        let mut activities = Vec::new();
        for row in rows {
            activities.push(row?);
        }
        Ok((activities, total))
    }

    /// Aggregate statistics over a (source, time range) window: total count,
    /// per-operation-type counts, per-risk-level counts (High first), a
    /// zero-filled 24-bucket hour-of-day histogram, and top-10 users.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any of the aggregate queries fail.
    ///
    /// # Panics
    ///
    /// Panics if the internal database mutex is poisoned.
    pub fn activity_stats(&self, filter: &StatsFilter) -> Result<ActivityStats, StoreError> {
        let where_sql = filter.where_sql();
        let conn = self.conn.lock().unwrap();

        let total_count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM user_activities {where_sql}"),
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT operation_type, COUNT(*) AS count FROM user_activities {where_sql} \
             GROUP BY operation_type ORDER BY count DESC"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(OperationTypeCount {
                operation_type: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let mut operation_types = Vec::new();
        for row in rows {
            operation_types.push(row?);
        }

        let mut stmt = conn.prepare(&format!(
            "SELECT risk_level, COUNT(*) AS count FROM user_activities {where_sql} \
             GROUP BY risk_level \
             ORDER BY CASE risk_level WHEN 'High' THEN 0 WHEN 'Medium' THEN 1 ELSE 2 END"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(RiskLevelCount {
                risk_level: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let mut risk_levels = Vec::new();
        for row in rows {
            risk_levels.push(row?);
        }

        let mut hourly_distribution = [0i64; 24];
        let mut stmt = conn.prepare(&format!(
            "SELECT CAST(EXTRACT(hour FROM ts) AS BIGINT) AS hour, COUNT(*) \
             FROM user_activities {where_sql} GROUP BY hour ORDER BY hour"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (hour, count) = row?;
            if (0..24).contains(&hour) {
                hourly_distribution[hour as usize] = count;
            }
        }

        let user_clause = format!("{where_sql} AND user_name IS NOT NULL AND user_name != ''");
        let mut stmt = conn.prepare(&format!(
            "SELECT user_name, COUNT(*) AS count FROM user_activities {user_clause} \
             GROUP BY user_name ORDER BY count DESC LIMIT 10"
        ))?;
        let rows = stmt.query_map([], |row| {
            Ok(UserCount {
                user_name: row.get(0)?,
                count: row.get(1)?,
            })
        })?;
        let mut top_users = Vec::new();
        for row in rows {
            top_users.push(row?);
        }

        Ok(ActivityStats {
            total_count,
            operation_types,
            risk_levels,
            hourly_distribution: hourly_distribution.to_vec(),
            top_users,
        })
    }

    /// Windowed summary report: risk-level breakdown, active users, and
    /// per-risk operation-type breakdown over `[start, end]`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if any of the aggregate queries fail.
    pub fn summary_report(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SummaryReport, StoreError> {
        let filter = StatsFilter {
            source_id: None,
            start: Some(start),
            end: Some(end),
        };
        let stats = self.activity_stats(&filter)?;

        let where_sql = filter.where_sql();
        let conn = self.conn.lock().unwrap();
        let mut operations_by_risk = Vec::new();
        for level in ["High", "Medium", "Low"] {
            let mut stmt = conn.prepare(&format!(
                "SELECT operation_type, COUNT(*) AS count FROM user_activities {where_sql} \
                 AND risk_level = '{level}' GROUP BY operation_type ORDER BY count DESC"
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok(OperationTypeCount {
                    operation_type: row.get(0)?,
                    count: row.get(1)?,
                })
            })?;
            let mut ops = Vec::new();
            for row in rows {
                ops.push(row?);
            }
            operations_by_risk.push(RiskOperationBreakdown {
                risk_level: level.to_string(),
                operations: ops,
            });
        }

        Ok(SummaryReport {
            period_start: format_ts(start),
            period_end: format_ts(end),
            total_operations: stats.total_count,
            risk_level_summary: stats.risk_levels,
            active_users: stats.top_users,
            operations_by_risk,
        })
    }
}

/// One persisted activity row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredActivity {
    pub id: i64,
    pub source_id: i64,
    pub timestamp: String,
    pub user_name: Option<String>,
    pub client_host: Option<String>,
    pub db_name: Option<String>,
    pub thread_id: i64,
    pub command_type: Option<String>,
    pub operation_type: Option<String>,
    pub argument: Option<String>,
    pub risk_level: String,
}

/// Filtering options for activity listing
#[derive(Debug, Clone, Default)]
pub struct ActivityFilter {
    pub source_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub operation_type: Option<String>,
    pub risk_level: Option<String>,
    /// Substring match on user name
    pub user_name: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl ActivityFilter {
    fn where_sql(&self) -> String {
        let mut clauses: Vec<String> = Vec::new();
        if let Some(source_id) = self.source_id {
            clauses.push(format!("source_id = {source_id}"));
        }
        if let Some(start) = self.start {
            clauses.push(format!("ts >= TIMESTAMP '{}'", format_ts(start)));
        }
        if let Some(end) = self.end {
            clauses.push(format!("ts <= TIMESTAMP '{}'", format_ts(end)));
        }
        if let Some(op) = &self.operation_type {
            clauses.push(format!("operation_type = '{}'", escape_sql_literal(op)));
        }
        if let Some(risk) = &self.risk_level {
            clauses.push(format!("risk_level = '{}'", escape_sql_literal(risk)));
        }
        if let Some(user) = &self.user_name {
            clauses.push(format!("user_name LIKE '%{}%'", escape_sql_literal(user)));
        }
        if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        }
    }
}

/// Filtering options for statistics
#[derive(Debug, Clone, Default)]
pub struct StatsFilter {
    pub source_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl StatsFilter {
    fn where_sql(&self) -> String {
        let mut clauses: Vec<String> = Vec::new();
        if let Some(source_id) = self.source_id {
            clauses.push(format!("source_id = {source_id}"));
        }
        if let Some(start) = self.start {
            clauses.push(format!("ts >= TIMESTAMP '{}'", format_ts(start)));
        }
        if let Some(end) = self.end {
            clauses.push(format!("ts <= TIMESTAMP '{}'", format_ts(end)));
        }
        if clauses.is_empty() {
            // Keeps `summary_report` free to append AND clauses.
            "WHERE 1=1".to_string()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        }
    }
}

/// Count of one operation type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationTypeCount {
    pub operation_type: String,
    pub count: i64,
}

/// Count of one risk level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLevelCount {
    pub risk_level: String,
    pub count: i64,
}

/// Count of one user's activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCount {
    pub user_name: String,
    pub count: i64,
}

/// Aggregate statistics over an activity window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityStats {
    pub total_count: i64,
    pub operation_types: Vec<OperationTypeCount>,
    /// Ordered High, Medium, Low (present levels only)
    pub risk_levels: Vec<RiskLevelCount>,
    /// 24 buckets, hour 0 through 23, zero-filled
    pub hourly_distribution: Vec<i64>,
    pub top_users: Vec<UserCount>,
}

/// Operation-type breakdown for one risk level
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskOperationBreakdown {
    pub risk_level: String,
    pub operations: Vec<OperationTypeCount>,
}

/// Windowed summary report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryReport {
    pub period_start: String,
    pub period_end: String,
    pub total_operations: i64,
    pub risk_level_summary: Vec<RiskLevelCount>,
    pub active_users: Vec<UserCount>,
    pub operations_by_risk: Vec<RiskOperationBreakdown>,
}

/// Batched writer for classified, policy-filtered activity records.
///
/// Bounds memory and transaction size: records accumulate up to the batch
/// capacity, then flush in one transaction. The final partial batch flushes
/// on [`ActivityBatchSink::finish`]. A failed flush surfaces immediately so
/// the scan can be marked unsuccessful; batches flushed earlier stay written.
pub struct ActivityBatchSink {
    store: Arc<MlaStore>,
    buffer: Vec<ActivityRecord>,
    capacity: usize,
    total_flushed: usize,
}

impl ActivityBatchSink {
    #[must_use]
    pub fn new(store: Arc<MlaStore>, capacity: usize) -> Self {
        Self {
            store,
            buffer: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            total_flushed: 0,
        }
    }

    /// Buffer one record, flushing if the batch is full.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a triggered flush fails.
    pub fn push(&mut self, record: ActivityRecord) -> Result<(), StoreError> {
        self.buffer.push(record);
        if self.buffer.len() >= self.capacity {
            self.flush()?;
        }
        Ok(())
    }

    /// Flush the current buffer as one batch.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the batch write fails; the buffer is kept
    /// so the failure is observable to the caller.
    pub fn flush(&mut self) -> Result<(), StoreError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let written = self.store.insert_activities_batch(&self.buffer)?;
        self.total_flushed += written;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the final partial batch and return the total rows written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the final flush fails.
    pub fn finish(mut self) -> Result<usize, StoreError> {
        self.flush()?;
        Ok(self.total_flushed)
    }

    /// Rows written so far (excludes the unflushed buffer).
    #[must_use]
    pub fn total_flushed(&self) -> usize {
        self.total_flushed
    }

    /// Records currently buffered and not yet written.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Format a UTC instant as a naive timestamp literal with microseconds.
#[must_use]
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Parse a timestamp as produced by `CAST(ts AS TEXT)`.
#[must_use]
pub fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Escape a string for use inside a single-quoted SQL literal
#[must_use]
pub fn escape_sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

fn clamp_limit(limit: usize) -> usize {
    let limit = if limit == 0 { 50 } else { limit };
    limit.min(10_000)
}
