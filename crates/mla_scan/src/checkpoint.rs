//! Scan checkpoint window
//!
//! A scan runs against a fixed window: the watermark read at scan start
//! bounds which records are new, and the scan start instant becomes the
//! next watermark once the whole source completes successfully.

use chrono::{DateTime, Utc};

/// Immutable time window for one source scan.
#[derive(Debug, Clone, Copy)]
pub struct CheckpointWindow {
    watermark: DateTime<Utc>,
    scan_start: DateTime<Utc>,
}

impl CheckpointWindow {
    /// Open a window from the stored watermark. A source never scanned
    /// before gets the epoch, so every record qualifies.
    #[must_use]
    pub fn begin(previous: Option<DateTime<Utc>>) -> Self {
        Self {
            watermark: previous.unwrap_or(DateTime::UNIX_EPOCH),
            scan_start: Utc::now(),
        }
    }

    /// Whether a record timestamp is strictly newer than the watermark.
    /// Records at exactly the watermark were covered by the previous scan.
    #[must_use]
    pub fn accepts(&self, ts: DateTime<Utc>) -> bool {
        ts > self.watermark
    }

    #[must_use]
    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    /// The instant this window opened; persisted as the new watermark after
    /// a fully successful scan.
    #[must_use]
    pub fn scan_start(&self) -> DateTime<Utc> {
        self.scan_start
    }

    /// The watermark to persist once the source scan finishes, or `None`
    /// when the stored checkpoint must stay put. A failed scan retries from
    /// the old watermark next pass, and a scan that read no candidate files
    /// vouches for nothing past it either.
    #[must_use]
    pub fn advance(&self, files_read: usize, clean: bool) -> Option<DateTime<Utc>> {
        (clean && files_read > 0).then_some(self.scan_start)
    }
}
