//! `mla_scan` - remote log scanning for the MySQL log auditor
//!
//! This crate drives the audit pipeline end to end:
//! - SSH/SFTP connections to configured database hosts
//! - Discovery and selection of general query log files
//! - Incremental scans bounded by per-source checkpoints
//! - Streaming lines through the parser into the batch sink

pub mod checkpoint;
pub mod scanner;
pub mod ssh;

pub use checkpoint::CheckpointWindow;
pub use scanner::{Auditor, ScanError, ScanSummary, SourceScanResult};
pub use ssh::{RemoteFileEntry, SftpConnection, SshError};
