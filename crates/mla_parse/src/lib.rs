//! `mla_parse` - MySQL general query log parsing core
//!
//! This crate provides:
//! - The activity record model shared by the scanner and the store
//! - Operation-type and risk classification (`classify`)
//! - Per-connection session context tracking (`session`)
//! - The stateful line parser that turns raw log text into records (`parser`)
//!
//! Everything in here is pure in-memory logic: no I/O, no storage. The
//! scanner drives the parser one line at a time over a remote file stream,
//! so a log file is never buffered whole.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod classify;
pub mod parser;
pub mod session;

pub use classify::{classify_operation, classify_risk, OperationType, RiskLevel, RiskRule, RiskRuleSet, RuleError};
pub use parser::{GeneralLogParser, ParserStats};
pub use session::{SessionContext, SessionTracker};

/// The nine commands the general log grammar recognizes.
///
/// Connect/Quit/Change user only mutate session state; the remaining six
/// each produce one [`ActivityRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Query,
    Connect,
    Quit,
    InitDb,
    Prepare,
    Execute,
    CloseStmt,
    ChangeUser,
    FieldList,
}

impl CommandType {
    /// Raw spelling as it appears in the log.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Query => "Query",
            CommandType::Connect => "Connect",
            CommandType::Quit => "Quit",
            CommandType::InitDb => "Init DB",
            CommandType::Prepare => "Prepare",
            CommandType::Execute => "Execute",
            CommandType::CloseStmt => "Close stmt",
            CommandType::ChangeUser => "Change user",
            CommandType::FieldList => "Field List",
        }
    }

    /// Whether this command emits an activity record.
    #[must_use]
    pub fn is_activity(&self) -> bool {
        !matches!(
            self,
            CommandType::Connect | CommandType::Quit | CommandType::ChangeUser
        )
    }
}

impl std::str::FromStr for CommandType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "Query" => Ok(CommandType::Query),
            "Connect" => Ok(CommandType::Connect),
            "Quit" => Ok(CommandType::Quit),
            "Init DB" => Ok(CommandType::InitDb),
            "Prepare" => Ok(CommandType::Prepare),
            "Execute" => Ok(CommandType::Execute),
            "Close stmt" => Ok(CommandType::CloseStmt),
            "Change user" => Ok(CommandType::ChangeUser),
            "Field List" => Ok(CommandType::FieldList),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

/// One reconstructed database operation, ready for filtering and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Monitored host this record came from
    pub source_id: i64,
    /// Event time (UTC, microsecond precision)
    pub timestamp: DateTime<Utc>,
    /// Database user, or "unknown" when no session context exists
    pub user_name: String,
    /// Client host or IP, or "unknown"
    pub client_host: String,
    /// Database in use, if any
    pub db_name: Option<String>,
    /// MySQL connection thread id (reused over time, scoped to one source)
    pub thread_id: u64,
    /// Raw log command ("Query", "Init DB", ...)
    pub command_type: String,
    /// Derived operation tag (SELECT/INSERT/.../USE_DB/OTHER, or the
    /// upper-cased raw command for non-Query commands). Computed once.
    pub operation_type: String,
    /// Raw statement or command payload
    pub argument: String,
    /// Classified risk level
    pub risk_level: RiskLevel,
}
