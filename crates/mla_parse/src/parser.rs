//! Stateful general-log line parser
//!
//! Turns raw log lines into [`ActivityRecord`]s. The grammar is a single
//! anchored pattern compiled once, treated as a tokenizer producing a fixed
//! 4-tuple (timestamp, thread id, command, argument) rather than ad hoc
//! string splitting.
//!
//! The parser is pull-driven: the caller feeds one line at a time and takes
//! at most one record back, so it composes with any line source (an SFTP
//! stream, a local file, a test fixture) without buffering.
//!
//! Skip rules:
//! - blank lines and lines that do not match the grammar: skipped silently
//! - a matching line whose timestamp fails to parse: dropped with a logged
//!   error, parsing continues
//! - Connect/Quit/Change user: session state only, no record

use chrono::NaiveDateTime;
use regex::Regex;
use tracing::{error, warn};

use crate::classify::{classify_operation, classify_risk, RiskRuleSet};
use crate::session::SessionTracker;
use crate::{ActivityRecord, CommandType};

const LINE_PATTERN: &str = r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d+Z)\t *(\d+)\s+(Query|Connect|Init DB|Quit|Prepare|Execute|Close stmt|Change user|Field List)\t(.*)$";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.fZ";

/// Running diagnostics, not part of the output contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParserStats {
    /// Lines fed in, including skipped ones
    pub lines_consumed: u64,
    /// Activity records emitted
    pub records_emitted: u64,
}

/// Line-at-a-time parser for one source's general query log.
///
/// Holds the session tracker and an immutable risk-rule snapshot for the
/// duration of one parse pass.
pub struct GeneralLogParser {
    source_id: i64,
    rules: RiskRuleSet,
    tracker: SessionTracker,
    stats: ParserStats,
    line_re: Regex,
}

impl GeneralLogParser {
    #[must_use]
    pub fn new(source_id: i64, rules: RiskRuleSet) -> Self {
        Self {
            source_id,
            rules,
            tracker: SessionTracker::new(),
            stats: ParserStats::default(),
            line_re: Regex::new(LINE_PATTERN).expect("valid grammar regex"),
        }
    }

    /// Consume one log line, possibly emitting a record.
    pub fn feed_line(&mut self, line: &str) -> Option<ActivityRecord> {
        self.stats.lines_consumed += 1;

        // Trim line endings only: a Quit line ends with the grammar's tab
        // and an empty argument, which a full trim would eat.
        let line = line.trim_end_matches(['\r', '\n']).trim_start();
        if line.is_empty() {
            return None;
        }
        let caps = self.line_re.captures(line)?;

        let timestamp_str = caps.get(1)?.as_str();
        let thread_id: u64 = match caps.get(2)?.as_str().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(line = self.stats.lines_consumed, "thread id out of range");
                return None;
            }
        };
        // The grammar restricts group 3 to the nine known commands.
        let command: CommandType = caps.get(3)?.as_str().parse().ok()?;
        let argument = caps.get(4)?.as_str().trim();

        match command {
            CommandType::Connect => {
                self.tracker.connect(thread_id, argument);
                None
            }
            CommandType::Quit => {
                self.tracker.quit(thread_id);
                None
            }
            CommandType::ChangeUser => {
                self.tracker.change_user(thread_id, argument);
                None
            }
            _ => {
                let record = self.emit(command, thread_id, timestamp_str, argument)?;
                self.stats.records_emitted += 1;
                Some(record)
            }
        }
    }

    fn emit(
        &mut self,
        command: CommandType,
        thread_id: u64,
        timestamp_str: &str,
        argument: &str,
    ) -> Option<ActivityRecord> {
        let timestamp = match NaiveDateTime::parse_from_str(timestamp_str, TIMESTAMP_FORMAT) {
            Ok(naive) => naive.and_utc(),
            Err(err) => {
                error!(timestamp = timestamp_str, %err, "dropping record with bad timestamp");
                return None;
            }
        };

        if !self.tracker.contains(thread_id) && command == CommandType::Query {
            warn!(thread_id, "no session context for query thread");
        }
        if command == CommandType::InitDb {
            // visible to this record and all subsequent ones on the thread
            self.tracker.init_db(thread_id, argument);
        }
        let ctx = self.tracker.lookup(thread_id);

        let operation_type = if command == CommandType::Query {
            classify_operation(argument).as_str().to_string()
        } else {
            command.as_str().to_uppercase()
        };
        let risk_level = classify_risk(&operation_type, argument, &self.rules);

        Some(ActivityRecord {
            source_id: self.source_id,
            timestamp,
            user_name: ctx.user,
            client_host: ctx.host,
            db_name: ctx.db,
            thread_id,
            command_type: command.as_str().to_string(),
            operation_type,
            argument: argument.to_string(),
            risk_level,
        })
    }

    /// Drop all session context (used when context must not carry across
    /// files within one scan).
    pub fn reset_session(&mut self) {
        self.tracker.reset();
    }

    #[must_use]
    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Parse a whole in-memory text. Test and fixture convenience; the
    /// scanner feeds lines from the remote stream instead.
    pub fn parse_text(&mut self, text: &str) -> Vec<ActivityRecord> {
        text.lines().filter_map(|l| self.feed_line(l)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RiskLevel;

    fn parser() -> GeneralLogParser {
        GeneralLogParser::new(1, RiskRuleSet::default())
    }

    #[test]
    fn test_connect_then_query_carries_identity() {
        let mut p = parser();
        assert!(p
            .feed_line("2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost")
            .is_none());
        let record = p
            .feed_line("2024-01-01T00:00:01.000000Z\t    5 Query\tSELECT 1")
            .unwrap();
        assert_eq!(record.user_name, "root");
        assert_eq!(record.client_host, "localhost");
        assert_eq!(record.operation_type, "SELECT");
        assert_eq!(record.command_type, "Query");
    }

    #[test]
    fn test_quit_then_query_is_unknown() {
        let mut p = parser();
        p.feed_line("2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost");
        p.feed_line("2024-01-01T00:00:01.000000Z\t    5 Quit\t");
        let record = p
            .feed_line("2024-01-01T00:00:02.000000Z\t    5 Query\tSELECT 1")
            .unwrap();
        assert_eq!(record.user_name, "unknown");
        assert_eq!(record.client_host, "unknown");
    }

    #[test]
    fn test_init_db_emits_record_with_new_db() {
        let mut p = parser();
        p.feed_line("2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost");
        let init = p
            .feed_line("2024-01-01T00:00:01.000000Z\t    5 Init DB\tmydb")
            .unwrap();
        assert_eq!(init.db_name.as_deref(), Some("mydb"));
        assert_eq!(init.operation_type, "INIT DB");
        let query = p
            .feed_line("2024-01-01T00:00:02.000000Z\t    5 Query\tSELECT 1")
            .unwrap();
        assert_eq!(query.db_name.as_deref(), Some("mydb"));
    }

    #[test]
    fn test_ddl_classified_high_with_default_rules() {
        let mut p = parser();
        p.feed_line("2024-01-01T00:00:00.000000Z\t    7 Connect\troot@127.0.0.1 on test");
        let record = p
            .feed_line("2024-01-01T00:00:01.000000Z\t    7 Query\tDROP TABLE accounts")
            .unwrap();
        assert_eq!(record.operation_type, "DDL");
        assert_eq!(record.risk_level, RiskLevel::High);
        assert_eq!(record.user_name, "root");
        assert_eq!(record.client_host, "127.0.0.1");
        assert_eq!(record.db_name.as_deref(), Some("test"));
    }

    #[test]
    fn test_malformed_line_between_valid_lines() {
        let mut p = parser();
        let records = p.parse_text(
            "2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost\n\
             this is not a log line at all\n\
             \n\
             2024-01-01T00:00:01.000000Z\t    5 Query\tSELECT 1\n\
             2024-01-01T00:00:02.000000Z\t    5 Query\tSELECT 2\n",
        );
        assert_eq!(records.len(), 2);
        assert_eq!(p.stats().lines_consumed, 5);
        assert_eq!(p.stats().records_emitted, 2);
    }

    #[test]
    fn test_unknown_command_skipped() {
        let mut p = parser();
        assert!(p
            .feed_line("2024-01-01T00:00:00.000000Z\t    5 Refresh\tfoo")
            .is_none());
    }

    #[test]
    fn test_timestamp_sub_second_precision() {
        let mut p = parser();
        p.feed_line("2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost");
        let record = p
            .feed_line("2024-03-05T12:34:56.789012Z\t    5 Query\tSELECT 1")
            .unwrap();
        assert_eq!(record.timestamp.timestamp_subsec_micros(), 789_012);
    }

    #[test]
    fn test_prepare_execute_close_stmt_each_emit() {
        let mut p = parser();
        p.feed_line("2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost");
        for (line, op) in [
            ("2024-01-01T00:00:01.000000Z\t    5 Prepare\tSELECT ?", "PREPARE"),
            ("2024-01-01T00:00:02.000000Z\t    5 Execute\tSELECT 1", "EXECUTE"),
            ("2024-01-01T00:00:03.000000Z\t    5 Close stmt\t", "CLOSE STMT"),
            ("2024-01-01T00:00:04.000000Z\t    5 Field List\tusers", "FIELD LIST"),
        ] {
            let record = p.feed_line(line).unwrap();
            assert_eq!(record.operation_type, op);
        }
    }

    #[test]
    fn test_reset_session_drops_context() {
        let mut p = parser();
        p.feed_line("2024-01-01T00:00:00.000000Z\t    5 Connect\troot@localhost");
        p.reset_session();
        let record = p
            .feed_line("2024-01-01T00:00:01.000000Z\t    5 Query\tSELECT 1")
            .unwrap();
        assert_eq!(record.user_name, "unknown");
    }
}
