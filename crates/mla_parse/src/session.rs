//! Per-connection session context tracking
//!
//! MySQL's general log identifies connections only by thread id; the user,
//! client host and current database have to be reconstructed from the
//! Connect / Change user / Init DB / Quit commands seen earlier in the
//! stream. The tracker owns that mapping for the lifetime of one parse pass.

use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Sentinel used when a thread id has no known context.
pub const UNKNOWN: &str = "unknown";

/// Identity and current database of one connection thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub user: String,
    pub host: String,
    pub db: Option<String>,
}

impl SessionContext {
    fn unknown() -> Self {
        Self {
            user: UNKNOWN.to_string(),
            host: UNKNOWN.to_string(),
            db: None,
        }
    }
}

/// Thread-id to session-context map, driven by the stream parser.
#[derive(Debug)]
pub struct SessionTracker {
    contexts: HashMap<u64, SessionContext>,
    // `user@host[ on db]` as logged by Connect and Change user
    connect_re: Regex,
}

impl SessionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: HashMap::new(),
            connect_re: Regex::new(r"^([^@]+)@([^ ]+)(?: on (\S*))?").expect("valid regex"),
        }
    }

    /// Number of threads currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Drop all contexts. Called by the scanner when session state must not
    /// carry across files.
    pub fn reset(&mut self) {
        self.contexts.clear();
    }

    /// Connect: parse `user@host[ on db]` and insert/overwrite the context.
    pub fn connect(&mut self, thread_id: u64, argument: &str) {
        let ctx = self.parse_user_host(argument).unwrap_or_else(SessionContext::unknown);
        debug!(thread_id, user = %ctx.user, host = %ctx.host, "connect");
        self.contexts.insert(thread_id, ctx);
    }

    /// Quit: remove the context. Unknown thread ids are logged, not fatal.
    pub fn quit(&mut self, thread_id: u64) {
        if self.contexts.remove(&thread_id).is_none() {
            warn!(thread_id, "quit for untracked thread");
        }
    }

    /// Change user: re-parse with the connect grammar; if that fails, split
    /// on `" as "` and re-parse the left-hand side. Total failure yields the
    /// unknown sentinel context.
    pub fn change_user(&mut self, thread_id: u64, argument: &str) {
        let ctx = self
            .parse_user_host(argument)
            .or_else(|| {
                argument
                    .split(" as ")
                    .next()
                    .and_then(|lhs| self.parse_user_host(lhs.trim()))
            })
            .unwrap_or_else(SessionContext::unknown);
        debug!(thread_id, user = %ctx.user, host = %ctx.host, "change user");
        self.contexts.insert(thread_id, ctx);
    }

    /// Init DB: set the current database on an existing context. The change
    /// is visible to this and all subsequent records on the thread.
    pub fn init_db(&mut self, thread_id: u64, db: &str) {
        if let Some(ctx) = self.contexts.get_mut(&thread_id) {
            ctx.db = Some(db.to_string());
        }
    }

    /// Look up the context for a thread; unknown threads yield the sentinel.
    #[must_use]
    pub fn lookup(&self, thread_id: u64) -> SessionContext {
        self.contexts
            .get(&thread_id)
            .cloned()
            .unwrap_or_else(SessionContext::unknown)
    }

    /// Whether the thread has a tracked context.
    #[must_use]
    pub fn contains(&self, thread_id: u64) -> bool {
        self.contexts.contains_key(&thread_id)
    }

    fn parse_user_host(&self, argument: &str) -> Option<SessionContext> {
        let caps = self.connect_re.captures(argument)?;
        Some(SessionContext {
            user: caps.get(1)?.as_str().trim().to_string(),
            host: caps.get(2)?.as_str().trim().to_string(),
            db: caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .filter(|s| !s.is_empty()),
        })
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_then_lookup() {
        let mut tracker = SessionTracker::new();
        tracker.connect(5, "root@localhost");
        let ctx = tracker.lookup(5);
        assert_eq!(ctx.user, "root");
        assert_eq!(ctx.host, "localhost");
        assert_eq!(ctx.db, None);
    }

    #[test]
    fn test_connect_with_db() {
        let mut tracker = SessionTracker::new();
        tracker.connect(7, "app@10.0.0.3 on orders");
        let ctx = tracker.lookup(7);
        assert_eq!(ctx.user, "app");
        assert_eq!(ctx.host, "10.0.0.3");
        assert_eq!(ctx.db.as_deref(), Some("orders"));
    }

    #[test]
    fn test_quit_removes_context() {
        let mut tracker = SessionTracker::new();
        tracker.connect(5, "root@localhost");
        tracker.quit(5);
        assert_eq!(tracker.lookup(5).user, UNKNOWN);
        // quit on an untracked thread must not panic
        tracker.quit(99);
    }

    #[test]
    fn test_init_db_mutates_existing_context() {
        let mut tracker = SessionTracker::new();
        tracker.connect(5, "root@localhost");
        tracker.init_db(5, "mydb");
        assert_eq!(tracker.lookup(5).db.as_deref(), Some("mydb"));
        // no context: silently ignored
        tracker.init_db(6, "otherdb");
        assert!(!tracker.contains(6));
    }

    #[test]
    fn test_change_user_direct_grammar() {
        let mut tracker = SessionTracker::new();
        tracker.connect(5, "root@localhost");
        tracker.change_user(5, "audit@192.168.1.9 on reporting");
        let ctx = tracker.lookup(5);
        assert_eq!(ctx.user, "audit");
        assert_eq!(ctx.host, "192.168.1.9");
        assert_eq!(ctx.db.as_deref(), Some("reporting"));
    }

    #[test]
    fn test_change_user_as_fallback() {
        let mut tracker = SessionTracker::new();
        // the "<user>@<host> as <authname>" form: left-hand side re-parsed
        tracker.change_user(5, "svc@db-proxy as anonymous");
        let ctx = tracker.lookup(5);
        assert_eq!(ctx.user, "svc");
        assert_eq!(ctx.host, "db-proxy");
    }

    #[test]
    fn test_unknown_thread_sentinel() {
        let tracker = SessionTracker::new();
        let ctx = tracker.lookup(42);
        assert_eq!(ctx.user, UNKNOWN);
        assert_eq!(ctx.host, UNKNOWN);
        assert_eq!(ctx.db, None);
    }

    #[test]
    fn test_reset_clears_all() {
        let mut tracker = SessionTracker::new();
        tracker.connect(1, "a@h1");
        tracker.connect(2, "b@h2");
        assert_eq!(tracker.len(), 2);
        tracker.reset();
        assert!(tracker.is_empty());
    }
}
