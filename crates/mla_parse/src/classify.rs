//! Operation-type and risk-level classification
//!
//! Both classifiers are pure functions: the same inputs always produce the
//! same output. Risk rules are evaluated against an immutable snapshot taken
//! at scan start, never against live shared configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Risk rule validation errors
#[derive(Error, Debug)]
pub enum RuleError {
    #[error("Rule in '{level}' list has neither 'type' nor 'keyword'")]
    EmptyRule { level: &'static str },
}

/// Derived operation tag for a Query statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Dcl,
    Tcl,
    UseDb,
    Other,
}

impl OperationType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Select => "SELECT",
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Ddl => "DDL",
            OperationType::Dcl => "DCL",
            OperationType::Tcl => "TCL",
            OperationType::UseDb => "USE_DB",
            OperationType::Other => "OTHER",
        }
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "SELECT" => Ok(OperationType::Select),
            "INSERT" => Ok(OperationType::Insert),
            "UPDATE" => Ok(OperationType::Update),
            "DELETE" => Ok(OperationType::Delete),
            "DDL" => Ok(OperationType::Ddl),
            "DCL" => Ok(OperationType::Dcl),
            "TCL" => Ok(OperationType::Tcl),
            "USE_DB" => Ok(OperationType::UseDb),
            "OTHER" => Ok(OperationType::Other),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Three-tier risk classification. Absence of a matching rule means Low.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::High => "High",
            RiskLevel::Medium => "Medium",
            RiskLevel::Low => "Low",
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "high" => Ok(RiskLevel::High),
            "medium" => Ok(RiskLevel::Medium),
            "low" => Ok(RiskLevel::Low),
            other => Err(format!("unknown risk level: {other}")),
        }
    }
}

/// One configured risk rule.
///
/// A rule matches a `(operation_type, argument)` pair when the type (if set)
/// equals the operation type case-insensitively AND the keyword (if set)
/// occurs as a case-insensitive substring of the argument. A rule with
/// neither field is rejected at configuration time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskRule {
    /// Operation type to match (e.g. "DDL", "DELETE")
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub op_type: Option<String>,
    /// Substring to match in the statement text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
}

impl RiskRule {
    /// Match against a classified operation and its raw argument.
    #[must_use]
    pub fn matches(&self, operation_type: &str, argument: &str) -> bool {
        let type_match = self
            .op_type
            .as_deref()
            .map_or(true, |t| t.eq_ignore_ascii_case(operation_type));
        let keyword_match = self.keyword.as_deref().map_or(true, |k| {
            argument.to_lowercase().contains(&k.to_lowercase())
        });
        type_match && keyword_match
    }
}

/// Ordered rule lists, evaluated High then Medium then Low; first match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskRuleSet {
    #[serde(rename = "High", default)]
    pub high: Vec<RiskRule>,
    #[serde(rename = "Medium", default)]
    pub medium: Vec<RiskRule>,
    #[serde(rename = "Low", default)]
    pub low: Vec<RiskRule>,
}

impl Default for RiskRuleSet {
    /// Default rules when no configuration is present: destructive writes
    /// and privilege changes are High, in-place mutation is Medium, reads
    /// and plain inserts are Low.
    fn default() -> Self {
        let typed = |t: &str| RiskRule {
            op_type: Some(t.to_string()),
            keyword: None,
        };
        Self {
            high: vec![typed("DELETE"), typed("DDL"), typed("DCL")],
            medium: vec![typed("UPDATE"), typed("TCL")],
            low: vec![typed("SELECT"), typed("INSERT"), typed("USE_DB")],
        }
    }
}

impl RiskRuleSet {
    /// Reject rules with neither a type nor a keyword.
    ///
    /// # Errors
    /// Returns [`RuleError`] naming the offending level.
    pub fn validate(&self) -> Result<(), RuleError> {
        for (level, rules) in [
            ("High", &self.high),
            ("Medium", &self.medium),
            ("Low", &self.low),
        ] {
            if rules
                .iter()
                .any(|r| r.op_type.is_none() && r.keyword.is_none())
            {
                return Err(RuleError::EmptyRule { level });
            }
        }
        Ok(())
    }
}

/// Classify a SQL statement into an operation tag.
///
/// Case-insensitive prefix matching against a fixed priority-ordered table;
/// leading/trailing whitespace is ignored.
#[must_use]
pub fn classify_operation(sql: &str) -> OperationType {
    let upper = sql.trim().to_uppercase();
    const TABLE: &[(&[&str], OperationType)] = &[
        (&["SELECT", "SHOW", "DESC", "EXPLAIN"], OperationType::Select),
        (&["INSERT", "REPLACE"], OperationType::Insert),
        (&["UPDATE"], OperationType::Update),
        (&["DELETE"], OperationType::Delete),
        (&["CREATE", "ALTER", "DROP", "TRUNCATE"], OperationType::Ddl),
        (&["GRANT", "REVOKE", "SET PASSWORD"], OperationType::Dcl),
        (
            &["COMMIT", "ROLLBACK", "START TRANSACTION", "SAVEPOINT"],
            OperationType::Tcl,
        ),
        (&["USE "], OperationType::UseDb),
    ];
    for (prefixes, op) in TABLE {
        if prefixes.iter().any(|p| upper.starts_with(p)) {
            return *op;
        }
    }
    OperationType::Other
}

/// Classify the risk of an operation against an ordered rule set.
///
/// `operation_type` is the string tag stored on the record (either a derived
/// tag or an upper-cased raw command). No match means [`RiskLevel::Low`].
#[must_use]
pub fn classify_risk(operation_type: &str, argument: &str, rules: &RiskRuleSet) -> RiskLevel {
    for (level, list) in [
        (RiskLevel::High, &rules.high),
        (RiskLevel::Medium, &rules.medium),
        (RiskLevel::Low, &rules.low),
    ] {
        if list.iter().any(|r| r.matches(operation_type, argument)) {
            return level;
        }
    }
    RiskLevel::Low
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_operation_prefix_table() {
        assert_eq!(classify_operation("SELECT 1"), OperationType::Select);
        assert_eq!(classify_operation("  show tables"), OperationType::Select);
        assert_eq!(classify_operation("explain select 1"), OperationType::Select);
        assert_eq!(classify_operation("REPLACE INTO t VALUES (1)"), OperationType::Insert);
        assert_eq!(classify_operation("update t set a=1"), OperationType::Update);
        assert_eq!(classify_operation("DELETE FROM t"), OperationType::Delete);
        assert_eq!(classify_operation("truncate table t"), OperationType::Ddl);
        assert_eq!(classify_operation("SET PASSWORD FOR u = 'x'"), OperationType::Dcl);
        assert_eq!(classify_operation("start transaction"), OperationType::Tcl);
        assert_eq!(classify_operation("use mydb"), OperationType::UseDb);
        assert_eq!(classify_operation("FLUSH PRIVILEGES"), OperationType::Other);
    }

    #[test]
    fn test_use_requires_trailing_space() {
        // "USER()" must not classify as USE_DB
        assert_eq!(classify_operation("USER()"), OperationType::Other);
    }

    #[test]
    fn test_risk_priority_high_wins() {
        let rules = RiskRuleSet {
            high: vec![RiskRule {
                op_type: Some("DDL".to_string()),
                keyword: None,
            }],
            medium: vec![RiskRule {
                op_type: Some("DDL".to_string()),
                keyword: Some("table".to_string()),
            }],
            low: vec![RiskRule {
                op_type: Some("DDL".to_string()),
                keyword: None,
            }],
        };
        assert_eq!(
            classify_risk("DDL", "DROP TABLE accounts", &rules),
            RiskLevel::High
        );
    }

    #[test]
    fn test_risk_keyword_substring_case_insensitive() {
        let rules = RiskRuleSet {
            high: vec![RiskRule {
                op_type: None,
                keyword: Some("accounts".to_string()),
            }],
            medium: vec![],
            low: vec![],
        };
        assert_eq!(
            classify_risk("SELECT", "select * from ACCOUNTS", &rules),
            RiskLevel::High
        );
        assert_eq!(
            classify_risk("SELECT", "select * from users", &rules),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_risk_type_and_keyword_both_required() {
        let rules = RiskRuleSet {
            high: vec![RiskRule {
                op_type: Some("DELETE".to_string()),
                keyword: Some("orders".to_string()),
            }],
            medium: vec![],
            low: vec![],
        };
        assert_eq!(
            classify_risk("DELETE", "delete from orders", &rules),
            RiskLevel::High
        );
        assert_eq!(
            classify_risk("DELETE", "delete from users", &rules),
            RiskLevel::Low
        );
        assert_eq!(
            classify_risk("SELECT", "select * from orders", &rules),
            RiskLevel::Low
        );
    }

    #[test]
    fn test_risk_defaults_to_low() {
        let rules = RiskRuleSet {
            high: vec![],
            medium: vec![],
            low: vec![],
        };
        assert_eq!(classify_risk("OTHER", "anything", &rules), RiskLevel::Low);
    }

    #[test]
    fn test_default_rules_classify_ddl_high() {
        let rules = RiskRuleSet::default();
        assert_eq!(classify_risk("DDL", "DROP TABLE t", &rules), RiskLevel::High);
        assert_eq!(classify_risk("UPDATE", "UPDATE t SET a=1", &rules), RiskLevel::Medium);
        assert_eq!(classify_risk("SELECT", "SELECT 1", &rules), RiskLevel::Low);
    }

    #[test]
    fn test_rule_set_validation_rejects_empty_rule() {
        let rules = RiskRuleSet {
            high: vec![],
            medium: vec![RiskRule::default()],
            low: vec![],
        };
        let err = rules.validate().unwrap_err();
        assert!(err.to_string().contains("Medium"));
        assert!(RiskRuleSet::default().validate().is_ok());
    }

    #[test]
    fn test_rule_set_json_shape() {
        let json = r#"{"High":[{"type":"DDL"}],"Medium":[{"keyword":"payroll"}]}"#;
        let rules: RiskRuleSet = serde_json::from_str(json).unwrap();
        assert_eq!(rules.high.len(), 1);
        assert_eq!(rules.medium[0].keyword.as_deref(), Some("payroll"));
        assert!(rules.low.is_empty());
    }

    #[test]
    fn test_risk_level_round_trip() {
        for level in [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
            assert_eq!(level.as_str().parse::<RiskLevel>().unwrap(), level);
        }
        assert!("severe".parse::<RiskLevel>().is_err());
    }
}
