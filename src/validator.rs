//! SQL safety validation
//!
//! Lexical blocklist checks on generated SQL before anything reaches the
//! database: SELECT-only, no DDL/DML keywords, no comment sequences. This
//! is a blocklist defense, not a parser — it cannot catch every injection
//! technique, and it does not verify that the tenant filter the prompt
//! mandates is actually present (see `enforce_tenant_scope`).

use lazy_static::lazy_static;
use regex::Regex;
use std::fmt;

/// Keywords rejected anywhere in a statement, matched as whole words so
/// that column names like `IsDeleted` do not trip the `DELETE` rule.
pub const FORBIDDEN_KEYWORDS: [&str; 23] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "EXEC", "EXECUTE",
    "SP_", "XP_", "OPENROWSET", "BULK", "MERGE", "GRANT", "REVOKE", "DENY", "BACKUP", "RESTORE",
    "SHUTDOWN", "DBCC", "KILL", "WAITFOR",
];

/// Why a statement was rejected. Exposed so callers can log the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlRejection {
    Empty,
    NotSelect,
    ForbiddenKeyword(String),
    CommentSequence(&'static str),
    MissingTenantScope,
}

impl fmt::Display for SqlRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlRejection::Empty => write!(f, "empty query"),
            SqlRejection::NotSelect => write!(f, "query must start with SELECT"),
            SqlRejection::ForbiddenKeyword(keyword) => {
                write!(f, "forbidden keyword detected: {}", keyword)
            }
            SqlRejection::CommentSequence(sequence) => {
                write!(f, "SQL comment sequence detected: {}", sequence)
            }
            SqlRejection::MissingTenantScope => {
                write!(f, "query does not reference the tenant filter")
            }
        }
    }
}

impl std::error::Error for SqlRejection {}

lazy_static! {
    static ref KEYWORD_PATTERNS: Vec<(&'static str, Regex)> = FORBIDDEN_KEYWORDS
        .iter()
        .map(|keyword| {
            (
                *keyword,
                Regex::new(&format!(r"\b{}\b", keyword)).unwrap(),
            )
        })
        .collect();
}

/// Validate a generated statement. Rules apply in order and short-circuit
/// on the first failure.
pub fn validate(sql: &str) -> Result<(), SqlRejection> {
    if sql.trim().is_empty() {
        return Err(SqlRejection::Empty);
    }

    let upper = sql.to_uppercase();
    let upper = upper.trim();

    if !upper.starts_with("SELECT") {
        return Err(SqlRejection::NotSelect);
    }

    for (keyword, pattern) in KEYWORD_PATTERNS.iter() {
        if pattern.is_match(upper) {
            return Err(SqlRejection::ForbiddenKeyword((*keyword).to_string()));
        }
    }

    for sequence in ["--", "/*", "*/"] {
        if upper.contains(sequence) {
            return Err(SqlRejection::CommentSequence(sequence));
        }
    }

    Ok(())
}

/// Optional hardening beyond the lexical blocklist: require the statement
/// to reference the tenant filter parameter the prompt mandates. Callers
/// opt in via configuration.
pub fn enforce_tenant_scope(sql: &str, application_id: i32) -> Result<(), SqlRejection> {
    if sql.contains("@ApplicationId")
        || sql.contains(&format!("ApplicationId = {}", application_id))
    {
        Ok(())
    } else {
        Err(SqlRejection::MissingTenantScope)
    }
}
