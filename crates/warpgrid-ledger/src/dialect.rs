//! SQL dialects and bind-marker rebinding.
//!
//! Statements are written once with positional `?` markers and the
//! portability type tokens `MEDIUMTEXT` / `MEDIUMBLOB`. [`Dialect::rebind`]
//! rewrites them into what the target database expects.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A supported SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `?` markers, `FOR UPDATE` row locks.
    Mysql,
    /// `$1, $2, …` markers, `FOR UPDATE` row locks.
    Postgres,
    /// `?` markers; writers are serialized by the engine, so no row locks.
    Sqlite,
}

impl Dialect {
    /// The configuration tag for this dialect.
    pub fn tag(&self) -> &'static str {
        match self {
            Dialect::Mysql => "mysql",
            Dialect::Postgres => "postgres",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Whether `SELECT … FOR UPDATE` is understood.
    pub fn supports_row_lock(&self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Rewrite a `?`-marker statement into this dialect's syntax.
    ///
    /// Markers are numbered strictly left to right. A literal `?` inside a
    /// quoted string is rewritten too, so statements must not contain one.
    pub fn rebind(&self, query: &str) -> String {
        match self {
            Dialect::Mysql => query.to_string(),
            Dialect::Postgres => {
                let mut out = String::with_capacity(query.len() + 8);
                let mut parts = query.split('?');
                if let Some(first) = parts.next() {
                    out.push_str(first);
                }
                for (i, part) in parts.enumerate() {
                    out.push('$');
                    out.push_str(&(i + 1).to_string());
                    out.push_str(part);
                }
                out.replace("MEDIUMTEXT", "TEXT")
                    .replace("MEDIUMBLOB", "BYTEA")
            }
            Dialect::Sqlite => query
                .replace("MEDIUMTEXT", "TEXT")
                .replace("MEDIUMBLOB", "BLOB"),
        }
    }
}

impl FromStr for Dialect {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mysql" => Ok(Dialect::Mysql),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(LedgerError::Configuration(format!(
                "unrecognized database dialect '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// `?, ?, ?` with `count` markers. Empty for zero.
pub fn question_marks(count: usize) -> String {
    vec!["?"; count].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_leaves_markers_untouched() {
        let sql = "SELECT guid FROM async_table WHERE guid = ? AND pod = ?";
        assert_eq!(Dialect::Mysql.rebind(sql), sql);
    }

    #[test]
    fn postgres_numbers_markers_left_to_right() {
        let sql = "UPDATE t SET a = ?, b = ? WHERE c = ?";
        assert_eq!(
            Dialect::Postgres.rebind(sql),
            "UPDATE t SET a = $1, b = $2 WHERE c = $3"
        );
    }

    #[test]
    fn postgres_handles_trailing_marker_and_no_markers() {
        assert_eq!(Dialect::Postgres.rebind("?"), "$1");
        assert_eq!(Dialect::Postgres.rebind("SELECT 1"), "SELECT 1");
        assert_eq!(Dialect::Postgres.rebind("(?, ?)"), "($1, $2)");
    }

    #[test]
    fn postgres_marker_count_goes_past_nine() {
        let sql = question_marks(11);
        let rebound = Dialect::Postgres.rebind(&sql);
        assert!(rebound.ends_with("$10, $11"), "{rebound}");
        assert!(!rebound.contains('?'));
    }

    #[test]
    fn portability_tokens_are_rewritten() {
        let ddl = "CREATE TABLE x (a MEDIUMTEXT, b MEDIUMBLOB)";
        assert_eq!(
            Dialect::Postgres.rebind(ddl),
            "CREATE TABLE x (a TEXT, b BYTEA)"
        );
        assert_eq!(Dialect::Sqlite.rebind(ddl), "CREATE TABLE x (a TEXT, b BLOB)");
        assert_eq!(Dialect::Mysql.rebind(ddl), ddl);
    }

    #[test]
    fn parse_known_tags() {
        assert_eq!("mysql".parse::<Dialect>().unwrap(), Dialect::Mysql);
        assert_eq!("Postgres".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgres);
        assert_eq!(" sqlite ".parse::<Dialect>().unwrap(), Dialect::Sqlite);
    }

    #[test]
    fn parse_unknown_tag_is_configuration_error() {
        let err = "oracle".parse::<Dialect>().unwrap_err();
        assert!(matches!(err, LedgerError::Configuration(_)));
        assert!(err.to_string().contains("oracle"));
    }

    #[test]
    fn question_marks_counts() {
        assert_eq!(question_marks(0), "");
        assert_eq!(question_marks(1), "?");
        assert_eq!(question_marks(3), "?, ?, ?");
    }

    #[test]
    fn row_lock_support() {
        assert!(Dialect::Mysql.supports_row_lock());
        assert!(Dialect::Postgres.supports_row_lock());
        assert!(!Dialect::Sqlite.supports_row_lock());
    }
}
