//! SQL dialect differences the statement builder has to respect.

use serde::{Deserialize, Serialize};

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Qualified names (`alias.column`) are quoted per segment. Embedded quote
    /// characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        name.split('.')
            .map(|part| self.quote_part(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quote a name that must stay a single identifier even if it contains dots,
    /// such as a result column alias like `"a.id"`.
    pub fn quote_alias(self, name: &str) -> String {
        self.quote_part(name)
    }

    fn quote_part(self, part: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = part.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = part.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }

    /// Whether each member of a UNION that carries its own clauses must be
    /// wrapped in a sub-select.
    ///
    /// SQLite rejects `ORDER BY`/`LIMIT` on compound-select members, so the
    /// per-key restriction union wraps every member as
    /// `SELECT * FROM (...) AS "u0"`.
    pub const fn wraps_union_members(self) -> bool {
        matches!(self, Dialect::Sqlite)
    }
}
