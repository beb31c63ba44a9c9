//! SQL clause types (WHERE, ORDER BY) and parameter binding.

use entitymap_core::{Dialect, Value};

/// Collects bound parameters while a statement is rendered.
///
/// In inline mode values are rendered as SQL literals instead, which is only
/// meant for diagnostics output.
#[derive(Debug)]
pub struct Binder {
    dialect: Dialect,
    params: Vec<Value>,
    inline: bool,
}

impl Binder {
    /// Bind values as dialect placeholders.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
            inline: false,
        }
    }

    /// Render values inline as literals.
    pub fn inline(dialect: Dialect) -> Self {
        Self {
            dialect,
            params: Vec::new(),
            inline: true,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Bind a value, returning the text to splice into the statement.
    pub fn bind(&mut self, value: Value) -> String {
        if self.inline {
            return value.to_sql_literal();
        }
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    /// Quote a (possibly qualified) identifier.
    pub fn ident(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    pub fn into_params(self) -> Vec<Value> {
        self.params
    }
}

/// A single WHERE condition. Conditions on one statement are AND-ed.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `column = value` (or `column IS NULL` when the value is NULL)
    Eq { column: String, value: Value },
    /// `column IN (values...)`; an empty list renders as `1 = 0`
    In { column: String, values: Vec<Value> },
    /// `column IS NULL`
    IsNull { column: String },
}

impl Condition {
    /// Render this condition.
    pub fn render(&self, binder: &mut Binder) -> String {
        match self {
            Condition::Eq { column, value } if value.is_null() => {
                format!("{} IS NULL", binder.ident(column))
            }
            Condition::Eq { column, value } => {
                let column = binder.ident(column);
                format!("{column} = {}", binder.bind(value.clone()))
            }
            Condition::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
            Condition::In { column, values } => {
                let column = binder.ident(column);
                let placeholders: Vec<String> =
                    values.iter().map(|v| binder.bind(v.clone())).collect();
                format!("{column} IN ({})", placeholders.join(", "))
            }
            Condition::IsNull { column } => format!("{} IS NULL", binder.ident(column)),
        }
    }
}

/// Render a WHERE clause (including the leading keyword) for `conditions`.
pub fn render_where(conditions: &[Condition], binder: &mut Binder) -> String {
    if conditions.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = conditions.iter().map(|c| c.render(binder)).collect();
    format!(" WHERE {}", parts.join(" AND "))
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// ORDER BY clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    column: String,
    direction: OrderDirection,
}

impl OrderBy {
    /// Create an ascending order by clause.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order by clause.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Generate SQL for this ORDER BY clause.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        let mut sql = dialect.quote_identifier(&self.column);
        sql.push_str(match self.direction {
            OrderDirection::Asc => " ASC",
            OrderDirection::Desc => " DESC",
        });
        sql
    }
}
