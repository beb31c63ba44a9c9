//! SELECT query builder.

use crate::Statement;
use crate::clause::{Binder, Condition, OrderBy, render_where};
use entitymap_core::Value;

/// One entry of the select list.
#[derive(Debug, Clone, PartialEq)]
enum SelectColumn {
    /// A (possibly qualified) column reference.
    Column { name: String, alias: Option<String> },
    /// Raw SQL expression such as `COUNT(*)`.
    Raw { sql: String, alias: Option<String> },
}

/// `LEFT JOIN table AS alias ON left = right`.
#[derive(Debug, Clone, PartialEq)]
struct LeftJoin {
    table: String,
    alias: String,
    left: String,
    right: String,
}

/// A SELECT query builder.
///
/// Selects are cheap to clone; the parent-key restriction clones one select
/// per key and unions them.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    table: String,
    alias: Option<String>,
    columns: Vec<SelectColumn>,
    joins: Vec<LeftJoin>,
    conditions: Vec<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    unions: Vec<Select>,
}

impl Select {
    /// Create a new SELECT query over `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            columns: Vec::new(),
            joins: Vec::new(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            unions: Vec::new(),
        }
    }

    /// Alias the FROM table.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Select a column under its own name.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.columns.push(SelectColumn::Column {
            name: name.into(),
            alias: None,
        });
        self
    }

    /// Select a column under a result alias (e.g. `a.id AS "a.id"`).
    pub fn column_as(mut self, name: impl Into<String>, alias: impl Into<String>) -> Self {
        self.columns.push(SelectColumn::Column {
            name: name.into(),
            alias: Some(alias.into()),
        });
        self
    }

    /// Select a raw SQL expression, e.g. `COUNT(*)`.
    pub fn raw_column(mut self, sql: impl Into<String>, alias: Option<&str>) -> Self {
        self.columns.push(SelectColumn::Raw {
            sql: sql.into(),
            alias: alias.map(str::to_string),
        });
        self
    }

    /// Add a LEFT JOIN.
    pub fn left_join(
        mut self,
        table: impl Into<String>,
        alias: impl Into<String>,
        left: impl Into<String>,
        right: impl Into<String>,
    ) -> Self {
        self.joins.push(LeftJoin {
            table: table.into(),
            alias: alias.into(),
            left: left.into(),
            right: right.into(),
        });
        self
    }

    /// Add a `column = value` filter.
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Add a `column IN (...)` filter.
    pub fn where_in(mut self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(Condition::In {
            column: column.into(),
            values,
        });
        self
    }

    /// Add a `column IS NULL` filter.
    pub fn where_null(mut self, column: impl Into<String>) -> Self {
        self.conditions.push(Condition::IsNull {
            column: column.into(),
        });
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Append `other` as a UNION member.
    pub fn union(mut self, other: Select) -> Self {
        self.unions.push(other);
        self
    }

    /// The FROM table.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The FROM alias, or the table name when unaliased.
    pub fn source_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// WHERE conditions on this select (not its union members).
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Whether this select carries UNION members.
    pub fn is_union(&self) -> bool {
        !self.unions.is_empty()
    }

    fn render_core(&self, binder: &mut Binder) -> String {
        let columns = if self.columns.is_empty() {
            "*".to_string()
        } else {
            let dialect = binder.dialect();
            self.columns
                .iter()
                .map(|c| {
                    let (expr, alias) = match c {
                        SelectColumn::Column { name, alias } => (binder.ident(name), alias),
                        SelectColumn::Raw { sql, alias } => (sql.clone(), alias),
                    };
                    match alias {
                        Some(alias) => format!("{expr} AS {}", dialect.quote_alias(alias)),
                        None => expr,
                    }
                })
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!("SELECT {columns} FROM {}", binder.ident(&self.table));
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&binder.ident(alias));
        }

        for join in &self.joins {
            sql.push_str(&format!(
                " LEFT JOIN {} AS {} ON {} = {}",
                binder.ident(&join.table),
                binder.ident(&join.alias),
                binder.ident(&join.left),
                binder.ident(&join.right)
            ));
        }

        sql.push_str(&render_where(&self.conditions, binder));

        if !self.order_by.is_empty() {
            let dialect = binder.dialect();
            let orders: Vec<String> = self.order_by.iter().map(|o| o.to_sql(dialect)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        sql
    }
}

impl Statement for Select {
    fn render(&self, binder: &mut Binder) -> String {
        if self.unions.is_empty() {
            return self.render_core(binder);
        }

        let wrap = binder.dialect().wraps_union_members();
        let mut members = Vec::with_capacity(self.unions.len() + 1);
        members.push(self.render_core(binder));
        for member in &self.unions {
            members.push(member.render(binder));
        }

        members
            .into_iter()
            .enumerate()
            .map(|(i, member)| {
                if wrap {
                    format!("SELECT * FROM ({member}) AS {}", binder.ident(&format!("u{i}")))
                } else {
                    format!("({member})")
                }
            })
            .collect::<Vec<_>>()
            .join(" UNION ")
    }
}
