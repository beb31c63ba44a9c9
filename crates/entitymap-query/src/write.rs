//! Query builders for INSERT, UPDATE, DELETE operations.

use crate::Statement;
use crate::clause::{Binder, Condition, render_where};
use entitymap_core::Value;

/// INSERT query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    table: String,
    values: Vec<(String, Value)>,
}

impl Insert {
    /// Create a new INSERT into `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            values: Vec::new(),
        }
    }

    /// Set a column value.
    pub fn value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl Statement for Insert {
    fn render(&self, binder: &mut Binder) -> String {
        if self.values.is_empty() {
            return format!("INSERT INTO {} DEFAULT VALUES", binder.ident(&self.table));
        }
        let columns: Vec<String> = self.values.iter().map(|(c, _)| binder.ident(c)).collect();
        let placeholders: Vec<String> = self
            .values
            .iter()
            .map(|(_, v)| binder.bind(v.clone()))
            .collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            binder.ident(&self.table),
            columns.join(", "),
            placeholders.join(", ")
        )
    }
}

/// UPDATE query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    table: String,
    sets: Vec<(String, Value)>,
    conditions: Vec<Condition>,
}

impl Update {
    /// Create a new UPDATE of `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sets: Vec::new(),
            conditions: Vec::new(),
        }
    }

    /// Add a `column = value` assignment.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push((column.into(), value.into()));
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

    /// Whether the update assigns anything.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

impl Statement for Update {
    fn render(&self, binder: &mut Binder) -> String {
        let sets: Vec<String> = self
            .sets
            .iter()
            .map(|(c, v)| {
                let column = binder.ident(c);
                format!("{column} = {}", binder.bind(v.clone()))
            })
            .collect();
        let mut sql = format!("UPDATE {} SET {}", binder.ident(&self.table), sets.join(", "));
        sql.push_str(&render_where(&self.conditions, binder));
        sql
    }
}

/// DELETE query builder.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    table: String,
    conditions: Vec<Condition>,
}

impl Delete {
    /// Create a new DELETE from `table`.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            conditions: Vec::new(),
        }
    }

    /// Add a `column = value` filter.
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq {
            column: column.into(),
            value: value.into(),
        });
        self
    }
}

impl Statement for Delete {
    fn render(&self, binder: &mut Binder) -> String {
        let mut sql = format!("DELETE FROM {}", binder.ident(&self.table));
        sql.push_str(&render_where(&self.conditions, binder));
        sql
    }
}
