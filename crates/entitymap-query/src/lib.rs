//! SQL statement builder for entitymap.
//!
//! `entitymap-query` renders the handful of statements the mapping layer
//! issues: aliased/joined SELECTs (with per-key UNION restriction), and the
//! INSERT, UPDATE and DELETE statements of a commit. Statements render to SQL
//! plus bound parameters for a given [`Dialect`], or to a diagnostics string
//! with values inlined.

pub mod clause;
pub mod select;
pub mod write;

pub use clause::{Binder, Condition, OrderBy, OrderDirection};
pub use select::Select;
pub use write::{Delete, Insert, Update};

use entitymap_core::{Dialect, Value};

/// A renderable SQL statement.
pub trait Statement {
    /// Render the statement, binding values through `binder`.
    fn render(&self, binder: &mut Binder) -> String;

    /// Build the SQL and parameters for `dialect`.
    fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut binder = Binder::new(dialect);
        let sql = self.render(&mut binder);
        (sql, binder.into_params())
    }

    /// Render with values inlined as literals, for logs and diagnostics.
    fn to_sql_string(&self, dialect: Dialect) -> String {
        let mut binder = Binder::inline(dialect);
        self.render(&mut binder)
    }
}
