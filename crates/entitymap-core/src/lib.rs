//! Core types and traits for entitymap.
//!
//! This crate provides the foundations the mapping layer is built on:
//!
//! - `Value` and `Row` for dynamically-typed query results
//! - `Connection`/`TransactionOps` for the driver boundary
//! - `Mapping`/`Relation`/`Metadata` describing entity-to-table mappings
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod error;
pub mod metadata;
pub mod row;
pub mod value;

pub use connection::{Connection, TransactionOps};
pub use dialect::Dialect;
pub use error::{
    ConnectionError, ConnectionErrorKind, Error, LifecycleError, LifecycleErrorKind, MappingError,
    QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind,
};
pub use metadata::{
    FieldMapping, JoinColumn, JoinTable, Mapping, MappingRegistry, Metadata, Relation,
    RelationKind,
};
pub use row::{ColumnInfo, Row};
pub use value::{KeyValue, Value};

/// Unwrap an `Outcome::Ok` or return the non-ok outcome from the enclosing
/// function.
///
/// `Err` is converted with `From`, so a `Result`-style error enum can be
/// propagated into an `Outcome<_, Error>` function.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(value) => value,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(::core::convert::From::from(e)),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result::Ok` or return `Outcome::Err` from the enclosing function.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            ::core::result::Result::Ok(value) => value,
            ::core::result::Result::Err(e) => {
                return $crate::Outcome::Err(::core::convert::From::from(e));
            }
        }
    };
}
