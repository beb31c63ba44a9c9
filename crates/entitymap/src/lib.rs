//! entitymap - the transactional core of an object-relational mapper.
//!
//! entitymap keeps an in-memory graph of entities consistent with a
//! relational store:
//!
//! - Join-tree hydration of flat rows into nested entity graphs
//! - An identity map guaranteeing one instance per row per session
//! - A unit of work tracking new, dirty and deleted entities plus staged
//!   relationship edges
//! - Cascaded persistence and a commit that spans several stores, with one
//!   transaction per store and rollback of all of them on failure
//!
//! # Quick Start
//!
//! ```ignore
//! use entitymap::prelude::*;
//!
//! let registry = MappingRegistry::new()
//!     .with(Mapping::new("Author", "authors").field("name"))
//!     .with(
//!         Mapping::new("Book", "books").field("title").relation(
//!             Relation::many_to_one("author", "Author", JoinColumn::new("author_id", "id"))
//!                 .cascade_persist(true),
//!         ),
//!     );
//!
//! async fn example(cx: &Cx, stores: &Stores<impl Connection>, registry: MappingRegistry) {
//!     let mut session = Session::new(registry);
//!
//!     let author = EntityRef::new("Author").with("name", "N. K. Jemisin");
//!     let book = EntityRef::new("Book").with("title", "The Fifth Season");
//!     book.set_related("author", Some(author.clone()));
//!
//!     // Inserts the author, the book, then points books.author_id at the author
//!     session.persist(&book).unwrap();
//!     session.commit(cx, stores).await.unwrap();
//!
//!     // Tracked after commit: this becomes an UPDATE of `title` only
//!     book.set("title", "The Obelisk Gate");
//!     session.commit(cx, stores).await.unwrap();
//! }
//! ```
//!
//! # Features
//!
//! - **Structured concurrency**: Built on asupersync for cancel-correct operations
//! - **Concurrent phases**: writes within a commit phase are issued together
//! - **Split fetches**: child queries load collections without join fan-out

// Re-export all public types from sub-crates
pub use entitymap_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    ColumnInfo,
    Connection,
    Dialect,
    Error,
    KeyValue,
    LifecycleError,
    LifecycleErrorKind,
    Result,
    Row,
    TransactionOps,
    Value,
    // Mapping metadata
    FieldMapping,
    JoinColumn,
    JoinTable,
    Mapping,
    MappingRegistry,
    Metadata,
    Relation,
    RelationKind,
};

pub use entitymap_query::{Delete, Insert, OrderBy, Select, Statement, Update};

pub use entitymap_session::{
    Catalogue, CommitOptions, CommitSummary, EntityId, EntityRef, EntityState, HydrationContext,
    Hydrator, IdentityMap, JoinType, LifecycleHooks, ParentRestriction, PendingCounts, Query,
    QueryOptions, RelationChange, RelationValue, Session, SessionConfig, SessionDebugInfo, Stores,
    UnitOfWork, query_logging_enabled, set_query_logging,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use entitymap::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Runtime
        Connection,
        Cx,
        Error,
        Outcome,
        // Mapping metadata
        JoinColumn,
        JoinTable,
        Mapping,
        MappingRegistry,
        Metadata,
        Relation,
        // Entities and sessions
        CommitOptions,
        EntityRef,
        EntityState,
        Hydrator,
        JoinType,
        LifecycleHooks,
        Query,
        QueryOptions,
        Select,
        Session,
        Stores,
        Value,
    };
}
