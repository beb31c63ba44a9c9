//! Identity map, hydration and unit of work for entitymap.
//!
//! `entitymap-session` is the **object-graph layer**. It keeps an in-memory
//! graph of entities consistent with relational storage across reads and
//! writes.
//!
//! # Role In The Architecture
//!
//! - **Hydrator**: rebuilds entity graphs from flat, aliased rows using a tree
//!   of recipes, collapsing rows repeated by join fan-out.
//! - **Identity map**: one instance per (entity, primary key) per session.
//! - **Unit of work**: lifecycle state of every entity, staged relationship
//!   edges, persist cascades and the commit protocol.
//! - **Query**: one statement plus child queries restricted to parent keys.
//!
//! # Design Philosophy
//!
//! - **Explicit state table**: lifecycle state lives in the unit of work,
//!   never on the entity itself.
//! - **Arena recipes**: recipe trees link parents and children by index.
//! - **All or nothing**: a commit either commits every store it touched or
//!   rolls every one of them back.
//! - **Cancel-correct**: All async operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(registry);
//! let stores = Stores::single(connection);
//!
//! let author = EntityRef::new("Author").with("name", "Ursula K. Le Guin");
//! let book = EntityRef::new("Book").with("title", "The Dispossessed");
//! book.set_related("author", Some(author.clone()));
//!
//! // `Book.author` cascades persist, so the author is inserted too
//! session.persist(&book)?;
//! let summary = session.commit(&cx, &stores).await?;
//! ```

pub mod config;
pub mod entity;
pub mod flush;
pub mod hydrator;
pub mod identity_map;
pub mod lifecycle;
pub mod query;
pub mod recipe;
pub mod session;
pub mod store;
pub mod unit_of_work;

pub use config::{
    CommitOptions, LOG_SQL_ENV, QueryOptions, SessionConfig, query_logging_enabled,
    set_query_logging,
};
pub use entity::{ChangeFeed, EntityId, EntityRef, Mutation, RelationChange, RelationValue};
pub use flush::{
    LinkTableOp, PendingWrite, RelationshipOp, Transactions, WriteDone, WriteKind, column_value,
    refresh_entity,
};
pub use hydrator::{HydrationContext, Hydrator};
pub use identity_map::IdentityMap;
pub use lifecycle::{HookKind, HookRegistry, LifecycleHooks, QueuedHook};
pub use query::{ParentRestriction, Query};
pub use recipe::{Catalogue, JoinType, Recipe, RecipeId, RecipeTree};
pub use session::{Session, SessionDebugInfo};
pub use store::Stores;
pub use unit_of_work::{CommitSummary, EntityState, PendingCounts, StateRecord, UnitOfWork};
