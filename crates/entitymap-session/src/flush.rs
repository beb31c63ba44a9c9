//! Commit-phase write plans and per-store transactions.
//!
//! A commit is executed as four strictly ordered phases (inserts, updates,
//! deletes, relationship writes). Each phase is a list of [`PendingWrite`]s
//! that is issued concurrently once every store the phase touches has an open
//! transaction. [`Transactions`] opens at most one transaction per store per
//! commit and commits or rolls them all back together.

use crate::config::query_logging_enabled;
use crate::entity::EntityRef;
use crate::store::Stores;
use asupersync::{Cx, Outcome};
use entitymap_core::{
    Connection, Dialect, Error, Mapping, TransactionError, TransactionOps, Value, try_outcome,
    try_result,
};
use entitymap_query::{Delete, Insert, Select, Statement, Update};
use futures::future::join_all;
use std::collections::HashMap;

/// Which commit phase a write belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    Relationship,
}

/// One rendered statement scheduled against one store.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub store: String,
    pub kind: WriteKind,
    /// Entity the write persists; `None` for relationship writes.
    pub entity: Option<EntityRef>,
    pub sql: String,
    pub params: Vec<Value>,
}

impl PendingWrite {
    /// Render `statement` for `dialect`.
    pub fn new(
        store: impl Into<String>,
        kind: WriteKind,
        entity: Option<EntityRef>,
        statement: &impl Statement,
        dialect: Dialect,
    ) -> Self {
        let (sql, params) = statement.build(dialect);
        Self {
            store: store.into(),
            kind,
            entity,
            sql,
            params,
        }
    }
}

/// What a successful write reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteDone {
    /// Generated id returned by an insert.
    Inserted(i64),
    /// Rows affected by any other statement.
    Affected(u64),
}

/// A pending link table operation (for many-to-many relationships).
#[derive(Debug, Clone, PartialEq)]
pub enum LinkTableOp {
    /// Insert a link row.
    Link {
        /// Link table name.
        table: String,
        /// Owning side column name.
        local_column: String,
        /// Owning side value.
        local_value: Value,
        /// Inverse side column name.
        remote_column: String,
        /// Inverse side value.
        remote_value: Value,
    },
    /// Delete a link row.
    Unlink {
        /// Link table name.
        table: String,
        /// Owning side column name.
        local_column: String,
        /// Owning side value.
        local_value: Value,
        /// Inverse side column name.
        remote_column: String,
        /// Inverse side value.
        remote_value: Value,
    },
}

impl LinkTableOp {
    /// Create a link operation.
    pub fn link(
        table: impl Into<String>,
        local_column: impl Into<String>,
        local_value: Value,
        remote_column: impl Into<String>,
        remote_value: Value,
    ) -> Self {
        Self::Link {
            table: table.into(),
            local_column: local_column.into(),
            local_value,
            remote_column: remote_column.into(),
            remote_value,
        }
    }

    /// Create an unlink operation.
    pub fn unlink(
        table: impl Into<String>,
        local_column: impl Into<String>,
        local_value: Value,
        remote_column: impl Into<String>,
        remote_value: Value,
    ) -> Self {
        Self::Unlink {
            table: table.into(),
            local_column: local_column.into(),
            local_value,
            remote_column: remote_column.into(),
            remote_value,
        }
    }

    /// Get the table name.
    pub fn table(&self) -> &str {
        match self {
            LinkTableOp::Link { table, .. } | LinkTableOp::Unlink { table, .. } => table,
        }
    }

    /// Check if this is a link (insert) operation.
    pub fn is_link(&self) -> bool {
        matches!(self, LinkTableOp::Link { .. })
    }

    /// Render the INSERT or DELETE for `dialect`.
    pub fn build(&self, dialect: Dialect) -> (String, Vec<Value>) {
        match self {
            LinkTableOp::Link {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => Insert::new(table.clone())
                .value(local_column.clone(), local_value.clone())
                .value(remote_column.clone(), remote_value.clone())
                .build(dialect),
            LinkTableOp::Unlink {
                table,
                local_column,
                local_value,
                remote_column,
                remote_value,
            } => Delete::new(table.clone())
                .where_eq(local_column.clone(), local_value.clone())
                .where_eq(remote_column.clone(), remote_value.clone())
                .build(dialect),
        }
    }
}

/// A relationship write derived from a staged edge.
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipOp {
    /// `UPDATE table SET column = value WHERE key_column = key_value`.
    ForeignKey {
        store: String,
        table: String,
        column: String,
        /// `Null` when the edge was removed.
        value: Value,
        key_column: String,
        key_value: Value,
    },
    /// Join-table row insert or delete.
    LinkTable { store: String, op: LinkTableOp },
}

impl RelationshipOp {
    pub fn store(&self) -> &str {
        match self {
            RelationshipOp::ForeignKey { store, .. } | RelationshipOp::LinkTable { store, .. } => {
                store
            }
        }
    }

    /// Whether this write detaches rows (null FK or join-table delete).
    pub fn is_detach(&self) -> bool {
        match self {
            RelationshipOp::ForeignKey { value, .. } => value.is_null(),
            RelationshipOp::LinkTable { op, .. } => !op.is_link(),
        }
    }

    /// Render into a pending write.
    pub fn to_write(&self, dialect: Dialect) -> PendingWrite {
        let (sql, params) = match self {
            RelationshipOp::ForeignKey {
                table,
                column,
                value,
                key_column,
                key_value,
                ..
            } => Update::new(table.clone())
                .set(column.clone(), value.clone())
                .where_eq(key_column.clone(), key_value.clone())
                .build(dialect),
            RelationshipOp::LinkTable { op, .. } => op.build(dialect),
        };
        PendingWrite {
            store: self.store().to_string(),
            kind: WriteKind::Relationship,
            entity: None,
            sql,
            params,
        }
    }
}

/// Split an outcome into its value or a failure re-typed for the caller.
pub(crate) fn split<T, U>(outcome: Outcome<T, Error>) -> Result<T, Outcome<U, Error>> {
    match outcome {
        Outcome::Ok(value) => Ok(value),
        Outcome::Err(e) => Err(Outcome::Err(e)),
        Outcome::Cancelled(r) => Err(Outcome::Cancelled(r)),
        Outcome::Panicked(p) => Err(Outcome::Panicked(p)),
    }
}

/// Transactions opened during one commit, at most one per store.
pub struct Transactions<'c, C: Connection + 'c> {
    stores: &'c Stores<C>,
    open: HashMap<String, C::Tx<'c>>,
    /// Stores in the order their transaction was opened.
    order: Vec<String>,
}

impl<'c, C: Connection + 'c> Transactions<'c, C> {
    pub fn new(stores: &'c Stores<C>) -> Self {
        Self {
            stores,
            open: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// The stores transactions are opened against.
    pub fn backing(&self) -> &'c Stores<C> {
        self.stores
    }

    pub fn is_open(&self, store: &str) -> bool {
        self.open.contains_key(store)
    }

    /// Stores with an open transaction, in opening order.
    pub fn stores(&self) -> &[String] {
        &self.order
    }

    /// Open the transaction for `store` unless it is already open.
    pub async fn ensure(&mut self, cx: &Cx, store: &str) -> Outcome<(), Error> {
        if self.open.contains_key(store) {
            return Outcome::Ok(());
        }
        let stores = self.stores;
        let conn = try_result!(stores.get(Some(store)));
        tracing::debug!(store = store, "Opening store transaction");
        let tx = try_outcome!(conn.begin(cx).await);
        self.open.insert(store.to_string(), tx);
        self.order.push(store.to_string());
        Outcome::Ok(())
    }

    /// Issue one write inside its store's transaction.
    async fn run(&self, cx: &Cx, write: &PendingWrite) -> Outcome<WriteDone, Error> {
        let Some(tx) = self.open.get(&write.store) else {
            return Outcome::Err(Error::Custom(format!(
                "no transaction open for store '{}'",
                write.store
            )));
        };
        if query_logging_enabled() {
            tracing::debug!(store = %write.store, sql = %write.sql, params = ?write.params, "Executing statement");
        } else {
            tracing::trace!(store = %write.store, kind = ?write.kind, "Executing statement");
        }
        match write.kind {
            WriteKind::Insert => tx
                .insert(cx, &write.sql, &write.params)
                .await
                .map(WriteDone::Inserted),
            _ => tx
                .execute(cx, &write.sql, &write.params)
                .await
                .map(WriteDone::Affected),
        }
    }

    /// Execute one phase: open any missing transactions, then issue every
    /// write concurrently.
    ///
    /// The returned outcomes are in plan order; failures of individual writes
    /// are reported there rather than short-circuiting the phase.
    #[tracing::instrument(level = "debug", skip_all, fields(writes = writes.len()))]
    pub async fn execute_phase(
        &mut self,
        cx: &Cx,
        writes: &[PendingWrite],
    ) -> Outcome<Vec<Outcome<WriteDone, Error>>, Error> {
        for write in writes {
            try_outcome!(self.ensure(cx, &write.store).await);
        }
        let this = &*self;
        let results = join_all(writes.iter().map(|write| this.run(cx, write))).await;
        Outcome::Ok(results)
    }

    /// Commit every open transaction in opening order.
    ///
    /// If one store refuses to commit, the transactions not yet committed are
    /// rolled back. A refusal from the first store is returned unchanged; a
    /// later one becomes a [`entitymap_core::TransactionErrorKind::PartialCommit`] naming the
    /// stores that did commit, since those writes can no longer be undone.
    #[tracing::instrument(level = "debug", skip_all, fields(stores = self.order.len()))]
    pub async fn commit_all(mut self, cx: &Cx) -> Outcome<(), Error> {
        let order = std::mem::take(&mut self.order);
        let mut pending = order.into_iter();
        let mut committed = Vec::new();
        while let Some(store) = pending.next() {
            let Some(tx) = self.open.remove(&store) else {
                continue;
            };
            match tx.commit(cx).await {
                Outcome::Ok(()) => {
                    tracing::debug!(store = %store, "Store transaction committed");
                    committed.push(store);
                }
                failure => {
                    tracing::warn!(
                        store = %store,
                        committed = ?committed,
                        "Store commit failed, rolling back the rest"
                    );
                    self.order = pending.collect();
                    self.rollback_all(cx).await;
                    return match failure {
                        Outcome::Err(e) if !committed.is_empty() => Outcome::Err(Error::from(
                            TransactionError::partial_commit(&store, committed, e),
                        )),
                        failure => failure,
                    };
                }
            }
        }
        Outcome::Ok(())
    }

    /// Roll back every open transaction. Failures are logged and ignored.
    #[tracing::instrument(level = "debug", skip_all, fields(stores = self.order.len()))]
    pub async fn rollback_all(mut self, cx: &Cx) {
        for store in std::mem::take(&mut self.order) {
            let Some(tx) = self.open.remove(&store) else {
                continue;
            };
            match tx.rollback(cx).await {
                Outcome::Ok(()) => tracing::debug!(store = %store, "Store transaction rolled back"),
                Outcome::Err(e) => {
                    tracing::warn!(store = %store, error = %e, "Rollback failed");
                }
                Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                    tracing::warn!(store = %store, "Rollback did not complete");
                }
            }
        }
    }
}

/// Value of the property mapped to `column`, or `Null`.
pub fn column_value(entity: &EntityRef, mapping: &Mapping, column: &str) -> Value {
    mapping
        .field_by_column(column)
        .and_then(|field| entity.get(&field.property))
        .unwrap_or(Value::Null)
}

/// Re-read `entity`'s mapped fields from storage by primary key.
///
/// Returns `false` when the entity has no key or the row no longer exists.
/// Values are written without reporting mutations.
#[tracing::instrument(level = "debug", skip_all, fields(entity = %mapping.entity))]
pub async fn refresh_entity<C: Connection>(
    cx: &Cx,
    stores: &Stores<C>,
    mapping: &Mapping,
    entity: &EntityRef,
) -> Outcome<bool, Error> {
    let key = entity.get(&mapping.primary_key).unwrap_or(Value::Null);
    if key.is_null() {
        return Outcome::Ok(false);
    }
    let conn = try_result!(stores.get(mapping.store.as_deref()));

    let mut select = Select::new(mapping.table.clone());
    for field in &mapping.fields {
        select = select.column_as(field.column.clone(), field.property.clone());
    }
    let select = select
        .where_eq(mapping.primary_key_column().to_string(), key)
        .limit(1);
    let (sql, params) = select.build(conn.dialect());
    if query_logging_enabled() {
        tracing::debug!(sql = %select.to_sql_string(conn.dialect()), "Refreshing entity");
    }

    let rows = try_outcome!(conn.query(cx, &sql, &params).await);
    let Some(row) = rows.first() else {
        tracing::debug!("Entity no longer exists in storage");
        return Outcome::Ok(false);
    };
    for field in &mapping.fields {
        if let Some(value) = row.get_by_name(&field.property) {
            entity.assign(field.property.clone(), value.clone());
        }
    }
    Outcome::Ok(true)
}
