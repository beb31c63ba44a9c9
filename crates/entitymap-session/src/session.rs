//! The session: one identity map and one unit of work over shared metadata.

use crate::config::{CommitOptions, QueryOptions, SessionConfig};
use crate::entity::EntityRef;
use crate::flush::refresh_entity;
use crate::hydrator::{HydrationContext, Hydrator};
use crate::identity_map::IdentityMap;
use crate::lifecycle::LifecycleHooks;
use crate::query::Query;
use crate::store::Stores;
use crate::unit_of_work::{CommitSummary, EntityState, PendingCounts, UnitOfWork};
use asupersync::{Cx, Outcome};
use entitymap_core::{
    Connection, Error, LifecycleError, MappingRegistry, Metadata, Result, Value, try_outcome,
    try_result,
};
use entitymap_query::Select;
use std::sync::Arc;

/// Alias used by [`Session::find`] for its single-table select.
const FIND_ALIAS: &str = "e";

/// Tracks the entities loaded and modified through it and writes them back
/// on [`commit`](Self::commit).
///
/// Connections are not owned by the session; every I/O method takes the
/// [`Stores`] to run against.
///
/// # Example
///
/// ```ignore
/// let mut session = Session::new(registry);
///
/// let book = session.find(&cx, &stores, "Book", 1_i64).await?.unwrap();
/// book.set("title", "Dune Messiah");
///
/// let author = EntityRef::new("Author").with("name", "Frank Herbert");
/// session.persist(&author)?;
///
/// let summary = session.commit(&cx, &stores).await?;
/// ```
pub struct Session {
    metadata: Arc<dyn Metadata>,
    identity_map: IdentityMap,
    unit_of_work: UnitOfWork,
    config: SessionConfig,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("identity_map", &self.identity_map.len())
            .field("pending", &self.unit_of_work.pending_counts())
            .field("config", &self.config)
            .finish()
    }
}

impl Session {
    /// Create a session with the default configuration.
    pub fn new(registry: MappingRegistry) -> Self {
        Self::with_metadata(Arc::new(registry), SessionConfig::default())
    }

    /// Create a session, validating the registry first when the
    /// configuration asks for it.
    #[allow(clippy::result_large_err)]
    pub fn with_config(registry: MappingRegistry, config: SessionConfig) -> Result<Self> {
        if config.validate_metadata {
            registry.validate()?;
        }
        Ok(Self::with_metadata(Arc::new(registry), config))
    }

    /// Create a session over any metadata source. No validation is done.
    pub fn with_metadata(metadata: Arc<dyn Metadata>, config: SessionConfig) -> Self {
        Self {
            metadata,
            identity_map: IdentityMap::new(),
            unit_of_work: UnitOfWork::new(),
            config,
        }
    }

    pub fn metadata(&self) -> &dyn Metadata {
        self.metadata.as_ref()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity_map
    }

    pub fn unit_of_work(&self) -> &UnitOfWork {
        &self.unit_of_work
    }

    pub fn unit_of_work_mut(&mut self) -> &mut UnitOfWork {
        &mut self.unit_of_work
    }

    /// Register lifecycle hooks for an entity type.
    pub fn register_hooks(&mut self, entity: impl Into<String>, hooks: Arc<dyn LifecycleHooks>) {
        self.unit_of_work.register_hooks(entity, hooks);
    }

    // ========================================================================
    // Object Management
    // ========================================================================

    /// Schedule `entity` for INSERT.
    ///
    /// Persisting an entity that is already new, clean or dirty does nothing.
    /// Related entities are cascaded at commit.
    #[allow(clippy::result_large_err)]
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        match self.unit_of_work.state_of(entity) {
            EntityState::Unknown => self.unit_of_work.register_new(entity),
            EntityState::New | EntityState::Clean | EntityState::Dirty => Ok(()),
            EntityState::Deleted => Err(Error::Lifecycle(LifecycleError::invalid_transition(
                entity.entity(),
                format!(
                    "cannot persist {} {}: it is scheduled for deletion",
                    entity.entity(),
                    entity.id()
                ),
            ))),
        }
    }

    /// Schedule `entity` for DELETE.
    ///
    /// An entity that was only scheduled for INSERT is forgotten instead.
    pub fn remove(&mut self, entity: &EntityRef) {
        if self.unit_of_work.state_of(entity) == EntityState::New {
            tracing::debug!(entity = %entity.entity(), id = %entity.id(), "Removing unsaved entity");
            self.unit_of_work.clear(std::slice::from_ref(entity));
            return;
        }
        self.unit_of_work.register_deleted(entity);
    }

    /// Stop tracking `entity` without touching storage.
    pub fn detach(&mut self, entity: &EntityRef) {
        self.unit_of_work.clear(std::slice::from_ref(entity));
        self.identity_map.evict(entity);
        entity.deactivate_proxying();
    }

    /// Whether `entity` is tracked by this session.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.unit_of_work.state_of(entity) != EntityState::Unknown
            || self.identity_map.contains_instance(entity)
    }

    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.unit_of_work.state_of(entity)
    }

    /// Reset the identity map and every piece of unit-of-work bookkeeping.
    pub fn clear(&mut self) {
        self.unit_of_work.clear_all();
        self.identity_map.clear();
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// A managed hydration context over this session's state.
    pub fn hydration_context(&mut self) -> HydrationContext<'_> {
        HydrationContext::managed(
            self.metadata.as_ref(),
            &mut self.identity_map,
            &mut self.unit_of_work,
        )
    }

    /// A hydrator with a root recipe for `entity` under `alias`.
    #[allow(clippy::result_large_err)]
    pub fn hydrator(&self, entity: &str, alias: &str) -> Result<Hydrator> {
        let mapping = self.metadata.require(entity)?;
        let mut hydrator = Hydrator::new();
        hydrator.add_recipe(None, alias, mapping, None, None)?;
        Ok(hydrator)
    }

    /// Run `query` and hydrate its result into this session.
    pub async fn query<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
        query: &mut Query,
        options: &QueryOptions,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let mut ctx = self.hydration_context();
        query.get_result(cx, stores, &mut ctx, options).await
    }

    /// Get an entity by primary key.
    ///
    /// First checks the identity map, then queries the entity's store.
    #[tracing::instrument(level = "debug", skip(self, cx, stores, key))]
    pub async fn find<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
        entity: &str,
        key: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let key = key.into();
        if let Some(existing) = self.identity_map.fetch(entity, &key) {
            if self.unit_of_work.state_of(&existing) == EntityState::Deleted {
                return Outcome::Ok(None);
            }
            return Outcome::Ok(Some(existing));
        }

        let mapping = try_result!(self.metadata.require(entity));
        let mut select = Select::new(mapping.table.clone()).alias(FIND_ALIAS);
        for field in &mapping.fields {
            let column = format!("{FIND_ALIAS}.{}", field.column);
            select = select.column_as(column.clone(), column);
        }
        let select = select
            .where_eq(format!("{FIND_ALIAS}.{}", mapping.primary_key_column()), key)
            .limit(1);
        let hydrator = try_result!(self.hydrator(entity, FIND_ALIAS));
        let mut query = Query::new(select, hydrator);
        if let Some(store) = &mapping.store {
            query = query.on_store(store.clone());
        }

        let found = try_outcome!(
            self.query(cx, stores, &mut query, &QueryOptions::default())
                .await
        );
        Outcome::Ok(found.into_iter().next())
    }

    /// Re-read `entity` from storage, discarding unsaved field changes.
    ///
    /// Returns `false` when the row no longer exists.
    pub async fn refresh<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
        entity: &EntityRef,
    ) -> Outcome<bool, Error> {
        let mapping = try_result!(self.metadata.require(entity.entity()));
        self.unit_of_work.absorb_changes();
        let found = try_outcome!(refresh_entity(cx, stores, mapping, entity).await);
        if found && self.unit_of_work.state_of(entity) == EntityState::Dirty {
            self.unit_of_work.register_clean(entity, false);
        }
        Outcome::Ok(found)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Commit every pending change with the configured [`CommitOptions`].
    pub async fn commit<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
    ) -> Outcome<CommitSummary, Error> {
        let options = self.config.commit;
        self.commit_with(cx, stores, &options).await
    }

    /// Commit every pending change.
    ///
    /// Inserted entities join the identity map under their (possibly
    /// generated) primary key; deleted entities leave it.
    pub async fn commit_with<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
        options: &CommitOptions,
    ) -> Outcome<CommitSummary, Error> {
        let summary = try_outcome!(
            self.unit_of_work
                .commit(cx, stores, self.metadata.as_ref(), options)
                .await
        );

        for entity in &summary.inserted {
            let Some(mapping) = self.metadata.mapping(entity.entity()) else {
                continue;
            };
            let key = entity.get(&mapping.primary_key).unwrap_or(Value::Null);
            self.identity_map.register(entity, key);
        }
        for entity in &summary.deleted {
            self.identity_map.evict(entity);
        }
        Outcome::Ok(summary)
    }

    // ========================================================================
    // Debug Helpers
    // ========================================================================

    pub fn pending_counts(&self) -> PendingCounts {
        self.unit_of_work.pending_counts()
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        let pending = self.pending_counts();
        SessionDebugInfo {
            tracked: self.identity_map.len(),
            pending_new: pending.new,
            pending_dirty: pending.dirty,
            pending_delete: pending.deleted,
            relation_changed: pending.relation_changed,
        }
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionDebugInfo {
    /// Instances in the identity map.
    pub tracked: usize,
    /// Entities pending INSERT.
    pub pending_new: usize,
    /// Entities pending UPDATE.
    pub pending_dirty: usize,
    /// Entities pending DELETE.
    pub pending_delete: usize,
    /// Entities with staged relationship edges.
    pub relation_changed: usize,
}
