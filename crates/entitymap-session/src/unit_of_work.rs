//! Unit of Work pattern implementation for entitymap sessions.
//!
//! The Unit of Work tracks the lifecycle state of every entity it has seen
//! and writes the pending changes back in one commit.
//!
//! # Overview
//!
//! The Unit of Work:
//! - Keeps one [`StateRecord`] per entity, in a table owned by the unit of work
//! - Tracks new objects to INSERT, dirty objects to UPDATE and deleted objects to DELETE
//! - Stages relationship edges added and removed since the last commit
//! - Resolves persist cascades before any I/O is issued
//! - Writes everything with one transaction per backing store and rolls every
//!   store back if any write fails
//!
//! # Example
//!
//! ```ignore
//! let mut uow = UnitOfWork::new();
//!
//! uow.register_new(&author)?;
//! uow.register_dirty(&book, ["title"])?;
//! uow.register_deleted(&old_book);
//!
//! let summary = uow.commit(&cx, &stores, &registry, &CommitOptions::default()).await?;
//! ```

use crate::config::CommitOptions;
use crate::entity::{ChangeFeed, EntityId, EntityRef, Mutation, RelationChange, RelationValue};
use crate::flush::{
    LinkTableOp, PendingWrite, RelationshipOp, Transactions, WriteDone, WriteKind, column_value,
    refresh_entity, split,
};
use crate::lifecycle::{HookKind, HookRegistry, LifecycleHooks, QueuedHook};
use crate::store::Stores;
use asupersync::{Cx, Outcome};
use entitymap_core::{
    Connection, Dialect, Error, JoinColumn, JoinTable, LifecycleError, Mapping, Metadata,
    Relation, Result, Value, try_outcome, try_result,
};
use entitymap_query::{Delete, Insert, Update};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Lifecycle state of an entity within one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    /// Never registered.
    #[default]
    Unknown,
    /// Scheduled for INSERT.
    New,
    /// In sync with storage.
    Clean,
    /// Loaded, with properties scheduled for UPDATE.
    Dirty,
    /// Scheduled for DELETE.
    Deleted,
}

impl EntityState {
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Unknown => "unknown",
            EntityState::New => "new",
            EntityState::Clean => "clean",
            EntityState::Dirty => "dirty",
            EntityState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one entity.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub entity: EntityRef,
    pub state: EntityState,
    /// Properties to write on UPDATE, in first-registration order.
    pub dirty: Vec<String>,
    /// Relationship edges added since the last commit, per property.
    pub added: BTreeMap<String, RelationValue>,
    /// Relationship edges removed since the last commit, per property.
    pub removed: BTreeMap<String, RelationValue>,
}

impl StateRecord {
    fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            state: EntityState::Unknown,
            dirty: Vec::new(),
            added: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }

    pub fn has_relation_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Insertion-ordered set of entities.
#[derive(Debug, Default, Clone)]
struct EntitySet {
    order: Vec<EntityRef>,
    members: HashSet<EntityId>,
}

impl EntitySet {
    fn insert(&mut self, entity: &EntityRef) -> bool {
        if !self.members.insert(entity.id()) {
            return false;
        }
        self.order.push(entity.clone());
        true
    }

    fn remove(&mut self, entity: &EntityRef) -> bool {
        if !self.members.remove(&entity.id()) {
            return false;
        }
        self.order.retain(|e| e.id() != entity.id());
        true
    }

    fn contains(&self, entity: &EntityRef) -> bool {
        self.members.contains(&entity.id())
    }

    fn to_vec(&self) -> Vec<EntityRef> {
        self.order.clone()
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Entities pending INSERT.
    pub new: usize,
    /// Entities pending UPDATE.
    pub dirty: usize,
    /// Entities pending DELETE.
    pub deleted: usize,
    /// Entities with staged relationship edges.
    pub relation_changed: usize,
}

impl PendingCounts {
    /// Total number of pending entries.
    #[must_use]
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted + self.relation_changed
    }

    /// Check if there is nothing pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// What a successful commit wrote.
#[derive(Debug, Clone, Default)]
pub struct CommitSummary {
    pub inserted: Vec<EntityRef>,
    pub updated: Vec<EntityRef>,
    pub deleted: Vec<EntityRef>,
    /// Foreign-key updates and join-table rows written.
    pub relationships: usize,
    /// Dirty entities whose UPDATE could not be issued: no primary key, or
    /// no dirty property backed by a column. They stay dirty.
    pub skipped: Vec<EntityRef>,
}

impl CommitSummary {
    /// Total number of statements that succeeded.
    pub fn total(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len() + self.relationships
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Where the column of a relationship edge lives.
#[derive(Clone, Copy)]
enum EdgeTarget<'m> {
    /// Join column on the owner's row.
    OwnerColumn(&'m JoinColumn),
    /// Join column on the target's row, declared by the target's owning relation.
    TargetColumn(&'m JoinColumn),
    /// Join table row; `owner_is_local` is false when the owner is the inverse side.
    JoinTable {
        table: &'m JoinTable,
        owner_is_local: bool,
    },
}

/// A staged edge with its mappings resolved.
struct PlannedEdge<'m> {
    owner: EntityRef,
    owner_mapping: &'m Mapping,
    target: EntityRef,
    target_mapping: &'m Mapping,
    change: RelationChange,
    write: EdgeTarget<'m>,
}

/// An entity write with its mapping and store resolved.
struct Planned<'m> {
    entity: EntityRef,
    mapping: &'m Mapping,
    store: String,
    dialect: Dialect,
    /// Dirty properties for updates.
    properties: Vec<String>,
}

#[derive(Default)]
struct CommitPlan<'m> {
    inserts: Vec<Planned<'m>>,
    updates: Vec<Planned<'m>>,
    deletes: Vec<Planned<'m>>,
    edges: Vec<PlannedEdge<'m>>,
}

impl CommitPlan<'_> {
    fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.edges.is_empty()
    }
}

/// Writes that have already happened in the current commit.
#[derive(Default)]
struct CommitProgress {
    summary: CommitSummary,
    /// Entities whose primary key was generated, with the key property.
    generated: Vec<(EntityRef, String)>,
}

/// Tracks and commits all pending changes of a session.
#[derive(Debug, Default)]
pub struct UnitOfWork {
    records: HashMap<EntityId, StateRecord>,
    new: EntitySet,
    dirty: EntitySet,
    deleted: EntitySet,
    relation_changed: EntitySet,
    feed: ChangeFeed,
    hooks: HookRegistry,
    after_hooks: Vec<QueuedHook>,
}

impl UnitOfWork {
    /// Create a new empty Unit of Work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The feed proxied entities report their mutations to.
    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Register lifecycle hooks for an entity type.
    pub fn register_hooks(&mut self, entity: impl Into<String>, hooks: Arc<dyn LifecycleHooks>) {
        self.hooks.register(entity, hooks);
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn state_of(&self, entity: &EntityRef) -> EntityState {
        self.records
            .get(&entity.id())
            .map_or(EntityState::Unknown, |r| r.state)
    }

    pub fn record(&self, entity: &EntityRef) -> Option<&StateRecord> {
        self.records.get(&entity.id())
    }

    /// Properties scheduled for UPDATE.
    pub fn dirty_properties(&self, entity: &EntityRef) -> Vec<String> {
        self.records
            .get(&entity.id())
            .map(|r| r.dirty.clone())
            .unwrap_or_default()
    }

    pub fn new_entities(&self) -> Vec<EntityRef> {
        self.new.to_vec()
    }

    pub fn dirty_entities(&self) -> Vec<EntityRef> {
        self.dirty.to_vec()
    }

    pub fn deleted_entities(&self) -> Vec<EntityRef> {
        self.deleted.to_vec()
    }

    pub fn relation_changed_entities(&self) -> Vec<EntityRef> {
        self.relation_changed.to_vec()
    }

    pub fn has_relation_changes(&self, entity: &EntityRef) -> bool {
        self.relation_changed.contains(entity)
    }

    /// Get the count of pending operations.
    #[must_use]
    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            new: self.new.len(),
            dirty: self.dirty.len(),
            deleted: self.deleted.len(),
            relation_changed: self.relation_changed.len(),
        }
    }

    /// Check if there are any pending changes, including unabsorbed mutations.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending_counts().is_empty() || !self.feed.is_empty()
    }

    // ========================================================================
    // State transitions
    // ========================================================================

    /// Schedule an unknown entity for INSERT.
    #[allow(clippy::result_large_err)]
    pub fn register_new(&mut self, entity: &EntityRef) -> Result<()> {
        self.absorb_changes();
        self.mark_new(entity)
    }

    /// Schedule `properties` of a clean or dirty entity for UPDATE.
    ///
    /// Properties accumulate across calls. New and unknown entities are left
    /// untouched, since their INSERT writes every property anyway.
    #[allow(clippy::result_large_err)]
    pub fn register_dirty<I, S>(&mut self, entity: &EntityRef, properties: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.absorb_changes();
        self.mark_dirty(entity, properties.into_iter().map(Into::into).collect())
    }

    /// Schedule an entity for DELETE. Its staged relationship edges are dropped.
    pub fn register_deleted(&mut self, entity: &EntityRef) {
        self.absorb_changes();
        self.mark_deleted(entity);
    }

    /// Mark an entity as in sync with storage.
    ///
    /// Unless `fresh` is set, staged relationship edges are first reverted on
    /// the entity itself. Hydration passes `fresh` since the values it just
    /// assigned came straight from storage.
    pub fn register_clean(&mut self, entity: &EntityRef, fresh: bool) {
        self.absorb_changes();
        self.mark_clean(entity, fresh);
    }

    /// Stage an added or removed edge of a single-valued relation.
    pub fn register_relation_change(
        &mut self,
        change: RelationChange,
        entity: &EntityRef,
        property: &str,
        target: &EntityRef,
    ) {
        self.absorb_changes();
        self.stage(change, entity, property, target, false);
    }

    /// Stage an added or removed member of a collection relation.
    pub fn register_collection_change(
        &mut self,
        change: RelationChange,
        entity: &EntityRef,
        property: &str,
        target: &EntityRef,
    ) {
        self.absorb_changes();
        self.stage(change, entity, property, target, true);
    }

    /// Turn every mutation reported by proxied entities into registrations.
    pub fn absorb_changes(&mut self) {
        let mutations = self.feed.drain();
        if mutations.is_empty() {
            return;
        }
        tracing::trace!(count = mutations.len(), "Absorbing entity mutations");
        for mutation in mutations {
            match mutation {
                Mutation::Field { entity, property } => {
                    if matches!(self.state_of(&entity), EntityState::Clean | EntityState::Dirty) {
                        if let Err(e) = self.mark_dirty(&entity, vec![property]) {
                            tracing::debug!(error = %e, "Ignoring field mutation");
                        }
                    }
                }
                Mutation::Relation {
                    entity,
                    property,
                    change,
                    target,
                } => {
                    if self.state_of(&entity) != EntityState::Deleted {
                        self.stage(change, &entity, &property, &target, false);
                    }
                }
                Mutation::Collection {
                    entity,
                    property,
                    change,
                    target,
                } => {
                    if self.state_of(&entity) != EntityState::Deleted {
                        self.stage(change, &entity, &property, &target, true);
                    }
                }
            }
        }
    }

    fn record_mut(&mut self, entity: &EntityRef) -> &mut StateRecord {
        self.records
            .entry(entity.id())
            .or_insert_with(|| StateRecord::new(entity.clone()))
    }

    /// Move `entity` into the lifecycle set for `state`.
    fn place(&mut self, entity: &EntityRef, state: EntityState) {
        self.new.remove(entity);
        self.dirty.remove(entity);
        self.deleted.remove(entity);
        match state {
            EntityState::New => {
                self.new.insert(entity);
            }
            EntityState::Dirty => {
                self.dirty.insert(entity);
            }
            EntityState::Deleted => {
                self.deleted.insert(entity);
            }
            EntityState::Clean | EntityState::Unknown => {}
        }
    }

    #[allow(clippy::result_large_err)]
    fn mark_new(&mut self, entity: &EntityRef) -> Result<()> {
        let state = self.state_of(entity);
        if state != EntityState::Unknown {
            return Err(Error::Lifecycle(LifecycleError::invalid_transition(
                entity.entity(),
                format!(
                    "cannot register {} {} as new: it is already {state}",
                    entity.entity(),
                    entity.id()
                ),
            )));
        }
        self.record_mut(entity).state = EntityState::New;
        self.place(entity, EntityState::New);
        tracing::trace!(entity = %entity.entity(), id = %entity.id(), "Registered new");
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn mark_dirty(&mut self, entity: &EntityRef, properties: Vec<String>) -> Result<()> {
        if properties.is_empty() {
            return Err(Error::Lifecycle(LifecycleError::invalid_transition(
                entity.entity(),
                "register_dirty needs at least one property",
            )));
        }
        match self.state_of(entity) {
            EntityState::Deleted => Err(Error::Lifecycle(LifecycleError::invalid_transition(
                entity.entity(),
                format!(
                    "cannot register {} {} as dirty: it is scheduled for deletion",
                    entity.entity(),
                    entity.id()
                ),
            ))),
            EntityState::New | EntityState::Unknown => Ok(()),
            EntityState::Clean | EntityState::Dirty => {
                let record = self.record_mut(entity);
                record.state = EntityState::Dirty;
                for property in properties {
                    if !record.dirty.contains(&property) {
                        record.dirty.push(property);
                    }
                }
                self.place(entity, EntityState::Dirty);
                Ok(())
            }
        }
    }

    fn mark_deleted(&mut self, entity: &EntityRef) {
        let record = self.record_mut(entity);
        record.state = EntityState::Deleted;
        record.dirty.clear();
        record.added.clear();
        record.removed.clear();
        self.relation_changed.remove(entity);
        self.place(entity, EntityState::Deleted);
        tracing::trace!(entity = %entity.entity(), id = %entity.id(), "Registered deleted");
    }

    fn mark_clean(&mut self, entity: &EntityRef, fresh: bool) {
        let record = self.record_mut(entity);
        if !fresh {
            revert_staged(entity, &record.added, &record.removed);
        }
        record.state = EntityState::Clean;
        record.dirty.clear();
        record.added.clear();
        record.removed.clear();
        self.relation_changed.remove(entity);
        self.place(entity, EntityState::Clean);
    }

    /// Drop the staged edges of `entity` and leave its state alone.
    fn mark_edges_written(&mut self, entity: &EntityRef) {
        let record = self.record_mut(entity);
        record.added.clear();
        record.removed.clear();
        self.relation_changed.remove(entity);
    }

    /// Stage one edge, cancelling a staged edge in the opposite direction.
    fn stage(
        &mut self,
        change: RelationChange,
        entity: &EntityRef,
        property: &str,
        target: &EntityRef,
        collection: bool,
    ) {
        let record = self.record_mut(entity);
        let StateRecord { added, removed, .. } = record;
        let (same, opposite) = match change {
            RelationChange::Added => (added, removed),
            RelationChange::Removed => (removed, added),
        };

        if !remove_edge(opposite, property, target) {
            if collection {
                let slot = same
                    .entry(property.to_string())
                    .or_insert_with(|| RelationValue::Many(Vec::new()));
                match slot {
                    RelationValue::Many(items) => {
                        if !items.contains(target) {
                            items.push(target.clone());
                        }
                    }
                    RelationValue::One(_) => *slot = RelationValue::Many(vec![target.clone()]),
                }
            } else {
                same.insert(
                    property.to_string(),
                    RelationValue::One(Some(target.clone())),
                );
            }
        }

        let has_changes = record.has_relation_changes();
        let untracked = record.state == EntityState::Unknown && record.dirty.is_empty();
        if has_changes {
            self.relation_changed.insert(entity);
        } else {
            self.relation_changed.remove(entity);
            if untracked {
                self.records.remove(&entity.id());
            }
        }
    }

    // ========================================================================
    // Cascades
    // ========================================================================

    /// Resolve persist cascades for every new entity and every added edge.
    ///
    /// Unknown targets reached through a cascading relation are registered
    /// as new, recursively. Fails without side effects on storage when a
    /// target is unknown and the relation does not cascade, or when a target
    /// is scheduled for deletion.
    #[allow(clippy::result_large_err)]
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn prepare_cascades(&mut self, metadata: &dyn Metadata) -> Result<()> {
        self.absorb_changes();
        let mut visited = HashSet::new();
        for entity in self.new.to_vec() {
            self.cascade_from(metadata, &entity, &mut visited)?;
        }
        for entity in self.relation_changed.to_vec() {
            let added: Vec<(String, Vec<EntityRef>)> = self
                .records
                .get(&entity.id())
                .map(|r| {
                    r.added
                        .iter()
                        .map(|(property, value)| (property.clone(), value.targets()))
                        .collect()
                })
                .unwrap_or_default();
            for (property, targets) in added {
                let relation = metadata.require_relation(entity.entity(), &property)?;
                for target in targets {
                    self.check_target(metadata, &entity, relation, &target, &mut visited)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve persist cascades starting from one entity.
    #[allow(clippy::result_large_err)]
    pub fn prepare_cascades_for(
        &mut self,
        metadata: &dyn Metadata,
        entity: &EntityRef,
    ) -> Result<()> {
        self.absorb_changes();
        let mut visited = HashSet::new();
        self.cascade_from(metadata, entity, &mut visited)
    }

    #[allow(clippy::result_large_err)]
    fn cascade_from(
        &mut self,
        metadata: &dyn Metadata,
        entity: &EntityRef,
        visited: &mut HashSet<EntityId>,
    ) -> Result<()> {
        if !visited.insert(entity.id()) {
            return Ok(());
        }
        let mapping = metadata.require(entity.entity())?;
        let is_new = self.state_of(entity) == EntityState::New;
        for relation in &mapping.relations {
            for target in entity.targets(&relation.property) {
                self.check_target(metadata, entity, relation, &target, visited)?;
                if is_new {
                    self.stage(
                        RelationChange::Added,
                        entity,
                        &relation.property,
                        &target,
                        relation.is_collection(),
                    );
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn check_target(
        &mut self,
        metadata: &dyn Metadata,
        owner: &EntityRef,
        relation: &Relation,
        target: &EntityRef,
        visited: &mut HashSet<EntityId>,
    ) -> Result<()> {
        match self.state_of(target) {
            EntityState::Deleted => Err(Error::Lifecycle(LifecycleError::deleted_target(
                owner.entity(),
                &relation.property,
            ))),
            EntityState::Unknown if !relation.cascade_persist => Err(Error::Lifecycle(
                LifecycleError::uncascaded(owner.entity(), &relation.property),
            )),
            EntityState::Unknown => {
                tracing::debug!(
                    entity = %owner.entity(),
                    property = %relation.property,
                    target = %target.entity(),
                    "Cascading persist"
                );
                self.mark_new(target)?;
                self.cascade_from(metadata, target, visited)
            }
            EntityState::New => self.cascade_from(metadata, target, visited),
            EntityState::Clean | EntityState::Dirty => Ok(()),
        }
    }

    // ========================================================================
    // Bookkeeping resets
    // ========================================================================

    /// Forget the given entities entirely.
    pub fn clear(&mut self, entities: &[EntityRef]) {
        for entity in entities {
            self.records.remove(&entity.id());
            self.new.remove(entity);
            self.dirty.remove(entity);
            self.deleted.remove(entity);
            self.relation_changed.remove(entity);
        }
    }

    /// Reset every lifecycle set, all staging and the callback queue.
    pub fn clear_all(&mut self) {
        self.records.clear();
        self.new.clear();
        self.dirty.clear();
        self.deleted.clear();
        self.relation_changed.clear();
        self.after_hooks.clear();
        self.feed.drain();
    }

    /// Move every tracked entity to clean and drop all staging.
    pub fn clean(&mut self) {
        self.feed.drain();
        for record in self.records.values_mut() {
            record.state = EntityState::Clean;
            record.dirty.clear();
            record.added.clear();
            record.removed.clear();
        }
        self.new.clear();
        self.dirty.clear();
        self.deleted.clear();
        self.relation_changed.clear();
        self.after_hooks.clear();
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Write every pending change.
    ///
    /// Cascades are resolved and every mapping is looked up before the first
    /// statement is issued. Inserts, updates, deletes and relationship writes
    /// then run as strictly ordered phases, each phase issuing its writes
    /// concurrently under one transaction per store. If anything fails, every
    /// open transaction is rolled back, generated primary keys are stripped
    /// from the entities inserted in this commit, and the original error is
    /// returned.
    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(new = self.new.len(), dirty = self.dirty.len(), deleted = self.deleted.len())
    )]
    pub async fn commit<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
        metadata: &dyn Metadata,
        options: &CommitOptions,
    ) -> Outcome<CommitSummary, Error> {
        let start = std::time::Instant::now();
        try_result!(self.prepare_cascades(metadata));
        let plan = try_result!(self.plan(stores, metadata));
        if plan.is_empty() {
            tracing::debug!("Nothing to commit");
            return Outcome::Ok(CommitSummary::default());
        }

        let mut txs = Transactions::new(stores);
        let mut progress = CommitProgress::default();
        let written = self
            .write_phases(cx, &mut txs, &plan, options, &mut progress)
            .await;
        if let Err(failure) = split::<(), CommitSummary>(written) {
            tracing::warn!("Commit failed, rolling back");
            txs.rollback_all(cx).await;
            self.abandon(&progress);
            return failure;
        }
        if let Err(failure) = split::<(), CommitSummary>(txs.commit_all(cx).await) {
            self.abandon(&progress);
            return failure;
        }

        let CommitProgress { summary, .. } = progress;
        self.refresh_committed(cx, stores, &plan, &summary, options)
            .await;

        if !options.skip_clean {
            let skipped: HashSet<EntityId> = summary.skipped.iter().map(EntityRef::id).collect();
            for planned in plan.inserts.iter().chain(&plan.updates) {
                if !skipped.contains(&planned.entity.id()) {
                    self.mark_clean(&planned.entity, true);
                }
            }
            for edge in &plan.edges {
                if skipped.contains(&edge.owner.id()) {
                    self.mark_edges_written(&edge.owner);
                } else {
                    self.mark_clean(&edge.owner, true);
                }
            }
            for planned in &plan.deletes {
                planned.entity.deactivate_proxying();
                self.clear(std::slice::from_ref(&planned.entity));
            }
            for entity in &summary.inserted {
                entity.attach_feed(&self.feed);
                entity.activate_proxying();
            }
            for queued in std::mem::take(&mut self.after_hooks) {
                self.hooks.run_after(&queued);
            }
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = summary.inserted.len(),
            updated = summary.updated.len(),
            deleted = summary.deleted.len(),
            relationships = summary.relationships,
            "Commit complete"
        );
        Outcome::Ok(summary)
    }

    /// Resolve mappings, stores and dialects for everything pending.
    #[allow(clippy::result_large_err)]
    fn plan<'m, C: Connection>(
        &self,
        stores: &Stores<C>,
        metadata: &'m dyn Metadata,
    ) -> Result<CommitPlan<'m>> {
        let planned = |entity: &EntityRef, properties: Vec<String>| -> Result<Planned<'m>> {
            let mapping = metadata.require(entity.entity())?;
            let store = stores.name_of(mapping.store.as_deref()).to_string();
            let dialect = stores.get(Some(&store))?.dialect();
            Ok(Planned {
                entity: entity.clone(),
                mapping,
                store,
                dialect,
                properties,
            })
        };

        let mut plan = CommitPlan::default();
        for entity in &self.new.order {
            plan.inserts.push(planned(entity, Vec::new())?);
        }
        for entity in &self.dirty.order {
            plan.updates.push(planned(entity, self.dirty_properties(entity))?);
        }
        for entity in &self.deleted.order {
            plan.deletes.push(planned(entity, Vec::new())?);
        }

        for owner in &self.relation_changed.order {
            let Some(record) = self.records.get(&owner.id()) else {
                continue;
            };
            let owner_mapping = metadata.require(owner.entity())?;
            // Detaching edges first keeps a moved target from being nulled
            // after it was attached elsewhere.
            let staged = record
                .removed
                .iter()
                .map(|(p, v)| (RelationChange::Removed, p, v))
                .chain(
                    record
                        .added
                        .iter()
                        .map(|(p, v)| (RelationChange::Added, p, v)),
                );
            for (change, property, value) in staged {
                let relation = metadata.require_relation(owner.entity(), property)?;
                let target_mapping = metadata.require(&relation.target)?;
                let write = resolve_edge(metadata, owner_mapping, relation)?;
                stores.get(owner_mapping.store.as_deref())?;
                stores.get(target_mapping.store.as_deref())?;
                for target in value.targets() {
                    plan.edges.push(PlannedEdge {
                        owner: owner.clone(),
                        owner_mapping,
                        target,
                        target_mapping,
                        change,
                        write,
                    });
                }
            }
        }
        Ok(plan)
    }

    async fn write_phases<'c, C: Connection>(
        &mut self,
        cx: &Cx,
        txs: &mut Transactions<'c, C>,
        plan: &CommitPlan<'_>,
        options: &CommitOptions,
        progress: &mut CommitProgress,
    ) -> Outcome<(), Error> {
        let hooks = !options.skip_lifecycle_hooks;

        // Inserts
        let mut writes = Vec::with_capacity(plan.inserts.len());
        for planned in &plan.inserts {
            if hooks {
                try_result!(self.hooks.run_before(HookKind::Create, &planned.entity));
            }
            writes.push(PendingWrite::new(
                planned.store.clone(),
                WriteKind::Insert,
                Some(planned.entity.clone()),
                &insert_statement(&planned.entity, planned.mapping),
                planned.dialect,
            ));
        }
        let results = try_outcome!(txs.execute_phase(cx, &writes).await);
        let mut failure = None;
        for (planned, result) in plan.inserts.iter().zip(results) {
            match split::<WriteDone, ()>(result) {
                Ok(done) => {
                    let pk = &planned.mapping.primary_key;
                    let key = planned.entity.get(pk).unwrap_or(Value::Null);
                    if let (true, WriteDone::Inserted(id)) = (key.is_null(), done) {
                        planned.entity.assign(pk.clone(), Value::BigInt(id));
                        progress.generated.push((planned.entity.clone(), pk.clone()));
                    }
                    progress.summary.inserted.push(planned.entity.clone());
                    self.queue_after(hooks, HookKind::Create, &planned.entity);
                }
                Err(f) => {
                    failure.get_or_insert(f);
                }
            }
        }
        if let Some(failure) = failure {
            return failure;
        }

        // Updates
        let mut writes = Vec::with_capacity(plan.updates.len());
        let mut issued = Vec::with_capacity(plan.updates.len());
        for planned in &plan.updates {
            let key = planned
                .entity
                .get(&planned.mapping.primary_key)
                .unwrap_or(Value::Null);
            if key.is_null() {
                tracing::warn!(
                    entity = %planned.mapping.entity,
                    "Skipping UPDATE for entity without primary key - cannot identify row"
                );
                progress.summary.skipped.push(planned.entity.clone());
                continue;
            }
            if hooks {
                try_result!(self.hooks.run_before(HookKind::Update, &planned.entity));
            }
            let mut update = Update::new(planned.mapping.table.clone());
            for property in &planned.properties {
                if property == &planned.mapping.primary_key {
                    continue;
                }
                if let Some(column) = planned.mapping.column_of(property) {
                    let value = planned.entity.get(property).unwrap_or(Value::Null);
                    update = update.set(column.to_string(), value);
                }
            }
            if update.is_empty() {
                tracing::warn!(
                    entity = %planned.mapping.entity,
                    properties = ?planned.properties,
                    "Skipping UPDATE with no column-backed dirty property"
                );
                progress.summary.skipped.push(planned.entity.clone());
                continue;
            }
            let update = update.where_eq(planned.mapping.primary_key_column().to_string(), key);
            writes.push(PendingWrite::new(
                planned.store.clone(),
                WriteKind::Update,
                Some(planned.entity.clone()),
                &update,
                planned.dialect,
            ));
            issued.push(planned.entity.clone());
        }
        let results = try_outcome!(txs.execute_phase(cx, &writes).await);
        let mut failure = None;
        for (entity, result) in issued.into_iter().zip(results) {
            match split::<WriteDone, ()>(result) {
                Ok(_) => {
                    self.queue_after(hooks, HookKind::Update, &entity);
                    progress.summary.updated.push(entity);
                }
                Err(f) => {
                    failure.get_or_insert(f);
                }
            }
        }
        if let Some(failure) = failure {
            return failure;
        }

        // Deletes
        let mut writes = Vec::with_capacity(plan.deletes.len());
        let mut issued = Vec::with_capacity(plan.deletes.len());
        for planned in &plan.deletes {
            let key = planned
                .entity
                .get(&planned.mapping.primary_key)
                .unwrap_or(Value::Null);
            if key.is_null() {
                tracing::warn!(
                    entity = %planned.mapping.entity,
                    "Skipping DELETE for entity without primary key - cannot identify row"
                );
                continue;
            }
            if hooks {
                try_result!(self.hooks.run_before(HookKind::Remove, &planned.entity));
            }
            let delete = Delete::new(planned.mapping.table.clone())
                .where_eq(planned.mapping.primary_key_column().to_string(), key);
            writes.push(PendingWrite::new(
                planned.store.clone(),
                WriteKind::Delete,
                Some(planned.entity.clone()),
                &delete,
                planned.dialect,
            ));
            issued.push(planned.entity.clone());
        }
        let results = try_outcome!(txs.execute_phase(cx, &writes).await);
        let mut failure = None;
        for (entity, result) in issued.into_iter().zip(results) {
            match split::<WriteDone, ()>(result) {
                Ok(_) => {
                    self.queue_after(hooks, HookKind::Remove, &entity);
                    progress.summary.deleted.push(entity);
                }
                Err(f) => {
                    failure.get_or_insert(f);
                }
            }
        }
        if let Some(failure) = failure {
            return failure;
        }

        // Relationship writes, detaching before attaching
        let mut ops: Vec<RelationshipOp> = Vec::new();
        for edge in &plan.edges {
            if let Some(op) = relationship_op(txs.backing(), edge) {
                if !ops.contains(&op) {
                    ops.push(op);
                }
            }
        }
        let (detach, attach): (Vec<RelationshipOp>, Vec<RelationshipOp>) =
            ops.into_iter().partition(RelationshipOp::is_detach);
        for group in [detach, attach] {
            let mut writes = Vec::with_capacity(group.len());
            for op in &group {
                let dialect = try_result!(txs.backing().get(Some(op.store()))).dialect();
                writes.push(op.to_write(dialect));
            }
            let results = try_outcome!(txs.execute_phase(cx, &writes).await);
            let mut failure = None;
            for result in results {
                match split::<WriteDone, ()>(result) {
                    Ok(_) => progress.summary.relationships += 1,
                    Err(f) => {
                        failure.get_or_insert(f);
                    }
                }
            }
            if let Some(failure) = failure {
                return failure;
            }
        }

        Outcome::Ok(())
    }

    fn queue_after(&mut self, hooks: bool, kind: HookKind, entity: &EntityRef) {
        if hooks && self.hooks.contains(entity.entity()) {
            self.after_hooks.push(QueuedHook {
                kind,
                entity: entity.clone(),
            });
        }
    }

    /// Undo in-memory effects of a failed commit.
    fn abandon(&mut self, progress: &CommitProgress) {
        for (entity, pk) in &progress.generated {
            entity.clear_field(pk);
        }
        for entity in &progress.summary.inserted {
            entity.deactivate_proxying();
        }
        self.after_hooks.clear();
    }

    async fn refresh_committed<C: Connection>(
        &self,
        cx: &Cx,
        stores: &Stores<C>,
        plan: &CommitPlan<'_>,
        summary: &CommitSummary,
        options: &CommitOptions,
    ) {
        let mut targets: Vec<&Planned<'_>> = Vec::new();
        if options.refresh_created {
            targets.extend(
                plan.inserts
                    .iter()
                    .filter(|p| summary.inserted.contains(&p.entity)),
            );
        }
        if options.refresh_updated {
            targets.extend(
                plan.updates
                    .iter()
                    .filter(|p| summary.updated.contains(&p.entity)),
            );
        }
        for planned in targets {
            match refresh_entity(cx, stores, planned.mapping, &planned.entity).await {
                Outcome::Ok(true) => {}
                Outcome::Ok(false) => tracing::debug!(
                    entity = %planned.mapping.entity,
                    "Committed entity not found on refresh"
                ),
                Outcome::Err(e) => tracing::warn!(
                    entity = %planned.mapping.entity,
                    error = %e,
                    "Refresh after commit failed"
                ),
                Outcome::Cancelled(_) | Outcome::Panicked(_) => {
                    tracing::warn!("Refresh after commit did not complete");
                    return;
                }
            }
        }
    }
}

/// Build the INSERT for an entity's assigned fields; a NULL primary key is
/// left to the store to generate.
fn insert_statement(entity: &EntityRef, mapping: &Mapping) -> Insert {
    let mut insert = Insert::new(mapping.table.clone());
    for field in &mapping.fields {
        let Some(value) = entity.get(&field.property) else {
            continue;
        };
        if field.property == mapping.primary_key && value.is_null() {
            continue;
        }
        insert = insert.value(field.column.clone(), value);
    }
    insert
}

/// Decide where the write for an edge of `relation` lands.
#[allow(clippy::result_large_err)]
fn resolve_edge<'m>(
    metadata: &'m dyn Metadata,
    owner_mapping: &'m Mapping,
    relation: &'m Relation,
) -> Result<EdgeTarget<'m>> {
    if let Some(table) = &relation.join_table {
        return Ok(EdgeTarget::JoinTable {
            table,
            owner_is_local: true,
        });
    }
    if let Some(column) = &relation.join_column {
        return Ok(EdgeTarget::OwnerColumn(column));
    }
    let Some(mapped_by) = &relation.mapped_by else {
        return Err(Error::mapping(
            &owner_mapping.entity,
            format!("relation '{}' has no join descriptor", relation.property),
        ));
    };
    let owning = metadata.require_relation(&relation.target, mapped_by)?;
    if let Some(table) = &owning.join_table {
        return Ok(EdgeTarget::JoinTable {
            table,
            owner_is_local: false,
        });
    }
    if let Some(column) = &owning.join_column {
        return Ok(EdgeTarget::TargetColumn(column));
    }
    Err(Error::mapping(
        &relation.target,
        format!("relation '{mapped_by}' has no join descriptor"),
    ))
}

/// Build the write for one staged edge. Edges whose row cannot be identified
/// are skipped.
fn relationship_op<C: Connection>(
    stores: &Stores<C>,
    edge: &PlannedEdge<'_>,
) -> Option<RelationshipOp> {
    let attach = edge.change == RelationChange::Added;
    let key_of = |entity: &EntityRef, mapping: &Mapping| {
        entity.get(&mapping.primary_key).unwrap_or(Value::Null)
    };
    let store_of = |mapping: &Mapping| stores.name_of(mapping.store.as_deref()).to_string();

    let op = match &edge.write {
        EdgeTarget::OwnerColumn(column) => RelationshipOp::ForeignKey {
            store: store_of(edge.owner_mapping),
            table: edge.owner_mapping.table.clone(),
            column: column.name.clone(),
            value: if attach {
                column_value(&edge.target, edge.target_mapping, &column.referenced_column)
            } else {
                Value::Null
            },
            key_column: edge.owner_mapping.primary_key_column().to_string(),
            key_value: key_of(&edge.owner, edge.owner_mapping),
        },
        EdgeTarget::TargetColumn(column) => RelationshipOp::ForeignKey {
            store: store_of(edge.target_mapping),
            table: edge.target_mapping.table.clone(),
            column: column.name.clone(),
            value: if attach {
                column_value(&edge.owner, edge.owner_mapping, &column.referenced_column)
            } else {
                Value::Null
            },
            key_column: edge.target_mapping.primary_key_column().to_string(),
            key_value: key_of(&edge.target, edge.target_mapping),
        },
        EdgeTarget::JoinTable {
            table,
            owner_is_local,
        } => {
            let ((local, local_mapping), (remote, remote_mapping)) = if *owner_is_local {
                (
                    (&edge.owner, edge.owner_mapping),
                    (&edge.target, edge.target_mapping),
                )
            } else {
                (
                    (&edge.target, edge.target_mapping),
                    (&edge.owner, edge.owner_mapping),
                )
            };
            let local_value =
                column_value(local, local_mapping, &table.join_column.referenced_column);
            let remote_value = column_value(
                remote,
                remote_mapping,
                &table.inverse_join_column.referenced_column,
            );
            if local_value.is_null() || remote_value.is_null() {
                tracing::warn!(table = %table.name, "Skipping join-table write with a NULL side");
                return None;
            }
            let op = if attach {
                LinkTableOp::link(
                    table.name.clone(),
                    table.join_column.name.clone(),
                    local_value,
                    table.inverse_join_column.name.clone(),
                    remote_value,
                )
            } else {
                LinkTableOp::unlink(
                    table.name.clone(),
                    table.join_column.name.clone(),
                    local_value,
                    table.inverse_join_column.name.clone(),
                    remote_value,
                )
            };
            RelationshipOp::LinkTable {
                store: store_of(local_mapping),
                op,
            }
        }
    };

    if let RelationshipOp::ForeignKey {
        key_value, table, ..
    } = &op
    {
        if key_value.is_null() {
            tracing::warn!(table = %table, "Skipping foreign key write for row without primary key");
            return None;
        }
    }
    Some(op)
}

/// Undo staged edges on the entity itself.
fn revert_staged(
    entity: &EntityRef,
    added: &BTreeMap<String, RelationValue>,
    removed: &BTreeMap<String, RelationValue>,
) {
    for (property, value) in added {
        match value {
            RelationValue::One(_) => entity.link_one(property, None),
            RelationValue::Many(items) => {
                for item in items {
                    entity.unlink_many(property, item);
                }
            }
        }
    }
    for (property, value) in removed {
        match value {
            RelationValue::One(target) => entity.link_one(property, target.clone()),
            RelationValue::Many(items) => {
                for item in items {
                    entity.link_many(property, item);
                }
            }
        }
    }
}

/// Remove `target` from the staged edges of `property`. Returns whether it
/// was staged.
fn remove_edge(
    staged: &mut BTreeMap<String, RelationValue>,
    property: &str,
    target: &EntityRef,
) -> bool {
    let Some(value) = staged.get_mut(property) else {
        return false;
    };
    let removed = match value {
        RelationValue::One(Some(current)) if current == target => {
            *value = RelationValue::One(None);
            true
        }
        RelationValue::One(_) => false,
        RelationValue::Many(items) => {
            let before = items.len();
            items.retain(|item| item != target);
            items.len() != before
        }
    };
    if removed && value.targets().is_empty() {
        staged.remove(property);
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitymap_core::{JoinColumn, LifecycleErrorKind, MappingRegistry};

    fn registry() -> MappingRegistry {
        MappingRegistry::new()
            .with(
                Mapping::new("Author", "authors")
                    .field("name")
                    .relation(Relation::one_to_many("books", "Book", "author")),
            )
            .with(
                Mapping::new("Book", "books")
                    .field("title")
                    .relation(
                        Relation::many_to_one("author", "Author", JoinColumn::new("author_id", "id"))
                            .cascade_persist(true),
                    )
                    .relation(Relation::many_to_one(
                        "editor",
                        "Author",
                        JoinColumn::new("editor_id", "id"),
                    )),
            )
    }

    fn clean(uow: &mut UnitOfWork, entity: &EntityRef) {
        uow.register_clean(entity, true);
    }

    #[test]
    fn test_register_new_only_from_unknown() {
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book");
        uow.register_new(&book).unwrap();
        assert_eq!(uow.state_of(&book), EntityState::New);

        let err = uow.register_new(&book).unwrap_err();
        assert_eq!(
            err.lifecycle_kind(),
            Some(LifecycleErrorKind::InvalidStateTransition)
        );
    }

    #[test]
    fn test_register_dirty_accumulates_properties() {
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book");
        clean(&mut uow, &book);

        uow.register_dirty(&book, ["title"]).unwrap();
        uow.register_dirty(&book, ["pages", "title"]).unwrap();
        assert_eq!(uow.state_of(&book), EntityState::Dirty);
        assert_eq!(uow.dirty_properties(&book), vec!["title", "pages"]);
        assert_eq!(uow.pending_counts().dirty, 1);
    }

    #[test]
    fn test_register_dirty_rules() {
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book");
        clean(&mut uow, &book);
        assert!(uow.register_dirty(&book, Vec::<String>::new()).is_err());

        let fresh = EntityRef::new("Book");
        uow.register_new(&fresh).unwrap();
        uow.register_dirty(&fresh, ["title"]).unwrap();
        assert_eq!(uow.state_of(&fresh), EntityState::New);
        assert!(uow.dirty_properties(&fresh).is_empty());

        uow.register_deleted(&book);
        let err = uow.register_dirty(&book, ["title"]).unwrap_err();
        assert_eq!(
            err.lifecycle_kind(),
            Some(LifecycleErrorKind::InvalidStateTransition)
        );
    }

    #[test]
    fn test_deleted_leaves_other_sets() {
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book");
        clean(&mut uow, &book);
        uow.register_dirty(&book, ["title"]).unwrap();
        uow.register_deleted(&book);

        let counts = uow.pending_counts();
        assert_eq!((counts.new, counts.dirty, counts.deleted), (0, 0, 1));
        assert!(uow.dirty_properties(&book).is_empty());
    }

    #[test]
    fn test_add_then_remove_is_a_no_op() {
        let mut uow = UnitOfWork::new();
        let author = EntityRef::new("Author");
        let book = EntityRef::new("Book");
        clean(&mut uow, &author);

        uow.register_collection_change(RelationChange::Added, &author, "books", &book);
        assert!(uow.has_relation_changes(&author));
        uow.register_collection_change(RelationChange::Removed, &author, "books", &book);
        assert!(!uow.has_relation_changes(&author));
        assert!(uow.relation_changed_entities().is_empty());

        uow.register_relation_change(RelationChange::Removed, &book, "author", &author);
        uow.register_relation_change(RelationChange::Added, &book, "author", &author);
        assert!(uow.relation_changed_entities().is_empty());
        assert_eq!(uow.state_of(&book), EntityState::Unknown);
    }

    #[test]
    fn test_single_relation_added_edge_is_replaced() {
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book");
        let first = EntityRef::new("Author");
        let second = EntityRef::new("Author");
        clean(&mut uow, &book);

        uow.register_relation_change(RelationChange::Added, &book, "author", &first);
        uow.register_relation_change(RelationChange::Added, &book, "author", &second);
        let record = uow.record(&book).unwrap();
        assert_eq!(record.added["author"].targets(), vec![second]);
        assert!(record.removed.is_empty());
    }

    #[test]
    fn test_register_clean_reverts_staged_edges() {
        let mut uow = UnitOfWork::new();
        let author = EntityRef::new("Author");
        let kept = EntityRef::new("Book");
        let added = EntityRef::new("Book");
        author.link_many("books", &kept);
        author.attach_feed(uow.feed());
        clean(&mut uow, &author);
        author.activate_proxying();

        author.add_to("books", &added);
        author.remove_from("books", &kept);
        author.set("name", "changed");
        assert_eq!(author.collection("books"), vec![added.clone()]);

        uow.register_clean(&author, false);
        assert_eq!(author.collection("books"), vec![kept]);
        assert_eq!(uow.state_of(&author), EntityState::Clean);
        assert!(uow.dirty_properties(&author).is_empty());
        assert!(!uow.has_changes());
    }

    #[test]
    fn test_feed_mutations_are_absorbed() {
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book");
        let author = EntityRef::new("Author");
        book.attach_feed(uow.feed());
        clean(&mut uow, &book);
        book.activate_proxying();

        book.set("title", "Dune");
        book.set_related("author", Some(author.clone()));
        assert!(uow.has_changes());
        uow.absorb_changes();

        assert_eq!(uow.dirty_properties(&book), vec!["title"]);
        let record = uow.record(&book).unwrap();
        assert_eq!(record.added["author"].targets(), vec![author]);
    }

    #[test]
    fn test_uncascaded_relation_is_rejected() {
        let registry = registry();
        let mut uow = UnitOfWork::new();
        let editor = EntityRef::new("Author");
        let book = EntityRef::new("Book");
        book.link_one("editor", Some(editor.clone()));
        uow.register_new(&book).unwrap();

        let err = uow.prepare_cascades(&registry).unwrap_err();
        assert_eq!(err.lifecycle_kind(), Some(LifecycleErrorKind::UncascadedRelation));
        assert!(err.to_string().contains("Book.editor"));
        assert_eq!(uow.state_of(&editor), EntityState::Unknown);
    }

    #[test]
    fn test_deleted_target_is_rejected_even_with_cascade() {
        let registry = registry();
        let mut uow = UnitOfWork::new();
        let author = EntityRef::new("Author").with("id", 1_i64);
        clean(&mut uow, &author);
        uow.register_deleted(&author);

        let book = EntityRef::new("Book");
        book.link_one("author", Some(author));
        uow.register_new(&book).unwrap();
        let err = uow.prepare_cascades(&registry).unwrap_err();
        assert_eq!(
            err.lifecycle_kind(),
            Some(LifecycleErrorKind::DeletedRelationTarget)
        );
    }

    #[test]
    fn test_cascade_reaches_every_level() {
        let registry = MappingRegistry::new()
            .with(Mapping::new("A", "a").relation(
                Relation::many_to_one("b", "B", JoinColumn::new("b_id", "id")).cascade_persist(true),
            ))
            .with(Mapping::new("B", "b").relation(
                Relation::many_to_one("c", "C", JoinColumn::new("c_id", "id")).cascade_persist(true),
            ))
            .with(Mapping::new("C", "c"));
        let mut uow = UnitOfWork::new();
        let (a, b, c) = (EntityRef::new("A"), EntityRef::new("B"), EntityRef::new("C"));
        a.link_one("b", Some(b.clone()));
        b.link_one("c", Some(c.clone()));
        uow.register_new(&a).unwrap();

        uow.prepare_cascades(&registry).unwrap();
        assert_eq!(uow.new_entities(), vec![a.clone(), b.clone(), c]);
        assert!(uow.has_relation_changes(&a));
        assert!(uow.has_relation_changes(&b));
    }

    #[test]
    fn test_cascade_from_added_edge_of_clean_entity() {
        let registry = registry();
        let mut uow = UnitOfWork::new();
        let book = EntityRef::new("Book").with("id", 3_i64);
        let author = EntityRef::new("Author");
        clean(&mut uow, &book);
        book.link_one("author", Some(author.clone()));
        uow.register_relation_change(RelationChange::Added, &book, "author", &author);

        uow.prepare_cascades_for(&registry, &book).unwrap();
        assert_eq!(uow.state_of(&author), EntityState::New);
    }

    #[test]
    fn test_clear_and_clean() {
        let mut uow = UnitOfWork::new();
        let a = EntityRef::new("Book");
        let b = EntityRef::new("Book");
        uow.register_new(&a).unwrap();
        clean(&mut uow, &b);
        uow.register_dirty(&b, ["title"]).unwrap();

        uow.clear(std::slice::from_ref(&a));
        assert_eq!(uow.state_of(&a), EntityState::Unknown);
        assert_eq!(uow.pending_counts().total(), 1);

        uow.clean();
        assert_eq!(uow.state_of(&b), EntityState::Clean);
        assert!(!uow.has_changes());

        uow.clear_all();
        assert_eq!(uow.state_of(&b), EntityState::Unknown);
    }

    #[test]
    fn test_entity_state_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&EntityState::Deleted).unwrap(), "\"deleted\"");
        assert_eq!(EntityState::default(), EntityState::Unknown);
        assert_eq!(EntityState::Dirty.to_string(), "dirty");
    }
}
