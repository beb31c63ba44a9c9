//! Shared entity handles with mutation tracking.
//!
//! An [`EntityRef`] is a cheap-to-clone handle to one managed record. Handles
//! compare and hash by their process-unique [`EntityId`], so two handles are
//! equal exactly when they point at the same instance.
//!
//! Writes through the public API (`set`, `set_related`, `add_to`,
//! `remove_from`) are reported on the attached [`ChangeFeed`] once proxying is
//! active. Hydration and commit bookkeeping write through crate-private
//! methods that never report.
//!
//! Relation links never form an ownership cycle. A link whose target can
//! already reach the source through owning links is stored as a weak back
//! reference, so a bidirectional graph such as `Author.books` and
//! `Book.author` is freed once its last outside handle is dropped. Entities
//! hold their feed weakly too: queued mutations hold entities, not the
//! other way round.

use entitymap_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

static NEXT_ENTITY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of an entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    fn next() -> Self {
        Self(NEXT_ENTITY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Direction of a staged relationship change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationChange {
    /// Edge added (`relationship_new`).
    Added,
    /// Edge removed (`relationship_removed`).
    Removed,
}

impl RelationChange {
    /// The opposite change.
    pub const fn inverse(self) -> Self {
        match self {
            RelationChange::Added => RelationChange::Removed,
            RelationChange::Removed => RelationChange::Added,
        }
    }
}

/// Value of a relation property.
#[derive(Clone)]
pub enum RelationValue {
    /// Single-valued relation.
    One(Option<EntityRef>),
    /// Collection-valued relation, in insertion order.
    Many(Vec<EntityRef>),
}

impl RelationValue {
    /// All entities referenced by this value.
    pub fn targets(&self) -> Vec<EntityRef> {
        match self {
            RelationValue::One(target) => target.iter().cloned().collect(),
            RelationValue::Many(targets) => targets.clone(),
        }
    }
}

impl fmt::Debug for RelationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only ids: relation graphs are usually cyclic.
        match self {
            RelationValue::One(None) => write!(f, "One(None)"),
            RelationValue::One(Some(e)) => write!(f, "One({} {})", e.entity(), e.id()),
            RelationValue::Many(items) => {
                let ids: Vec<String> = items.iter().map(|e| e.id().to_string()).collect();
                write!(f, "Many[{}]", ids.join(", "))
            }
        }
    }
}

/// A mutation observed on a proxied entity.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// A scalar property was written.
    Field { entity: EntityRef, property: String },
    /// A single-valued relation gained or lost a target.
    Relation {
        entity: EntityRef,
        property: String,
        change: RelationChange,
        target: EntityRef,
    },
    /// A collection gained or lost a member.
    Collection {
        entity: EntityRef,
        property: String,
        change: RelationChange,
        target: EntityRef,
    },
}

/// Queue of mutations shared between proxied entities and their unit of work.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeed {
    queue: Arc<Mutex<Vec<Mutation>>>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, mutation: Mutation) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(mutation);
    }

    /// Take every queued mutation, oldest first.
    pub fn drain(&self) -> Vec<Mutation> {
        std::mem::take(&mut *self.queue.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether two handles share the same queue.
    pub fn same_as(&self, other: &ChangeFeed) -> bool {
        Arc::ptr_eq(&self.queue, &other.queue)
    }

    fn downgrade(&self) -> FeedHandle {
        FeedHandle(Arc::downgrade(&self.queue))
    }
}

/// Non-owning reference from an entity to its feed.
#[derive(Clone)]
struct FeedHandle(Weak<Mutex<Vec<Mutation>>>);

impl FeedHandle {
    fn upgrade(&self) -> Option<ChangeFeed> {
        self.0.upgrade().map(|queue| ChangeFeed { queue })
    }

    fn points_to(&self, feed: &ChangeFeed) -> bool {
        std::ptr::eq(self.0.as_ptr(), Arc::as_ptr(&feed.queue))
    }
}

/// One stored relation link.
#[derive(Clone)]
enum Link {
    /// The source keeps the target alive.
    Owned(EntityRef),
    /// The target already reaches the source through owning links.
    Back(EntityId, Weak<EntityCell>),
}

impl Link {
    fn id(&self) -> EntityId {
        match self {
            Link::Owned(target) => target.id(),
            Link::Back(id, _) => *id,
        }
    }

    fn get(&self) -> Option<EntityRef> {
        match self {
            Link::Owned(target) => Some(target.clone()),
            Link::Back(_, cell) => cell.upgrade().map(EntityRef),
        }
    }

    fn owned(&self) -> Option<EntityRef> {
        match self {
            Link::Owned(target) => Some(target.clone()),
            Link::Back(..) => None,
        }
    }
}

/// Stored form of a relation property.
#[derive(Clone)]
enum Slot {
    One(Option<Link>),
    Many(Vec<Link>),
}

impl Slot {
    /// Live view of the slot; dropped back references are skipped.
    fn value(&self) -> RelationValue {
        match self {
            Slot::One(link) => RelationValue::One(link.as_ref().and_then(Link::get)),
            Slot::Many(links) => RelationValue::Many(links.iter().filter_map(Link::get).collect()),
        }
    }

    fn owned(&self) -> Vec<EntityRef> {
        match self {
            Slot::One(link) => link.iter().filter_map(Link::owned).collect(),
            Slot::Many(links) => links.iter().filter_map(Link::owned).collect(),
        }
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.value(), f)
    }
}

#[derive(Default)]
struct EntityData {
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, Slot>,
    proxying: bool,
    feed: Option<FeedHandle>,
}

impl EntityData {
    /// The feed to report to, when proxying is active and it still exists.
    fn reporting_feed(&self) -> Option<ChangeFeed> {
        if self.proxying {
            self.feed.as_ref().and_then(FeedHandle::upgrade)
        } else {
            None
        }
    }
}

struct EntityCell {
    id: EntityId,
    entity: String,
    data: RwLock<EntityData>,
}

/// Shared handle to one entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    /// Create a new, unmanaged instance of `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self(Arc::new(EntityCell {
            id: EntityId::next(),
            entity: entity.into(),
            data: RwLock::new(EntityData::default()),
        }))
    }

    /// Builder-style scalar assignment that never reports a mutation.
    #[must_use]
    pub fn with(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.assign(property, value.into());
        self
    }

    pub fn id(&self) -> EntityId {
        self.0.id
    }

    /// Entity type name.
    pub fn entity(&self) -> &str {
        &self.0.entity
    }

    fn read(&self) -> RwLockReadGuard<'_, EntityData> {
        self.0.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, EntityData> {
        self.0.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `goal` is reachable from this entity through owning links.
    fn reaches(&self, goal: EntityId) -> bool {
        let mut stack = vec![self.clone()];
        let mut seen = HashSet::new();
        while let Some(current) = stack.pop() {
            if current.id() == goal {
                return true;
            }
            if !seen.insert(current.id()) {
                continue;
            }
            let owned: Vec<EntityRef> = current
                .read()
                .relations
                .values()
                .flat_map(Slot::owned)
                .collect();
            stack.extend(owned);
        }
        false
    }

    /// Link from this entity to `target`, owning unless that closes a cycle.
    fn link_to(&self, target: &EntityRef) -> Link {
        if target.reaches(self.id()) {
            Link::Back(target.id(), Arc::downgrade(&target.0))
        } else {
            Link::Owned(target.clone())
        }
    }

    /// Current value of a scalar property.
    pub fn get(&self, property: &str) -> Option<Value> {
        self.read().fields.get(property).cloned()
    }

    /// Whether a scalar property has been assigned.
    pub fn is_set(&self, property: &str) -> bool {
        self.read().fields.contains_key(property)
    }

    /// Snapshot of every scalar property.
    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.read().fields.clone()
    }

    /// Names of the relation properties that hold a value.
    pub fn relation_names(&self) -> Vec<String> {
        self.read().relations.keys().cloned().collect()
    }

    /// Current value of a relation property.
    pub fn relation(&self, property: &str) -> Option<RelationValue> {
        self.read().relations.get(property).map(Slot::value)
    }

    /// Target of a single-valued relation.
    pub fn related(&self, property: &str) -> Option<EntityRef> {
        match self.relation(property) {
            Some(RelationValue::One(target)) => target,
            _ => None,
        }
    }

    /// Members of a collection relation.
    pub fn collection(&self, property: &str) -> Vec<EntityRef> {
        match self.relation(property) {
            Some(RelationValue::Many(items)) => items,
            _ => Vec::new(),
        }
    }

    /// Every entity referenced through `property`, single or collection.
    pub fn targets(&self, property: &str) -> Vec<EntityRef> {
        self.relation(property)
            .map(|value| value.targets())
            .unwrap_or_default()
    }

    /// Write a scalar property.
    pub fn set(&self, property: impl Into<String>, value: impl Into<Value>) {
        let property = property.into();
        let feed = {
            let mut data = self.write();
            data.fields.insert(property.clone(), value.into());
            data.reporting_feed()
        };
        if let Some(feed) = feed {
            feed.push(Mutation::Field {
                entity: self.clone(),
                property,
            });
        }
    }

    /// Point a single-valued relation at `target` (or clear it).
    pub fn set_related(&self, property: impl Into<String>, target: Option<EntityRef>) {
        let property = property.into();
        let link = target.as_ref().map(|t| self.link_to(t));
        let (previous, feed) = {
            let mut data = self.write();
            let previous = match data.relations.insert(property.clone(), Slot::One(link)) {
                Some(Slot::One(previous)) => previous.as_ref().and_then(Link::get),
                _ => None,
            };
            (previous, data.reporting_feed())
        };
        let Some(feed) = feed else {
            return;
        };
        if previous == target {
            return;
        }
        if let Some(previous) = previous {
            feed.push(Mutation::Relation {
                entity: self.clone(),
                property: property.clone(),
                change: RelationChange::Removed,
                target: previous,
            });
        }
        if let Some(target) = target {
            feed.push(Mutation::Relation {
                entity: self.clone(),
                property,
                change: RelationChange::Added,
                target,
            });
        }
    }

    /// Add `target` to a collection relation. Adding a present member is a no-op.
    pub fn add_to(&self, property: impl Into<String>, target: &EntityRef) {
        let property = property.into();
        let link = self.link_to(target);
        let feed = {
            let mut data = self.write();
            if !push_unique(&mut data.relations, &property, link) {
                return;
            }
            data.reporting_feed()
        };
        if let Some(feed) = feed {
            feed.push(Mutation::Collection {
                entity: self.clone(),
                property,
                change: RelationChange::Added,
                target: target.clone(),
            });
        }
    }

    /// Remove `target` from a collection relation. Removing an absent member is a no-op.
    pub fn remove_from(&self, property: impl Into<String>, target: &EntityRef) {
        let property = property.into();
        let feed = {
            let mut data = self.write();
            let removed = match data.relations.get_mut(&property) {
                Some(Slot::Many(links)) => {
                    let before = links.len();
                    links.retain(|link| link.id() != target.id());
                    links.len() != before
                }
                _ => false,
            };
            if !removed {
                return;
            }
            data.reporting_feed()
        };
        if let Some(feed) = feed {
            feed.push(Mutation::Collection {
                entity: self.clone(),
                property,
                change: RelationChange::Removed,
                target: target.clone(),
            });
        }
    }

    /// Start reporting public writes to the attached feed.
    pub fn activate_proxying(&self) {
        self.write().proxying = true;
    }

    /// Stop reporting writes; the entity becomes a plain record again.
    pub fn deactivate_proxying(&self) {
        self.write().proxying = false;
    }

    pub fn is_proxied(&self) -> bool {
        self.read().proxying
    }

    /// Whether this entity reports to `feed`.
    pub fn is_attached_to(&self, feed: &ChangeFeed) -> bool {
        self.read().feed.as_ref().is_some_and(|own| own.points_to(feed))
    }

    pub(crate) fn attach_feed(&self, feed: &ChangeFeed) {
        self.write().feed = Some(feed.downgrade());
    }

    pub(crate) fn assign(&self, property: impl Into<String>, value: Value) {
        self.write().fields.insert(property.into(), value);
    }

    pub(crate) fn clear_field(&self, property: &str) {
        self.write().fields.remove(property);
    }

    pub(crate) fn link_one(&self, property: &str, target: Option<EntityRef>) {
        let link = target.as_ref().map(|t| self.link_to(t));
        self.write()
            .relations
            .insert(property.to_string(), Slot::One(link));
    }

    pub(crate) fn link_many(&self, property: &str, target: &EntityRef) {
        let link = self.link_to(target);
        push_unique(&mut self.write().relations, property, link);
    }

    pub(crate) fn unlink_many(&self, property: &str, target: &EntityRef) {
        if let Some(Slot::Many(links)) = self.write().relations.get_mut(property) {
            links.retain(|link| link.id() != target.id());
        }
    }

    /// Make sure a collection property exists, even if empty.
    pub(crate) fn ensure_collection(&self, property: &str) {
        self.write()
            .relations
            .entry(property.to_string())
            .or_insert_with(|| Slot::Many(Vec::new()));
    }
}

fn push_unique(relations: &mut BTreeMap<String, Slot>, property: &str, link: Link) -> bool {
    let slot = relations
        .entry(property.to_string())
        .or_insert_with(|| Slot::Many(Vec::new()));
    match slot {
        Slot::Many(links) => {
            if links.iter().any(|existing| existing.id() == link.id()) {
                false
            } else {
                links.push(link);
                true
            }
        }
        Slot::One(_) => {
            *slot = Slot::Many(vec![link]);
            true
        }
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.read();
        f.debug_struct("EntityRef")
            .field("entity", &self.0.entity)
            .field("id", &self.0.id)
            .field("fields", &data.fields)
            .field("relations", &data.relations)
            .field("proxying", &data.proxying)
            .finish()
    }
}
