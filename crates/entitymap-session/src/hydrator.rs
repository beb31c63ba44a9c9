//! Row-to-graph hydration.
//!
//! The [`Hydrator`] owns a recipe tree and turns flat, aliased rows into
//! entity graphs. Rows that repeat because of one-to-many join fan-out
//! resolve to the same instance through the identity map, and collection
//! properties accumulate across rows.
//!
//! In *managed* mode every newly constructed entity is attached to the unit
//! of work's change feed, registered as clean and proxied once all of its
//! assignments are done. Unmanaged hydration only fills the identity map.

use crate::entity::EntityRef;
use crate::identity_map::IdentityMap;
use crate::recipe::{Catalogue, JoinType, RecipeId, RecipeTree};
use crate::unit_of_work::UnitOfWork;
use entitymap_core::{Error, Mapping, Metadata, Result, Row, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Session state hydration reads and writes.
pub struct HydrationContext<'a> {
    pub metadata: &'a dyn Metadata,
    pub identity_map: &'a mut IdentityMap,
    /// Present in managed mode.
    pub unit_of_work: Option<&'a mut UnitOfWork>,
}

impl<'a> HydrationContext<'a> {
    /// Hydrate into the identity map and register with the unit of work.
    pub fn managed(
        metadata: &'a dyn Metadata,
        identity_map: &'a mut IdentityMap,
        unit_of_work: &'a mut UnitOfWork,
    ) -> Self {
        Self {
            metadata,
            identity_map,
            unit_of_work: Some(unit_of_work),
        }
    }

    /// Hydrate into the identity map only.
    pub fn unmanaged(metadata: &'a dyn Metadata, identity_map: &'a mut IdentityMap) -> Self {
        Self {
            metadata,
            identity_map,
            unit_of_work: None,
        }
    }

    pub fn is_managed(&self) -> bool {
        self.unit_of_work.is_some()
    }
}

/// Builds entity graphs from rows following a recipe tree.
#[derive(Debug, Default, Clone)]
pub struct Hydrator {
    tree: RecipeTree,
}

impl Hydrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a recipe. With no parent alias it becomes the root; otherwise
    /// it is attached under the parent and fills `property` on it.
    pub fn add_recipe(
        &mut self,
        parent_alias: Option<&str>,
        alias: &str,
        mapping: &Mapping,
        join: Option<JoinType>,
        property: Option<&str>,
    ) -> Result<RecipeId> {
        if let (Some(parent_alias), Some(property)) = (parent_alias, property) {
            let parent = self.tree.id_of(parent_alias)?;
            let parent_mapping = self
                .tree
                .get(parent)
                .map(|r| Arc::clone(&r.mapping))
                .ok_or_else(|| Error::Custom(format!("unknown recipe alias '{parent_alias}'")))?;
            if parent_mapping.relation_by_property(property).is_none() {
                return Err(Error::mapping(
                    &parent_mapping.entity,
                    format!("unknown relation '{property}'"),
                ));
            }
        }
        self.tree
            .add(parent_alias, alias, Arc::new(mapping.clone()), join, property)
    }

    /// Remove a recipe and everything joined under it.
    pub fn remove_recipe(&mut self, alias: &str) -> Result<()> {
        self.tree.remove(alias)
    }

    /// Map extra result columns onto properties of `alias`'s entity.
    pub fn add_columns<I, K, V>(&mut self, alias: &str, columns: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.tree.by_alias_mut(alias)?.add_columns(columns);
        Ok(())
    }

    /// Enable or disable hydration for `alias`.
    pub fn set_hydrate(&mut self, alias: &str, hydrate: bool) -> Result<()> {
        self.tree.by_alias_mut(alias)?.hydrate = hydrate;
        Ok(())
    }

    /// Start accumulating distinct instances seen for `alias`.
    pub fn enable_catalogue(&mut self, alias: &str) -> Result<()> {
        let recipe = self.tree.by_alias_mut(alias)?;
        if recipe.catalogue.is_none() {
            recipe.catalogue = Some(Catalogue::new());
        }
        Ok(())
    }

    pub fn has_catalogue(&self, alias: &str) -> bool {
        self.tree
            .by_alias(alias)
            .is_some_and(|r| r.catalogue.is_some())
    }

    pub fn catalogue(&self, alias: &str) -> Option<&Catalogue> {
        self.tree.by_alias(alias).and_then(|r| r.catalogue.as_ref())
    }

    /// Empty the catalogue for `alias`, keeping it enabled.
    pub fn clear_catalogue(&mut self, alias: &str) -> Result<()> {
        if let Some(catalogue) = self.tree.by_alias_mut(alias)?.catalogue.as_mut() {
            *catalogue = Catalogue::new();
        }
        Ok(())
    }

    pub fn recipes(&self) -> &RecipeTree {
        &self.tree
    }

    pub fn root(&self) -> Option<RecipeId> {
        self.tree.root()
    }

    /// Mapping of the root recipe.
    pub fn root_mapping(&self) -> Option<&Mapping> {
        self.tree
            .root()
            .and_then(|id| self.tree.get(id))
            .map(|r| r.mapping.as_ref())
    }

    /// Hydrate one row against `recipe`, linking the result onto `parent`.
    ///
    /// Returns `None` when the recipe is disabled or the row carries no
    /// primary key for it (an outer join that matched nothing).
    pub fn hydrate(
        &mut self,
        row: &Row,
        recipe: RecipeId,
        parent: Option<&EntityRef>,
        ctx: &mut HydrationContext<'_>,
    ) -> Option<EntityRef> {
        let node = self.tree.get(recipe)?;
        if !node.hydrate {
            return None;
        }

        let key = row.get_by_name(&node.pk_alias).cloned().unwrap_or(Value::Null);
        if key.is_null() {
            return None;
        }

        let mapping = Arc::clone(&node.mapping);
        let join = node.join;
        let property = node.property.clone();
        let children = node.children.clone();

        let (entity, constructed) = match ctx.identity_map.fetch(&mapping.entity, &key) {
            Some(existing) => (existing, false),
            None => {
                let entity = EntityRef::new(mapping.entity.clone());
                entity.assign(mapping.primary_key.clone(), key.clone());
                for (column, prop) in &node.columns {
                    if prop == &mapping.primary_key {
                        continue;
                    }
                    if let Some(value) = row.get_by_name(column) {
                        entity.assign(prop.clone(), value.clone());
                    }
                }
                if node.parent.is_none() {
                    // Unaliased columns that name a still-unset property.
                    for (name, value) in row.iter() {
                        if mapping.field_by_property(name).is_some() && !entity.is_set(name) {
                            entity.assign(name, value.clone());
                        }
                    }
                }
                for relation in mapping.relations.iter().filter(|r| r.is_collection()) {
                    entity.ensure_collection(&relation.property);
                }
                if let Some(uow) = ctx.unit_of_work.as_deref_mut() {
                    entity.attach_feed(uow.feed());
                    uow.register_clean(&entity, true);
                }
                let entity = ctx.identity_map.register(&entity, key.clone());
                (entity, true)
            }
        };

        if let Some(catalogue) = self
            .tree
            .get_mut(recipe)
            .and_then(|r| r.catalogue.as_mut())
        {
            catalogue.record(key, &entity);
        }

        if let (Some(parent), Some(join), Some(property)) = (parent, join, property.as_deref()) {
            match join {
                JoinType::Single => parent.link_one(property, Some(entity.clone())),
                JoinType::Collection => parent.link_many(property, &entity),
            }
        }

        for child in children {
            let hydrated = self.hydrate(row, child, Some(&entity), ctx);
            if hydrated.is_none() {
                if let Some(child_node) = self.tree.get(child) {
                    if let (Some(JoinType::Single), Some(property)) =
                        (child_node.join, child_node.property.as_deref())
                    {
                        entity.link_one(property, None);
                    }
                }
            }
        }

        if constructed && ctx.is_managed() {
            entity.activate_proxying();
        }

        Some(entity)
    }

    /// Hydrate every row against the root recipe.
    ///
    /// Returns one entry per distinct root instance, in first-seen order.
    #[tracing::instrument(level = "trace", skip_all, fields(rows = rows.len()))]
    pub fn hydrate_all(&mut self, rows: &[Row], ctx: &mut HydrationContext<'_>) -> Vec<EntityRef> {
        let Some(root) = self.tree.root() else {
            tracing::debug!("No root recipe registered, nothing to hydrate");
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for row in rows {
            if let Some(entity) = self.hydrate(row, root, None, ctx) {
                if seen.insert(entity.id()) {
                    result.push(entity);
                }
            }
        }
        tracing::trace!(entities = result.len(), "Hydrated result set");
        result
    }

    /// Build an unmanaged entity straight from property values, without a
    /// recipe or the identity map. Unknown properties are ignored.
    pub fn from_schema<I, K>(mapping: &Mapping, values: I) -> EntityRef
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let entity = EntityRef::new(mapping.entity.clone());
        for (property, value) in values {
            let property = property.as_ref();
            if mapping.field_by_property(property).is_some() {
                entity.assign(property, value);
            }
        }
        entity
    }
}
