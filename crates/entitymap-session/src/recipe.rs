//! Hydration plans.
//!
//! A plan is a tree of [`Recipe`] nodes stored in an arena and addressed by
//! [`RecipeId`]; parent and child links are indices, so the tree holds no
//! reference cycles.

use crate::entity::EntityRef;
use entitymap_core::{Error, KeyValue, Mapping, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Index of a recipe in its tree.
pub type RecipeId = usize;

/// How a child recipe attaches to its parent's property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    /// The property holds at most one entity.
    Single,
    /// The property holds a collection; rows append.
    Collection,
}

/// Distinct instances seen for one alias across a result set, in first-seen order.
#[derive(Debug, Default, Clone)]
pub struct Catalogue {
    entities: HashMap<KeyValue, EntityRef>,
    keys: Vec<KeyValue>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `entity` under `key`. Returns `false` if the key was already present.
    pub fn record(&mut self, key: Value, entity: &EntityRef) -> bool {
        let key = KeyValue::new(key);
        if self.entities.contains_key(&key) {
            return false;
        }
        self.keys.push(key.clone());
        self.entities.insert(key, entity.clone());
        true
    }

    pub fn get(&self, key: &Value) -> Option<&EntityRef> {
        self.entities.get(&KeyValue::new(key.clone()))
    }

    pub fn contains(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Primary keys in first-seen order.
    pub fn primary_keys(&self) -> Vec<Value> {
        self.keys.iter().map(|k| k.value().clone()).collect()
    }

    /// Instances in first-seen order.
    pub fn entities(&self) -> Vec<EntityRef> {
        self.keys
            .iter()
            .filter_map(|k| self.entities.get(k).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// One node of a hydration plan.
#[derive(Debug, Clone)]
pub struct Recipe {
    /// Alias, unique within the tree.
    pub alias: String,
    /// Mapping of the entity this node builds.
    pub mapping: Arc<Mapping>,
    /// Result column holding the primary key.
    pub pk_alias: String,
    /// `None` for the root.
    pub join: Option<JoinType>,
    /// Parent property this node fills; `None` for the root.
    pub property: Option<String>,
    /// Result column alias -> scalar property, in assignment order.
    pub columns: Vec<(String, String)>,
    pub children: Vec<RecipeId>,
    pub parent: Option<RecipeId>,
    /// Disabled recipes hydrate to nothing.
    pub hydrate: bool,
    pub catalogue: Option<Catalogue>,
}

impl Recipe {
    fn new(
        alias: String,
        mapping: Arc<Mapping>,
        join: Option<JoinType>,
        property: Option<String>,
        parent: Option<RecipeId>,
    ) -> Self {
        let columns = mapping
            .fields
            .iter()
            .map(|f| (format!("{alias}.{}", f.column), f.property.clone()))
            .collect();
        let pk_alias = format!("{alias}.{}", mapping.primary_key_column());
        Self {
            alias,
            mapping,
            pk_alias,
            join,
            property,
            columns,
            children: Vec::new(),
            parent,
            hydrate: true,
            catalogue: None,
        }
    }

    /// Map more result columns onto properties, replacing existing entries
    /// for the same column.
    pub fn add_columns<I, K, V>(&mut self, columns: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (column, property) in columns {
            let column = column.into();
            let property = property.into();
            match self.columns.iter_mut().find(|(c, _)| *c == column) {
                Some(entry) => entry.1 = property,
                None => self.columns.push((column, property)),
            }
        }
    }
}

/// Arena of recipes indexed by alias.
#[derive(Debug, Default, Clone)]
pub struct RecipeTree {
    nodes: Vec<Option<Recipe>>,
    by_alias: HashMap<String, RecipeId>,
    root: Option<RecipeId>,
}

impl RecipeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. A `None` parent makes it the root.
    pub fn add(
        &mut self,
        parent_alias: Option<&str>,
        alias: &str,
        mapping: Arc<Mapping>,
        join: Option<JoinType>,
        property: Option<&str>,
    ) -> Result<RecipeId> {
        if self.by_alias.contains_key(alias) {
            return Err(Error::Custom(format!(
                "recipe alias '{alias}' is already registered"
            )));
        }

        let id = self.nodes.len();
        match parent_alias {
            None => {
                if self.root.is_some() {
                    return Err(Error::Custom(format!(
                        "cannot add '{alias}' as a second root recipe"
                    )));
                }
                self.nodes
                    .push(Some(Recipe::new(alias.to_string(), mapping, None, None, None)));
                self.root = Some(id);
            }
            Some(parent_alias) => {
                let parent = self.id_of(parent_alias)?;
                let (Some(join), Some(property)) = (join, property) else {
                    return Err(Error::Custom(format!(
                        "joined recipe '{alias}' needs a join type and a parent property"
                    )));
                };
                self.nodes.push(Some(Recipe::new(
                    alias.to_string(),
                    mapping,
                    Some(join),
                    Some(property.to_string()),
                    Some(parent),
                )));
                if let Some(Some(parent)) = self.nodes.get_mut(parent) {
                    parent.children.push(id);
                }
            }
        }
        self.by_alias.insert(alias.to_string(), id);
        Ok(id)
    }

    /// Remove a node and its whole subtree.
    pub fn remove(&mut self, alias: &str) -> Result<()> {
        let id = self.id_of(alias)?;
        let parent = self.get(id).and_then(|r| r.parent);
        if let Some(Some(parent)) = parent.and_then(|p| self.nodes.get_mut(p)) {
            parent.children.retain(|child| *child != id);
        }
        if self.root == Some(id) {
            self.root = None;
        }

        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(recipe) = self.nodes.get_mut(next).and_then(Option::take) {
                self.by_alias.remove(&recipe.alias);
                pending.extend(recipe.children);
            }
        }
        Ok(())
    }

    pub fn root(&self) -> Option<RecipeId> {
        self.root
    }

    pub fn id_of(&self, alias: &str) -> Result<RecipeId> {
        self.by_alias
            .get(alias)
            .copied()
            .ok_or_else(|| Error::Custom(format!("unknown recipe alias '{alias}'")))
    }

    pub fn get(&self, id: RecipeId) -> Option<&Recipe> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: RecipeId) -> Option<&mut Recipe> {
        self.nodes.get_mut(id).and_then(Option::as_mut)
    }

    pub fn by_alias(&self, alias: &str) -> Option<&Recipe> {
        self.by_alias.get(alias).and_then(|id| self.get(*id))
    }

    pub fn by_alias_mut(&mut self, alias: &str) -> Result<&mut Recipe> {
        let id = self.id_of(alias)?;
        self.get_mut(id)
            .ok_or_else(|| Error::Custom(format!("unknown recipe alias '{alias}'")))
    }

    /// Live recipes, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Recipe> {
        self.nodes.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.by_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_alias.is_empty()
    }
}
