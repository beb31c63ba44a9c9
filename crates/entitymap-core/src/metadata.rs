//! Entity-to-table mapping metadata.
//!
//! A [`Mapping`] describes one entity type: its table, the store it lives in,
//! its primary key, scalar fields and relations. The mapping layer consumes
//! metadata through the [`Metadata`] trait; [`MappingRegistry`] is the
//! in-memory implementation.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The kind of relation between two entity types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationKind {
    /// One `Author` has many `Book`s (foreign key lives on the target table).
    OneToMany,
    /// Many `Book`s belong to one `Author` (foreign key on the owner table).
    ManyToOne,
    /// One-to-one, owned by the side that carries the join column.
    OneToOne,
    /// Many-to-many through a join table.
    ManyToMany,
}

impl RelationKind {
    /// Whether the property holds a collection.
    pub const fn is_collection(self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// A foreign key column and the column it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinColumn {
    /// Foreign key column name.
    pub name: String,
    /// Referenced column on the other table (usually its primary key).
    pub referenced_column: String,
}

impl JoinColumn {
    pub fn new(name: impl Into<String>, referenced_column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

/// Join table for many-to-many relations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinTable {
    /// The join table name (e.g., `"book_tags"`).
    pub name: String,
    /// Column pointing at the owning side (e.g., `book_id -> books.id`).
    pub join_column: JoinColumn,
    /// Column pointing at the target side (e.g., `tag_id -> tags.id`).
    pub inverse_join_column: JoinColumn,
}

impl JoinTable {
    pub fn new(
        name: impl Into<String>,
        join_column: JoinColumn,
        inverse_join_column: JoinColumn,
    ) -> Self {
        Self {
            name: name.into(),
            join_column,
            inverse_join_column,
        }
    }
}

/// Relation descriptor for one relation property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    /// Name of the relation property on the owning entity.
    pub property: String,
    /// Kind of relation.
    pub kind: RelationKind,
    /// Target entity name.
    pub target: String,
    /// On the inverse side: the property on the target that owns the relation.
    pub mapped_by: Option<String>,
    /// On the owning side: the property on the target that points back.
    pub inversed_by: Option<String>,
    /// Unpersisted targets reached through this relation are persisted too.
    pub cascade_persist: bool,
    /// Foreign key descriptor for owning to-one relations.
    pub join_column: Option<JoinColumn>,
    /// Join table descriptor for owning many-to-many relations.
    pub join_table: Option<JoinTable>,
}

impl Relation {
    fn new(property: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            kind,
            target: target.into(),
            mapped_by: None,
            inversed_by: None,
            cascade_persist: false,
            join_column: None,
            join_table: None,
        }
    }

    /// One-to-many, always the inverse side of a many-to-one on the target.
    pub fn one_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut relation = Self::new(property, RelationKind::OneToMany, target);
        relation.mapped_by = Some(mapped_by.into());
        relation
    }

    /// Many-to-one with the foreign key on the owner's table.
    pub fn many_to_one(
        property: impl Into<String>,
        target: impl Into<String>,
        join_column: JoinColumn,
    ) -> Self {
        let mut relation = Self::new(property, RelationKind::ManyToOne, target);
        relation.join_column = Some(join_column);
        relation
    }

    /// Owning side of a one-to-one.
    pub fn one_to_one(
        property: impl Into<String>,
        target: impl Into<String>,
        join_column: JoinColumn,
    ) -> Self {
        let mut relation = Self::new(property, RelationKind::OneToOne, target);
        relation.join_column = Some(join_column);
        relation
    }

    /// Owning side of a many-to-many.
    pub fn many_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        join_table: JoinTable,
    ) -> Self {
        let mut relation = Self::new(property, RelationKind::ManyToMany, target);
        relation.join_table = Some(join_table);
        relation
    }

    /// Inverse side of a one-to-one or many-to-many.
    pub fn inverse(
        property: impl Into<String>,
        kind: RelationKind,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        let mut relation = Self::new(property, kind, target);
        relation.mapped_by = Some(mapped_by.into());
        relation
    }

    /// Set the back-pointing property on the target.
    #[must_use]
    pub fn inversed_by(mut self, property: impl Into<String>) -> Self {
        self.inversed_by = Some(property.into());
        self
    }

    /// Enable/disable persist cascading.
    #[must_use]
    pub fn cascade_persist(mut self, value: bool) -> Self {
        self.cascade_persist = value;
        self
    }

    /// Whether this side carries the join column or join table.
    pub fn is_owning(&self) -> bool {
        self.join_column.is_some() || self.join_table.is_some()
    }

    /// Whether the property holds a collection.
    pub fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }
}

/// A scalar property and the column backing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub property: String,
    pub column: String,
}

/// Mapping of one entity type to its table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Entity type name.
    pub entity: String,
    /// Backing table.
    pub table: String,
    /// Store (connection) name, `None` for the default store.
    pub store: Option<String>,
    /// Primary key property.
    pub primary_key: String,
    /// Scalar fields, primary key included.
    pub fields: Vec<FieldMapping>,
    /// Relation properties.
    pub relations: Vec<Relation>,
}

impl Mapping {
    /// Create a mapping with an `id` primary key stored in column `id`.
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            store: None,
            primary_key: "id".to_string(),
            fields: vec![FieldMapping {
                property: "id".to_string(),
                column: "id".to_string(),
            }],
            relations: Vec::new(),
        }
    }

    /// Use `property` (stored in `column`) as the primary key.
    #[must_use]
    pub fn primary_key(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        let previous = std::mem::replace(&mut self.primary_key, property.into());
        self.fields.retain(|f| f.property != previous);
        let property = self.primary_key.clone();
        self.fields.insert(
            0,
            FieldMapping {
                property,
                column: column.into(),
            },
        );
        self
    }

    /// Add a scalar field stored in a column of the same name.
    #[must_use]
    pub fn field(self, property: impl Into<String>) -> Self {
        let property = property.into();
        let column = property.clone();
        self.column(property, column)
    }

    /// Add a scalar field stored in `column`.
    #[must_use]
    pub fn column(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.fields.push(FieldMapping {
            property: property.into(),
            column: column.into(),
        });
        self
    }

    /// Add a relation property.
    #[must_use]
    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    /// Place the entity in a named store.
    #[must_use]
    pub fn store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    /// Look up a scalar field by property name.
    pub fn field_by_property(&self, property: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.property == property)
    }

    /// Look up a scalar field by column name.
    pub fn field_by_column(&self, column: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.column == column)
    }

    /// Column backing `property`, if it is a scalar field.
    pub fn column_of(&self, property: &str) -> Option<&str> {
        self.field_by_property(property).map(|f| f.column.as_str())
    }

    /// The primary key column.
    pub fn primary_key_column(&self) -> &str {
        self.column_of(&self.primary_key)
            .unwrap_or(self.primary_key.as_str())
    }

    /// Look up a relation by property name.
    pub fn relation_by_property(&self, property: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.property == property)
    }

    /// Whether `property` names a scalar field or a relation.
    pub fn has_property(&self, property: &str) -> bool {
        self.field_by_property(property).is_some() || self.relation_by_property(property).is_some()
    }
}

/// Source of mapping metadata.
pub trait Metadata: Send + Sync {
    /// The mapping for an entity type, if known.
    fn mapping(&self, entity: &str) -> Option<&Mapping>;

    /// The mapping for an entity type, or a mapping error.
    fn require(&self, entity: &str) -> Result<&Mapping> {
        self.mapping(entity)
            .ok_or_else(|| Error::mapping(entity, "no mapping registered"))
    }

    /// The relation `property` on `entity`, or a mapping error.
    fn require_relation(&self, entity: &str, property: &str) -> Result<&Relation> {
        self.require(entity)?
            .relation_by_property(property)
            .ok_or_else(|| Error::mapping(entity, format!("unknown relation '{property}'")))
    }
}

/// In-memory registry of mappings keyed by entity name.
#[derive(Debug, Clone, Default)]
pub struct MappingRegistry {
    mappings: HashMap<String, Mapping>,
}

impl MappingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a mapping, replacing any previous one for the same entity.
    pub fn register(&mut self, mapping: Mapping) {
        self.mappings.insert(mapping.entity.clone(), mapping);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(mut self, mapping: Mapping) -> Self {
        self.register(mapping);
        self
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Check that every relation target is registered and that every
    /// `mapped_by` names an owning relation on the target.
    pub fn validate(&self) -> Result<()> {
        for mapping in self.mappings.values() {
            for relation in &mapping.relations {
                let Some(target) = self.mappings.get(&relation.target) else {
                    return Err(Error::mapping(
                        &mapping.entity,
                        format!(
                            "relation '{}' targets unknown entity '{}'",
                            relation.property, relation.target
                        ),
                    ));
                };
                if let Some(mapped_by) = &relation.mapped_by {
                    let owning = target
                        .relation_by_property(mapped_by)
                        .is_some_and(Relation::is_owning);
                    if !owning {
                        return Err(Error::mapping(
                            &mapping.entity,
                            format!(
                                "relation '{}' is mapped by '{}.{}', which is not an owning relation",
                                relation.property, relation.target, mapped_by
                            ),
                        ));
                    }
                } else if !relation.is_owning() {
                    return Err(Error::mapping(
                        &mapping.entity,
                        format!(
                            "relation '{}' has neither a join descriptor nor mapped_by",
                            relation.property
                        ),
                    ));
                }
            }
        }
        tracing::debug!(entities = self.mappings.len(), "mapping registry validated");
        Ok(())
    }
}

impl Metadata for MappingRegistry {
    fn mapping(&self, entity: &str) -> Option<&Mapping> {
        self.mappings.get(entity)
    }
}
