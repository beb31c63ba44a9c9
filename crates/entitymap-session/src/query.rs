//! Statement execution and graph hydration.
//!
//! A [`Query`] pairs one `SELECT` with the [`Hydrator`] that turns its rows
//! into entities. One-to-many and many-to-many relations can be fetched by
//! child queries instead of joins: after the parent rows are hydrated, each
//! child is restricted to the parent keys its catalogue collected, all
//! children are fetched concurrently and their rows are hydrated onto the
//! parents already in the identity map.

use crate::config::{QueryOptions, query_logging_enabled};
use crate::entity::{EntityId, EntityRef};
use crate::flush::split;
use crate::hydrator::{HydrationContext, Hydrator};
use crate::recipe::Catalogue;
use crate::store::Stores;
use asupersync::{Cx, Outcome};
use entitymap_core::{
    Connection, Dialect, Error, Mapping, Metadata, Result, Row, Value, try_outcome, try_result,
};
use entitymap_query::{Select, Statement};
use futures::FutureExt;
use futures::future::{LocalBoxFuture, join_all};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Limits a query to the rows of a known set of parents.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentRestriction {
    /// Column holding the parent key, e.g. `b.author_id`.
    pub column: String,
    pub primary_keys: Vec<Value>,
}

impl ParentRestriction {
    pub fn new(column: impl Into<String>, primary_keys: Vec<Value>) -> Self {
        Self {
            column: column.into(),
            primary_keys,
        }
    }
}

#[derive(Debug)]
struct ChildQuery {
    query: Query,
    /// Column of the child statement compared against parent keys.
    column: String,
    /// Parent recipe whose catalogue supplies the keys.
    parent_alias: String,
}

/// A statement, its hydration plan and its child queries.
#[derive(Debug)]
pub struct Query {
    store: Option<String>,
    statement: Select,
    hydrator: Hydrator,
    parent: Option<ParentRestriction>,
    children: Vec<ChildQuery>,
}

impl Query {
    /// Create a query against the default store.
    pub fn new(statement: Select, hydrator: Hydrator) -> Self {
        Self {
            store: None,
            statement,
            hydrator,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Run against a named store (builder pattern).
    #[must_use]
    pub fn on_store(mut self, store: impl Into<String>) -> Self {
        self.store = Some(store.into());
        self
    }

    pub fn store(&self) -> Option<&str> {
        self.store.as_deref()
    }

    pub fn statement(&self) -> &Select {
        &self.statement
    }

    pub fn hydrator(&self) -> &Hydrator {
        &self.hydrator
    }

    pub fn hydrator_mut(&mut self) -> &mut Hydrator {
        &mut self.hydrator
    }

    pub fn parent(&self) -> Option<&ParentRestriction> {
        self.parent.as_ref()
    }

    /// Number of direct child queries.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Add a child query restricted on `column` to the keys hydrated for
    /// `parent_alias`.
    ///
    /// The child's hydrator is expected to re-select the parent key under the
    /// parent's alias so its rows link onto the instances this query
    /// hydrated.
    #[allow(clippy::result_large_err)]
    pub fn add_child(
        &mut self,
        child: Query,
        column: impl Into<String>,
        parent_alias: impl Into<String>,
    ) -> Result<()> {
        let parent_alias = parent_alias.into();
        self.hydrator.enable_catalogue(&parent_alias)?;
        self.children.push(ChildQuery {
            query: child,
            column: column.into(),
            parent_alias,
        });
        Ok(())
    }

    pub fn set_parent(&mut self, restriction: ParentRestriction) {
        self.parent = Some(restriction);
    }

    /// The statement to run, or `None` when the parent restriction has no
    /// keys and the query cannot match anything.
    ///
    /// Several keys become one equality-filtered copy of the statement per
    /// key, joined with `UNION`.
    pub fn restricted(&self) -> Option<Select> {
        let Some(parent) = &self.parent else {
            return Some(self.statement.clone());
        };
        let column = &parent.column;
        match parent.primary_keys.as_slice() {
            [] => None,
            [key] => Some(self.statement.clone().where_eq(column.clone(), key.clone())),
            [first, rest @ ..] => {
                let mut select = self.statement.clone().where_eq(column.clone(), first.clone());
                for key in rest {
                    select = select.union(self.statement.clone().where_eq(column.clone(), key.clone()));
                }
                Some(select)
            }
        }
    }

    /// Render the statement with values inlined, for diagnostics.
    pub fn get_sql(&self, dialect: Dialect) -> String {
        match (self.restricted(), &self.parent) {
            (Some(select), _) => select.to_sql_string(dialect),
            (None, Some(parent)) => self
                .statement
                .clone()
                .where_in(parent.column.clone(), Vec::new())
                .to_sql_string(dialect),
            (None, None) => self.statement.to_sql_string(dialect),
        }
    }

    /// Run the statement and return its rows.
    #[tracing::instrument(level = "debug", skip_all, fields(table = %self.statement.table()))]
    pub async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        stores: &Stores<C>,
    ) -> Outcome<Vec<Row>, Error> {
        let Some(select) = self.restricted() else {
            tracing::debug!("Parent restriction has no keys, skipping query");
            return Outcome::Ok(Vec::new());
        };
        let conn = try_result!(stores.get(self.store.as_deref()));
        let dialect = conn.dialect();
        let (sql, params) = select.build(dialect);
        if query_logging_enabled() {
            tracing::debug!(sql = %select.to_sql_string(dialect), "Executing query");
        }
        let rows = try_outcome!(conn.query(cx, &sql, &params).await);
        tracing::trace!(rows = rows.len(), "Query returned");
        Outcome::Ok(rows)
    }

    /// Execute, hydrate, resolve child queries and shape the result.
    ///
    /// Shaping runs only when `options` names both fields and populated
    /// relations. The shaped entities are detached copies: the managed
    /// instances in the identity map keep every field. Shaping never fails
    /// the read: an invalid populate path is logged and the unshaped result
    /// is returned.
    pub async fn get_result<C: Connection>(
        &mut self,
        cx: &Cx,
        stores: &Stores<C>,
        ctx: &mut HydrationContext<'_>,
        options: &QueryOptions,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let rows = try_outcome!(self.execute(cx, stores).await);
        let result = try_outcome!(self.hydrate_tree(cx, stores, rows, ctx).await);

        if options.needs_shaping() {
            if let Some(mapping) = self.hydrator.root_mapping() {
                match shape(ctx.metadata, mapping, &result, options) {
                    Ok(shaped) => return Outcome::Ok(shaped),
                    Err(e) => tracing::debug!(error = %e, "Skipping populate shaping"),
                }
            }
        }
        Outcome::Ok(result)
    }

    /// First column of the first row, for aggregates.
    pub async fn get_single_scalar_result<C: Connection>(
        &self,
        cx: &Cx,
        stores: &Stores<C>,
    ) -> Outcome<Option<Value>, Error> {
        let rows = try_outcome!(self.execute(cx, stores).await);
        Outcome::Ok(rows.first().and_then(|row| row.get(0)).cloned())
    }

    fn hydrate_tree<'a, 'b, C: Connection>(
        &'a mut self,
        cx: &'a Cx,
        stores: &'a Stores<C>,
        rows: Vec<Row>,
        ctx: &'a mut HydrationContext<'b>,
    ) -> LocalBoxFuture<'a, Outcome<Vec<EntityRef>, Error>> {
        async move {
            for child in &self.children {
                try_result!(self.hydrator.clear_catalogue(&child.parent_alias));
            }
            let result = self.hydrator.hydrate_all(&rows, ctx);
            if self.children.is_empty() {
                return Outcome::Ok(result);
            }

            for child in &mut self.children {
                let keys = self
                    .hydrator
                    .catalogue(&child.parent_alias)
                    .map(Catalogue::primary_keys)
                    .unwrap_or_default();
                child
                    .query
                    .set_parent(ParentRestriction::new(child.column.clone(), keys));
            }

            tracing::debug!(children = self.children.len(), "Fetching child queries");
            let fetched = join_all(
                self.children
                    .iter()
                    .map(|child| child.query.execute(cx, stores)),
            )
            .await;

            let mut failure = None;
            let mut child_rows = Vec::with_capacity(fetched.len());
            for outcome in fetched {
                match split::<Vec<Row>, Vec<EntityRef>>(outcome) {
                    Ok(rows) => child_rows.push(rows),
                    Err(f) => {
                        failure.get_or_insert(f);
                    }
                }
            }
            if let Some(failure) = failure {
                return failure;
            }

            for (child, rows) in self.children.iter_mut().zip(child_rows) {
                try_outcome!(child.query.hydrate_tree(cx, stores, rows, &mut *ctx).await);
            }
            Outcome::Ok(result)
        }
        .boxed_local()
    }
}

/// Requested shape below one entity type.
#[derive(Debug, Default)]
struct ShapeNode {
    entity: String,
    /// Whether the relation leading here holds a collection.
    collection: bool,
    /// `None` keeps every field.
    fields: Option<HashSet<String>>,
    relations: BTreeMap<String, ShapeNode>,
}

impl ShapeNode {
    fn new(entity: &str) -> Self {
        Self {
            entity: entity.to_string(),
            ..Self::default()
        }
    }

    fn keeps(&self, field: &str) -> bool {
        self.fields.as_ref().is_none_or(|fields| fields.contains(field))
    }
}

/// Build the shape tree for `options`, checking every path against metadata.
#[allow(clippy::result_large_err)]
fn shape_tree(metadata: &dyn Metadata, root: &Mapping, options: &QueryOptions) -> Result<ShapeNode> {
    let mut tree = ShapeNode::new(&root.entity);

    for path in &options.populate {
        let mut node = &mut tree;
        for segment in path.split('.') {
            let relation = metadata.require_relation(&node.entity, segment)?;
            node = node
                .relations
                .entry(segment.to_string())
                .or_insert_with(|| ShapeNode {
                    collection: relation.is_collection(),
                    ..ShapeNode::new(&relation.target)
                });
        }
    }

    for field in options.fields.iter().flatten() {
        let (prefix, property) = match field.rsplit_once('.') {
            Some((prefix, property)) => (Some(prefix), property),
            None => (None, field.as_str()),
        };
        let mut node = &mut tree;
        for segment in prefix.into_iter().flat_map(|p| p.split('.')) {
            let entity = node.entity.clone();
            let Some(child) = node.relations.get_mut(segment) else {
                return Err(Error::mapping(
                    entity,
                    format!("field '{field}' is below a relation that is not populated"),
                ));
            };
            node = child;
        }
        let mapping = metadata.require(&node.entity)?;
        if mapping.field_by_property(property).is_none() {
            return Err(Error::mapping(
                &node.entity,
                format!("unknown field '{property}'"),
            ));
        }
        node.fields
            .get_or_insert_with(|| HashSet::from([mapping.primary_key.clone()]))
            .insert(property.to_string());
    }

    Ok(tree)
}

/// Copy `entities` keeping only the fields and relations the caller asked for.
///
/// The copies are unmanaged: no feed, no proxying, not in the identity map.
/// An instance reached twice is copied once, so shared targets stay shared.
#[allow(clippy::result_large_err)]
fn shape(
    metadata: &dyn Metadata,
    root: &Mapping,
    entities: &[EntityRef],
    options: &QueryOptions,
) -> Result<Vec<EntityRef>> {
    let tree = shape_tree(metadata, root, options)?;
    let mut copies = HashMap::new();
    let mut queue = VecDeque::new();
    let shaped = entities
        .iter()
        .map(|entity| shaped_copy(entity, &tree, &mut copies, &mut queue))
        .collect();

    // Breadth first, so every copy is linked from its parent before it links
    // back and the back link is the one held weakly.
    while let Some((original, node)) = queue.pop_front() {
        let Some(copy) = copies.get(&original.id()).cloned() else {
            continue;
        };
        for (property, child) in &node.relations {
            if child.collection {
                copy.ensure_collection(property);
                for target in original.collection(property) {
                    let target = shaped_copy(&target, child, &mut copies, &mut queue);
                    copy.link_many(property, &target);
                }
            } else {
                let target = original
                    .related(property)
                    .map(|target| shaped_copy(&target, child, &mut copies, &mut queue));
                copy.link_one(property, target);
            }
        }
    }
    Ok(shaped)
}

fn shaped_copy<'n>(
    original: &EntityRef,
    node: &'n ShapeNode,
    copies: &mut HashMap<EntityId, EntityRef>,
    queue: &mut VecDeque<(EntityRef, &'n ShapeNode)>,
) -> EntityRef {
    if let Some(copy) = copies.get(&original.id()) {
        return copy.clone();
    }
    let copy = EntityRef::new(original.entity());
    for (property, value) in original.fields() {
        if node.keeps(&property) {
            copy.assign(property, value);
        }
    }
    copies.insert(original.id(), copy.clone());
    queue.push_back((original.clone(), node));
    copy
}
