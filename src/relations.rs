//! Relation presets: batched HasMany / HasOne / BelongsTo / ManyToMany loading
//!
//! Each relation field acquires one loader per request, named after the
//! parent and related entity types, so every sibling parent in a selection
//! level joins the same batch and the related rows are fetched once.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::dataloaders::{loader_registry, BatchLoader, LoaderAccess};
use crate::query::{PivotJoin, Predicate, Query, PIVOT_FOREIGN_KEY};
use crate::value::{KeyValue, Record, Row};
use crate::{GraphQLError, Result};

/// Row type produced by a relation source
pub type RowOf<S> = <<S as RelationSource>::Query as Query>::Row;

/// Custom child check: receives a candidate row and the parent's key
pub type Asserter<R> = Arc<dyn Fn(&R, &KeyValue) -> bool + Send + Sync>;

/// Relation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    HasMany,
    HasOne,
    BelongsTo,
    ManyToMany,
}

impl RelationKind {
    fn is_list(&self) -> bool {
        matches!(self, RelationKind::HasMany | RelationKind::ManyToMany)
    }
}

/// Name, table and primary key of an entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRef {
    pub name: String,
    pub table: String,
    pub id_column: String,
}

impl EntityRef {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            id_column: "id".to_string(),
        }
    }

    pub fn with_id_column(mut self, id_column: impl Into<String>) -> Self {
        self.id_column = id_column.into();
        self
    }

    /// Column other tables use to reference this one (`users` → `userId`)
    pub fn foreign_key_name(&self) -> String {
        format!("{}Id", singularize(&self.table))
    }
}

/// Pivot table of a many-to-many relation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThroughTable {
    pub table: String,
    /// Pivot column holding the parent key
    pub from: String,
    /// Pivot column holding the related key
    pub to: String,
}

/// Static description of how a parent reaches its related rows
///
/// | kind | match |
/// |---|---|
/// | HasMany, HasOne | `related.foreign_key = parent.parent_key` |
/// | BelongsTo | `related.parent_key = parent.foreign_key` |
/// | ManyToMany | `through.from = parent.parent_key`, `through.to = related.id_column` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDescriptor {
    pub kind: RelationKind,
    pub related: EntityRef,
    pub foreign_key: String,
    pub parent_key: String,
    pub through: Option<ThroughTable>,
}

impl RelationDescriptor {
    pub fn has_many(parent: &EntityRef, related: EntityRef) -> Self {
        Self {
            kind: RelationKind::HasMany,
            foreign_key: parent.foreign_key_name(),
            parent_key: parent.id_column.clone(),
            related,
            through: None,
        }
    }

    pub fn has_one(parent: &EntityRef, related: EntityRef) -> Self {
        Self {
            kind: RelationKind::HasOne,
            ..Self::has_many(parent, related)
        }
    }

    /// The parent holds `related`'s key; `parent_key` is the related unique key
    pub fn belongs_to(related: EntityRef) -> Self {
        Self {
            kind: RelationKind::BelongsTo,
            foreign_key: related.foreign_key_name(),
            parent_key: related.id_column.clone(),
            related,
            through: None,
        }
    }

    pub fn many_to_many(parent: &EntityRef, related: EntityRef, through_table: impl Into<String>) -> Self {
        let through = ThroughTable {
            table: through_table.into(),
            from: parent.foreign_key_name(),
            to: related.foreign_key_name(),
        };
        Self {
            kind: RelationKind::ManyToMany,
            foreign_key: through.from.clone(),
            parent_key: parent.id_column.clone(),
            related,
            through: Some(through),
        }
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = column.into();
        if let Some(through) = self.through.as_mut() {
            through.from = self.foreign_key.clone();
        }
        self
    }

    pub fn parent_key(mut self, column: impl Into<String>) -> Self {
        self.parent_key = column.into();
        self
    }

    pub fn through(mut self, through: ThroughTable) -> Self {
        self.foreign_key = through.from.clone();
        self.through = Some(through);
        self
    }

    /// `{parent}-{related}`, suffixed with `-many-to-many` for pivot relations.
    ///
    /// The name ignores the keys, so two relations from one parent to the same
    /// entity (say `User.posts` on `userId` and `User.editedPosts` on
    /// `editorId`) share a loader within a request, and the first field
    /// resolved fixes the keys and options for both. Such relations must
    /// point at distinct [`EntityRef`] names.
    pub fn loader_name(&self, parent: &EntityRef) -> String {
        match self.kind {
            RelationKind::ManyToMany => format!("{}-{}-many-to-many", parent.name, self.related.name),
            _ => format!("{}-{}", parent.name, self.related.name),
        }
    }

    /// Parent column whose value keys the loader
    fn parent_column(&self) -> &str {
        match self.kind {
            RelationKind::BelongsTo => &self.foreign_key,
            _ => &self.parent_key,
        }
    }

    /// Related row column compared against the loader key
    fn related_column(&self) -> &str {
        match self.kind {
            RelationKind::HasMany | RelationKind::HasOne => &self.foreign_key,
            RelationKind::BelongsTo => &self.parent_key,
            RelationKind::ManyToMany => PIVOT_FOREIGN_KEY,
        }
    }
}

/// An entity type and its named relations
#[derive(Debug, Clone)]
pub struct EntityType {
    pub entity: EntityRef,
    pub relations: BTreeMap<String, RelationDescriptor>,
}

impl EntityType {
    pub fn new(entity: EntityRef) -> Self {
        Self {
            entity,
            relations: BTreeMap::new(),
        }
    }

    pub fn relation(mut self, name: impl Into<String>, descriptor: RelationDescriptor) -> Self {
        self.relations.insert(name.into(), descriptor);
        self
    }

    pub fn has_many(self, name: impl Into<String>, related: EntityRef) -> Self {
        let descriptor = RelationDescriptor::has_many(&self.entity, related);
        self.relation(name, descriptor)
    }

    pub fn has_one(self, name: impl Into<String>, related: EntityRef) -> Self {
        let descriptor = RelationDescriptor::has_one(&self.entity, related);
        self.relation(name, descriptor)
    }

    pub fn belongs_to(self, name: impl Into<String>, related: EntityRef) -> Self {
        self.relation(name, RelationDescriptor::belongs_to(related))
    }

    pub fn many_to_many(self, name: impl Into<String>, related: EntityRef, through_table: impl Into<String>) -> Self {
        let descriptor = RelationDescriptor::many_to_many(&self.entity, related, through_table);
        self.relation(name, descriptor)
    }

    pub fn get(&self, name: &str) -> Result<&RelationDescriptor> {
        self.relations.get(name).ok_or_else(|| GraphQLError::RelationNotFound {
            entity: self.entity.name.clone(),
            relation: name.to_string(),
        })
    }
}

/// A parent object relation fields are resolved on
pub trait Entity: Send + Sync {
    /// Declaring type; `None` for untyped rows
    fn entity_type(&self) -> Option<&EntityType>;

    fn column(&self, name: &str) -> Option<Value>;
}

impl Entity for Record {
    fn entity_type(&self) -> Option<&EntityType> {
        None
    }

    fn column(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// A record tagged with its entity type
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub entity_type: Arc<EntityType>,
    pub record: Record,
}

impl EntityRecord {
    pub fn new(entity_type: Arc<EntityType>, record: Record) -> Self {
        Self { entity_type, record }
    }
}

impl Entity for EntityRecord {
    fn entity_type(&self) -> Option<&EntityType> {
        Some(&self.entity_type)
    }

    fn column(&self, name: &str) -> Option<Value> {
        self.record.get(name).cloned()
    }
}

/// Opens queries against related tables
pub trait RelationSource: Send + Sync + 'static {
    type Query: Query;

    fn query(&self, entity: &EntityRef) -> Self::Query;
}

/// Per-field tuning of a relation preset
pub struct RelationOptions<R> {
    /// Extra predicate ANDed onto the batched fetch
    pub filter: Option<Predicate>,
    /// Extra HasMany / HasOne child check
    pub asserter: Option<Asserter<R>>,
}

impl<R> RelationOptions<R> {
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.filter = Some(predicate);
        self
    }

    pub fn asserter<F>(mut self, asserter: F) -> Self
    where
        F: Fn(&R, &KeyValue) -> bool + Send + Sync + 'static,
    {
        self.asserter = Some(Arc::new(asserter));
        self
    }
}

impl<R> Default for RelationOptions<R> {
    fn default() -> Self {
        Self {
            filter: None,
            asserter: None,
        }
    }
}

impl<R> Clone for RelationOptions<R> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            asserter: self.asserter.clone(),
        }
    }
}

impl<R> fmt::Debug for RelationOptions<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationOptions")
            .field("filter", &self.filter)
            .field("asserter", &self.asserter.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

/// Resolved relation value
#[derive(Debug, Clone, PartialEq)]
pub enum Related<R> {
    Many(Vec<R>),
    One(Option<R>),
}

impl<R> Related<R> {
    pub fn into_many(self) -> Vec<R> {
        match self {
            Related::Many(rows) => rows,
            Related::One(row) => row.into_iter().collect(),
        }
    }

    pub fn into_one(self) -> Option<R> {
        match self {
            Related::Many(rows) => rows.into_iter().next(),
            Related::One(row) => row,
        }
    }
}

/// Batched relation resolution over a [`RelationSource`]
pub struct Batch<S> {
    source: Arc<S>,
}

impl<S> Clone for Batch<S> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
        }
    }
}

impl<S: RelationSource> Batch<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(source),
        }
    }

    /// Resolve `descriptor` for `parent` through this request's loaders.
    ///
    /// A parent without a key value resolves empty without touching the loader.
    /// Loaders are keyed by [`RelationDescriptor::loader_name`], so `options`
    /// only take effect for the first resolution of that name in a request.
    pub async fn load<A, P>(
        &self,
        access: &A,
        parent: &P,
        descriptor: &RelationDescriptor,
        options: RelationOptions<RowOf<S>>,
    ) -> Result<Related<RowOf<S>>>
    where
        A: LoaderAccess + Sync + ?Sized,
        P: Entity + ?Sized,
    {
        let parent_type = parent.entity_type().ok_or(GraphQLError::ParentModelRequired)?;
        let registry = loader_registry(access)?;

        let key = parent
            .column(descriptor.parent_column())
            .as_ref()
            .and_then(KeyValue::from_value);
        let rows = match key {
            Some(key) => {
                let name = descriptor.loader_name(&parent_type.entity);
                let batch = RelationBatch {
                    source: self.source.clone(),
                    descriptor: descriptor.clone(),
                    options,
                };
                registry.acquire(&name, batch)?.load(key).await?
            }
            None => Vec::new(),
        };

        Ok(if descriptor.kind.is_list() {
            Related::Many(rows)
        } else {
            Related::One(rows.into_iter().next())
        })
    }

    pub async fn has_many<A, P>(
        &self,
        access: &A,
        parent: &P,
        related: &EntityRef,
        options: RelationOptions<RowOf<S>>,
    ) -> Result<Vec<RowOf<S>>>
    where
        A: LoaderAccess + Sync + ?Sized,
        P: Entity + ?Sized,
    {
        let parent_type = parent.entity_type().ok_or(GraphQLError::ParentModelRequired)?;
        let descriptor = RelationDescriptor::has_many(&parent_type.entity, related.clone());
        Ok(self.load(access, parent, &descriptor, options).await?.into_many())
    }

    pub async fn has_one<A, P>(
        &self,
        access: &A,
        parent: &P,
        related: &EntityRef,
        options: RelationOptions<RowOf<S>>,
    ) -> Result<Option<RowOf<S>>>
    where
        A: LoaderAccess + Sync + ?Sized,
        P: Entity + ?Sized,
    {
        let parent_type = parent.entity_type().ok_or(GraphQLError::ParentModelRequired)?;
        let descriptor = RelationDescriptor::has_one(&parent_type.entity, related.clone());
        Ok(self.load(access, parent, &descriptor, options).await?.into_one())
    }

    pub async fn belongs_to<A, P>(
        &self,
        access: &A,
        parent: &P,
        related: &EntityRef,
        options: RelationOptions<RowOf<S>>,
    ) -> Result<Option<RowOf<S>>>
    where
        A: LoaderAccess + Sync + ?Sized,
        P: Entity + ?Sized,
    {
        let descriptor = RelationDescriptor::belongs_to(related.clone());
        Ok(self.load(access, parent, &descriptor, options).await?.into_one())
    }

    /// Many-to-many relation `name` from the parent's declared relations
    pub async fn belongs_to_many<A, P>(&self, access: &A, parent: &P, name: &str) -> Result<Vec<RowOf<S>>>
    where
        A: LoaderAccess + Sync + ?Sized,
        P: Entity + ?Sized,
    {
        Ok(self
            .relation(access, parent, name, RelationOptions::default())
            .await?
            .into_many())
    }

    /// Any relation declared on the parent's type, by name
    pub async fn relation<A, P>(
        &self,
        access: &A,
        parent: &P,
        name: &str,
        options: RelationOptions<RowOf<S>>,
    ) -> Result<Related<RowOf<S>>>
    where
        A: LoaderAccess + Sync + ?Sized,
        P: Entity + ?Sized,
    {
        let parent_type = parent.entity_type().ok_or(GraphQLError::ParentModelRequired)?;
        let descriptor = parent_type.get(name)?;
        self.load(access, parent, descriptor, options).await
    }
}

struct RelationBatch<S: RelationSource> {
    source: Arc<S>,
    descriptor: RelationDescriptor,
    options: RelationOptions<RowOf<S>>,
}

impl<S: RelationSource> RelationBatch<S> {
    fn accepts(&self, row: &RowOf<S>, key: &KeyValue) -> bool {
        let column = self.descriptor.related_column();
        let matched = row
            .column(column)
            .as_ref()
            .and_then(KeyValue::from_value)
            .is_some_and(|value| &value == key);
        if !matched {
            return false;
        }
        match (&self.options.asserter, self.descriptor.kind) {
            (Some(asserter), RelationKind::HasMany | RelationKind::HasOne) => asserter(row, key),
            _ => true,
        }
    }
}

#[async_trait]
impl<S: RelationSource> BatchLoader<KeyValue, Vec<RowOf<S>>> for RelationBatch<S> {
    async fn load_batch(&self, keys: &[KeyValue]) -> Result<Vec<Vec<RowOf<S>>>> {
        let descriptor = &self.descriptor;
        let values: Vec<Value> = keys.iter().map(KeyValue::to_value).collect();

        let mut query = self.source.query(&descriptor.related);
        query = match (&descriptor.kind, &descriptor.through) {
            (RelationKind::ManyToMany, Some(through)) => query.join_pivot(
                &PivotJoin {
                    table: through.table.clone(),
                    parent_column: through.from.clone(),
                    related_column: through.to.clone(),
                    related_id_column: descriptor.related.id_column.clone(),
                },
                values,
            ),
            (RelationKind::ManyToMany, None) => {
                return Err(GraphQLError::Configuration(format!(
                    "many-to-many relation to {} has no through table",
                    descriptor.related.name
                )))
            }
            _ => query.where_in(descriptor.related_column(), values),
        };
        if let Some(filter) = &self.options.filter {
            query = query.filter(filter.clone());
        }

        let rows = query.fetch().await?;
        Ok(keys
            .iter()
            .map(|key| rows.iter().filter(|row| self.accepts(row, key)).cloned().collect())
            .collect())
    }
}

/// English singular of a table name (`users` → `user`, `categories` → `category`)
fn singularize(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        return format!("{stem}y");
    }
    for suffix in ["sses", "shes", "ches", "xes"] {
        if let Some(stem) = word.strip_suffix(suffix) {
            return format!("{stem}{}", &suffix[..suffix.len() - 2]);
        }
    }
    match word.strip_suffix('s') {
        Some(stem) if !stem.ends_with('s') && !stem.is_empty() => stem.to_string(),
        _ => word.to_string(),
    }
}
