//! # pleme-graphql-presets
//!
//! GraphQL resolver presets for Pleme platform services.
//!
//! ## Features
//!
//! - **Connection Resolver** - Relay-style keyset and offset pagination over any query
//! - **Batch Loader** - Request-scoped, memoized batch loading for N+1 prevention
//! - **Relation Presets** - HasMany / HasOne / BelongsTo / ManyToMany loaders
//! - **Range Pagination** - `Range` / `Content-Range` item pagination for REST routes
//! - **Query Backends** - In-memory and SQL implementations of the query boundary
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pleme_graphql_presets::{ConnectionResolver, MemoryStore, PageRequest};
//!
//! # async fn example(store: MemoryStore) -> pleme_graphql_presets::Result<()> {
//! let resolver = ConnectionResolver::new(move |_ctx: &(), _parent: &()| store.table("posts"))
//!     .sortable(["title", "createdAt"])
//!     .cursor_columns(["createdAt", "id"]);
//!
//! let page = resolver.resolve(&(), &PageRequest::new(20), &()).await?;
//! println!("{} of {}", page.edges.len(), page.total);
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod cursor;
pub mod dataloaders;
pub mod handler;
pub mod memory;
pub mod pagination;
pub mod query;
pub mod range;
pub mod relations;
pub mod sql;
pub mod value;

pub use connection::{relay_result, ConnectionOptions, ConnectionResolver, FilterItem, Filterable};
pub use cursor::{Cursor, CursorCodec};
pub use dataloaders::{loader_registry, BatchFn, BatchLoader, Loader, LoaderAccess, LoaderRegistry};
pub use handler::{graphql_handler, with_loader_registry};
pub use memory::{MemoryQuery, MemoryStore};
pub use pagination::{Connection, Edge, PageInfo, PageRequest};
pub use query::{Comparison, Direction, OrderField, PivotJoin, Predicate, Query, QuerySource};
pub use range::{Paginated, RangeError, RangeOptions, RangePagination};
pub use relations::{
    Batch, Entity, EntityRecord, EntityRef, EntityType, Related, RelationDescriptor, RelationKind,
    RelationOptions, RelationSource, RowOf, ThroughTable,
};
pub use sql::{Dialect, SqlExecutor, SqlQuery, SqlSource, Statement};
pub use value::{KeyValue, Record, Row};

use std::sync::Arc;
use thiserror::Error;

/// GraphQL errors
///
/// Cloneable so a single failed batch can be reported to every waiting resolver.
#[derive(Error, Debug, Clone)]
pub enum GraphQLError {
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Can not get loader")]
    LoaderUnavailable,

    #[error("Loader '{0}' was already acquired with different key or value types")]
    LoaderTypeMismatch(String),

    #[error("Batch function of loader '{name}' returned {actual} results for {expected} keys")]
    BatchLengthMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("Batch of loader '{0}' was abandoned before it completed")]
    BatchCancelled(String),

    #[error("Batch fetch preset only works within a parent model")]
    ParentModelRequired,

    #[error("Relation '{relation}' not found in {entity}.relations")]
    RelationNotFound { entity: String, relation: String },

    #[error("Persistence error: {0}")]
    Persistence(Arc<dyn std::error::Error + Send + Sync>),
}

impl GraphQLError {
    /// Wrap an error raised by the persistence layer
    pub fn persistence<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Persistence(Arc::new(error))
    }
}

/// Result type for GraphQL operations
pub type Result<T> = std::result::Result<T, GraphQLError>;
