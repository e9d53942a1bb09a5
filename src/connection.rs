//! Connection resolver: keyset and offset pagination over a [`Query`]
//!
//! One resolve call runs, in order: ordering resolution, filter and keyword
//! predicates, the total count, the pagination window (over-fetched by one row
//! to detect a following page), ordering, and edge/cursor shaping.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

use crate::cursor::Cursor;
use crate::pagination::{Connection, Edge, PageRequest};
use crate::query::{Direction, OrderField, Predicate, Query, QuerySource};
use crate::value::{cursor_text, Record, Row};
use crate::{GraphQLError, Result};

/// Custom filter: receives the `filterBy` argument, returns a predicate to apply
pub type FilterFn = Arc<dyn Fn(&Record) -> Option<Predicate> + Send + Sync>;

/// One entry of a filterable list
#[derive(Clone)]
pub enum FilterItem {
    /// `column = filterBy[column]` when the argument holds a non-null value
    Column(String),
    Predicate(FilterFn),
}

/// How `filterBy` turns into predicates
#[derive(Clone)]
pub enum Filterable {
    List(Vec<FilterItem>),
    Custom(FilterFn),
}

impl Filterable {
    /// Allow-list of columns filtered by equality
    pub fn columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Filterable::List(columns.into_iter().map(|c| FilterItem::Column(c.into())).collect())
    }

    pub fn custom<F>(filter: F) -> Self
    where
        F: Fn(&Record) -> Option<Predicate> + Send + Sync + 'static,
    {
        Filterable::Custom(Arc::new(filter))
    }

    fn predicates(&self, filter_by: &Record) -> Vec<Predicate> {
        match self {
            Filterable::List(items) => items
                .iter()
                .filter_map(|item| match item {
                    FilterItem::Column(column) => filter_by
                        .get(column)
                        .filter(|value| !value.is_null())
                        .map(|value| Predicate::eq(column.as_str(), value.clone())),
                    FilterItem::Predicate(filter) => filter(filter_by),
                })
                .collect(),
            Filterable::Custom(filter) => filter(filter_by).into_iter().collect(),
        }
    }
}

impl Default for Filterable {
    fn default() -> Self {
        Filterable::List(Vec::new())
    }
}

impl fmt::Debug for Filterable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filterable::List(items) => {
                let names: Vec<&str> = items
                    .iter()
                    .map(|item| match item {
                        FilterItem::Column(column) => column.as_str(),
                        FilterItem::Predicate(_) => "<fn>",
                    })
                    .collect();
                f.debug_tuple("List").field(&names).finish()
            }
            Filterable::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Declarative part of a connection resolver
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionOptions {
    /// Columns matched by `keyword`
    pub searchable: Vec<String>,

    /// Columns accepted by `orderBy`
    pub sortable: Vec<String>,

    /// Page size when `first` is absent
    pub limit: usize,

    /// Keyset cursor columns; the first one is also the default sort column
    #[serde(alias = "cursorColumn", deserialize_with = "one_or_many")]
    pub cursor_columns: Vec<String>,

    /// Offset pagination instead of keyset
    pub use_offset: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            searchable: Vec::new(),
            sortable: Vec::new(),
            limit: 10,
            cursor_columns: vec!["id".to_string()],
            use_offset: false,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(column) => vec![column],
        OneOrMany::Many(columns) => columns,
    })
}

/// Resolves a paginated connection field
pub struct ConnectionResolver<S> {
    source: S,
    options: ConnectionOptions,
    filterable: Filterable,
}

impl<S> ConnectionResolver<S> {
    /// Resolver over the queries produced by `source`, with default options
    pub fn new(source: S) -> Self {
        Self::with_options(source, ConnectionOptions::default())
    }

    pub fn with_options(source: S, options: ConnectionOptions) -> Self {
        Self {
            source,
            options,
            filterable: Filterable::default(),
        }
    }

    pub fn searchable<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.options.searchable = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn sortable<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.options.sortable = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filterable(mut self, filterable: Filterable) -> Self {
        self.filterable = filterable;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = limit;
        self
    }

    pub fn cursor_column(self, column: impl Into<String>) -> Self {
        self.cursor_columns([column.into()])
    }

    pub fn cursor_columns<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.options.cursor_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn use_offset(mut self, use_offset: bool) -> Self {
        self.options.use_offset = use_offset;
        self
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Resolve one page for `parent` within request context `ctx`.
    ///
    /// Fails with [`GraphQLError::Configuration`] before any query runs when no
    /// ordering can be resolved; persistence errors are returned unchanged.
    pub async fn resolve<P, C>(
        &self,
        parent: &P,
        request: &PageRequest,
        ctx: &C,
    ) -> Result<Connection<<S::Query as Query>::Row>>
    where
        S: QuerySource<P, C>,
    {
        if self.options.limit == 0 {
            return Err(GraphQLError::Configuration(
                "connection limit must be at least 1".to_string(),
            ));
        }
        let first = request.page_size(self.options.limit);
        let ordering = self.ordering(request.order_by.as_deref())?;
        let cursor_columns = &self.options.cursor_columns;
        if !self.options.use_offset && cursor_columns.is_empty() {
            return Err(GraphQLError::Configuration(
                "keyset pagination needs at least one cursor column".to_string(),
            ));
        }
        if request.before.is_some() {
            tracing::debug!("`before` cursor is reserved and ignored");
        }

        tracing::debug!(
            first,
            offset_mode = self.options.use_offset,
            ordering = ?ordering,
            "resolving connection"
        );

        let mut query = self.source.query(ctx, parent);
        for predicate in self.predicates(request) {
            query = query.filter(predicate);
        }

        let total = query.result_size().await?;
        let window = first as u64 + 1;
        let after = request.after.as_deref().and_then(Cursor::decode);

        if self.options.use_offset {
            let offset = after.as_ref().map(Cursor::as_offset).unwrap_or(0);
            query = query.offset(offset).limit(window);
            for field in ordering {
                query = query.order_by(field);
            }
            let rows = query.fetch().await?;
            return Ok(relay_result(rows, first, total, |_, index| {
                Cursor::Offset(offset + index as u64 + 1)
            }));
        }

        if let Some(predicate) = after
            .as_ref()
            .and_then(|cursor| keyset_predicate(&ordering, cursor_columns, cursor))
        {
            query = query.filter(predicate);
        }
        query = query.limit(window);
        for field in ordering {
            query = query.order_by(field);
        }
        let rows = query.fetch().await?;
        Ok(relay_result(rows, first, total, |row, _| {
            keyset_cursor(row, cursor_columns)
        }))
    }

    /// `orderBy` if it names a sortable column, else the first cursor column
    /// descending. Keyset mode appends the remaining cursor columns so the
    /// ordering always covers the cursor tuple.
    fn ordering(&self, order_by: Option<&str>) -> Result<Vec<OrderField>> {
        let mut ordering = Vec::new();

        if let Some(requested) = order_by.filter(|_| !self.options.sortable.is_empty()) {
            let field = OrderField::parse(requested);
            if self.options.sortable.contains(&field.column) {
                ordering.push(field);
            }
        }

        if ordering.is_empty() {
            let column = self.options.cursor_columns.first().ok_or_else(|| {
                GraphQLError::Configuration(
                    "no sortable column matched and no cursor column is configured".to_string(),
                )
            })?;
            ordering.push(OrderField::desc(column.as_str()));
        }

        if !self.options.use_offset {
            for column in &self.options.cursor_columns {
                if !ordering.iter().any(|field| &field.column == column) {
                    ordering.push(OrderField::desc(column.as_str()));
                }
            }
        }

        Ok(ordering)
    }

    fn predicates(&self, request: &PageRequest) -> Vec<Predicate> {
        let mut predicates = Vec::new();

        if let Some(filter_by) = request.filter_by().filter(|f| !f.is_empty()) {
            predicates.extend(self.filterable.predicates(filter_by));
        }

        if let Some(keyword) = request.keyword.as_deref().filter(|k| !k.is_empty()) {
            if !self.options.searchable.is_empty() {
                predicates.push(Predicate::any(
                    self.options
                        .searchable
                        .iter()
                        .map(|column| Predicate::contains(column.as_str(), keyword))
                        .collect(),
                ));
            }
        }

        predicates
    }
}

/// Predicate selecting the rows strictly after `cursor` in `ordering`.
///
/// A single cursor column compares that column alone. Multiple columns expand
/// the row-value comparison into
/// `(c1 op v1) OR (c1 = v1 AND c2 op v2) OR ...`; a disjunct is dropped when
/// the cursor lacks a value for any column it mentions.
fn keyset_predicate(
    ordering: &[OrderField],
    cursor_columns: &[String],
    cursor: &Cursor,
) -> Option<Predicate> {
    if let [column] = cursor_columns {
        let direction = ordering
            .iter()
            .find(|field| &field.column == column)
            .map(|field| field.direction)
            .unwrap_or(Direction::Desc);
        let value = cursor.value_for(column)?;
        return Some(Predicate::compare(column.as_str(), direction.after(), value));
    }

    let Cursor::Values(values) = cursor else {
        tracing::warn!("multi-column ordering received a scalar cursor, ignoring it");
        return None;
    };

    let branches: Vec<Predicate> = ordering
        .iter()
        .enumerate()
        .filter_map(|(index, field)| {
            let value = values.get(&field.column)?;
            let mut conditions = ordering[..index]
                .iter()
                .map(|previous| {
                    values
                        .get(&previous.column)
                        .map(|v| Predicate::eq(previous.column.as_str(), v.clone()))
                })
                .collect::<Option<Vec<_>>>()?;
            conditions.push(Predicate::compare(
                field.column.as_str(),
                field.direction.after(),
                value.clone(),
            ));
            Some(Predicate::all(conditions))
        })
        .collect();

    if branches.is_empty() {
        None
    } else {
        Some(Predicate::any(branches))
    }
}

/// Keyset cursor of a row: the bare value for one column, otherwise the
/// `values` object (columns the row lacks are left out)
fn keyset_cursor<R: Row>(row: &R, cursor_columns: &[String]) -> Cursor {
    if let [column] = cursor_columns {
        return Cursor::Scalar(cursor_text(&row.column(column).unwrap_or(Value::Null)));
    }
    let values: Map<String, Value> = cursor_columns
        .iter()
        .filter_map(|column| row.column(column).map(|value| (column.clone(), value)))
        .collect();
    Cursor::Values(values)
}

/// Shape fetched rows into a connection. `rows` may hold one row more than
/// `first`; that row only signals `has_next_page` and is dropped.
pub fn relay_result<R>(
    mut rows: Vec<R>,
    first: usize,
    total: u64,
    mut cursor: impl FnMut(&R, usize) -> Cursor,
) -> Connection<R> {
    let has_next_page = first > 0 && rows.len() > first;
    if has_next_page {
        rows.truncate(first);
    }

    let edges = rows
        .into_iter()
        .enumerate()
        .map(|(index, node)| Edge {
            cursor: cursor(&node, index).encode(),
            node,
        })
        .collect();

    Connection::new(edges, total, has_next_page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorCodec;
    use crate::memory::{MemoryQuery, MemoryStore};
    use async_graphql::Json;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => unreachable!("test records are objects"),
        }
    }

    fn store_with(table: &str, rows: Vec<Value>) -> MemoryStore {
        let store = MemoryStore::new();
        for row in rows {
            store.insert(table, record(row));
        }
        store
    }

    fn resolver(
        store: &MemoryStore,
        table: &'static str,
    ) -> ConnectionResolver<impl Fn(&(), &()) -> MemoryQuery + Send + Sync> {
        let store = store.clone();
        ConnectionResolver::new(move |_: &(), _: &()| store.table(table))
    }

    fn decoded(cursor: &str) -> String {
        CursorCodec::decode(cursor).unwrap()
    }

    fn ids(conn: &Connection<Record>) -> Vec<i64> {
        conn.nodes().map(|n| n["id"].as_i64().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_keyset_default_ordering_pages() {
        let store = store_with(
            "items",
            vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})],
        );
        let resolver = resolver(&store, "items");

        let page = resolver.resolve(&(), &PageRequest::new(2), &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2]);
        assert_eq!(page.total, 3);
        assert!(page.page_info.has_next_page);
        assert_eq!(page.page_info.start_cursor.as_deref(), Some(CursorCodec::encode("3").as_str()));
        assert_eq!(page.page_info.end_cursor.as_deref(), Some(CursorCodec::encode("2").as_str()));

        let next = PageRequest {
            after: page.page_info.end_cursor.clone(),
            ..PageRequest::new(2)
        };
        let page = resolver.resolve(&(), &next, &()).await.unwrap();
        assert_eq!(ids(&page), vec![1]);
        assert!(!page.page_info.has_next_page);
    }

    #[tokio::test]
    async fn test_offset_mode_cursors_count_consumed_rows() {
        let store = store_with(
            "items",
            (1..=5).map(|id| json!({"id": id, "name": format!("item{id}")})).collect(),
        );
        let resolver = resolver(&store, "items").use_offset(true).limit(2);

        let page = resolver.resolve(&(), &PageRequest::default(), &()).await.unwrap();
        assert_eq!(page.edges.len(), 2);
        assert!(page.page_info.has_next_page);
        assert_eq!(decoded(&page.edges[0].cursor), "1");
        assert_eq!(decoded(&page.edges[1].cursor), "2");

        let next = PageRequest {
            after: Some(CursorCodec::encode("2")),
            ..PageRequest::new(2)
        };
        let page = resolver.resolve(&(), &next, &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2]);
        assert!(page.page_info.has_next_page);
        assert_eq!(decoded(page.page_info.end_cursor.as_deref().unwrap()), "4");
    }

    #[tokio::test]
    async fn test_offset_mode_respects_sortable_order() {
        let store = store_with(
            "items",
            (1..=5).map(|id| json!({"id": id})).collect(),
        );
        let resolver = resolver(&store, "items").use_offset(true).sortable(["id"]);

        let request = PageRequest {
            order_by: Some("id".to_string()),
            after: Some(CursorCodec::encode("2")),
            ..PageRequest::new(2)
        };
        let page = resolver.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_multi_column_cursor() {
        let store = store_with(
            "sort_tests",
            vec![
                json!({"id": 1, "name": "A", "value": 10}),
                json!({"id": 2, "name": "B", "value": 10}),
                json!({"id": 3, "name": "C", "value": 20}),
            ],
        );
        let resolver = resolver(&store, "sort_tests")
            .sortable(["value", "name"])
            .cursor_columns(["value", "id"]);

        let request = PageRequest {
            order_by: Some("-value".to_string()),
            ..PageRequest::new(2)
        };
        let page = resolver.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2]);
        assert!(page.page_info.has_next_page);
        assert_eq!(
            decoded(&page.edges[0].cursor),
            r#"{"values":{"value":20,"id":3}}"#
        );

        let next = PageRequest {
            after: page.page_info.end_cursor.clone(),
            ..request
        };
        let page = resolver.resolve(&(), &next, &()).await.unwrap();
        assert_eq!(ids(&page), vec![1]);
        assert!(!page.page_info.has_next_page);
    }

    #[tokio::test]
    async fn test_sequential_pages_cover_every_row_once() {
        let store = store_with(
            "events",
            (1..=7)
                .map(|id| json!({"id": id, "createdAt": 100 + id % 3}))
                .collect(),
        );
        let resolver = resolver(&store, "events").cursor_columns(["createdAt", "id"]);

        let mut seen = Vec::new();
        let mut after = None;
        loop {
            let request = PageRequest {
                after: after.clone(),
                ..PageRequest::new(3)
            };
            let page = resolver.resolve(&(), &request, &()).await.unwrap();
            seen.extend(ids(&page));
            if !page.page_info.has_next_page {
                break;
            }
            after = page.page_info.end_cursor.clone();
        }

        assert_eq!(seen, vec![5, 2, 7, 4, 1, 6, 3]);
    }

    #[tokio::test]
    async fn test_sortable_ignores_unknown_columns() {
        let store = store_with(
            "sort_tests",
            vec![
                json!({"id": 1, "name": "C", "value": 30}),
                json!({"id": 2, "name": "A", "value": 10}),
                json!({"id": 3, "name": "B", "value": 20}),
            ],
        );
        let resolver = resolver(&store, "sort_tests").sortable(["name", "value"]);

        let by_name = PageRequest {
            order_by: Some("name".to_string()),
            ..Default::default()
        };
        let page = resolver.resolve(&(), &by_name, &()).await.unwrap();
        let names: Vec<&str> = page.nodes().map(|n| n["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);

        let unknown = PageRequest {
            order_by: Some("-secret".to_string()),
            ..Default::default()
        };
        let page = resolver.resolve(&(), &unknown, &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2, 1]);
    }

    #[tokio::test]
    async fn test_filters_and_keyword() {
        let store = store_with(
            "filter_tests",
            vec![
                json!({"id": 1, "name": "item1", "value": 10}),
                json!({"id": 2, "name": "item2", "value": 20}),
                json!({"id": 3, "name": "other", "value": 30}),
            ],
        );

        let by_column = resolver(&store, "filter_tests").filterable(Filterable::columns(["name"]));
        let request = PageRequest {
            filter_by: Some(Json(record(json!({"name": "item1", "value": 30})))),
            ..Default::default()
        };
        let page = by_column.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(ids(&page), vec![1]);
        assert_eq!(page.total, 1);

        let by_function = resolver(&store, "filter_tests").filterable(Filterable::List(vec![
            FilterItem::Predicate(Arc::new(|filter_by: &Record| {
                filter_by.get("customValue").map(|v| {
                    Predicate::compare("value", crate::query::Comparison::Gt, v.clone())
                })
            })),
        ]));
        let request = PageRequest {
            filter_by: Some(Json(record(json!({"customValue": 15})))),
            ..Default::default()
        };
        let page = by_function.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2]);

        let search = resolver(&store, "filter_tests").searchable(["name"]);
        let request = PageRequest {
            keyword: Some("ITEM".to_string()),
            ..Default::default()
        };
        let page = search.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(ids(&page), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_empty_result_has_no_cursors() {
        let store = MemoryStore::new();
        let page = resolver(&store, "nothing")
            .resolve(&(), &PageRequest::new(5), &())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.edges.is_empty());
        assert_eq!(page.page_info.start_cursor, None);
        assert_eq!(page.page_info.end_cursor, None);
        assert!(!page.page_info.has_next_page);
    }

    #[tokio::test]
    async fn test_resolving_twice_is_identical() {
        let store = store_with("items", (1..=4).map(|id| json!({"id": id})).collect());
        let resolver = resolver(&store, "items");
        let request = PageRequest::new(3);
        let first = resolver.resolve(&(), &request, &()).await.unwrap();
        let second = resolver.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_undecodable_cursor_starts_from_the_top() {
        let store = store_with("items", (1..=3).map(|id| json!({"id": id})).collect());
        let request = PageRequest {
            after: Some("%%%".to_string()),
            ..PageRequest::new(2)
        };
        let page = resolver(&store, "items").resolve(&(), &request, &()).await.unwrap();
        assert_eq!(ids(&page), vec![3, 2]);
    }

    #[tokio::test]
    async fn test_missing_cursor_columns_is_a_configuration_error() {
        let store = MemoryStore::new();
        let result = resolver(&store, "items")
            .cursor_columns(Vec::<String>::new())
            .resolve(&(), &PageRequest::new(1), &())
            .await;
        assert!(matches!(result, Err(GraphQLError::Configuration(_))));
        assert_eq!(store.fetch_count("items"), 0);
    }

    #[tokio::test]
    async fn test_zero_limit_is_a_configuration_error() {
        let store = store_with("items", vec![json!({"id": 1}), json!({"id": 2})]);
        let result = resolver(&store, "items").limit(0).resolve(&(), &PageRequest::default(), &()).await;
        assert!(matches!(result, Err(GraphQLError::Configuration(_))));
        assert_eq!(store.fetch_count("items"), 0);
    }

    #[tokio::test]
    async fn test_persistence_errors_propagate() {
        let store = MemoryStore::new();
        store.fail_table("items", "connection reset");
        let result = resolver(&store, "items").resolve(&(), &PageRequest::new(1), &()).await;
        match result {
            Err(GraphQLError::Persistence(error)) => assert!(error.to_string().contains("connection reset")),
            other => panic!("expected persistence error, got {other:?}"),
        }
    }

    #[test]
    fn test_keyset_predicate_skips_disjuncts_without_values() {
        let ordering = vec![OrderField::asc("name"), OrderField::desc("value"), OrderField::desc("id")];
        let columns = vec!["value".to_string(), "id".to_string()];
        let cursor = Cursor::Values(record(json!({"value": 20, "id": 3})));

        assert_eq!(keyset_predicate(&ordering, &columns, &cursor), None);

        let ordering = vec![OrderField::desc("value"), OrderField::desc("id")];
        assert_eq!(
            keyset_predicate(&ordering, &columns, &cursor),
            Some(Predicate::Any(vec![
                Predicate::compare("value", crate::query::Comparison::Lt, json!(20)),
                Predicate::All(vec![
                    Predicate::eq("value", json!(20)),
                    Predicate::compare("id", crate::query::Comparison::Lt, json!(3)),
                ]),
            ]))
        );
    }

    #[test]
    fn test_options_deserialize_single_cursor_column() {
        let options: ConnectionOptions =
            serde_json::from_value(json!({"cursorColumn": "createdAt", "useOffset": true})).unwrap();
        assert_eq!(options.cursor_columns, vec!["createdAt"]);
        assert!(options.use_offset);
        assert_eq!(options.limit, 10);

        let options: ConnectionOptions =
            serde_json::from_value(json!({"cursorColumns": ["value", "id"], "limit": 25})).unwrap();
        assert_eq!(options.cursor_columns, vec!["value", "id"]);
        assert_eq!(options.limit, 25);
    }
}
