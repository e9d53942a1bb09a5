//! SQL rendering of the query boundary
//!
//! [`SqlQuery`] accumulates predicates, ordering and a window, then renders a
//! parameterised [`Statement`] for a [`SqlExecutor`] to run. Identifiers are
//! quoted, values are always bound.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

use crate::query::{Comparison, OrderField, PivotJoin, Predicate, Query, PIVOT_FOREIGN_KEY};
use crate::relations::{EntityRef, RelationSource};
use crate::value::Record;
use crate::Result;

/// Target SQL dialect
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    Sqlite,
    MySql,
}

impl Dialect {
    fn placeholder(&self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite | Dialect::MySql => "?".to_string(),
        }
    }

    /// Case-insensitive pattern operator
    fn like(&self) -> &'static str {
        match self {
            Dialect::Postgres => "ILIKE",
            Dialect::Sqlite | Dialect::MySql => "LIKE",
        }
    }

    /// Quote a possibly table-qualified identifier
    pub fn quote(&self, identifier: &str) -> String {
        let quote = match self {
            Dialect::Postgres | Dialect::Sqlite => '"',
            Dialect::MySql => '`',
        };
        identifier
            .split('.')
            .map(|part| {
                if part == "*" {
                    return part.to_string();
                }
                let escaped = part.replace(quote, &format!("{quote}{quote}"));
                format!("{quote}{escaped}{quote}")
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// Rendered SQL with its bound parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Runs rendered statements against a database
#[async_trait]
pub trait SqlExecutor: Send + Sync + 'static {
    /// Rows of a `SELECT`, in order
    async fn fetch_all(&self, statement: Statement) -> Result<Vec<Record>>;

    /// The single `count` column of a `SELECT COUNT(*)`
    async fn fetch_count(&self, statement: Statement) -> Result<u64>;
}

/// Opens [`SqlQuery`]s over one executor
pub struct SqlSource<E> {
    executor: Arc<E>,
    dialect: Dialect,
}

impl<E> Clone for SqlSource<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            dialect: self.dialect,
        }
    }
}

impl<E: SqlExecutor> SqlSource<E> {
    pub fn new(executor: E, dialect: Dialect) -> Self {
        Self {
            executor: Arc::new(executor),
            dialect,
        }
    }

    pub fn table(&self, table: &str) -> SqlQuery<E> {
        SqlQuery::new(self.executor.clone(), self.dialect, table)
    }
}

impl<E: SqlExecutor> RelationSource for SqlSource<E> {
    type Query = SqlQuery<E>;

    fn query(&self, entity: &EntityRef) -> SqlQuery<E> {
        self.table(&entity.table)
    }
}

/// Pending `SELECT` against one table
pub struct SqlQuery<E> {
    executor: Arc<E>,
    dialect: Dialect,
    table: String,
    predicates: Vec<Predicate>,
    ordering: Vec<OrderField>,
    limit: Option<u64>,
    offset: Option<u64>,
    pivot: Option<(PivotJoin, Vec<Value>)>,
}

impl<E: SqlExecutor> SqlQuery<E> {
    pub fn new(executor: Arc<E>, dialect: Dialect, table: impl Into<String>) -> Self {
        Self {
            executor,
            dialect,
            table: table.into(),
            predicates: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: None,
            pivot: None,
        }
    }

    /// Row query: selection, joins, predicates, ordering and window
    pub fn select_statement(&self) -> Statement {
        let mut renderer = Renderer::new(self);
        let columns = match &self.pivot {
            Some((pivot, _)) => format!(
                "{}, {} AS {}",
                self.dialect.quote(&format!("{}.*", self.table)),
                self.dialect.quote(&format!("{}.{}", pivot.table, pivot.parent_column)),
                self.dialect.quote(PIVOT_FOREIGN_KEY),
            ),
            None => "*".to_string(),
        };
        let mut sql = format!("SELECT {columns} FROM {}", self.from_clause());
        renderer.where_clause(&mut sql);

        if !self.ordering.is_empty() {
            let ordering: Vec<String> = self.ordering.iter().map(|field| renderer.order(field)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&ordering.join(", "));
        }
        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        Statement {
            sql,
            params: renderer.params,
        }
    }

    /// Count query: same joins and predicates, no ordering or window
    pub fn count_statement(&self) -> Statement {
        let mut renderer = Renderer::new(self);
        let mut sql = format!("SELECT COUNT(*) AS count FROM {}", self.from_clause());
        renderer.where_clause(&mut sql);
        Statement {
            sql,
            params: renderer.params,
        }
    }

    fn from_clause(&self) -> String {
        let table = self.dialect.quote(&self.table);
        match &self.pivot {
            Some((pivot, _)) => format!(
                "{table} INNER JOIN {} ON {} = {}",
                self.dialect.quote(&pivot.table),
                self.dialect.quote(&format!("{}.{}", self.table, pivot.related_id_column)),
                self.dialect.quote(&format!("{}.{}", pivot.table, pivot.related_column)),
            ),
            None => table,
        }
    }
}

#[async_trait]
impl<E: SqlExecutor> Query for SqlQuery<E> {
    type Row = Record;

    fn filter(mut self, predicate: Predicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    fn order_by(mut self, field: OrderField) -> Self {
        self.ordering.push(field);
        self
    }

    fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    fn join_pivot(mut self, pivot: &PivotJoin, parent_keys: Vec<Value>) -> Self {
        self.pivot = Some((pivot.clone(), parent_keys));
        self
    }

    async fn result_size(&self) -> Result<u64> {
        let statement = self.count_statement();
        tracing::debug!(sql = %statement.sql, "counting rows");
        self.executor.fetch_count(statement).await
    }

    async fn fetch(self) -> Result<Vec<Record>> {
        let statement = self.select_statement();
        tracing::debug!(sql = %statement.sql, "fetching rows");
        self.executor.fetch_all(statement).await
    }
}

struct Renderer<'a, E> {
    query: &'a SqlQuery<E>,
    params: Vec<Value>,
}

impl<'a, E> Renderer<'a, E> {
    fn new(query: &'a SqlQuery<E>) -> Self {
        Self {
            query,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, value: Value) -> String {
        self.params.push(value);
        self.query.dialect.placeholder(self.params.len())
    }

    /// Columns are qualified with the queried table once a pivot is joined
    fn column(&self, column: &str) -> String {
        if self.query.pivot.is_some() && !column.contains('.') {
            self.query.dialect.quote(&format!("{}.{}", self.query.table, column))
        } else {
            self.query.dialect.quote(column)
        }
    }

    fn where_clause(&mut self, sql: &mut String) {
        let query = self.query;
        let mut conditions = Vec::new();
        if let Some((pivot, keys)) = &query.pivot {
            let column = format!("{}.{}", pivot.table, pivot.parent_column);
            conditions.push(self.predicate(&Predicate::is_in(column, keys.clone())));
        }
        for predicate in &query.predicates {
            conditions.push(self.predicate(predicate));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
    }

    fn predicate(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Compare { column, op, value } if value.is_null() => match op {
                Comparison::Eq => format!("{} IS NULL", self.column(column)),
                Comparison::Ne => format!("{} IS NOT NULL", self.column(column)),
                _ => "1 = 0".to_string(),
            },
            Predicate::Compare { column, op, value } => {
                let column = self.column(column);
                format!("{column} {} {}", op.as_sql(), self.bind(value.clone()))
            }
            Predicate::In { values, .. } if values.is_empty() => "1 = 0".to_string(),
            Predicate::In { column, values } => {
                let column = self.column(column);
                let placeholders: Vec<String> = values.iter().map(|v| self.bind(v.clone())).collect();
                format!("{column} IN ({})", placeholders.join(", "))
            }
            Predicate::Like { column, pattern } => {
                let column = self.column(column);
                let like = self.query.dialect.like();
                format!("{column} {like} {}", self.bind(Value::String(pattern.clone())))
            }
            Predicate::All(predicates) => self.group(predicates, " AND ", "1 = 1"),
            Predicate::Any(predicates) => self.group(predicates, " OR ", "1 = 0"),
        }
    }

    fn group(&mut self, predicates: &[Predicate], joiner: &str, empty: &str) -> String {
        if predicates.is_empty() {
            return empty.to_string();
        }
        let parts: Vec<String> = predicates.iter().map(|p| self.predicate(p)).collect();
        format!("({})", parts.join(joiner))
    }

    /// MySQL has no `NULLS LAST`; sorting on `IS NULL` first has the same effect
    fn order(&self, field: &OrderField) -> String {
        let column = self.column(&field.column);
        let direction = field.direction.as_sql();
        match self.query.dialect {
            Dialect::MySql => format!("{column} IS NULL, {column} {direction}"),
            Dialect::Postgres | Dialect::Sqlite => format!("{column} {direction} NULLS LAST"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionResolver;
    use crate::cursor::CursorCodec;
    use crate::dataloaders::LoaderRegistry;
    use crate::pagination::PageRequest;
    use crate::relations::{Batch, EntityRecord, EntityType};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingExecutor {
        statements: Mutex<Vec<Statement>>,
        rows: Vec<Record>,
        count: u64,
    }

    #[async_trait]
    impl SqlExecutor for RecordingExecutor {
        async fn fetch_all(&self, statement: Statement) -> Result<Vec<Record>> {
            self.statements.lock().push(statement);
            Ok(self.rows.clone())
        }

        async fn fetch_count(&self, statement: Statement) -> Result<u64> {
            self.statements.lock().push(statement);
            Ok(self.count)
        }
    }

    fn query(dialect: Dialect, table: &str) -> SqlQuery<RecordingExecutor> {
        SqlQuery::new(Arc::new(RecordingExecutor::default()), dialect, table)
    }

    #[test]
    fn test_select_and_count_statements() {
        let query = query(Dialect::Postgres, "posts")
            .filter(Predicate::eq("userId", json!(1)))
            .filter(Predicate::contains("title", "a"))
            .order_by(OrderField::desc("id"))
            .limit(3)
            .offset(2);

        let select = query.select_statement();
        assert_eq!(
            select.sql,
            r#"SELECT * FROM "posts" WHERE "userId" = $1 AND "title" ILIKE $2 ORDER BY "id" DESC NULLS LAST LIMIT 3 OFFSET 2"#
        );
        assert_eq!(select.params, vec![json!(1), json!("%a%")]);

        let count = query.count_statement();
        assert_eq!(
            count.sql,
            r#"SELECT COUNT(*) AS count FROM "posts" WHERE "userId" = $1 AND "title" ILIKE $2"#
        );
    }

    #[test]
    fn test_keyset_disjunction_on_sqlite() {
        let predicate = Predicate::any(vec![
            Predicate::compare("value", Comparison::Lt, json!(20)),
            Predicate::all(vec![
                Predicate::eq("value", json!(20)),
                Predicate::compare("id", Comparison::Lt, json!(3)),
            ]),
        ]);
        let statement = query(Dialect::Sqlite, "sort_tests").filter(predicate).select_statement();
        assert_eq!(
            statement.sql,
            r#"SELECT * FROM "sort_tests" WHERE ("value" < ? OR ("value" = ? AND "id" < ?))"#
        );
        assert_eq!(statement.params, vec![json!(20), json!(20), json!(3)]);
    }

    #[test]
    fn test_degenerate_predicates() {
        let statement = query(Dialect::Postgres, "t")
            .filter(Predicate::eq("deletedAt", Value::Null))
            .filter(Predicate::is_in("id", vec![]))
            .filter(Predicate::All(vec![]))
            .filter(Predicate::Any(vec![]))
            .select_statement();
        assert_eq!(
            statement.sql,
            r#"SELECT * FROM "t" WHERE "deletedAt" IS NULL AND 1 = 0 AND 1 = 1 AND 1 = 0"#
        );
        assert!(statement.params.is_empty());
    }

    #[test]
    fn test_mysql_quoting_and_null_ordering() {
        let statement = query(Dialect::MySql, "items")
            .filter(Predicate::contains("name", "x"))
            .order_by(OrderField::asc("name"))
            .select_statement();
        assert_eq!(
            statement.sql,
            "SELECT * FROM `items` WHERE `name` LIKE ? ORDER BY `name` IS NULL, `name` ASC"
        );
    }

    #[test]
    fn test_pivot_join() {
        let pivot = PivotJoin {
            table: "post2tag".into(),
            parent_column: "postId".into(),
            related_column: "tagId".into(),
            related_id_column: "id".into(),
        };
        let statement = query(Dialect::Postgres, "tags")
            .join_pivot(&pivot, vec![json!(10), json!(11)])
            .filter(Predicate::eq("name", json!("rust")))
            .select_statement();
        assert_eq!(
            statement.sql,
            concat!(
                r#"SELECT "tags".*, "post2tag"."postId" AS "_pivot_foreign_key" FROM "tags" "#,
                r#"INNER JOIN "post2tag" ON "tags"."id" = "post2tag"."tagId" "#,
                r#"WHERE "post2tag"."postId" IN ($1, $2) AND "tags"."name" = $3"#
            )
        );
        assert_eq!(statement.params, vec![json!(10), json!(11), json!("rust")]);
    }

    #[test]
    fn test_identifier_escaping() {
        assert_eq!(Dialect::Postgres.quote(r#"we"ird"#), r#""we""ird""#);
        assert_eq!(Dialect::MySql.quote("a.b"), "`a`.`b`");
    }

    #[tokio::test]
    async fn test_relation_batch_renders_pivot_join() {
        let executor = RecordingExecutor {
            rows: vec![json!({"id": 1, "name": "rust", "_pivot_foreign_key": 10})
                .as_object()
                .cloned()
                .unwrap()],
            ..Default::default()
        };
        let source = SqlSource::new(executor, Dialect::Postgres);
        let post_type = Arc::new(EntityType::new(EntityRef::new("Post", "posts")).many_to_many(
            "tags",
            EntityRef::new("Tag", "tags"),
            "post2tag",
        ));
        let post = EntityRecord::new(post_type, json!({"id": 10}).as_object().cloned().unwrap());

        let batch = Batch::new(source.clone());
        let tags = batch
            .belongs_to_many(&LoaderRegistry::new(), &post, "tags")
            .await
            .unwrap();
        assert_eq!(tags.len(), 1);

        let statements = source.executor.statements.lock();
        assert_eq!(
            statements[0].sql,
            concat!(
                r#"SELECT "tags".*, "post2tag"."postId" AS "_pivot_foreign_key" FROM "tags" "#,
                r#"INNER JOIN "post2tag" ON "tags"."id" = "post2tag"."tagId" "#,
                r#"WHERE "post2tag"."postId" IN ($1)"#
            )
        );
        assert_eq!(statements[0].params, vec![json!(10)]);
    }

    #[tokio::test]
    async fn test_connection_resolver_statements() {
        let executor = Arc::new(RecordingExecutor {
            rows: (1..=3)
                .rev()
                .map(|id| json!({ "id": id }).as_object().cloned().unwrap())
                .collect(),
            count: 3,
            ..Default::default()
        });
        let source = executor.clone();
        let resolver =
            ConnectionResolver::new(move |_: &(), _: &()| SqlQuery::new(source.clone(), Dialect::Postgres, "items"));

        let request = PageRequest {
            after: Some(CursorCodec::encode("4")),
            ..PageRequest::new(2)
        };
        let page = resolver.resolve(&(), &request, &()).await.unwrap();
        assert_eq!(page.edges.len(), 2);
        assert!(page.page_info.has_next_page);
        assert_eq!(page.total, 3);

        let statements = executor.statements.lock();
        assert_eq!(statements[0].sql, r#"SELECT COUNT(*) AS count FROM "items""#);
        assert_eq!(
            statements[1].sql,
            r#"SELECT * FROM "items" WHERE "id" < $1 ORDER BY "id" DESC NULLS LAST LIMIT 3"#
        );
        assert_eq!(statements[1].params, vec![json!("4")]);
    }
}
