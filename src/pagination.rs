//! Relay-style connection types

use async_graphql::{InputObject, Json, Object, SimpleObject};

use crate::value::Record;

/// Page information
#[derive(SimpleObject, Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub start_cursor: Option<String>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

/// Edge in a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Edge<T> {
    pub cursor: String,
    pub node: T,
}

#[Object]
impl<T: async_graphql::OutputType> Edge<T> {
    async fn cursor(&self) -> &str {
        &self.cursor
    }

    async fn node(&self) -> &T {
        &self.node
    }
}

/// Connection (paginated result)
#[derive(Debug, Clone, PartialEq)]
pub struct Connection<T> {
    /// Matching rows, ignoring pagination
    pub total: u64,
    pub edges: Vec<Edge<T>>,
    pub page_info: PageInfo,
}

#[Object]
impl<T: async_graphql::OutputType> Connection<T> {
    async fn total(&self) -> u64 {
        self.total
    }

    async fn edges(&self) -> &[Edge<T>] {
        &self.edges
    }

    async fn page_info(&self) -> &PageInfo {
        &self.page_info
    }
}

impl<T> Connection<T> {
    /// Create new connection; start and end cursors come from the first and last edge
    pub fn new(edges: Vec<Edge<T>>, total: u64, has_next_page: bool) -> Self {
        let start_cursor = edges.first().map(|e| e.cursor.clone());
        let end_cursor = edges.last().map(|e| e.cursor.clone());

        Self {
            total,
            edges,
            page_info: PageInfo {
                start_cursor,
                end_cursor,
                has_next_page,
            },
        }
    }

    /// Create empty connection
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, false)
    }

    /// Convert every node, keeping cursors and page info
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> Connection<U> {
        Connection {
            total: self.total,
            edges: self
                .edges
                .into_iter()
                .map(|edge| Edge {
                    cursor: edge.cursor,
                    node: f(edge.node),
                })
                .collect(),
            page_info: self.page_info,
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &T> {
        self.edges.iter().map(|e| &e.node)
    }
}

/// Page arguments of a connection field
///
/// `before` is accepted for schema compatibility but only forward (`after`)
/// pagination is implemented.
#[derive(InputObject, Debug, Clone, Default)]
pub struct PageRequest {
    /// Number of items to return; absent or non-positive uses the configured page size
    pub first: Option<i32>,

    /// Opaque cursor to continue after
    pub after: Option<String>,

    /// Reserved
    pub before: Option<String>,

    /// Case-insensitive search across the searchable columns
    pub keyword: Option<String>,

    /// Sort column, `-` prefix for descending
    pub order_by: Option<String>,

    /// Column filters, applied through the configured filterable strategy
    pub filter_by: Option<Json<Record>>,
}

impl PageRequest {
    /// Request the first `first` items
    pub fn new(first: i32) -> Self {
        Self {
            first: Some(first),
            ..Default::default()
        }
    }

    /// Page size, falling back to `default` when absent or not positive
    pub fn page_size(&self, default: usize) -> usize {
        match self.first {
            Some(first) if first > 0 => first as usize,
            _ => default,
        }
    }

    pub fn filter_by(&self) -> Option<&Record> {
        self.filter_by.as_ref().map(|json| &json.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_creation() {
        let edges = vec![
            Edge {
                cursor: "Mw==".to_string(),
                node: 3,
            },
            Edge {
                cursor: "Mg==".to_string(),
                node: 2,
            },
        ];
        let conn = Connection::new(edges, 3, true);
        assert_eq!(conn.edges.len(), 2);
        assert!(conn.page_info.has_next_page);
        assert_eq!(conn.page_info.start_cursor.as_deref(), Some("Mw=="));
        assert_eq!(conn.page_info.end_cursor.as_deref(), Some("Mg=="));
    }

    #[test]
    fn test_empty_connection() {
        let conn: Connection<i32> = Connection::empty();
        assert_eq!(conn.total, 0);
        assert_eq!(conn.page_info, PageInfo::default());
    }

    #[test]
    fn test_map_keeps_cursors() {
        let conn = Connection::new(
            vec![Edge {
                cursor: "MQ==".to_string(),
                node: 1,
            }],
            1,
            false,
        )
        .map(|n| n.to_string());
        assert_eq!(conn.edges[0].node, "1");
        assert_eq!(conn.edges[0].cursor, "MQ==");
    }

    #[test]
    fn test_page_size_defaults() {
        assert_eq!(PageRequest::default().page_size(10), 10);
        assert_eq!(PageRequest::new(0).page_size(10), 10);
        assert_eq!(PageRequest::new(-3).page_size(10), 10);
        assert_eq!(PageRequest::new(2).page_size(10), 2);
    }
}
