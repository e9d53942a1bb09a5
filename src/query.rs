//! Query boundary consumed by the connection resolver and relation loaders
//!
//! Backends implement [`Query`]; resolvers only ever add predicates, ordering
//! and a window, then count or fetch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use crate::value::Row;

/// Column alias carrying the pivot's parent key in many-to-many fetches
pub const PIVOT_FOREIGN_KEY: &str = "_pivot_foreign_key";

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }

    /// Comparison selecting rows that come after a position in this direction
    pub fn after(&self) -> Comparison {
        match self {
            Direction::Asc => Comparison::Gt,
            Direction::Desc => Comparison::Lt,
        }
    }
}

/// One `column direction` pair of an ordering. Always `NULLS LAST`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderField {
    pub column: String,
    pub direction: Direction,
}

impl OrderField {
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }

    /// Parse an `orderBy` argument: `"name"` ascending, `"-name"` descending
    pub fn parse(input: &str) -> Self {
        let column = input.trim_start_matches('-');
        if input.starts_with('-') {
            Self::desc(column)
        } else {
            Self::asc(column)
        }
    }
}

impl fmt::Display for OrderField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} NULLS LAST", self.column, self.direction.as_sql())
    }
}

/// Binary comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
        }
    }

    /// Whether `left.cmp(right) == ordering` satisfies `left <op> right`
    pub fn accepts(&self, ordering: Ordering) -> bool {
        match self {
            Comparison::Eq => ordering == Ordering::Equal,
            Comparison::Ne => ordering != Ordering::Equal,
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Gte => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Lte => ordering != Ordering::Greater,
        }
    }
}

/// Predicate tree handed to the persistence layer
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `column <op> value`; equality against `null` means `IS NULL`
    Compare {
        column: String,
        op: Comparison,
        value: Value,
    },
    /// `column IN (values)`; empty matches nothing
    In { column: String, values: Vec<Value> },
    /// Case-insensitive `LIKE` with `%` and `_` wildcards
    Like { column: String, pattern: String },
    /// Conjunction; empty matches everything
    All(Vec<Predicate>),
    /// Disjunction; empty matches nothing
    Any(Vec<Predicate>),
}

impl Predicate {
    pub fn compare(column: impl Into<String>, op: Comparison, value: Value) -> Self {
        Predicate::Compare {
            column: column.into(),
            op,
            value,
        }
    }

    pub fn eq(column: impl Into<String>, value: Value) -> Self {
        Self::compare(column, Comparison::Eq, value)
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Predicate::In {
            column: column.into(),
            values,
        }
    }

    /// `column` contains `keyword`, ignoring case
    pub fn contains(column: impl Into<String>, keyword: &str) -> Self {
        Predicate::Like {
            column: column.into(),
            pattern: format!("%{keyword}%"),
        }
    }

    /// Conjunction, collapsed when it holds a single predicate
    pub fn all(mut predicates: Vec<Predicate>) -> Self {
        if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Predicate::All(predicates)
        }
    }

    /// Disjunction, collapsed when it holds a single predicate
    pub fn any(mut predicates: Vec<Predicate>) -> Self {
        if predicates.len() == 1 {
            predicates.remove(0)
        } else {
            Predicate::Any(predicates)
        }
    }
}

/// Join through a pivot table for many-to-many fetches.
///
/// The related table is joined on `related.related_id_column = pivot.related_column`
/// and `pivot.parent_column` is selected as [`PIVOT_FOREIGN_KEY`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PivotJoin {
    pub table: String,
    pub parent_column: String,
    pub related_column: String,
    pub related_id_column: String,
}

/// A pending filtered and ordered read against one relation
#[async_trait]
pub trait Query: Send + Sync + Sized {
    type Row: Row;

    /// AND a predicate onto the query
    fn filter(self, predicate: Predicate) -> Self;

    fn where_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.filter(Predicate::is_in(column, values))
    }

    /// Append an ordering column
    fn order_by(self, field: OrderField) -> Self;

    fn limit(self, limit: u64) -> Self;

    fn offset(self, offset: u64) -> Self;

    /// Join through `pivot`, keeping rows linked to one of `parent_keys`
    fn join_pivot(self, pivot: &PivotJoin, parent_keys: Vec<Value>) -> Self;

    /// Number of matching rows, ignoring limit and offset
    async fn result_size(&self) -> crate::Result<u64>;

    /// Execute and return the rows in order
    async fn fetch(self) -> crate::Result<Vec<Self::Row>>;
}

/// Produces the base query of one resolver invocation
pub trait QuerySource<P, C>: Send + Sync {
    type Query: Query;

    fn query(&self, ctx: &C, parent: &P) -> Self::Query;
}

impl<P, C, Q, F> QuerySource<P, C> for F
where
    F: Fn(&C, &P) -> Q + Send + Sync,
    Q: Query,
{
    type Query = Q;

    fn query(&self, ctx: &C, parent: &P) -> Q {
        self(ctx, parent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_order_field_parse() {
        assert_eq!(OrderField::parse("-value"), OrderField::desc("value"));
        assert_eq!(OrderField::parse("name"), OrderField::asc("name"));
        assert_eq!(OrderField::desc("id").to_string(), "id DESC NULLS LAST");
    }

    #[test]
    fn test_single_predicate_groups_collapse() {
        let only = Predicate::eq("id", json!(1));
        assert_eq!(Predicate::all(vec![only.clone()]), only);
        assert_eq!(Predicate::any(vec![]), Predicate::Any(vec![]));
    }
}
