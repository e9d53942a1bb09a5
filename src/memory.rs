//! In-process implementation of the query boundary
//!
//! Tables are plain vectors of [`Record`]s. Predicates follow SQL semantics:
//! comparisons against `NULL` never match, equality with `null` is `IS NULL`,
//! and ordering puts `NULL`s last in either direction.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::query::{Comparison, Direction, OrderField, PivotJoin, Predicate, Query, PIVOT_FOREIGN_KEY};
use crate::relations::{EntityRef, RelationSource};
use crate::value::{compare_values, Record};
use crate::{GraphQLError, Result};

/// Failure injected into a table
#[derive(Error, Debug)]
#[error("{table}: {message}")]
pub struct MemoryError {
    pub table: String,
    pub message: String,
}

/// Shared in-memory tables
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<String, Vec<Record>>>>,
    failures: Arc<RwLock<HashMap<String, String>>>,
    fetches: Arc<Mutex<HashMap<String, usize>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: &str, record: Record) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_default()
            .push(record);
    }

    /// Base query over every row of `table`
    pub fn table(&self, table: &str) -> MemoryQuery {
        MemoryQuery {
            store: self.clone(),
            table: table.to_string(),
            predicates: Vec::new(),
            ordering: Vec::new(),
            limit: None,
            offset: None,
            pivot: None,
        }
    }

    /// Make every read of `table` fail with `message`
    pub fn fail_table(&self, table: &str, message: &str) {
        self.failures
            .write()
            .insert(table.to_string(), message.to_string());
    }

    /// Number of row fetches executed against `table`
    pub fn fetch_count(&self, table: &str) -> usize {
        self.fetches.lock().get(table).copied().unwrap_or(0)
    }

    fn check(&self, table: &str) -> Result<()> {
        match self.failures.read().get(table) {
            Some(message) => Err(GraphQLError::persistence(MemoryError {
                table: table.to_string(),
                message: message.clone(),
            })),
            None => Ok(()),
        }
    }
}

impl RelationSource for MemoryStore {
    type Query = MemoryQuery;

    fn query(&self, entity: &EntityRef) -> MemoryQuery {
        self.table(&entity.table)
    }
}

/// Pending read against a [`MemoryStore`] table
#[derive(Clone)]
pub struct MemoryQuery {
    store: MemoryStore,
    table: String,
    predicates: Vec<Predicate>,
    ordering: Vec<OrderField>,
    limit: Option<u64>,
    offset: Option<u64>,
    pivot: Option<(PivotJoin, Vec<Value>)>,
}

impl MemoryQuery {
    fn source_rows(&self) -> Vec<Record> {
        let tables = self.store.tables.read();
        let rows = tables.get(&self.table).map(Vec::as_slice).unwrap_or_default();

        let Some((pivot, parent_keys)) = &self.pivot else {
            return rows.to_vec();
        };

        let links = tables.get(&pivot.table).map(Vec::as_slice).unwrap_or_default();
        links
            .iter()
            .filter_map(|link| {
                let parent_key = link.get(&pivot.parent_column)?;
                if !parent_keys.iter().any(|key| is_equal(parent_key, key)) {
                    return None;
                }
                let related_key = link.get(&pivot.related_column)?;
                Some(
                    rows.iter()
                        .filter(|row| {
                            row.get(&pivot.related_id_column)
                                .is_some_and(|id| is_equal(id, related_key))
                        })
                        .map(|row| {
                            let mut joined = row.clone();
                            joined.insert(PIVOT_FOREIGN_KEY.to_string(), parent_key.clone());
                            joined
                        })
                        .collect::<Vec<_>>(),
                )
            })
            .flatten()
            .collect()
    }

    fn matching_rows(&self) -> Vec<Record> {
        self.source_rows()
            .into_iter()
            .filter(|row| self.predicates.iter().all(|p| matches(p, row)))
            .collect()
    }
}

#[async_trait]
impl Query for MemoryQuery {
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
        self.store.check(&self.table)?;
        Ok(self.matching_rows().len() as u64)
    }

    async fn fetch(self) -> Result<Vec<Record>> {
        self.store.check(&self.table)?;
        *self.store.fetches.lock().entry(self.table.clone()).or_default() += 1;

        let mut rows = self.matching_rows();
        rows.sort_by(|a, b| compare_rows(a, b, &self.ordering));

        let offset = self.offset.unwrap_or(0) as usize;
        let limit = self.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }
}

fn is_equal(left: &Value, right: &Value) -> bool {
    compare_values(left, right) == Some(Ordering::Equal)
}

fn matches(predicate: &Predicate, row: &Record) -> bool {
    match predicate {
        Predicate::Compare { column, op, value } => {
            let actual = row.get(column).unwrap_or(&Value::Null);
            if value.is_null() {
                return match op {
                    Comparison::Eq => actual.is_null(),
                    Comparison::Ne => !actual.is_null(),
                    _ => false,
                };
            }
            compare_values(actual, value).is_some_and(|ordering| op.accepts(ordering))
        }
        Predicate::In { column, values } => {
            let actual = row.get(column).unwrap_or(&Value::Null);
            values.iter().any(|value| is_equal(actual, value))
        }
        Predicate::Like { column, pattern } => {
            let text = match row.get(column) {
                Some(Value::String(s)) => s.to_lowercase(),
                Some(Value::Null) | None => return false,
                Some(other) => other.to_string().to_lowercase(),
            };
            let text: Vec<char> = text.chars().collect();
            let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
            like(&text, &pattern)
        }
        Predicate::All(predicates) => predicates.iter().all(|p| matches(p, row)),
        Predicate::Any(predicates) => predicates.iter().any(|p| matches(p, row)),
    }
}

/// Wildcard match that only ever backtracks to the most recent `%`
fn like(text: &[char], pattern: &[char]) -> bool {
    let (mut t, mut p) = (0, 0);
    let mut wildcard: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p).copied() {
            Some('%') => {
                wildcard = Some((p, t));
                p += 1;
            }
            Some('_') => {
                t += 1;
                p += 1;
            }
            Some(c) if c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match wildcard {
                Some((wildcard_p, wildcard_t)) => {
                    p = wildcard_p + 1;
                    t = wildcard_t + 1;
                    wildcard = Some((wildcard_p, t));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

fn compare_rows(a: &Record, b: &Record, ordering: &[OrderField]) -> Ordering {
    for field in ordering {
        let left = a.get(&field.column).unwrap_or(&Value::Null);
        let right = b.get(&field.column).unwrap_or(&Value::Null);
        let ordering = match (left.is_null(), right.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
                match field.direction {
                    Direction::Asc => ordering,
                    Direction::Desc => ordering.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
