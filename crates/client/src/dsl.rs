//! The query DSL (spec.md §4.8 `QueryBuilder`): an immutable, chainable
//! builder over [`RawQueryRequest`] with `one`/`first` convenience for
//! collapsing a result set down to a single row.

use std::collections::BTreeMap;
use std::sync::Arc;

use errors::ErrorMetadata;
use query::{Include, NestedQuery, RawQueryRequest, Sort, Where};

use crate::resolve::ResolvedObject;
use crate::store::{OptimisticStore, SubscriptionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Cardinality {
    Many,
    First,
    One,
}

/// The result of executing a [`QueryBuilder`]: `Many` unless `.one()` or
/// `.first()` was called, in which case the row list collapses to a single
/// optional row.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryResult {
    Many(Vec<ResolvedObject>),
    Single(Option<ResolvedObject>),
}

/// Builds a [`RawQueryRequest`] one call at a time. Every method consumes
/// and returns `self` by value — there is no mutable builder state to share
/// or race across clones.
#[derive(Clone, Debug)]
pub struct QueryBuilder {
    resource: String,
    where_: Option<Where>,
    include: BTreeMap<String, Include>,
    sort: Option<Sort>,
    limit: Option<usize>,
    cardinality: Cardinality,
}

impl QueryBuilder {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            where_: None,
            include: BTreeMap::new(),
            sort: None,
            limit: None,
            cardinality: Cardinality::Many,
        }
    }

    pub fn where_(mut self, where_: Where) -> Self {
        self.where_ = Some(where_);
        self
    }

    /// Include a relation with no further narrowing (`Include::Leaf`).
    pub fn include(mut self, relation: impl Into<String>) -> Self {
        self.include.insert(relation.into(), Include::Leaf);
        self
    }

    /// Include a relation with its own `where`/`sort`/`limit`/nested
    /// `include` (spec.md §4.5 `IncludeTree`).
    pub fn include_nested(mut self, relation: impl Into<String>, nested: NestedQuery) -> Self {
        self.include.insert(relation.into(), Include::Nested(Box::new(nested)));
        self
    }

    pub fn order_by(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Collapse the result to the first matching row, or `None` if there
    /// are none. Does not error on more than one match.
    pub fn first(mut self) -> Self {
        self.cardinality = Cardinality::First;
        self.limit = Some(self.limit.unwrap_or(1));
        self
    }

    /// Collapse the result to exactly one row; executing errors if the
    /// match count is not exactly one.
    pub fn one(mut self) -> Self {
        self.cardinality = Cardinality::One;
        self
    }

    pub fn build_query_request(&self) -> RawQueryRequest {
        RawQueryRequest {
            resource: self.resource.clone(),
            where_: self.where_.clone(),
            include: self.include.clone(),
            limit: self.limit,
            sort: self.sort.clone(),
        }
    }

    fn collapse(&self, mut rows: Vec<ResolvedObject>) -> anyhow::Result<QueryResult> {
        match self.cardinality {
            Cardinality::Many => Ok(QueryResult::Many(rows)),
            Cardinality::First => Ok(QueryResult::Single(if rows.is_empty() { None } else { Some(rows.remove(0)) })),
            Cardinality::One => {
                if rows.len() != 1 {
                    anyhow::bail!(ErrorMetadata::not_found(
                        "ExpectedExactlyOneRow",
                        format!("query on {:?} matched {} rows, expected exactly one", self.resource, rows.len())
                    ));
                }
                Ok(QueryResult::Single(Some(rows.remove(0))))
            }
        }
    }

    pub fn get(&self, store: &OptimisticStore) -> anyhow::Result<QueryResult> {
        let rows = store.get(&self.build_query_request())?;
        self.collapse(rows)
    }

    pub fn subscribe(&self, store: &mut OptimisticStore, callback: Arc<dyn Fn(&QueryResult) + Send + Sync>) -> anyhow::Result<SubscriptionId> {
        let builder = self.clone();
        store.subscribe(
            self.build_query_request(),
            Arc::new(move |rows: &[ResolvedObject]| match builder.collapse(rows.to_vec()) {
                Ok(result) => callback(&result),
                Err(err) => tracing::warn!(%err, "live query callback skipped: collapse failed"),
            }),
        )
    }
}
