//! The contract the server query engine needs from a storage backend.
//!
//! No concrete backend lives here: spec.md §1 scopes storage engines,
//! indexing, and transactions out, so this crate only fixes the trait a
//! backend must implement and the batching capability the query engine
//! uses to avoid one round trip per row.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value as Json;
use value::MaterializedObject;

/// A single stored row's current materialized state, keyed by id. Mirrors
/// what the object graph and client pool hold, so a row fetched from
/// storage can be merged straight into either.
pub type Row = MaterializedObject;

/// Filter and ordering a backend is asked to apply natively when it can;
/// a backend that cannot push down `where`/`sort`/`limit` may ignore them
/// and let the caller re-filter, but must never return *fewer* rows than
/// match (it may return more).
#[derive(Clone, Debug, Default)]
pub struct ReadSpec {
    pub where_: Option<query::Where>,
    pub sort: Option<query::Sort>,
    pub limit: Option<usize>,
}

/// What the server query engine needs from a backend: read rows of a
/// resource, read one row by id (for relation joins), and apply a merged
/// mutation. Write methods take the *already merged* [`Row`] (per-field
/// LWW resolution happens in the `value` crate, above storage) so a
/// backend only needs to persist, never to resolve conflicts itself.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, resource: &str, spec: &ReadSpec) -> anyhow::Result<Vec<Row>>;

    async fn get_one(&self, resource: &str, id: &str) -> anyhow::Result<Option<Row>>;

    async fn put(&self, resource: &str, row: Row) -> anyhow::Result<()>;

    async fn delete(&self, resource: &str, id: &str) -> anyhow::Result<()>;
}

/// A backend's capability to satisfy many [`Storage::get_one`]-shaped
/// lookups, across possibly many resources, without a round trip per
/// lookup. The query engine uses this when resolving a step's parent rows'
/// relation references into the next step's join keys (spec.md §4.5: a
/// non-root step's effective `where` includes "id is one of the set of
/// foreign keys collected from the parent step's rows").
#[async_trait]
pub trait Batcher: Send + Sync {
    async fn get_many(&self, resource: &str, ids: &[String]) -> anyhow::Result<BTreeMap<String, Row>>;
}

/// Default [`Batcher`] for any [`Storage`]: issues one [`Storage::get_one`]
/// per id. A backend that can do better (a single `IN (...)` query, a
/// batched KV multi-get) should implement [`Batcher`] directly instead of
/// relying on this.
pub struct SequentialBatcher<'s, S: Storage + ?Sized>(pub &'s S);

#[async_trait]
impl<'s, S: Storage + ?Sized + Sync> Batcher for SequentialBatcher<'s, S> {
    async fn get_many(&self, resource: &str, ids: &[String]) -> anyhow::Result<BTreeMap<String, Row>> {
        let mut out = BTreeMap::new();
        for id in ids {
            if let Some(row) = self.0.get_one(resource, id).await? {
                out.insert(id.clone(), row);
            }
        }
        Ok(out)
    }
}

/// Extract a scalar field's value off a [`Row`] for use with
/// [`query::FieldSource`]-shaped evaluation against storage-backed rows.
pub fn field_value(row: &Row, name: &str) -> Option<Json> {
    row.get(name).cloned()
}
