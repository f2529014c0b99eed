//! The optimistic store (spec.md §4.8): an in-memory pool of materialized
//! objects, a per-resource stack of not-yet-confirmed mutations, and the
//! live query registry that recomputes and fires callbacks when a mutation
//! touches a subscribed resource.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use errors::ErrorMetadata;
use graph::{NodeKey, ObjectGraph};
use query::{Include, RawQueryRequest};
use value::{MaterializedObject, RelationDecl, Schema};
use wire::{MessageId, Payload, Procedure};

use crate::kv::Kv;
use crate::mutation::Mutation;
use crate::resolve::{self, ResolvedObject};

type Pool = BTreeMap<String, BTreeMap<String, MaterializedObject>>;

fn relation_name_for_field<'a>(resource: &'a value::ResourceSchema, field: &str) -> Option<&'a str> {
    resource.relations.iter().find_map(|(name, decl)| match decl {
        RelationDecl::One { field: f, .. } if f == field => Some(name.as_str()),
        _ => None,
    })
}

struct Subscription {
    query: RawQueryRequest,
    flat_include: BTreeSet<String>,
    callback: Arc<dyn Fn(&[ResolvedObject]) + Send + Sync>,
    last_result: Vec<ResolvedObject>,
}

fn collect_flat_include(schema: &Schema, resource: &str, include: &BTreeMap<String, Include>, out: &mut BTreeSet<String>) {
    out.insert(resource.to_string());
    let Some(resource_schema) = schema.resource(resource) else {
        return;
    };
    for (relation_name, value) in include {
        let Some(decl) = resource_schema.relation(relation_name) else {
            continue;
        };
        let target = decl.target_resource().to_string();
        out.insert(target.clone());
        if let Include::Nested(nested) = value {
            collect_flat_include(schema, &target, &nested.include, out);
        }
    }
}

/// An opaque handle returned by [`OptimisticStore::subscribe`], passed back
/// to [`OptimisticStore::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// The client-side mirror of server state (spec.md §4.8): every resource
/// lives in `pool`, every not-yet-confirmed local write lives on that
/// resource's `optimistic_stack`, and `graph` mirrors the reference edges
/// between rows so relation descent doesn't need to rescan the whole pool.
pub struct OptimisticStore {
    schema: Arc<Schema>,
    kv: Arc<dyn Kv>,
    pool: Pool,
    optimistic_stack: BTreeMap<String, Vec<Mutation>>,
    confirmed: BTreeMap<(String, String), MaterializedObject>,
    graph: ObjectGraph,
    subscriptions: BTreeMap<u64, Subscription>,
    next_subscription_id: u64,
    #[cfg(test)]
    eval_count: std::cell::Cell<u64>,
}

impl OptimisticStore {
    pub fn new(schema: Arc<Schema>, kv: Arc<dyn Kv>) -> Self {
        Self {
            schema,
            kv,
            pool: BTreeMap::new(),
            optimistic_stack: BTreeMap::new(),
            confirmed: BTreeMap::new(),
            graph: ObjectGraph::new(),
            subscriptions: BTreeMap::new(),
            next_subscription_id: 0,
            #[cfg(test)]
            eval_count: std::cell::Cell::new(0),
        }
    }

    /// Count of [`OptimisticStore::get`] evaluations since construction.
    /// Test-only instrumentation for asserting that subscriptions sharing
    /// an identical query fingerprint are recomputed once per mutation,
    /// not once per registered callback (spec.md §8 "Subscription
    /// deduplication").
    #[cfg(test)]
    fn eval_count(&self) -> u64 {
        self.eval_count.get()
    }

    fn row(&self, resource: &str, id: &str) -> Option<&MaterializedObject> {
        self.pool.get(resource).and_then(|rows| rows.get(id))
    }

    /// Apply one mutation to the pool (spec.md §4.8 `addMutation`).
    ///
    /// `optimistic` mutations (local, not yet acknowledged) are pushed onto
    /// the resource's stack and persisted so a reload can replay them;
    /// server-origin mutations (optimistic = false) instead clear any
    /// matching stack entry by id, since the server's echo supersedes it,
    /// and update the confirmed snapshot used to replay past an `undo`.
    pub async fn add_mutation(&mut self, resource: &str, mutation: Mutation, optimistic: bool) -> anyhow::Result<()> {
        let resource_schema = self.schema.require_resource(resource)?.clone();

        if optimistic {
            self.optimistic_stack.entry(resource.to_string()).or_default().push(mutation.clone());
            self.persist_stack(resource).await?;
        }

        let prev = self.row(resource, &mutation.resource_id).cloned();
        let merged = value::merge_mutation(&resource_schema, &mutation.procedure, &mutation.payload, prev.as_ref(), &mutation.resource_id)?;

        self.pool
            .entry(resource.to_string())
            .or_default()
            .insert(mutation.resource_id.clone(), merged.object.clone());

        let source_key = NodeKey::new(resource, &mutation.resource_id);
        let source_id = self.graph.ensure_node(source_key);
        for change in &merged.reference_changes {
            let Some(relation_name) = relation_name_for_field(&resource_schema, &change.field) else {
                continue;
            };
            if change.old_target.is_some() {
                self.graph.remove_link(source_id, relation_name)?;
            }
            if let Some(new_target) = &change.new_target {
                let target = resource_schema.relation(relation_name).expect("looked up by name above").target_resource();
                let target_id = self.graph.ensure_node(NodeKey::new(target, new_target));
                self.graph.create_link(source_id, target_id, relation_name)?;
            }
        }

        if !optimistic {
            self.confirmed.insert((resource.to_string(), mutation.resource_id.clone()), merged.object);
            if let Some(stack) = self.optimistic_stack.get_mut(resource) {
                let before = stack.len();
                stack.retain(|m| m.id != mutation.id);
                if stack.len() != before {
                    self.persist_stack(resource).await?;
                }
            }
        }

        self.persist_row(resource, &mutation.resource_id).await?;
        self.recompute_subscriptions(resource).await?;
        Ok(())
    }

    /// Undo a not-yet-confirmed local mutation (spec.md §4.8 `undoMutation`,
    /// §9 open question "Optimistic rollback granularity"): remove it from
    /// the stack, then replay the remaining entries for that row, in
    /// submission order, on top of the last server-confirmed snapshot (or
    /// nothing, if the row was never confirmed).
    pub async fn undo_mutation(&mut self, resource: &str, mutation_id: &MessageId) -> anyhow::Result<()> {
        let Some(stack) = self.optimistic_stack.get_mut(resource) else {
            return Ok(());
        };
        let Some(position) = stack.iter().position(|m| &m.id == mutation_id) else {
            return Ok(());
        };
        let removed = stack.remove(position);
        let remaining: Vec<Mutation> = stack.iter().filter(|m| m.resource_id == removed.resource_id).cloned().collect();
        self.persist_stack(resource).await?;

        let resource_schema = self.schema.require_resource(resource)?.clone();
        let base = self.confirmed.get(&(resource.to_string(), removed.resource_id.clone())).cloned();

        let mut current = base;
        for entry in &remaining {
            let merged = value::merge_mutation(&resource_schema, &entry.procedure, &entry.payload, current.as_ref(), &removed.resource_id)?;
            current = Some(merged.object);
        }

        match current {
            Some(object) => {
                self.pool.entry(resource.to_string()).or_default().insert(removed.resource_id.clone(), object);
            }
            None => {
                if let Some(rows) = self.pool.get_mut(resource) {
                    rows.remove(&removed.resource_id);
                }
            }
        }

        self.persist_row(resource, &removed.resource_id).await?;
        self.recompute_subscriptions(resource).await?;
        Ok(())
    }

    /// Bulk-load a server snapshot into the pool (spec.md §4.8
    /// `loadConsolidatedState`, driven by a `SYNC` reply): each row is
    /// synthesized as an `INSERT` so it goes through the same merge path
    /// as any other confirmed write, `resourceId` taken as the row's id.
    pub async fn load_consolidated_state(&mut self, resource: &str, rows: BTreeMap<String, Payload>) -> anyhow::Result<()> {
        for (resource_id, payload) in rows {
            let mutation = Mutation::new(MessageId::new(), resource_id, Procedure::Insert, payload);
            self.add_mutation(resource, mutation, false).await?;
        }
        Ok(())
    }

    /// Evaluate `query` against the pool (spec.md §4.8 `get`): a literal
    /// `where: { id }` is resolved directly; otherwise every row of the
    /// query's resource is scanned, filtered, sorted, and limited before
    /// `include` is materialized.
    pub fn get(&self, query: &RawQueryRequest) -> anyhow::Result<Vec<ResolvedObject>> {
        #[cfg(test)]
        self.eval_count.set(self.eval_count.get() + 1);
        self.schema.require_resource(&query.resource)?;

        if let Some(where_) = query.where_.as_ref().filter(|w| w.literal_id_filter().is_some()) {
            let id = where_.literal_id_filter().expect("just checked Some above");
            let matched = self.row(&query.resource, id).filter(|row| {
                let source = resolve::PoolRowSource::new(&self.pool, &self.schema, &query.resource, row);
                where_.matches(&source)
            });
            return Ok(match matched {
                Some(row) => vec![resolve::materialize(&self.pool, &self.schema, &query.resource, row, &query.include)?],
                None => Vec::new(),
            });
        }

        let mut rows: Vec<&MaterializedObject> = self.pool.get(&query.resource).map(|rows| rows.values().collect()).unwrap_or_default();
        if let Some(where_) = &query.where_ {
            rows.retain(|row| {
                let source = resolve::PoolRowSource::new(&self.pool, &self.schema, &query.resource, row);
                where_.matches(&source)
            });
        }
        let owned: Vec<MaterializedObject> = rows.into_iter().cloned().collect();
        let ordered = query::sort_and_limit(owned, query.sort.as_ref(), query.limit, |obj, field| obj.get(field).cloned());

        ordered
            .iter()
            .map(|row| resolve::materialize(&self.pool, &self.schema, &query.resource, row, &query.include))
            .collect()
    }

    /// Register a live query (spec.md §4.8 `subscribe`): the callback fires
    /// immediately with the current result, then again whenever a mutation
    /// to any resource in the query's `include` tree changes the result.
    pub fn subscribe(&mut self, query: RawQueryRequest, callback: Arc<dyn Fn(&[ResolvedObject]) + Send + Sync>) -> anyhow::Result<SubscriptionId> {
        let mut flat_include = BTreeSet::new();
        collect_flat_include(&self.schema, &query.resource, &query.include, &mut flat_include);

        let initial = self.get(&query)?;
        callback(&initial);

        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.subscriptions.insert(
            id,
            Subscription {
                query,
                flat_include,
                callback,
                last_result: initial,
            },
        );
        Ok(SubscriptionId(id))
    }

    pub fn unsubscribe(&mut self, token: SubscriptionId) {
        self.subscriptions.remove(&token.0);
    }

    /// Recompute every live subscription touched by a mutation to
    /// `touched_resource`. Subscriptions whose query is `PartialEq` (same
    /// fingerprint) are grouped and evaluated exactly once per mutation,
    /// not once per registered callback — `store.get(Q)` is the expensive
    /// step (pool scan, `where` evaluation, `include` materialization), and
    /// spec.md §8 "Subscription deduplication" requires it run once even
    /// when N callbacks share the same live query.
    async fn recompute_subscriptions(&mut self, touched_resource: &str) -> anyhow::Result<()> {
        let mut subs = std::mem::take(&mut self.subscriptions);

        let mut groups: BTreeMap<String, Vec<u64>> = BTreeMap::new();
        for (id, sub) in subs.iter() {
            if sub.flat_include.contains(touched_resource) {
                groups.entry(sub.query.fingerprint()).or_default().push(*id);
            }
        }

        for ids in groups.into_values() {
            let Some(&representative) = ids.first() else { continue };
            let query = subs[&representative].query.clone();
            let result = self.get(&query)?;
            for id in ids {
                let sub = subs.get_mut(&id).expect("id came from this same subs map");
                if result != sub.last_result {
                    sub.last_result = result.clone();
                    (sub.callback)(&result);
                }
            }
        }

        self.subscriptions = subs;
        Ok(())
    }

    async fn persist_row(&self, resource: &str, id: &str) -> anyhow::Result<()> {
        let Some(row) = self.row(resource, id) else {
            return Ok(());
        };
        let payload = row.to_wire_payload();
        let serialized = serde_json::to_string(&payload).map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::internal("failed to serialize row for local persistence")))?;
        self.kv.set(&format!("{resource}:{id}"), serialized).await
    }

    async fn persist_stack(&self, resource: &str) -> anyhow::Result<()> {
        let stack = self.optimistic_stack.get(resource).cloned().unwrap_or_default();
        let entries: Vec<_> = stack
            .iter()
            .map(|m| {
                serde_json::json!({
                    "id": m.id.as_str(),
                    "resourceId": m.resource_id,
                    "procedure": m.procedure.as_str(),
                    "payload": m.payload,
                })
            })
            .collect();
        let serialized = serde_json::to_string(&entries).map_err(|e| anyhow::Error::new(e).context(ErrorMetadata::internal("failed to serialize mutation stack for local persistence")))?;
        self.kv.set(&format!("meta:mutationStack:{resource}"), serialized).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use wire::{FieldMeta, WireFieldValue};

    use super::*;
    use crate::kv::MemoryKv;

    fn schema() -> Arc<Schema> {
        let orgs = value::ResourceSchema::new("orgs").field(value::FieldSchema::string("name")).many("posts", "posts", "orgId");
        let posts = value::ResourceSchema::new("posts")
            .field(value::FieldSchema::string("title"))
            .field(value::FieldSchema::reference("orgId", "orgs"))
            .one("org", "orgs", "orgId", false);
        Arc::new(Schema::builder().resource(orgs).resource(posts).build().unwrap())
    }

    fn entry(value: serde_json::Value) -> WireFieldValue {
        WireFieldValue {
            value,
            meta: FieldMeta { timestamp: wire::Timestamp::now() },
        }
    }

    fn store() -> OptimisticStore {
        OptimisticStore::new(schema(), Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let mut store = store();
        let mut payload = Payload::new();
        payload.insert("name".into(), entry(serde_json::json!("Acme")));
        store.add_mutation("orgs", Mutation::new(MessageId::new(), "o1", Procedure::Insert, payload), true).await.unwrap();

        let mut query = RawQueryRequest::new("orgs");
        query.where_ = Some(query::Where::eq("id", serde_json::json!("o1")));
        let rows = store.get(&query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].object.get("name").unwrap(), "Acme");
    }

    #[tokio::test]
    async fn undo_reverts_to_last_confirmed_state() {
        let mut store = store();
        let mut insert_payload = Payload::new();
        insert_payload.insert("name".into(), entry(serde_json::json!("Acme")));
        store.add_mutation("orgs", Mutation::new(MessageId::new(), "o1", Procedure::Insert, insert_payload), false).await.unwrap();

        let update_id = MessageId::new();
        let mut update_payload = Payload::new();
        update_payload.insert("name".into(), entry(serde_json::json!("Acme Renamed")));
        store
            .add_mutation("orgs", Mutation::new(update_id.clone(), "o1", Procedure::Update, update_payload), true)
            .await
            .unwrap();

        assert_eq!(store.row("orgs", "o1").unwrap().get("name").unwrap(), "Acme Renamed");

        store.undo_mutation("orgs", &update_id).await.unwrap();
        assert_eq!(store.row("orgs", "o1").unwrap().get("name").unwrap(), "Acme");
    }

    #[tokio::test]
    async fn server_origin_mutation_clears_matching_optimistic_entry() {
        let mut store = store();
        let id = MessageId::new();
        let mut payload = Payload::new();
        payload.insert("name".into(), entry(serde_json::json!("Acme")));
        store
            .add_mutation("orgs", Mutation::new(id.clone(), "o1", Procedure::Insert, payload.clone()), true)
            .await
            .unwrap();
        assert_eq!(store.optimistic_stack.get("orgs").map(|s| s.len()), Some(1));

        store.add_mutation("orgs", Mutation::new(id, "o1", Procedure::Insert, payload), false).await.unwrap();
        assert_eq!(store.optimistic_stack.get("orgs").map(|s| s.len()), Some(0));
    }

    #[tokio::test]
    async fn subscription_fires_on_relevant_mutation_only() {
        let mut store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let mut query = RawQueryRequest::new("orgs");
        query.where_ = Some(query::Where::eq("id", serde_json::json!("o1")));
        store
            .subscribe(
                query,
                Arc::new(move |_: &[ResolvedObject]| {
                    calls_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut payload = Payload::new();
        payload.insert("title".into(), entry(serde_json::json!("Hi")));
        payload.insert("orgId".into(), entry(serde_json::json!("o1")));
        store.add_mutation("posts", Mutation::new(MessageId::new(), "p1", Procedure::Insert, payload), false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "posts mutation should not touch an orgs-only subscription");

        let mut org_payload = Payload::new();
        org_payload.insert("name".into(), entry(serde_json::json!("Acme")));
        store
            .add_mutation("orgs", Mutation::new(MessageId::new(), "o1", Procedure::Insert, org_payload), false)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn subscriptions_on_an_identical_query_are_evaluated_once_per_mutation() {
        let mut store = store();
        let mut query = RawQueryRequest::new("orgs");
        query.where_ = Some(query::Where::eq("id", serde_json::json!("o1")));

        let calls_a = Arc::new(AtomicUsize::new(0));
        let calls_a_clone = calls_a.clone();
        store.subscribe(query.clone(), Arc::new(move |_: &[ResolvedObject]| { calls_a_clone.fetch_add(1, Ordering::SeqCst); })).unwrap();

        let calls_b = Arc::new(AtomicUsize::new(0));
        let calls_b_clone = calls_b.clone();
        store.subscribe(query.clone(), Arc::new(move |_: &[ResolvedObject]| { calls_b_clone.fetch_add(1, Ordering::SeqCst); })).unwrap();

        let evaluations_before = store.eval_count();
        let mut payload = Payload::new();
        payload.insert("name".into(), entry(serde_json::json!("Acme")));
        store.add_mutation("orgs", Mutation::new(MessageId::new(), "o1", Procedure::Insert, payload), false).await.unwrap();

        assert_eq!(
            store.eval_count() - evaluations_before,
            1,
            "two subscriptions sharing an identical query fingerprint must be recomputed as a single evaluation"
        );
        assert_eq!(calls_a.load(Ordering::SeqCst), 2, "initial fire plus one notification after the mutation");
        assert_eq!(calls_b.load(Ordering::SeqCst), 2);
    }
}
