//! Execution of a planned query (spec.md §4.5): resolve each
//! [`query::QueryStep`] through storage and a batcher, joining child step
//! results into their parent rows by the declared relation, and applying
//! sort/limit to the root step only.

use std::collections::BTreeSet;

use errors::ErrorMetadata;
use query::{apply_route_guards, breakdown_query, Ctx, FieldSource, QueryStep, RelationTargets, RouteGuard, Where};
use storage::{Batcher, ReadSpec, Row, Storage};
use value::{RelationDecl, ResourceSchema, Schema};

struct SchemaRelations<'a>(&'a Schema);

impl<'a> RelationTargets for SchemaRelations<'a> {
    fn target_resource(&self, resource: &str, relation: &str) -> anyhow::Result<String> {
        let resource = self.0.require_resource(resource)?;
        let decl = resource.relation(relation).ok_or_else(|| {
            anyhow::Error::new(ErrorMetadata::planning(
                "UnknownRelation",
                format!("{:?} has no declared relation named {relation:?}.", resource.name),
            ))
        })?;
        Ok(decl.target_resource().to_string())
    }
}

/// The rows a single step resolved to, keyed by id (order is whatever
/// [`query::sort_and_limit`] produced for the root step; insertion order
/// from storage otherwise).
pub struct StepResult {
    pub step: QueryStep,
    pub rows: Vec<Row>,
}

/// Run a [`query::RawQueryRequest`] to completion: plan it, apply route
/// guards, and resolve every step in order. Each step after the root is
/// resolved against the rows its parent step already produced.
pub async fn execute_query(
    schema: &Schema,
    storage: &dyn Storage,
    batcher: &dyn Batcher,
    guard: &dyn RouteGuard,
    ctx: &Ctx,
    request: &query::RawQueryRequest,
) -> anyhow::Result<Vec<StepResult>> {
    let steps = breakdown_query(request, &SchemaRelations(schema))?;
    let steps = apply_route_guards(steps, guard, ctx)?;

    let mut results: Vec<StepResult> = Vec::with_capacity(steps.len());
    for step in steps {
        let rows = if step.step_path.is_empty() {
            fetch_root(schema, storage, batcher, &step).await?
        } else {
            fetch_joined(schema, storage, batcher, &step, &results).await?
        };
        results.push(StepResult { step, rows });
    }
    Ok(results)
}

async fn fetch_root(schema: &Schema, storage: &dyn Storage, batcher: &dyn Batcher, step: &QueryStep) -> anyhow::Result<Vec<Row>> {
    let spec = ReadSpec {
        where_: step.where_.clone(),
        sort: step.sort.clone(),
        limit: step.limit,
    };
    let rows = storage.get(&step.resource, &spec).await?;
    let filtered = filter_rows(schema, batcher, &step.resource, rows, step.where_.as_ref()).await?;
    Ok(query::sort_and_limit(filtered, step.sort.as_ref(), step.limit, |row, field| {
        storage::field_value(row, field)
    }))
}

async fn fetch_joined(
    schema: &Schema,
    storage: &dyn Storage,
    batcher: &dyn Batcher,
    step: &QueryStep,
    results: &[StepResult],
) -> anyhow::Result<Vec<Row>> {
    let parent_path = &step.step_path[..step.step_path.len() - 1];
    let parent = results
        .iter()
        .find(|r| r.step.step_path == parent_path)
        .ok_or_else(|| anyhow::Error::new(ErrorMetadata::internal("parent step resolved before its child, which should be impossible")))?;
    let relation_name = step.step_path.last().expect("non-root step has a step path");
    let parent_resource = schema.require_resource(&parent.step.resource)?;
    let relation = parent_resource.relation(relation_name).ok_or_else(|| {
        anyhow::Error::new(ErrorMetadata::planning(
            "UnknownRelation",
            format!("{:?} has no declared relation named {relation_name:?}.", parent_resource.name),
        ))
    })?;

    match relation {
        RelationDecl::One { field, .. } => {
            let ids: Vec<String> = parent
                .rows
                .iter()
                .filter_map(|row| storage::field_value(row, field).and_then(|v| v.as_str().map(str::to_string)))
                .collect();
            let fetched = batcher.get_many(&step.resource, &ids).await?;
            let rows: Vec<Row> = fetched.into_values().collect();
            filter_rows(schema, batcher, &step.resource, rows, step.where_.as_ref()).await
        }
        RelationDecl::Many { field, .. } => {
            let ids: Vec<serde_json::Value> = parent.rows.iter().map(|row| serde_json::json!(row.id)).collect();
            let fk_where = Where::Field(field.clone(), query::FieldPredicate::In(ids));
            let combined = match &step.where_ {
                Some(existing) => Where::And(vec![fk_where, existing.clone()]),
                None => fk_where,
            };
            let spec = ReadSpec {
                where_: Some(combined.clone()),
                sort: None,
                limit: None,
            };
            let rows = storage.get(&step.resource, &spec).await?;
            filter_rows(schema, batcher, &step.resource, rows, Some(&combined)).await
        }
    }
}

/// Row access for [`Where::matches`] against storage-backed rows, with
/// one-relation descent resolved from a prefetched cache. Many-relations
/// are not navigable inside `where` (see [`query::FieldSource`]).
struct RowSource<'a> {
    resource: &'a ResourceSchema,
    row: &'a Row,
    related: &'a std::collections::BTreeMap<String, (ResourceSchema, std::collections::BTreeMap<String, Row>)>,
}

impl<'a> FieldSource for RowSource<'a> {
    fn field(&self, name: &str) -> Option<serde_json::Value> {
        storage::field_value(self.row, name)
    }

    fn related(&self, relation: &str) -> Option<Box<dyn FieldSource + '_>> {
        let RelationDecl::One { field, .. } = self.resource.relation(relation)? else {
            return None;
        };
        let target_id = storage::field_value(self.row, field)?.as_str()?.to_string();
        let (target_resource, target_rows) = self.related.get(relation)?;
        let target_row = target_rows.get(&target_id)?;
        Some(Box::new(RowSource {
            resource: target_resource,
            row: target_row,
            related: self.related,
        }))
    }
}

fn collect_relation_names(where_: &Where, out: &mut BTreeSet<String>) {
    match where_ {
        Where::And(clauses) | Where::Or(clauses) => clauses.iter().for_each(|c| collect_relation_names(c, out)),
        Where::Not(inner) => collect_relation_names(inner, out),
        Where::Field(..) => {}
        Where::Relation(name, inner) => {
            out.insert(name.clone());
            collect_relation_names(inner, out);
        }
    }
}

async fn filter_rows(
    schema: &Schema,
    batcher: &dyn Batcher,
    resource_name: &str,
    rows: Vec<Row>,
    where_: Option<&Where>,
) -> anyhow::Result<Vec<Row>> {
    let Some(where_) = where_ else { return Ok(rows) };
    let resource = schema.require_resource(resource_name)?;

    let mut relation_names = BTreeSet::new();
    collect_relation_names(where_, &mut relation_names);

    let mut related = std::collections::BTreeMap::new();
    for relation_name in &relation_names {
        let Some(decl @ RelationDecl::One { field, .. }) = resource.relation(relation_name) else {
            continue;
        };
        let target_resource_name = decl.target_resource().to_string();
        let target_resource = schema.require_resource(&target_resource_name)?.clone();
        let ids: Vec<String> = rows
            .iter()
            .filter_map(|row| storage::field_value(row, field).and_then(|v| v.as_str().map(str::to_string)))
            .collect();
        let fetched = batcher.get_many(&target_resource_name, &ids).await?;
        related.insert(relation_name.clone(), (target_resource, fetched));
    }

    Ok(rows
        .into_iter()
        .filter(|row| {
            let source = RowSource { resource, row, related: &related };
            where_.matches(&source)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use query::{AllowAll, RawQueryRequest};
    use value::{FieldSchema, FieldValue, MaterializedObject};
    use wire::Timestamp;

    use super::*;

    struct InMemory(Mutex<BTreeMap<(String, String), Row>>);

    impl InMemory {
        fn new() -> Self {
            Self(Mutex::new(BTreeMap::new()))
        }

        fn seed(&self, resource: &str, row: Row) {
            self.0.lock().unwrap().insert((resource.to_string(), row.id.clone()), row);
        }
    }

    #[async_trait]
    impl Storage for InMemory {
        async fn get(&self, resource: &str, _spec: &ReadSpec) -> anyhow::Result<Vec<Row>> {
            Ok(self.0.lock().unwrap().iter().filter(|((r, _), _)| r == resource).map(|(_, row)| row.clone()).collect())
        }

        async fn get_one(&self, resource: &str, id: &str) -> anyhow::Result<Option<Row>> {
            Ok(self.0.lock().unwrap().get(&(resource.to_string(), id.to_string())).cloned())
        }

        async fn put(&self, resource: &str, row: Row) -> anyhow::Result<()> {
            self.seed(resource, row);
            Ok(())
        }

        async fn delete(&self, resource: &str, id: &str) -> anyhow::Result<()> {
            self.0.lock().unwrap().remove(&(resource.to_string(), id.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl Batcher for InMemory {
        async fn get_many(&self, resource: &str, ids: &[String]) -> anyhow::Result<BTreeMap<String, Row>> {
            let mut out = BTreeMap::new();
            for id in ids {
                if let Some(row) = self.get_one(resource, id).await? {
                    out.insert(id.clone(), row);
                }
            }
            Ok(out)
        }
    }

    fn row(id: &str, fields: &[(&str, serde_json::Value)]) -> Row {
        let ts = Timestamp::now();
        MaterializedObject {
            id: id.to_string(),
            fields: fields
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        FieldValue {
                            value: value.clone(),
                            timestamp: ts.clone(),
                        },
                    )
                })
                .collect(),
            timestamp: ts,
        }
    }

    fn schema() -> Schema {
        let orgs = ResourceSchema::new("orgs").field(FieldSchema::string("name")).many("posts", "posts", "orgId");
        let posts = ResourceSchema::new("posts")
            .field(FieldSchema::string("title"))
            .field(FieldSchema::reference("orgId", "orgs"))
            .one("org", "orgs", "orgId", false);
        Schema::builder().resource(orgs).resource(posts).build().unwrap()
    }

    #[tokio::test]
    async fn many_relation_step_joins_children_by_foreign_key() {
        let backend = InMemory::new();
        backend.seed("orgs", row("o1", &[("name", serde_json::json!("Acme"))]));
        backend.seed("posts", row("p1", &[("title", serde_json::json!("Hi")), ("orgId", serde_json::json!("o1"))]));
        backend.seed("posts", row("p2", &[("title", serde_json::json!("Bye")), ("orgId", serde_json::json!("o2"))]));

        let mut request = RawQueryRequest::new("orgs");
        request.include.insert("posts".to_string(), query::Include::Leaf);

        let results = execute_query(&schema(), &backend, &backend, &AllowAll, &Ctx::new(), &request).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rows.len(), 1);
        assert_eq!(results[1].rows.len(), 1);
        assert_eq!(results[1].rows[0].id, "p1");
    }

    #[tokio::test]
    async fn one_relation_step_resolves_via_batcher() {
        let backend = InMemory::new();
        backend.seed("orgs", row("o1", &[("name", serde_json::json!("Acme"))]));
        backend.seed("posts", row("p1", &[("title", serde_json::json!("Hi")), ("orgId", serde_json::json!("o1"))]));

        let mut request = RawQueryRequest::new("posts");
        request.include.insert("org".to_string(), query::Include::Leaf);

        let results = execute_query(&schema(), &backend, &backend, &AllowAll, &Ctx::new(), &request).await.unwrap();
        assert_eq!(results[1].step.resource, "orgs");
        assert_eq!(results[1].rows[0].id, "o1");
    }

    #[tokio::test]
    async fn guard_rejection_fails_the_whole_query() {
        let backend = InMemory::new();
        backend.seed("posts", row("p1", &[("title", serde_json::json!("Hi")), ("orgId", serde_json::json!("o1"))]));
        let guard = query::guard_fn(|_step, _ctx| anyhow::bail!(ErrorMetadata::unauthorized("NoPosts", "not allowed")));
        let request = RawQueryRequest::new("posts");
        assert!(execute_query(&schema(), &backend, &backend, guard.as_ref(), &Ctx::new(), &request).await.is_err());
    }

    #[tokio::test]
    async fn relation_predicate_in_where_filters_via_prefetch() {
        let backend = InMemory::new();
        backend.seed("orgs", row("o1", &[("name", serde_json::json!("Acme"))]));
        backend.seed("orgs", row("o2", &[("name", serde_json::json!("Other"))]));
        backend.seed("posts", row("p1", &[("title", serde_json::json!("Hi")), ("orgId", serde_json::json!("o1"))]));
        backend.seed("posts", row("p2", &[("title", serde_json::json!("Bye")), ("orgId", serde_json::json!("o2"))]));

        let mut request = RawQueryRequest::new("posts");
        request.where_ = Some(Where::Relation("org".to_string(), Box::new(Where::eq("name", serde_json::json!("Acme")))));

        let results = execute_query(&schema(), &backend, &backend, &AllowAll, &Ctx::new(), &request).await.unwrap();
        assert_eq!(results[0].rows.len(), 1);
        assert_eq!(results[0].rows[0].id, "p1");
    }
}
