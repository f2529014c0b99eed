//! Recursive materialization of an `include` tree against the in-memory
//! pool (spec.md §4.8 `get`: `materializeOneWithInclude`).

use std::collections::BTreeMap;

use query::{FieldSource, Include};
use value::{MaterializedObject, RelationDecl, Schema};

/// One resolved row plus whatever its `include` tree asked for, nested one
/// level per relation traversed.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedObject {
    pub resource: String,
    pub object: MaterializedObject,
    pub includes: BTreeMap<String, IncludeResult>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IncludeResult {
    One(Option<Box<ResolvedObject>>),
    Many(Vec<ResolvedObject>),
}

/// Row access backed directly by the pool, so relation descent ([`FieldSource::related`])
/// can walk arbitrarily many one-relation hops with no prefetch step —
/// unlike the server engine's storage-backed evaluator, everything here is
/// already resident in memory.
pub struct PoolRowSource<'a> {
    pool: &'a BTreeMap<String, BTreeMap<String, MaterializedObject>>,
    schema: &'a Schema,
    resource: &'a str,
    row: &'a MaterializedObject,
}

impl<'a> PoolRowSource<'a> {
    pub fn new(pool: &'a BTreeMap<String, BTreeMap<String, MaterializedObject>>, schema: &'a Schema, resource: &'a str, row: &'a MaterializedObject) -> Self {
        Self { pool, schema, resource, row }
    }
}

impl<'a> FieldSource for PoolRowSource<'a> {
    fn field(&self, name: &str) -> Option<serde_json::Value> {
        self.row.get(name).cloned()
    }

    fn related(&self, relation: &str) -> Option<Box<dyn FieldSource + '_>> {
        let resource_schema = self.schema.resource(self.resource)?;
        let RelationDecl::One { field, target, .. } = resource_schema.relation(relation)? else {
            return None;
        };
        let fk = self.row.get(field)?.as_str()?;
        let target_row = self.pool.get(target)?.get(fk)?;
        Some(Box::new(PoolRowSource {
            pool: self.pool,
            schema: self.schema,
            resource: target,
            row: target_row,
        }))
    }
}

/// Materialize `row` (of `resource`) plus its `include` tree, recursively.
pub fn materialize(
    pool: &BTreeMap<String, BTreeMap<String, MaterializedObject>>,
    schema: &Schema,
    resource: &str,
    row: &MaterializedObject,
    include: &BTreeMap<String, Include>,
) -> anyhow::Result<ResolvedObject> {
    let resource_schema = schema.require_resource(resource)?;
    let mut includes = BTreeMap::new();

    for (relation_name, value) in include {
        let relation = resource_schema.relation(relation_name).ok_or_else(|| {
            anyhow::Error::new(errors::ErrorMetadata::planning(
                "UnknownRelation",
                format!("{resource:?} has no declared relation named {relation_name:?}."),
            ))
        })?;
        let (where_, sort, limit, nested_include) = match value {
            Include::Leaf => (None, None, None, BTreeMap::new()),
            Include::Nested(nested) => (nested.where_.clone(), nested.sort.clone(), nested.limit, nested.include.clone()),
        };

        let result = match relation {
            RelationDecl::One { field, target, .. } => {
                let resolved = row
                    .get(field)
                    .and_then(|v| v.as_str())
                    .and_then(|fk| pool.get(target).and_then(|rows| rows.get(fk)))
                    .map(|target_row| materialize(pool, schema, target, target_row, &nested_include))
                    .transpose()?
                    .map(Box::new);
                IncludeResult::One(resolved)
            }
            RelationDecl::Many { source, field } => {
                let mut candidates: Vec<&MaterializedObject> = pool
                    .get(source)
                    .map(|rows| {
                        rows.values()
                            .filter(|candidate| candidate.get(field).and_then(|v| v.as_str()) == Some(row.id.as_str()))
                            .collect()
                    })
                    .unwrap_or_default();
                if let Some(where_) = &where_ {
                    candidates.retain(|candidate| {
                        let source_view = PoolRowSource::new(pool, schema, source, candidate);
                        where_.matches(&source_view)
                    });
                }
                let owned: Vec<MaterializedObject> = candidates.into_iter().cloned().collect();
                let ordered = query::sort_and_limit(owned, sort.as_ref(), limit, |obj, field| obj.get(field).cloned());
                let mut resolved = Vec::with_capacity(ordered.len());
                for child_row in &ordered {
                    resolved.push(materialize(pool, schema, source, child_row, &nested_include)?);
                }
                IncludeResult::Many(resolved)
            }
        };
        includes.insert(relation_name.clone(), result);
    }

    Ok(ResolvedObject {
        resource: resource.to_string(),
        object: row.clone(),
        includes,
    })
}
