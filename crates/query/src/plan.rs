use std::collections::BTreeMap;

use errors::ErrorMetadata;

use crate::order::Sort;
use crate::where_clause::Where;

/// One key of an `include` tree: either a bare `true` (fetch the relation,
/// no further constraints) or a nested request (without `resource`, which
/// is inferred from the relation's declared target).
#[derive(Clone, Debug, PartialEq)]
pub enum Include {
    Leaf,
    Nested(Box<NestedQuery>),
}

/// The recursive part of a query request: everything `RawQueryRequest` has
/// except `resource`, since a nested include's resource is inferred.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NestedQuery {
    pub where_: Option<Where>,
    pub include: BTreeMap<String, Include>,
    pub limit: Option<usize>,
    pub sort: Option<Sort>,
}

/// `RawQueryRequest` (spec.md §4.5): the root of a client/server query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawQueryRequest {
    pub resource: String,
    pub where_: Option<Where>,
    pub include: BTreeMap<String, Include>,
    pub limit: Option<usize>,
    pub sort: Option<Sort>,
}

impl RawQueryRequest {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            ..Default::default()
        }
    }

    /// A stable fingerprint of `(resource, where, include, sort, limit)`
    /// (spec.md glossary "Query fingerprint"): two requests that are
    /// `PartialEq` always produce the same fingerprint, and vice versa.
    /// Used by the client store to key live subscriptions so that two
    /// callbacks registered against an equal query are recomputed as one
    /// evaluation per mutation rather than one per callback (spec.md §8
    /// "Subscription deduplication").
    pub fn fingerprint(&self) -> String {
        format!("{self:?}")
    }
}

/// One step of a planned query: the sub-request to run, and the path of
/// relation names from the root that reaches it (`[]` for the root).
#[derive(Clone, Debug, PartialEq)]
pub struct QueryStep {
    pub resource: String,
    pub where_: Option<Where>,
    pub limit: Option<usize>,
    pub sort: Option<Sort>,
    pub step_path: Vec<String>,
}

/// A function from (parent resource, relation name) to the relation's
/// declared target resource, used to resolve a nested include's inferred
/// `resource` without the planner depending on the `value` crate's
/// `Schema` type directly.
pub trait RelationTargets {
    fn target_resource(&self, resource: &str, relation: &str) -> anyhow::Result<String>;
}

/// `breakdownQuery` (spec.md §4.5): flatten a `RawQueryRequest`'s include
/// tree into an ordered list of steps, root first, depth-first over
/// `include`.
pub fn breakdown_query(request: &RawQueryRequest, relations: &dyn RelationTargets) -> anyhow::Result<Vec<QueryStep>> {
    let mut steps = vec![QueryStep {
        resource: request.resource.clone(),
        where_: request.where_.clone(),
        limit: request.limit,
        sort: request.sort.clone(),
        step_path: Vec::new(),
    }];
    breakdown_include(&request.resource, &request.include, &mut Vec::new(), relations, &mut steps)?;
    Ok(steps)
}

fn breakdown_include(
    parent_resource: &str,
    include: &BTreeMap<String, Include>,
    step_path: &mut Vec<String>,
    relations: &dyn RelationTargets,
    out: &mut Vec<QueryStep>,
) -> anyhow::Result<()> {
    for (relation_name, value) in include {
        let target_resource = relations.target_resource(parent_resource, relation_name).map_err(|_| {
            anyhow::Error::new(ErrorMetadata::planning(
                "UnknownRelation",
                format!("{parent_resource:?} has no declared relation named {relation_name:?}."),
            ))
        })?;
        step_path.push(relation_name.clone());
        let (where_, limit, sort, nested_include) = match value {
            Include::Leaf => (None, None, None, BTreeMap::new()),
            Include::Nested(nested) => (
                nested.where_.clone(),
                nested.limit,
                nested.sort.clone(),
                nested.include.clone(),
            ),
        };
        out.push(QueryStep {
            resource: target_resource.clone(),
            where_,
            limit,
            sort,
            step_path: step_path.clone(),
        });
        breakdown_include(&target_resource, &nested_include, step_path, relations, out)?;
        step_path.pop();
    }
    Ok(())
}
