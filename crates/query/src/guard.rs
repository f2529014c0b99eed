use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::plan::QueryStep;
use crate::where_clause::Where;

/// Request-scoped context a route guard evaluates against: the
/// authenticated identity, request headers, whatever the embedding server
/// chooses to thread through. Left as a loose bag of JSON rather than a
/// fixed struct so applications can shape it however their auth layer does.
pub type Ctx = BTreeMap<String, Json>;

/// A `preMutation`/`read`-style route guard (spec.md §4.6,
/// `incrementQueryStep`): given the step about to run and the request
/// context, either allow it unconditionally, narrow it with an additional
/// `Where`, or reject it outright.
pub trait RouteGuard: Send + Sync {
    /// Returns `Ok(None)` to allow the step unmodified, `Ok(Some(where_))`
    /// to AND an additional predicate into the step, or `Err` (tagged with
    /// [`errors::ErrorCode::Unauthorized`]) to fail the step and, per
    /// spec.md §4.6, the whole query.
    fn guard(&self, step: &QueryStep, ctx: &Ctx) -> anyhow::Result<Option<Where>>;
}

/// A guard that allows everything, for resources with no access control.
pub struct AllowAll;

impl RouteGuard for AllowAll {
    fn guard(&self, _step: &QueryStep, _ctx: &Ctx) -> anyhow::Result<Option<Where>> {
        Ok(None)
    }
}

fn and(existing: Option<Where>, extra: Where) -> Where {
    match existing {
        Some(Where::And(mut clauses)) => {
            clauses.push(extra);
            Where::And(clauses)
        }
        Some(existing) => Where::And(vec![existing, extra]),
        None => extra,
    }
}

/// Run `guard` over every step, rewriting each step's `where` with the
/// guard's narrowing predicate ANDed in. A step whose guard errors makes
/// the whole query fail (spec.md §4.6: "the step then fails"), since a
/// later step may already depend on an earlier one's rows being visible.
pub fn apply_route_guards(steps: Vec<QueryStep>, guard: &(dyn RouteGuard), ctx: &Ctx) -> anyhow::Result<Vec<QueryStep>> {
    steps
        .into_iter()
        .map(|mut step| {
            if let Some(extra) = guard.guard(&step, ctx)? {
                step.where_ = Some(and(step.where_.take(), extra));
            }
            Ok(step)
        })
        .collect()
}

/// Convenience wrapper for route guards supplied as a plain closure.
pub fn guard_fn<F>(f: F) -> Arc<dyn RouteGuard>
where
    F: Fn(&QueryStep, &Ctx) -> anyhow::Result<Option<Where>> + Send + Sync + 'static,
{
    struct FnGuard<F>(F);
    impl<F> RouteGuard for FnGuard<F>
    where
        F: Fn(&QueryStep, &Ctx) -> anyhow::Result<Option<Where>> + Send + Sync + 'static,
    {
        fn guard(&self, step: &QueryStep, ctx: &Ctx) -> anyhow::Result<Option<Where>> {
            (self.0)(step, ctx)
        }
    }
    Arc::new(FnGuard(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::where_clause::FieldPredicate;

    fn step(resource: &str, path: &[&str]) -> QueryStep {
        QueryStep {
            resource: resource.to_string(),
            where_: None,
            limit: None,
            sort: None,
            step_path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn allow_all_leaves_step_unmodified() {
        let steps = vec![step("posts", &[])];
        let out = apply_route_guards(steps, &AllowAll, &Ctx::new()).unwrap();
        assert_eq!(out[0].where_, None);
    }

    #[test]
    fn guard_predicate_is_anded_into_existing_where() {
        let mut s = step("posts", &[]);
        s.where_ = Some(Where::eq("published", serde_json::json!(true)));
        let guard = guard_fn(|_step, _ctx| Ok(Some(Where::eq("org_id", serde_json::json!("org1")))));
        let out = apply_route_guards(vec![s], guard.as_ref(), &Ctx::new()).unwrap();
        match &out[0].where_ {
            Some(Where::And(clauses)) => assert_eq!(clauses.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }

    #[test]
    fn erroring_guard_fails_the_whole_query() {
        let steps = vec![step("posts", &[]), step("comments", &["posts"])];
        let guard = guard_fn(|step, _ctx| {
            if step.resource == "comments" {
                anyhow::bail!(errors::ErrorMetadata::unauthorized("NoComments", "not allowed"));
            }
            Ok(None)
        });
        assert!(apply_route_guards(steps, guard.as_ref(), &Ctx::new()).is_err());
    }

    #[test]
    fn field_predicate_eq_round_trips_through_guard() {
        let where_ = Where::Field("x".into(), FieldPredicate::Eq(serde_json::json!(1)));
        assert!(matches!(where_, Where::Field(_, FieldPredicate::Eq(_))));
    }
}
