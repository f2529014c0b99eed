//! Query DSL: the predicate AST ([`where_clause`]), comparator/sort rules
//! ([`order`]), include-tree planning ([`plan`]), and route-guard
//! composition ([`guard`]) shared by the client's in-memory evaluator and
//! the server's storage-backed query engine.

pub mod guard;
pub mod order;
pub mod plan;
pub mod where_clause;

pub use guard::{apply_route_guards, guard_fn, AllowAll, Ctx, RouteGuard};
pub use order::{compare_json, compare_optional, sort_and_limit, Direction, Sort};
pub use plan::{breakdown_query, Include, NestedQuery, QueryStep, RawQueryRequest, RelationTargets};
pub use where_clause::{FieldPredicate, FieldSource, Where};
