use serde_json::Value as Json;

/// A single field's predicate. Equality-by-literal shorthand in the base
/// spec (`where: { name: "Ana" }`) desugars to `FieldPredicate::Eq`.
#[derive(Clone, Debug, PartialEq)]
pub enum FieldPredicate {
    Eq(Json),
    In(Vec<Json>),
    Gt(Json),
    Gte(Json),
    Lt(Json),
    Lte(Json),
}

impl FieldPredicate {
    pub fn matches(&self, value: Option<&Json>) -> bool {
        match self {
            FieldPredicate::Eq(expected) => value == Some(expected),
            FieldPredicate::In(options) => value.is_some_and(|v| options.iter().any(|o| o == v)),
            FieldPredicate::Gt(bound) => value.is_some_and(|v| crate::order::compare_json(v, bound).is_gt()),
            FieldPredicate::Gte(bound) => value.is_some_and(|v| crate::order::compare_json(v, bound).is_ge()),
            FieldPredicate::Lt(bound) => value.is_some_and(|v| crate::order::compare_json(v, bound).is_lt()),
            FieldPredicate::Lte(bound) => value.is_some_and(|v| crate::order::compare_json(v, bound).is_le()),
        }
    }
}

/// Something that can answer "what is the value of field `f` on this row?"
/// and "what row does relation `r` navigate to from this row?", so [`Where`]
/// can be evaluated generically over the client's in-memory pool or the
/// server's batched storage reads.
pub trait FieldSource {
    fn field(&self, name: &str) -> Option<Json>;
    /// Resolve a one-relation by name to the related row's own `FieldSource`.
    /// Returns `None` if the relation is unset (nullable one-relation with
    /// no target) or unresolvable. Many-relations are not navigable inside
    /// `where` (the base spec only ever descends through reference-joined,
    /// i.e. singular, relations).
    fn related(&self, relation: &str) -> Option<Box<dyn FieldSource + '_>>;
}

/// A recursive predicate tree (spec.md §4.5): `$and`, `$or`, `$not`, a
/// per-field comparison, or descent into a reference-joined resource.
#[derive(Clone, Debug, PartialEq)]
pub enum Where {
    And(Vec<Where>),
    Or(Vec<Where>),
    Not(Box<Where>),
    Field(String, FieldPredicate),
    /// Descend through a declared one-relation and evaluate the nested
    /// predicate against the related row; `false` if the relation has no
    /// target.
    Relation(String, Box<Where>),
}

impl Where {
    pub fn eq(field: impl Into<String>, value: Json) -> Self {
        Where::Field(field.into(), FieldPredicate::Eq(value))
    }

    pub fn matches(&self, source: &dyn FieldSource) -> bool {
        match self {
            Where::And(clauses) => clauses.iter().all(|c| c.matches(source)),
            Where::Or(clauses) => clauses.iter().any(|c| c.matches(source)),
            Where::Not(inner) => !inner.matches(source),
            Where::Field(name, predicate) => predicate.matches(source.field(name).as_ref()),
            Where::Relation(name, inner) => source.related(name).is_some_and(|related| inner.matches(related.as_ref())),
        }
    }

    /// If this predicate is (or reduces to, under an outer `$and`) a literal
    /// equality constraint on the primary key, return that literal. Used by
    /// the client store's fast path (spec.md §4.8 `get`): `where.id` being a
    /// literal means "fetch only that id through the graph" rather than
    /// scanning the whole pool.
    pub fn literal_id_filter(&self) -> Option<&str> {
        match self {
            Where::Field(name, FieldPredicate::Eq(Json::String(id))) if name == "id" => Some(id.as_str()),
            Where::And(clauses) => clauses.iter().find_map(Where::literal_id_filter),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    struct Row(BTreeMap<String, Json>);

    impl FieldSource for Row {
        fn field(&self, name: &str) -> Option<Json> {
            self.0.get(name).cloned()
        }

        fn related(&self, _relation: &str) -> Option<Box<dyn FieldSource + '_>> {
            None
        }
    }

    fn row(pairs: &[(&str, Json)]) -> Row {
        Row(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[test]
    fn literal_equality_shorthand_matches() {
        let where_ = Where::eq("name", serde_json::json!("Ana"));
        assert!(where_.matches(&row(&[("name", serde_json::json!("Ana"))])));
        assert!(!where_.matches(&row(&[("name", serde_json::json!("Bea"))])));
    }

    #[test]
    fn and_or_not_compose() {
        let where_ = Where::And(vec![
            Where::eq("active", serde_json::json!(true)),
            Where::Or(vec![
                Where::eq("role", serde_json::json!("admin")),
                Where::eq("role", serde_json::json!("owner")),
            ]),
        ]);
        assert!(where_.matches(&row(&[
            ("active", serde_json::json!(true)),
            ("role", serde_json::json!("owner")),
        ])));
        assert!(!where_.matches(&row(&[
            ("active", serde_json::json!(false)),
            ("role", serde_json::json!("owner")),
        ])));

        let not_admin = Where::Not(Box::new(Where::eq("role", serde_json::json!("admin"))));
        assert!(not_admin.matches(&row(&[("role", serde_json::json!("user"))])));
    }

    #[test]
    fn comparison_operators() {
        let gt = Where::Field("age".into(), FieldPredicate::Gt(serde_json::json!(10)));
        assert!(gt.matches(&row(&[("age", serde_json::json!(11))])));
        assert!(!gt.matches(&row(&[("age", serde_json::json!(10))])));

        let in_ = Where::Field(
            "status".into(),
            FieldPredicate::In(vec![serde_json::json!("open"), serde_json::json!("pending")]),
        );
        assert!(in_.matches(&row(&[("status", serde_json::json!("pending"))])));
        assert!(!in_.matches(&row(&[("status", serde_json::json!("closed"))])));
    }

    #[test]
    fn literal_id_filter_extracts_under_and() {
        let where_ = Where::And(vec![
            Where::eq("id", serde_json::json!("u1")),
            Where::eq("active", serde_json::json!(true)),
        ]);
        assert_eq!(where_.literal_id_filter(), Some("u1"));

        let no_id = Where::eq("name", serde_json::json!("Ana"));
        assert_eq!(no_id.literal_id_filter(), None);
    }
}
