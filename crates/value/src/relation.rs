/// A declared navigation between two resources (spec.md §3).
///
/// For a foreign key `F.x → T.id` there are two `RelationDecl`s: a singular
/// [`RelationDecl::One`] on `F` and a plural [`RelationDecl::Many`] on `T`.
/// Each side is declared explicitly (rather than derived from the field
/// name) so the query DSL's `include` tree has a stable, intentional
/// vocabulary of relation names per resource — see DESIGN.md.
#[derive(Clone, Debug)]
pub enum RelationDecl {
    /// `one(target, field)`: navigate from this resource to `target` via the
    /// local reference field `field`. May be `optional` when `field` is
    /// nullable.
    One {
        target: String,
        field: String,
        optional: bool,
    },
    /// `many(source, field)`: the unordered set of rows in `source` whose
    /// `field` references this resource's row.
    Many { source: String, field: String },
}

impl RelationDecl {
    pub fn target_resource(&self) -> &str {
        match self {
            RelationDecl::One { target, .. } => target,
            RelationDecl::Many { source, .. } => source,
        }
    }

    pub fn is_plural(&self) -> bool {
        matches!(self, RelationDecl::Many { .. })
    }
}
