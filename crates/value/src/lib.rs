//! Resource schemas, materialised objects, and the per-field LWW merge
//! codec — the consistency core described in spec.md §3 and §4.1.

pub mod field;
pub mod merge;
pub mod object;
pub mod relation;
pub mod resource;
pub mod schema;

pub use field::{FieldKind, FieldSchema};
pub use merge::{merge_mutation, MergeResult, ReferenceChange};
pub use object::{FieldValue, MaterializedObject};
pub use relation::RelationDecl;
pub use resource::ResourceSchema;
pub use schema::{Schema, SchemaBuilder};
